//! Symbolic terms and path-condition constraints.
//!
//! A term is either a concrete value lifted into the symbolic domain or
//! an expression over free symbols. The constructors fold eagerly: an
//! operation over two concrete operands never allocates an expression
//! node, so a term that contains no symbol is always a plain `Value` (or
//! heap reference). This is what lets the executor share one instruction
//! semantics between the concrete and symbolic value domains.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use bytecode::prelude::*;

use crate::heap::ObjRef;

/// Identifies a free symbolic variable within one exploration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// The sort of a symbol. Floating-point symbols are not supported; the
/// engine executes float arithmetic concretely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sort {
    Int,
    Long,
    Ref(RefType),
}

impl Sort {
    pub fn width(&self) -> SlotWidth {
        match self {
            Sort::Long => SlotWidth::Wide,
            _ => SlotWidth::Single,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Sort::Int | Sort::Long)
    }
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub sort: Sort,
    /// Set on an int symbol that denotes the length of a symbolic array.
    pub length_of: Option<SymbolId>,
}

/// The per-session symbol registry. Ids are dense and assigned in
/// creation order, which keeps repeated runs over the same input
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<SymbolInfo>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, name: impl Into<String>, sort: Sort) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(SymbolInfo { name: name.into(), sort, length_of: None });
        id
    }

    /// The int symbol standing for the length of the symbolic array
    /// `array`, created on first use.
    pub fn length_symbol(&mut self, array: SymbolId) -> SymbolId {
        if let Some(idx) = self
            .symbols
            .iter()
            .position(|s| s.length_of == Some(array))
        {
            return SymbolId(idx as u32);
        }
        let name = format!("{}.length", self.symbols[array.0 as usize].name);
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(SymbolInfo { name, sort: Sort::Int, length_of: Some(array) });
        id
    }

    pub fn info(&self, id: SymbolId) -> &SymbolInfo {
        &self.symbols[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &SymbolInfo)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }
}

/// Concrete bindings of symbols, as produced by a solver backend.
pub type Bindings = BTreeMap<SymbolId, Value>;

/// A symbolic expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// A concrete value lifted into the term domain.
    Value(Value),
    /// A concrete heap reference.
    Ref(ObjRef),
    Sym(SymbolId),
    Neg {
        ty: NumericType,
        term: Box<Term>,
    },
    Bin {
        op: ArithOp,
        ty: NumericType,
        lhs: Box<Term>,
        rhs: Box<Term>,
    },
    Ite {
        cond: Box<Constraint>,
        then_term: Box<Term>,
        else_term: Box<Term>,
    },
}

impl Term {
    pub const NULL: Term = Term::Value(Value::Null);

    pub fn int(v: i32) -> Term {
        Term::Value(Value::Int(v))
    }

    pub fn long(v: i64) -> Term {
        Term::Value(Value::Long(v))
    }

    /// Concrete terms fold to `Value`/`Ref` in the constructors, so a
    /// structural check is enough.
    pub fn is_concrete(&self) -> bool {
        matches!(self, Term::Value(_) | Term::Ref(_))
    }

    pub fn as_value(&self) -> Option<Value> {
        match self {
            Term::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Term::Value(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Builds `lhs op rhs`, folding when both operands are concrete.
    ///
    /// Integral division by a concrete zero must be handled by the
    /// caller before this is reached; the builder keeps the node
    /// symbolic in that case rather than inventing a value.
    pub fn bin(op: ArithOp, ty: NumericType, lhs: Term, rhs: Term) -> Term {
        if let (Some(a), Some(b)) = (lhs.as_value(), rhs.as_value()) {
            if let Some(v) = arith(op, ty, a, b) {
                return Term::Value(v);
            }
        }
        Term::Bin { op, ty, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn neg(ty: NumericType, term: Term) -> Term {
        if let Some(v) = term.as_value() {
            if let Some(v) = negate_value(ty, v) {
                return Term::Value(v);
            }
        }
        Term::Neg { ty, term: Box::new(term) }
    }

    /// Builds an if-then-else term, folding on a concretely decidable
    /// condition.
    pub fn ite(cond: Constraint, then_term: Term, else_term: Term) -> Term {
        match cond.eval(&Bindings::new()) {
            Some(true) => then_term,
            Some(false) => else_term,
            None => Term::Ite {
                cond: Box::new(cond),
                then_term: Box::new(then_term),
                else_term: Box::new(else_term),
            },
        }
    }

    /// Evaluates under `bindings`. `None` when a symbol is unbound, a
    /// reference term is reached, or an arithmetic fault occurs.
    pub fn eval(&self, bindings: &Bindings) -> Option<Value> {
        match self {
            Term::Value(v) => Some(*v),
            Term::Ref(_) => None,
            Term::Sym(s) => bindings.get(s).copied(),
            Term::Neg { ty, term } => negate_value(*ty, term.eval(bindings)?),
            Term::Bin { op, ty, lhs, rhs } => {
                arith(*op, *ty, lhs.eval(bindings)?, rhs.eval(bindings)?)
            }
            Term::Ite { cond, then_term, else_term } => {
                if cond.eval(bindings)? {
                    then_term.eval(bindings)
                } else {
                    else_term.eval(bindings)
                }
            }
        }
    }

    /// Collects every symbol mentioned by the term.
    pub fn symbols_into(&self, out: &mut BTreeSet<SymbolId>) {
        match self {
            Term::Value(_) | Term::Ref(_) => {}
            Term::Sym(s) => {
                out.insert(*s);
            }
            Term::Neg { term, .. } => term.symbols_into(out),
            Term::Bin { lhs, rhs, .. } => {
                lhs.symbols_into(out);
                rhs.symbols_into(out);
            }
            Term::Ite { cond, then_term, else_term } => {
                cond.symbols_into(out);
                then_term.symbols_into(out);
                else_term.symbols_into(out);
            }
        }
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Value(v) => write!(f, "{v}"),
            Term::Ref(r) => write!(f, "@{}", r.0),
            Term::Sym(s) => write!(f, "{s}"),
            Term::Neg { term, .. } => write!(f, "-({term})"),
            Term::Bin { op, lhs, rhs, .. } => write!(f, "({lhs} {op} {rhs})"),
            Term::Ite { cond, then_term, else_term } => {
                write!(f, "ite({cond}, {then_term}, {else_term})")
            }
        }
    }
}

/// A path-condition constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    True,
    Cmp {
        cond: CmpCond,
        ty: NumericType,
        lhs: Term,
        rhs: Term,
    },
    IsNull(Term),
    NonNull(Term),
    Not(Box<Constraint>),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
}

impl Constraint {
    pub fn cmp(cond: CmpCond, ty: NumericType, lhs: Term, rhs: Term) -> Constraint {
        Constraint::Cmp { cond, ty, lhs, rhs }
    }

    /// Negation, pushed into comparisons so guards stay flat.
    pub fn negate(self) -> Constraint {
        match self {
            Constraint::Cmp { cond, ty, lhs, rhs } => {
                Constraint::Cmp { cond: cond.negate(), ty, lhs, rhs }
            }
            Constraint::IsNull(t) => Constraint::NonNull(t),
            Constraint::NonNull(t) => Constraint::IsNull(t),
            Constraint::Not(inner) => *inner,
            other => Constraint::Not(Box::new(other)),
        }
    }

    /// Evaluates under `bindings`; `None` when undecidable from the
    /// bindings alone (unbound symbol, reference-sort atom over a free
    /// symbol).
    pub fn eval(&self, bindings: &Bindings) -> Option<bool> {
        match self {
            Constraint::True => Some(true),
            Constraint::Cmp { cond, ty, lhs, rhs } => {
                let ord = compare(*ty, lhs.eval(bindings)?, rhs.eval(bindings)?)?;
                Some(cond.holds(ord))
            }
            Constraint::IsNull(t) => match t {
                Term::Value(Value::Null) => Some(true),
                Term::Ref(_) => Some(false),
                _ => None,
            },
            Constraint::NonNull(t) => Constraint::IsNull(t.clone()).eval(bindings).map(|b| !b),
            Constraint::Not(inner) => inner.eval(bindings).map(|b| !b),
            Constraint::And(cs) => {
                let mut all = true;
                for c in cs {
                    match c.eval(bindings) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => all = false,
                    }
                }
                if all {
                    Some(true)
                } else {
                    None
                }
            }
            Constraint::Or(cs) => {
                let mut any_unknown = false;
                for c in cs {
                    match c.eval(bindings) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => any_unknown = true,
                    }
                }
                if any_unknown {
                    None
                } else {
                    Some(false)
                }
            }
        }
    }

    pub fn symbols_into(&self, out: &mut BTreeSet<SymbolId>) {
        match self {
            Constraint::True => {}
            Constraint::Cmp { lhs, rhs, .. } => {
                lhs.symbols_into(out);
                rhs.symbols_into(out);
            }
            Constraint::IsNull(t) | Constraint::NonNull(t) => t.symbols_into(out),
            Constraint::Not(inner) => inner.symbols_into(out),
            Constraint::And(cs) | Constraint::Or(cs) => {
                for c in cs {
                    c.symbols_into(out);
                }
            }
        }
    }
}

impl Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::True => write!(f, "true"),
            Constraint::Cmp { cond, lhs, rhs, .. } => write!(f, "{lhs} {cond} {rhs}"),
            Constraint::IsNull(t) => write!(f, "{t} == null"),
            Constraint::NonNull(t) => write!(f, "{t} != null"),
            Constraint::Not(inner) => write!(f, "!({inner})"),
            Constraint::And(cs) => {
                let parts: Vec<String> = cs.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(" && "))
            }
            Constraint::Or(cs) => {
                let parts: Vec<String> = cs.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(" || "))
            }
        }
    }
}

/// Wrapping two's-complement arithmetic matching the interpreted
/// bytecode: shifts mask their count, division truncates toward zero.
/// `None` on integral division by zero or an operand of the wrong kind.
pub fn arith(op: ArithOp, ty: NumericType, a: Value, b: Value) -> Option<Value> {
    match ty {
        NumericType::Int => {
            let (a, b) = match (a, b) {
                (Value::Int(a), Value::Int(b)) => (a, b),
                _ => return None,
            };
            let r = match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div => {
                    if b == 0 {
                        return None;
                    }
                    a.wrapping_div(b)
                }
                ArithOp::Rem => {
                    if b == 0 {
                        return None;
                    }
                    a.wrapping_rem(b)
                }
                ArithOp::And => a & b,
                ArithOp::Or => a | b,
                ArithOp::Xor => a ^ b,
                ArithOp::Shl => a.wrapping_shl(b as u32 & 0x1f),
                ArithOp::Shr => a.wrapping_shr(b as u32 & 0x1f),
            };
            Some(Value::Int(r))
        }
        NumericType::Long => {
            let (a, b) = match (a, b) {
                (Value::Long(a), Value::Long(b)) => (a, b),
                _ => return None,
            };
            let r = match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div => {
                    if b == 0 {
                        return None;
                    }
                    a.wrapping_div(b)
                }
                ArithOp::Rem => {
                    if b == 0 {
                        return None;
                    }
                    a.wrapping_rem(b)
                }
                ArithOp::And => a & b,
                ArithOp::Or => a | b,
                ArithOp::Xor => a ^ b,
                ArithOp::Shl => a.wrapping_shl(b as u32 & 0x3f),
                ArithOp::Shr => a.wrapping_shr(b as u32 & 0x3f),
            };
            Some(Value::Long(r))
        }
        NumericType::Float => {
            let (a, b) = match (a, b) {
                (Value::Float(a), Value::Float(b)) => (a, b),
                _ => return None,
            };
            let r = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Rem => a % b,
                _ => return None,
            };
            Some(Value::Float(r))
        }
        NumericType::Double => {
            let (a, b) = match (a, b) {
                (Value::Double(a), Value::Double(b)) => (a, b),
                _ => return None,
            };
            let r = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Rem => a % b,
                _ => return None,
            };
            Some(Value::Double(r))
        }
    }
}

fn negate_value(ty: NumericType, v: Value) -> Option<Value> {
    match (ty, v) {
        (NumericType::Int, Value::Int(v)) => Some(Value::Int(v.wrapping_neg())),
        (NumericType::Long, Value::Long(v)) => Some(Value::Long(v.wrapping_neg())),
        (NumericType::Float, Value::Float(v)) => Some(Value::Float(-v)),
        (NumericType::Double, Value::Double(v)) => Some(Value::Double(-v)),
        _ => None,
    }
}

/// Orders two values of the given numeric type. `None` for mismatched
/// kinds or an unordered float comparison (NaN).
pub fn compare(ty: NumericType, a: Value, b: Value) -> Option<Ordering> {
    match (ty, a, b) {
        (NumericType::Int, Value::Int(a), Value::Int(b)) => Some(a.cmp(&b)),
        (NumericType::Long, Value::Long(a), Value::Long(b)) => Some(a.cmp(&b)),
        (NumericType::Float, Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
        (NumericType::Double, Value::Double(a), Value::Double(b)) => a.partial_cmp(&b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_operands_fold() {
        let t = Term::bin(ArithOp::Add, NumericType::Int, Term::int(40), Term::int(2));
        assert_eq!(t, Term::int(42));
        let t = Term::bin(ArithOp::Mul, NumericType::Long, Term::long(-3), Term::long(4));
        assert_eq!(t, Term::long(-12));
    }

    #[test]
    fn symbolic_operands_build_nodes() {
        let t = Term::bin(ArithOp::Add, NumericType::Int, Term::Sym(SymbolId(0)), Term::int(1));
        assert!(!t.is_concrete());
        let mut bound = Bindings::new();
        bound.insert(SymbolId(0), Value::Int(9));
        assert_eq!(t.eval(&bound), Some(Value::Int(10)));
    }

    #[test]
    fn division_by_concrete_zero_does_not_fold() {
        let t = Term::bin(ArithOp::Div, NumericType::Int, Term::int(1), Term::int(0));
        assert!(!t.is_concrete());
        assert_eq!(t.eval(&Bindings::new()), None);
    }

    #[test]
    fn shift_counts_are_masked() {
        assert_eq!(
            arith(ArithOp::Shl, NumericType::Int, Value::Int(1), Value::Int(33)),
            Some(Value::Int(2))
        );
    }

    #[test]
    fn negating_a_comparison_flips_the_condition() {
        let c = Constraint::cmp(CmpCond::Gt, NumericType::Int, Term::Sym(SymbolId(0)), Term::int(0));
        let n = c.negate();
        assert!(matches!(n, Constraint::Cmp { cond: CmpCond::Le, .. }));
    }

    #[test]
    fn ite_folds_on_decided_condition() {
        let c = Constraint::cmp(CmpCond::Lt, NumericType::Int, Term::int(1), Term::int(2));
        assert_eq!(Term::ite(c, Term::int(7), Term::int(8)), Term::int(7));
    }

    #[test]
    fn constraint_eval_three_valued_and() {
        let known_false =
            Constraint::cmp(CmpCond::Lt, NumericType::Int, Term::int(2), Term::int(1));
        let unknown =
            Constraint::cmp(CmpCond::Lt, NumericType::Int, Term::Sym(SymbolId(0)), Term::int(1));
        let and = Constraint::And(vec![unknown.clone(), known_false]);
        assert_eq!(and.eval(&Bindings::new()), Some(false));
        let and = Constraint::And(vec![unknown, Constraint::True]);
        assert_eq!(and.eval(&Bindings::new()), None);
    }

    #[test]
    fn length_symbols_are_memoized() {
        let mut table = SymbolTable::new();
        let arr = table.fresh("a", Sort::Ref(RefType::Array(Box::new(Type::INT))));
        let l1 = table.length_symbol(arr);
        let l2 = table.length_symbol(arr);
        assert_eq!(l1, l2);
        assert_eq!(table.info(l1).name, "a.length");
    }
}
