//! The reference backing solver.
//!
//! Interval propagation over single-variable comparisons, with seeded
//! candidate sampling for whatever does not fit that shape. The solver
//! is deliberately conservative: it answers `Unsat` only on a proof
//! (contradictory null atoms, a concretely false comparison, an empty
//! interval) and reports [`SolverError::Undecided`] when sampling runs
//! out of candidates or time, so an incomplete search never masquerades
//! as an unsatisfiability proof.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::time::Instant;

use bytecode::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::term::{Bindings, Constraint, SymbolId, Term};

use super::{Result, Solver, SolverError, Verdict};

/// How many assignments sampling will evaluate before giving up.
const DEFAULT_MAX_SAMPLES: u64 = 8192;

/// Extra random candidates drawn per symbol.
const RANDOM_DRAWS: usize = 4;

#[derive(Debug)]
pub struct IntervalSolver {
    pub max_samples: u64,
}

impl Default for IntervalSolver {
    fn default() -> Self {
        Self { max_samples: DEFAULT_MAX_SAMPLES }
    }
}

impl Solver for IntervalSolver {
    fn name(&self) -> &'static str {
        "interval"
    }

    fn decide(&mut self, system: &[Constraint], deadline: Instant) -> Result<Verdict> {
        Ok(match self.analyze(system, deadline)? {
            Some(_) => Verdict::Sat,
            None => Verdict::Unsat,
        })
    }

    fn solve(&mut self, system: &[Constraint], deadline: Instant) -> Result<Option<Bindings>> {
        self.analyze(system, deadline)
    }
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    lo: i64,
    hi: i64,
    ty: NumericType,
}

impl Interval {
    fn for_ty(ty: NumericType) -> Interval {
        match ty {
            NumericType::Int => Interval { lo: i32::MIN as i64, hi: i32::MAX as i64, ty },
            _ => Interval { lo: i64::MIN, hi: i64::MAX, ty: NumericType::Long },
        }
    }

    fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    fn clamp(&self, v: i64) -> i64 {
        v.clamp(self.lo, self.hi)
    }

    /// The in-range value nearest zero: the canonical witness.
    fn witness(&self) -> i64 {
        self.clamp(0)
    }

    fn to_value(&self, v: i64) -> Value {
        match self.ty {
            NumericType::Int => Value::Int(v as i32),
            _ => Value::Long(v),
        }
    }
}

impl IntervalSolver {
    fn analyze(&self, system: &[Constraint], deadline: Instant) -> Result<Option<Bindings>> {
        let mut atoms = Vec::new();
        for constraint in system {
            flatten(constraint, &mut atoms);
        }

        // Reference atoms decide by consistency alone: the guards that
        // produce them are mutually exclusive per symbol.
        let mut nullness: HashMap<SymbolId, bool> = HashMap::new();
        let mut numeric: Vec<&Constraint> = Vec::new();
        for &atom in &atoms {
            match atom {
                Constraint::IsNull(Term::Sym(s)) => {
                    if nullness.insert(*s, true) == Some(false) {
                        return Ok(None);
                    }
                }
                Constraint::NonNull(Term::Sym(s)) => {
                    if nullness.insert(*s, false) == Some(true) {
                        return Ok(None);
                    }
                }
                Constraint::IsNull(t) | Constraint::NonNull(t) if t.is_concrete() => {
                    match atom.eval(&Bindings::new()) {
                        Some(true) => {}
                        Some(false) => return Ok(None),
                        None => return Err(SolverError::Undecided),
                    }
                }
                other => numeric.push(other),
            }
        }

        // Interval propagation over the single-variable comparisons.
        let mut intervals: BTreeMap<SymbolId, Interval> = BTreeMap::new();
        let mut residual: Vec<&Constraint> = Vec::new();
        for &atom in &numeric {
            match atom {
                Constraint::Cmp { cond, ty, lhs, rhs } => {
                    if let (Term::Sym(s), Some(c)) = (lhs, rhs.as_value()) {
                        narrow(&mut intervals, *s, *ty, *cond, c);
                        // A disequality only rules out one point; keep it
                        // around so the chosen witness is verified.
                        if *cond != CmpCond::Ne {
                            continue;
                        }
                    } else if let (Some(c), Term::Sym(s)) = (lhs.as_value(), rhs) {
                        // c cond s  <=>  s (mirror cond) c
                        narrow(&mut intervals, *s, *ty, mirror(*cond), c);
                        if *cond != CmpCond::Ne {
                            continue;
                        }
                    }
                    if lhs.is_concrete() && rhs.is_concrete() {
                        match atom.eval(&Bindings::new()) {
                            Some(true) => continue,
                            Some(false) => return Ok(None),
                            None => return Err(SolverError::Undecided),
                        }
                    }
                    residual.push(atom);
                }
                Constraint::True => {}
                other => residual.push(other),
            }
        }

        if intervals.values().any(|i| i.is_empty()) {
            return Ok(None);
        }

        // Every symbol in a residual atom needs a candidate set even if
        // no interval constrained it.
        let mut mentioned = std::collections::BTreeSet::new();
        for atom in &residual {
            atom.symbols_into(&mut mentioned);
        }
        for sym in &mentioned {
            intervals
                .entry(*sym)
                .or_insert_with(|| Interval::for_ty(numeric_sort_of(*sym, &residual)));
        }

        let witness: Bindings = intervals
            .iter()
            .map(|(s, iv)| (*s, iv.to_value(iv.witness())))
            .collect();
        if residual.is_empty() {
            return Ok(Some(witness));
        }
        if satisfies(&numeric, &witness) {
            return Ok(Some(witness));
        }

        self.sample(&numeric, &residual, &intervals, deadline)
    }

    /// Bounded deterministic search over a candidate grid.
    fn sample(
        &self,
        numeric: &[&Constraint],
        residual: &[&Constraint],
        intervals: &BTreeMap<SymbolId, Interval>,
        deadline: Instant,
    ) -> Result<Option<Bindings>> {
        let syms: Vec<SymbolId> = intervals.keys().copied().collect();
        if syms.is_empty() {
            // Residual atoms without symbols that still did not evaluate;
            // nothing to enumerate.
            return Err(SolverError::Undecided);
        }

        // Constants mentioned anywhere in the system, and their
        // neighbors, are the interesting boundary candidates.
        let mut constants: Vec<i64> = vec![0, 1, -1];
        for atom in residual {
            constants_into(atom, &mut constants);
        }

        let mut rng = StdRng::seed_from_u64(seed_of(residual));
        let candidates: Vec<Vec<i64>> = syms
            .iter()
            .map(|s| {
                let iv = &intervals[s];
                let mut cands: Vec<i64> = Vec::new();
                for c in &constants {
                    for v in [*c, c.saturating_sub(1), c.saturating_add(1)] {
                        if v >= iv.lo && v <= iv.hi {
                            cands.push(v);
                        }
                    }
                }
                cands.push(iv.lo);
                cands.push(iv.hi);
                cands.push(iv.witness());
                for _ in 0..RANDOM_DRAWS {
                    cands.push(rng.gen_range(iv.lo..=iv.hi));
                }
                // Nearest zero first, so the reported inputs stay small.
                cands.sort_unstable_by_key(|v| (v.unsigned_abs(), *v));
                cands.dedup();
                cands
            })
            .collect();

        let mut assignment: Vec<usize> = vec![0; syms.len()];
        let mut evaluated: u64 = 0;
        loop {
            if evaluated % 256 == 0 && Instant::now() >= deadline {
                trace!("sampling timed out after {evaluated} assignments");
                return Err(SolverError::Undecided);
            }
            if evaluated >= self.max_samples {
                trace!("sampling exhausted its budget of {} assignments", self.max_samples);
                return Err(SolverError::Undecided);
            }

            let bindings: Bindings = syms
                .iter()
                .enumerate()
                .map(|(i, s)| (*s, intervals[s].to_value(candidates[i][assignment[i]])))
                .collect();
            evaluated += 1;
            if satisfies(numeric, &bindings) {
                return Ok(Some(bindings));
            }

            // Odometer step over the candidate grid.
            let mut i = 0;
            loop {
                if i == syms.len() {
                    return Err(SolverError::Undecided);
                }
                assignment[i] += 1;
                if assignment[i] < candidates[i].len() {
                    break;
                }
                assignment[i] = 0;
                i += 1;
            }
        }
    }
}

fn satisfies(atoms: &[&Constraint], bindings: &Bindings) -> bool {
    atoms.iter().all(|a| a.eval(bindings) == Some(true))
}

fn flatten<'a>(constraint: &'a Constraint, out: &mut Vec<&'a Constraint>) {
    match constraint {
        Constraint::True => {}
        Constraint::And(cs) => {
            for c in cs {
                flatten(c, out);
            }
        }
        other => out.push(other),
    }
}

fn mirror(cond: CmpCond) -> CmpCond {
    match cond {
        CmpCond::Lt => CmpCond::Gt,
        CmpCond::Le => CmpCond::Ge,
        CmpCond::Gt => CmpCond::Lt,
        CmpCond::Ge => CmpCond::Le,
        eq => eq,
    }
}

fn narrow(
    intervals: &mut BTreeMap<SymbolId, Interval>,
    sym: SymbolId,
    ty: NumericType,
    cond: CmpCond,
    value: Value,
) {
    let c = match value {
        Value::Int(v) => v as i64,
        Value::Long(v) => v,
        _ => return,
    };
    let iv = intervals.entry(sym).or_insert_with(|| Interval::for_ty(ty));
    match cond {
        CmpCond::Eq => {
            iv.lo = iv.lo.max(c);
            iv.hi = iv.hi.min(c);
        }
        CmpCond::Lt => iv.hi = iv.hi.min(c.saturating_sub(1)),
        CmpCond::Le => iv.hi = iv.hi.min(c),
        CmpCond::Gt => iv.lo = iv.lo.max(c.saturating_add(1)),
        CmpCond::Ge => iv.lo = iv.lo.max(c),
        // Disequality only rules out one point; leave it to sampling if
        // it ever matters for satisfiability.
        CmpCond::Ne => {
            if iv.lo == iv.hi && iv.lo == c {
                // The single remaining point is excluded.
                iv.lo = iv.hi.saturating_add(1);
                iv.hi = iv.lo.saturating_sub(2);
            }
        }
    }
}

/// Finds the numeric type a symbol is compared at, defaulting to int.
fn numeric_sort_of(sym: SymbolId, atoms: &[&Constraint]) -> NumericType {
    fn in_term(t: &Term, sym: SymbolId) -> bool {
        let mut set = std::collections::BTreeSet::new();
        t.symbols_into(&mut set);
        set.contains(&sym)
    }
    for atom in atoms {
        if let Constraint::Cmp { ty, lhs, rhs, .. } = atom {
            if in_term(lhs, sym) || in_term(rhs, sym) {
                return *ty;
            }
        }
    }
    NumericType::Int
}

fn constants_into(constraint: &Constraint, out: &mut Vec<i64>) {
    fn from_term(t: &Term, out: &mut Vec<i64>) {
        match t {
            Term::Value(Value::Int(v)) => out.push(*v as i64),
            Term::Value(Value::Long(v)) => out.push(*v),
            Term::Neg { term, .. } => from_term(term, out),
            Term::Bin { lhs, rhs, .. } => {
                from_term(lhs, out);
                from_term(rhs, out);
            }
            Term::Ite { cond, then_term, else_term } => {
                constants_into(cond, out);
                from_term(then_term, out);
                from_term(else_term, out);
            }
            _ => {}
        }
    }
    match constraint {
        Constraint::Cmp { lhs, rhs, .. } => {
            from_term(lhs, out);
            from_term(rhs, out);
        }
        Constraint::IsNull(t) | Constraint::NonNull(t) => from_term(t, out),
        Constraint::Not(inner) => constants_into(inner, out),
        Constraint::And(cs) | Constraint::Or(cs) => {
            for c in cs {
                constants_into(c, out);
            }
        }
        Constraint::True => {}
    }
}

fn seed_of(residual: &[&Constraint]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for atom in residual {
        atom.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{Sort, SymbolTable};
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn x() -> SymbolId {
        let mut symbols = SymbolTable::new();
        symbols.fresh("x", Sort::Int)
    }

    fn cmp(cond: CmpCond, lhs: Term, rhs: Term) -> Constraint {
        Constraint::cmp(cond, NumericType::Int, lhs, rhs)
    }

    #[test]
    fn single_variable_intervals_decide() {
        let mut solver = IntervalSolver::default();
        let x = x();
        let system = vec![cmp(CmpCond::Gt, Term::Sym(x), Term::int(0))];
        let solved = solver.solve(&system, deadline()).unwrap().unwrap();
        assert_eq!(solved.get(&x), Some(&Value::Int(1)));

        let system = vec![
            cmp(CmpCond::Gt, Term::Sym(x), Term::int(0)),
            cmp(CmpCond::Le, Term::Sym(x), Term::int(0)),
        ];
        assert_eq!(solver.decide(&system, deadline()).unwrap(), Verdict::Unsat);
    }

    #[test]
    fn witness_is_nearest_zero() {
        let mut solver = IntervalSolver::default();
        let x = x();
        let system = vec![
            cmp(CmpCond::Ge, Term::Sym(x), Term::int(-100)),
            cmp(CmpCond::Le, Term::Sym(x), Term::int(100)),
        ];
        let solved = solver.solve(&system, deadline()).unwrap().unwrap();
        assert_eq!(solved.get(&x), Some(&Value::Int(0)));
    }

    #[test]
    fn mirrored_comparisons_narrow_too() {
        let mut solver = IntervalSolver::default();
        let x = x();
        // 5 < x, i.e. x > 5.
        let system = vec![cmp(CmpCond::Lt, Term::int(5), Term::Sym(x))];
        let solved = solver.solve(&system, deadline()).unwrap().unwrap();
        assert_eq!(solved.get(&x), Some(&Value::Int(6)));
    }

    #[test]
    fn contradictory_nullness_is_unsat() {
        let mut solver = IntervalSolver::default();
        let mut symbols = SymbolTable::new();
        let p = symbols.fresh("p", Sort::Ref(RefType::Class(ClassId(0))));
        let system = vec![
            Constraint::IsNull(Term::Sym(p)),
            Constraint::NonNull(Term::Sym(p)),
        ];
        assert_eq!(solver.decide(&system, deadline()).unwrap(), Verdict::Unsat);
    }

    #[test]
    fn residual_systems_fall_back_to_sampling() {
        let mut solver = IntervalSolver::default();
        let mut symbols = SymbolTable::new();
        let x = symbols.fresh("x", Sort::Int);
        let y = symbols.fresh("y", Sort::Int);
        // x + y == 10 with x > 7: needs the sampler.
        let sum = Term::bin(ArithOp::Add, NumericType::Int, Term::Sym(x), Term::Sym(y));
        let system = vec![
            cmp(CmpCond::Eq, sum, Term::int(10)),
            cmp(CmpCond::Gt, Term::Sym(x), Term::int(7)),
        ];
        let solved = solver.solve(&system, deadline()).unwrap().unwrap();
        let vx = match solved.get(&x) {
            Some(Value::Int(v)) => *v,
            other => panic!("unexpected binding {other:?}"),
        };
        let vy = match solved.get(&y) {
            Some(Value::Int(v)) => *v,
            other => panic!("unexpected binding {other:?}"),
        };
        assert!(vx > 7);
        assert_eq!(vx + vy, 10);
    }

    #[test]
    fn out_of_bounds_disjunction_is_satisfiable() {
        let mut solver = IntervalSolver::default();
        let x = x();
        let system = vec![Constraint::Or(vec![
            cmp(CmpCond::Lt, Term::Sym(x), Term::int(0)),
            cmp(CmpCond::Ge, Term::Sym(x), Term::int(3)),
        ])];
        let solved = solver.solve(&system, deadline()).unwrap().unwrap();
        let v = match solved.get(&x) {
            Some(Value::Int(v)) => *v,
            other => panic!("unexpected binding {other:?}"),
        };
        assert!(v < 0 || v >= 3);
    }

    #[test]
    fn exhausted_sampling_is_undecided_not_unsat() {
        let mut solver = IntervalSolver { max_samples: 1 };
        let mut symbols = SymbolTable::new();
        let x = symbols.fresh("x", Sort::Int);
        let y = symbols.fresh("y", Sort::Int);
        let product = Term::bin(ArithOp::Mul, NumericType::Int, Term::Sym(x), Term::Sym(y));
        let system = vec![cmp(CmpCond::Eq, product, Term::int(997 * 991))];
        assert!(matches!(
            solver.decide(&system, deadline()),
            Err(SolverError::Undecided)
        ));
    }

    #[test]
    fn equal_runs_produce_equal_answers() {
        let mut solver = IntervalSolver::default();
        let mut symbols = SymbolTable::new();
        let x = symbols.fresh("x", Sort::Int);
        let y = symbols.fresh("y", Sort::Int);
        let sum = Term::bin(ArithOp::Add, NumericType::Int, Term::Sym(x), Term::Sym(y));
        let system = vec![cmp(CmpCond::Eq, sum, Term::int(4))];
        let a = solver.solve(&system, deadline()).unwrap();
        let b = solver.solve(&system, deadline()).unwrap();
        assert_eq!(a, b);
    }
}
