//! Choice points: the nodes of the symbolic decision tree.
//!
//! A choice point is created when a decision instruction is reached with
//! a controlling value that is symbolic. It captures the trail mark and
//! the constraint level at creation, and enumerates its alternatives in
//! a fixed declared order: taken-branch before fall-through, switch keys
//! ascending with the default last, null before non-null, generated
//! array lengths ascending. The cursor only moves forward; an exhausted
//! node is discarded by the search, never reused.

use bytecode::prelude::*;

use crate::generator::LengthStrategy;
use crate::heap::ObjRef;
use crate::term::{Constraint, Sort, SymbolId, SymbolTable, Term};
use crate::trail::TrailMark;

/// What a decision instruction asks the search to decide.
#[derive(Debug, Clone)]
pub enum ChoiceRequest {
    /// A conditional jump whose condition is symbolic.
    Branch { constraint: Constraint, target: Pc },

    /// A switch on a symbolic key.
    Switch { key: Term, cases: Vec<(i32, Pc)>, default: Pc },

    /// A null-test jump on an unbound reference symbol.
    RefBranch { sym: SymbolId, target: Pc, negated: bool },

    /// A dereference of an unbound reference symbol. The faulting
    /// instruction is re-dispatched after the alternative binds the
    /// symbol.
    Deref { sym: SymbolId },

    /// Integral division with a symbolic divisor.
    DivZero { result: Term, width: SlotWidth, divisor: Term, ty: NumericType },

    /// An array access through a symbolic index.
    ArrayAccess { index: Term, length: u32, access: ArrayAccess },

    /// Array allocation with a symbolic length.
    NewArrayLength { length: Term, elem: Type },
}

#[derive(Debug, Clone)]
pub enum ArrayAccess {
    Load { result: Term, width: SlotWidth },
    Store { obj: ObjRef, index: Term, value: Term },
}

/// The runtime exception an alternative raises when selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseKind {
    NullPointer,
    Arithmetic,
    IndexOutOfBounds,
    NegativeArraySize,
}

/// How execution proceeds once an alternative is committed.
#[derive(Debug, Clone)]
pub enum BranchEffect {
    JumpTo(Pc),
    FallThrough,
    /// Push a result and fall through (division, symbolic array load).
    PushAndAdvance { term: Term, width: SlotWidth },
    /// Log a symbolic-index write and fall through.
    StoreSymbolicAndAdvance { obj: ObjRef, index: Term, value: Term },
    Raise(RaiseKind),
    /// Bind the symbol to null and re-dispatch the faulting instruction.
    BindNull { sym: SymbolId },
    /// Materialize an instance, bind the symbol, re-dispatch.
    BindMaterialized { sym: SymbolId },
    /// Materialize an array of the given length, bind, re-dispatch.
    BindMaterializedArray { sym: SymbolId, len: u32 },
    /// Allocate an array of the given length, push it, fall through.
    AllocArrayAndAdvance { elem: Type, len: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceKind {
    Branch,
    Switch,
    NullCheck,
    DivZero,
    Bounds,
    ArrayLength,
}

#[derive(Debug, Clone)]
pub struct Alternative {
    pub guard: Constraint,
    pub effect: BranchEffect,
    pub label: String,
}

#[derive(Debug)]
pub struct ChoicePoint {
    pub kind: ChoiceKind,
    /// Frame-stack depth at creation; backtracking must land here.
    pub frame_depth: usize,
    /// The pc of the decision instruction.
    pub pc: Pc,
    pub trail_mark: TrailMark,
    /// Constraint-stack depth captured from the solver at creation.
    pub constraint_level: usize,
    alternatives: Vec<Alternative>,
    step: usize,
}

impl ChoicePoint {
    /// The next untried alternative, advancing the cursor.
    pub fn advance(&mut self) -> Option<Alternative> {
        let alt = self.alternatives.get(self.step).cloned();
        if alt.is_some() {
            self.step += 1;
        }
        alt
    }

    pub fn exhausted(&self) -> bool {
        self.step >= self.alternatives.len()
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn alternative_count(&self) -> usize {
        self.alternatives.len()
    }
}

fn zero_of(ty: NumericType) -> Term {
    match ty {
        NumericType::Long => Term::long(0),
        _ => Term::int(0),
    }
}

/// Builds the choice point for a request, with alternatives in their
/// declared exploration order.
#[allow(clippy::too_many_arguments)]
pub fn build_choice_point(
    request: ChoiceRequest,
    frame_depth: usize,
    pc: Pc,
    trail_mark: TrailMark,
    constraint_level: usize,
    symbols: &mut SymbolTable,
    lengths: &dyn LengthStrategy,
    max_array_len: u32,
) -> ChoicePoint {
    let (kind, alternatives) = match request {
        ChoiceRequest::Branch { constraint, target } => {
            let alts = vec![
                Alternative {
                    guard: constraint.clone(),
                    effect: BranchEffect::JumpTo(target),
                    label: "taken".to_owned(),
                },
                Alternative {
                    guard: constraint.negate(),
                    effect: BranchEffect::FallThrough,
                    label: "fall-through".to_owned(),
                },
            ];
            (ChoiceKind::Branch, alts)
        }

        ChoiceRequest::Switch { key, cases, default } => {
            let mut alts: Vec<Alternative> = cases
                .iter()
                .map(|(k, target)| Alternative {
                    guard: Constraint::cmp(
                        CmpCond::Eq,
                        NumericType::Int,
                        key.clone(),
                        Term::int(*k),
                    ),
                    effect: BranchEffect::JumpTo(*target),
                    label: format!("case {k}"),
                })
                .collect();
            let none_match = cases
                .iter()
                .map(|(k, _)| {
                    Constraint::cmp(CmpCond::Ne, NumericType::Int, key.clone(), Term::int(*k))
                })
                .collect();
            alts.push(Alternative {
                guard: Constraint::And(none_match),
                effect: BranchEffect::JumpTo(default),
                label: "default".to_owned(),
            });
            (ChoiceKind::Switch, alts)
        }

        ChoiceRequest::RefBranch { sym, target, negated } => {
            let (taken, other) = if negated {
                (Constraint::NonNull(Term::Sym(sym)), Constraint::IsNull(Term::Sym(sym)))
            } else {
                (Constraint::IsNull(Term::Sym(sym)), Constraint::NonNull(Term::Sym(sym)))
            };
            let alts = vec![
                Alternative {
                    guard: taken,
                    effect: BranchEffect::JumpTo(target),
                    label: "taken".to_owned(),
                },
                Alternative {
                    guard: other,
                    effect: BranchEffect::FallThrough,
                    label: "fall-through".to_owned(),
                },
            ];
            (ChoiceKind::Branch, alts)
        }

        ChoiceRequest::Deref { sym } => {
            let mut alts = vec![Alternative {
                guard: Constraint::IsNull(Term::Sym(sym)),
                effect: BranchEffect::BindNull { sym },
                label: "null".to_owned(),
            }];
            match symbols.info(sym).sort.clone() {
                Sort::Ref(RefType::Array(elem)) => {
                    let length_sym = symbols.length_symbol(sym);
                    for len in lengths.lengths(&elem, max_array_len) {
                        alts.push(Alternative {
                            guard: Constraint::And(vec![
                                Constraint::NonNull(Term::Sym(sym)),
                                Constraint::cmp(
                                    CmpCond::Eq,
                                    NumericType::Int,
                                    Term::Sym(length_sym),
                                    Term::int(len as i32),
                                ),
                            ]),
                            effect: BranchEffect::BindMaterializedArray { sym, len },
                            label: format!("non-null, length {len}"),
                        });
                    }
                }
                _ => {
                    alts.push(Alternative {
                        guard: Constraint::NonNull(Term::Sym(sym)),
                        effect: BranchEffect::BindMaterialized { sym },
                        label: "non-null".to_owned(),
                    });
                }
            }
            (ChoiceKind::NullCheck, alts)
        }

        ChoiceRequest::DivZero { result, width, divisor, ty } => {
            let alts = vec![
                Alternative {
                    guard: Constraint::cmp(CmpCond::Ne, ty, divisor.clone(), zero_of(ty)),
                    effect: BranchEffect::PushAndAdvance { term: result, width },
                    label: "non-zero divisor".to_owned(),
                },
                Alternative {
                    guard: Constraint::cmp(CmpCond::Eq, ty, divisor, zero_of(ty)),
                    effect: BranchEffect::Raise(RaiseKind::Arithmetic),
                    label: "zero divisor".to_owned(),
                },
            ];
            (ChoiceKind::DivZero, alts)
        }

        ChoiceRequest::ArrayAccess { index, length, access } => {
            let in_bounds = Constraint::And(vec![
                Constraint::cmp(CmpCond::Ge, NumericType::Int, index.clone(), Term::int(0)),
                Constraint::cmp(
                    CmpCond::Lt,
                    NumericType::Int,
                    index.clone(),
                    Term::int(length as i32),
                ),
            ]);
            let out_of_bounds = Constraint::Or(vec![
                Constraint::cmp(CmpCond::Lt, NumericType::Int, index.clone(), Term::int(0)),
                Constraint::cmp(
                    CmpCond::Ge,
                    NumericType::Int,
                    index,
                    Term::int(length as i32),
                ),
            ]);
            let in_effect = match access {
                ArrayAccess::Load { result, width } => {
                    BranchEffect::PushAndAdvance { term: result, width }
                }
                ArrayAccess::Store { obj, index, value } => {
                    BranchEffect::StoreSymbolicAndAdvance { obj, index, value }
                }
            };
            let alts = vec![
                Alternative {
                    guard: in_bounds,
                    effect: in_effect,
                    label: "in bounds".to_owned(),
                },
                Alternative {
                    guard: out_of_bounds,
                    effect: BranchEffect::Raise(RaiseKind::IndexOutOfBounds),
                    label: "out of bounds".to_owned(),
                },
            ];
            (ChoiceKind::Bounds, alts)
        }

        ChoiceRequest::NewArrayLength { length, elem } => {
            let mut alts: Vec<Alternative> = lengths
                .lengths(&elem, max_array_len)
                .into_iter()
                .map(|len| Alternative {
                    guard: Constraint::cmp(
                        CmpCond::Eq,
                        NumericType::Int,
                        length.clone(),
                        Term::int(len as i32),
                    ),
                    effect: BranchEffect::AllocArrayAndAdvance { elem: elem.clone(), len },
                    label: format!("length {len}"),
                })
                .collect();
            alts.push(Alternative {
                guard: Constraint::cmp(CmpCond::Lt, NumericType::Int, length, Term::int(0)),
                effect: BranchEffect::Raise(RaiseKind::NegativeArraySize),
                label: "negative length".to_owned(),
            });
            (ChoiceKind::ArrayLength, alts)
        }
    };

    ChoicePoint {
        kind,
        frame_depth,
        pc,
        trail_mark,
        constraint_level,
        alternatives,
        step: 0,
    }
}
