//! Defines all instructions of the stack bytecode.
//!
//! Every instruction carries exactly one control-flow class, reported by
//! [`Instruction::control_flow`]. The class is derived structurally from
//! the variant, so the classes are mutually exclusive by construction;
//! `may_throw` composes orthogonally on top of it.

use crate::method::{ClassId, FieldRef, MethodId};
use crate::value::{NumericType, Type, Value};

/// A program counter: an index into a method's instruction stream.
pub type Pc = u32;

/// Comparison conditions used by conditional jumps and guard constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpCond {
    /// The condition describing the fall-through case.
    pub fn negate(self) -> CmpCond {
        match self {
            CmpCond::Eq => CmpCond::Ne,
            CmpCond::Ne => CmpCond::Eq,
            CmpCond::Lt => CmpCond::Ge,
            CmpCond::Ge => CmpCond::Lt,
            CmpCond::Gt => CmpCond::Le,
            CmpCond::Le => CmpCond::Gt,
        }
    }

    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpCond::Eq => ord == Equal,
            CmpCond::Ne => ord != Equal,
            CmpCond::Lt => ord == Less,
            CmpCond::Le => ord != Greater,
            CmpCond::Gt => ord == Greater,
            CmpCond::Ge => ord != Less,
        }
    }
}

impl std::fmt::Display for CmpCond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpCond::Eq => "==",
            CmpCond::Ne => "!=",
            CmpCond::Lt => "<",
            CmpCond::Le => "<=",
            CmpCond::Gt => ">",
            CmpCond::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

/// Arithmetic and bit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl std::fmt::Display for ArithOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
            ArithOp::And => "&",
            ArithOp::Or => "|",
            ArithOp::Xor => "^",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
        };
        write!(f, "{s}")
    }
}

/// The control-flow class of an instruction. Exactly one per instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Falls through to the next instruction.
    Straight,
    AlwaysJump,
    ConditionalJump,
    Switch,
    Invoke,
    Return,
}

/// Operand stack effect in slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEffect {
    Fixed { pops: u16, pushes: u16 },
    /// Depends on the callee signature (`Invoke`) or on the slot types
    /// currently on the stack (`Return`, untyped local moves).
    VariableCount,
}

/// Represents a single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Pushes an inline constant.
    Const(Value),

    /// Pushes a constant-pool entry.
    LoadConst(u16),

    /// Pushes the value held by a local variable. The slot width is
    /// taken from the slot contents at runtime.
    Load(u16),

    /// Pops a value into a local variable.
    Store(u16),

    /// Adds `delta` to an int local in place, without touching the
    /// operand stack.
    Inc { local: u16, delta: i32 },

    /// Duplicates the top (single-width) stack slot.
    Dup,

    /// Discards the top (single-width) stack slot.
    Discard,

    /// destination = operand1 op operand2 (or -operand for `Neg`).
    Arith { op: ArithOp, ty: NumericType },

    /// Arithmetic negation.
    Neg { ty: NumericType },

    /// Pops one int and jumps to `target` when `value cond 0` holds.
    If { cond: CmpCond, target: Pc },

    /// Pops two ints and jumps to `target` when `lhs cond rhs` holds.
    IfCmp { cond: CmpCond, target: Pc },

    /// Pops a reference and jumps when it is null, or when it is
    /// non-null if `negated` is set.
    IfNull { target: Pc, negated: bool },

    Goto(Pc),

    /// Dispatches on an int key. Keys must be strictly ascending; the
    /// default target is taken when no key matches.
    Switch { cases: Vec<(i32, Pc)>, default: Pc },

    /// Calls a method; arguments are popped right to left.
    Invoke(MethodId),

    /// Returns to the caller, with the top of stack as result unless
    /// `void`.
    Return { void: bool },

    /// Allocates an instance with default-initialized fields.
    New(ClassId),

    GetField(FieldRef),
    PutField(FieldRef),

    /// Pops a length and allocates an array of `elem` elements.
    NewArray(Type),

    /// Pops index and array reference, pushes the element.
    ArrayLoad,

    /// Pops value, index and array reference.
    ArrayStore,

    /// Pops an array reference, pushes its length as int.
    ArrayLength,

    /// Raises a cast failure unless the popped reference is null or an
    /// instance assignable to the class; pushes the reference back.
    CheckCast(ClassId),

    /// Pops a reference and raises it as an exception.
    Throw,
}

impl Instruction {
    /// The instruction's control-flow class.
    pub fn control_flow(&self) -> ControlFlow {
        match self {
            Instruction::Goto(_) => ControlFlow::AlwaysJump,
            Instruction::If { .. } | Instruction::IfCmp { .. } | Instruction::IfNull { .. } => {
                ControlFlow::ConditionalJump
            }
            Instruction::Switch { .. } => ControlFlow::Switch,
            Instruction::Invoke(_) => ControlFlow::Invoke,
            Instruction::Return { .. } => ControlFlow::Return,
            _ => ControlFlow::Straight,
        }
    }

    /// Whether the instruction can raise a runtime exception.
    pub fn may_throw(&self) -> bool {
        match self {
            // Integral division raises on a zero divisor.
            Instruction::Arith { op, ty } => {
                matches!(op, ArithOp::Div | ArithOp::Rem) && ty.is_integral()
            }
            Instruction::GetField(_)
            | Instruction::PutField(_)
            | Instruction::NewArray(_)
            | Instruction::ArrayLoad
            | Instruction::ArrayStore
            | Instruction::ArrayLength
            | Instruction::CheckCast(_)
            | Instruction::Throw => true,
            // A callee may raise; the call site is a throw site.
            Instruction::Invoke(_) => true,
            _ => false,
        }
    }

    /// Slots popped and pushed, where statically known.
    pub fn stack_effect(&self) -> StackEffect {
        let fixed = |pops, pushes| StackEffect::Fixed { pops, pushes };
        match self {
            Instruction::Const(v) => fixed(0, v.width().slots() as u16),
            Instruction::LoadConst(_) => StackEffect::VariableCount,
            Instruction::Load(_) | Instruction::Store(_) => StackEffect::VariableCount,
            Instruction::Inc { .. } => fixed(0, 0),
            Instruction::Dup => fixed(1, 2),
            Instruction::Discard => fixed(1, 0),
            Instruction::Arith { ty, .. } => {
                let w = ty.width().slots() as u16;
                fixed(2 * w, w)
            }
            Instruction::Neg { ty } => {
                let w = ty.width().slots() as u16;
                fixed(w, w)
            }
            Instruction::If { .. } => fixed(1, 0),
            Instruction::IfCmp { .. } => fixed(2, 0),
            Instruction::IfNull { .. } => fixed(1, 0),
            Instruction::Goto(_) => fixed(0, 0),
            Instruction::Switch { .. } => fixed(1, 0),
            Instruction::Invoke(_) | Instruction::Return { .. } => StackEffect::VariableCount,
            Instruction::New(_) => fixed(0, 1),
            Instruction::GetField(_) => StackEffect::VariableCount,
            Instruction::PutField(_) => StackEffect::VariableCount,
            Instruction::NewArray(_) => fixed(1, 1),
            Instruction::ArrayLoad => StackEffect::VariableCount,
            Instruction::ArrayStore => StackEffect::VariableCount,
            Instruction::ArrayLength => fixed(1, 1),
            Instruction::CheckCast(_) => fixed(1, 1),
            Instruction::Throw => fixed(1, 0),
        }
    }

    /// Whether execution can continue at `pc + 1` after this instruction.
    pub fn falls_through(&self) -> bool {
        match self.control_flow() {
            ControlFlow::AlwaysJump | ControlFlow::Switch | ControlFlow::Return => false,
            ControlFlow::Straight => !matches!(self, Instruction::Throw),
            ControlFlow::ConditionalJump | ControlFlow::Invoke => true,
        }
    }

    /// All explicit jump targets of this instruction.
    pub fn jump_targets(&self) -> Vec<Pc> {
        match self {
            Instruction::Goto(t)
            | Instruction::If { target: t, .. }
            | Instruction::IfCmp { target: t, .. }
            | Instruction::IfNull { target: t, .. } => vec![*t],
            Instruction::Switch { cases, default } => {
                let mut targets: Vec<Pc> = cases.iter().map(|(_, t)| *t).collect();
                targets.push(*default);
                targets
            }
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flow_classes_are_disjoint() {
        let samples = [
            (Instruction::Goto(0), ControlFlow::AlwaysJump),
            (
                Instruction::If { cond: CmpCond::Gt, target: 3 },
                ControlFlow::ConditionalJump,
            ),
            (
                Instruction::Switch { cases: vec![(1, 2)], default: 4 },
                ControlFlow::Switch,
            ),
            (Instruction::Invoke(MethodId(0)), ControlFlow::Invoke),
            (Instruction::Return { void: true }, ControlFlow::Return),
            (Instruction::Dup, ControlFlow::Straight),
            (Instruction::Throw, ControlFlow::Straight),
        ];
        for (instr, expected) in samples {
            assert_eq!(instr.control_flow(), expected, "{instr:?}");
        }
    }

    #[test]
    fn may_throw_is_orthogonal_to_control_flow() {
        // Same class, different throw behavior.
        assert!(Instruction::Throw.may_throw());
        assert!(!Instruction::Dup.may_throw());
        assert!(Instruction::Invoke(MethodId(0)).may_throw());
        assert!(!Instruction::Goto(0).may_throw());
        // Only integral division throws.
        assert!(Instruction::Arith { op: ArithOp::Div, ty: NumericType::Int }.may_throw());
        assert!(!Instruction::Arith { op: ArithOp::Div, ty: NumericType::Double }.may_throw());
        assert!(!Instruction::Arith { op: ArithOp::Add, ty: NumericType::Int }.may_throw());
    }

    #[test]
    fn wide_arithmetic_moves_four_slots() {
        let add = Instruction::Arith { op: ArithOp::Add, ty: NumericType::Long };
        assert_eq!(add.stack_effect(), StackEffect::Fixed { pops: 4, pushes: 2 });
    }

    #[test]
    fn negated_conditions_round_trip() {
        for cond in [CmpCond::Eq, CmpCond::Ne, CmpCond::Lt, CmpCond::Le, CmpCond::Gt, CmpCond::Ge]
        {
            assert_eq!(cond.negate().negate(), cond);
        }
    }
}
