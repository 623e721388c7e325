//! Defines the bytecode consumed by the `symvm` interpreter.
//!
//! A method arrives here already decoded by a class-loading front end:
//! an ordered instruction stream with program counters, a constant pool,
//! an exception table and slot limits. This crate carries no execution
//! semantics, only the instruction set and the method/class model.

pub mod instruction;
pub mod method;
pub mod value;

pub mod prelude {
    pub use crate::instruction::{ArithOp, CmpCond, ControlFlow, Instruction, Pc, StackEffect};
    pub use crate::method::{
        ClassDef, ClassId, Constant, ConstantPool, ExceptionEntry, FieldDef, FieldRef, Method,
        MethodId,
    };
    pub use crate::value::{NumericType, RefType, SlotWidth, Type, Value};
}
