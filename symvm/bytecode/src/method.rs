//! The method and class model handed to the engine by a class loader.

use thiserror::Error;

use crate::instruction::{Instruction, Pc};
use crate::value::{Type, Value};

/// Index of a method within a loaded project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub usize);

/// Index of a class within a loaded project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub usize);

/// Names a field by declaring class and field index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub class: ClassId,
    pub field: u16,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
}

/// A class: a name, an optional superclass and its declared fields.
///
/// The hierarchy is consulted for catch-type and cast assignability.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub fields: Vec<FieldDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>, super_class: Option<ClassId>) -> Self {
        Self { name: name.into(), super_class, fields: Vec::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.push(FieldDef { name: name.into(), ty });
        self
    }
}

/// One region of the exception table.
///
/// Covers pcs in `start_pc..end_pc`; `catch_type: None` matches every
/// thrown class (a catch-all / finally region).
#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub start_pc: Pc,
    pub end_pc: Pc,
    pub handler_pc: Pc,
    pub catch_type: Option<ClassId>,
}

/// A constant pool entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Constant {
    pub fn to_value(self) -> Value {
        match self {
            Constant::Int(v) => Value::Int(v),
            Constant::Long(v) => Value::Long(v),
            Constant::Float(v) => Value::Float(v),
            Constant::Double(v) => Value::Double(v),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, constant: Constant) -> u16 {
        self.entries.push(constant);
        (self.entries.len() - 1) as u16
    }

    pub fn get(&self, index: u16) -> Option<Constant> {
        self.entries.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type Result<T> = std::result::Result<T, ValidationError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("method {method} has no code")]
    EmptyCode { method: String },

    #[error("jump target {target} out of range in {method} at pc {pc}")]
    TargetOutOfRange { method: String, pc: Pc, target: Pc },

    #[error("switch keys not strictly ascending in {method} at pc {pc}")]
    UnorderedSwitchKeys { method: String, pc: Pc },

    #[error("local index {index} exceeds max_locals {max} in {method} at pc {pc}")]
    LocalOutOfRange { method: String, pc: Pc, index: u16, max: u16 },

    #[error("execution can fall off the end of {method}")]
    FallsOffEnd { method: String },

    #[error("return arity mismatches signature in {method} at pc {pc}")]
    ReturnMismatch { method: String, pc: Pc },

    #[error("malformed exception table entry {entry} in {method}")]
    BadHandlerRange { method: String, entry: usize },

    #[error("parameter slots exceed max_locals in {method}")]
    ParamsExceedLocals { method: String },
}

/// A method as produced by the class-loading collaborator.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Option<Type>,
    pub max_locals: u16,
    pub max_stack: u16,
    pub code: Vec<Instruction>,
    pub handlers: Vec<ExceptionEntry>,
}

impl Method {
    /// Number of local slots taken by the parameters.
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(|t| t.width().slots()).sum()
    }

    /// Registration-time validation.
    ///
    /// Checks everything that can be checked without the rest of the
    /// project: jump and handler targets in range, switch keys strictly
    /// ascending, local indices within `max_locals`, return arity
    /// matching the signature, and that execution cannot run off the end
    /// of the code array. Cross-references (method and class ids) are
    /// checked when the project is sealed.
    pub fn validate(&self) -> Result<()> {
        let name = || self.name.clone();
        if self.code.is_empty() {
            return Err(ValidationError::EmptyCode { method: name() });
        }
        if self.param_slots() > self.max_locals as usize {
            return Err(ValidationError::ParamsExceedLocals { method: name() });
        }

        let len = self.code.len() as Pc;
        for (pc, instr) in self.code.iter().enumerate() {
            let pc = pc as Pc;
            for target in instr.jump_targets() {
                if target >= len {
                    return Err(ValidationError::TargetOutOfRange { method: name(), pc, target });
                }
            }
            match instr {
                Instruction::Switch { cases, .. } => {
                    if cases.windows(2).any(|w| w[0].0 >= w[1].0) {
                        return Err(ValidationError::UnorderedSwitchKeys { method: name(), pc });
                    }
                }
                Instruction::Load(i) | Instruction::Store(i) | Instruction::Inc { local: i, .. } => {
                    if *i >= self.max_locals {
                        return Err(ValidationError::LocalOutOfRange {
                            method: name(),
                            pc,
                            index: *i,
                            max: self.max_locals,
                        });
                    }
                }
                Instruction::Return { void } => {
                    if *void != self.ret.is_none() {
                        return Err(ValidationError::ReturnMismatch { method: name(), pc });
                    }
                }
                _ => {}
            }
        }

        // The last instruction must not fall through into nothing.
        if self.code[self.code.len() - 1].falls_through() {
            return Err(ValidationError::FallsOffEnd { method: name() });
        }

        for (i, entry) in self.handlers.iter().enumerate() {
            let bad = entry.start_pc >= entry.end_pc
                || entry.end_pc > len
                || entry.handler_pc >= len;
            if bad {
                return Err(ValidationError::BadHandlerRange { method: name(), entry: i });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::CmpCond;

    fn method(code: Vec<Instruction>) -> Method {
        Method {
            name: "m".to_owned(),
            params: vec![],
            ret: Some(Type::INT),
            max_locals: 2,
            max_stack: 4,
            code,
            handlers: vec![],
        }
    }

    #[test]
    fn accepts_straightline_code() {
        let m = method(vec![
            Instruction::Const(Value::Int(1)),
            Instruction::Return { void: false },
        ]);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn rejects_target_out_of_range() {
        let m = method(vec![
            Instruction::Goto(7),
            Instruction::Return { void: false },
        ]);
        assert!(matches!(
            m.validate(),
            Err(ValidationError::TargetOutOfRange { target: 7, .. })
        ));
    }

    #[test]
    fn rejects_unordered_switch_keys() {
        let m = method(vec![
            Instruction::Const(Value::Int(0)),
            Instruction::Switch { cases: vec![(2, 0), (1, 0)], default: 0 },
            Instruction::Return { void: false },
        ]);
        assert!(matches!(
            m.validate(),
            Err(ValidationError::UnorderedSwitchKeys { pc: 1, .. })
        ));
    }

    #[test]
    fn rejects_falling_off_the_end() {
        let m = method(vec![
            Instruction::Const(Value::Int(0)),
            Instruction::If { cond: CmpCond::Eq, target: 0 },
        ]);
        assert!(matches!(m.validate(), Err(ValidationError::FallsOffEnd { .. })));
    }

    #[test]
    fn rejects_return_arity_mismatch() {
        let m = method(vec![Instruction::Return { void: true }]);
        assert!(matches!(m.validate(), Err(ValidationError::ReturnMismatch { .. })));
    }

    #[test]
    fn rejects_bad_handler_range() {
        let mut m = method(vec![
            Instruction::Const(Value::Int(1)),
            Instruction::Return { void: false },
        ]);
        m.handlers.push(ExceptionEntry { start_pc: 1, end_pc: 1, handler_pc: 0, catch_type: None });
        assert!(matches!(m.validate(), Err(ValidationError::BadHandlerRange { .. })));
    }
}
