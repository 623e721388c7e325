//! Holds all methods and classes handed over by the class loader.
//!
//! A project is assembled once (classes, then methods, then `seal`) and
//! is immutable during exploration; engine state never points back into
//! it with anything but ids.

use std::collections::HashMap;

use bytecode::method::ValidationError;
use bytecode::prelude::*;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, ProjectError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectError {
    #[error("invalid method: {0}")]
    Validation(#[from] ValidationError),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    #[error("method id {0} out of range")]
    BadMethodId(usize),

    #[error("class id {0} out of range")]
    BadClassId(usize),

    #[error("unknown superclass for class {class}")]
    UnknownSuperClass { class: String },

    #[error("{method} references missing method at pc {pc}")]
    BadMethodRef { method: String, pc: Pc },

    #[error("{method} references missing class at pc {pc}")]
    BadClassRef { method: String, pc: Pc },

    #[error("{method} references missing field at pc {pc}")]
    BadFieldRef { method: String, pc: Pc },

    #[error("{method} references missing constant at pc {pc}")]
    BadConstantRef { method: String, pc: Pc },

    #[error("invoke argument arity exceeds callee locals in {method} at pc {pc}")]
    BadInvokeArity { method: String, pc: Pc },
}

/// Classes every project carries for the runtime-raised exceptions.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinClasses {
    pub throwable: ClassId,
    pub null_pointer: ClassId,
    pub arithmetic: ClassId,
    pub index_out_of_bounds: ClassId,
    pub class_cast: ClassId,
    pub negative_array_size: ClassId,
}

#[derive(Debug)]
pub struct Project {
    methods: Vec<Method>,
    classes: Vec<ClassDef>,
    pool: ConstantPool,
    by_name: HashMap<String, MethodId>,
    pub builtin: BuiltinClasses,
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

impl Project {
    pub fn new() -> Self {
        let mut classes = Vec::new();
        let mut add = |name: &str, super_class: Option<ClassId>| {
            classes.push(ClassDef::new(name, super_class));
            ClassId(classes.len() - 1)
        };
        let throwable = add("Throwable", None);
        let builtin = BuiltinClasses {
            throwable,
            null_pointer: add("NullPointerException", Some(throwable)),
            arithmetic: add("ArithmeticException", Some(throwable)),
            index_out_of_bounds: add("IndexOutOfBoundsException", Some(throwable)),
            class_cast: add("ClassCastException", Some(throwable)),
            negative_array_size: add("NegativeArraySizeException", Some(throwable)),
        };
        Self {
            methods: Vec::new(),
            classes,
            pool: ConstantPool::new(),
            by_name: HashMap::new(),
            builtin,
        }
    }

    pub fn add_class(&mut self, class: ClassDef) -> Result<ClassId> {
        if let Some(sup) = class.super_class {
            if sup.0 >= self.classes.len() {
                return Err(ProjectError::UnknownSuperClass { class: class.name });
            }
        }
        self.classes.push(class);
        Ok(ClassId(self.classes.len() - 1))
    }

    /// Registers a method after running its registration-time checks.
    pub fn add_method(&mut self, method: Method) -> Result<MethodId> {
        method.validate()?;
        let id = MethodId(self.methods.len());
        debug!("registered method {:?} as {:?}", method.name, id);
        self.by_name.insert(method.name.clone(), id);
        self.methods.push(method);
        Ok(id)
    }

    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        self.pool.add(constant)
    }

    pub fn constant(&self, index: u16) -> Option<Constant> {
        self.pool.get(index)
    }

    /// Cross-reference validation over the whole project. Run once all
    /// classes and methods are registered; the engine refuses to start
    /// on an unsealed project.
    pub fn seal(&self) -> Result<()> {
        for method in &self.methods {
            let name = || method.name.clone();
            for (pc, instr) in method.code.iter().enumerate() {
                let pc = pc as Pc;
                match instr {
                    Instruction::Invoke(m) => {
                        let callee = self
                            .methods
                            .get(m.0)
                            .ok_or_else(|| ProjectError::BadMethodRef { method: name(), pc })?;
                        if callee.param_slots() > callee.max_locals as usize {
                            return Err(ProjectError::BadInvokeArity { method: name(), pc });
                        }
                    }
                    Instruction::New(c) | Instruction::CheckCast(c) => {
                        if c.0 >= self.classes.len() {
                            return Err(ProjectError::BadClassRef { method: name(), pc });
                        }
                    }
                    Instruction::GetField(f) | Instruction::PutField(f) => {
                        let class = self
                            .classes
                            .get(f.class.0)
                            .ok_or_else(|| ProjectError::BadClassRef { method: name(), pc })?;
                        if f.field as usize >= class.fields.len() {
                            return Err(ProjectError::BadFieldRef { method: name(), pc });
                        }
                    }
                    Instruction::LoadConst(i) => {
                        if self.pool.get(*i).is_none() {
                            return Err(ProjectError::BadConstantRef { method: name(), pc });
                        }
                    }
                    _ => {}
                }
            }
            for entry in &method.handlers {
                if let Some(c) = entry.catch_type {
                    if c.0 >= self.classes.len() {
                        return Err(ProjectError::BadClassRef { method: name(), pc: entry.handler_pc });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn method(&self, id: MethodId) -> Result<&Method> {
        self.methods.get(id.0).ok_or(ProjectError::BadMethodId(id.0))
    }

    pub fn method_by_name(&self, name: &str) -> Result<MethodId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ProjectError::UnknownMethod(name.to_owned()))
    }

    pub fn class(&self, id: ClassId) -> Result<&ClassDef> {
        self.classes.get(id.0).ok_or(ProjectError::BadClassId(id.0))
    }

    pub fn field_def(&self, field: FieldRef) -> Result<&FieldDef> {
        let class = self.class(field.class)?;
        class
            .fields
            .get(field.field as usize)
            .ok_or(ProjectError::BadClassId(field.class.0))
    }

    /// Whether `sub` is `sup` or one of its subclasses.
    pub fn is_assignable(&self, sub: ClassId, sup: ClassId) -> bool {
        let mut current = Some(sub);
        while let Some(c) = current {
            if c == sup {
                return true;
            }
            current = self.classes.get(c.0).and_then(|d| d.super_class);
        }
        false
    }
}
