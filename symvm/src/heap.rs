//! The arena heap.
//!
//! Objects and arrays live in one append-only arena and are addressed by
//! index, so no live references are ever shared across paths and undoing
//! an allocation is a truncation. Arrays keep two index maps: the
//! concrete backing store, and an ordered log of writes through symbolic
//! indices; reads consult both.

use bytecode::prelude::*;
use thiserror::Error;

use crate::term::{Constraint, Term};

pub type Result<T> = std::result::Result<T, HeapError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("dangling heap reference @{0}")]
    Dangling(usize),

    #[error("@{0} is not an object")]
    NotAnObject(usize),

    #[error("@{0} is not an array")]
    NotAnArray(usize),

    #[error("field {field} out of range on @{obj}")]
    FieldOutOfRange { obj: usize, field: usize },

    #[error("element {index} out of range on @{obj}")]
    ElementOutOfRange { obj: usize, index: usize },
}

/// A heap reference: an index into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Object {
        class: ClassId,
        fields: Vec<Term>,
    },
    Array {
        elem: Type,
        elements: Vec<Term>,
        symbolic_writes: Vec<(Term, Term)>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drops every object allocated at or past `len` (trail undo).
    pub fn truncate(&mut self, len: usize) {
        self.objects.truncate(len);
    }

    pub fn alloc_object(&mut self, class: ClassId, fields: Vec<Term>) -> ObjRef {
        self.objects.push(HeapObject::Object { class, fields });
        ObjRef(self.objects.len() - 1)
    }

    pub fn alloc_array(&mut self, elem: Type, elements: Vec<Term>) -> ObjRef {
        self.objects.push(HeapObject::Array { elem, elements, symbolic_writes: Vec::new() });
        ObjRef(self.objects.len() - 1)
    }

    pub fn get(&self, r: ObjRef) -> Result<&HeapObject> {
        self.objects.get(r.0).ok_or(HeapError::Dangling(r.0))
    }

    pub fn class_of(&self, r: ObjRef) -> Result<Option<ClassId>> {
        Ok(match self.get(r)? {
            HeapObject::Object { class, .. } => Some(*class),
            HeapObject::Array { .. } => None,
        })
    }

    pub fn field_load(&self, r: ObjRef, field: usize) -> Result<Term> {
        match self.get(r)? {
            HeapObject::Object { fields, .. } => fields
                .get(field)
                .cloned()
                .ok_or(HeapError::FieldOutOfRange { obj: r.0, field }),
            HeapObject::Array { .. } => Err(HeapError::NotAnObject(r.0)),
        }
    }

    /// Stores a field and returns the previous term for the trail.
    pub fn field_store(&mut self, r: ObjRef, field: usize, value: Term) -> Result<Term> {
        match self.objects.get_mut(r.0).ok_or(HeapError::Dangling(r.0))? {
            HeapObject::Object { fields, .. } => {
                let slot = fields
                    .get_mut(field)
                    .ok_or(HeapError::FieldOutOfRange { obj: r.0, field })?;
                Ok(std::mem::replace(slot, value))
            }
            HeapObject::Array { .. } => Err(HeapError::NotAnObject(r.0)),
        }
    }

    pub fn array_len(&self, r: ObjRef) -> Result<usize> {
        match self.get(r)? {
            HeapObject::Array { elements, .. } => Ok(elements.len()),
            HeapObject::Object { .. } => Err(HeapError::NotAnArray(r.0)),
        }
    }

    pub fn array_elem_type(&self, r: ObjRef) -> Result<Type> {
        match self.get(r)? {
            HeapObject::Array { elem, .. } => Ok(elem.clone()),
            HeapObject::Object { .. } => Err(HeapError::NotAnArray(r.0)),
        }
    }

    /// Stores through a concrete index; returns the previous term.
    pub fn array_store(&mut self, r: ObjRef, index: usize, value: Term) -> Result<Term> {
        match self.objects.get_mut(r.0).ok_or(HeapError::Dangling(r.0))? {
            HeapObject::Array { elements, .. } => {
                let slot = elements
                    .get_mut(index)
                    .ok_or(HeapError::ElementOutOfRange { obj: r.0, index })?;
                Ok(std::mem::replace(slot, value))
            }
            HeapObject::Object { .. } => Err(HeapError::NotAnArray(r.0)),
        }
    }

    /// Whether any write went through a symbolic index. Once true,
    /// later concrete writes must also go through the write log so that
    /// reads see them in order.
    pub fn has_symbolic_writes(&self, r: ObjRef) -> Result<bool> {
        match self.get(r)? {
            HeapObject::Array { symbolic_writes, .. } => Ok(!symbolic_writes.is_empty()),
            HeapObject::Object { .. } => Err(HeapError::NotAnArray(r.0)),
        }
    }

    /// Appends a write through a symbolic index.
    pub fn array_store_symbolic(&mut self, r: ObjRef, index: Term, value: Term) -> Result<()> {
        match self.objects.get_mut(r.0).ok_or(HeapError::Dangling(r.0))? {
            HeapObject::Array { symbolic_writes, .. } => {
                symbolic_writes.push((index, value));
                Ok(())
            }
            HeapObject::Object { .. } => Err(HeapError::NotAnArray(r.0)),
        }
    }

    /// Removes the newest symbolic write (trail undo).
    pub fn pop_symbolic_write(&mut self, r: ObjRef) -> Result<()> {
        match self.objects.get_mut(r.0).ok_or(HeapError::Dangling(r.0))? {
            HeapObject::Array { symbolic_writes, .. } => {
                symbolic_writes.pop();
                Ok(())
            }
            HeapObject::Object { .. } => Err(HeapError::NotAnArray(r.0)),
        }
    }

    /// Reads an element under an index term that is known in-bounds.
    ///
    /// Both index maps are consulted: the result starts from the
    /// concrete backing store (an if-then-else chain when the index is
    /// symbolic) and newer symbolic writes shadow it, newest last.
    pub fn array_select(&self, r: ObjRef, index: &Term) -> Result<Term> {
        let (elements, symbolic_writes) = match self.get(r)? {
            HeapObject::Array { elements, symbolic_writes, .. } => (elements, symbolic_writes),
            HeapObject::Object { .. } => return Err(HeapError::NotAnArray(r.0)),
        };

        let mut result = match index.as_int() {
            Some(i) => elements
                .get(i as usize)
                .cloned()
                .ok_or(HeapError::ElementOutOfRange { obj: r.0, index: i as usize })?,
            None => {
                let mut acc = elements
                    .first()
                    .cloned()
                    .ok_or(HeapError::ElementOutOfRange { obj: r.0, index: 0 })?;
                for (i, elem) in elements.iter().enumerate().skip(1) {
                    let here = Constraint::cmp(
                        CmpCond::Eq,
                        NumericType::Int,
                        index.clone(),
                        Term::int(i as i32),
                    );
                    acc = Term::ite(here, elem.clone(), acc);
                }
                acc
            }
        };

        for (written_index, written_value) in symbolic_writes {
            let matches = Constraint::cmp(
                CmpCond::Eq,
                NumericType::Int,
                written_index.clone(),
                index.clone(),
            );
            result = Term::ite(matches, written_value.clone(), result);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{Bindings, SymbolId};

    fn int_array(heap: &mut Heap, values: &[i32]) -> ObjRef {
        let elements = values.iter().map(|v| Term::int(*v)).collect();
        heap.alloc_array(Type::INT, elements)
    }

    #[test]
    fn alloc_and_truncate() {
        let mut heap = Heap::new();
        let a = heap.alloc_object(ClassId(0), vec![]);
        let before = heap.len();
        let b = int_array(&mut heap, &[1]);
        assert_eq!(b.0, a.0 + 1);
        heap.truncate(before);
        assert!(heap.get(b).is_err());
        assert!(heap.get(a).is_ok());
    }

    #[test]
    fn concrete_select_consults_symbolic_writes() {
        let mut heap = Heap::new();
        let arr = int_array(&mut heap, &[10, 20, 30]);
        heap.array_store_symbolic(arr, Term::Sym(SymbolId(0)), Term::int(99)).unwrap();

        let picked = heap.array_select(arr, &Term::int(1)).unwrap();
        // The symbolic write may alias index 1, so the read is an ite
        // over the write condition.
        let mut bound = Bindings::new();
        bound.insert(SymbolId(0), Value::Int(2));
        assert_eq!(picked.eval(&bound), Some(Value::Int(20)));
        bound.insert(SymbolId(0), Value::Int(1));
        assert_eq!(picked.eval(&bound), Some(Value::Int(99)));
    }

    #[test]
    fn symbolic_select_covers_every_index() {
        let mut heap = Heap::new();
        let arr = int_array(&mut heap, &[10, 20, 30]);
        let index = Term::Sym(SymbolId(0));
        let picked = heap.array_select(arr, &index).unwrap();
        for (i, expected) in [(0, 10), (1, 20), (2, 30)] {
            let mut bound = Bindings::new();
            bound.insert(SymbolId(0), Value::Int(i));
            assert_eq!(picked.eval(&bound), Some(Value::Int(expected)));
        }
    }

    #[test]
    fn newest_symbolic_write_shadows_older_ones() {
        let mut heap = Heap::new();
        let arr = int_array(&mut heap, &[0, 0]);
        heap.array_store_symbolic(arr, Term::Sym(SymbolId(0)), Term::int(1)).unwrap();
        heap.array_store_symbolic(arr, Term::Sym(SymbolId(0)), Term::int(2)).unwrap();

        let picked = heap.array_select(arr, &Term::Sym(SymbolId(0))).unwrap();
        let mut bound = Bindings::new();
        bound.insert(SymbolId(0), Value::Int(0));
        assert_eq!(picked.eval(&bound), Some(Value::Int(2)));

        heap.pop_symbolic_write(arr).unwrap();
        let picked = heap.array_select(arr, &Term::Sym(SymbolId(0))).unwrap();
        assert_eq!(picked.eval(&bound), Some(Value::Int(1)));
    }
}
