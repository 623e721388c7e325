//! Plug-in strategies for materializing symbolic references.
//!
//! The engine treats these as injected capabilities, like the hook
//! tables of the run configuration: how a non-null object comes into
//! being, and which lengths a symbolic array may take, are policy, not
//! engine mechanics.

use std::fmt::Debug;

use bytecode::prelude::*;

use crate::term::{Sort, SymbolTable, Term};

/// Produces the candidate lengths for a symbolic array, in the order
/// they will be explored.
pub trait LengthStrategy: Debug {
    fn lengths(&self, elem: &Type, max: u32) -> Vec<u32>;
}

/// Explores lengths `0..=max`, shortest first.
#[derive(Debug, Default)]
pub struct AscendingLengths;

impl LengthStrategy for AscendingLengths {
    fn lengths(&self, _elem: &Type, max: u32) -> Vec<u32> {
        (0..=max).collect()
    }
}

/// Builds the contents of materialized objects and arrays.
pub trait RefStrategy: Debug {
    /// Field terms for a fresh instance of `class`, in field order.
    fn object_fields(&self, class: &ClassDef, symbols: &mut SymbolTable) -> Vec<Term>;

    /// Element terms for a fresh array of `len` elements.
    fn array_elements(&self, elem: &Type, len: u32, symbols: &mut SymbolTable) -> Vec<Term>;
}

/// Fills numeric slots with fresh symbols and reference slots with
/// fresh unbound reference symbols, so nested structures materialize
/// lazily on their own dereference.
#[derive(Debug, Default)]
pub struct SymbolicContents;

impl SymbolicContents {
    fn term_for(&self, name: String, ty: &Type, symbols: &mut SymbolTable) -> Term {
        match ty {
            Type::Numeric(NumericType::Int) => Term::Sym(symbols.fresh(name, Sort::Int)),
            Type::Numeric(NumericType::Long) => Term::Sym(symbols.fresh(name, Sort::Long)),
            // Float contents stay concrete; the engine has no float sort.
            Type::Numeric(NumericType::Float) => Term::Value(Value::Float(0.0)),
            Type::Numeric(NumericType::Double) => Term::Value(Value::Double(0.0)),
            Type::Ref(r) => Term::Sym(symbols.fresh(name, Sort::Ref(r.clone()))),
        }
    }
}

impl RefStrategy for SymbolicContents {
    fn object_fields(&self, class: &ClassDef, symbols: &mut SymbolTable) -> Vec<Term> {
        class
            .fields
            .iter()
            .map(|f| self.term_for(format!("{}.{}", class.name, f.name), &f.ty, symbols))
            .collect()
    }

    fn array_elements(&self, elem: &Type, len: u32, symbols: &mut SymbolTable) -> Vec<Term> {
        (0..len)
            .map(|i| self.term_for(format!("elem[{i}]"), elem, symbols))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_lengths_start_at_zero() {
        assert_eq!(AscendingLengths.lengths(&Type::INT, 3), vec![0, 1, 2, 3]);
    }

    #[test]
    fn symbolic_contents_creates_one_symbol_per_numeric_slot() {
        let mut symbols = SymbolTable::new();
        let class = ClassDef::new("P", None)
            .with_field("x", Type::INT)
            .with_field("next", Type::class(ClassId(0)));
        let fields = SymbolicContents.object_fields(&class, &mut symbols);
        assert_eq!(fields.len(), 2);
        assert_eq!(symbols.len(), 2);
        assert!(matches!(fields[0], Term::Sym(_)));
        assert_eq!(symbols.info(crate::term::SymbolId(0)).name, "P.x");
    }
}
