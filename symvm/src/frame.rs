//! Activation records: operand stack and local variable slots.
//!
//! The operand stack and the locals follow the stack-machine discipline
//! of the interpreted bytecode: slots are typed by content, wide values
//! (long, double, and long-sorted symbols) occupy a value slot plus a
//! trailing filler slot. Mutation goes through the state layer so every
//! reversible change lands on the trail; this module only enforces the
//! slot discipline.

use bytecode::prelude::*;
use thiserror::Error;

use crate::term::Term;

pub type Result<T> = std::result::Result<T, FrameError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("operand stack underflow")]
    Underflow,

    #[error("operand stack overflow (max {max})")]
    Overflow { max: usize },

    #[error("operation would split a wide value")]
    WideSlot,

    #[error("read of uninitialized local {index}")]
    EmptyLocal { index: usize },

    #[error("local index {index} out of range")]
    LocalOutOfRange { index: usize },
}

/// One slot of the operand stack or local array.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// An uninitialized local. Never appears on the operand stack.
    Empty,
    Value(Term),
    /// The second half of a wide value stored in the slot below.
    WideHalf,
}

/// One activation record.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub method: MethodId,
    pub pc: Pc,
    /// The last pc recorded for coverage edges; updated at call sites
    /// and reverted during exception unwinding.
    pub last_pc: Pc,
    locals: Vec<Slot>,
    stack: Vec<Slot>,
    max_stack: usize,
}

impl Frame {
    pub fn new(id: MethodId, method: &Method) -> Self {
        Self {
            method: id,
            pc: 0,
            last_pc: 0,
            locals: vec![Slot::Empty; method.max_locals as usize],
            stack: Vec::with_capacity(method.max_stack as usize),
            max_stack: method.max_stack as usize,
        }
    }

    /// Creates a frame with the arguments already placed in the first
    /// local slots, widths taken from each term.
    pub fn with_args(id: MethodId, method: &Method, args: Vec<(Term, SlotWidth)>) -> Self {
        let mut frame = Self::new(id, method);
        let mut slot = 0;
        for (term, width) in args {
            frame.locals[slot] = Slot::Value(term);
            if width == SlotWidth::Wide {
                frame.locals[slot + 1] = Slot::WideHalf;
                slot += 2;
            } else {
                slot += 1;
            }
        }
        frame
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, term: Term, width: SlotWidth) -> Result<()> {
        if self.stack.len() + width.slots() > self.max_stack {
            return Err(FrameError::Overflow { max: self.max_stack });
        }
        self.stack.push(Slot::Value(term));
        if width == SlotWidth::Wide {
            self.stack.push(Slot::WideHalf);
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Result<(Term, SlotWidth)> {
        match self.stack.pop() {
            None => Err(FrameError::Underflow),
            Some(Slot::WideHalf) => match self.stack.pop() {
                Some(Slot::Value(t)) => Ok((t, SlotWidth::Wide)),
                _ => Err(FrameError::WideSlot),
            },
            Some(Slot::Value(t)) => Ok((t, SlotWidth::Single)),
            Some(Slot::Empty) => Err(FrameError::WideSlot),
        }
    }

    /// The top slot, which must hold a single-width value.
    pub fn peek(&self) -> Result<&Term> {
        match self.stack.last() {
            Some(Slot::Value(t)) => Ok(t),
            Some(_) => Err(FrameError::WideSlot),
            None => Err(FrameError::Underflow),
        }
    }

    pub fn read_local(&self, index: usize) -> Result<(Term, SlotWidth)> {
        match self.locals.get(index) {
            None => Err(FrameError::LocalOutOfRange { index }),
            Some(Slot::Empty) => Err(FrameError::EmptyLocal { index }),
            Some(Slot::WideHalf) => Err(FrameError::WideSlot),
            Some(Slot::Value(t)) => {
                let wide = matches!(self.locals.get(index + 1), Some(Slot::WideHalf));
                Ok((t.clone(), if wide { SlotWidth::Wide } else { SlotWidth::Single }))
            }
        }
    }

    /// Writes a local, invalidating any wide pair the write tears apart.
    /// Returns the `(index, previous slot)` pairs that changed, oldest
    /// first, so the caller can log them for undo.
    pub fn write_local(
        &mut self,
        index: usize,
        term: Term,
        width: SlotWidth,
    ) -> Result<Vec<(usize, Slot)>> {
        let span = width.slots();
        if index + span > self.locals.len() {
            return Err(FrameError::LocalOutOfRange { index });
        }
        let mut changed = Vec::with_capacity(3);
        let mut set = |locals: &mut Vec<Slot>, i: usize, slot: Slot| {
            let old = std::mem::replace(&mut locals[i], slot);
            changed.push((i, old));
        };

        // Tearing the upper half of a pair starting below us.
        if index > 0 && matches!(self.locals[index], Slot::WideHalf) {
            set(&mut self.locals, index - 1, Slot::Empty);
        }
        set(&mut self.locals, index, Slot::Value(term));
        match width {
            SlotWidth::Wide => {
                // The slot after a wide pair may itself start a pair.
                if matches!(self.locals.get(index + 2), Some(Slot::WideHalf)) {
                    set(&mut self.locals, index + 2, Slot::Empty);
                }
                set(&mut self.locals, index + 1, Slot::WideHalf);
            }
            SlotWidth::Single => {
                if matches!(self.locals.get(index + 1), Some(Slot::WideHalf)) {
                    set(&mut self.locals, index + 1, Slot::Empty);
                }
            }
        }
        Ok(changed)
    }

    /// Restores a single slot to a previous state (trail undo).
    pub fn restore_local(&mut self, index: usize, slot: Slot) {
        self.locals[index] = slot;
    }

    /// Re-pushes slots removed by a pop (trail undo). Bypasses the
    /// overflow check: the slots were on this stack before.
    pub fn unpop(&mut self, term: Term, width: SlotWidth) {
        self.stack.push(Slot::Value(term));
        if width == SlotWidth::Wide {
            self.stack.push(Slot::WideHalf);
        }
    }

    /// Removes the slots added by a push (trail undo).
    pub fn unpush(&mut self) {
        if matches!(self.stack.pop(), Some(Slot::WideHalf)) {
            self.stack.pop();
        }
    }
}
