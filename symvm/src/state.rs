//! The mutable interpreter state for one exploration session.
//!
//! Every reversible mutation funnels through this type so that, in
//! symbolic mode, a matching undo record lands on the trail before the
//! mutation is visible. Program-counter moves are deliberately not
//! logged: the pc is restored from the choice point that backtracking
//! returns to.

use std::collections::HashMap;

use bytecode::prelude::*;
use tracing::trace;

use crate::frame::Frame;
use crate::heap::{Heap, ObjRef};
use crate::project::Project;
use crate::term::{SymbolId, SymbolTable, Term};
use crate::trail::{LoopSite, Trail, TrailEntry, TrailMark};
use crate::{EngineError, ExecutionMode, Result};

#[derive(Debug)]
pub struct VmState<'p> {
    pub project: &'p Project,
    pub mode: ExecutionMode,
    pub heap: Heap,
    pub symbols: SymbolTable,
    /// Executed-instruction counter for the lifetime of the session.
    pub instruction_count: u64,
    frames: Vec<Frame>,
    trail: Trail,
    ref_bindings: HashMap<SymbolId, Option<ObjRef>>,
    loop_counts: HashMap<LoopSite, u32>,
}

impl<'p> VmState<'p> {
    pub fn new(project: &'p Project, mode: ExecutionMode) -> Self {
        Self {
            project,
            mode,
            heap: Heap::new(),
            symbols: SymbolTable::new(),
            instruction_count: 0,
            frames: Vec::new(),
            trail: Trail::new(),
            ref_bindings: HashMap::new(),
            loop_counts: HashMap::new(),
        }
    }

    fn record(&mut self, entry: TrailEntry) {
        if self.mode == ExecutionMode::Symbolic {
            self.trail.push(entry);
        }
    }

    // -- frames ----------------------------------------------------------

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| EngineError::InvariantViolation("no active frame".into()))
    }

    pub fn frame_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| EngineError::InvariantViolation("no active frame".into()))
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.record(TrailEntry::FramePushed);
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Result<Frame> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| EngineError::InvariantViolation("pop on empty frame stack".into()))?;
        self.record(TrailEntry::FramePopped { frame: frame.clone() });
        Ok(frame)
    }

    pub fn set_pc(&mut self, pc: Pc) -> Result<()> {
        self.frame_mut()?.pc = pc;
        Ok(())
    }

    pub fn set_last_pc(&mut self, pc: Pc) -> Result<()> {
        let idx = self.frames.len().saturating_sub(1);
        let old = self.frame()?.last_pc;
        self.record(TrailEntry::LastPc { frame: idx, old });
        self.frame_mut()?.last_pc = pc;
        Ok(())
    }

    /// Reverts a specific frame's coverage pc during exception unwinding.
    pub fn revert_last_pc(&mut self, frame: usize, pc: Pc) {
        if let Some(f) = self.frames.get(frame) {
            let old = f.last_pc;
            self.record(TrailEntry::LastPc { frame, old });
        }
        if let Some(f) = self.frames.get_mut(frame) {
            f.last_pc = pc;
        }
    }

    // -- operand stack and locals ---------------------------------------

    pub fn push_operand(&mut self, term: Term, width: SlotWidth) -> Result<()> {
        let idx = self.frames.len().saturating_sub(1);
        self.record(TrailEntry::OperandPush { frame: idx });
        self.frame_mut()?.push(term, width)?;
        Ok(())
    }

    pub fn pop_operand(&mut self) -> Result<(Term, SlotWidth)> {
        let idx = self.frames.len().saturating_sub(1);
        let (term, width) = self.frame_mut()?.pop()?;
        self.record(TrailEntry::OperandPop { frame: idx, term: term.clone(), width });
        Ok((term, width))
    }

    pub fn write_local(&mut self, index: usize, term: Term, width: SlotWidth) -> Result<()> {
        let idx = self.frames.len().saturating_sub(1);
        let changed = self.frame_mut()?.write_local(index, term, width)?;
        for (slot_index, old) in changed {
            self.record(TrailEntry::LocalWrite { frame: idx, index: slot_index, old });
        }
        Ok(())
    }

    pub fn read_local(&self, index: usize) -> Result<(Term, SlotWidth)> {
        Ok(self.frame()?.read_local(index)?)
    }

    // -- heap ------------------------------------------------------------

    pub fn alloc_object(&mut self, class: ClassId, fields: Vec<Term>) -> ObjRef {
        self.record(TrailEntry::HeapAlloc);
        self.heap.alloc_object(class, fields)
    }

    pub fn alloc_array(&mut self, elem: Type, elements: Vec<Term>) -> ObjRef {
        self.record(TrailEntry::HeapAlloc);
        self.heap.alloc_array(elem, elements)
    }

    pub fn field_store(&mut self, obj: ObjRef, field: usize, value: Term) -> Result<()> {
        let old = self.heap.field_store(obj, field, value)?;
        self.record(TrailEntry::FieldWrite { obj, field, old });
        Ok(())
    }

    pub fn array_store(&mut self, obj: ObjRef, index: usize, value: Term) -> Result<()> {
        let old = self.heap.array_store(obj, index, value)?;
        self.record(TrailEntry::ArrayWrite { obj, index, old });
        Ok(())
    }

    pub fn array_store_symbolic(&mut self, obj: ObjRef, index: Term, value: Term) -> Result<()> {
        self.heap.array_store_symbolic(obj, index, value)?;
        self.record(TrailEntry::SymbolicArrayWrite { obj });
        Ok(())
    }

    // -- symbolic reference bindings ------------------------------------

    /// Binds a reference symbol for the rest of the current path.
    pub fn bind_ref(&mut self, sym: SymbolId, target: Option<ObjRef>) -> Result<()> {
        if self.ref_bindings.contains_key(&sym) {
            return Err(EngineError::InvariantViolation(format!(
                "reference symbol {sym} bound twice"
            )));
        }
        self.ref_bindings.insert(sym, target);
        self.record(TrailEntry::RefBound { sym });
        Ok(())
    }

    pub fn ref_binding(&self, sym: SymbolId) -> Option<Option<ObjRef>> {
        self.ref_bindings.get(&sym).copied()
    }

    // -- loop counters ---------------------------------------------------

    /// Counts one traversal of a backward branch; returns the new count.
    pub fn bump_loop(&mut self, site: LoopSite) -> u32 {
        let old = self.loop_counts.get(&site).copied();
        self.record(TrailEntry::LoopCount { site, old });
        let new = old.unwrap_or(0) + 1;
        self.loop_counts.insert(site, new);
        new
    }

    // -- trail -----------------------------------------------------------

    pub fn trail_mark(&self) -> TrailMark {
        self.trail.mark()
    }

    pub fn trail_len(&self) -> usize {
        self.trail.len()
    }

    /// Unwinds the trail to `mark`, applying each undo record in reverse
    /// creation order.
    pub fn unwind_to(&mut self, mark: TrailMark) -> Result<()> {
        if mark > self.trail.len() {
            return Err(EngineError::InvariantViolation(format!(
                "unwind mark {mark} beyond trail length {}",
                self.trail.len()
            )));
        }
        trace!("unwinding trail {} -> {}", self.trail.len(), mark);
        while self.trail.len() > mark {
            let entry = match self.trail.pop() {
                Some(e) => e,
                None => break,
            };
            self.apply_undo(entry)?;
        }
        Ok(())
    }

    fn apply_undo(&mut self, entry: TrailEntry) -> Result<()> {
        match entry {
            TrailEntry::OperandPush { frame } => {
                self.frames[frame].unpush();
            }
            TrailEntry::OperandPop { frame, term, width } => {
                self.frames[frame].unpop(term, width);
            }
            TrailEntry::LocalWrite { frame, index, old } => {
                self.frames[frame].restore_local(index, old);
            }
            TrailEntry::FramePushed => {
                self.frames.pop();
            }
            TrailEntry::FramePopped { frame } => {
                self.frames.push(frame);
            }
            TrailEntry::HeapAlloc => {
                let len = self.heap.len();
                self.heap.truncate(len - 1);
            }
            TrailEntry::FieldWrite { obj, field, old } => {
                self.heap.field_store(obj, field, old)?;
            }
            TrailEntry::ArrayWrite { obj, index, old } => {
                self.heap.array_store(obj, index, old)?;
            }
            TrailEntry::SymbolicArrayWrite { obj } => {
                self.heap.pop_symbolic_write(obj)?;
            }
            TrailEntry::RefBound { sym } => {
                self.ref_bindings.remove(&sym);
            }
            TrailEntry::LoopCount { site, old } => match old {
                Some(v) => {
                    self.loop_counts.insert(site, v);
                }
                None => {
                    self.loop_counts.remove(&site);
                }
            },
            TrailEntry::LastPc { frame, old } => {
                if let Some(f) = self.frames.get_mut(frame) {
                    f.last_pc = old;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use bytecode::instruction::Instruction;

    fn test_project() -> Project {
        let mut project = Project::new();
        project
            .add_method(Method {
                name: "m".to_owned(),
                params: vec![],
                ret: None,
                max_locals: 4,
                max_stack: 4,
                code: vec![Instruction::Return { void: true }],
                handlers: vec![],
            })
            .unwrap();
        project
    }

    #[test]
    fn unwind_restores_operand_stack_and_locals() {
        let project = test_project();
        let mut state = VmState::new(&project, ExecutionMode::Symbolic);
        let method = project.method(MethodId(0)).unwrap();
        state.push_frame(Frame::new(MethodId(0), method));

        state.push_operand(Term::int(1), SlotWidth::Single).unwrap();
        state.write_local(0, Term::int(7), SlotWidth::Single).unwrap();
        let mark = state.trail_mark();

        state.pop_operand().unwrap();
        state.write_local(0, Term::int(8), SlotWidth::Single).unwrap();
        state.push_operand(Term::long(9), SlotWidth::Wide).unwrap();

        state.unwind_to(mark).unwrap();
        assert_eq!(state.trail_len(), mark);
        assert_eq!(state.frame().unwrap().stack_depth(), 1);
        assert_eq!(
            state.read_local(0).unwrap(),
            (Term::int(7), SlotWidth::Single)
        );
    }

    #[test]
    fn unwind_restores_frames_and_heap() {
        let project = test_project();
        let mut state = VmState::new(&project, ExecutionMode::Symbolic);
        let method = project.method(MethodId(0)).unwrap();
        state.push_frame(Frame::new(MethodId(0), method));
        let mark = state.trail_mark();

        state.push_frame(Frame::new(MethodId(0), method));
        let obj = state.alloc_object(ClassId(0), vec![Term::int(0)]);
        state.field_store(obj, 0, Term::int(5)).unwrap();
        state.pop_frame().unwrap();

        state.unwind_to(mark).unwrap();
        assert_eq!(state.depth(), 1);
        assert!(state.heap.is_empty());
    }

    #[test]
    fn unwind_restores_bindings_and_loop_counts() {
        let project = test_project();
        let mut state = VmState::new(&project, ExecutionMode::Symbolic);
        let method = project.method(MethodId(0)).unwrap();
        state.push_frame(Frame::new(MethodId(0), method));
        let sym = state.symbols.fresh("r", crate::term::Sort::Int);
        let site = (MethodId(0), 0);

        assert_eq!(state.bump_loop(site), 1);
        let mark = state.trail_mark();
        assert_eq!(state.bump_loop(site), 2);
        state.bind_ref(sym, None).unwrap();

        state.unwind_to(mark).unwrap();
        assert_eq!(state.ref_binding(sym), None);
        assert_eq!(state.bump_loop(site), 2);
    }

    #[test]
    fn concrete_mode_records_nothing() {
        let project = test_project();
        let mut state = VmState::new(&project, ExecutionMode::Concrete);
        let method = project.method(MethodId(0)).unwrap();
        state.push_frame(Frame::new(MethodId(0), method));
        state.push_operand(Term::int(1), SlotWidth::Single).unwrap();
        assert_eq!(state.trail_len(), 0);
    }

    #[test]
    fn unwind_past_the_log_is_fatal() {
        let project = test_project();
        let mut state = VmState::new(&project, ExecutionMode::Symbolic);
        assert!(matches!(
            state.unwind_to(3),
            Err(EngineError::InvariantViolation(_))
        ));
    }
}
