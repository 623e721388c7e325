//! The instruction dispatch loop.
//!
//! One implementation of the instruction semantics serves both execution
//! modes: operands are terms, concrete operands fold in the term
//! constructors, and only a decision on a genuinely symbolic value
//! escalates to the search as a [`ChoiceRequest`]. In concrete mode a
//! symbolic operand at such a site is a fatal misuse of the engine, not
//! a branching opportunity.

use bytecode::prelude::*;
use tracing::trace;

use crate::choice::{ArrayAccess, ChoiceRequest};
use crate::coverage::CoverageSink;
use crate::exception;
use crate::heap::{HeapObject, ObjRef};
use crate::state::VmState;
use crate::term::{Constraint, SymbolId, Term};
use crate::trail::LoopSite;
use crate::{EngineError, ExecutionMode, Result};

/// How a path ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PathOutcome {
    /// The outermost frame returned, possibly with a value.
    Returned(Option<Term>),
    /// An exception propagated past the outermost frame.
    Uncaught { class: ClassId, name: String },
}

/// The observable result of dispatching one instruction.
#[derive(Debug)]
pub enum StepEvent {
    Continue,
    /// A decision on a symbolic value; the search owns what happens next.
    Choice(ChoiceRequest),
    Terminated(PathOutcome),
}

/// A reference-typed operand, resolved against the binding map.
enum Resolved {
    Null,
    Obj(ObjRef),
    Unbound(SymbolId),
}

#[derive(Debug)]
pub struct Executor<'p> {
    pub state: VmState<'p>,
    /// Set when the last dispatched instruction took a backward jump;
    /// the search reads this to enforce the loop-iteration bound.
    pub last_loop_count: Option<(LoopSite, u32)>,
}

impl<'p> Executor<'p> {
    pub fn from_state(state: VmState<'p>) -> Self {
        Self { state, last_loop_count: None }
    }

    /// Fetches, dispatches and (unless redirected) advances past the
    /// instruction at the current frame's pc.
    pub fn step(&mut self, coverage: &mut dyn CoverageSink) -> Result<StepEvent> {
        self.last_loop_count = None;
        let frame = self.state.frame()?;
        let method_id = frame.method;
        let pc = frame.pc;
        let method = self.state.project.method(method_id)?;
        let instr = method
            .code
            .get(pc as usize)
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "pc {pc} outside {} ({} instructions)",
                    method.name,
                    method.code.len()
                ))
            })?
            .clone();
        trace!("dispatch {}@{pc}: {instr:?}", method.name);
        self.state.instruction_count += 1;

        match instr {
            Instruction::Const(v) => {
                self.state.push_operand(Term::Value(v), v.width())?;
                self.advance(pc)
            }

            Instruction::LoadConst(index) => {
                let constant = self
                    .state
                    .project
                    .constant(index)
                    .ok_or(EngineError::BadConstant(index))?
                    .to_value();
                self.state.push_operand(Term::Value(constant), constant.width())?;
                self.advance(pc)
            }

            Instruction::Load(index) => {
                let (term, width) = self.state.read_local(index as usize)?;
                self.state.push_operand(term, width)?;
                self.advance(pc)
            }

            Instruction::Store(index) => {
                let (term, width) = self.state.pop_operand()?;
                self.state.write_local(index as usize, term, width)?;
                self.advance(pc)
            }

            Instruction::Inc { local, delta } => {
                let (term, _) = self.state.read_local(local as usize)?;
                let bumped =
                    Term::bin(ArithOp::Add, NumericType::Int, term, Term::int(delta));
                self.state.write_local(local as usize, bumped, SlotWidth::Single)?;
                self.advance(pc)
            }

            Instruction::Dup => {
                let top = self.state.frame()?.peek()?.clone();
                self.state.push_operand(top, SlotWidth::Single)?;
                self.advance(pc)
            }

            Instruction::Discard => {
                let (_, width) = self.state.pop_operand()?;
                if width == SlotWidth::Wide {
                    return Err(crate::frame::FrameError::WideSlot.into());
                }
                self.advance(pc)
            }

            Instruction::Neg { ty } => {
                let (term, width) = self.state.pop_operand()?;
                let negated = Term::neg(ty, term);
                self.check_fold(&negated, pc)?;
                self.state.push_operand(negated, width)?;
                self.advance(pc)
            }

            Instruction::Arith { op, ty } => self.arith(coverage, op, ty, pc),

            Instruction::If { cond, target } => {
                let (term, _) = self.state.pop_operand()?;
                match term.as_int() {
                    Some(v) => {
                        if cond.holds(v.cmp(&0)) {
                            self.jump(coverage, method_id, pc, target)
                        } else {
                            self.advance(pc)
                        }
                    }
                    None if term.is_concrete() => Err(self.type_mismatch("int", pc)),
                    None => {
                        self.require_symbolic(pc)?;
                        let constraint =
                            Constraint::cmp(cond, NumericType::Int, term, Term::int(0));
                        Ok(StepEvent::Choice(ChoiceRequest::Branch { constraint, target }))
                    }
                }
            }

            Instruction::IfCmp { cond, target } => {
                let (rhs, _) = self.state.pop_operand()?;
                let (lhs, _) = self.state.pop_operand()?;
                match (lhs.as_int(), rhs.as_int()) {
                    (Some(a), Some(b)) => {
                        if cond.holds(a.cmp(&b)) {
                            self.jump(coverage, method_id, pc, target)
                        } else {
                            self.advance(pc)
                        }
                    }
                    _ if lhs.is_concrete() && rhs.is_concrete() => {
                        Err(self.type_mismatch("int", pc))
                    }
                    _ => {
                        self.require_symbolic(pc)?;
                        let constraint = Constraint::cmp(cond, NumericType::Int, lhs, rhs);
                        Ok(StepEvent::Choice(ChoiceRequest::Branch { constraint, target }))
                    }
                }
            }

            Instruction::IfNull { target, negated } => {
                let (term, _) = self.state.pop_operand()?;
                match self.resolve(&term, pc)? {
                    Resolved::Null => {
                        if negated {
                            self.advance(pc)
                        } else {
                            self.jump(coverage, method_id, pc, target)
                        }
                    }
                    Resolved::Obj(_) => {
                        if negated {
                            self.jump(coverage, method_id, pc, target)
                        } else {
                            self.advance(pc)
                        }
                    }
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        Ok(StepEvent::Choice(ChoiceRequest::RefBranch { sym, target, negated }))
                    }
                }
            }

            Instruction::Goto(target) => self.jump(coverage, method_id, pc, target),

            Instruction::Switch { cases, default } => {
                let (key, _) = self.state.pop_operand()?;
                match key.as_int() {
                    Some(k) => {
                        let target = cases
                            .iter()
                            .find(|(case, _)| *case == k)
                            .map(|(_, t)| *t)
                            .unwrap_or(default);
                        self.jump(coverage, method_id, pc, target)
                    }
                    None if key.is_concrete() => Err(self.type_mismatch("int", pc)),
                    None => {
                        self.require_symbolic(pc)?;
                        Ok(StepEvent::Choice(ChoiceRequest::Switch { key, cases, default }))
                    }
                }
            }

            Instruction::Invoke(callee_id) => {
                let callee = self.state.project.method(callee_id)?;
                let param_count = callee.params.len();
                let mut args = Vec::with_capacity(param_count);
                for _ in 0..param_count {
                    args.push(self.state.pop_operand()?);
                }
                args.reverse();
                // The return address, and the call-site pc for coverage
                // edges entering this frame during exception unwinding.
                self.state.set_last_pc(pc)?;
                self.state.set_pc(pc + 1)?;
                let callee = self.state.project.method(callee_id)?;
                let frame = crate::frame::Frame::with_args(callee_id, callee, args);
                self.state.push_frame(frame);
                Ok(StepEvent::Continue)
            }

            Instruction::Return { void } => {
                let result = if void { None } else { Some(self.state.pop_operand()?) };
                self.state.pop_frame()?;
                if self.state.depth() == 0 {
                    return Ok(StepEvent::Terminated(PathOutcome::Returned(
                        result.map(|(t, _)| t),
                    )));
                }
                if let Some((term, width)) = result {
                    self.state.push_operand(term, width)?;
                }
                Ok(StepEvent::Continue)
            }

            Instruction::New(class) => {
                let fields = self
                    .state
                    .project
                    .class(class)?
                    .fields
                    .iter()
                    .map(|f| Term::Value(Value::default_of(&f.ty)))
                    .collect();
                let obj = self.state.alloc_object(class, fields);
                self.state.push_operand(Term::Ref(obj), SlotWidth::Single)?;
                self.advance(pc)
            }

            Instruction::GetField(field) => {
                let (obj_term, _) = self.state.pop_operand()?;
                match self.resolve(&obj_term, pc)? {
                    Resolved::Null => self.raise_builtin(coverage, |b| b.null_pointer),
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![(obj_term, SlotWidth::Single)])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(obj) => {
                        let value = self.state.heap.field_load(obj, field.field as usize)?;
                        let width = self.state.project.field_def(field)?.ty.width();
                        self.state.push_operand(value, width)?;
                        self.advance(pc)
                    }
                }
            }

            Instruction::PutField(field) => {
                let value = self.state.pop_operand()?;
                let (obj_term, _) = self.state.pop_operand()?;
                match self.resolve(&obj_term, pc)? {
                    Resolved::Null => self.raise_builtin(coverage, |b| b.null_pointer),
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![value, (obj_term, SlotWidth::Single)])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(obj) => {
                        self.state.field_store(obj, field.field as usize, value.0)?;
                        self.advance(pc)
                    }
                }
            }

            Instruction::NewArray(elem) => {
                let (length, _) = self.state.pop_operand()?;
                match length.as_int() {
                    Some(n) if n < 0 => {
                        self.raise_builtin(coverage, |b| b.negative_array_size)
                    }
                    Some(n) => {
                        let elements = (0..n)
                            .map(|_| Term::Value(Value::default_of(&elem)))
                            .collect();
                        let arr = self.state.alloc_array(elem, elements);
                        self.state.push_operand(Term::Ref(arr), SlotWidth::Single)?;
                        self.advance(pc)
                    }
                    None if length.is_concrete() => Err(self.type_mismatch("int", pc)),
                    None => {
                        self.require_symbolic(pc)?;
                        Ok(StepEvent::Choice(ChoiceRequest::NewArrayLength { length, elem }))
                    }
                }
            }

            Instruction::ArrayLoad => {
                let (index, _) = self.state.pop_operand()?;
                let (arr_term, _) = self.state.pop_operand()?;
                match self.resolve(&arr_term, pc)? {
                    Resolved::Null => self.raise_builtin(coverage, |b| b.null_pointer),
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![
                            (index, SlotWidth::Single),
                            (arr_term, SlotWidth::Single),
                        ])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(arr) => {
                        let length = self.state.heap.array_len(arr)?;
                        let width = self.state.heap.array_elem_type(arr)?.width();
                        match index.as_int() {
                            Some(i) if i >= 0 && (i as usize) < length => {
                                let value = self.state.heap.array_select(arr, &index)?;
                                self.state.push_operand(value, width)?;
                                self.advance(pc)
                            }
                            Some(_) => {
                                self.raise_builtin(coverage, |b| b.index_out_of_bounds)
                            }
                            None if index.is_concrete() => Err(self.type_mismatch("int", pc)),
                            None if length == 0 => {
                                self.require_symbolic(pc)?;
                                self.raise_builtin(coverage, |b| b.index_out_of_bounds)
                            }
                            None => {
                                self.require_symbolic(pc)?;
                                let result = self.state.heap.array_select(arr, &index)?;
                                Ok(StepEvent::Choice(ChoiceRequest::ArrayAccess {
                                    index,
                                    length: length as u32,
                                    access: ArrayAccess::Load { result, width },
                                }))
                            }
                        }
                    }
                }
            }

            Instruction::ArrayStore => {
                let value = self.state.pop_operand()?;
                let (index, _) = self.state.pop_operand()?;
                let (arr_term, _) = self.state.pop_operand()?;
                match self.resolve(&arr_term, pc)? {
                    Resolved::Null => self.raise_builtin(coverage, |b| b.null_pointer),
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![
                            value,
                            (index, SlotWidth::Single),
                            (arr_term, SlotWidth::Single),
                        ])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(arr) => {
                        let length = self.state.heap.array_len(arr)?;
                        match index.as_int() {
                            Some(i) if i >= 0 && (i as usize) < length => {
                                // Once symbolic-index writes exist, a
                                // concrete write must join the log to
                                // keep reads seeing writes in order.
                                if self.state.heap.has_symbolic_writes(arr)? {
                                    self.state.array_store_symbolic(arr, index, value.0)?;
                                } else {
                                    self.state.array_store(arr, i as usize, value.0)?;
                                }
                                self.advance(pc)
                            }
                            Some(_) => {
                                self.raise_builtin(coverage, |b| b.index_out_of_bounds)
                            }
                            None if index.is_concrete() => Err(self.type_mismatch("int", pc)),
                            None if length == 0 => {
                                self.require_symbolic(pc)?;
                                self.raise_builtin(coverage, |b| b.index_out_of_bounds)
                            }
                            None => {
                                self.require_symbolic(pc)?;
                                Ok(StepEvent::Choice(ChoiceRequest::ArrayAccess {
                                    index: index.clone(),
                                    length: length as u32,
                                    access: ArrayAccess::Store {
                                        obj: arr,
                                        index,
                                        value: value.0,
                                    },
                                }))
                            }
                        }
                    }
                }
            }

            Instruction::ArrayLength => {
                let (arr_term, _) = self.state.pop_operand()?;
                match self.resolve(&arr_term, pc)? {
                    Resolved::Null => self.raise_builtin(coverage, |b| b.null_pointer),
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![(arr_term, SlotWidth::Single)])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(arr) => {
                        let length = self.state.heap.array_len(arr)?;
                        self.state
                            .push_operand(Term::int(length as i32), SlotWidth::Single)?;
                        self.advance(pc)
                    }
                }
            }

            Instruction::CheckCast(class) => {
                let (term, _) = self.state.pop_operand()?;
                match self.resolve(&term, pc)? {
                    Resolved::Null => {
                        self.state.push_operand(term, SlotWidth::Single)?;
                        self.advance(pc)
                    }
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![(term, SlotWidth::Single)])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(obj) => {
                        let fits = match self.state.heap.class_of(obj)? {
                            Some(actual) => self.state.project.is_assignable(actual, class),
                            // Arrays are not assignable to class types.
                            None => false,
                        };
                        if fits {
                            self.state.push_operand(term, SlotWidth::Single)?;
                            self.advance(pc)
                        } else {
                            self.raise_builtin(coverage, |b| b.class_cast)
                        }
                    }
                }
            }

            Instruction::Throw => {
                let (term, _) = self.state.pop_operand()?;
                match self.resolve(&term, pc)? {
                    Resolved::Null => self.raise_builtin(coverage, |b| b.null_pointer),
                    Resolved::Unbound(sym) => {
                        self.require_symbolic(pc)?;
                        self.repush(vec![(term, SlotWidth::Single)])?;
                        Ok(StepEvent::Choice(ChoiceRequest::Deref { sym }))
                    }
                    Resolved::Obj(obj) => {
                        let class = match self.state.heap.get(obj)? {
                            HeapObject::Object { class, .. } => Some(*class),
                            HeapObject::Array { .. } => None,
                        };
                        match class {
                            Some(class) => self.raise(coverage, class, Some(obj)),
                            None => Err(self.type_mismatch("throwable", pc)),
                        }
                    }
                }
            }
        }
    }

    // -- helpers ---------------------------------------------------------

    fn advance(&mut self, pc: Pc) -> Result<StepEvent> {
        self.state.set_pc(pc + 1)?;
        Ok(StepEvent::Continue)
    }

    fn jump(
        &mut self,
        coverage: &mut dyn CoverageSink,
        method: MethodId,
        from: Pc,
        to: Pc,
    ) -> Result<StepEvent> {
        if self.state.mode == ExecutionMode::Symbolic {
            coverage.edge(method, from, to);
        }
        if to <= from {
            let site: LoopSite = (method, from);
            let count = self.state.bump_loop(site);
            self.last_loop_count = Some((site, count));
        }
        self.state.set_pc(to)?;
        Ok(StepEvent::Continue)
    }

    fn arith(
        &mut self,
        coverage: &mut dyn CoverageSink,
        op: ArithOp,
        ty: NumericType,
        pc: Pc,
    ) -> Result<StepEvent> {
        let (rhs, _) = self.state.pop_operand()?;
        let (lhs, _) = self.state.pop_operand()?;
        let width = ty.width();

        if ty.is_integral() && matches!(op, ArithOp::Div | ArithOp::Rem) {
            let zero_divisor = matches!(
                rhs.as_value(),
                Some(Value::Int(0)) | Some(Value::Long(0))
            );
            if zero_divisor {
                return self.raise_builtin(coverage, |b| b.arithmetic);
            }
            if !rhs.is_concrete() {
                self.require_symbolic(pc)?;
                return Ok(StepEvent::Choice(ChoiceRequest::DivZero {
                    result: Term::bin(op, ty, lhs, rhs.clone()),
                    width,
                    divisor: rhs,
                    ty,
                }));
            }
        }

        if self.state.mode == ExecutionMode::Concrete
            && (!lhs.is_concrete() || !rhs.is_concrete())
        {
            return Err(EngineError::SymbolicInConcreteMode { pc });
        }
        let result = Term::bin(op, ty, lhs, rhs);
        self.check_fold(&result, pc)?;
        self.state.push_operand(result, width)?;
        self.advance(pc)
    }

    /// Both operands were concrete but the fold failed: the bytecode
    /// lied about its types.
    fn check_fold(&self, term: &Term, pc: Pc) -> Result<()> {
        match term {
            Term::Bin { lhs, rhs, .. } if lhs.is_concrete() && rhs.is_concrete() => {
                Err(self.type_mismatch("matching numeric operands", pc))
            }
            Term::Neg { term: inner, .. } if inner.is_concrete() => {
                Err(self.type_mismatch("numeric operand", pc))
            }
            _ => Ok(()),
        }
    }

    fn type_mismatch(&self, expected: &'static str, pc: Pc) -> EngineError {
        EngineError::TypeMismatch { expected, pc }
    }

    fn require_symbolic(&self, pc: Pc) -> Result<()> {
        if self.state.mode == ExecutionMode::Concrete {
            return Err(EngineError::SymbolicInConcreteMode { pc });
        }
        Ok(())
    }

    fn resolve(&self, term: &Term, pc: Pc) -> Result<Resolved> {
        match term {
            Term::Value(Value::Null) => Ok(Resolved::Null),
            Term::Ref(r) => Ok(Resolved::Obj(*r)),
            Term::Sym(s) => match self.state.ref_binding(*s) {
                Some(Some(r)) => Ok(Resolved::Obj(r)),
                Some(None) => Ok(Resolved::Null),
                None => Ok(Resolved::Unbound(*s)),
            },
            _ => Err(self.type_mismatch("reference", pc)),
        }
    }

    /// Pushes popped operands back (deepest last in `ops`), restoring
    /// the stack before a deref choice re-dispatches the instruction.
    fn repush(&mut self, ops: Vec<(Term, SlotWidth)>) -> Result<()> {
        for (term, width) in ops.into_iter().rev() {
            self.state.push_operand(term, width)?;
        }
        Ok(())
    }

    /// Raises a built-in runtime exception at the current pc.
    pub fn raise_builtin(
        &mut self,
        coverage: &mut dyn CoverageSink,
        pick: impl Fn(&crate::project::BuiltinClasses) -> ClassId,
    ) -> Result<StepEvent> {
        let class = pick(&self.state.project.builtin);
        self.raise(coverage, class, None)
    }

    /// Raises an exception of `class`, reusing `object` when the
    /// bytecode threw an existing instance.
    pub fn raise(
        &mut self,
        coverage: &mut dyn CoverageSink,
        class: ClassId,
        object: Option<ObjRef>,
    ) -> Result<StepEvent> {
        match exception::raise(&mut self.state, coverage, class, object)? {
            Some(outcome) => Ok(StepEvent::Terminated(outcome)),
            None => Ok(StepEvent::Continue),
        }
    }
}
