//! The search over the choice-point tree.
//!
//! The explorer drives one path at a time to a terminal state, then
//! backtracks: unwind the trail to the newest choice point's mark, pop
//! the constraint stack to its captured level, and advance it to the
//! next alternative whose guard is satisfiable. Alternatives whose guard
//! is proven unsatisfiable are pruned without ever dispatching an
//! instruction under them; an undecided guard prunes the same way but is
//! counted separately. Configured bounds abandon the current path like
//! an exhausted choice point and never abort the search.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use bytecode::prelude::*;
use tracing::{debug, trace, warn};

use crate::choice::{
    build_choice_point, Alternative, BranchEffect, ChoicePoint, ChoiceRequest, RaiseKind,
};
use crate::coverage::CoverageSink;
use crate::exception;
use crate::executor::{Executor, PathOutcome, StepEvent};
use crate::frame::Frame;
use crate::generator::{LengthStrategy, RefStrategy};
use crate::solver::{Solution, SolverError, SolverManager};
use crate::state::VmState;
use crate::term::{Sort, Term};
use crate::trail::LoopSite;
use crate::{EngineError, ExecutionMode, Result, RunConfig};

/// Exploration-order policy over the choice-point tree.
pub trait SearchStrategy: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// The depth bound for the first round; `None` is unbounded.
    fn initial_depth(&self) -> Option<usize>;

    /// The bound for the next round after one that hit its bound;
    /// `None` ends the search.
    fn next_depth(&self, previous: usize) -> Option<usize>;
}

/// Plain depth-first search, optionally depth-bounded, never restarted.
#[derive(Debug, Default)]
pub struct DepthFirstSearch {
    pub depth_bound: Option<usize>,
}

impl SearchStrategy for DepthFirstSearch {
    fn name(&self) -> &'static str {
        "depth-first"
    }

    fn initial_depth(&self) -> Option<usize> {
        self.depth_bound
    }

    fn next_depth(&self, _previous: usize) -> Option<usize> {
        None
    }
}

/// Iterative-deepening depth-first search: restarts from the root with
/// a larger bound whenever a round was cut short by the current one,
/// keeping previously found solutions.
#[derive(Debug)]
pub struct IterativeDeepeningSearch {
    pub initial: usize,
    pub step: usize,
    pub max_depth: Option<usize>,
}

impl Default for IterativeDeepeningSearch {
    fn default() -> Self {
        Self { initial: 1, step: 1, max_depth: None }
    }
}

impl SearchStrategy for IterativeDeepeningSearch {
    fn name(&self) -> &'static str {
        "iterative-deepening"
    }

    fn initial_depth(&self) -> Option<usize> {
        Some(self.initial)
    }

    fn next_depth(&self, previous: usize) -> Option<usize> {
        let next = previous + self.step;
        match self.max_depth {
            Some(max) if next > max => None,
            _ => Some(next),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    pub paths_completed: u64,
    pub solutions_found: u64,
    pub duplicate_solutions: u64,
    pub unknown_at_terminal: u64,
    pub pruned_unsat: u64,
    pub pruned_unknown: u64,
    pub abandoned_resource: u64,
    pub choice_points: u64,
    pub backtracks: u64,
    pub restarts: u64,
}

/// One terminal path: its outcome, the satisfying assignment (absent in
/// concrete mode or when the terminal system was undecidable), and the
/// path condition it was reached under.
#[derive(Debug, Clone)]
pub struct PathSolution {
    pub outcome: PathOutcome,
    pub solution: Option<Solution>,
    pub constraints: Vec<String>,
    pub signature: u64,
}

/// How the entry frame's arguments are produced.
#[derive(Debug, Clone)]
enum EntryArgs {
    Symbolic,
    Concrete(Vec<Value>),
}

enum SelectOutcome {
    Running,
    Terminal(PathOutcome),
    RoundExhausted,
}

pub struct Explorer<'p> {
    executor: Executor<'p>,
    solver: SolverManager,
    strategy: Box<dyn SearchStrategy>,
    coverage: Box<dyn CoverageSink>,
    lengths: Box<dyn LengthStrategy>,
    refs: Box<dyn RefStrategy>,
    config: RunConfig,
    entry: MethodId,
    entry_args: EntryArgs,
    /// Symbols created for the entry arguments; always reported in
    /// solutions even when unconstrained.
    primary_symbols: usize,
    choice_points: Vec<ChoicePoint>,
    pending: VecDeque<PathSolution>,
    seen: HashSet<u64>,
    stats: SearchStats,
    depth_bound: Option<usize>,
    hit_depth_bound: bool,
    deadline: Option<Instant>,
    done: bool,
}

impl<'p> Explorer<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: &'p crate::project::Project,
        entry: MethodId,
        entry_values: Option<Vec<Value>>,
        config: RunConfig,
        strategy: Box<dyn SearchStrategy>,
        solver: SolverManager,
        coverage: Box<dyn CoverageSink>,
        lengths: Box<dyn LengthStrategy>,
        refs: Box<dyn RefStrategy>,
    ) -> Result<Self> {
        let entry_args = match entry_values {
            Some(values) => EntryArgs::Concrete(values),
            None => EntryArgs::Symbolic,
        };
        let depth_bound = strategy.initial_depth();
        let deadline = config.time_budget.map(|budget| Instant::now() + budget);
        let mut explorer = Self {
            executor: Executor::from_state(VmState::new(project, config.mode)),
            solver,
            strategy,
            coverage,
            lengths,
            refs,
            config,
            entry,
            entry_args,
            primary_symbols: 0,
            choice_points: Vec::new(),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            stats: SearchStats::default(),
            depth_bound,
            hit_depth_bound: false,
            deadline,
            done: false,
        };
        explorer.init_state()?;
        Ok(explorer)
    }

    /// Builds a fresh entry state. Symbols are assigned in parameter
    /// order, so every round and every rerun sees identical ids.
    fn init_state(&mut self) -> Result<()> {
        let project = self.executor.state.project;
        let mut state = VmState::new(project, self.config.mode);
        let method = project.method(self.entry)?;

        let mut args = Vec::with_capacity(method.params.len());
        match &self.entry_args {
            EntryArgs::Concrete(values) => {
                if values.len() != method.params.len() {
                    return Err(EngineError::InvariantViolation(format!(
                        "entry {} expects {} arguments, got {}",
                        method.name,
                        method.params.len(),
                        values.len()
                    )));
                }
                for value in values {
                    args.push((Term::Value(*value), value.width()));
                }
            }
            EntryArgs::Symbolic => {
                for (i, param) in method.params.iter().enumerate() {
                    let name = format!("arg{i}");
                    let term = match param {
                        Type::Numeric(NumericType::Int) => {
                            Term::Sym(state.symbols.fresh(name, Sort::Int))
                        }
                        Type::Numeric(NumericType::Long) => {
                            Term::Sym(state.symbols.fresh(name, Sort::Long))
                        }
                        Type::Numeric(_) => {
                            return Err(EngineError::Unsupported(
                                "symbolic floating-point parameters",
                            ))
                        }
                        Type::Ref(ref_type) => {
                            Term::Sym(state.symbols.fresh(name, Sort::Ref(ref_type.clone())))
                        }
                    };
                    args.push((term, param.width()));
                }
            }
        }
        self.primary_symbols = state.symbols.len();
        state.push_frame(Frame::with_args(self.entry, method, args));
        self.executor = Executor::from_state(state);
        Ok(())
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    pub fn add_listener(&mut self, listener: Box<dyn crate::listener::SolverListener>) {
        self.solver.add_listener(listener);
    }

    pub fn coverage(&self) -> &dyn CoverageSink {
        self.coverage.as_ref()
    }

    pub fn instruction_count(&self) -> u64 {
        self.executor.state.instruction_count
    }

    /// Clears all search state for a fresh run. Idempotent.
    pub fn reset(&mut self) -> Result<()> {
        self.solver.reset();
        self.choice_points.clear();
        self.pending.clear();
        self.seen.clear();
        self.stats = SearchStats::default();
        self.depth_bound = self.strategy.initial_depth();
        self.hit_depth_bound = false;
        self.deadline = self.config.time_budget.map(|budget| Instant::now() + budget);
        self.done = false;
        self.init_state()
    }

    /// Runs until the next terminal path and returns its result, or
    /// `None` when the search space is exhausted.
    pub fn next_path(&mut self) -> Result<Option<PathSolution>> {
        loop {
            if let Some(result) = self.pending.pop_front() {
                return Ok(Some(result));
            }
            if self.done {
                return Ok(None);
            }
            self.advance_search()?;
        }
    }

    fn advance_search(&mut self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!("wall-clock budget exhausted, ending search");
                self.stats.abandoned_resource += 1;
                self.done = true;
                return Ok(());
            }
        }

        let event = self.executor.step(self.coverage.as_mut())?;
        match event {
            StepEvent::Continue => self.check_resource_bounds(),

            StepEvent::Choice(request) => {
                if let Some(bound) = self.depth_bound {
                    if self.choice_points.len() >= bound {
                        trace!("depth bound {bound} reached");
                        self.hit_depth_bound = true;
                        return self.resume_after_terminal();
                    }
                }
                self.create_choice_point(request)?;
                match self.select_next_alternative()? {
                    SelectOutcome::Running => self.check_resource_bounds(),
                    SelectOutcome::Terminal(outcome) => {
                        self.finish_path(outcome)?;
                        self.resume_after_terminal()
                    }
                    SelectOutcome::RoundExhausted => self.end_round(),
                }
            }

            StepEvent::Terminated(outcome) => {
                self.finish_path(outcome)?;
                self.resume_after_terminal()
            }
        }
    }

    /// Trail and loop bounds, applied after any forward progress. A
    /// breach abandons the path, never the search.
    fn check_resource_bounds(&mut self) -> Result<()> {
        if let Some(max) = self.config.max_trail {
            if self.executor.state.trail_len() > max {
                debug!("trail bound {max} exceeded, abandoning path");
                return self.abandon_current();
            }
        }
        if let (Some(max), Some((site, count))) =
            (self.config.max_loop_iterations, self.executor.last_loop_count)
        {
            if count > max {
                debug!("loop bound {max} exceeded at {site:?}, abandoning path");
                return self.abandon_current();
            }
        }
        Ok(())
    }

    /// Creates the choice point for a request at the current state.
    fn create_choice_point(&mut self, request: ChoiceRequest) -> Result<()> {
        if self.solver.constraint_level() != self.choice_points.len() {
            return Err(EngineError::InvariantViolation(format!(
                "constraint depth {} != choice-point count {}",
                self.solver.constraint_level(),
                self.choice_points.len()
            )));
        }
        let state = &mut self.executor.state;
        let frame_depth = state.depth();
        let pc = state.frame()?.pc;
        let trail_mark = state.trail_mark();
        let constraint_level = self.solver.constraint_level();
        let cp = build_choice_point(
            request,
            frame_depth,
            pc,
            trail_mark,
            constraint_level,
            &mut state.symbols,
            self.lengths.as_ref(),
            self.config.max_symbolic_array_length,
        );
        trace!(
            "choice point #{} at pc {pc} with {} alternatives",
            self.choice_points.len(),
            cp.alternative_count()
        );
        self.stats.choice_points += 1;
        self.choice_points.push(cp);
        Ok(())
    }

    /// Advances the newest choice point to its next viable alternative.
    ///
    /// Expects the state to sit exactly at that choice point's creation
    /// snapshot. Prunes unsatisfiable and undecided guards, walking up
    /// to ancestors as nodes exhaust.
    fn select_next_alternative(&mut self) -> Result<SelectOutcome> {
        loop {
            let (alt, cp_pc) = match self.choice_points.last_mut() {
                None => return Ok(SelectOutcome::RoundExhausted),
                Some(cp) => (cp.advance(), cp.pc),
            };
            match alt {
                None => {
                    // Exhausted: discard the node and move to its parent.
                    self.choice_points.pop();
                    self.stats.backtracks += 1;
                    if !self.reposition_at_top()? {
                        return Ok(SelectOutcome::RoundExhausted);
                    }
                }
                Some(alt) => {
                    trace!("trying alternative '{}' at pc {cp_pc}", alt.label);
                    self.solver.add_constraint(alt.guard.clone());
                    match self.solver.has_solution() {
                        Ok(true) => {
                            let outcome = self.apply_effect(alt, cp_pc)?;
                            if self.solver.constraint_level() != self.choice_points.len() {
                                return Err(EngineError::InvariantViolation(format!(
                                    "constraint depth {} != choice-point count {} after commit",
                                    self.solver.constraint_level(),
                                    self.choice_points.len()
                                )));
                            }
                            return Ok(match outcome {
                                None => SelectOutcome::Running,
                                Some(outcome) => SelectOutcome::Terminal(outcome),
                            });
                        }
                        Ok(false) => {
                            trace!("alternative pruned: unsatisfiable");
                            self.stats.pruned_unsat += 1;
                            self.solver.remove_constraint().map_err(solver_fatal)?;
                        }
                        Err(SolverError::Undecided) => {
                            warn!("alternative pruned: solver could not decide (unknown)");
                            self.stats.pruned_unknown += 1;
                            self.solver.remove_constraint().map_err(solver_fatal)?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Commits to an alternative. Returns a terminal outcome when the
    /// alternative's effect ends the path (an uncaught raise).
    fn apply_effect(&mut self, alt: Alternative, cp_pc: Pc) -> Result<Option<PathOutcome>> {
        let method_id = self.executor.state.frame()?.method;
        match alt.effect {
            BranchEffect::JumpTo(target) => {
                if self.executor.state.mode == ExecutionMode::Symbolic {
                    self.coverage.edge(method_id, cp_pc, target);
                }
                if target <= cp_pc {
                    let site: LoopSite = (method_id, cp_pc);
                    let count = self.executor.state.bump_loop(site);
                    self.executor.last_loop_count = Some((site, count));
                }
                self.executor.state.set_pc(target)?;
                Ok(None)
            }

            BranchEffect::FallThrough => {
                self.executor.state.set_pc(cp_pc + 1)?;
                Ok(None)
            }

            BranchEffect::PushAndAdvance { term, width } => {
                self.executor.state.push_operand(term, width)?;
                self.executor.state.set_pc(cp_pc + 1)?;
                Ok(None)
            }

            BranchEffect::StoreSymbolicAndAdvance { obj, index, value } => {
                self.executor.state.array_store_symbolic(obj, index, value)?;
                self.executor.state.set_pc(cp_pc + 1)?;
                Ok(None)
            }

            BranchEffect::Raise(kind) => {
                let builtin = &self.executor.state.project.builtin;
                let class = match kind {
                    RaiseKind::NullPointer => builtin.null_pointer,
                    RaiseKind::Arithmetic => builtin.arithmetic,
                    RaiseKind::IndexOutOfBounds => builtin.index_out_of_bounds,
                    RaiseKind::NegativeArraySize => builtin.negative_array_size,
                };
                exception::raise(&mut self.executor.state, self.coverage.as_mut(), class, None)
            }

            BranchEffect::BindNull { sym } => {
                // The faulting instruction re-dispatches and raises
                // through the regular null-dereference route.
                self.executor.state.bind_ref(sym, None)?;
                Ok(None)
            }

            BranchEffect::BindMaterialized { sym } => {
                let class_id = match &self.executor.state.symbols.info(sym).sort {
                    Sort::Ref(RefType::Class(c)) => *c,
                    other => {
                        return Err(EngineError::InvariantViolation(format!(
                            "materializing non-class symbol of sort {other:?}"
                        )))
                    }
                };
                let project = self.executor.state.project;
                let class = project.class(class_id)?;
                let refs = self.refs.as_ref();
                let fields = refs.object_fields(class, &mut self.executor.state.symbols);
                let obj = self.executor.state.alloc_object(class_id, fields);
                self.executor.state.bind_ref(sym, Some(obj))?;
                Ok(None)
            }

            BranchEffect::BindMaterializedArray { sym, len } => {
                let elem = match &self.executor.state.symbols.info(sym).sort {
                    Sort::Ref(RefType::Array(elem)) => (**elem).clone(),
                    other => {
                        return Err(EngineError::InvariantViolation(format!(
                            "materializing non-array symbol of sort {other:?}"
                        )))
                    }
                };
                let refs = self.refs.as_ref();
                let elements = refs.array_elements(&elem, len, &mut self.executor.state.symbols);
                let arr = self.executor.state.alloc_array(elem, elements);
                self.executor.state.bind_ref(sym, Some(arr))?;
                Ok(None)
            }

            BranchEffect::AllocArrayAndAdvance { elem, len } => {
                // A program-allocated array starts out default-filled.
                let elements = (0..len)
                    .map(|_| Term::Value(Value::default_of(&elem)))
                    .collect();
                let arr = self.executor.state.alloc_array(elem, elements);
                self.executor.state.push_operand(Term::Ref(arr), SlotWidth::Single)?;
                self.executor.state.set_pc(cp_pc + 1)?;
                Ok(None)
            }
        }
    }

    /// Records a terminal path: outcome, constraint signature, and (in
    /// symbolic mode) a solution for the path condition.
    fn finish_path(&mut self, outcome: PathOutcome) -> Result<()> {
        self.stats.paths_completed += 1;
        self.coverage.path_end(&outcome);
        let signature = self.solver.signature();
        if !self.seen.insert(signature) {
            trace!("duplicate path condition, dropping result");
            self.stats.duplicate_solutions += 1;
            return Ok(());
        }
        let constraints: Vec<String> =
            self.solver.constraints().iter().map(|c| c.to_string()).collect();
        let solution = if self.executor.state.mode == ExecutionMode::Symbolic {
            match self
                .solver
                .get_solution(&self.executor.state.symbols, self.primary_symbols)
            {
                Ok(Some(solution)) => {
                    self.stats.solutions_found += 1;
                    Some(solution)
                }
                Ok(None) => None,
                Err(SolverError::Undecided) => {
                    self.stats.unknown_at_terminal += 1;
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        debug!("path #{} finished: {outcome:?}", self.stats.paths_completed);
        self.pending.push_back(PathSolution { outcome, solution, constraints, signature });
        Ok(())
    }

    /// Unwinds to the newest choice point and verifies the restoration
    /// invariants. `false` when no choice point remains.
    fn reposition_at_top(&mut self) -> Result<bool> {
        let (trail_mark, constraint_level, frame_depth, pc) = match self.choice_points.last() {
            None => return Ok(false),
            Some(cp) => (cp.trail_mark, cp.constraint_level, cp.frame_depth, cp.pc),
        };
        self.executor.state.unwind_to(trail_mark)?;
        self.solver.pop_to(constraint_level).map_err(solver_fatal)?;
        if self.executor.state.depth() != frame_depth {
            return Err(EngineError::InvariantViolation(format!(
                "backtrack restored frame depth {} but choice point was created at {}",
                self.executor.state.depth(),
                frame_depth
            )));
        }
        if self.solver.constraint_level() != self.choice_points.len() - 1 {
            return Err(EngineError::InvariantViolation(format!(
                "constraint depth {} != parent count {} after backtrack",
                self.solver.constraint_level(),
                self.choice_points.len() - 1
            )));
        }
        self.executor.state.set_pc(pc)?;
        Ok(true)
    }

    /// After a terminal state: backtrack and keep selecting until a path
    /// is running again, recording any immediately-terminal siblings.
    fn resume_after_terminal(&mut self) -> Result<()> {
        loop {
            self.stats.backtracks += 1;
            if !self.reposition_at_top()? {
                return self.end_round();
            }
            match self.select_next_alternative()? {
                SelectOutcome::Running => return Ok(()),
                SelectOutcome::Terminal(outcome) => {
                    self.finish_path(outcome)?;
                }
                SelectOutcome::RoundExhausted => return self.end_round(),
            }
        }
    }

    /// A resource bound was breached: treat the newest choice point as
    /// exhausted and continue with its parent.
    fn abandon_current(&mut self) -> Result<()> {
        self.stats.abandoned_resource += 1;
        self.choice_points.pop();
        self.resume_after_terminal()
    }

    /// The round's tree is exhausted: restart deeper, or finish.
    fn end_round(&mut self) -> Result<()> {
        if self.hit_depth_bound {
            if let Some(previous) = self.depth_bound {
                if let Some(next) = self.strategy.next_depth(previous) {
                    debug!("restarting search with depth bound {next}");
                    self.stats.restarts += 1;
                    self.depth_bound = Some(next);
                    self.hit_depth_bound = false;
                    self.choice_points.clear();
                    self.solver.pop_to(0).map_err(solver_fatal)?;
                    return self.init_state();
                }
            }
        }
        debug!("search space exhausted");
        self.done = true;
        Ok(())
    }
}

impl std::fmt::Debug for Explorer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Explorer")
            .field("strategy", &self.strategy.name())
            .field("choice_points", &self.choice_points.len())
            .field("done", &self.done)
            .finish()
    }
}

fn solver_fatal(e: SolverError) -> EngineError {
    EngineError::InvariantViolation(format!("solver protocol desync: {e}"))
}
