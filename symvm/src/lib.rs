//! A symbolic-execution engine for a stack-based bytecode VM.
//!
//! Methods are interpreted either concretely or symbolically. In
//! symbolic mode a decision on a symbolic value creates a choice point;
//! every reversible mutation past that point lands on a trail, and each
//! traversed choice point pushes one guard onto the solver bridge's
//! constraint stack. Backtracking unwinds the trail to the choice
//! point's mark, pops the constraint stack to its captured level and
//! advances to the next satisfiable alternative. Terminal paths with a
//! satisfiable path condition yield a [`solver::Solution`] for
//! downstream test generation.
//!
//! The three stacks (frames, trail, constraints) evolve in lockstep:
//! the constraint depth always equals the number of live choice points,
//! and a violated correspondence aborts the run instead of exploring
//! from a corrupt state.

pub mod choice;
pub mod coverage;
pub mod exception;
pub mod executor;
pub mod frame;
pub mod generator;
pub mod heap;
pub mod listener;
pub mod project;
pub mod report;
pub mod search;
pub mod solver;
pub mod state;
pub mod term;
pub mod trail;
pub mod vm;

use std::time::Duration;

use bytecode::instruction::Pc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Interpretation mode, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Concrete,
    Symbolic,
}

/// Engine-fatal failures. Recoverable conditions (thrown runtime
/// exceptions, undecidable solver queries, breached resource bounds)
/// never surface here; they become path outcomes or pruned branches.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("project error: {0}")]
    Project(#[from] project::ProjectError),

    #[error("frame error: {0}")]
    Frame(#[from] frame::FrameError),

    #[error("heap error: {0}")]
    Heap(#[from] heap::HeapError),

    #[error("solver error: {0}")]
    Solver(#[from] solver::SolverError),

    #[error("expected {expected} at pc {pc}")]
    TypeMismatch { expected: &'static str, pc: Pc },

    #[error("symbolic value reached a concrete-mode interpreter at pc {pc}")]
    SymbolicInConcreteMode { pc: Pc },

    #[error("constant pool index {0} out of range")]
    BadConstant(u16),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

/// Session configuration, passed by value; no global state.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: ExecutionMode,
    /// Abandon a path once its trail grows beyond this many entries.
    pub max_trail: Option<usize>,
    /// Abandon a path once one backward branch has been taken this many
    /// times on it.
    pub max_loop_iterations: Option<u32>,
    /// Wall-clock budget for the whole search.
    pub time_budget: Option<Duration>,
    /// Budget for a single solver query.
    pub solver_timeout: Duration,
    /// Largest length generated for a symbolic array.
    pub max_symbolic_array_length: u32,
    /// Print each path result as it is found.
    pub show_path_results: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Symbolic,
            max_trail: None,
            max_loop_iterations: None,
            time_budget: None,
            solver_timeout: Duration::from_secs(5),
            max_symbolic_array_length: 3,
            show_path_results: false,
        }
    }
}

pub mod prelude {
    pub use crate::executor::PathOutcome;
    pub use crate::project::Project;
    pub use crate::report::{PathReport, SearchReport};
    pub use crate::search::{
        DepthFirstSearch, IterativeDeepeningSearch, PathSolution, SearchStats, SearchStrategy,
    };
    pub use crate::solver::{Solution, SolutionValue, Solver, SolverError, SolverManager, Verdict};
    pub use crate::vm::VM;
    pub use crate::{EngineError, ExecutionMode, Result, RunConfig};
}
