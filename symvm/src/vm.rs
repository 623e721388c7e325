//! Describes the VM driving one exploration session.
//!
//! The VM is the facade callers hold: it assembles the session
//! (explorer, solver bridge, strategies) over a sealed project and
//! streams one terminal path result per [`VM::run`] call, the way a
//! caller loops `while let Some(result) = vm.run()?`.

use std::time::Instant;

use bytecode::prelude::*;
use tracing::debug;

use crate::coverage::{CoverageSink, NullCoverage};
use crate::generator::{AscendingLengths, LengthStrategy, RefStrategy, SymbolicContents};
use crate::listener::{LogListener, SolverListener};
use crate::project::Project;
use crate::report::SearchReport;
use crate::search::{
    DepthFirstSearch, Explorer, PathSolution, SearchStats, SearchStrategy,
};
use crate::solver::SolverManager;
use crate::{Result, RunConfig};

#[derive(Debug)]
pub struct VM<'p> {
    explorer: Explorer<'p>,
    show_path_results: bool,
    path_num: usize,
}

impl<'p> VM<'p> {
    /// A symbolic session over `entry` with depth-first search and the
    /// default solver stack.
    pub fn new(project: &'p Project, entry: &str, config: RunConfig) -> Result<Self> {
        let solver = default_solver(&config);
        Self::with_parts(
            project,
            entry,
            None,
            config,
            Box::new(DepthFirstSearch::default()),
            solver,
            Box::new(NullCoverage),
            Box::new(AscendingLengths),
            Box::new(SymbolicContents),
        )
    }

    /// A concrete session: one path, driven by the given arguments.
    pub fn new_concrete(
        project: &'p Project,
        entry: &str,
        args: Vec<Value>,
        mut config: RunConfig,
    ) -> Result<Self> {
        config.mode = crate::ExecutionMode::Concrete;
        let solver = default_solver(&config);
        Self::with_parts(
            project,
            entry,
            Some(args),
            config,
            Box::new(DepthFirstSearch::default()),
            solver,
            Box::new(NullCoverage),
            Box::new(AscendingLengths),
            Box::new(SymbolicContents),
        )
    }

    /// Full assembly, for callers that inject their own strategy,
    /// solver stack, coverage sink or generators.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        project: &'p Project,
        entry: &str,
        args: Option<Vec<Value>>,
        config: RunConfig,
        strategy: Box<dyn SearchStrategy>,
        solver: SolverManager,
        coverage: Box<dyn CoverageSink>,
        lengths: Box<dyn LengthStrategy>,
        refs: Box<dyn RefStrategy>,
    ) -> Result<Self> {
        project.seal()?;
        let entry_id = project.method_by_name(entry)?;
        debug!("starting session on {entry} with {}", strategy.name());
        let show_path_results = config.show_path_results;
        let explorer = Explorer::new(
            project, entry_id, args, config, strategy, solver, coverage, lengths, refs,
        )?;
        Ok(Self { explorer, show_path_results, path_num: 0 })
    }

    pub fn add_listener(&mut self, listener: Box<dyn SolverListener>) {
        self.explorer.add_listener(listener);
    }

    /// Runs until the next terminal path. `None` once the search space
    /// is exhausted or a configured budget ended the search.
    pub fn run(&mut self) -> Result<Option<PathSolution>> {
        match self.explorer.next_path()? {
            Some(result) => {
                self.path_num += 1;
                if self.show_path_results {
                    println!("{}", crate::report::PathReport::new(self.path_num, &result));
                }
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Drains the search and returns every retained result with the
    /// session statistics.
    pub fn run_to_end(&mut self) -> Result<SearchReport> {
        let start = Instant::now();
        let mut results = Vec::new();
        while let Some(result) = self.run()? {
            results.push(result);
        }
        let report = SearchReport {
            results,
            stats: self.stats().clone(),
            elapsed: start.elapsed(),
        };
        if self.show_path_results {
            println!("time: {:?}", report.elapsed);
        }
        Ok(report)
    }

    /// Returns the session to its initial state. Idempotent; partial
    /// results already handed out stay valid.
    pub fn reset(&mut self) -> Result<()> {
        self.path_num = 0;
        self.explorer.reset()
    }

    pub fn stats(&self) -> &SearchStats {
        self.explorer.stats()
    }

    pub fn instruction_count(&self) -> u64 {
        self.explorer.instruction_count()
    }
}

fn default_solver(config: &RunConfig) -> SolverManager {
    let mut solver = SolverManager::new(config.solver_timeout);
    solver.add_listener(Box::new(LogListener));
    solver
}
