//! Human-readable rendering of path results and search summaries.

use std::fmt::{self, Display, Write};
use std::time::Duration;

use colored::Colorize;
use indenter::indented;

use crate::executor::PathOutcome;
use crate::search::{PathSolution, SearchStats};

/// One terminal path, numbered for display.
pub struct PathReport<'a> {
    index: usize,
    result: &'a PathSolution,
}

impl<'a> PathReport<'a> {
    pub fn new(index: usize, result: &'a PathSolution) -> Self {
        Self { index, result }
    }
}

impl Display for PathReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match &self.result.outcome {
            PathOutcome::Returned(Some(value)) => {
                format!("returned {value}").green()
            }
            PathOutcome::Returned(None) => "returned".green(),
            PathOutcome::Uncaught { name, .. } => {
                format!("uncaught exception {name}").red()
            }
        };
        writeln!(f, "Path {}: {headline}", self.index)?;

        if !self.result.constraints.is_empty() {
            writeln!(f, "{}", "conditions:".bold())?;
            let mut out = indented(f).with_str("    ");
            for (i, constraint) in self.result.constraints.iter().enumerate() {
                writeln!(out, "{i} -> {constraint}")?;
            }
        }
        match &self.result.solution {
            Some(solution) => writeln!(f, "input: {solution}"),
            None => writeln!(f, "input: {}", "none recorded".yellow()),
        }
    }
}

/// Everything a finished search produced.
#[derive(Debug)]
pub struct SearchReport {
    pub results: Vec<PathSolution>,
    pub stats: SearchStats,
    pub elapsed: Duration,
}

impl SearchReport {
    /// The results that carry a concrete solution.
    pub fn solutions(&self) -> impl Iterator<Item = &PathSolution> {
        self.results.iter().filter(|r| r.solution.is_some())
    }
}

impl Display for SearchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, result) in self.results.iter().enumerate() {
            writeln!(f, "{}", PathReport::new(i + 1, result))?;
        }
        let s = &self.stats;
        writeln!(f, "{}", "summary:".bold())?;
        let mut out = indented(f).with_str("    ");
        writeln!(out, "paths completed:  {}", s.paths_completed)?;
        writeln!(out, "solutions found:  {}", s.solutions_found)?;
        writeln!(out, "choice points:    {}", s.choice_points)?;
        writeln!(out, "backtracks:       {}", s.backtracks)?;
        writeln!(out, "pruned (unsat):   {}", s.pruned_unsat)?;
        writeln!(out, "pruned (unknown): {}", s.pruned_unknown)?;
        writeln!(out, "abandoned:        {}", s.abandoned_resource)?;
        writeln!(out, "restarts:         {}", s.restarts)?;
        write!(f, "time: {:?}", self.elapsed)
    }
}
