//! Fire-and-forget observers of solver activity.
//!
//! Listeners exist for statistics and logging only: they must not
//! influence control flow, and a panicking listener must not take the
//! search down with it. Every callback is therefore isolated with
//! `catch_unwind` and failures degrade to a warning.

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::{debug, warn};

use crate::solver::Solution;
use crate::term::Constraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    HasSolution,
    GetSolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Sat,
    Unsat,
    Undecided,
}

/// Lifecycle events of the solver bridge. All methods default to no-ops
/// so implementors subscribe to what they need.
pub trait SolverListener: Debug {
    fn constraint_added(&mut self, _constraint: &Constraint, _level: usize) {}

    fn constraint_removed(&mut self, _level: usize) {}

    fn query_started(&mut self, _kind: QueryKind) {}

    fn query_finished(&mut self, _kind: QueryKind, _elapsed: Duration, _outcome: QueryOutcome) {}

    fn solution_found(&mut self, _solution: &Solution) {}
}

/// Runs one callback on every listener, isolating panics.
pub(crate) fn notify_all<F>(listeners: &mut [Box<dyn SolverListener>], mut f: F)
where
    F: FnMut(&mut dyn SolverListener),
{
    for listener in listeners.iter_mut() {
        let outcome = catch_unwind(AssertUnwindSafe(|| f(listener.as_mut())));
        if outcome.is_err() {
            warn!("solver listener panicked; event dropped");
        }
    }
}

/// Logs solver lifecycle events at debug level.
#[derive(Debug, Default)]
pub struct LogListener;

impl SolverListener for LogListener {
    fn constraint_added(&mut self, constraint: &Constraint, level: usize) {
        debug!("constraint +{level}: {constraint}");
    }

    fn constraint_removed(&mut self, level: usize) {
        debug!("constraint -{level}");
    }

    fn query_finished(&mut self, kind: QueryKind, elapsed: Duration, outcome: QueryOutcome) {
        debug!("solver {kind:?} -> {outcome:?} in {elapsed:?}");
    }

    fn solution_found(&mut self, solution: &Solution) {
        debug!("solution: {solution}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Panicky;

    impl SolverListener for Panicky {
        fn constraint_removed(&mut self, _level: usize) {
            panic!("listener bug");
        }
    }

    #[derive(Debug, Default)]
    struct Counting {
        removed: usize,
    }

    impl SolverListener for Counting {
        fn constraint_removed(&mut self, _level: usize) {
            self.removed += 1;
        }
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_others() {
        let mut listeners: Vec<Box<dyn SolverListener>> =
            vec![Box::new(Panicky), Box::new(Counting::default())];
        notify_all(&mut listeners, |l| l.constraint_removed(0));
        notify_all(&mut listeners, |l| l.constraint_removed(0));
        // The panicking listener ran first both times and neither call
        // reached this point via unwinding.
    }
}
