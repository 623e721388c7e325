//! The bridge between the search and the backing constraint solvers.
//!
//! The manager owns the per-path constraint stack: exactly one entry is
//! pushed for every choice point the search traverses, and entries are
//! removed in strict LIFO correspondence with trail marks. Backends are
//! tried in priority order until one decides; a timeout or an
//! unable-to-decide answer surfaces as [`SolverError::Undecided`], which
//! is a different thing from a proven empty solution set and must never
//! be conflated with it.

pub mod simple;

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use bytecode::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

use crate::listener::{notify_all, QueryKind, QueryOutcome, SolverListener};
use crate::term::{Bindings, Constraint, Sort, SymbolId, SymbolTable, Term};

pub type Result<T> = std::result::Result<T, SolverError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolverError {
    /// The query could not be decided within the budget. Recoverable:
    /// the caller prunes the affected alternative and moves on.
    #[error("solver could not decide within its budget")]
    Undecided,

    /// The bridge was driven outside its protocol. Fatal.
    #[error("solver protocol violation: {0}")]
    Protocol(String),

    /// A backend failed for reasons other than giving up.
    #[error("solver backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Sat,
    Unsat,
}

/// A backing solver. Decides or solves a conjunction of constraints
/// within a deadline.
pub trait Solver: Debug {
    fn name(&self) -> &'static str;

    fn decide(&mut self, system: &[Constraint], deadline: Instant) -> Result<Verdict>;

    /// A satisfying assignment for the numeric symbols of the system,
    /// `None` when the system is proven unsatisfiable.
    fn solve(&mut self, system: &[Constraint], deadline: Instant) -> Result<Option<Bindings>>;
}

/// A concrete value assigned to one symbol in a solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolutionValue {
    Int(i32),
    Long(i64),
    Null,
    /// A fresh instance of the class satisfies the path condition.
    Instance(ClassId),
    /// A fresh array of the given length.
    ArrayOfLength(u32),
}

impl std::fmt::Display for SolutionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolutionValue::Int(v) => write!(f, "{v}"),
            SolutionValue::Long(v) => write!(f, "{v}L"),
            SolutionValue::Null => write!(f, "null"),
            SolutionValue::Instance(c) => write!(f, "new #{}", c.0),
            SolutionValue::ArrayOfLength(n) => write!(f, "array[{n}]"),
        }
    }
}

/// An immutable assignment of concrete values to the session's symbols.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    entries: Vec<(SymbolId, String, SolutionValue)>,
}

impl Solution {
    pub fn get(&self, sym: SymbolId) -> Option<&SolutionValue> {
        self.entries.iter().find(|(s, _, _)| *s == sym).map(|(_, _, v)| v)
    }

    pub fn value_of(&self, name: &str) -> Option<&SolutionValue> {
        self.entries.iter().find(|(_, n, _)| n == name).map(|(_, _, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SymbolId, String, SolutionValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for Solution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> =
            self.entries.iter().map(|(_, n, v)| format!("{n} = {v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Per-path constraint stack plus backend fan-out and solution caching.
///
/// Owned by exactly one exploration session; sharing one across
/// concurrent sessions requires external synchronization.
#[derive(Debug)]
pub struct SolverManager {
    stack: Vec<Constraint>,
    backends: Vec<Box<dyn Solver>>,
    listeners: Vec<Box<dyn SolverListener>>,
    timeout: Duration,
    sat_cache: HashMap<u64, bool>,
    solution_cache: HashMap<u64, Option<Bindings>>,
    queries: u64,
    cache_hits: u64,
}

impl SolverManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stack: Vec::new(),
            backends: vec![Box::new(simple::IntervalSolver::default())],
            listeners: Vec::new(),
            timeout,
            sat_cache: HashMap::new(),
            solution_cache: HashMap::new(),
            queries: 0,
            cache_hits: 0,
        }
    }

    /// Replaces the backend list; backends are tried in the given order.
    pub fn with_backends(mut self, backends: Vec<Box<dyn Solver>>) -> Self {
        self.backends = backends;
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn SolverListener>) {
        self.listeners.push(listener);
    }

    /// Pushes a constraint and returns the composed system.
    pub fn add_constraint(&mut self, constraint: Constraint) -> &[Constraint] {
        trace!("push constraint: {constraint}");
        let level = self.stack.len();
        notify_all(&mut self.listeners, |l| l.constraint_added(&constraint, level));
        self.stack.push(constraint);
        &self.stack
    }

    /// Pops exactly one level, in LIFO correspondence with trail marks.
    pub fn remove_constraint(&mut self) -> Result<()> {
        if self.stack.pop().is_none() {
            return Err(SolverError::Protocol("remove on empty constraint stack".into()));
        }
        let level = self.stack.len();
        notify_all(&mut self.listeners, |l| l.constraint_removed(level));
        Ok(())
    }

    /// Pops down to `level`.
    pub fn pop_to(&mut self, level: usize) -> Result<()> {
        if level > self.stack.len() {
            return Err(SolverError::Protocol(format!(
                "pop to level {level} above current depth {}",
                self.stack.len()
            )));
        }
        while self.stack.len() > level {
            self.remove_constraint()?;
        }
        Ok(())
    }

    pub fn constraint_level(&self) -> usize {
        self.stack.len()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.stack
    }

    /// A stable signature of the current constraint stack. Used for the
    /// solution cache and as the dedup key across deepening restarts.
    pub fn signature(&self) -> u64 {
        signature_of(&self.stack)
    }

    pub fn queries(&self) -> u64 {
        self.queries
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Satisfiability of the current stack.
    pub fn has_solution(&mut self) -> Result<bool> {
        let sig = self.signature();
        if let Some(sat) = self.sat_cache.get(&sig) {
            self.cache_hits += 1;
            return Ok(*sat);
        }
        self.queries += 1;
        notify_all(&mut self.listeners, |l| l.query_started(QueryKind::HasSolution));
        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut outcome = QueryOutcome::Undecided;
        let mut result = Err(SolverError::Undecided);
        for backend in &mut self.backends {
            match backend.decide(&self.stack, deadline) {
                Ok(v) => {
                    outcome = match v {
                        Verdict::Sat => QueryOutcome::Sat,
                        Verdict::Unsat => QueryOutcome::Unsat,
                    };
                    result = Ok(v == Verdict::Sat);
                    break;
                }
                Err(SolverError::Undecided) => {
                    debug!("backend {} undecided, trying next", backend.name());
                }
                Err(e) => return Err(e),
            }
        }
        let elapsed = started.elapsed();
        notify_all(&mut self.listeners, |l| {
            l.query_finished(QueryKind::HasSolution, elapsed, outcome)
        });
        if let Ok(sat) = result {
            self.sat_cache.insert(sig, sat);
        }
        result
    }

    /// A solution for the first non-contradictory system on the stack,
    /// walking from the full conjunction downward. `Ok(None)` is the
    /// proven no-solution sentinel: even the empty prefix yielded
    /// nothing, which cannot happen with a sound backend.
    ///
    /// `primary` is the number of leading symbols (the entry arguments)
    /// reported even when the path condition never mentions them.
    pub fn get_solution(
        &mut self,
        symbols: &SymbolTable,
        primary: usize,
    ) -> Result<Option<Solution>> {
        for prefix in (0..=self.stack.len()).rev() {
            match self.solve_system_cached(prefix)? {
                Some(bindings) => {
                    let system = &self.stack[..prefix];
                    let solution = compose_solution(system, &bindings, symbols, primary);
                    notify_all(&mut self.listeners, |l| l.solution_found(&solution));
                    return Ok(Some(solution));
                }
                None => {
                    trace!("prefix of depth {prefix} contradictory, dropping one level");
                }
            }
        }
        Ok(None)
    }

    fn solve_system_cached(&mut self, prefix: usize) -> Result<Option<Bindings>> {
        let system = &self.stack[..prefix];
        let sig = signature_of(system);
        if let Some(cached) = self.solution_cache.get(&sig) {
            self.cache_hits += 1;
            return Ok(cached.clone());
        }
        self.queries += 1;
        notify_all(&mut self.listeners, |l| l.query_started(QueryKind::GetSolution));
        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut answer: Result<Option<Bindings>> = Err(SolverError::Undecided);
        for backend in &mut self.backends {
            match backend.solve(system, deadline) {
                Ok(solved) => {
                    answer = Ok(solved);
                    break;
                }
                Err(SolverError::Undecided) => {
                    debug!("backend {} undecided, trying next", backend.name());
                }
                Err(e) => return Err(e),
            }
        }
        let elapsed = started.elapsed();
        let outcome = match &answer {
            Ok(Some(_)) => QueryOutcome::Sat,
            Ok(None) => QueryOutcome::Unsat,
            Err(_) => QueryOutcome::Undecided,
        };
        notify_all(&mut self.listeners, |l| {
            l.query_finished(QueryKind::GetSolution, elapsed, outcome)
        });
        if let Ok(bindings) = &answer {
            self.solution_cache.insert(sig, bindings.clone());
            self.sat_cache.insert(sig, bindings.is_some());
        }
        answer
    }

    /// Clears all state for reuse between independent runs. Safe to
    /// call repeatedly.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.sat_cache.clear();
        self.solution_cache.clear();
        self.queries = 0;
        self.cache_hits = 0;
    }
}

fn signature_of(system: &[Constraint]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for constraint in system {
        constraint.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// Builds the user-facing solution: numeric bindings from the backend,
/// reference symbols resolved from the null/non-null atoms of the
/// system, everything else defaulted by sort. Reported symbols are the
/// first `primary` (entry arguments) plus whatever the system mentions.
fn compose_solution(
    system: &[Constraint],
    bindings: &Bindings,
    symbols: &SymbolTable,
    primary: usize,
) -> Solution {
    let mut null_atoms: BTreeMap<SymbolId, bool> = BTreeMap::new();
    let mut mentioned = std::collections::BTreeSet::new();
    for constraint in system {
        collect_ref_atoms(constraint, &mut null_atoms);
        constraint.symbols_into(&mut mentioned);
    }

    let mut entries = Vec::with_capacity(symbols.len());
    for (sym, info) in symbols.iter() {
        // Length symbols surface through their array's entry.
        if info.length_of.is_some() {
            continue;
        }
        if (sym.0 as usize) >= primary && !mentioned.contains(&sym) {
            continue;
        }
        let value = match &info.sort {
            Sort::Int => match bindings.get(&sym) {
                Some(Value::Int(v)) => SolutionValue::Int(*v),
                _ => SolutionValue::Int(0),
            },
            Sort::Long => match bindings.get(&sym) {
                Some(Value::Long(v)) => SolutionValue::Long(*v),
                _ => SolutionValue::Long(0),
            },
            Sort::Ref(ref_type) => match null_atoms.get(&sym) {
                Some(true) | None => SolutionValue::Null,
                Some(false) => match ref_type {
                    RefType::Class(c) => SolutionValue::Instance(*c),
                    RefType::Array(_) => {
                        let len = symbols
                            .iter()
                            .find(|(_, i)| i.length_of == Some(sym))
                            .and_then(|(len_sym, _)| bindings.get(&len_sym))
                            .and_then(|v| match v {
                                Value::Int(v) if *v >= 0 => Some(*v as u32),
                                _ => None,
                            })
                            .unwrap_or(0);
                        SolutionValue::ArrayOfLength(len)
                    }
                },
            },
        };
        entries.push((sym, info.name.clone(), value));
    }
    Solution { entries }
}

fn collect_ref_atoms(constraint: &Constraint, out: &mut BTreeMap<SymbolId, bool>) {
    match constraint {
        Constraint::IsNull(Term::Sym(s)) => {
            out.insert(*s, true);
        }
        Constraint::NonNull(Term::Sym(s)) => {
            out.insert(*s, false);
        }
        Constraint::And(cs) => {
            for c in cs {
                collect_ref_atoms(c, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Sort;

    fn manager() -> SolverManager {
        SolverManager::new(Duration::from_secs(5))
    }

    fn gt_zero(sym: SymbolId) -> Constraint {
        Constraint::cmp(CmpCond::Gt, NumericType::Int, Term::Sym(sym), Term::int(0))
    }

    fn le_zero(sym: SymbolId) -> Constraint {
        Constraint::cmp(CmpCond::Le, NumericType::Int, Term::Sym(sym), Term::int(0))
    }

    #[test]
    fn stack_is_lifo_and_level_tracks_depth() {
        let mut m = manager();
        assert_eq!(m.constraint_level(), 0);
        m.add_constraint(Constraint::True);
        m.add_constraint(Constraint::True);
        assert_eq!(m.constraint_level(), 2);
        m.remove_constraint().unwrap();
        assert_eq!(m.constraint_level(), 1);
        m.pop_to(0).unwrap();
        assert!(matches!(m.remove_constraint(), Err(SolverError::Protocol(_))));
    }

    #[test]
    fn satisfiable_and_contradictory_stacks() {
        let mut symbols = SymbolTable::new();
        let x = symbols.fresh("x", Sort::Int);
        let mut m = manager();
        m.add_constraint(gt_zero(x));
        assert!(m.has_solution().unwrap());

        m.add_constraint(le_zero(x));
        assert!(!m.has_solution().unwrap());
    }

    #[test]
    fn get_solution_walks_down_to_a_consistent_prefix() {
        let mut symbols = SymbolTable::new();
        let x = symbols.fresh("x", Sort::Int);
        let mut m = manager();
        m.add_constraint(gt_zero(x));
        m.add_constraint(le_zero(x));

        // The full system is contradictory; the depth-1 prefix is not.
        let solution = m.get_solution(&symbols, symbols.len()).unwrap().unwrap();
        assert_eq!(solution.value_of("x"), Some(&SolutionValue::Int(1)));
    }

    #[test]
    fn repeated_queries_hit_the_cache() {
        let mut symbols = SymbolTable::new();
        let x = symbols.fresh("x", Sort::Int);
        let mut m = manager();
        m.add_constraint(gt_zero(x));
        assert!(m.has_solution().unwrap());
        let queries = m.queries();
        assert!(m.has_solution().unwrap());
        assert_eq!(m.queries(), queries);
        assert!(m.cache_hits() > 0);
        let _ = symbols;
    }

    #[test]
    fn reset_is_idempotent() {
        let mut m = manager();
        m.add_constraint(Constraint::True);
        m.reset();
        let level_after_one = m.constraint_level();
        let queries_after_one = m.queries();
        m.reset();
        assert_eq!(m.constraint_level(), level_after_one);
        assert_eq!(m.queries(), queries_after_one);
        assert_eq!(m.constraint_level(), 0);
    }

    #[test]
    fn ref_atoms_surface_in_the_solution() {
        let mut symbols = SymbolTable::new();
        let p = symbols.fresh("p", Sort::Ref(RefType::Class(ClassId(7))));
        let mut m = manager();
        m.add_constraint(Constraint::NonNull(Term::Sym(p)));
        let solution = m.get_solution(&symbols, symbols.len()).unwrap().unwrap();
        assert_eq!(solution.get(p), Some(&SolutionValue::Instance(ClassId(7))));
    }
}
