//! End-to-end exploration scenarios driven through the public API.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use bytecode::instruction::{CmpCond, Instruction as I};
use bytecode::prelude::*;

use symvm::coverage::{CoverageSink, EdgeCoverage, NullCoverage};
use symvm::executor::PathOutcome;
use symvm::generator::{AscendingLengths, SymbolicContents};
use symvm::prelude::*;
use symvm::solver::simple::IntervalSolver;
use symvm::term::{Bindings, Term};

fn method(
    name: &str,
    params: Vec<Type>,
    ret: Option<Type>,
    max_locals: u16,
    max_stack: u16,
    code: Vec<I>,
    handlers: Vec<ExceptionEntry>,
) -> Method {
    Method { name: name.to_owned(), params, ret, max_locals, max_stack, code, handlers }
}

fn returned_int(result: &PathSolution) -> Option<i32> {
    match &result.outcome {
        PathOutcome::Returned(Some(Term::Value(Value::Int(v)))) => Some(*v),
        _ => None,
    }
}

fn solution_int(result: &PathSolution, name: &str) -> Option<i32> {
    match result.solution.as_ref()?.value_of(name)? {
        SolutionValue::Int(v) => Some(*v),
        _ => None,
    }
}

/// `if (x > 0) return 1; else return -1;`
fn sign_project() -> Project {
    let mut project = Project::new();
    project
        .add_method(method(
            "sign",
            vec![Type::INT],
            Some(Type::INT),
            1,
            2,
            vec![
                I::Load(0),
                I::If { cond: CmpCond::Gt, target: 4 },
                I::Const(Value::Int(-1)),
                I::Return { void: false },
                I::Const(Value::Int(1)),
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();
    project
}

#[test]
fn binary_branch_yields_two_leaves() {
    let project = sign_project();
    let mut vm = VM::new(&project, "sign", RunConfig::default()).unwrap();
    let report = vm.run_to_end().unwrap();

    assert_eq!(report.results.len(), 2);

    // Taken branch first: x > 0 returns 1.
    let first = &report.results[0];
    assert_eq!(returned_int(first), Some(1));
    assert_eq!(first.constraints.len(), 1, "constraint depth 1 at the leaf");
    let x = solution_int(first, "arg0").unwrap();
    assert!(x > 0);

    let second = &report.results[1];
    assert_eq!(returned_int(second), Some(-1));
    assert_eq!(second.constraints.len(), 1);
    let x = solution_int(second, "arg0").unwrap();
    assert!(x <= 0);

    assert_eq!(vm.stats().choice_points, 1);
    assert_eq!(vm.stats().paths_completed, 2);
}

#[test]
fn switch_explores_keys_ascending_then_default() {
    let mut project = Project::new();
    project
        .add_method(method(
            "pick",
            vec![Type::INT],
            Some(Type::INT),
            1,
            2,
            vec![
                I::Load(0),
                I::Switch { cases: vec![(1, 2), (2, 4)], default: 6 },
                I::Const(Value::Int(10)),
                I::Return { void: false },
                I::Const(Value::Int(20)),
                I::Return { void: false },
                I::Const(Value::Int(30)),
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();

    let mut vm = VM::new(&project, "pick", RunConfig::default()).unwrap();
    let report = vm.run_to_end().unwrap();

    let returns: Vec<i32> = report.results.iter().filter_map(returned_int).collect();
    assert_eq!(returns, vec![10, 20, 30], "key 1, key 2, then default");

    assert_eq!(solution_int(&report.results[0], "arg0"), Some(1));
    assert_eq!(solution_int(&report.results[1], "arg0"), Some(2));
    let fallthrough = solution_int(&report.results[2], "arg0").unwrap();
    assert!(fallthrough != 1 && fallthrough != 2);
}

/// Two nested symbolic conditionals; leaves are numbered by branch.
fn nested_project() -> Project {
    let mut project = Project::new();
    project
        .add_method(method(
            "nested",
            vec![Type::INT, Type::INT],
            Some(Type::INT),
            2,
            2,
            vec![
                I::Load(0),
                I::If { cond: CmpCond::Gt, target: 8 },
                I::Load(1),
                I::If { cond: CmpCond::Gt, target: 6 },
                I::Const(Value::Int(0)),
                I::Return { void: false },
                I::Const(Value::Int(1)),
                I::Return { void: false },
                I::Load(1),
                I::If { cond: CmpCond::Gt, target: 12 },
                I::Const(Value::Int(2)),
                I::Return { void: false },
                I::Const(Value::Int(3)),
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();
    project
}

#[test]
fn nested_conditionals_explore_four_leaves_at_depth_two() {
    let project = nested_project();
    let mut vm = VM::new(&project, "nested", RunConfig::default()).unwrap();
    let report = vm.run_to_end().unwrap();

    let returns: Vec<i32> = report.results.iter().filter_map(returned_int).collect();
    assert_eq!(returns, vec![3, 2, 1, 0], "taken-first order on both levels");
    for result in &report.results {
        assert_eq!(result.constraints.len(), 2, "two choice points per leaf");
    }
    // One outer decision plus one inner decision per outer branch.
    assert_eq!(vm.stats().choice_points, 3);
    assert_eq!(vm.stats().paths_completed, 4);
}

/// A backend that refuses to decide any system whose newest constraint
/// renders as `poison`, standing in for a solver timeout on exactly one
/// alternative.
#[derive(Debug)]
struct FlakyBackend {
    inner: IntervalSolver,
    poison: String,
}

impl Solver for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn decide(
        &mut self,
        system: &[symvm::term::Constraint],
        deadline: Instant,
    ) -> std::result::Result<Verdict, SolverError> {
        if system.last().map(|c| c.to_string()) == Some(self.poison.clone()) {
            return Err(SolverError::Undecided);
        }
        self.inner.decide(system, deadline)
    }

    fn solve(
        &mut self,
        system: &[symvm::term::Constraint],
        deadline: Instant,
    ) -> std::result::Result<Option<Bindings>, SolverError> {
        self.inner.solve(system, deadline)
    }
}

#[test]
fn timed_out_alternative_is_pruned_and_sibling_survives() {
    let project = sign_project();
    let config = RunConfig::default();
    // The guard of the taken branch renders as `$0 > 0`.
    let solver = SolverManager::new(config.solver_timeout).with_backends(vec![Box::new(
        FlakyBackend { inner: IntervalSolver::default(), poison: "$0 > 0".to_owned() },
    )]);
    let mut vm = VM::with_parts(
        &project,
        "sign",
        None,
        config,
        Box::new(DepthFirstSearch::default()),
        solver,
        Box::new(NullCoverage),
        Box::new(AscendingLengths),
        Box::new(SymbolicContents),
    )
    .unwrap();

    let report = vm.run_to_end().unwrap();
    let returns: Vec<i32> = report.results.iter().filter_map(returned_int).collect();
    assert_eq!(returns, vec![-1], "only the fall-through sibling completed");
    assert_eq!(vm.stats().pruned_unknown, 1);
    assert_eq!(vm.stats().pruned_unsat, 0);
}

#[test]
fn nullable_dereference_forks_into_handled_and_normal_paths() {
    let mut project = Project::new();
    let npe = project.builtin.null_pointer;
    let point = project.add_class(ClassDef::new("P", None).with_field("x", Type::INT)).unwrap();
    project
        .add_method(method(
            "read",
            vec![Type::class(point)],
            Some(Type::INT),
            1,
            3,
            vec![
                I::Load(0),
                I::GetField(FieldRef { class: point, field: 0 }),
                I::Return { void: false },
                I::Const(Value::Int(-1)),
                I::Return { void: false },
            ],
            vec![ExceptionEntry { start_pc: 0, end_pc: 3, handler_pc: 3, catch_type: Some(npe) }],
        ))
        .unwrap();

    let mut vm = VM::new(&project, "read", RunConfig::default()).unwrap();
    let report = vm.run_to_end().unwrap();

    assert_eq!(report.results.len(), 2);

    // Null first: the NPE is caught and the handler returns -1.
    let null_path = &report.results[0];
    assert_eq!(returned_int(null_path), Some(-1));
    assert_eq!(
        null_path.solution.as_ref().unwrap().value_of("arg0"),
        Some(&SolutionValue::Null)
    );

    let object_path = &report.results[1];
    assert!(matches!(object_path.outcome, PathOutcome::Returned(Some(Term::Sym(_)))));
    assert_eq!(
        object_path.solution.as_ref().unwrap().value_of("arg0"),
        Some(&SolutionValue::Instance(point))
    );

    assert_eq!(vm.stats().choice_points, 1);
}

#[test]
fn symbolic_divisor_forks_into_quotient_and_arithmetic_exception() {
    let mut project = Project::new();
    project
        .add_method(method(
            "divide",
            vec![Type::INT],
            Some(Type::INT),
            1,
            2,
            vec![
                I::Const(Value::Int(10)),
                I::Load(0),
                I::Arith { op: ArithOp::Div, ty: NumericType::Int },
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();

    let mut vm = VM::new(&project, "divide", RunConfig::default()).unwrap();
    let report = vm.run_to_end().unwrap();

    assert_eq!(report.results.len(), 2);
    assert!(matches!(report.results[0].outcome, PathOutcome::Returned(Some(_))));
    let divisor = solution_int(&report.results[0], "arg0").unwrap();
    assert_ne!(divisor, 0);

    match &report.results[1].outcome {
        PathOutcome::Uncaught { name, .. } => assert_eq!(name, "ArithmeticException"),
        other => panic!("expected an uncaught arithmetic exception, got {other:?}"),
    }
    assert_eq!(solution_int(&report.results[1], "arg0"), Some(0));
}

#[derive(Debug, Clone)]
struct SharedCoverage(Rc<RefCell<EdgeCoverage>>);

impl CoverageSink for SharedCoverage {
    fn edge(&mut self, method: MethodId, from: Pc, to: Pc) {
        self.0.borrow_mut().edge(method, from, to);
    }

    fn exception_unwind(&mut self, method: MethodId, from: Pc, handler: Option<Pc>) {
        self.0.borrow_mut().exception_unwind(method, from, handler);
    }

    fn path_end(&mut self, outcome: &PathOutcome) {
        self.0.borrow_mut().path_end(outcome);
    }
}

#[test]
fn unsat_branch_is_never_dispatched() {
    let mut project = Project::new();
    // if (x > 0) { if (x < 0) return 99; return 1; } return 0;
    let entry = project
        .add_method(method(
            "contradiction",
            vec![Type::INT],
            Some(Type::INT),
            1,
            2,
            vec![
                I::Load(0),
                I::If { cond: CmpCond::Gt, target: 4 },
                I::Const(Value::Int(0)),
                I::Return { void: false },
                I::Load(0),
                I::If { cond: CmpCond::Lt, target: 8 },
                I::Const(Value::Int(1)),
                I::Return { void: false },
                I::Const(Value::Int(99)),
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();

    let coverage = Rc::new(RefCell::new(EdgeCoverage::new()));
    let config = RunConfig::default();
    let solver = SolverManager::new(config.solver_timeout);
    let mut vm = VM::with_parts(
        &project,
        "contradiction",
        None,
        config,
        Box::new(DepthFirstSearch::default()),
        solver,
        Box::new(SharedCoverage(coverage.clone())),
        Box::new(AscendingLengths),
        Box::new(SymbolicContents),
    )
    .unwrap();

    let report = vm.run_to_end().unwrap();
    let returns: Vec<i32> = report.results.iter().filter_map(returned_int).collect();
    assert_eq!(returns, vec![1, 0]);
    assert_eq!(vm.stats().pruned_unsat, 1, "the x < 0 alternative was pruned");
    assert_eq!(
        coverage.borrow().count(entry, 5, 8),
        0,
        "no instruction under the unsat branch was ever dispatched"
    );
}

#[test]
fn identical_runs_visit_alternatives_in_the_same_order() {
    let collect = || {
        let project = nested_project();
        let mut vm = VM::new(&project, "nested", RunConfig::default()).unwrap();
        let report = vm.run_to_end().unwrap();
        report
            .results
            .iter()
            .map(|r| {
                (
                    returned_int(r),
                    solution_int(r, "arg0"),
                    solution_int(r, "arg1"),
                    r.signature,
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(collect(), collect());
}

#[test]
fn loop_bound_abandons_paths_and_search_terminates() {
    let mut project = Project::new();
    // while (x != 0) x = x - 1; return 0;
    project
        .add_method(method(
            "countdown",
            vec![Type::INT],
            Some(Type::INT),
            1,
            2,
            vec![
                I::Load(0),
                I::If { cond: CmpCond::Eq, target: 7 },
                I::Load(0),
                I::Const(Value::Int(1)),
                I::Arith { op: ArithOp::Sub, ty: NumericType::Int },
                I::Store(0),
                I::Goto(0),
                I::Const(Value::Int(0)),
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();

    let config = RunConfig { max_loop_iterations: Some(3), ..RunConfig::default() };
    let mut vm = VM::new(&project, "countdown", config).unwrap();
    let report = vm.run_to_end().unwrap();

    assert!(vm.stats().abandoned_resource >= 1, "the symbolic loop was cut off");
    assert!(!report.results.is_empty());
    // The exits that were reached correspond to x = 0, 1, 2, ...
    assert_eq!(solution_int(&report.results[0], "arg0"), Some(0));
}

#[test]
fn iterative_deepening_accumulates_without_duplicates() {
    let mut project = Project::new();
    // if (x > 0) { if (y > 0) return 2; return 1; } return 0;
    project
        .add_method(method(
            "staged",
            vec![Type::INT, Type::INT],
            Some(Type::INT),
            2,
            2,
            vec![
                I::Load(0),
                I::If { cond: CmpCond::Gt, target: 4 },
                I::Const(Value::Int(0)),
                I::Return { void: false },
                I::Load(1),
                I::If { cond: CmpCond::Gt, target: 8 },
                I::Const(Value::Int(1)),
                I::Return { void: false },
                I::Const(Value::Int(2)),
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();

    let config = RunConfig::default();
    let solver = SolverManager::new(config.solver_timeout);
    let mut vm = VM::with_parts(
        &project,
        "staged",
        None,
        config,
        Box::new(IterativeDeepeningSearch { initial: 1, step: 1, max_depth: None }),
        solver,
        Box::new(NullCoverage),
        Box::new(AscendingLengths),
        Box::new(SymbolicContents),
    )
    .unwrap();

    let report = vm.run_to_end().unwrap();
    let mut returns: Vec<i32> = report.results.iter().filter_map(returned_int).collect();
    returns.sort_unstable();
    assert_eq!(returns, vec![0, 1, 2], "all leaves found across rounds, none twice");
    assert!(vm.stats().restarts >= 1);
    assert!(vm.stats().duplicate_solutions >= 1, "the shallow leaf was re-derived and dropped");

    let mut signatures: Vec<u64> = report.results.iter().map(|r| r.signature).collect();
    signatures.sort_unstable();
    signatures.dedup();
    assert_eq!(signatures.len(), report.results.len());
}

#[test]
fn exception_unwinds_recursion_into_the_callers_handler() {
    let mut project = Project::new();
    let throwable = project.builtin.throwable;
    // rec(d): if (d > 0) rec(d - 1); else throw new Throwable();
    let rec = project
        .add_method(method(
            "rec",
            vec![Type::INT],
            None,
            1,
            2,
            vec![
                I::Load(0),
                I::If { cond: CmpCond::Gt, target: 4 },
                I::New(throwable),
                I::Throw,
                I::Load(0),
                I::Const(Value::Int(1)),
                I::Arith { op: ArithOp::Sub, ty: NumericType::Int },
                I::Invoke(MethodId(0)),
                I::Return { void: true },
            ],
            vec![],
        ))
        .unwrap();
    assert_eq!(rec, MethodId(0));
    project
        .add_method(method(
            "main",
            vec![],
            Some(Type::INT),
            0,
            2,
            vec![
                I::Const(Value::Int(2)),
                I::Invoke(rec),
                I::Const(Value::Int(0)),
                I::Return { void: false },
                I::Const(Value::Int(-1)),
                I::Return { void: false },
            ],
            vec![ExceptionEntry {
                start_pc: 1,
                end_pc: 2,
                handler_pc: 4,
                catch_type: Some(throwable),
            }],
        ))
        .unwrap();
    let main = project.method_by_name("main").unwrap();

    let coverage = Rc::new(RefCell::new(EdgeCoverage::new()));
    let config = RunConfig::default();
    let solver = SolverManager::new(config.solver_timeout);
    let mut vm = VM::with_parts(
        &project,
        "main",
        None,
        config,
        Box::new(DepthFirstSearch::default()),
        solver,
        Box::new(SharedCoverage(coverage.clone())),
        Box::new(AscendingLengths),
        Box::new(SymbolicContents),
    )
    .unwrap();

    let report = vm.run_to_end().unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(returned_int(&report.results[0]), Some(-1));
    // The handler edge leaves the call site in main, not some pc left
    // behind by the recursive activations.
    assert_eq!(coverage.borrow().count(main, 1, 4), 1);
}

#[test]
fn reset_is_idempotent_and_runs_are_repeatable() {
    let project = sign_project();
    let mut vm = VM::new(&project, "sign", RunConfig::default()).unwrap();
    let first = vm.run_to_end().unwrap();

    vm.reset().unwrap();
    vm.reset().unwrap();
    let second = vm.run_to_end().unwrap();

    assert_eq!(first.results.len(), second.results.len());
    for (a, b) in first.results.iter().zip(&second.results) {
        assert_eq!(a.signature, b.signature);
        assert_eq!(returned_int(a), returned_int(b));
    }
}

#[test]
fn concrete_mode_executes_one_path_without_solver_involvement() {
    let project = sign_project();
    let mut vm =
        VM::new_concrete(&project, "sign", vec![Value::Int(5)], RunConfig::default()).unwrap();
    let report = vm.run_to_end().unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(returned_int(&report.results[0]), Some(1));
    assert!(report.results[0].solution.is_none());
    assert!(report.results[0].constraints.is_empty());
    assert_eq!(vm.stats().choice_points, 0);
}

#[test]
fn symbolic_array_length_and_bounds_fork() {
    let mut project = Project::new();
    // return a[0];  -- a is a symbolic int array parameter.
    project
        .add_method(method(
            "head",
            vec![Type::array_of(Type::INT)],
            Some(Type::INT),
            1,
            2,
            vec![
                I::Load(0),
                I::Const(Value::Int(0)),
                I::ArrayLoad,
                I::Return { void: false },
            ],
            vec![],
        ))
        .unwrap();

    let config = RunConfig { max_symbolic_array_length: 2, ..RunConfig::default() };
    let mut vm = VM::new(&project, "head", config).unwrap();
    let report = vm.run_to_end().unwrap();

    // null -> NPE; length 0 -> out of bounds; lengths 1 and 2 -> a value.
    assert_eq!(report.results.len(), 4);
    assert!(matches!(
        &report.results[0].outcome,
        PathOutcome::Uncaught { name, .. } if name == "NullPointerException"
    ));
    assert!(matches!(
        &report.results[1].outcome,
        PathOutcome::Uncaught { name, .. } if name == "IndexOutOfBoundsException"
    ));
    assert!(matches!(&report.results[2].outcome, PathOutcome::Returned(Some(_))));
    assert!(matches!(&report.results[3].outcome, PathOutcome::Returned(Some(_))));

    let lengths: Vec<Option<&SolutionValue>> = report
        .results
        .iter()
        .map(|r| r.solution.as_ref().and_then(|s| s.value_of("arg0")))
        .collect();
    assert_eq!(lengths[0], Some(&SolutionValue::Null));
    assert_eq!(lengths[1], Some(&SolutionValue::ArrayOfLength(0)));
    assert_eq!(lengths[2], Some(&SolutionValue::ArrayOfLength(1)));
    assert_eq!(lengths[3], Some(&SolutionValue::ArrayOfLength(2)));
}
