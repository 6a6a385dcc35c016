mod common;

use common::{registry, trial_name, FLOOR, SOLVERS};
use ob_cache::CacheMode;
use ob_engine::{
    run_benchmark, BenchmarkConfig, CancelToken, ParallelConfig, ProgressEvent, ResultTable,
};
use ob_search::TrialFilters;
use ob_types::{BenchError, ConfigError, TrialStatus};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn config(cache_dir: &Path) -> BenchmarkConfig {
    BenchmarkConfig::new().with_max_runs(100).with_cache_dir(cache_dir)
}

fn run(config: &BenchmarkConfig, runs: &Arc<AtomicUsize>) -> ResultTable {
    run_benchmark(
        Arc::new(registry(Arc::clone(runs))),
        config,
        None,
        CancelToken::new(),
    )
    .unwrap()
}

fn status(table: &ResultTable, solver: &str) -> TrialStatus {
    table.outcome(&trial_name(solver)).unwrap().status
}

fn assert_expected_statuses(table: &ResultTable) {
    assert_eq!(status(table, "halving"), TrialStatus::Done);
    assert_eq!(status(table, "stepper"), TrialStatus::Done);
    assert_eq!(status(table, "once"), TrialStatus::Done);
    assert_eq!(status(table, "diverging"), TrialStatus::Diverged);
    assert_eq!(status(table, "boom"), TrialStatus::Error);
    assert_eq!(status(table, "picky"), TrialStatus::Skipped);
}

#[test]
fn sequential_run_reports_every_trial_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let table = run(&config(dir.path()), &runs);

    let names: Vec<String> = table.outcomes().iter().map(|o| o.name.clone()).collect();
    let expected: Vec<String> = SOLVERS.iter().map(|s| trial_name(s)).collect();
    assert_eq!(names, expected);
    assert_expected_statuses(&table);

    let halving = table.outcome(&trial_name("halving")).unwrap();
    assert!(halving.curve.is_finalized());
    assert_eq!(halving.final_value(), Some(FLOOR));
    assert!(halving.curve.len() > 3);

    let once = table.outcome(&trial_name("once")).unwrap();
    assert_eq!(once.curve.len(), 1);

    let boom = table.outcome(&trial_name("boom")).unwrap();
    assert!(boom.message.as_deref().unwrap().contains("boom"));
    assert!(boom.curve.is_empty());

    let picky = table.outcome(&trial_name("picky")).unwrap();
    assert_eq!(picky.message.as_deref(), Some("needs a sparse design"));
}

#[test]
fn second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let first = run(&config(dir.path()), &runs);
    let computed = runs.load(Ordering::SeqCst);
    assert!(computed > 0);

    let second = run(&config(dir.path()), &runs);
    assert_eq!(runs.load(Ordering::SeqCst), computed);
    assert_expected_statuses(&second);

    for solver in ["halving", "stepper", "once"] {
        let a = first.outcome(&trial_name(solver)).unwrap();
        let b = second.outcome(&trial_name(solver)).unwrap();
        assert_eq!(a.curve.records(), b.curve.records(), "{solver}");
    }
}

#[test]
fn forced_solver_recomputes_only_its_points() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    run(&config(dir.path()), &runs);
    let before = runs.load(Ordering::SeqCst);

    let forced = config(dir.path())
        .with_filters(TrialFilters::default().with_forced_solvers(["halving"]));
    let table = run(&forced, &runs);

    let halving = table.outcome(&trial_name("halving")).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst) - before, halving.curve.len());
    assert_expected_statuses(&table);
}

#[test]
fn collect_mode_never_runs_solvers() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let table = run(&config(dir.path()).with_cache_mode(CacheMode::Collect), &runs);

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    for solver in ["halving", "stepper", "once", "diverging", "boom"] {
        assert_eq!(status(&table, solver), TrialStatus::NotRun, "{solver}");
    }
    assert_eq!(status(&table, "picky"), TrialStatus::Skipped);
}

#[test]
fn collect_mode_reads_previous_results() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let first = run(&config(dir.path()), &runs);
    let computed = runs.load(Ordering::SeqCst);

    let collected = run(&config(dir.path()).with_cache_mode(CacheMode::Collect), &runs);
    assert_eq!(runs.load(Ordering::SeqCst), computed);
    assert_eq!(status(&collected, "halving"), TrialStatus::Done);
    assert_eq!(
        first.outcome(&trial_name("halving")).unwrap().curve.records(),
        collected.outcome(&trial_name("halving")).unwrap().curve.records()
    );
    assert_eq!(status(&collected, "boom"), TrialStatus::NotRun);
}

#[test]
fn every_backend_produces_the_same_statuses() {
    let backends = [
        ParallelConfig::LocalPool { n_jobs: 3 },
        ParallelConfig::Distributed { n_workers: 2 },
        ParallelConfig::BatchQueue {
            profile: Default::default(),
            poll_interval_ms: 10,
        },
    ];
    for parallel in backends {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let name = parallel.name();
        let table = run(&config(dir.path()).with_parallel(parallel), &runs);

        assert_eq!(table.outcomes().len(), SOLVERS.len(), "{name}");
        assert_expected_statuses(&table);
        assert_eq!(
            table.outcome(&trial_name("halving")).unwrap().final_value(),
            Some(FLOOR),
            "{name}"
        );
    }
}

#[test]
fn cancelled_run_interrupts_every_trial() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let cancel = CancelToken::new();
    cancel.cancel();

    let table = run_benchmark(
        Arc::new(registry(Arc::clone(&runs))),
        &config(dir.path()),
        None,
        cancel,
    )
    .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    for solver in ["halving", "stepper", "once", "diverging", "boom"] {
        assert_eq!(status(&table, solver), TrialStatus::Interrupted, "{solver}");
    }
    assert_eq!(status(&table, "picky"), TrialStatus::Skipped);
}

#[test]
fn progress_reports_each_finished_trial() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam_channel::unbounded();

    run_benchmark(
        Arc::new(registry(runs)),
        &config(dir.path()),
        Some(tx),
        CancelToken::new(),
    )
    .unwrap();

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    let finished = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Finished { .. }))
        .count();
    let points = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Point { .. }))
        .count();
    assert_eq!(finished, SOLVERS.len() - 1);
    assert!(points > 0);
}

#[test]
fn configuration_errors_fail_before_any_trial() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let filters = TrialFilters::default().with_solvers(["lbfgs"]);

    let err = run_benchmark(
        Arc::new(registry(Arc::clone(&runs))),
        &config(dir.path()).with_filters(filters),
        None,
        CancelToken::new(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        BenchError::Config(ConfigError::UnmatchedPattern { .. })
    ));
    assert!(err.to_string().contains("halving"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn filters_select_solvers_in_declared_order() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let filters = TrialFilters::default().with_solvers(["once", "HALV*"]);
    let table = run(&config(dir.path()).with_filters(filters), &runs);

    let names: Vec<&str> = table.outcomes().iter().map(|o| o.solver.as_str()).collect();
    assert_eq!(names, vec!["halving", "once"]);
}
