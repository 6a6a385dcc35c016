//! Optibench adaptive benchmark execution engine.
//!
//! [`run_benchmark`] expands the registered components into trials, runs
//! each trial's adaptive precision loop on the configured backend and
//! returns one convergence curve per trial.

pub mod backend;
pub mod batch;
pub mod callback;
pub mod config;
pub mod context;
pub mod criterion;
pub mod distributed;
pub mod results;
pub mod runner;
pub mod worker;

use chrono::Utc;
use crossbeam_channel::Sender;
use ob_cache::RunCache;
use ob_search::{Planned, Registry, SkippedTrial, TrialEnumerator};
use ob_types::{internal_error, BenchResult, ConvergenceCurve, TrialOutcome, TrialStatus};
use std::sync::Arc;
use tracing::{info, warn};

pub use backend::{LocalPool, ParallelBackend, Sequential};
pub use batch::{BatchQueue, JobId, JobScheduler, JobState, LocalJobScheduler};
pub use callback::{CallbackRecorder, CallbackRun};
pub use config::{BenchmarkConfig, ParallelConfig, BACKENDS};
pub use context::{CancelToken, ProgressEvent, RunContext, RunSettings};
pub use criterion::{Decision, StoppingCriterion};
pub use distributed::{ClusterClient, Distributed, InProcessCluster};
pub use results::ResultTable;
pub use runner::run_trial;
pub use worker::{ResultEnvelope, TaskEnvelope};

/// Run every trial selected by `config` and collect the results, in
/// enumeration order.
///
/// Configuration errors fail before any trial starts. Trial failures are
/// reported in the table; only backend failures return `Err`. Cancelling
/// `cancel` stops the run cooperatively, and trials that did not finish
/// are reported as interrupted.
pub fn run_benchmark(
    registry: Arc<Registry>,
    config: &BenchmarkConfig,
    progress: Option<Sender<ProgressEvent>>,
    cancel: CancelToken,
) -> BenchResult<ResultTable> {
    config.validate()?;
    let settings = config.settings()?;
    let enumerator = TrialEnumerator::new(Arc::clone(&registry), &config.filters)?;

    let mut planned: Vec<Option<TrialOutcome>> = Vec::new();
    let mut tasks = Vec::new();
    let mut slots = Vec::new();
    for trial in enumerator.iter() {
        match trial {
            Planned::Run(task) => {
                slots.push(planned.len());
                planned.push(None);
                tasks.push(task);
            }
            Planned::Skip(skipped) => {
                warn!(trial = %skipped.name(), reason = %skipped.reason, "skip");
                planned.push(Some(skipped_outcome(skipped)));
            }
        }
    }

    let cache_root = config.cache_root();
    let cache = RunCache::open(&cache_root)?;
    let mut ctx =
        RunContext::new(Arc::clone(&registry), Arc::new(cache), settings).with_cancel(cancel);
    if let Some(tx) = progress {
        ctx = ctx.with_progress(tx);
    }

    let backend = config.parallel.build(&registry, &cache_root);
    info!(
        backend = backend.name(),
        n_trials = tasks.len(),
        cache = %cache_root.display(),
        "starting benchmark"
    );
    let n_tasks = tasks.len();
    let outcomes = backend.run(&ctx, tasks)?;
    if outcomes.len() != n_tasks {
        return Err(internal_error!(
            "backend {} returned {} outcomes for {} trials",
            backend.name(),
            outcomes.len(),
            n_tasks
        ));
    }

    for (slot, outcome) in slots.into_iter().zip(outcomes) {
        planned[slot] = Some(outcome);
    }
    let table = ResultTable::new(planned.into_iter().flatten().collect());

    let stats = ctx.cache.get_stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        "benchmark finished"
    );
    Ok(table)
}

fn skipped_outcome(skipped: SkippedTrial) -> TrialOutcome {
    let now = Utc::now();
    let mut curve = ConvergenceCurve::new();
    curve.finalize();
    TrialOutcome {
        name: skipped.name(),
        dataset: skipped.dataset.display_name(),
        objective: skipped.objective.display_name(),
        solver: skipped.solver.display_name(),
        status: TrialStatus::Skipped,
        curve,
        message: Some(skipped.reason),
        started_at: now,
        finished_at: now,
    }
}
