//! Parallel execution backends.
//!
//! Every backend takes the same independent trial tasks and returns one
//! outcome per task, in task order. Trials are isolated: a failing trial
//! becomes an `error` outcome and never stops its siblings. Only
//! infrastructure failures (a lost worker, a failed batch job) abort a run.

use ob_search::TaskSpec;
use ob_types::{BackendError, BenchResult, TrialOutcome};
use rayon::prelude::*;
use tracing::info;

use crate::context::RunContext;
use crate::runner::run_trial;

pub trait ParallelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &RunContext, tasks: Vec<TaskSpec>) -> BenchResult<Vec<TrialOutcome>>;
}

/// Runs trials one after another in the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl ParallelBackend for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn run(&self, ctx: &RunContext, tasks: Vec<TaskSpec>) -> BenchResult<Vec<TrialOutcome>> {
        Ok(tasks
            .iter()
            .map(|task| {
                let outcome = run_trial(ctx, task);
                ctx.report(&outcome);
                outcome
            })
            .collect())
    }
}

/// Runs trials on a dedicated pool of `n_jobs` threads in this process.
#[derive(Debug, Clone, Copy)]
pub struct LocalPool {
    n_jobs: usize,
}

impl LocalPool {
    pub fn new(n_jobs: usize) -> Self {
        Self {
            n_jobs: n_jobs.max(1),
        }
    }

    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }
}

impl ParallelBackend for LocalPool {
    fn name(&self) -> &'static str {
        "local_pool"
    }

    fn run(&self, ctx: &RunContext, tasks: Vec<TaskSpec>) -> BenchResult<Vec<TrialOutcome>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_jobs)
            .thread_name(|i| format!("optibench-worker-{i}"))
            .build()
            .map_err(|e| BackendError::Unavailable {
                backend: self.name().to_string(),
                message: e.to_string(),
            })?;

        info!(n_jobs = self.n_jobs, n_tasks = tasks.len(), "running trials on local pool");
        Ok(pool.install(|| {
            tasks
                .par_iter()
                .map(|task| {
                    let outcome = run_trial(ctx, task);
                    ctx.report(&outcome);
                    outcome
                })
                .collect()
        }))
    }
}
