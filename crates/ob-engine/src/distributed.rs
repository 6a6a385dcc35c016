//! Distributed-cluster backend.
//!
//! Tasks are shipped as JSON envelopes to a [`ClusterClient`] and never
//! share memory with the driver. The driver keeps at most `n_workers`
//! tasks in flight and blocks until every task returned or one failed.
//! The first failure aborts the remaining tasks and is returned as is.
//! Once cancellation is requested, tasks that have not started are dropped
//! and reported as interrupted.

use async_trait::async_trait;
use ob_search::{Registry, TaskSpec};
use ob_types::{BackendError, BenchResult, TrialOutcome, TrialStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::ParallelBackend;
use crate::context::{CancelToken, RunContext};
use crate::runner::unfinished_outcome;
use crate::worker::{execute_payload, ResultEnvelope, TaskEnvelope};

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Connection to a pool of remote workers.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Run one encoded [`TaskEnvelope`] and return the encoded
    /// [`ResultEnvelope`].
    async fn execute(&self, task_name: &str, payload: String) -> Result<String, BackendError>;

    /// Ask every worker to stop its in-flight task.
    async fn cancel(&self) {}
}

/// Workers on the blocking thread pool of the driver's runtime. Each task
/// is decoded and run against its own cache handle, as a remote worker
/// would.
pub struct InProcessCluster {
    registry: Arc<Registry>,
    cache_root: PathBuf,
    cancel: CancelToken,
}

impl InProcessCluster {
    pub fn new(registry: Arc<Registry>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            cache_root: cache_root.into(),
            cancel: CancelToken::new(),
        }
    }
}

#[async_trait]
impl ClusterClient for InProcessCluster {
    async fn execute(&self, task_name: &str, payload: String) -> Result<String, BackendError> {
        let registry = Arc::clone(&self.registry);
        let cache_root = self.cache_root.clone();
        let cancel = self.cancel.clone();

        let job = move || execute_payload(registry, &cache_root, cancel, &payload);
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| BackendError::WorkerLost {
                worker: format!("in-process ({e})"),
                task: task_name.to_string(),
            })?
    }

    async fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct Distributed {
    client: Arc<dyn ClusterClient>,
    n_workers: usize,
}

impl Distributed {
    pub fn new(client: Arc<dyn ClusterClient>, n_workers: usize) -> Self {
        Self {
            client,
            n_workers: n_workers.max(1),
        }
    }

    async fn drive(&self, ctx: &RunContext, tasks: &[TaskSpec]) -> BenchResult<Vec<TrialOutcome>> {
        let semaphore = Arc::new(Semaphore::new(self.n_workers));
        let mut in_flight = JoinSet::new();

        for (slot, task) in tasks.iter().enumerate() {
            let payload = TaskEnvelope {
                task: task.clone(),
                settings: ctx.settings.clone(),
            }
            .encode()?;
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let cancel = ctx.cancel.clone();
            let name = task.name();

            in_flight.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| BackendError::Unavailable {
                        backend: "distributed".to_string(),
                        message: e.to_string(),
                    })?;
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled { task: name });
                }
                let reply = client.execute(&name, payload).await?;
                let envelope = ResultEnvelope::decode(&reply)?;
                Ok::<_, BackendError>((slot, envelope.outcome))
            });
        }

        let mut outcomes: Vec<Option<TrialOutcome>> = vec![None; tasks.len()];
        let mut cancelled = false;
        let mut ticker = tokio::time::interval(CANCEL_POLL);

        while !in_flight.is_empty() {
            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { break };
                    let result = joined.unwrap_or_else(|e| {
                        Err(BackendError::WorkerLost {
                            worker: "driver".to_string(),
                            task: e.to_string(),
                        })
                    });
                    match result {
                        Ok((slot, outcome)) => {
                            ctx.report(&outcome);
                            outcomes[slot] = Some(outcome);
                        }
                        Err(BackendError::Cancelled { task }) => {
                            debug!(%task, "remote task not started");
                        }
                        Err(e) if cancelled => {
                            warn!(error = %e, "remote task ended during cancellation");
                        }
                        Err(e) => {
                            error!(error = %e, "remote task failed, cancelling the batch");
                            in_flight.abort_all();
                            self.client.cancel().await;
                            return Err(e.into());
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !cancelled && ctx.cancel.is_cancelled() {
                        warn!("cancellation requested, stopping remote tasks");
                        cancelled = true;
                        self.client.cancel().await;
                    }
                }
            }
        }

        Ok(outcomes
            .into_iter()
            .zip(tasks)
            .map(|(outcome, task)| {
                outcome.unwrap_or_else(|| unfinished_outcome(task, TrialStatus::Interrupted))
            })
            .collect())
    }
}

impl ParallelBackend for Distributed {
    fn name(&self) -> &'static str {
        "distributed"
    }

    /// Blocks the calling thread; must not be called from inside an async
    /// runtime.
    fn run(&self, ctx: &RunContext, tasks: Vec<TaskSpec>) -> BenchResult<Vec<TrialOutcome>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .max_blocking_threads(self.n_workers)
            .thread_name("optibench-driver")
            .build()
            .map_err(|e| BackendError::Unavailable {
                backend: self.name().to_string(),
                message: e.to_string(),
            })?;

        info!(n_workers = self.n_workers, n_tasks = tasks.len(), "dispatching trials to cluster");
        runtime.block_on(self.drive(ctx, &tasks))
    }
}
