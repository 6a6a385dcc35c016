//! Batch-queue backend for cluster job schedulers.
//!
//! Tasks are grouped by resource profile and each group is submitted as one
//! job array. The driver polls job states; the first failed job cancels
//! every other job and is returned as [`BackendError::RemoteTask`].

use dashmap::DashMap;
use ob_search::{Registry, ResourceProfile, TaskSpec};
use ob_types::{BackendError, BenchResult, TrialOutcome, TrialStatus};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::backend::ParallelBackend;
use crate::context::{CancelToken, RunContext};
use crate::runner::unfinished_outcome;
use crate::worker::{execute_payload, ResultEnvelope, TaskEnvelope};

pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    /// Finished; holds the encoded [`ResultEnvelope`].
    Completed(String),
    /// The job itself failed (worker crash, scheduler error).
    Failed(String),
}

/// A cluster job scheduler such as SLURM.
pub trait JobScheduler: Send + Sync {
    /// Submit one job per payload, all with `profile`. Returns job ids in
    /// payload order.
    fn submit_batch(
        &self,
        profile: &ResourceProfile,
        payloads: Vec<String>,
    ) -> Result<Vec<JobId>, BackendError>;

    fn poll(&self, job: &JobId) -> Result<JobState, BackendError>;

    /// Cancel jobs; finished jobs are ignored.
    fn cancel(&self, jobs: &[JobId]) -> Result<(), BackendError>;
}

pub struct BatchQueue {
    scheduler: Arc<dyn JobScheduler>,
    base_profile: ResourceProfile,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl BatchQueue {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            scheduler,
            base_profile: ResourceProfile::default(),
            poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.base_profile = profile;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long cancelled jobs may take to report their partial results
    /// before they are given up on.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Resource profile of one task: base, then the solver's own profile,
    /// with a wall time of 1.5 times the trial timeout when none is set.
    pub fn profile_for(&self, task: &TaskSpec, timeout: Option<Duration>) -> ResourceProfile {
        let profile = self.base_profile.merged(&task.resources);
        match timeout {
            Some(t) => profile.or_wall_time((t.as_secs_f64() * 1.5).ceil() as u64),
            None => profile,
        }
    }

    /// Best-effort cancellation of `jobs`.
    fn cancel_jobs(&self, jobs: &[JobId]) {
        if jobs.is_empty() {
            return;
        }
        if let Err(e) = self.scheduler.cancel(jobs) {
            warn!(error = %e, n_jobs = jobs.len(), "failed to cancel batch jobs");
        }
    }

    fn submit(
        &self,
        ctx: &RunContext,
        tasks: &[TaskSpec],
    ) -> Result<Vec<(JobId, usize)>, BackendError> {
        let mut groups: BTreeMap<ResourceProfile, Vec<usize>> = BTreeMap::new();
        for (slot, task) in tasks.iter().enumerate() {
            groups
                .entry(self.profile_for(task, ctx.settings.timeout))
                .or_default()
                .push(slot);
        }

        let mut jobs: Vec<(JobId, usize)> = Vec::with_capacity(tasks.len());
        for (profile, slots) in &groups {
            let payloads = slots
                .iter()
                .map(|&slot| {
                    TaskEnvelope {
                        task: tasks[slot].clone(),
                        settings: ctx.settings.clone(),
                    }
                    .encode()
                })
                .collect::<Result<Vec<_>, _>>();

            let submitted = payloads
                .and_then(|p| self.scheduler.submit_batch(profile, p))
                .and_then(|ids| {
                    if ids.len() == slots.len() {
                        return Ok(ids);
                    }
                    self.cancel_jobs(&ids);
                    Err(BackendError::Submission {
                        message: format!("expected {} job ids, got {}", slots.len(), ids.len()),
                    })
                });
            let ids = match submitted {
                Ok(ids) => ids,
                Err(e) => {
                    let earlier: Vec<JobId> = jobs.iter().map(|(id, _)| id.clone()).collect();
                    self.cancel_jobs(&earlier);
                    return Err(e);
                }
            };

            info!(profile = %profile, n_jobs = ids.len(), "submitted batch");
            jobs.extend(ids.into_iter().zip(slots.iter().copied()));
        }
        Ok(jobs)
    }
}

impl ParallelBackend for BatchQueue {
    fn name(&self) -> &'static str {
        "batch_queue"
    }

    fn run(&self, ctx: &RunContext, tasks: Vec<TaskSpec>) -> BenchResult<Vec<TrialOutcome>> {
        let jobs = self.submit(ctx, &tasks)?;
        let all_ids: Vec<JobId> = jobs.iter().map(|(id, _)| id.clone()).collect();

        let mut outcomes: Vec<Option<TrialOutcome>> = vec![None; tasks.len()];
        let mut remaining = jobs;
        // Set once cancellation is requested. Cancelled jobs are still
        // polled until then so their partial curves come back.
        let mut drain_deadline: Option<Instant> = None;

        while !remaining.is_empty() {
            if drain_deadline.is_none() && ctx.cancel.is_cancelled() {
                warn!(n_jobs = remaining.len(), "cancellation requested, cancelling batch jobs");
                let ids: Vec<JobId> = remaining.iter().map(|(id, _)| id.clone()).collect();
                self.cancel_jobs(&ids);
                drain_deadline = Some(Instant::now() + self.drain_timeout);
            }
            if drain_deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(n_jobs = remaining.len(), "cancelled batch jobs did not report back");
                break;
            }

            let mut pending = Vec::with_capacity(remaining.len());
            for (id, slot) in remaining {
                let finished = self.scheduler.poll(&id).and_then(|state| match state {
                    JobState::Pending | JobState::Running => Ok(None),
                    JobState::Completed(reply) => ResultEnvelope::decode(&reply).map(Some),
                    JobState::Failed(message) => Err(BackendError::RemoteTask {
                        task: tasks[slot].name(),
                        message,
                    }),
                });

                match finished {
                    Ok(Some(ResultEnvelope { outcome })) => {
                        ctx.report(&outcome);
                        outcomes[slot] = Some(outcome);
                    }
                    Ok(None) => pending.push((id, slot)),
                    Err(e) if drain_deadline.is_some() => {
                        warn!(job = %id, error = %e, "batch job ended during cancellation");
                    }
                    Err(e) => {
                        error!(job = %id, error = %e, "batch job failed, cancelling siblings");
                        let siblings: Vec<JobId> =
                            all_ids.iter().filter(|other| **other != id).cloned().collect();
                        self.cancel_jobs(&siblings);
                        return Err(e.into());
                    }
                }
            }

            remaining = pending;
            if !remaining.is_empty() {
                thread::sleep(self.poll_interval);
            }
        }

        Ok(outcomes
            .into_iter()
            .zip(&tasks)
            .map(|(outcome, task)| {
                outcome.unwrap_or_else(|| unfinished_outcome(task, TrialStatus::Interrupted))
            })
            .collect())
    }
}

struct LocalJob {
    state: Arc<Mutex<JobState>>,
    cancel: CancelToken,
}

/// Runs every submitted job on its own thread of this machine. Stands in
/// for a cluster scheduler when none is available.
pub struct LocalJobScheduler {
    registry: Arc<Registry>,
    cache_root: PathBuf,
    jobs: DashMap<JobId, LocalJob>,
    next_batch: AtomicU64,
}

impl LocalJobScheduler {
    pub fn new(registry: Arc<Registry>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            cache_root: cache_root.into(),
            jobs: DashMap::new(),
            next_batch: AtomicU64::new(1),
        }
    }
}

impl JobScheduler for LocalJobScheduler {
    fn submit_batch(
        &self,
        profile: &ResourceProfile,
        payloads: Vec<String>,
    ) -> Result<Vec<JobId>, BackendError> {
        let batch = self.next_batch.fetch_add(1, Ordering::SeqCst);
        debug!(batch, profile = %profile, n_jobs = payloads.len(), "local batch");

        let mut ids = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.into_iter().enumerate() {
            let id = format!("{batch}_{index}");
            let state = Arc::new(Mutex::new(JobState::Pending));
            let cancel = CancelToken::new();

            let registry = Arc::clone(&self.registry);
            let cache_root = self.cache_root.clone();
            let job_state = Arc::clone(&state);
            let job_cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("optibench-job-{id}"))
                .spawn(move || {
                    *job_state.lock() = JobState::Running;
                    let result = execute_payload(registry, &cache_root, job_cancel, &payload);
                    *job_state.lock() = match result {
                        Ok(reply) => JobState::Completed(reply),
                        Err(e) => JobState::Failed(e.to_string()),
                    };
                })
                .map_err(|e| BackendError::Submission {
                    message: e.to_string(),
                })?;

            self.jobs.insert(id.clone(), LocalJob { state, cancel });
            ids.push(id);
        }
        Ok(ids)
    }

    fn poll(&self, job: &JobId) -> Result<JobState, BackendError> {
        self.jobs
            .get(job)
            .map(|j| j.state.lock().clone())
            .ok_or_else(|| BackendError::Protocol {
                message: format!("unknown job {job}"),
            })
    }

    fn cancel(&self, jobs: &[JobId]) -> Result<(), BackendError> {
        for id in jobs {
            if let Some(job) = self.jobs.get(id) {
                job.cancel.cancel();
            }
        }
        Ok(())
    }
}
