//! Explicit run context handed to every trial.

use crossbeam_channel::Sender;
use ob_cache::{CacheMode, RunCache};
use ob_search::Registry;
use ob_types::{StopVal, TrialOutcome, TrialStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Cooperative cancellation flag shared by the driver and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings shared by every trial of a run. Serializable so remote workers
/// receive them with each task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub max_runs: usize,
    pub n_repetitions: usize,
    pub timeout: Option<Duration>,
    pub cache_mode: CacheMode,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_runs: 100,
            n_repetitions: 1,
            timeout: Some(Duration::from_secs(100)),
            cache_mode: CacheMode::Normal,
        }
    }
}

/// Incremental progress notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        trial: String,
    },
    /// One precision level evaluated.
    Point {
        trial: String,
        stop_val: StopVal,
        progress: f64,
    },
    Finished {
        trial: String,
        status: TrialStatus,
    },
}

/// Everything a trial needs, passed explicitly instead of through globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub registry: Arc<Registry>,
    pub cache: Arc<RunCache>,
    pub settings: RunSettings,
    pub progress: Option<Sender<ProgressEvent>>,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(registry: Arc<Registry>, cache: Arc<RunCache>, settings: RunSettings) -> Self {
        Self {
            registry,
            cache,
            settings,
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Sender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Send a progress event. A disconnected receiver is ignored.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    /// Report a finished trial: one status line and one progress event.
    pub fn report(&self, outcome: &TrialOutcome) {
        info!(
            trial = %outcome.name,
            status = %outcome.status,
            "{}: {}",
            outcome.name,
            outcome.status
        );
        self.emit(ProgressEvent::Finished {
            trial: outcome.name.clone(),
            status: outcome.status,
        });
    }
}
