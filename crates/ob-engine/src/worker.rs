//! Worker side of the remote backends.
//!
//! A remote worker receives a JSON [`TaskEnvelope`], rebuilds the trial's
//! components from its own registry, runs the trial against the shared
//! cache directory and answers with a JSON [`ResultEnvelope`].

use ob_cache::RunCache;
use ob_search::{Registry, TaskSpec};
use ob_types::{BackendError, TrialOutcome};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::context::{CancelToken, RunContext, RunSettings};
use crate::runner::run_trial;

/// Everything a worker needs to run one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: TaskSpec,
    pub settings: RunSettings,
}

impl TaskEnvelope {
    pub fn encode(&self) -> Result<String, BackendError> {
        serde_json::to_string(self).map_err(|e| BackendError::Protocol {
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub outcome: TrialOutcome,
}

impl ResultEnvelope {
    pub fn decode(reply: &str) -> Result<Self, BackendError> {
        serde_json::from_str(reply).map_err(|e| BackendError::Protocol {
            message: e.to_string(),
        })
    }
}

/// Run the trial described by `payload` and encode its outcome.
pub fn execute_payload(
    registry: Arc<Registry>,
    cache_root: &Path,
    cancel: CancelToken,
    payload: &str,
) -> Result<String, BackendError> {
    let envelope: TaskEnvelope =
        serde_json::from_str(payload).map_err(|e| BackendError::Protocol {
            message: e.to_string(),
        })?;
    let cache = RunCache::open(cache_root).map_err(|e| BackendError::Unavailable {
        backend: "worker".to_string(),
        message: e.to_string(),
    })?;

    debug!(trial = %envelope.task.name(), "worker received task");
    let ctx = RunContext::new(registry, Arc::new(cache), envelope.settings).with_cancel(cancel);
    let outcome = run_trial(&ctx, &envelope.task);

    serde_json::to_string(&ResultEnvelope { outcome }).map_err(|e| BackendError::Protocol {
        message: e.to_string(),
    })
}
