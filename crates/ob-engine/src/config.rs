//! Benchmark run configuration.

use ob_cache::{CacheMode, RunCache};
use ob_search::{Registry, ResourceProfile, TrialFilters};
use ob_types::{config_error, BenchResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{LocalPool, ParallelBackend, Sequential};
use crate::batch::{BatchQueue, LocalJobScheduler};
use crate::context::RunSettings;
use crate::distributed::{Distributed, InProcessCluster};

/// Names accepted in the `backend` field of a parallel config.
pub const BACKENDS: [&str; 4] = ["sequential", "local_pool", "distributed", "batch_queue"];

fn default_poll_interval_ms() -> u64 {
    500
}

/// Which backend runs the trials, loaded from a YAML document such as
///
/// ```yaml
/// backend: batch_queue
/// profile:
///   partition: cpu
///   wall_time_secs: 3600
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ParallelConfig {
    #[default]
    Sequential,
    LocalPool {
        n_jobs: usize,
    },
    Distributed {
        n_workers: usize,
    },
    BatchQueue {
        #[serde(default)]
        profile: ResourceProfile,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

impl ParallelConfig {
    pub fn from_yaml(text: &str) -> BenchResult<Self> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| config_error!("invalid parallel config: {e}"))?;
        let backend = doc
            .get("backend")
            .and_then(serde_yaml::Value::as_str)
            .ok_or_else(|| config_error!("parallel config has no `backend` field"))?;
        if !BACKENDS.contains(&backend) {
            return Err(ConfigError::UnknownBackend {
                name: backend.to_string(),
                valid: BACKENDS.iter().map(|b| b.to_string()).collect(),
            }
            .into());
        }
        serde_yaml::from_value(doc).map_err(|e| config_error!("invalid parallel config: {e}"))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => BACKENDS[0],
            Self::LocalPool { .. } => BACKENDS[1],
            Self::Distributed { .. } => BACKENDS[2],
            Self::BatchQueue { .. } => BACKENDS[3],
        }
    }

    /// Apply a command-line `n_jobs`. More than one job turns a sequential
    /// config into a local pool.
    pub fn with_n_jobs(self, n_jobs: Option<usize>) -> Self {
        let Some(n_jobs) = n_jobs else {
            return self;
        };
        match self {
            Self::Sequential if n_jobs > 1 => Self::LocalPool { n_jobs },
            Self::LocalPool { .. } => Self::LocalPool { n_jobs },
            Self::Distributed { .. } => Self::Distributed { n_workers: n_jobs },
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::LocalPool { n_jobs: 0 } => {
                Err(ConfigError::Invalid("n_jobs must be at least 1".into()))
            }
            Self::Distributed { n_workers: 0 } => {
                Err(ConfigError::Invalid("n_workers must be at least 1".into()))
            }
            Self::BatchQueue {
                poll_interval_ms: 0,
                ..
            } => Err(ConfigError::Invalid("poll_interval_ms must be positive".into())),
            _ => Ok(()),
        }
    }

    /// Build the backend. Remote backends run their workers on this machine
    /// against the cache at `cache_root`.
    pub fn build(&self, registry: &Arc<Registry>, cache_root: &Path) -> Box<dyn ParallelBackend> {
        match self {
            Self::Sequential => Box::new(Sequential),
            Self::LocalPool { n_jobs } => Box::new(LocalPool::new(*n_jobs)),
            Self::Distributed { n_workers } => Box::new(Distributed::new(
                Arc::new(InProcessCluster::new(Arc::clone(registry), cache_root)),
                *n_workers,
            )),
            Self::BatchQueue {
                profile,
                poll_interval_ms,
            } => Box::new(
                BatchQueue::new(Arc::new(LocalJobScheduler::new(
                    Arc::clone(registry),
                    cache_root,
                )))
                .with_profile(profile.clone())
                .with_poll_interval(Duration::from_millis(*poll_interval_ms)),
            ),
        }
    }
}

/// Configuration of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Maximum number of evaluations per trial after the initial one.
    pub max_runs: usize,

    /// Repeated measurements at each precision level.
    pub n_repetitions: usize,

    /// Per-trial time budget in seconds. `None` disables the deadline.
    pub timeout_secs: Option<f64>,

    pub cache_mode: CacheMode,

    pub filters: TrialFilters,

    pub parallel: ParallelConfig,

    /// Cache location; defaults to [`RunCache::default_dir`].
    pub cache_dir: Option<PathBuf>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            max_runs: 100,
            n_repetitions: 1,
            timeout_secs: Some(100.0),
            cache_mode: CacheMode::Normal,
            filters: TrialFilters::default(),
            parallel: ParallelConfig::Sequential,
            cache_dir: None,
        }
    }
}

impl BenchmarkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(text: &str) -> BenchResult<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| config_error!("invalid benchmark config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_n_repetitions(mut self, n: usize) -> Self {
        self.n_repetitions = n;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_secs = timeout.map(|t| t.as_secs_f64());
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_filters(mut self, filters: TrialFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_repetitions == 0 {
            return Err(ConfigError::Invalid("n_repetitions must be at least 1".into()));
        }
        if let Some(t) = self.timeout_secs {
            if !t.is_finite() || t < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "timeout must be a non-negative number of seconds, got {t}"
                )));
            }
        }
        self.parallel.validate()
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(RunCache::default_dir)
    }

    pub fn settings(&self) -> Result<RunSettings, ConfigError> {
        let timeout = self
            .timeout_secs
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("invalid timeout: {e}")))?;
        Ok(RunSettings {
            max_runs: self.max_runs,
            n_repetitions: self.n_repetitions,
            timeout,
            cache_mode: self.cache_mode,
        })
    }
}
