use thiserror::Error;

use crate::plugin::PluginKind;

/// Main error type for the Optibench system
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors detected before any trial starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "patterns {patterns:?} did not match any {kind}; available {kind}s are: {}",
        .available.join(", ")
    )]
    UnmatchedPattern {
        kind: PluginKind,
        patterns: Vec<String>,
        available: Vec<String>,
    },

    #[error(
        "unknown {kind} parameter `{parameter}` in pattern `{pattern}`; valid parameters are: {}",
        .suggestions.join(", ")
    )]
    UnknownParameter {
        kind: PluginKind,
        pattern: String,
        parameter: String,
        suggestions: Vec<String>,
    },

    #[error("malformed parameter grid for {component}: {message}")]
    MalformedGrid { component: String, message: String },

    #[error("unknown {kind} `{name}`")]
    UnknownComponent { kind: PluginKind, name: String },

    #[error("unknown parallel backend `{name}`; valid backends are: {}", .valid.join(", "))]
    UnknownBackend { name: String, valid: Vec<String> },

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised by user-supplied datasets, objectives and solvers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("{origin} {component} failed: {message}")]
    Failed {
        origin: PluginKind,
        component: String,
        message: String,
    },

    #[error("objective {component} returned metrics without a `value` entry")]
    MissingValue { component: String },

    #[error("{origin} {component} cannot be built: {message}")]
    Build {
        origin: PluginKind,
        component: String,
        message: String,
    },
}

impl PluginError {
    pub fn dataset(message: impl Into<String>) -> Self {
        Self::failed(PluginKind::Dataset, message)
    }

    pub fn objective(message: impl Into<String>) -> Self {
        Self::failed(PluginKind::Objective, message)
    }

    pub fn solver(message: impl Into<String>) -> Self {
        Self::failed(PluginKind::Solver, message)
    }

    fn failed(origin: PluginKind, message: impl Into<String>) -> Self {
        Self::Failed {
            origin,
            component: String::new(),
            message: message.into(),
        }
    }

    /// Attach the parametrized name of the component that raised the error.
    /// Names already set by the plugin are kept.
    pub fn in_component(mut self, name: &str) -> Self {
        match &mut self {
            Self::Failed { component, .. }
            | Self::MissingValue { component }
            | Self::Build { component, .. } => {
                if component.is_empty() {
                    *component = name.to_string();
                }
            }
        }
        self
    }

    pub fn origin(&self) -> PluginKind {
        match self {
            Self::Failed { origin, .. } | Self::Build { origin, .. } => *origin,
            Self::MissingValue { .. } => PluginKind::Objective,
        }
    }
}

/// Errors from the run cache storage layer.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from the parallel execution layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("remote task {task} failed: {message}")]
    RemoteTask { task: String, message: String },

    #[error("worker {worker} was lost while running {task}")]
    WorkerLost { worker: String, task: String },

    #[error("backend {backend} is unavailable: {message}")]
    Unavailable { backend: String, message: String },

    #[error("batch submission failed: {message}")]
    Submission { message: String },

    #[error("malformed task envelope: {message}")]
    Protocol { message: String },

    #[error("task {task} was cancelled before it started")]
    Cancelled { task: String },
}

/// Result type alias for Optibench operations
pub type BenchResult<T> = Result<T, BenchError>;

/// Result type alias for plugin hooks
pub type PluginResult<T> = Result<T, PluginError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::BenchError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::BenchError::Config($crate::ConfigError::Invalid(format!($($arg)*)))
    };
}
