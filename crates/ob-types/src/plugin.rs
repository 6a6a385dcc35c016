//! Capability interfaces implemented by user-supplied benchmark components.
//!
//! Datasets, objectives and solvers are opaque to the engine: data and
//! candidate results travel as JSON values so that the engine crates never
//! depend on a particular plugin's models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::errors::PluginResult;
use crate::records::{Metrics, SamplingStrategy, StopVal, StoppingPolicy};

/// The three kinds of benchmark component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Dataset,
    Objective,
    Solver,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dataset => "dataset",
            Self::Objective => "objective",
            Self::Solver => "solver",
        };
        f.write_str(s)
    }
}

/// Custom precision growth supplied by a solver.
pub type GrowthFn = Arc<dyn Fn(StopVal) -> StopVal + Send + Sync>;

/// Amount of work requested from [`Solver::run`].
pub enum RunBudget<'a> {
    /// Run until the given precision is reached.
    StopVal(StopVal),
    /// Call the checkpoint with the current iterate after every step and
    /// return as soon as it answers `false`.
    Callback(&'a mut dyn FnMut(&Value) -> bool),
}

impl fmt::Debug for RunBudget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopVal(v) => f.debug_tuple("StopVal").field(v).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Produces the data an objective is defined on.
pub trait Dataset: Send {
    /// Return the data as a JSON object of named fields.
    fn get_data(&mut self) -> PluginResult<Value>;
}

/// Defines the quantity being optimized and how a candidate is scored.
pub trait Objective: Send {
    /// Decline a dataset this objective cannot be defined on.
    fn skip(&self, _data: &Value) -> Option<String> {
        None
    }

    fn set_data(&mut self, data: &Value) -> PluginResult<()>;

    /// Problem description handed to [`Solver::set_objective`].
    fn get_objective(&self) -> Value;

    /// Score a candidate. The returned metrics must contain `value`.
    fn evaluate(&self, candidate: &Value) -> PluginResult<Metrics>;

    /// A trivial candidate, used to check the objective before any solver
    /// time is spent.
    fn get_baseline_result(&self) -> Value;

    /// Default strategy for solvers that do not declare one.
    fn sampling_strategy(&self) -> Option<SamplingStrategy> {
        None
    }

    /// Default stopping policy for solvers that do not declare one.
    fn stopping_policy(&self) -> Option<StoppingPolicy> {
        None
    }
}

/// An optimization method under benchmark.
pub trait Solver: Send {
    fn sampling_strategy(&self) -> Option<SamplingStrategy> {
        None
    }

    fn stopping_policy(&self) -> Option<StoppingPolicy> {
        None
    }

    /// Decline an objective this solver cannot handle.
    fn skip(&self, _objective: &Value) -> Option<String> {
        None
    }

    fn set_objective(&mut self, objective: &Value) -> PluginResult<()>;

    /// Called once before any timed run.
    fn warm_up(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Untimed preparation before each run at `stop_val`.
    fn pre_run_hook(&mut self, _stop_val: StopVal) -> PluginResult<()> {
        Ok(())
    }

    /// Perform the requested work and keep the candidate internally.
    fn run(&mut self, budget: RunBudget<'_>) -> PluginResult<()>;

    fn get_result(&self) -> PluginResult<Value>;

    /// Replace the default logarithmic precision growth.
    fn growth(&self) -> Option<GrowthFn> {
        None
    }
}
