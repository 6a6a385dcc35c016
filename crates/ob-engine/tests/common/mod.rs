//! Toy benchmark components shared by the integration tests.
#![allow(dead_code)]

use ob_search::{Component, Registry};
use ob_types::{
    Dataset, Metrics, Objective, Parameters, PluginError, PluginResult, RunBudget,
    SamplingStrategy, Solver, VALUE_METRIC,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Value reached by the halving solvers.
pub const FLOOR: f64 = 1.0 / 1024.0;

pub struct Simulated;

impl Dataset for Simulated {
    fn get_data(&mut self) -> PluginResult<Value> {
        Ok(json!({ "n_samples": 10 }))
    }
}

/// Scores a numeric candidate by its own value; `null` scores NaN.
pub struct Identity;

impl Objective for Identity {
    fn set_data(&mut self, _data: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn get_objective(&self) -> Value {
        json!({ "kind": "identity" })
    }

    fn evaluate(&self, candidate: &Value) -> PluginResult<Metrics> {
        let x = match candidate {
            Value::Null => f64::NAN,
            other => other
                .as_f64()
                .ok_or_else(|| PluginError::objective("candidate is not a number"))?,
        };
        Ok(Metrics::from([(VALUE_METRIC.to_string(), x)]))
    }

    fn get_baseline_result(&self) -> Value {
        json!(1.0)
    }
}

/// `max(2^-n, FLOOR)` after `n` iterations.
pub struct Halving {
    runs: Arc<AtomicUsize>,
    x: f64,
}

impl Solver for Halving {
    fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn run(&mut self, budget: RunBudget<'_>) -> PluginResult<()> {
        let RunBudget::StopVal(stop_val) = budget else {
            return Err(PluginError::solver("iteration budget expected"));
        };
        self.runs.fetch_add(1, Ordering::SeqCst);
        let n = stop_val.iterations().unwrap_or(0).min(64) as i32;
        self.x = 0.5f64.powi(n).max(FLOOR);
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(self.x))
    }
}

/// Same curve as [`Halving`], reported through the callback.
pub struct Stepper {
    runs: Arc<AtomicUsize>,
    x: f64,
}

impl Solver for Stepper {
    fn sampling_strategy(&self) -> Option<SamplingStrategy> {
        Some(SamplingStrategy::Callback)
    }

    fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn run(&mut self, budget: RunBudget<'_>) -> PluginResult<()> {
        let RunBudget::Callback(checkpoint) = budget else {
            return Err(PluginError::solver("callback budget expected"));
        };
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.x = 1.0;
        while checkpoint(&json!(self.x)) {
            self.x = (self.x / 2.0).max(FLOOR);
        }
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(self.x))
    }
}

/// Runs once and lands on the floor.
pub struct Once {
    runs: Arc<AtomicUsize>,
}

impl Solver for Once {
    fn sampling_strategy(&self) -> Option<SamplingStrategy> {
        Some(SamplingStrategy::RunOnce)
    }

    fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn run(&mut self, _budget: RunBudget<'_>) -> PluginResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(FLOOR))
    }
}

/// Produces `null`, which the objective scores as NaN.
pub struct Diverging {
    runs: Arc<AtomicUsize>,
}

impl Solver for Diverging {
    fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn run(&mut self, _budget: RunBudget<'_>) -> PluginResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(Value::Null)
    }
}

/// Fails every run. Not counted.
pub struct Boom;

impl Solver for Boom {
    fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn run(&mut self, _budget: RunBudget<'_>) -> PluginResult<()> {
        Err(PluginError::solver("boom"))
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(0.0))
    }
}

/// Declines every objective.
pub struct Picky;

impl Solver for Picky {
    fn skip(&self, _objective: &Value) -> Option<String> {
        Some("needs a sparse design".to_string())
    }

    fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
        Ok(())
    }

    fn run(&mut self, _budget: RunBudget<'_>) -> PluginResult<()> {
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(0.0))
    }
}

pub const SOLVERS: [&str; 6] = ["halving", "stepper", "once", "diverging", "boom", "picky"];

pub fn trial_name(solver: &str) -> String {
    format!("simulated / identity / {solver}")
}

/// Registry with one dataset, one objective and every toy solver. `runs`
/// counts solver runs, failing ones excluded.
pub fn registry(runs: Arc<AtomicUsize>) -> Registry {
    let halving_runs = Arc::clone(&runs);
    let stepper_runs = Arc::clone(&runs);
    let once_runs = Arc::clone(&runs);
    let diverging_runs = runs;

    Registry::new()
        .with_dataset(Component::new("simulated", |_: &Parameters| {
            Ok(Box::new(Simulated) as Box<dyn Dataset>)
        }))
        .with_objective(Component::new("identity", |_: &Parameters| {
            Ok(Box::new(Identity) as Box<dyn Objective>)
        }))
        .with_solver(Component::new("halving", move |_: &Parameters| {
            Ok(Box::new(Halving {
                runs: Arc::clone(&halving_runs),
                x: 1.0,
            }) as Box<dyn Solver>)
        }))
        .with_solver(Component::new("stepper", move |_: &Parameters| {
            Ok(Box::new(Stepper {
                runs: Arc::clone(&stepper_runs),
                x: 1.0,
            }) as Box<dyn Solver>)
        }))
        .with_solver(Component::new("once", move |_: &Parameters| {
            Ok(Box::new(Once {
                runs: Arc::clone(&once_runs),
            }) as Box<dyn Solver>)
        }))
        .with_solver(Component::new("diverging", move |_: &Parameters| {
            Ok(Box::new(Diverging {
                runs: Arc::clone(&diverging_runs),
            }) as Box<dyn Solver>)
        }))
        .with_solver(Component::new("boom", |_: &Parameters| {
            Ok(Box::new(Boom) as Box<dyn Solver>)
        }))
        .with_solver(Component::new("picky", |_: &Parameters| {
            Ok(Box::new(Picky) as Box<dyn Solver>)
        }))
}
