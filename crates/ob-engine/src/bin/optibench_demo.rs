//! Runs a small quadratic benchmark with two solvers.
//!
//! Environment:
//! - `OPTIBENCH_PARALLEL`: path to a YAML parallel config
//! - `OPTIBENCH_N_JOBS`: worker count override
//! - `OPTIBENCH_OUTPUT`: parquet file to write the results to
//! - `OPTIBENCH_CACHE_DIR`: cache location

use ob_engine::{run_benchmark, BenchmarkConfig, CancelToken, ParallelConfig, ProgressEvent};
use ob_search::{Component, ParameterGrid, Registry};
use ob_types::{
    Dataset, Metrics, Objective, Parameters, PluginError, PluginResult, RunBudget,
    SamplingStrategy, Solver, VALUE_METRIC,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Separable quadratic `sum(a_i x_i^2 / 2 - b_i x_i)` with random-ish
/// coefficients.
struct Simulated {
    n_features: usize,
}

impl Dataset for Simulated {
    fn get_data(&mut self) -> PluginResult<Value> {
        let a: Vec<f64> = (0..self.n_features).map(|i| 1.0 + (i % 7) as f64).collect();
        let b: Vec<f64> = (0..self.n_features).map(|i| ((i * 37) % 11) as f64 - 5.0).collect();
        Ok(json!({ "a": a, "b": b }))
    }
}

#[derive(Default)]
struct Quadratic {
    a: Vec<f64>,
    b: Vec<f64>,
}

fn floats(value: &Value, field: &str) -> Option<Vec<f64>> {
    value.get(field)?.as_array()?.iter().map(Value::as_f64).collect()
}

impl Objective for Quadratic {
    fn set_data(&mut self, data: &Value) -> PluginResult<()> {
        self.a = floats(data, "a").ok_or_else(|| PluginError::objective("missing `a`"))?;
        self.b = floats(data, "b").ok_or_else(|| PluginError::objective("missing `b`"))?;
        Ok(())
    }

    fn get_objective(&self) -> Value {
        json!({ "a": self.a, "b": self.b })
    }

    fn evaluate(&self, candidate: &Value) -> PluginResult<Metrics> {
        let x = candidate
            .as_array()
            .and_then(|x| x.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>())
            .ok_or_else(|| PluginError::objective("candidate is not a vector"))?;
        let value: f64 = x
            .iter()
            .zip(self.a.iter().zip(&self.b))
            .map(|(x, (a, b))| 0.5 * a * x * x - b * x)
            .sum();
        Ok(Metrics::from([(VALUE_METRIC.to_string(), value)]))
    }

    fn get_baseline_result(&self) -> Value {
        json!(vec![0.0; self.a.len()])
    }
}

/// Gradient descent, driven by iteration count.
struct GradientDescent {
    step: f64,
    a: Vec<f64>,
    b: Vec<f64>,
    x: Vec<f64>,
}

impl Solver for GradientDescent {
    fn set_objective(&mut self, objective: &Value) -> PluginResult<()> {
        self.a = floats(objective, "a").ok_or_else(|| PluginError::solver("missing `a`"))?;
        self.b = floats(objective, "b").ok_or_else(|| PluginError::solver("missing `b`"))?;
        Ok(())
    }

    fn run(&mut self, budget: RunBudget<'_>) -> PluginResult<()> {
        let RunBudget::StopVal(stop_val) = budget else {
            return Err(PluginError::solver("expected an iteration budget"));
        };
        let n_iter = stop_val.iterations().unwrap_or(0);
        let lipschitz = self.a.iter().copied().fold(1.0, f64::max);
        self.x = vec![0.0; self.a.len()];
        for _ in 0..n_iter {
            for ((x, a), b) in self.x.iter_mut().zip(&self.a).zip(&self.b) {
                *x -= self.step / lipschitz * (a * *x - b);
            }
        }
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(self.x))
    }
}

/// Heavy-ball momentum, reporting every step through the callback.
struct HeavyBall {
    momentum: f64,
    a: Vec<f64>,
    b: Vec<f64>,
    x: Vec<f64>,
}

impl Solver for HeavyBall {
    fn sampling_strategy(&self) -> Option<SamplingStrategy> {
        Some(SamplingStrategy::Callback)
    }

    fn set_objective(&mut self, objective: &Value) -> PluginResult<()> {
        self.a = floats(objective, "a").ok_or_else(|| PluginError::solver("missing `a`"))?;
        self.b = floats(objective, "b").ok_or_else(|| PluginError::solver("missing `b`"))?;
        Ok(())
    }

    fn run(&mut self, budget: RunBudget<'_>) -> PluginResult<()> {
        let RunBudget::Callback(checkpoint) = budget else {
            return Err(PluginError::solver("expected a callback budget"));
        };
        let lipschitz = self.a.iter().copied().fold(1.0, f64::max);
        self.x = vec![0.0; self.a.len()];
        let mut velocity = vec![0.0; self.a.len()];
        while checkpoint(&json!(self.x)) {
            for i in 0..self.x.len() {
                let grad = self.a[i] * self.x[i] - self.b[i];
                velocity[i] = self.momentum * velocity[i] - grad / lipschitz;
                self.x[i] += velocity[i];
            }
        }
        Ok(())
    }

    fn get_result(&self) -> PluginResult<Value> {
        Ok(json!(self.x))
    }
}

fn param(parameters: &Parameters, name: &str, default: f64) -> f64 {
    parameters.get(name).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn registry() -> Registry {
    Registry::new()
        .with_dataset(
            Component::new("simulated", |p: &Parameters| {
                let n_features = p.get("n_features").and_then(|v| v.as_i64()).unwrap_or(10);
                Ok(Box::new(Simulated {
                    n_features: n_features.max(1) as usize,
                }) as Box<dyn Dataset>)
            })
            .with_grid(ParameterGrid::new().add("n_features", vec![10i64, 100])),
        )
        .with_objective(Component::new("quadratic", |_: &Parameters| {
            Ok(Box::new(Quadratic::default()) as Box<dyn Objective>)
        }))
        .with_solver(
            Component::new("gd", |p: &Parameters| {
                Ok(Box::new(GradientDescent {
                    step: param(p, "step", 1.0),
                    a: Vec::new(),
                    b: Vec::new(),
                    x: Vec::new(),
                }) as Box<dyn Solver>)
            })
            .with_grid(ParameterGrid::new().add("step", vec![0.5, 1.0]))
            .with_version("1"),
        )
        .with_solver(
            Component::new("heavy-ball", |p: &Parameters| {
                Ok(Box::new(HeavyBall {
                    momentum: param(p, "momentum", 0.9),
                    a: Vec::new(),
                    b: Vec::new(),
                    x: Vec::new(),
                }) as Box<dyn Solver>)
            })
            .with_version("1"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let parallel = match std::env::var("OPTIBENCH_PARALLEL") {
        Ok(path) => ParallelConfig::from_file(path)?,
        Err(_) => ParallelConfig::Sequential,
    };
    let n_jobs = std::env::var("OPTIBENCH_N_JOBS")
        .ok()
        .map(|n| n.parse::<usize>())
        .transpose()?;
    let config = BenchmarkConfig::new()
        .with_max_runs(50)
        .with_parallel(parallel.with_n_jobs(n_jobs));

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    let (tx, rx) = crossbeam_channel::unbounded();
    let progress = std::thread::spawn(move || {
        for event in rx {
            if let ProgressEvent::Point {
                trial,
                stop_val,
                progress,
            } = event
            {
                tracing::debug!(%trial, %stop_val, progress, "point");
            }
        }
    });

    let registry = Arc::new(registry());
    let table =
        tokio::task::spawn_blocking(move || run_benchmark(registry, &config, Some(tx), cancel))
            .await??;
    if progress.join().is_err() {
        warn!("progress reporter panicked");
    }

    println!("{table}");
    if let Ok(path) = std::env::var("OPTIBENCH_OUTPUT") {
        table.write_parquet(&path)?;
        info!("results written to {path}");
    }
    Ok(())
}
