//! Execution of one trial: component setup, the adaptive precision loop
//! and result caching.

use chrono::Utc;
use ob_cache::{CacheKey, CacheMode, CacheOutcome};
use ob_search::{ComponentRef, TaskSpec};
use ob_types::{
    CacheError, ConvergenceCurve, CostRecord, Objective, PluginError, PluginResult,
    RunBudget, SamplingStrategy, Solver, StopVal, StoppingPolicy, TrialKey, TrialOutcome,
    TrialStatus,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error};

use crate::callback::{evaluate_checked, Abort, CallbackRecorder, CallbackRun};
use crate::context::{ProgressEvent, RunContext};
use crate::criterion::StoppingCriterion;

/// Cache namespace of single points of stop-value strategies.
pub const POINT_NAMESPACE: &str = "point";
/// Cache namespace of whole callback runs.
pub const CALLBACK_NAMESPACE: &str = "callback_run";

/// Why a trial ended before its precision loop.
enum TrialStop {
    Skipped(String),
    Failed(String),
}

impl From<PluginError> for TrialStop {
    fn from(e: PluginError) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<CacheError> for TrialStop {
    fn from(e: CacheError) -> Self {
        Self::Failed(e.to_string())
    }
}

#[derive(Serialize)]
struct PointMaterial<'a> {
    dataset: &'a ComponentRef,
    objective: &'a ComponentRef,
    solver: &'a ComponentRef,
    stop_val: StopVal,
    repetition: usize,
}

#[derive(Serialize)]
struct CallbackMaterial<'a> {
    dataset: &'a ComponentRef,
    objective: &'a ComponentRef,
    solver: &'a ComponentRef,
    repetition: usize,
    max_runs: usize,
    timeout_secs: Option<f64>,
}

/// Run one trial to completion. Never fails: every error is folded into
/// the returned status, and the records gathered so far are kept.
pub fn run_trial(ctx: &RunContext, task: &TaskSpec) -> TrialOutcome {
    if ctx.cancel.is_cancelled() {
        return unfinished_outcome(task, TrialStatus::Interrupted);
    }

    let name = task.name();
    let started_at = Utc::now();
    ctx.emit(ProgressEvent::Started {
        trial: name.clone(),
    });

    let mut curve = ConvergenceCurve::new();
    let (status, message) = match execute(ctx, task, &mut curve) {
        Ok(status) => (status, None),
        Err(TrialStop::Skipped(reason)) => {
            debug!(trial = %name, %reason, "trial skipped");
            (TrialStatus::Skipped, Some(reason))
        }
        Err(TrialStop::Failed(message)) => {
            error!(trial = %name, error = %message, "trial failed");
            (TrialStatus::Error, Some(message))
        }
    };
    curve.finalize();

    TrialOutcome {
        name,
        dataset: task.dataset.display_name(),
        objective: task.objective.display_name(),
        solver: task.solver.display_name(),
        status,
        curve,
        message,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Outcome of a trial that never ran, with an empty curve.
pub fn unfinished_outcome(task: &TaskSpec, status: TrialStatus) -> TrialOutcome {
    let now = Utc::now();
    let mut curve = ConvergenceCurve::new();
    curve.finalize();
    TrialOutcome {
        name: task.name(),
        dataset: task.dataset.display_name(),
        objective: task.objective.display_name(),
        solver: task.solver.display_name(),
        status,
        curve,
        message: None,
        started_at: now,
        finished_at: now,
    }
}

fn execute(
    ctx: &RunContext,
    task: &TaskSpec,
    curve: &mut ConvergenceCurve,
) -> Result<TrialStatus, TrialStop> {
    let registry = &ctx.registry;
    let dataset_name = task.dataset.display_name();
    let objective_name = task.objective.display_name();
    let solver_name = task.solver.display_name();

    let data = registry
        .build_dataset(&task.dataset)?
        .get_data()
        .map_err(|e| e.in_component(&dataset_name))?;

    let mut objective = registry.build_objective(&task.objective)?;
    if let Some(reason) = objective.skip(&data) {
        return Err(TrialStop::Skipped(reason));
    }
    objective
        .set_data(&data)
        .map_err(|e| e.in_component(&objective_name))?;
    let problem = objective.get_objective();

    let mut solver = registry.build_solver(&task.solver)?;
    if let Some(reason) = solver.skip(&problem) {
        return Err(TrialStop::Skipped(reason));
    }
    solver
        .set_objective(&problem)
        .map_err(|e| e.in_component(&solver_name))?;

    evaluate_checked(&*objective, &objective.get_baseline_result(), &objective_name)?;

    let mode = cache_mode(ctx.settings.cache_mode, task.force);
    if mode != CacheMode::Collect {
        solver
            .warm_up()
            .map_err(|e| e.in_component(&solver_name))?;
    }

    let strategy = solver
        .sampling_strategy()
        .or_else(|| objective.sampling_strategy())
        .unwrap_or(SamplingStrategy::Iteration);
    let policy = solver
        .stopping_policy()
        .or_else(|| objective.stopping_policy())
        .unwrap_or_default();
    debug!(trial = %task.name(), ?strategy, ?policy, ?mode, "running trial");

    let trial = Trial {
        ctx,
        task,
        objective: &*objective,
        mode,
    };
    match strategy {
        SamplingStrategy::Callback => trial.run_callback(solver.as_mut(), policy, curve),
        _ => trial.run_stop_val(solver.as_mut(), strategy, policy, curve),
    }
}

/// Collect mode applies to every trial, forced or not.
fn cache_mode(configured: CacheMode, force: bool) -> CacheMode {
    match configured {
        CacheMode::Collect => CacheMode::Collect,
        _ if force => CacheMode::Force,
        other => other,
    }
}

struct Trial<'a> {
    ctx: &'a RunContext,
    task: &'a TaskSpec,
    objective: &'a dyn Objective,
    mode: CacheMode,
}

impl Trial<'_> {
    fn key(&self, repetition: usize) -> TrialKey {
        TrialKey {
            dataset: self.task.dataset.display_name(),
            objective: self.task.objective.display_name(),
            solver: self.task.solver.display_name(),
            repetition,
        }
    }

    fn emit_point(&self, stop_val: StopVal, progress: f64) {
        self.ctx.emit(ProgressEvent::Point {
            trial: self.task.name(),
            stop_val,
            progress,
        });
    }

    /// Iteration, tolerance and run-once strategies: one solver run per
    /// repetition at each precision level.
    fn run_stop_val(
        &self,
        solver: &mut dyn Solver,
        strategy: SamplingStrategy,
        policy: StoppingPolicy,
        curve: &mut ConvergenceCurve,
    ) -> Result<TrialStatus, TrialStop> {
        let settings = &self.ctx.settings;
        let n_reps = settings.n_repetitions.max(1);
        let mut criterion =
            StoppingCriterion::new(strategy, policy, settings.max_runs, settings.timeout)
                .with_growth(solver.growth());
        let mut stop_val = criterion.init();
        let mut values = Vec::new();

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(TrialStatus::Interrupted);
            }

            let mut level = Vec::with_capacity(n_reps);
            let measured = self.measure_level(&mut *solver, stop_val, n_reps, &mut level);
            let value = representative(&level);
            curve.extend(level);
            if !measured? {
                return Ok(TrialStatus::NotRun);
            }

            values.push(value);
            let decision = criterion.should_stop(stop_val, &values);
            self.emit_point(stop_val, decision.progress);
            if decision.stop {
                return Ok(decision.status);
            }
            stop_val = decision.next;
        }
    }

    /// Fill `level` with one record per repetition at `stop_val`. Returns
    /// `false` when collect mode found a repetition missing. Records
    /// obtained before a failure stay in `level`.
    fn measure_level(
        &self,
        solver: &mut dyn Solver,
        stop_val: StopVal,
        n_reps: usize,
        level: &mut Vec<CostRecord>,
    ) -> Result<bool, TrialStop> {
        for repetition in 0..n_reps {
            let cache_key = CacheKey::new(
                POINT_NAMESPACE,
                &PointMaterial {
                    dataset: &self.task.dataset,
                    objective: &self.task.objective,
                    solver: &self.task.solver,
                    stop_val,
                    repetition,
                },
            )?;
            let key = self.key(repetition);
            let outcome = self.ctx.cache.get_or_compute(&cache_key, self.mode, || {
                run_one_resolution(&mut *solver, self.objective, key, stop_val)
            })?;
            match outcome {
                CacheOutcome::Hit(record) | CacheOutcome::Computed(record) => level.push(record),
                CacheOutcome::Unavailable => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Callback strategy: one solver run per repetition, evaluated from
    /// inside the solver. Each repetition gets an equal share of the timeout.
    fn run_callback(
        &self,
        solver: &mut dyn Solver,
        policy: StoppingPolicy,
        curve: &mut ConvergenceCurve,
    ) -> Result<TrialStatus, TrialStop> {
        let settings = &self.ctx.settings;
        let n_reps = settings.n_repetitions.max(1);
        let rep_timeout = settings.timeout.map(|t| t / n_reps as u32);
        let mut status = TrialStatus::Done;

        for repetition in 0..n_reps {
            if self.ctx.cancel.is_cancelled() {
                return Ok(TrialStatus::Interrupted);
            }

            let cache_key = CacheKey::new(
                CALLBACK_NAMESPACE,
                &CallbackMaterial {
                    dataset: &self.task.dataset,
                    objective: &self.task.objective,
                    solver: &self.task.solver,
                    repetition,
                    max_runs: settings.max_runs,
                    timeout_secs: settings.timeout.map(|t| t.as_secs_f64()),
                },
            )?;
            let key = self.key(repetition);

            let result = self.ctx.cache.get_or_compute(&cache_key, self.mode, || {
                let criterion = StoppingCriterion::new(
                    SamplingStrategy::Callback,
                    policy,
                    settings.max_runs,
                    rep_timeout,
                )
                .with_growth(solver.growth());
                let init = criterion.init();
                solver
                    .pre_run_hook(init)
                    .map_err(|e| e.in_component(&key.solver))?;

                let mut recorder =
                    CallbackRecorder::new(self.objective, key.clone(), criterion, &self.ctx.cancel);
                let run = {
                    let mut checkpoint = |candidate: &Value| recorder.checkpoint(candidate);
                    solver.run(RunBudget::Callback(&mut checkpoint))
                };
                recorder.finish(run, &*solver)
            });

            match result {
                Ok(CacheOutcome::Hit(run)) | Ok(CacheOutcome::Computed(run)) => {
                    let CallbackRun { records, status: rep_status } = run;
                    if let Some(last) = records.last() {
                        self.emit_point(last.stop_val, 1.0);
                    }
                    curve.extend(records);
                    status = status.worst(rep_status);
                }
                Ok(CacheOutcome::Unavailable) => return Ok(TrialStatus::NotRun),
                Err(Abort::Failed { error, records }) => {
                    curve.extend(records);
                    return Err(error.into());
                }
                Err(Abort::Interrupted { records }) => {
                    curve.extend(records);
                    return Ok(TrialStatus::Interrupted);
                }
            }
        }

        Ok(status)
    }
}

/// One timed solver run at `stop_val`, then one evaluation. Only the
/// solver's own work is timed.
fn run_one_resolution(
    solver: &mut dyn Solver,
    objective: &dyn Objective,
    key: TrialKey,
    stop_val: StopVal,
) -> PluginResult<CostRecord> {
    let in_solver = |e: PluginError| e.in_component(&key.solver);

    solver.pre_run_hook(stop_val).map_err(in_solver)?;
    let start = Instant::now();
    solver.run(RunBudget::StopVal(stop_val)).map_err(in_solver)?;
    let time = start.elapsed().as_secs_f64();

    let candidate = solver.get_result().map_err(in_solver)?;
    let metrics = evaluate_checked(objective, &candidate, &key.objective)?;
    Ok(CostRecord {
        key,
        stop_val,
        time,
        metrics,
    })
}

/// Value driving the stopping decision at one precision level: the worst
/// repetition, NaN if any repetition produced NaN.
fn representative(level: &[CostRecord]) -> f64 {
    let mut worst = f64::NEG_INFINITY;
    for record in level {
        let value = record.value();
        if value.is_nan() {
            return f64::NAN;
        }
        worst = worst.max(value);
    }
    if level.is_empty() {
        f64::NAN
    } else {
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ob_types::{Metrics, VALUE_METRIC};

    fn record(value: f64) -> CostRecord {
        CostRecord {
            key: TrialKey {
                dataset: "d".into(),
                objective: "o".into(),
                solver: "s".into(),
                repetition: 0,
            },
            stop_val: StopVal::Iterations(1),
            time: 0.0,
            metrics: Metrics::from([(VALUE_METRIC.to_string(), value)]),
        }
    }

    #[test]
    fn representative_is_worst_repetition() {
        let level = vec![record(1.0), record(3.0), record(2.0)];
        assert_eq!(representative(&level), 3.0);
    }

    #[test]
    fn representative_propagates_nan() {
        let level = vec![record(1.0), record(f64::NAN)];
        assert!(representative(&level).is_nan());
        assert!(representative(&[]).is_nan());
    }

    #[test]
    fn collect_mode_wins_over_force() {
        assert_eq!(cache_mode(CacheMode::Collect, true), CacheMode::Collect);
        assert_eq!(cache_mode(CacheMode::Normal, true), CacheMode::Force);
        assert_eq!(cache_mode(CacheMode::Normal, false), CacheMode::Normal);
        assert_eq!(cache_mode(CacheMode::Force, false), CacheMode::Force);
    }
}
