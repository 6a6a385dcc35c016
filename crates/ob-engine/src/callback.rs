//! Checkpoint handed to `callback`-strategy solvers.
//!
//! The solver calls [`CallbackRecorder::checkpoint`] with its current
//! iterate after every step. Time spent inside the checkpoint (objective
//! evaluation included) is excluded from the recorded solver time.

use ob_types::{
    CostRecord, Metrics, Objective, PluginError, PluginResult, Solver, StopVal, TrialKey,
    TrialStatus, VALUE_METRIC,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::context::CancelToken;
use crate::criterion::StoppingCriterion;

/// Result of one full callback run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRun {
    pub records: Vec<CostRecord>,
    pub status: TrialStatus,
}

/// A run that ended without a usable result. Records collected before the
/// failure are kept.
#[derive(Debug)]
pub enum Abort {
    Failed {
        error: PluginError,
        records: Vec<CostRecord>,
    },
    Interrupted {
        records: Vec<CostRecord>,
    },
}

impl From<PluginError> for Abort {
    fn from(error: PluginError) -> Self {
        Self::Failed {
            error,
            records: Vec::new(),
        }
    }
}

/// Score a candidate and require the `value` metric.
pub fn evaluate_checked(
    objective: &dyn Objective,
    candidate: &Value,
    objective_name: &str,
) -> PluginResult<Metrics> {
    let metrics = objective
        .evaluate(candidate)
        .map_err(|e| e.in_component(objective_name))?;
    if !metrics.contains_key(VALUE_METRIC) {
        return Err(PluginError::MissingValue {
            component: objective_name.to_string(),
        });
    }
    Ok(metrics)
}

pub struct CallbackRecorder<'a> {
    objective: &'a dyn Objective,
    key: TrialKey,
    criterion: StoppingCriterion,
    cancel: &'a CancelToken,
    records: Vec<CostRecord>,
    values: Vec<f64>,
    status: TrialStatus,
    it: u64,
    next_stop_val: u64,
    time_iter: Duration,
    last_exit: Instant,
    error: Option<PluginError>,
}

impl<'a> CallbackRecorder<'a> {
    pub fn new(
        objective: &'a dyn Objective,
        key: TrialKey,
        criterion: StoppingCriterion,
        cancel: &'a CancelToken,
    ) -> Self {
        let next_stop_val = criterion.init().iterations().unwrap_or(0);
        Self {
            objective,
            key,
            criterion,
            cancel,
            records: Vec::new(),
            values: Vec::new(),
            status: TrialStatus::Running,
            it: 0,
            next_stop_val,
            time_iter: Duration::ZERO,
            last_exit: Instant::now(),
            error: None,
        }
    }

    /// Returns `false` when the solver should return.
    pub fn checkpoint(&mut self, candidate: &Value) -> bool {
        self.time_iter += self.last_exit.elapsed();

        if self.cancel.is_cancelled() {
            self.status = TrialStatus::Interrupted;
            return false;
        }
        if self.it == self.next_stop_val && self.log_value(candidate) {
            return false;
        }

        self.it += 1;
        self.last_exit = Instant::now();
        true
    }

    /// Record one point and ask the criterion whether to stop.
    fn log_value(&mut self, candidate: &Value) -> bool {
        let metrics = match evaluate_checked(self.objective, candidate, &self.key.objective) {
            Ok(metrics) => metrics,
            Err(e) => {
                self.error = Some(e);
                self.status = TrialStatus::Error;
                return true;
            }
        };
        self.push(metrics);

        let decision = self
            .criterion
            .should_stop(StopVal::Iterations(self.next_stop_val), &self.values);
        self.status = decision.status;
        if !decision.stop {
            self.next_stop_val = decision
                .next
                .iterations()
                .unwrap_or(self.it + 1)
                .max(self.it + 1);
        }
        decision.stop
    }

    fn push(&mut self, metrics: Metrics) {
        let record = CostRecord {
            key: self.key.clone(),
            stop_val: StopVal::Iterations(self.it),
            time: self.time_iter.as_secs_f64(),
            metrics,
        };
        self.values.push(record.value());
        self.records.push(record);
    }

    /// Close the run once the solver returned. A solver that returns before
    /// the criterion stopped it has its final iterate recorded and is done.
    pub fn finish(
        mut self,
        run: PluginResult<()>,
        solver: &dyn Solver,
    ) -> Result<CallbackRun, Abort> {
        if let Some(error) = self.error.take() {
            return Err(Abort::Failed {
                error,
                records: self.records,
            });
        }
        if let Err(e) = run {
            return Err(Abort::Failed {
                error: e.in_component(&self.key.solver),
                records: self.records,
            });
        }

        match self.status {
            TrialStatus::Interrupted => {
                return Err(Abort::Interrupted {
                    records: self.records,
                })
            }
            TrialStatus::Running => {
                self.time_iter += self.last_exit.elapsed();
                let final_metrics = solver
                    .get_result()
                    .map_err(|e| e.in_component(&self.key.solver))
                    .and_then(|candidate| {
                        evaluate_checked(self.objective, &candidate, &self.key.objective)
                    });
                match final_metrics {
                    Ok(metrics) => self.push(metrics),
                    Err(error) => {
                        return Err(Abort::Failed {
                            error,
                            records: self.records,
                        })
                    }
                }
                self.status = TrialStatus::Done;
            }
            _ => {}
        }

        Ok(CallbackRun {
            records: self.records,
            status: self.status,
        })
    }
}
