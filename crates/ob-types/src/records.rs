//! Precision values, cost records, convergence curves and trial outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Metric used for convergence detection. Every objective must report it.
pub const VALUE_METRIC: &str = "value";

/// Objective metrics for one evaluation, keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// How the precision of a solver run is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// `stop_val` is a number of solver steps.
    Iteration,
    /// `stop_val` is a target tolerance decreasing toward zero.
    Tolerance,
    /// The solver calls back into the engine at each step.
    Callback,
    /// The solver runs once; a single point is recorded.
    RunOnce,
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Iteration => "iteration",
            Self::Tolerance => "tolerance",
            Self::Callback => "callback",
            Self::RunOnce => "run_once",
        };
        f.write_str(s)
    }
}

/// Convergence policy of a stopping criterion, chosen per solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoppingPolicy {
    SufficientDescent { eps: f64, patience: usize },
    SufficientProgress { eps: f64, patience: usize },
    SingleRun,
}

impl StoppingPolicy {
    pub const EPS: f64 = 1e-10;
    pub const PATIENCE: usize = 3;

    pub fn sufficient_descent() -> Self {
        Self::SufficientDescent {
            eps: Self::EPS,
            patience: Self::PATIENCE,
        }
    }

    pub fn sufficient_progress() -> Self {
        Self::SufficientProgress {
            eps: Self::EPS,
            patience: Self::PATIENCE,
        }
    }
}

impl Default for StoppingPolicy {
    fn default() -> Self {
        Self::sufficient_progress()
    }
}

/// Precision requested from a solver before the next measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopVal {
    /// Number of steps (`iteration` and `callback` strategies).
    Iterations(u64),
    /// Target tolerance (`tolerance` strategy).
    Tolerance(f64),
}

impl StopVal {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Iterations(n) => *n as f64,
            Self::Tolerance(t) => *t,
        }
    }

    pub fn iterations(&self) -> Option<u64> {
        match self {
            Self::Iterations(n) => Some(*n),
            Self::Tolerance(_) => None,
        }
    }

    pub fn tolerance(&self) -> Option<f64> {
        match self {
            Self::Tolerance(t) => Some(*t),
            Self::Iterations(_) => None,
        }
    }
}

impl fmt::Display for StopVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iterations(n) => write!(f, "{n}"),
            Self::Tolerance(t) => write!(f, "{t:.3e}"),
        }
    }
}

/// Identifies one (dataset, objective, solver, repetition) combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub dataset: String,
    pub objective: String,
    pub solver: String,
    pub repetition: usize,
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {} (rep {})",
            self.dataset, self.objective, self.solver, self.repetition
        )
    }
}

/// One evaluation point of a convergence curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub key: TrialKey,
    pub stop_val: StopVal,
    /// Solver wall time in seconds, excluding objective evaluation.
    pub time: f64,
    #[serde(with = "metrics_serde")]
    pub metrics: Metrics,
}

impl CostRecord {
    /// The convergence metric, NaN when absent.
    pub fn value(&self) -> f64 {
        self.metrics.get(VALUE_METRIC).copied().unwrap_or(f64::NAN)
    }
}

/// Non-finite metrics are stored as `null` and read back as NaN, since JSON
/// has no representation for them.
mod metrics_serde {
    use super::*;

    pub fn serialize<S: Serializer>(metrics: &Metrics, s: S) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, Option<f64>> = metrics
            .iter()
            .map(|(k, v)| (k, v.is_finite().then_some(*v)))
            .collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Metrics, D::Error> {
        let decoded = BTreeMap::<String, Option<f64>>::deserialize(d)?;
        Ok(decoded
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
            .collect())
    }
}

/// Ordered evaluation points of one trial. Append-only until finalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCurve {
    records: Vec<CostRecord>,
    #[serde(default)]
    finalized: bool,
}

impl ConvergenceCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: CostRecord) {
        debug_assert!(!self.finalized, "cannot append to a finalized curve");
        if !self.finalized {
            self.records.push(record);
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = CostRecord>) {
        for record in records {
            self.push(record);
        }
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn records(&self) -> &[CostRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&CostRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<CostRecord> {
        self.records
    }
}

/// Lifecycle state of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Done,
    Diverged,
    Timeout,
    MaxRuns,
    Error,
    Interrupted,
    Skipped,
    /// Collect mode found no cached result for this trial.
    NotRun,
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Precedence when several repetitions end differently.
    fn severity(&self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Done => 1,
            Self::MaxRuns => 2,
            Self::NotRun => 3,
            Self::Timeout => 4,
            Self::Skipped => 5,
            Self::Diverged => 6,
            Self::Interrupted => 7,
            Self::Error => 8,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Diverged => "diverged",
            Self::Timeout => "done (timeout)",
            Self::MaxRuns => "done (not enough run)",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
            Self::Skipped => "skip",
            Self::NotRun => "not run yet",
        };
        f.write_str(s)
    }
}

/// Final result of one trial, partial curves included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    /// `dataset / objective / solver` display name.
    pub name: String,
    pub dataset: String,
    pub objective: String,
    pub solver: String,
    pub status: TrialStatus,
    pub curve: ConvergenceCurve,
    /// Error text for failed trials, reason for skipped ones.
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrialOutcome {
    /// Last recorded convergence value, if any.
    pub fn final_value(&self) -> Option<f64> {
        self.curve.last().map(CostRecord::value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: f64) -> CostRecord {
        let mut metrics = Metrics::new();
        metrics.insert(VALUE_METRIC.to_string(), value);
        metrics.insert("support_size".to_string(), f64::INFINITY);
        CostRecord {
            key: TrialKey {
                dataset: "simulated".into(),
                objective: "lasso".into(),
                solver: "gd".into(),
                repetition: 0,
            },
            stop_val: StopVal::Iterations(4),
            time: 0.125,
            metrics,
        }
    }

    #[test]
    fn stop_val_untagged_round_trip() {
        let it: StopVal = serde_json::from_str("12").unwrap();
        assert_eq!(it, StopVal::Iterations(12));

        let tol: StopVal = serde_json::from_str("1.0").unwrap();
        assert_eq!(tol, StopVal::Tolerance(1.0));
    }

    #[test]
    fn non_finite_metrics_survive_json() {
        let json = serde_json::to_string(&record(f64::NAN)).unwrap();
        let back: CostRecord = serde_json::from_str(&json).unwrap();
        assert!(back.value().is_nan());
        assert!(back.metrics["support_size"].is_nan());
        assert_eq!(back.time, 0.125);
    }

    #[test]
    fn missing_value_metric_is_nan() {
        let mut r = record(1.0);
        r.metrics.remove(VALUE_METRIC);
        assert!(r.value().is_nan());
    }

    #[test]
    fn curve_is_append_only_until_finalized() {
        let mut curve = ConvergenceCurve::new();
        curve.push(record(2.0));
        curve.push(record(1.0));
        curve.finalize();

        assert!(curve.is_finalized());
        assert_eq!(curve.len(), 2);
        assert_eq!(curve.last().unwrap().value(), 1.0);
    }

    #[test]
    fn status_aggregation_prefers_divergence() {
        assert_eq!(TrialStatus::Done.worst(TrialStatus::Timeout), TrialStatus::Timeout);
        assert_eq!(TrialStatus::Diverged.worst(TrialStatus::Timeout), TrialStatus::Diverged);
        assert_eq!(TrialStatus::MaxRuns.worst(TrialStatus::Done), TrialStatus::MaxRuns);
        assert!(!TrialStatus::Running.is_terminal());
        assert!(TrialStatus::Skipped.is_terminal());
    }
}
