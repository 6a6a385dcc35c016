//! Per-trial stopping criterion.
//!
//! The criterion decides, after each evaluated precision level, whether the
//! trial is finished and which `stop_val` to request next. It owns all the
//! adaptive state of one trial and is never shared.

use ob_types::{GrowthFn, SamplingStrategy, StopVal, StoppingPolicy, TrialStatus};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Largest iteration count ever requested.
pub const MAX_ITER: u64 = 1_000_000_000_000;
/// Smallest tolerance ever requested.
pub const MIN_TOL: f64 = 1e-15;
/// Initial tolerance sentinel (largest `f32`).
pub const INFINITY: f64 = 3e38;
/// Initial growth factor.
pub const RHO: f64 = 1.5;
/// Growth factor multiplier applied on a flat step.
pub const RHO_INC: f64 = 1.2;
/// Normalized change below which a step counts as divergence.
pub const DIVERGENCE_THRESHOLD: f64 = -1e5;

/// Outcome of [`StoppingCriterion::should_stop`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub stop: bool,
    pub status: TrialStatus,
    /// Precision to request next. Unchanged when stopping.
    pub next: StopVal,
    /// Estimated progress toward convergence, in `[0, 1]`.
    pub progress: f64,
}

pub struct StoppingCriterion {
    strategy: SamplingStrategy,
    policy: StoppingPolicy,
    max_runs: usize,
    deadline: Option<Instant>,
    rho: f64,
    window: VecDeque<f64>,
    prev_value: Option<f64>,
    best_value: Option<f64>,
    growth: Option<GrowthFn>,
}

impl fmt::Debug for StoppingCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoppingCriterion")
            .field("strategy", &self.strategy)
            .field("policy", &self.policy)
            .field("max_runs", &self.max_runs)
            .field("deadline", &self.deadline)
            .field("rho", &self.rho)
            .field("window", &self.window)
            .field("custom_growth", &self.growth.is_some())
            .finish()
    }
}

impl StoppingCriterion {
    /// Create a criterion whose deadline starts now. `run_once` always uses
    /// the single-run policy.
    pub fn new(
        strategy: SamplingStrategy,
        policy: StoppingPolicy,
        max_runs: usize,
        timeout: Option<Duration>,
    ) -> Self {
        let policy = match strategy {
            SamplingStrategy::RunOnce => StoppingPolicy::SingleRun,
            _ => policy,
        };
        Self {
            strategy,
            policy,
            max_runs,
            deadline: timeout.map(|t| Instant::now() + t),
            rho: RHO,
            window: VecDeque::new(),
            prev_value: None,
            best_value: None,
            growth: None,
        }
    }

    /// Replace the default growth of `stop_val`.
    pub fn with_growth(mut self, growth: Option<GrowthFn>) -> Self {
        self.growth = growth;
        self
    }

    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }

    pub fn policy(&self) -> StoppingPolicy {
        self.policy
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    /// Precision of the first evaluation.
    pub fn init(&self) -> StopVal {
        match self.strategy {
            SamplingStrategy::Iteration | SamplingStrategy::Callback => StopVal::Iterations(0),
            SamplingStrategy::Tolerance => StopVal::Tolerance(INFINITY),
            SamplingStrategy::RunOnce => StopVal::Iterations(1),
        }
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Account for one more evaluated point and decide what happens next.
    ///
    /// `values` holds the representative `value` of every evaluation so
    /// far, the initial one included, and must grow by exactly one between
    /// calls.
    pub fn should_stop(&mut self, stop_val: StopVal, values: &[f64]) -> Decision {
        let n_eval = values.len().saturating_sub(1);
        let value = values.last().copied().unwrap_or(f64::NAN);
        let scale = match values.first() {
            Some(first) if first.is_finite() && *first != 0.0 => first.abs(),
            _ => 1.0,
        };

        let raw_delta = self.prev_value.map(|prev| prev - value);
        let delta = raw_delta.map(|d| d / scale);
        self.prev_value = Some(value);

        let stopped = |status, progress| Decision {
            stop: true,
            status,
            next: stop_val,
            progress,
        };

        if value.is_nan() || delta.is_some_and(|d| d < DIVERGENCE_THRESHOLD) {
            debug!(?delta, n_eval, "diverged");
            return stopped(TrialStatus::Diverged, 1.0);
        }
        if self.is_past_deadline() {
            return stopped(TrialStatus::Timeout, 1.0);
        }
        if n_eval >= self.max_runs {
            return stopped(TrialStatus::MaxRuns, 1.0);
        }

        let (converged, convergence_progress) = self.check_convergence(value, delta, scale);
        if converged {
            debug!(?delta, n_eval, "converged");
            return stopped(TrialStatus::Done, 1.0);
        }

        if raw_delta == Some(0.0) {
            self.rho *= RHO_INC;
            debug!(rho = self.rho, "flat step, increasing rho");
        }

        let eval_progress = n_eval as f64 / self.max_runs.max(1) as f64;
        Decision {
            stop: false,
            status: TrialStatus::Running,
            next: self.next_stop_val(stop_val),
            progress: convergence_progress.min(eval_progress).clamp(0.0, 1.0),
        }
    }

    /// Update the convergence window with the latest value. `delta` is the
    /// normalized change from the previous value.
    fn check_convergence(&mut self, value: f64, delta: Option<f64>, scale: f64) -> (bool, f64) {
        let (eps, patience) = match self.policy {
            StoppingPolicy::SingleRun => return (true, 1.0),
            StoppingPolicy::SufficientDescent { eps, patience }
            | StoppingPolicy::SufficientProgress { eps, patience } => (eps, patience.max(1)),
        };

        let threshold = match self.policy {
            StoppingPolicy::SufficientDescent { .. } => {
                if let Some(delta) = delta {
                    self.push_delta(delta, patience);
                }
                None
            }
            _ => {
                let best_now = self.best_value.map_or(value, |best| best.min(value));
                if let Some(best_before) = self.best_value {
                    self.push_delta((best_before - best_now) / scale, patience);
                }
                self.best_value = Some(best_now);
                Some(eps * best_now.abs())
            }
        };

        let Some(worst) = self.window.iter().copied().reduce(f64::max) else {
            return (false, 0.0);
        };

        let full = self.window.len() >= patience;
        let converged = full
            && match threshold {
                None => (-eps..=eps).contains(&worst),
                Some(limit) => worst <= limit,
            };

        let progress = worst.abs().max(eps).ln() / eps.ln();
        (converged, progress)
    }

    fn push_delta(&mut self, delta: f64, patience: usize) {
        self.window.push_back(delta);
        while self.window.len() > patience {
            self.window.pop_front();
        }
    }

    /// Default growth: geometric in `rho`, at least one step for counts,
    /// capped to `[MIN_TOL, 1]` for tolerances.
    pub fn next_stop_val(&self, stop_val: StopVal) -> StopVal {
        if let Some(growth) = &self.growth {
            return growth(stop_val);
        }
        match stop_val {
            StopVal::Iterations(x) => {
                let scaled = ((self.rho * x as f64) as u64).min(MAX_ITER);
                StopVal::Iterations(scaled.max(x.saturating_add(1)))
            }
            StopVal::Tolerance(t) => StopVal::Tolerance((t / self.rho).max(MIN_TOL).min(1.0)),
        }
    }
}
