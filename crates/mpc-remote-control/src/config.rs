//! Service configuration types.
//!
//! [`ServiceConfig`] sizes the worker pool, bounds the budgets callers may
//! request, and supplies the planner and estimator defaults.

use serde::Deserialize;

use crate::error::{Result, ServiceError};
use crate::planner::PlannerSettings;
use crate::types::EstimatorSettings;

/// Configuration for the agent service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Worker pool size; 0 uses the available hardware parallelism.
    #[serde(default)]
    pub worker_threads: usize,

    /// Iterations run by a `PlannerStep` that does not request a count.
    #[serde(default = "ServiceConfig::default_planner_iterations")]
    pub planner_iterations: usize,

    /// Largest iteration count a `PlannerStep` may request.
    #[serde(default = "ServiceConfig::default_max_planner_iterations")]
    pub max_planner_iterations: usize,

    /// Largest time budget a `PlannerStep` may request, in milliseconds.
    #[serde(default = "ServiceConfig::default_max_time_budget_ms")]
    pub max_time_budget_ms: u64,

    /// Candidate rollouts per planner iteration.
    #[serde(default = "ServiceConfig::default_planner_samples")]
    pub planner_samples: usize,

    /// Planning horizon in seconds.
    #[serde(default = "ServiceConfig::default_planner_horizon")]
    pub planner_horizon: f64,

    /// Number of piecewise-constant spline knots.
    #[serde(default = "ServiceConfig::default_planner_knots")]
    pub planner_knots: usize,

    /// Sampling standard deviation as a fraction of the control range.
    #[serde(default = "ServiceConfig::default_planner_noise")]
    pub planner_noise: f64,

    /// Seed for the planner's random number generator.
    #[serde(default)]
    pub planner_seed: u64,

    /// Window length used by `InitEstimator` when none is requested.
    #[serde(default = "ServiceConfig::default_estimator_window_length")]
    pub estimator_window_length: usize,

    /// Largest admissible estimator window.
    #[serde(default = "ServiceConfig::default_max_estimator_window")]
    pub max_estimator_window: usize,

    /// Largest iteration count an estimator optimization may run.
    #[serde(default = "ServiceConfig::default_estimator_max_iterations")]
    pub estimator_max_iterations: usize,
}

impl ServiceConfig {
    /// Smallest window the batch smoother can work with.
    pub const MIN_ESTIMATOR_WINDOW: usize = 3;

    const fn default_planner_iterations() -> usize {
        1
    }

    const fn default_max_planner_iterations() -> usize {
        64
    }

    const fn default_max_time_budget_ms() -> u64 {
        10_000
    }

    const fn default_planner_samples() -> usize {
        16
    }

    const fn default_planner_horizon() -> f64 {
        0.5
    }

    const fn default_planner_knots() -> usize {
        5
    }

    const fn default_planner_noise() -> f64 {
        0.2
    }

    const fn default_estimator_window_length() -> usize {
        10
    }

    const fn default_max_estimator_window() -> usize {
        256
    }

    const fn default_estimator_max_iterations() -> usize {
        10
    }

    /// Planner settings derived from this configuration.
    #[must_use]
    pub fn planner_settings(&self) -> PlannerSettings {
        PlannerSettings {
            samples: self.planner_samples,
            horizon: self.planner_horizon,
            knots: self.planner_knots,
            noise: self.planner_noise,
            seed: self.planner_seed,
        }
    }

    /// Estimator settings installed by `InitEstimator`.
    #[must_use]
    pub fn estimator_defaults(&self) -> EstimatorSettings {
        EstimatorSettings {
            window_length: self.estimator_window_length,
            max_iterations: self.estimator_max_iterations,
            ..EstimatorSettings::default()
        }
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let fail = |field: &str| Err(ServiceError::invalid(format!("invalid config value: {field}")));

        if self.planner_iterations == 0 || self.planner_iterations > self.max_planner_iterations {
            return fail("planner_iterations");
        }
        if self.planner_samples == 0 {
            return fail("planner_samples");
        }
        if self.planner_knots == 0 {
            return fail("planner_knots");
        }
        if !(self.planner_horizon.is_finite() && self.planner_horizon > 0.0) {
            return fail("planner_horizon");
        }
        if !(self.planner_noise.is_finite() && self.planner_noise >= 0.0) {
            return fail("planner_noise");
        }
        if self.max_estimator_window < Self::MIN_ESTIMATOR_WINDOW {
            return fail("max_estimator_window");
        }
        if !(Self::MIN_ESTIMATOR_WINDOW..=self.max_estimator_window)
            .contains(&self.estimator_window_length)
        {
            return fail("estimator_window_length");
        }
        if self.estimator_max_iterations == 0 {
            return fail("estimator_max_iterations");
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            planner_iterations: Self::default_planner_iterations(),
            max_planner_iterations: Self::default_max_planner_iterations(),
            max_time_budget_ms: Self::default_max_time_budget_ms(),
            planner_samples: Self::default_planner_samples(),
            planner_horizon: Self::default_planner_horizon(),
            planner_knots: Self::default_planner_knots(),
            planner_noise: Self::default_planner_noise(),
            planner_seed: 0,
            estimator_window_length: Self::default_estimator_window_length(),
            max_estimator_window: Self::default_max_estimator_window(),
            estimator_max_iterations: Self::default_estimator_max_iterations(),
        }
    }
}
