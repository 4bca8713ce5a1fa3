//! Estimator coordination.
//!
//! The [`EstimatorCoordinator`] owns at most one [`EstimatorSession`]: a
//! bound model plus a single-writer, multi-reader estimator state. An
//! optimization holds an upgradable read lock for the whole solve, so
//! readers keep going while writers wait, and upgrades only to commit.

pub mod batch;
pub mod window;

use std::sync::Arc;

use mpc_remote_core::{Model, Physics};
use mpc_remote_pool::WorkerPool;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::types::{
    EstimatorCosts, EstimatorInfo, EstimatorSettings, EstimatorSettingsUpdate, EstimatorStatus,
    EstimatorWeights, EstimatorWeightsUpdate, ShiftResponse,
};

pub use batch::{BatchSmoother, Problem, SmootherOutcome};
pub use window::{Dimensions, Observation, SlotData, SlotUpdate, Window};

/// Bounds applied to every estimator request.
#[derive(Debug, Clone, Copy)]
pub struct EstimatorLimits {
    /// Settings installed by `InitEstimator`.
    pub defaults: EstimatorSettings,
    /// Largest admissible window length.
    pub max_window_length: usize,
    /// Largest iteration count one optimization may run.
    pub max_iterations: usize,
}

impl EstimatorLimits {
    /// Limits taken from the service configuration.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            defaults: config.estimator_defaults(),
            max_window_length: config.max_estimator_window,
            max_iterations: config.estimator_max_iterations,
        }
    }

    fn check_window_length(&self, len: usize) -> Result<()> {
        if (ServiceConfig::MIN_ESTIMATOR_WINDOW..=self.max_window_length).contains(&len) {
            Ok(())
        } else {
            Err(ServiceError::invalid(format!(
                "window length {len} outside [{}, {}]",
                ServiceConfig::MIN_ESTIMATOR_WINDOW,
                self.max_window_length
            )))
        }
    }
}

#[derive(Debug)]
struct EstimatorState {
    window: Window,
    settings: EstimatorSettings,
    weights: EstimatorWeights,
    status: EstimatorStatus,
    // None once the window or weights change after an optimization.
    last_costs: Option<EstimatorCosts>,
}

/// One `InitEstimator` worth of estimator state.
#[derive(Debug)]
pub struct EstimatorSession {
    model: Model,
    state: RwLock<EstimatorState>,
}

impl EstimatorSession {
    /// The model the estimator runs against.
    #[must_use]
    pub const fn model(&self) -> &Model {
        &self.model
    }
}

/// Owns the estimator lifecycle.
#[derive(Debug)]
pub struct EstimatorCoordinator {
    physics: Arc<dyn Physics>,
    pool: Arc<WorkerPool>,
    limits: EstimatorLimits,
    session: RwLock<Option<Arc<EstimatorSession>>>,
}

impl EstimatorCoordinator {
    /// Create an uninitialized coordinator.
    #[must_use]
    pub fn new(physics: Arc<dyn Physics>, pool: Arc<WorkerPool>, limits: EstimatorLimits) -> Self {
        Self {
            physics,
            pool,
            limits,
            session: RwLock::new(None),
        }
    }

    /// Whether `InitEstimator` has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.session.read().is_some()
    }

    fn session(&self) -> Result<Arc<EstimatorSession>> {
        self.session
            .read()
            .clone()
            .ok_or(ServiceError::NotInitialized("estimator"))
    }

    /// Bind `model` and allocate a fresh window.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` if the model is invalid or
    /// the window length is outside the configured range.
    pub fn init(&self, model: Model, window_length: Option<usize>) -> Result<EstimatorInfo> {
        model.validate()?;
        let window_length = window_length.unwrap_or(self.limits.defaults.window_length);
        self.limits.check_window_length(window_length)?;

        let settings = EstimatorSettings {
            window_length,
            ..self.limits.defaults
        };
        let state = EstimatorState {
            window: Window::new(Dimensions::of(&model), window_length),
            settings,
            weights: EstimatorWeights::for_model(&model),
            status: EstimatorStatus::default(),
            last_costs: None,
        };
        let info = EstimatorInfo {
            model_name: model.name.clone(),
            window_length,
            nq: model.nq(),
            nv: model.nv(),
            nu: model.nu(),
            nsensor: model.nsensor(),
            timestep: model.timestep,
        };

        *self.session.write() = Some(Arc::new(EstimatorSession {
            model,
            state: RwLock::new(state),
        }));
        tracing::info!(
            model = %info.model_name,
            window_length,
            "Initialized estimator"
        );
        Ok(info)
    }

    /// Write fields of the slot at window position `index`.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, `OutOfRange` or `InvalidArgument`.
    pub fn set_data(&self, index: usize, update: &SlotUpdate) -> Result<SlotData> {
        let session = self.session()?;
        let mut state = session.state.write();
        let data = state.window.set(index, update)?;
        state.last_costs = None;
        Ok(data)
    }

    /// Read the slot at window position `index`.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` or `OutOfRange`.
    pub fn get_data(&self, index: usize) -> Result<SlotData> {
        self.session()?.state.read().window.data(index)
    }

    /// Apply a settings update.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, or `InvalidArgument` for an out-of-range
    /// value; nothing is changed in that case.
    pub fn set_settings(&self, update: &EstimatorSettingsUpdate) -> Result<EstimatorSettings> {
        if let Some(len) = update.window_length {
            self.limits.check_window_length(len)?;
        }
        if let Some(iterations) = update.max_iterations {
            if iterations == 0 || iterations > self.limits.max_iterations {
                return Err(ServiceError::invalid(format!(
                    "max_iterations {iterations} outside [1, {}]",
                    self.limits.max_iterations
                )));
            }
        }
        if let Some(tolerance) = update.tolerance {
            if !(tolerance.is_finite() && tolerance > 0.0) {
                return Err(ServiceError::invalid(format!(
                    "tolerance must be positive, got {tolerance}"
                )));
            }
        }
        if let Some(regularization) = update.regularization {
            if !(regularization.is_finite() && regularization >= 0.0) {
                return Err(ServiceError::invalid(format!(
                    "regularization must be non-negative, got {regularization}"
                )));
            }
        }

        let session = self.session()?;
        let mut state = session.state.write();
        if let Some(len) = update.window_length {
            if len != state.window.len() {
                state.window.resize(len);
                state.last_costs = None;
                tracing::debug!(window_length = len, "Resized estimator window");
            }
            state.settings.window_length = len;
        }
        if let Some(iterations) = update.max_iterations {
            state.settings.max_iterations = iterations;
        }
        if let Some(tolerance) = update.tolerance {
            state.settings.tolerance = tolerance;
        }
        if let Some(regularization) = update.regularization {
            state.settings.regularization = regularization;
        }
        Ok(state.settings)
    }

    /// Current settings.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `InitEstimator`.
    pub fn get_settings(&self) -> Result<EstimatorSettings> {
        Ok(self.session()?.state.read().settings)
    }

    /// Apply a weights update.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, or `InvalidArgument` for a wrong length or
    /// a negative or non-finite weight.
    pub fn set_weights(&self, update: &EstimatorWeightsUpdate) -> Result<EstimatorWeights> {
        let session = self.session()?;
        let model = session.model();

        if let Some(prior) = update.prior {
            check_weights("prior", 1, &[prior])?;
        }
        if let Some(sensor) = &update.sensor {
            check_weights("sensor", model.nsensor(), sensor)?;
        }
        if let Some(force) = &update.force {
            check_weights("force", model.nv(), force)?;
        }

        let mut state = session.state.write();
        if let Some(prior) = update.prior {
            state.weights.prior = prior;
        }
        if let Some(sensor) = &update.sensor {
            state.weights.sensor.clone_from(sensor);
        }
        if let Some(force) = &update.force {
            state.weights.force.clone_from(force);
        }
        state.last_costs = None;
        Ok(state.weights.clone())
    }

    /// Current weights.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `InitEstimator`.
    pub fn get_weights(&self) -> Result<EstimatorWeights> {
        Ok(self.session()?.state.read().weights.clone())
    }

    /// Discard the oldest `n` slots.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, or `InvalidArgument` if `n` exceeds the
    /// window length.
    pub fn shift(&self, n: usize) -> Result<ShiftResponse> {
        let session = self.session()?;
        let mut state = session.state.write();
        state.window.shift(n)?;
        if n > 0 {
            state.last_costs = None;
        }
        tracing::debug!(
            shift = n,
            first_index = state.window.first_index(),
            "Shifted estimator window"
        );
        Ok(ShiftResponse {
            first_index: state.window.first_index(),
            window_length: state.window.len(),
        })
    }

    /// Clear the window and results, keeping settings and weights.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `InitEstimator`.
    pub fn reset(&self) -> Result<()> {
        let session = self.session()?;
        let mut state = session.state.write();
        state.window.reset();
        state.status = EstimatorStatus::default();
        state.last_costs = None;
        tracing::info!("Reset estimator");
        Ok(())
    }

    /// Smooth the window. Blocks the calling thread for the whole solve.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, `InvalidArgument` for a zero iteration
    /// count or an unfilled window, and `NumericalFailure` if the solver
    /// fails; the previous estimate is kept on failure.
    pub fn optimize(&self, iterations: Option<usize>) -> Result<EstimatorStatus> {
        if iterations == Some(0) {
            return Err(ServiceError::invalid("iterations must be positive"));
        }
        let session = self.session()?;
        let state = session.state.upgradable_read();

        let cap = state.settings.max_iterations.min(self.limits.max_iterations);
        let requested = iterations.unwrap_or(cap);
        if requested > cap {
            tracing::warn!(requested, cap, "Truncated estimator iteration budget");
        }
        let iterations = requested.min(cap);

        let problem = Arc::new(Problem::from_window(
            &state.window,
            &session.model,
            Arc::clone(&self.physics),
            &state.weights,
        )?);
        let outcome = BatchSmoother::optimize(&problem, &state.settings, iterations, &self.pool)
            .inspect_err(|err| tracing::warn!(error = %err, "Estimator optimization failed"))?;
        let estimate = problem.estimate(&outcome.configurations);

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.window.commit(&estimate)?;
        state.status = EstimatorStatus {
            optimizations: state.status.optimizations + 1,
            ..outcome.status
        };
        state.last_costs = Some(outcome.costs);

        tracing::debug!(
            iterations = state.status.iterations,
            converged = state.status.converged,
            cost = state.status.final_cost,
            "Optimized estimator"
        );
        Ok(state.status)
    }

    /// Cost of the last estimate, or of the current window if it has not
    /// been optimized since it last changed. An unfilled window without a
    /// previous estimate reports zero.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `InitEstimator`.
    pub fn costs(&self) -> Result<EstimatorCosts> {
        let session = self.session()?;
        let state = session.state.read();
        if let Some(costs) = state.last_costs {
            return Ok(costs);
        }
        if !state.window.is_filled() {
            return Ok(EstimatorCosts::default());
        }
        let problem = Problem::from_window(
            &state.window,
            &session.model,
            Arc::clone(&self.physics),
            &state.weights,
        )?;
        Ok(problem.costs(&problem.initial_guess()))
    }

    /// Status of the last optimization.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `InitEstimator`.
    pub fn status(&self) -> Result<EstimatorStatus> {
        Ok(self.session()?.state.read().status)
    }

    /// Run `f` with the window held for writing.
    ///
    /// Observations handed to the sink land in the window in the order the
    /// calls to `recording` acquired it. Without an estimator the sink
    /// records nothing and no lock is taken.
    pub fn recording<T>(&self, f: impl FnOnce(&mut ObservationSink<'_>) -> T) -> T {
        let Some(session) = self.session.read().clone() else {
            return f(&mut ObservationSink { state: None });
        };
        let mut state = session.state.write();
        f(&mut ObservationSink {
            state: Some(&mut *state),
        })
    }

    /// Record an observation from a committed simulation step.
    ///
    /// Returns the slot's absolute index, or `None` if no estimator is
    /// initialized or the observation does not fit its model.
    pub fn append_observation(&self, observation: &Observation) -> Option<u64> {
        self.recording(|sink| sink.record(observation))
    }
}

/// Write access to the estimator window for one simulation step.
#[derive(Debug)]
pub struct ObservationSink<'a> {
    state: Option<&'a mut EstimatorState>,
}

impl ObservationSink<'_> {
    /// Append `observation` as the newest slot.
    ///
    /// Returns the slot's absolute index, or `None` if there is no
    /// estimator or the observation does not fit its model.
    pub fn record(&mut self, observation: &Observation) -> Option<u64> {
        let state = self.state.as_deref_mut()?;
        match state.window.append(observation) {
            Ok(index) => {
                state.last_costs = None;
                Some(index)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Observation not recorded by estimator");
                None
            }
        }
    }
}

fn check_weights(field: &str, expected: usize, values: &[f64]) -> Result<()> {
    if values.len() != expected {
        return Err(ServiceError::invalid(format!(
            "{field} weights have length {}, expected {expected}",
            values.len()
        )));
    }
    if let Some(value) = values.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
        return Err(ServiceError::invalid(format!(
            "{field} weight {value} must be finite and non-negative"
        )));
    }
    Ok(())
}
