//! Request and response types for agent service operations.
//!
//! These types define the API contracts independently of any wire format.

use mpc_remote_core::{Model, ModelOverrides, PolicyVersion, SimulationState};
use serde::{Deserialize, Serialize};

// =============================================================================
// Agent
// =============================================================================

/// Request to select a task and build a fresh session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitRequest {
    /// Index into the task registry.
    pub task_index: usize,
    /// Optional changes to the task's default model.
    #[serde(default)]
    pub model_overrides: Option<ModelOverrides>,
}

impl InitRequest {
    /// Initialize the task at `task_index` with its default model.
    #[must_use]
    pub const fn new(task_index: usize) -> Self {
        Self {
            task_index,
            model_overrides: None,
        }
    }

    /// Initialize with model overrides.
    #[must_use]
    pub const fn with_overrides(task_index: usize, overrides: ModelOverrides) -> Self {
        Self {
            task_index,
            model_overrides: Some(overrides),
        }
    }
}

/// Result of a successful `Init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitResponse {
    /// Id of the selected task.
    pub task_id: String,
    /// Index of the selected task.
    pub task_index: usize,
    /// Number of generalized positions.
    pub nq: usize,
    /// Number of generalized velocities.
    pub nv: usize,
    /// Number of actuators.
    pub nu: usize,
    /// Number of sensor values.
    pub nsensor: usize,
    /// Integration timestep after overrides.
    pub timestep: f64,
    /// The freshly allocated state.
    pub state: SimulationState,
}

/// Request for the committed policy's action.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GetActionRequest {
    /// Evaluation time; the current simulation time when absent.
    #[serde(default)]
    pub time: Option<f64>,
}

/// A control vector and the policy version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Time the policy was evaluated at.
    pub time: f64,
    /// Control vector, length `nu`.
    pub action: Vec<f64>,
    /// Version of the policy that was read.
    pub version: PolicyVersion,
}

/// Request to run planner iterations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlannerStepRequest {
    /// Iterations to run; the configured default when absent.
    #[serde(default)]
    pub iterations: Option<usize>,
    /// Wall-clock budget in milliseconds; unbounded when absent.
    #[serde(default)]
    pub time_budget_ms: Option<u64>,
}

/// Result of a `PlannerStep`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerStepResponse {
    /// Iterations actually run.
    pub iterations: usize,
    /// Cost of the committed candidate.
    pub best_cost: f64,
    /// Rollouts that diverged or panicked.
    pub failed_rollouts: usize,
    /// Version of the newly committed policy.
    pub version: PolicyVersion,
}

/// Request to advance the simulation by one tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepRequest {
    /// Write the committed policy's action to `ctrl` before stepping.
    #[serde(default = "StepRequest::default_use_policy")]
    pub use_policy: bool,
}

impl StepRequest {
    const fn default_use_policy() -> bool {
        true
    }

    /// Step with the current `ctrl`, ignoring the policy.
    #[must_use]
    pub const fn manual() -> Self {
        Self { use_policy: false }
    }
}

impl Default for StepRequest {
    fn default() -> Self {
        Self {
            use_policy: Self::default_use_policy(),
        }
    }
}

/// Result of a `Step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    /// State after the tick.
    pub state: SimulationState,
    /// Policy version used, when the policy was applied.
    pub version: Option<PolicyVersion>,
    /// Absolute estimator slot index the observation was recorded in.
    pub estimator_index: Option<u64>,
}

// =============================================================================
// Estimator
// =============================================================================

/// Request to create the estimator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitEstimatorRequest {
    /// Window length; the configured default when absent.
    #[serde(default)]
    pub window_length: Option<usize>,
    /// Model to estimate with; the agent's current model when absent.
    #[serde(default)]
    pub model: Option<Model>,
    /// Changes applied on top of the chosen model.
    #[serde(default)]
    pub model_overrides: Option<ModelOverrides>,
}

/// Dimensions of an initialized estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorInfo {
    /// Name of the bound model.
    pub model_name: String,
    /// Window length.
    pub window_length: usize,
    /// Number of generalized positions.
    pub nq: usize,
    /// Number of generalized velocities.
    pub nv: usize,
    /// Number of actuators.
    pub nu: usize,
    /// Number of sensor values.
    pub nsensor: usize,
    /// Model timestep.
    pub timestep: f64,
}

/// Optimizer settings of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorSettings {
    /// Number of slots in the window.
    pub window_length: usize,
    /// Gauss-Newton iteration limit.
    pub max_iterations: usize,
    /// Convergence threshold on the gradient and step norms.
    pub tolerance: f64,
    /// Initial Levenberg-Marquardt damping.
    pub regularization: f64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            window_length: 10,
            max_iterations: 10,
            tolerance: 1.0e-6,
            regularization: 1.0e-6,
        }
    }
}

/// Partial update of [`EstimatorSettings`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EstimatorSettingsUpdate {
    /// New window length.
    #[serde(default)]
    pub window_length: Option<usize>,
    /// New iteration limit.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// New tolerance.
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// New initial damping.
    #[serde(default)]
    pub regularization: Option<f64>,
}

/// Residual weights of the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorWeights {
    /// Weight on deviation from the prior configurations.
    pub prior: f64,
    /// Per-sensor weights, length `nsensor`.
    pub sensor: Vec<f64>,
    /// Per-velocity-dimension force weights, length `nv`.
    pub force: Vec<f64>,
}

impl EstimatorWeights {
    /// Default weights sized for `model`.
    #[must_use]
    pub fn for_model(model: &Model) -> Self {
        Self {
            prior: 1.0e-4,
            sensor: vec![1.0; model.nsensor()],
            force: vec![1.0; model.nv()],
        }
    }
}

/// Partial update of [`EstimatorWeights`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimatorWeightsUpdate {
    /// New prior weight.
    #[serde(default)]
    pub prior: Option<f64>,
    /// New sensor weights.
    #[serde(default)]
    pub sensor: Option<Vec<f64>>,
    /// New force weights.
    #[serde(default)]
    pub force: Option<Vec<f64>>,
}

/// Cost breakdown of an estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorCosts {
    /// Sum of the parts below.
    pub total: f64,
    /// Sensor prediction cost.
    pub sensor: f64,
    /// Inverse dynamics force cost.
    pub force: f64,
    /// Prior deviation cost.
    pub prior: f64,
}

/// Convergence report of the last optimization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorStatus {
    /// Iterations run.
    pub iterations: usize,
    /// Whether a tolerance was reached.
    pub converged: bool,
    /// Gradient norm at the last linearization.
    pub gradient_norm: f64,
    /// Norm of the last accepted step.
    pub step_norm: f64,
    /// Damping in effect at the end.
    pub regularization: f64,
    /// Cost before the first iteration.
    pub initial_cost: f64,
    /// Cost after the last iteration.
    pub final_cost: f64,
    /// Number of completed optimizations since `InitEstimator`.
    pub optimizations: u64,
}

/// Request to optimize the estimator window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OptimizeEstimatorRequest {
    /// Iterations to run; `max_iterations` from the settings when absent.
    #[serde(default)]
    pub iterations: Option<usize>,
}

/// Result of `ShiftEstimatorTrajectories`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftResponse {
    /// Absolute index of the oldest slot after the shift.
    pub first_index: u64,
    /// Number of slots in the window.
    pub window_length: usize,
}
