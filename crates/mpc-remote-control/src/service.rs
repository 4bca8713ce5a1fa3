//! Agent service implementation.
//!
//! This module provides the `AgentService` trait and the `AgentServiceImpl`
//! that routes each operation to the agent or estimator coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use mpc_remote_core::{Physics, SemiImplicitEuler, SimulationState, StateUpdate};
use mpc_remote_pool::WorkerPool;
use mpc_remote_tasks::{CostReport, ParameterMap, TaskRegistry, TaskSettings, WeightMap};

use crate::agent::{AgentCoordinator, PlannerLimits};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::estimator::{EstimatorCoordinator, EstimatorLimits, SlotData, SlotUpdate};
use crate::planner::PlannerFactory;
use crate::types::{
    ActionResponse, EstimatorCosts, EstimatorInfo, EstimatorSettings, EstimatorSettingsUpdate,
    EstimatorStatus, EstimatorWeights, EstimatorWeightsUpdate, GetActionRequest,
    InitEstimatorRequest, InitRequest, InitResponse, OptimizeEstimatorRequest, PlannerStepRequest,
    PlannerStepResponse, ShiftResponse, StepRequest, StepResponse,
};

/// Trait defining the remote-control operations of an MPC agent.
///
/// Every operation validates its inputs before touching any state, so a
/// failed call leaves the service exactly as it was.
#[async_trait]
pub trait AgentService: Send + Sync {
    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Select a task and build a fresh session.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown task index or
    /// invalid model overrides.
    async fn init(&self, request: InitRequest) -> Result<InitResponse>;

    /// Rebuild the session from the current task and model.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `init`.
    async fn reset(&self) -> Result<InitResponse>;

    // =========================================================================
    // Simulation Operations
    // =========================================================================

    /// Snapshot of the simulation state.
    async fn get_state(&self) -> Result<SimulationState>;

    /// Replace the fields present in `update`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` on a dimension mismatch.
    async fn set_state(&self, update: StateUpdate) -> Result<SimulationState>;

    /// Advance the simulation by one tick and record the observation in the
    /// estimator, if one is initialized.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NumericalFailure` if the step diverges.
    async fn step(&self, request: StepRequest) -> Result<StepResponse>;

    // =========================================================================
    // Planner Operations
    // =========================================================================

    /// Run planner iterations and commit a new policy.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for a budget outside the
    /// configured bounds, `ServiceError::NumericalFailure` if every rollout
    /// failed.
    async fn planner_step(&self, request: PlannerStepRequest) -> Result<PlannerStepResponse>;

    /// Action of the committed policy.
    async fn get_action(&self, request: GetActionRequest) -> Result<ActionResponse>;

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Per-term costs, active weights and the weighted total.
    async fn get_cost_values_and_weights(&self) -> Result<CostReport>;

    /// Update task parameters; all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown name or an
    /// out-of-bounds value.
    async fn set_task_parameters(&self, parameters: ParameterMap) -> Result<ParameterMap>;

    /// Current task parameters.
    async fn get_task_parameters(&self) -> Result<ParameterMap>;

    /// Update cost weights; all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown term or an
    /// invalid weight.
    async fn set_cost_weights(&self, weights: WeightMap) -> Result<WeightMap>;

    /// Switch the active mode.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown mode.
    async fn set_mode(&self, mode: &str) -> Result<TaskSettings>;

    /// Name of the active mode.
    async fn get_mode(&self) -> Result<String>;

    /// Mode names of the active task.
    async fn get_all_modes(&self) -> Result<Vec<String>>;

    // =========================================================================
    // Estimator Operations
    // =========================================================================

    /// Create the estimator.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` if no model is given and the
    /// agent is not initialized, `ServiceError::InvalidArgument` for an
    /// invalid model or window length.
    async fn init_estimator(&self, request: InitEstimatorRequest) -> Result<EstimatorInfo>;

    /// Write fields of one window slot.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::OutOfRange` for an index outside the window.
    async fn set_estimator_data(&self, index: usize, update: SlotUpdate) -> Result<SlotData>;

    /// Read one window slot.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::OutOfRange` for an index outside the window.
    async fn get_estimator_data(&self, index: usize) -> Result<SlotData>;

    /// Update estimator settings.
    async fn set_estimator_settings(
        &self,
        update: EstimatorSettingsUpdate,
    ) -> Result<EstimatorSettings>;

    /// Current estimator settings.
    async fn get_estimator_settings(&self) -> Result<EstimatorSettings>;

    /// Cost breakdown of the current estimate.
    async fn get_estimator_costs(&self) -> Result<EstimatorCosts>;

    /// Update estimator weights.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for a wrong length or a
    /// negative or non-finite weight.
    async fn set_estimator_weights(
        &self,
        update: EstimatorWeightsUpdate,
    ) -> Result<EstimatorWeights>;

    /// Current estimator weights.
    async fn get_estimator_weights(&self) -> Result<EstimatorWeights>;

    /// Discard the oldest `shift` slots.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` if `shift` exceeds the window
    /// length.
    async fn shift_estimator_trajectories(&self, shift: usize) -> Result<ShiftResponse>;

    /// Clear the window and estimator results.
    async fn reset_estimator(&self) -> Result<()>;

    /// Smooth the window.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` if the window has unfilled
    /// slots, `ServiceError::NumericalFailure` if the solver fails.
    async fn optimize_estimator(&self, request: OptimizeEstimatorRequest)
        -> Result<EstimatorStatus>;

    /// Status of the last optimization.
    async fn get_estimator_status(&self) -> Result<EstimatorStatus>;
}

/// The agent service implementation.
#[derive(Debug)]
pub struct AgentServiceImpl {
    agent: Arc<AgentCoordinator>,
    estimator: Arc<EstimatorCoordinator>,
    pool: Arc<WorkerPool>,
    config: ServiceConfig,
}

impl AgentServiceImpl {
    /// Create a service with the built-in tasks.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an invalid configuration
    /// and `ServiceError::Unavailable` if the worker pool cannot be started.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_registry(config, TaskRegistry::builtin())
    }

    /// Create a service over the given task registry.
    ///
    /// # Errors
    ///
    /// See [`AgentServiceImpl::new`].
    pub fn with_registry(config: ServiceConfig, registry: TaskRegistry) -> Result<Self> {
        let physics: Arc<dyn Physics> = Arc::new(SemiImplicitEuler);
        Self::with_components(config, registry, physics)
    }

    /// Create a service over the given registry and physics engine.
    ///
    /// # Errors
    ///
    /// See [`AgentServiceImpl::new`].
    pub fn with_components(
        config: ServiceConfig,
        registry: TaskRegistry,
        physics: Arc<dyn Physics>,
    ) -> Result<Self> {
        let planners: Arc<dyn PlannerFactory> = Arc::new(config.planner_settings());
        Self::with_planners(config, registry, physics, planners)
    }

    /// Create a service whose agent sessions take their planner from
    /// `planners` instead of the configured sampling planner.
    ///
    /// # Errors
    ///
    /// See [`AgentServiceImpl::new`].
    pub fn with_planners(
        config: ServiceConfig,
        registry: TaskRegistry,
        physics: Arc<dyn Physics>,
        planners: Arc<dyn PlannerFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(if config.worker_threads == 0 {
            WorkerPool::with_available_parallelism()?
        } else {
            WorkerPool::new(config.worker_threads)?
        });

        let agent = AgentCoordinator::new(
            Arc::new(registry),
            Arc::clone(&physics),
            Arc::clone(&pool),
            planners,
            PlannerLimits::from_config(&config),
        );
        let estimator = EstimatorCoordinator::new(
            physics,
            Arc::clone(&pool),
            EstimatorLimits::from_config(&config),
        );

        tracing::info!(
            workers = pool.size(),
            tasks = agent.registry().len(),
            "Agent service ready"
        );
        Ok(Self {
            agent: Arc::new(agent),
            estimator: Arc::new(estimator),
            pool,
            config,
        })
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Number of worker threads in the shared pool.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.pool.size()
    }

    /// Ids of the registered tasks, in index order.
    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        self.agent.registry().ids()
    }
}

#[async_trait]
impl AgentService for AgentServiceImpl {
    // =========================================================================
    // Session Operations
    // =========================================================================

    async fn init(&self, request: InitRequest) -> Result<InitResponse> {
        self.agent.init(request.task_index, request.model_overrides)
    }

    async fn reset(&self) -> Result<InitResponse> {
        self.agent.reset()
    }

    // =========================================================================
    // Simulation Operations
    // =========================================================================

    async fn get_state(&self) -> Result<SimulationState> {
        self.agent.get_state()
    }

    async fn set_state(&self, update: StateUpdate) -> Result<SimulationState> {
        self.agent.set_state(&update)
    }

    async fn step(&self, request: StepRequest) -> Result<StepResponse> {
        let agent = Arc::clone(&self.agent);
        let estimator = Arc::clone(&self.estimator);
        // Step is the only path holding both: estimator window, then state.
        let outcome = blocking(move || {
            estimator.recording(|sink| {
                agent.step(request.use_policy, |observation| sink.record(observation))
            })
        })
        .await?;
        Ok(StepResponse {
            state: outcome.state,
            version: outcome.version,
            estimator_index: outcome.estimator_index,
        })
    }

    // =========================================================================
    // Planner Operations
    // =========================================================================

    async fn planner_step(&self, request: PlannerStepRequest) -> Result<PlannerStepResponse> {
        let agent = Arc::clone(&self.agent);
        blocking(move || agent.planner_step(&request)).await
    }

    async fn get_action(&self, request: GetActionRequest) -> Result<ActionResponse> {
        self.agent.get_action(request.time)
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    async fn get_cost_values_and_weights(&self) -> Result<CostReport> {
        self.agent.costs()
    }

    async fn set_task_parameters(&self, parameters: ParameterMap) -> Result<ParameterMap> {
        self.agent.set_parameters(&parameters)
    }

    async fn get_task_parameters(&self) -> Result<ParameterMap> {
        self.agent.get_parameters()
    }

    async fn set_cost_weights(&self, weights: WeightMap) -> Result<WeightMap> {
        self.agent.set_weights(&weights)
    }

    async fn set_mode(&self, mode: &str) -> Result<TaskSettings> {
        self.agent.set_mode(mode)
    }

    async fn get_mode(&self) -> Result<String> {
        self.agent.get_mode()
    }

    async fn get_all_modes(&self) -> Result<Vec<String>> {
        self.agent.all_modes()
    }

    // =========================================================================
    // Estimator Operations
    // =========================================================================

    async fn init_estimator(&self, request: InitEstimatorRequest) -> Result<EstimatorInfo> {
        let model = match request.model {
            Some(model) => model,
            None => self.agent.current_model()?,
        };
        let model = match &request.model_overrides {
            Some(overrides) => model.with_overrides(overrides)?,
            None => model,
        };
        self.estimator.init(model, request.window_length)
    }

    async fn set_estimator_data(&self, index: usize, update: SlotUpdate) -> Result<SlotData> {
        let estimator = Arc::clone(&self.estimator);
        blocking(move || estimator.set_data(index, &update)).await
    }

    async fn get_estimator_data(&self, index: usize) -> Result<SlotData> {
        self.estimator.get_data(index)
    }

    async fn set_estimator_settings(
        &self,
        update: EstimatorSettingsUpdate,
    ) -> Result<EstimatorSettings> {
        let estimator = Arc::clone(&self.estimator);
        blocking(move || estimator.set_settings(&update)).await
    }

    async fn get_estimator_settings(&self) -> Result<EstimatorSettings> {
        self.estimator.get_settings()
    }

    async fn get_estimator_costs(&self) -> Result<EstimatorCosts> {
        self.estimator.costs()
    }

    async fn set_estimator_weights(
        &self,
        update: EstimatorWeightsUpdate,
    ) -> Result<EstimatorWeights> {
        let estimator = Arc::clone(&self.estimator);
        blocking(move || estimator.set_weights(&update)).await
    }

    async fn get_estimator_weights(&self) -> Result<EstimatorWeights> {
        self.estimator.get_weights()
    }

    async fn shift_estimator_trajectories(&self, shift: usize) -> Result<ShiftResponse> {
        let estimator = Arc::clone(&self.estimator);
        blocking(move || estimator.shift(shift)).await
    }

    async fn reset_estimator(&self) -> Result<()> {
        let estimator = Arc::clone(&self.estimator);
        blocking(move || estimator.reset()).await
    }

    async fn optimize_estimator(
        &self,
        request: OptimizeEstimatorRequest,
    ) -> Result<EstimatorStatus> {
        let estimator = Arc::clone(&self.estimator);
        blocking(move || estimator.optimize(request.iterations)).await
    }

    async fn get_estimator_status(&self) -> Result<EstimatorStatus> {
        self.estimator.status()
    }
}

/// Run `f` on the blocking thread pool.
///
/// Everything that may wait on a running `PlannerStep` or
/// `OptimizeEstimator` goes through here.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_remote_core::ModelOverrides;

    fn service() -> AgentServiceImpl {
        AgentServiceImpl::new(ServiceConfig {
            worker_threads: 2,
            planner_samples: 4,
            ..ServiceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn new_validates_config() {
        let config = ServiceConfig {
            planner_knots: 0,
            ..ServiceConfig::default()
        };
        assert!(AgentServiceImpl::new(config).is_err());
    }

    #[test]
    fn zero_workers_uses_hardware_parallelism() {
        let service = AgentServiceImpl::new(ServiceConfig::default()).unwrap();
        assert_eq!(service.worker_threads(), WorkerPool::num_cpus());
        assert_eq!(service.task_ids(), vec!["particle", "spring"]);
    }

    #[tokio::test]
    async fn estimator_binds_agent_model() {
        let service = service();
        assert!(service
            .init_estimator(InitEstimatorRequest::default())
            .await
            .is_err());

        service.init(InitRequest::new(1)).await.unwrap();
        let info = service
            .init_estimator(InitEstimatorRequest {
                window_length: Some(4),
                model_overrides: Some(ModelOverrides {
                    timestep: Some(0.01),
                    ..ModelOverrides::default()
                }),
                ..InitEstimatorRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(info.model_name, "spring");
        assert_eq!(info.timestep, 0.01);
        assert_eq!(info.window_length, 4);
    }

    #[tokio::test]
    async fn step_feeds_estimator() {
        let service = service();
        service.init(InitRequest::new(0)).await.unwrap();
        let response = service.step(StepRequest::default()).await.unwrap();
        assert!(response.estimator_index.is_none());

        service
            .init_estimator(InitEstimatorRequest {
                window_length: Some(3),
                ..InitEstimatorRequest::default()
            })
            .await
            .unwrap();
        let response = service.step(StepRequest::manual()).await.unwrap();
        assert_eq!(response.estimator_index, Some(0));
        assert!(response.version.is_none());

        let slot = service.get_estimator_data(0).await.unwrap();
        assert!(slot.filled);
        assert!((slot.time.unwrap() - 0.01).abs() < 1e-12);
    }
}
