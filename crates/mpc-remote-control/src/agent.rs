//! Agent coordination.
//!
//! The [`AgentCoordinator`] owns the active [`AgentSession`]. `Init` and
//! `Reset` swap the session `Arc`, so in-flight calls finish against the
//! session they started with and their results never leak into the new one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mpc_remote_core::{
    Model, ModelOverrides, Physics, PolicyVersion, SimulationState, StateUpdate, VersionCounter,
};
use mpc_remote_pool::WorkerPool;
use mpc_remote_tasks::{
    evaluate_costs, CostReport, ParameterMap, Task, TaskRegistry, TaskSettings, WeightMap,
};
use parking_lot::{Mutex, RwLock};

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::estimator::Observation;
use crate::planner::{Planner, PlannerBudget, PlannerFactory, PlanningContext, Policy};
use crate::types::{ActionResponse, InitResponse, PlannerStepRequest, PlannerStepResponse};

/// Budget bounds for `PlannerStep`.
#[derive(Debug, Clone, Copy)]
pub struct PlannerLimits {
    /// Iterations run when the caller does not ask for a count.
    pub default_iterations: usize,
    /// Largest iteration count a caller may ask for.
    pub max_iterations: usize,
    /// Largest time budget a caller may ask for, in milliseconds.
    pub max_time_budget_ms: u64,
}

impl PlannerLimits {
    /// Limits taken from the service configuration.
    #[must_use]
    pub const fn from_config(config: &ServiceConfig) -> Self {
        Self {
            default_iterations: config.planner_iterations,
            max_iterations: config.max_planner_iterations,
            max_time_budget_ms: config.max_time_budget_ms,
        }
    }

    fn budget(&self, request: &PlannerStepRequest) -> Result<PlannerBudget> {
        let iterations = request.iterations.unwrap_or(self.default_iterations);
        if iterations == 0 || iterations > self.max_iterations {
            return Err(ServiceError::invalid(format!(
                "iterations {iterations} outside [1, {}]",
                self.max_iterations
            )));
        }
        if let Some(ms) = request.time_budget_ms {
            if ms > self.max_time_budget_ms {
                return Err(ServiceError::invalid(format!(
                    "time budget {ms}ms exceeds {}ms",
                    self.max_time_budget_ms
                )));
            }
        }
        Ok(PlannerBudget {
            iterations,
            deadline: request
                .time_budget_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
        })
    }
}

/// Everything created by one `Init`.
#[derive(Debug)]
pub struct AgentSession {
    task_index: usize,
    task: Arc<dyn Task>,
    model: Arc<Model>,
    overrides: Option<ModelOverrides>,
    state: RwLock<SimulationState>,
    settings: RwLock<TaskSettings>,
    policy: RwLock<Arc<Policy>>,
    planner: Mutex<Box<dyn Planner>>,
}

impl AgentSession {
    /// Index of the active task.
    #[must_use]
    pub const fn task_index(&self) -> usize {
        self.task_index
    }

    /// The active task.
    #[must_use]
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// The session model, overrides applied.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    fn policy(&self) -> Arc<Policy> {
        Arc::clone(&self.policy.read())
    }
}

/// Result of one simulation tick.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// State after the tick.
    pub state: SimulationState,
    /// Policy version applied, if the policy was used.
    pub version: Option<PolicyVersion>,
    /// The pre-step time and sensors together with the applied control.
    pub observation: Observation,
    /// Absolute estimator slot the observation was recorded in.
    pub estimator_index: Option<u64>,
}

/// Owns the agent lifecycle.
#[derive(Debug)]
pub struct AgentCoordinator {
    registry: Arc<TaskRegistry>,
    physics: Arc<dyn Physics>,
    pool: Arc<WorkerPool>,
    planners: Arc<dyn PlannerFactory>,
    limits: PlannerLimits,
    versions: VersionCounter,
    session: RwLock<Option<Arc<AgentSession>>>,
}

impl AgentCoordinator {
    /// Create an uninitialized coordinator.
    #[must_use]
    pub fn new(
        registry: Arc<TaskRegistry>,
        physics: Arc<dyn Physics>,
        pool: Arc<WorkerPool>,
        planners: Arc<dyn PlannerFactory>,
        limits: PlannerLimits,
    ) -> Self {
        Self {
            registry,
            physics,
            pool,
            planners,
            limits,
            versions: VersionCounter::new(),
            session: RwLock::new(None),
        }
    }

    /// The task registry.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The active session.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn session(&self) -> Result<Arc<AgentSession>> {
        self.session
            .read()
            .clone()
            .ok_or(ServiceError::NotInitialized("agent"))
    }

    fn build_session(
        &self,
        task_index: usize,
        overrides: Option<ModelOverrides>,
    ) -> Result<AgentSession> {
        let task = self.registry.require(task_index)?;
        let model = match &overrides {
            Some(overrides) => task.model().with_overrides(overrides)?,
            None => task.model(),
        };
        let state = task.default_state(&model, self.physics.as_ref());
        let settings = TaskSettings::for_task(task.as_ref());
        let planner = self.planners.build(&model);
        let policy = Policy::zero(self.versions.next_version(), model.nu());

        Ok(AgentSession {
            task_index,
            task,
            model: Arc::new(model),
            overrides,
            state: RwLock::new(state),
            settings: RwLock::new(settings),
            policy: RwLock::new(Arc::new(policy)),
            planner: Mutex::new(planner),
        })
    }

    fn install(&self, session: AgentSession) -> InitResponse {
        let model = Arc::clone(&session.model);
        let response = InitResponse {
            task_id: session.task.id().to_string(),
            task_index: session.task_index,
            nq: model.nq(),
            nv: model.nv(),
            nu: model.nu(),
            nsensor: model.nsensor(),
            timestep: model.timestep,
            state: session.state.read().clone(),
        };
        *self.session.write() = Some(Arc::new(session));
        response
    }

    /// Tear down the current session and start the task at `task_index`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown task index or
    /// invalid overrides; the previous session stays active in that case.
    pub fn init(
        &self,
        task_index: usize,
        overrides: Option<ModelOverrides>,
    ) -> Result<InitResponse> {
        let session = self.build_session(task_index, overrides)?;
        let response = self.install(session);
        tracing::info!(
            task = %response.task_id,
            task_index,
            timestep = response.timestep,
            "Initialized agent"
        );
        Ok(response)
    }

    /// Rebuild the session from the same task and overrides.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn reset(&self) -> Result<InitResponse> {
        let current = self.session()?;
        let session = self.build_session(current.task_index, current.overrides.clone())?;
        let response = self.install(session);
        tracing::info!(task = %response.task_id, "Reset agent");
        Ok(response)
    }

    /// A copy of the session model.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn current_model(&self) -> Result<Model> {
        Ok(self.session()?.model().clone())
    }

    /// Snapshot of the simulation state.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn get_state(&self) -> Result<SimulationState> {
        Ok(self.session()?.state.read().clone())
    }

    /// Replace the fields present in `update`.
    ///
    /// Sensors are recomputed when positions or velocities change and the
    /// update carries no sensor data of its own.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` on a dimension mismatch; no
    /// field is written in that case.
    pub fn set_state(&self, update: &StateUpdate) -> Result<SimulationState> {
        let session = self.session()?;
        let mut state = session.state.write();
        let mut next = update.apply(&state, &session.model)?;
        if update.touches_kinematics() && update.sensordata.is_none() {
            next.sensordata = self.physics.sensors(&session.model, &next.qpos, &next.qvel);
        }
        *state = next;
        Ok(state.clone())
    }

    /// Advance the simulation by one tick.
    ///
    /// `record` receives the observation of a successful tick while the
    /// state write lock is still held, so consecutive ticks are recorded in
    /// simulation order.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NumericalFailure` if the step diverges; the
    /// state is left unchanged and nothing is recorded.
    pub fn step<F>(&self, use_policy: bool, record: F) -> Result<StepOutcome>
    where
        F: FnOnce(&Observation) -> Option<u64>,
    {
        let session = self.session()?;
        let mut state = session.state.write();

        let mut input = state.clone();
        let version = if use_policy {
            let policy = session.policy();
            input.ctrl = policy.action(input.time);
            Some(policy.version())
        } else {
            None
        };

        let next = self
            .physics
            .step(&session.model, &input)
            .inspect_err(|err| tracing::warn!(error = %err, "Simulation step failed"))?;
        let observation = Observation {
            time: input.time,
            ctrl: input.ctrl,
            sensor: input.sensordata,
        };
        let estimator_index = record(&observation);
        *state = next;

        tracing::debug!(time = state.time, use_policy, "Stepped simulation");
        Ok(StepOutcome {
            state: state.clone(),
            version,
            observation,
            estimator_index,
        })
    }

    /// Run planner iterations and commit the best candidate as a new policy.
    ///
    /// Blocks the calling thread. Concurrent calls are serialized on the
    /// session's planner; `GetAction` keeps reading the previous policy
    /// until the new one is swapped in.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for a budget outside the
    /// configured bounds, and `ServiceError::NumericalFailure` if every
    /// rollout failed; the committed policy is unchanged in both cases.
    pub fn planner_step(&self, request: &PlannerStepRequest) -> Result<PlannerStepResponse> {
        let budget = self.limits.budget(request)?;
        let session = self.session()?;
        let mut planner = session.planner.lock();

        let ctx = PlanningContext {
            task: Arc::clone(&session.task),
            model: Arc::clone(&session.model),
            physics: Arc::clone(&self.physics),
            settings: session.settings.read().clone(),
            state: session.state.read().clone(),
        };
        let outcome = planner.optimize(&ctx, &budget, &self.pool)?;

        let version = self.versions.next_version();
        let policy = Policy::new(
            version,
            session.model.nu(),
            outcome.knot_times,
            outcome.knots,
        )?;
        *session.policy.write() = Arc::new(policy);
        drop(planner);

        tracing::debug!(
            version = %version,
            iterations = outcome.iterations,
            cost = outcome.best_cost,
            failed = outcome.failed_rollouts,
            "Committed policy"
        );
        Ok(PlannerStepResponse {
            iterations: outcome.iterations,
            best_cost: outcome.best_cost,
            failed_rollouts: outcome.failed_rollouts,
            version,
        })
    }

    /// Action of the committed policy at `time`, or at the current
    /// simulation time when absent.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for a non-finite time.
    pub fn get_action(&self, time: Option<f64>) -> Result<ActionResponse> {
        let session = self.session()?;
        let time = match time {
            Some(time) if !time.is_finite() => {
                return Err(ServiceError::invalid(format!("time must be finite, got {time}")));
            }
            Some(time) => time,
            None => session.state.read().time,
        };
        let policy = session.policy();
        Ok(ActionResponse {
            time,
            action: policy.action(time),
            version: policy.version(),
        })
    }

    /// Per-term costs at the current state.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn costs(&self) -> Result<CostReport> {
        let session = self.session()?;
        let settings = session.settings.read().clone();
        let state = session.state.read().clone();
        Ok(evaluate_costs(
            session.task.as_ref(),
            &session.model,
            &state,
            &settings,
        )?)
    }

    /// Apply parameter updates; all keys and values are checked first.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown name or an
    /// out-of-bounds value.
    pub fn set_parameters(&self, updates: &ParameterMap) -> Result<ParameterMap> {
        let session = self.session()?;
        let mut settings = session.settings.write();
        settings.set_parameters(session.task.schema(), updates)?;
        Ok(settings.parameters.clone())
    }

    /// Current parameter values.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn get_parameters(&self) -> Result<ParameterMap> {
        Ok(self.session()?.settings.read().parameters.clone())
    }

    /// Apply cost weight updates; all keys and values are checked first.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown term or a
    /// negative or non-finite weight.
    pub fn set_weights(&self, updates: &WeightMap) -> Result<WeightMap> {
        let session = self.session()?;
        let mut settings = session.settings.write();
        settings.set_weights(session.task.schema(), updates)?;
        Ok(settings.weights.clone())
    }

    /// Switch to the named mode using the task's switch policy.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` for an unknown mode.
    pub fn set_mode(&self, name: &str) -> Result<TaskSettings> {
        let session = self.session()?;
        let task = &session.task;
        let mut settings = session.settings.write();
        settings.set_mode(task.schema(), task.mode_switch_policy(), name)?;
        tracing::info!(task = %task.id(), mode = name, "Switched mode");
        Ok(settings.clone())
    }

    /// Name of the active mode.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn get_mode(&self) -> Result<String> {
        Ok(self.session()?.settings.read().mode.clone())
    }

    /// Mode names of the active task in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotInitialized` before `Init`.
    pub fn all_modes(&self) -> Result<Vec<String>> {
        Ok(self.session()?.task.schema().mode_names())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_remote_core::SemiImplicitEuler;
    use mpc_remote_tasks::SpringTask;

    fn coordinator() -> AgentCoordinator {
        let config = ServiceConfig {
            planner_samples: 4,
            ..ServiceConfig::default()
        };
        AgentCoordinator::new(
            Arc::new(TaskRegistry::builtin()),
            Arc::new(SemiImplicitEuler),
            Arc::new(WorkerPool::new(2).unwrap()),
            Arc::new(config.planner_settings()),
            PlannerLimits::from_config(&config),
        )
    }

    #[test]
    fn operations_require_init() {
        let agent = coordinator();
        assert_eq!(
            agent.get_state().unwrap_err(),
            ServiceError::NotInitialized("agent")
        );
        assert!(agent.step(true, |_| None).is_err());
        assert!(agent.reset().is_err());
        assert!(agent.get_action(None).is_err());
        assert!(agent.all_modes().is_err());
    }

    #[test]
    fn init_builds_default_state() {
        let agent = coordinator();
        let response = agent.init(1, None).unwrap();
        assert_eq!(response.task_id, "spring");
        assert_eq!(response.state.qpos, vec![SpringTask::INITIAL_POSITION]);
        assert_eq!(response.state.sensordata, vec![SpringTask::INITIAL_POSITION, 0.0]);
        assert_eq!(agent.get_state().unwrap(), response.state);
    }

    #[test]
    fn failed_init_keeps_session() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        assert!(matches!(
            agent.init(9, None),
            Err(ServiceError::InvalidArgument(_))
        ));
        let overrides = ModelOverrides {
            timestep: Some(0.0),
            ..ModelOverrides::default()
        };
        assert!(agent.init(1, Some(overrides)).is_err());
        assert_eq!(agent.session().unwrap().task_index(), 0);
    }

    #[test]
    fn set_state_recomputes_sensors() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let state = agent
            .set_state(&StateUpdate {
                qpos: Some(vec![0.25, -0.5]),
                ..StateUpdate::default()
            })
            .unwrap();
        assert_eq!(state.sensordata, vec![0.25, -0.5, 0.0, 0.0]);

        let state = agent
            .set_state(&StateUpdate {
                qvel: Some(vec![1.0, 1.0]),
                sensordata: Some(vec![9.0; 4]),
                ..StateUpdate::default()
            })
            .unwrap();
        assert_eq!(state.sensordata, vec![9.0; 4]);
    }

    #[test]
    fn bad_update_writes_nothing() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let before = agent.get_state().unwrap();
        let err = agent
            .set_state(&StateUpdate {
                time: Some(3.0),
                qvel: Some(vec![1.0]),
                ..StateUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert_eq!(agent.get_state().unwrap(), before);
    }

    #[test]
    fn divergent_step_keeps_state() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let before = agent
            .set_state(&StateUpdate {
                qvel: Some(vec![1.0e12, 0.0]),
                ..StateUpdate::default()
            })
            .unwrap();
        let mut recorded = false;
        assert!(matches!(
            agent.step(false, |_| {
                recorded = true;
                Some(0)
            }),
            Err(ServiceError::NumericalFailure(_))
        ));
        assert!(!recorded);
        assert_eq!(agent.get_state().unwrap(), before);
    }

    #[test]
    fn step_records_under_state_lock() {
        let agent = coordinator();
        agent.init(1, None).unwrap();
        let session = agent.session().unwrap();
        let outcome = agent
            .step(false, |observation| {
                // The tick is not visible to other callers yet.
                assert!(session.state.try_read().is_none());
                assert_eq!(observation.time, 0.0);
                Some(7)
            })
            .unwrap();
        assert_eq!(outcome.estimator_index, Some(7));
    }

    #[test]
    fn non_finite_update_writes_nothing() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let before = agent.get_state().unwrap();
        let err = agent
            .set_state(&StateUpdate {
                qpos: Some(vec![f64::NAN, 0.0]),
                ..StateUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert_eq!(agent.get_state().unwrap(), before);
    }

    #[test]
    fn step_reports_pre_step_observation() {
        let agent = coordinator();
        agent.init(1, None).unwrap();
        let before = agent.get_state().unwrap();
        let outcome = agent.step(true, |_| None).unwrap();
        assert_eq!(outcome.observation.time, before.time);
        assert_eq!(outcome.observation.sensor, before.sensordata);
        assert_eq!(outcome.observation.ctrl, vec![0.0]);
        assert!(outcome.state.time > before.time);
        assert!(outcome.version.is_some());
    }

    #[test]
    fn planner_step_commits_new_version() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let before = agent.get_action(None).unwrap();

        let response = agent
            .planner_step(&PlannerStepRequest {
                iterations: Some(2),
                time_budget_ms: None,
            })
            .unwrap();
        assert_eq!(response.iterations, 2);
        assert!(response.version > before.version);
        assert_eq!(agent.get_action(None).unwrap().version, response.version);
    }

    #[test]
    fn planner_budget_is_bounded() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        for request in [
            PlannerStepRequest {
                iterations: Some(0),
                time_budget_ms: None,
            },
            PlannerStepRequest {
                iterations: Some(65),
                time_budget_ms: None,
            },
            PlannerStepRequest {
                iterations: None,
                time_budget_ms: Some(10_001),
            },
        ] {
            assert!(matches!(
                agent.planner_step(&request),
                Err(ServiceError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn versions_increase_across_reset() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let first = agent.get_action(None).unwrap().version;
        agent.reset().unwrap();
        let second = agent.get_action(None).unwrap().version;
        assert!(second > first);
    }

    #[test]
    fn reset_keeps_overrides() {
        let agent = coordinator();
        let overrides = ModelOverrides {
            timestep: Some(0.02),
            ..ModelOverrides::default()
        };
        agent.init(0, Some(overrides)).unwrap();
        agent.step(false, |_| None).unwrap();
        let response = agent.reset().unwrap();
        assert_eq!(response.timestep, 0.02);
        assert_eq!(response.state.time, 0.0);
    }

    #[test]
    fn mode_switch_follows_task_policy() {
        let agent = coordinator();
        agent.init(1, None).unwrap();
        agent.set_weights(&WeightMap::from([("effort".to_string(), 0.5)])).unwrap();
        let settings = agent.set_mode("swing").unwrap();
        // Spring resets to defaults before applying the preset.
        assert_eq!(settings.weights["effort"], 0.01);
        assert_eq!(settings.weights["position"], 2.0);
        assert_eq!(settings.parameters["target"], 1.0);
        assert_eq!(agent.get_mode().unwrap(), "swing");

        assert!(matches!(
            agent.set_mode("sprint"),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert_eq!(agent.all_modes().unwrap(), vec!["regulate", "swing"]);
    }

    #[test]
    fn action_at_explicit_time() {
        let agent = coordinator();
        agent.init(0, None).unwrap();
        let action = agent.get_action(Some(0.3)).unwrap();
        assert_eq!(action.time, 0.3);
        assert_eq!(action.action, vec![0.0, 0.0]);
        assert!(agent.get_action(Some(f64::NAN)).is_err());
    }
}
