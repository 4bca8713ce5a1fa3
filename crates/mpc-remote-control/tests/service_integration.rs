//! End-to-end tests against `AgentServiceImpl`.
//!
//! Run with:
//!   cargo test -p mpc-remote-control --test service_integration
//!
//! Set `RUST_LOG=mpc_remote_control=debug` to see coordinator events.

use std::future::Future;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use mpc_remote_control::{
    AgentService, AgentServiceImpl, EstimatorWeightsUpdate, GetActionRequest,
    InitEstimatorRequest, InitRequest, Model, OptimizeEstimatorRequest, Planner, PlannerBudget,
    PlannerFactory, PlannerOutcome, PlannerStepRequest, PlanningContext, ServiceConfig,
    ServiceError, SlotUpdate, StateUpdate, StepRequest, TaskRegistry, WeightMap,
};
use mpc_remote_core::SemiImplicitEuler;
use mpc_remote_pool::WorkerPool;
use mpc_remote_tasks::Task;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn service() -> AgentServiceImpl {
    init_tracing();
    AgentServiceImpl::new(ServiceConfig {
        worker_threads: 2,
        planner_samples: 8,
        ..ServiceConfig::default()
    })
    .unwrap()
}

fn weights(entries: &[(&str, f64)]) -> WeightMap {
    entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

// =============================================================================
// Agent
// =============================================================================

#[tokio::test]
async fn init_yields_task_default_state() {
    let service = service();
    let registry = TaskRegistry::builtin();

    for index in 0..registry.len() {
        let task = registry.require(index).unwrap();
        let expected = task.default_state(&task.model(), &SemiImplicitEuler);

        let response = service.init(InitRequest::new(index)).await.unwrap();
        assert_eq!(response.task_id, task.id());
        assert_eq!(service.get_state().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn set_state_replaces_only_given_fields() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();
    let before = service.get_state().await.unwrap();

    let update = StateUpdate {
        time: Some(1.5),
        ctrl: Some(vec![0.2, -0.4]),
        ..StateUpdate::default()
    };
    service.set_state(update).await.unwrap();

    let after = service.get_state().await.unwrap();
    assert_eq!(after.time, 1.5);
    assert_eq!(after.ctrl, vec![0.2, -0.4]);
    assert_eq!(after.qpos, before.qpos);
    assert_eq!(after.qvel, before.qvel);
    assert_eq!(after.sensordata, before.sensordata);
}

#[tokio::test]
async fn agent_operations_require_init() {
    let service = service();
    let not_initialized = ServiceError::NotInitialized("agent");

    assert_eq!(service.get_state().await.unwrap_err(), not_initialized);
    assert_eq!(
        service.set_state(StateUpdate::default()).await.unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.step(StepRequest::default()).await.unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service
            .planner_step(PlannerStepRequest::default())
            .await
            .unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service
            .get_action(GetActionRequest::default())
            .await
            .unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.get_cost_values_and_weights().await.unwrap_err(),
        not_initialized
    );
    assert_eq!(service.reset().await.unwrap_err(), not_initialized);
    assert_eq!(service.get_mode().await.unwrap_err(), not_initialized);
    assert_eq!(service.get_all_modes().await.unwrap_err(), not_initialized);
    assert_eq!(
        service.get_task_parameters().await.unwrap_err(),
        not_initialized
    );
}

#[tokio::test]
async fn estimator_operations_require_init_estimator() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();
    let not_initialized = ServiceError::NotInitialized("estimator");

    assert_eq!(
        service.get_estimator_data(0).await.unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.get_estimator_settings().await.unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.get_estimator_costs().await.unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.get_estimator_weights().await.unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.shift_estimator_trajectories(1).await.unwrap_err(),
        not_initialized
    );
    assert_eq!(service.reset_estimator().await.unwrap_err(), not_initialized);
    assert_eq!(
        service
            .optimize_estimator(OptimizeEstimatorRequest::default())
            .await
            .unwrap_err(),
        not_initialized
    );
    assert_eq!(
        service.get_estimator_status().await.unwrap_err(),
        not_initialized
    );
}

#[tokio::test]
async fn reset_twice_yields_identical_state() {
    let service = service();
    service.init(InitRequest::new(1)).await.unwrap();

    for _ in 0..3 {
        service.step(StepRequest::manual()).await.unwrap();
    }
    let first = service.reset().await.unwrap();

    service
        .planner_step(PlannerStepRequest::default())
        .await
        .unwrap();
    service.step(StepRequest::default()).await.unwrap();
    let second = service.reset().await.unwrap();

    assert_eq!(first.state, second.state);
    assert_eq!(service.get_state().await.unwrap(), first.state);
}

#[tokio::test]
async fn ten_zero_control_steps_advance_ten_timesteps() {
    let service = service();
    let init = service.init(InitRequest::new(0)).await.unwrap();

    for _ in 0..10 {
        service.step(StepRequest::manual()).await.unwrap();
    }
    let state = service.get_state().await.unwrap();
    assert!((state.time - 10.0 * init.timestep).abs() < 1e-12);
}

#[tokio::test]
async fn cost_weights_update_or_fail_atomically() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();

    service
        .set_cost_weights(weights(&[("velocity", 2.0)]))
        .await
        .unwrap();
    let report = service.get_cost_values_and_weights().await.unwrap();
    let velocity = report.terms.iter().find(|t| t.name == "velocity").unwrap();
    assert_eq!(velocity.weight, 2.0);

    let err = service
        .set_cost_weights(weights(&[("position", 1.0), ("unknown_term", 1.0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));
    assert_eq!(service.get_cost_values_and_weights().await.unwrap(), report);
}

#[tokio::test]
async fn task_parameters_and_modes() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();

    let parameters = service
        .set_task_parameters(weights(&[("goal_x", -0.25)]))
        .await
        .unwrap();
    assert_eq!(parameters["goal_x"], -0.25);
    assert_eq!(parameters["goal_y"], 0.5);
    assert!(service
        .set_task_parameters(weights(&[("goal_x", 4.0)]))
        .await
        .is_err());
    assert_eq!(service.get_task_parameters().await.unwrap(), parameters);

    assert_eq!(service.get_all_modes().await.unwrap(), vec!["track", "hold"]);
    assert_eq!(service.get_mode().await.unwrap(), "track");
    service.set_mode("hold").await.unwrap();
    assert_eq!(service.get_mode().await.unwrap(), "hold");
    assert!(matches!(
        service.set_mode("unknown").await,
        Err(ServiceError::InvalidArgument(_))
    ));
    assert_eq!(service.get_mode().await.unwrap(), "hold");
}

/// A planner that parks inside `optimize` until the test releases it.
#[derive(Debug)]
struct GatedPlanner {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl Planner for GatedPlanner {
    fn optimize(
        &mut self,
        ctx: &PlanningContext,
        _budget: &PlannerBudget,
        _pool: &WorkerPool,
    ) -> mpc_remote_control::Result<PlannerOutcome> {
        self.entered.wait();
        self.release.wait();
        Ok(PlannerOutcome {
            iterations: 1,
            best_cost: 0.0,
            failed_rollouts: 0,
            knot_times: vec![ctx.state.time],
            knots: vec![vec![0.5; ctx.model.nu()]],
        })
    }

    fn reset(&mut self) {}
}

#[derive(Debug)]
struct GatedPlanners {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl PlannerFactory for GatedPlanners {
    fn build(&self, _model: &Model) -> Box<dyn Planner> {
        Box::new(GatedPlanner {
            entered: Arc::clone(&self.entered),
            release: Arc::clone(&self.release),
        })
    }
}

async fn wait_at(barrier: &Arc<Barrier>) {
    let barrier = Arc::clone(barrier);
    tokio::task::spawn_blocking(move || {
        barrier.wait();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_action_reads_previous_policy_while_planner_step_runs() {
    init_tracing();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let planners = Arc::new(GatedPlanners {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    });
    let service = Arc::new(
        AgentServiceImpl::with_planners(
            ServiceConfig {
                worker_threads: 2,
                ..ServiceConfig::default()
            },
            TaskRegistry::builtin(),
            Arc::new(SemiImplicitEuler),
            planners,
        )
        .unwrap(),
    );
    service.init(InitRequest::new(0)).await.unwrap();
    let at_zero = GetActionRequest { time: Some(0.0) };
    let before = service.get_action(at_zero).await.unwrap();
    assert_eq!(before.action, vec![0.0, 0.0]);

    let planning = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.planner_step(PlannerStepRequest::default()).await })
    };
    wait_at(&entered).await;

    // The planner is parked inside optimize.
    for _ in 0..10 {
        assert_eq!(service.get_action(at_zero).await.unwrap(), before);
        assert_eq!(service.get_action(GetActionRequest::default()).await.unwrap(), before);
    }
    assert!(!planning.is_finished());

    wait_at(&release).await;
    let planned = planning.await.unwrap().unwrap();
    let after = service.get_action(at_zero).await.unwrap();
    assert!(planned.version > before.version);
    assert_eq!(after.version, planned.version);
    assert_eq!(after.action, vec![0.5, 0.5]);
}

// =============================================================================
// Estimator
// =============================================================================

#[tokio::test]
async fn oversized_shift_leaves_window_unchanged() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(4),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();
    for _ in 0..3 {
        service.step(StepRequest::manual()).await.unwrap();
    }

    let mut before = Vec::new();
    for index in 0..4 {
        before.push(service.get_estimator_data(index).await.unwrap());
    }
    let err = service.shift_estimator_trajectories(5).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));
    for (index, slot) in before.iter().enumerate() {
        assert_eq!(&service.get_estimator_data(index).await.unwrap(), slot);
    }

    let shifted = service.shift_estimator_trajectories(2).await.unwrap();
    assert_eq!(shifted.first_index, 2);
    assert_eq!(shifted.window_length, 4);
    assert_eq!(service.get_estimator_data(0).await.unwrap().index, 2);
}

#[tokio::test]
async fn optimize_rejects_unfilled_window() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(5),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();
    service.step(StepRequest::manual()).await.unwrap();

    let err = service
        .optimize_estimator(OptimizeEstimatorRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));
    assert_eq!(service.get_estimator_status().await.unwrap().optimizations, 0);
}

#[tokio::test]
async fn estimator_data_index_is_bounded() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(3),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(
        service.get_estimator_data(3).await.unwrap_err(),
        ServiceError::OutOfRange { index: 3, len: 3 }
    );
    let err = service
        .set_estimator_data(
            0,
            SlotUpdate {
                ctrl: Some(vec![0.0; 5]),
                ..SlotUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));
}

#[tokio::test]
async fn smoother_recovers_stepped_trajectory() {
    let service = service();
    service.init(InitRequest::new(1)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(6),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();
    service
        .set_estimator_weights(EstimatorWeightsUpdate {
            prior: Some(0.0),
            ..EstimatorWeightsUpdate::default()
        })
        .await
        .unwrap();

    let mut truth = Vec::new();
    for t in 0..6 {
        let ctrl = if t % 2 == 0 { 0.5 } else { -0.5 };
        let state = service
            .set_state(StateUpdate {
                ctrl: Some(vec![ctrl]),
                ..StateUpdate::default()
            })
            .await
            .unwrap();
        truth.push(state.qpos[0]);
        service.step(StepRequest::manual()).await.unwrap();
    }

    let status = service
        .optimize_estimator(OptimizeEstimatorRequest { iterations: Some(10) })
        .await
        .unwrap();
    assert_eq!(status.optimizations, 1);
    assert!(status.final_cost <= status.initial_cost);

    for (index, expected) in truth.iter().enumerate() {
        let slot = service.get_estimator_data(index).await.unwrap();
        let estimate = slot.configuration[0];
        assert!(
            (estimate - expected).abs() < 1e-4,
            "slot {index}: estimate {estimate} vs {expected}"
        );
    }

    let costs = service.get_estimator_costs().await.unwrap();
    assert!((costs.total - status.final_cost).abs() < 1e-9);
}

#[tokio::test]
async fn reset_estimator_keeps_settings() {
    let service = service();
    service.init(InitRequest::new(0)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(3),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();
    for _ in 0..5 {
        service.step(StepRequest::manual()).await.unwrap();
    }

    service.reset_estimator().await.unwrap();
    let slot = service.get_estimator_data(0).await.unwrap();
    assert_eq!(slot.index, 0);
    assert!(!slot.filled);
    assert_eq!(service.get_estimator_settings().await.unwrap().window_length, 3);

    let response = service.step(StepRequest::manual()).await.unwrap();
    assert_eq!(response.estimator_index, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_steps_record_in_simulation_order() {
    let service = Arc::new(service());
    let init = service.init(InitRequest::new(0)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(64),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();

    for _ in 0..20 {
        service.reset_estimator().await.unwrap();
        let steppers: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let mut responses = Vec::new();
                    for _ in 0..8 {
                        responses.push(service.step(StepRequest::manual()).await.unwrap());
                    }
                    responses
                })
            })
            .collect();

        let mut responses = Vec::new();
        for stepper in steppers {
            responses.extend(stepper.await.unwrap());
        }
        responses.sort_by_key(|r| r.estimator_index);
        let indices: Vec<_> = responses.iter().filter_map(|r| r.estimator_index).collect();
        assert_eq!(indices, (0..64).collect::<Vec<u64>>());

        let mut previous = f64::NEG_INFINITY;
        for (position, response) in responses.iter().enumerate() {
            let slot = service.get_estimator_data(position).await.unwrap();
            let time = slot.time.unwrap();
            assert!(time > previous, "slot {position} at {time} after {previous}");
            assert!((time - (response.state.time - init.timestep)).abs() < 1e-9);
            previous = time;
        }
    }

    let status = service
        .optimize_estimator(OptimizeEstimatorRequest { iterations: Some(1) })
        .await
        .unwrap();
    assert_eq!(status.optimizations, 1);
}

/// True if `future` does not complete on its first poll.
async fn first_poll_is_pending<F: Future + Unpin>(future: &mut F) -> bool {
    tokio::select! {
        biased;
        _ = future => false,
        () = std::future::ready(()) => true,
    }
}

#[tokio::test(flavor = "current_thread")]
async fn estimator_writers_wait_off_the_runtime_thread() {
    let service = Arc::new(service());
    service.init(InitRequest::new(0)).await.unwrap();
    service
        .init_estimator(InitEstimatorRequest {
            window_length: Some(200),
            ..InitEstimatorRequest::default()
        })
        .await
        .unwrap();
    for _ in 0..200 {
        service.step(StepRequest::manual()).await.unwrap();
    }

    let optimize = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .optimize_estimator(OptimizeEstimatorRequest::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A writer taking the window lock on this thread would finish inside
    // its first poll, after the solve.
    let mut step = service.step(StepRequest::manual());
    let mut shift = service.shift_estimator_trajectories(0);
    let mut data = service.set_estimator_data(0, SlotUpdate::default());
    let mut reset = service.reset_estimator();
    assert!(first_poll_is_pending(&mut step).await);
    assert!(first_poll_is_pending(&mut shift).await);
    assert!(first_poll_is_pending(&mut data).await);
    assert!(first_poll_is_pending(&mut reset).await);

    // Readers are served while the solve runs.
    service.get_estimator_status().await.unwrap();

    assert_eq!(optimize.await.unwrap().unwrap().optimizations, 1);
    assert!(step.await.unwrap().estimator_index.is_some());
    shift.await.unwrap();
    data.await.unwrap();
    reset.await.unwrap();
}
