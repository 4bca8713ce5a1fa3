//! Remote-control service for an MPC agent.
//!
//! This crate provides the operation surface a client uses to drive a
//! sampling-based model predictive controller and a sliding-window state
//! estimator: selecting a task, stepping the simulation, running planner
//! iterations, reading actions, tuning costs and modes, and feeding and
//! optimizing the estimator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Caller (RPC layer, tests)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      AgentServiceImpl                       │
//! │  ┌──────────────────────────┐  ┌─────────────────────────┐  │
//! │  │     AgentCoordinator     │  │  EstimatorCoordinator   │  │
//! │  │ state · policy · planner │  │  window · batch solver  │  │
//! │  └──────────────────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!               │                              │
//!               ▼                              ▼
//!       ┌──────────────┐               ┌──────────────┐
//!       │ TaskRegistry │               │  WorkerPool  │
//!       │ Physics      │               │ (rollouts,   │
//!       └──────────────┘               │  Jacobians)  │
//!                                      └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use mpc_remote_control::{
//!     AgentService, AgentServiceImpl, InitRequest, PlannerStepRequest, ServiceConfig,
//!     StepRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = AgentServiceImpl::new(ServiceConfig::default())?;
//!
//! service.init(InitRequest::new(0)).await?;
//! service.planner_step(PlannerStepRequest::default()).await?;
//! let step = service.step(StepRequest::default()).await?;
//!
//! println!("t = {}", step.state.time);
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! - `Init` and `Reset` swap the whole session; calls already running keep
//!   the session they started with.
//! - `GetAction` reads the committed policy without waiting for a running
//!   `PlannerStep`, and always reports the version it read.
//! - `OptimizeEstimator` blocks estimator writers but not readers.
//! - `Step` takes the estimator window before the simulation state and
//!   records its observation before releasing either, so the window sees
//!   ticks in simulation order. No other path holds both.
//! - `PlannerStep`, `OptimizeEstimator`, `Step` and the estimator writers
//!   run on the blocking thread pool; the first two fan out to the shared
//!   [`WorkerPool`](mpc_remote_pool::WorkerPool).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod config;
pub mod error;
pub mod estimator;
pub mod planner;
pub mod service;
pub mod types;

pub use agent::{AgentCoordinator, AgentSession, PlannerLimits, StepOutcome};
pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use estimator::{
    EstimatorCoordinator, EstimatorLimits, Observation, ObservationSink, SlotData, SlotUpdate,
};
pub use planner::{
    Planner, PlannerBudget, PlannerFactory, PlannerOutcome, PlannerSettings, PlanningContext,
    Policy, SamplingPlanner,
};
pub use service::{AgentService, AgentServiceImpl};
pub use types::{
    ActionResponse, EstimatorCosts, EstimatorInfo, EstimatorSettings, EstimatorSettingsUpdate,
    EstimatorStatus, EstimatorWeights, EstimatorWeightsUpdate, GetActionRequest,
    InitEstimatorRequest, InitRequest, InitResponse, OptimizeEstimatorRequest, PlannerStepRequest,
    PlannerStepResponse, ShiftResponse, StepRequest, StepResponse,
};

// Re-export commonly used types from dependencies for convenience
pub use mpc_remote_core::{Model, ModelOverrides, PolicyVersion, SimulationState, StateUpdate};
pub use mpc_remote_tasks::{CostReport, ParameterMap, TaskRegistry, TaskSettings, WeightMap};
