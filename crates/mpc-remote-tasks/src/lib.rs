//! Task definitions for mpc-remote.
//!
//! A task is a registered control problem: a default model and state, a
//! parameter schema, a set of weighted cost terms computed from residuals,
//! and a set of named modes. Tasks implement the [`Task`] capability trait
//! and are collected, in order, in a [`TaskRegistry`].
//!
//! # Built-in tasks
//!
//! | index | id         | system                                   |
//! |-------|------------|------------------------------------------|
//! | 0     | `particle` | damped 2-DOF point mass reaching a goal  |
//! | 1     | `spring`   | 1-DOF mass-spring-damper regulation      |
//!
//! # Example
//!
//! ```
//! use mpc_remote_tasks::{TaskRegistry, TaskSettings};
//!
//! let registry = TaskRegistry::builtin();
//! let task = registry.get(0).unwrap();
//! assert_eq!(task.id(), "particle");
//!
//! let settings = TaskSettings::new(task.schema());
//! assert_eq!(settings.mode, "track");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cost;
pub mod error;
pub mod particle;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod spring;

pub use cost::{evaluate_costs, total_cost, CostReport, TermValue};
pub use error::{Result, TaskError};
pub use particle::ParticleTask;
pub use registry::TaskRegistry;
pub use schema::{CostTermSpec, ModeSpec, ModeSwitchPolicy, Norm, ParameterSpec, TaskSchema};
pub use settings::{ParameterMap, TaskSettings, WeightMap};
pub use spring::SpringTask;

use mpc_remote_core::{Model, Physics, SimulationState};
use std::fmt::Debug;

/// The capability interface every registered task implements.
///
/// Tasks are immutable after registration and shared across threads, so
/// they must be `Send + Sync`.
pub trait Task: Debug + Send + Sync {
    /// Stable identifier of the task.
    fn id(&self) -> &str;

    /// The default physical model for this task.
    fn model(&self) -> Model;

    /// Parameter, cost-term and mode declarations.
    fn schema(&self) -> &TaskSchema;

    /// Initial generalized positions for `model`.
    fn initial_qpos(&self, model: &Model) -> Vec<f64> {
        vec![0.0; model.nq()]
    }

    /// Residual vectors, one per cost term, in schema declaration order.
    fn residuals(
        &self,
        model: &Model,
        state: &SimulationState,
        parameters: &ParameterMap,
    ) -> Vec<Vec<f64>>;

    /// How [`TaskSettings::set_mode`] treats previously set values.
    fn mode_switch_policy(&self) -> ModeSwitchPolicy {
        ModeSwitchPolicy::Reset
    }

    /// Name of the mode that is active after `Init` or `Reset`.
    fn default_mode(&self) -> &str {
        self.schema().default_mode()
    }

    /// The documented default state: `initial_qpos`, zero velocity and
    /// control, sensors computed by `physics`.
    fn default_state(&self, model: &Model, physics: &dyn Physics) -> SimulationState {
        let mut state = SimulationState::zeros(model);
        state.qpos = self.initial_qpos(model);
        state.sensordata = physics.sensors(model, &state.qpos, &state.qvel);
        state
    }
}

/// Look up a parameter value, falling back to zero.
///
/// Settings always carry every declared parameter, so the fallback only
/// applies to maps built by hand.
#[must_use]
pub fn parameter(parameters: &ParameterMap, name: &str) -> f64 {
    parameters.get(name).copied().unwrap_or(0.0)
}
