//! A damped planar point mass steered to a goal position.

use mpc_remote_core::{Model, SimulationState};

use crate::schema::{CostTermSpec, ModeSpec, ModeSwitchPolicy, ParameterSpec, TaskSchema};
use crate::settings::ParameterMap;
use crate::{parameter, Task};

/// Two-DOF particle task.
///
/// Residuals are the position error to `(goal_x, goal_y)`, the velocity
/// and the control. Switching mode merges the preset into the current
/// settings.
#[derive(Debug, Clone)]
pub struct ParticleTask {
    schema: TaskSchema,
}

impl ParticleTask {
    /// Task id.
    pub const ID: &'static str = "particle";

    /// Create the task with its built-in schema.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema: TaskSchema {
                parameters: vec![
                    ParameterSpec::new("goal_x", 0.5, -1.0, 1.0),
                    ParameterSpec::new("goal_y", 0.5, -1.0, 1.0),
                ],
                cost_terms: vec![
                    CostTermSpec::quadratic("position", 5.0),
                    CostTermSpec::quadratic("velocity", 0.1),
                    CostTermSpec::quadratic("control", 0.1),
                ],
                modes: vec![
                    ModeSpec::new("track"),
                    ModeSpec::new("hold")
                        .with_parameter("goal_x", 0.0)
                        .with_parameter("goal_y", 0.0)
                        .with_weight("velocity", 1.0),
                ],
            },
        }
    }
}

impl Default for ParticleTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for ParticleTask {
    fn id(&self) -> &str {
        Self::ID
    }

    fn model(&self) -> Model {
        Model::new("particle", 2, 0.01).with_damping(0.1)
    }

    fn schema(&self) -> &TaskSchema {
        &self.schema
    }

    fn residuals(
        &self,
        _model: &Model,
        state: &SimulationState,
        parameters: &ParameterMap,
    ) -> Vec<Vec<f64>> {
        let goal = [parameter(parameters, "goal_x"), parameter(parameters, "goal_y")];
        let position: Vec<f64> = state
            .qpos
            .iter()
            .zip(goal)
            .map(|(q, g)| q - g)
            .collect();
        vec![position, state.qvel.clone(), state.ctrl.clone()]
    }

    fn mode_switch_policy(&self) -> ModeSwitchPolicy {
        ModeSwitchPolicy::Merge
    }
}
