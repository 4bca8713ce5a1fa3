//! A one-DOF mass-spring-damper regulated to a target position.

use mpc_remote_core::{Model, SimulationState};

use crate::schema::{CostTermSpec, ModeSpec, ModeSwitchPolicy, ParameterSpec, TaskSchema};
use crate::settings::ParameterMap;
use crate::{parameter, Task};

/// Mass-spring-damper task, released from a displaced position.
#[derive(Debug, Clone)]
pub struct SpringTask {
    schema: TaskSchema,
}

impl SpringTask {
    /// Task id.
    pub const ID: &'static str = "spring";

    /// Initial displacement.
    pub const INITIAL_POSITION: f64 = 1.0;

    /// Create the task with its built-in schema.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema: TaskSchema {
                parameters: vec![ParameterSpec::new("target", 0.0, -2.0, 2.0)],
                cost_terms: vec![
                    CostTermSpec::smooth_abs("position", 1.0, 0.1),
                    CostTermSpec::quadratic("velocity", 0.2),
                    CostTermSpec::quadratic("effort", 0.01),
                ],
                modes: vec![
                    ModeSpec::new("regulate"),
                    ModeSpec::new("swing")
                        .with_parameter("target", 1.0)
                        .with_weight("position", 2.0),
                ],
            },
        }
    }
}

impl Default for SpringTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for SpringTask {
    fn id(&self) -> &str {
        Self::ID
    }

    fn model(&self) -> Model {
        Model::new("spring", 1, 0.005)
            .with_stiffness(4.0)
            .with_damping(0.2)
            .with_ctrl_range(-2.0, 2.0)
    }

    fn schema(&self) -> &TaskSchema {
        &self.schema
    }

    fn initial_qpos(&self, model: &Model) -> Vec<f64> {
        vec![Self::INITIAL_POSITION; model.nq()]
    }

    fn residuals(
        &self,
        _model: &Model,
        state: &SimulationState,
        parameters: &ParameterMap,
    ) -> Vec<Vec<f64>> {
        let target = parameter(parameters, "target");
        vec![
            state.qpos.iter().map(|q| q - target).collect(),
            state.qvel.clone(),
            state.ctrl.clone(),
        ]
    }

    fn mode_switch_policy(&self) -> ModeSwitchPolicy {
        ModeSwitchPolicy::Reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_remote_core::SemiImplicitEuler;

    #[test]
    fn schema_is_valid() {
        let task = SpringTask::new();
        task.schema().validate(task.id()).unwrap();
        assert_eq!(task.default_mode(), "regulate");
    }

    #[test]
    fn default_state_is_displaced() {
        let task = SpringTask::new();
        let model = task.model();
        let state = task.default_state(&model, &SemiImplicitEuler);
        assert_eq!(state.qpos, vec![SpringTask::INITIAL_POSITION]);
        assert_eq!(state.sensordata, vec![SpringTask::INITIAL_POSITION, 0.0]);
    }
}
