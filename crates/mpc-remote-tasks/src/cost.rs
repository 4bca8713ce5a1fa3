//! Cost evaluation.

use mpc_remote_core::{Model, SimulationState};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};
use crate::settings::TaskSettings;
use crate::Task;

/// The value of one cost term at a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermValue {
    /// Cost term name.
    pub name: String,
    /// Unweighted term cost.
    pub value: f64,
    /// Active weight.
    pub weight: f64,
}

/// Per-term costs and their weighted total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    /// Terms in declaration order.
    pub terms: Vec<TermValue>,
    /// `sum(weight * value)`.
    pub total: f64,
}

/// Evaluate every cost term of `task` at `state` under `settings`.
///
/// # Errors
///
/// Returns `TaskError::ResidualMismatch` if the task returns a different
/// number of residual vectors than it declares cost terms.
pub fn evaluate_costs(
    task: &dyn Task,
    model: &Model,
    state: &SimulationState,
    settings: &TaskSettings,
) -> Result<CostReport> {
    let schema = task.schema();
    let residuals = task.residuals(model, state, &settings.parameters);
    if residuals.len() != schema.cost_terms.len() {
        return Err(TaskError::ResidualMismatch {
            task: task.id().to_string(),
            expected: schema.cost_terms.len(),
            got: residuals.len(),
        });
    }

    let terms: Vec<TermValue> = schema
        .cost_terms
        .iter()
        .zip(&residuals)
        .zip(settings.weight_vector(schema))
        .map(|((term, residual), weight)| TermValue {
            name: term.name.clone(),
            value: term.norm.evaluate(residual),
            weight,
        })
        .collect();
    let total = terms.iter().map(|t| t.weight * t.value).sum();

    Ok(CostReport { terms, total })
}

/// Weighted total cost only; used in planner rollouts.
///
/// # Errors
///
/// See [`evaluate_costs`].
pub fn total_cost(
    task: &dyn Task,
    model: &Model,
    state: &SimulationState,
    settings: &TaskSettings,
) -> Result<f64> {
    evaluate_costs(task, model, state, settings).map(|report| report.total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::ParticleTask;
    use mpc_remote_core::SemiImplicitEuler;

    #[test]
    fn zero_cost_at_goal() {
        let task = ParticleTask::new();
        let model = task.model();
        let mut settings = TaskSettings::new(task.schema());
        settings.parameters.insert("goal_x".into(), 0.0);
        settings.parameters.insert("goal_y".into(), 0.0);

        let state = task.default_state(&model, &SemiImplicitEuler);
        let report = evaluate_costs(&task, &model, &state, &settings).unwrap();
        assert_eq!(report.terms.len(), 3);
        assert!(report.total.abs() < 1e-12);
    }

    #[test]
    fn total_is_weighted_sum() {
        let task = ParticleTask::new();
        let model = task.model();
        let settings = TaskSettings::new(task.schema());
        let mut state = task.default_state(&model, &SemiImplicitEuler);
        state.qvel = vec![1.0, -1.0];

        let report = evaluate_costs(&task, &model, &state, &settings).unwrap();
        let expected: f64 = report.terms.iter().map(|t| t.weight * t.value).sum();
        assert!((report.total - expected).abs() < 1e-12);

        let velocity = report.terms.iter().find(|t| t.name == "velocity").unwrap();
        assert!((velocity.value - 1.0).abs() < 1e-12);
        assert!((total_cost(&task, &model, &state, &settings).unwrap() - expected).abs() < 1e-12);
    }

    #[derive(Debug)]
    struct Broken(crate::TaskSchema);

    impl Task for Broken {
        fn id(&self) -> &str {
            "broken"
        }
        fn model(&self) -> Model {
            Model::new("broken", 1, 0.01)
        }
        fn schema(&self) -> &crate::TaskSchema {
            &self.0
        }
        fn residuals(
            &self,
            _model: &Model,
            _state: &SimulationState,
            _parameters: &crate::ParameterMap,
        ) -> Vec<Vec<f64>> {
            Vec::new()
        }
    }

    #[test]
    fn residual_count_is_checked() {
        let task = Broken(crate::TaskSchema {
            parameters: Vec::new(),
            cost_terms: vec![crate::CostTermSpec::quadratic("x", 1.0)],
            modes: vec![crate::ModeSpec::new("default")],
        });
        let model = task.model();
        let settings = TaskSettings::new(task.schema());
        let state = SimulationState::zeros(&model);
        assert!(matches!(
            evaluate_costs(&task, &model, &state, &settings),
            Err(TaskError::ResidualMismatch { expected: 1, got: 0, .. })
        ));
    }
}
