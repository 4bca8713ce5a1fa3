//! The ordered set of registered tasks.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Result, TaskError};
use crate::particle::ParticleTask;
use crate::spring::SpringTask;
use crate::Task;

/// Tasks selectable by index at `Init`.
///
/// The registry is fixed once built; tasks are shared as `Arc<dyn Task>`.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Vec<Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Build a registry, validating every task schema.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidSchema` if a schema is inconsistent, a
    /// task's default mode is undeclared, or two tasks share an id.
    pub fn new(tasks: Vec<Arc<dyn Task>>) -> Result<Self> {
        let mut ids = HashSet::new();
        for task in &tasks {
            task.schema().validate(task.id())?;
            if task.schema().mode(task.default_mode()).is_none() {
                return Err(TaskError::InvalidSchema {
                    task: task.id().to_string(),
                    reason: format!("default mode {:?} is not declared", task.default_mode()),
                });
            }
            if !ids.insert(task.id().to_string()) {
                return Err(TaskError::InvalidSchema {
                    task: task.id().to_string(),
                    reason: "duplicate task id".to_string(),
                });
            }
        }
        tracing::debug!(tasks = tasks.len(), "Built task registry");
        Ok(Self { tasks })
    }

    /// The built-in tasks: `particle` (index 0) and `spring` (index 1).
    #[must_use]
    pub fn builtin() -> Self {
        let particle: Arc<dyn Task> = Arc::new(ParticleTask::new());
        let spring: Arc<dyn Task> = Arc::new(SpringTask::new());
        Self {
            tasks: vec![particle, spring],
        }
    }

    /// Task at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<dyn Task>> {
        self.tasks.get(index)
    }

    /// Task at `index`, as an error if absent.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::TaskIndexOutOfRange` if no task is registered
    /// at `index`.
    pub fn require(&self, index: usize) -> Result<Arc<dyn Task>> {
        self.tasks
            .get(index)
            .cloned()
            .ok_or(TaskError::TaskIndexOutOfRange {
                index,
                len: self.tasks.len(),
            })
    }

    /// Index of the task with `id`.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id() == id)
    }

    /// Task ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id().to_string()).collect()
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_order() {
        let registry = TaskRegistry::builtin();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["particle", "spring"]);
        assert_eq!(registry.index_of("spring"), Some(1));
        assert!(registry.index_of("cartpole").is_none());
    }

    #[test]
    fn builtin_schemas_validate() {
        let registry = TaskRegistry::builtin();
        let tasks: Vec<_> = (0..registry.len())
            .filter_map(|i| registry.get(i).cloned())
            .collect();
        TaskRegistry::new(tasks).unwrap();
    }

    #[test]
    fn out_of_range_index() {
        let registry = TaskRegistry::builtin();
        assert!(registry.get(2).is_none());
        assert!(matches!(
            registry.require(7),
            Err(TaskError::TaskIndexOutOfRange { index: 7, len: 2 })
        ));
    }

    #[derive(Debug)]
    struct SprintDefault(ParticleTask);

    impl Task for SprintDefault {
        fn id(&self) -> &str {
            "sprint_default"
        }

        fn model(&self) -> mpc_remote_core::Model {
            self.0.model()
        }

        fn schema(&self) -> &crate::TaskSchema {
            self.0.schema()
        }

        fn residuals(
            &self,
            model: &mpc_remote_core::Model,
            state: &mpc_remote_core::SimulationState,
            parameters: &crate::ParameterMap,
        ) -> Vec<Vec<f64>> {
            self.0.residuals(model, state, parameters)
        }

        fn default_mode(&self) -> &str {
            "sprint"
        }
    }

    #[test]
    fn undeclared_default_mode_is_rejected() {
        let tasks: Vec<Arc<dyn Task>> = vec![Arc::new(SprintDefault(ParticleTask::new()))];
        assert!(matches!(
            TaskRegistry::new(tasks),
            Err(TaskError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tasks: Vec<Arc<dyn Task>> =
            vec![Arc::new(ParticleTask::new()), Arc::new(ParticleTask::new())];
        assert!(TaskRegistry::new(tasks).is_err());
    }
}
