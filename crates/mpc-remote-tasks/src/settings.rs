//! Mutable per-session task settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};
use crate::schema::{valid_weight, ModeSwitchPolicy, TaskSchema};
use crate::Task;

/// Parameter values keyed by name.
pub type ParameterMap = BTreeMap<String, f64>;

/// Cost weights keyed by term name.
pub type WeightMap = BTreeMap<String, f64>;

/// The active parameters, weights and mode of a task.
///
/// Every mutation validates the whole update against the schema before
/// touching anything, so a rejected update leaves the settings unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Current value of every declared parameter.
    pub parameters: ParameterMap,
    /// Current weight of every declared cost term.
    pub weights: WeightMap,
    /// Active mode name.
    pub mode: String,
}

impl TaskSettings {
    /// Schema defaults with the first mode's preset applied.
    #[must_use]
    pub fn new(schema: &TaskSchema) -> Self {
        Self::with_mode(schema, schema.default_mode())
    }

    /// The settings a task starts from: schema defaults with the preset of
    /// [`Task::default_mode`](crate::Task::default_mode) applied.
    #[must_use]
    pub fn for_task(task: &dyn Task) -> Self {
        Self::with_mode(task.schema(), task.default_mode())
    }

    /// Schema defaults with the preset of `mode` applied. An undeclared
    /// mode leaves the defaults and an empty mode name.
    #[must_use]
    pub fn with_mode(schema: &TaskSchema, mode: &str) -> Self {
        let mut settings = Self::defaults(schema);
        if let Some(mode) = schema.mode(mode) {
            settings.parameters.extend(mode.parameters.clone());
            settings.weights.extend(mode.weights.clone());
            settings.mode.clone_from(&mode.name);
        }
        settings
    }

    fn defaults(schema: &TaskSchema) -> Self {
        Self {
            parameters: schema
                .parameters
                .iter()
                .map(|p| (p.name.clone(), p.default))
                .collect(),
            weights: schema
                .cost_terms
                .iter()
                .map(|t| (t.name.clone(), t.default_weight))
                .collect(),
            mode: String::new(),
        }
    }

    /// Weights in cost-term declaration order.
    #[must_use]
    pub fn weight_vector(&self, schema: &TaskSchema) -> Vec<f64> {
        schema
            .cost_terms
            .iter()
            .map(|t| self.weights.get(&t.name).copied().unwrap_or(t.default_weight))
            .collect()
    }

    /// Set several parameters at once.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::UnknownParameter` for an undeclared name and
    /// `TaskError::ParameterOutOfBounds` for a value outside its range.
    pub fn set_parameters(&mut self, schema: &TaskSchema, updates: &ParameterMap) -> Result<()> {
        for (name, value) in updates {
            let spec = schema
                .parameter(name)
                .ok_or_else(|| TaskError::UnknownParameter(name.clone()))?;
            if !spec.admits(*value) {
                return Err(TaskError::ParameterOutOfBounds {
                    name: name.clone(),
                    value: *value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
        self.parameters
            .extend(updates.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    /// Set several cost weights at once.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::UnknownCostTerm` for an undeclared name and
    /// `TaskError::InvalidWeight` for a negative or non-finite value.
    pub fn set_weights(&mut self, schema: &TaskSchema, updates: &WeightMap) -> Result<()> {
        for (name, value) in updates {
            if schema.cost_term(name).is_none() {
                return Err(TaskError::UnknownCostTerm(name.clone()));
            }
            if !valid_weight(*value) {
                return Err(TaskError::InvalidWeight {
                    name: name.clone(),
                    value: *value,
                });
            }
        }
        self.weights
            .extend(updates.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    /// Switch to the named mode.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::UnknownMode` if the schema has no such mode.
    pub fn set_mode(
        &mut self,
        schema: &TaskSchema,
        policy: ModeSwitchPolicy,
        name: &str,
    ) -> Result<()> {
        let mode = schema
            .mode(name)
            .ok_or_else(|| TaskError::UnknownMode(name.to_string()))?;

        if policy == ModeSwitchPolicy::Reset {
            let defaults = Self::defaults(schema);
            self.parameters = defaults.parameters;
            self.weights = defaults.weights;
        }
        self.parameters.extend(mode.parameters.clone());
        self.weights.extend(mode.weights.clone());
        self.mode = mode.name.clone();
        Ok(())
    }
}
