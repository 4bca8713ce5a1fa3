//! Parameter, cost-term and mode declarations.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// A tunable task parameter with its default and admissible range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Value after `Init`/`Reset`.
    pub default: f64,
    /// Smallest admissible value.
    pub min: f64,
    /// Largest admissible value.
    pub max: f64,
}

impl ParameterSpec {
    /// Declare a parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            default,
            min,
            max,
        }
    }

    /// Whether `value` is finite and within `[min, max]`.
    #[must_use]
    pub fn admits(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// How a residual vector is turned into a scalar cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Norm {
    /// `0.5 * |r|^2`.
    Quadratic,
    /// `sum(sqrt(r_i^2 + p^2) - p)`: quadratic near zero, linear far away.
    SmoothAbs {
        /// Transition width `p`.
        smoothing: f64,
    },
}

impl Norm {
    /// Evaluate the norm on a residual vector.
    #[must_use]
    pub fn evaluate(self, residual: &[f64]) -> f64 {
        match self {
            Self::Quadratic => 0.5 * residual.iter().map(|r| r * r).sum::<f64>(),
            Self::SmoothAbs { smoothing } => {
                let p2 = smoothing * smoothing;
                residual
                    .iter()
                    .map(|r| (r * r + p2).sqrt() - smoothing)
                    .sum()
            }
        }
    }
}

/// A weighted cost term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTermSpec {
    /// Term name, used as the key of `SetCostWeights`.
    pub name: String,
    /// Weight after `Init`/`Reset`.
    pub default_weight: f64,
    /// Residual norm.
    pub norm: Norm,
}

impl CostTermSpec {
    /// Declare a quadratic cost term.
    #[must_use]
    pub fn quadratic(name: impl Into<String>, default_weight: f64) -> Self {
        Self {
            name: name.into(),
            default_weight,
            norm: Norm::Quadratic,
        }
    }

    /// Declare a smooth-abs cost term.
    #[must_use]
    pub fn smooth_abs(name: impl Into<String>, default_weight: f64, smoothing: f64) -> Self {
        Self {
            name: name.into(),
            default_weight,
            norm: Norm::SmoothAbs { smoothing },
        }
    }
}

/// A named preset of parameter and weight values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeSpec {
    /// Mode name.
    pub name: String,
    /// Parameter values this mode sets.
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    /// Weights this mode sets.
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl ModeSpec {
    /// A mode with an empty preset.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a parameter value to the preset.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Add a weight to the preset.
    #[must_use]
    pub fn with_weight(mut self, name: impl Into<String>, value: f64) -> Self {
        self.weights.insert(name.into(), value);
        self
    }
}

/// What happens to the other settings when the mode changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSwitchPolicy {
    /// Restore every parameter and weight to its default, then apply the
    /// preset.
    #[default]
    Reset,
    /// Overwrite only the keys the preset names.
    Merge,
}

/// Everything a task declares about its tunable surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSchema {
    /// Parameters in declaration order.
    pub parameters: Vec<ParameterSpec>,
    /// Cost terms in declaration order; residuals follow the same order.
    pub cost_terms: Vec<CostTermSpec>,
    /// Modes in declaration order; the first is the default.
    pub modes: Vec<ModeSpec>,
}

impl TaskSchema {
    /// Find a parameter by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Find a cost term by name.
    #[must_use]
    pub fn cost_term(&self, name: &str) -> Option<&CostTermSpec> {
        self.cost_terms.iter().find(|t| t.name == name)
    }

    /// Find a mode by name.
    #[must_use]
    pub fn mode(&self, name: &str) -> Option<&ModeSpec> {
        self.modes.iter().find(|m| m.name == name)
    }

    /// Name of the first declared mode, or `""` for a schema without modes.
    ///
    /// Registered schemas always declare at least one mode.
    #[must_use]
    pub fn default_mode(&self) -> &str {
        self.modes.first().map_or("", |m| m.name.as_str())
    }

    /// Mode names in declaration order.
    #[must_use]
    pub fn mode_names(&self) -> Vec<String> {
        self.modes.iter().map(|m| m.name.clone()).collect()
    }

    /// Check the schema is self-consistent.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidSchema` if names repeat, a default is
    /// outside its bounds, no mode is declared, or a mode preset refers to
    /// an undeclared key or carries an inadmissible value.
    pub fn validate(&self, task: &str) -> Result<()> {
        let invalid = |reason: String| TaskError::InvalidSchema {
            task: task.to_string(),
            reason,
        };

        unique(self.parameters.iter().map(|p| p.name.as_str()))
            .map_err(|name| invalid(format!("duplicate parameter {name}")))?;
        unique(self.cost_terms.iter().map(|t| t.name.as_str()))
            .map_err(|name| invalid(format!("duplicate cost term {name}")))?;
        unique(self.modes.iter().map(|m| m.name.as_str()))
            .map_err(|name| invalid(format!("duplicate mode {name}")))?;

        for spec in &self.parameters {
            if !spec.admits(spec.default) {
                return Err(invalid(format!(
                    "parameter {} default {} outside [{}, {}]",
                    spec.name, spec.default, spec.min, spec.max
                )));
            }
        }
        for term in &self.cost_terms {
            if !valid_weight(term.default_weight) {
                return Err(invalid(format!(
                    "cost term {} has invalid default weight {}",
                    term.name, term.default_weight
                )));
            }
            if let Norm::SmoothAbs { smoothing } = term.norm {
                if !(smoothing.is_finite() && smoothing > 0.0) {
                    return Err(invalid(format!(
                        "cost term {} has invalid smoothing {smoothing}",
                        term.name
                    )));
                }
            }
        }

        if self.modes.is_empty() {
            return Err(invalid("no modes declared".to_string()));
        }
        for mode in &self.modes {
            for (name, value) in &mode.parameters {
                let spec = self.parameter(name).ok_or_else(|| {
                    invalid(format!("mode {} sets unknown parameter {name}", mode.name))
                })?;
                if !spec.admits(*value) {
                    return Err(invalid(format!(
                        "mode {} sets {name} = {value} outside its bounds",
                        mode.name
                    )));
                }
            }
            for (name, value) in &mode.weights {
                if self.cost_term(name).is_none() {
                    return Err(invalid(format!(
                        "mode {} sets unknown cost term {name}",
                        mode.name
                    )));
                }
                if !valid_weight(*value) {
                    return Err(invalid(format!(
                        "mode {} sets invalid weight {name} = {value}",
                        mode.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Whether `value` is usable as a cost weight.
#[must_use]
pub fn valid_weight(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn unique<'a>(names: impl Iterator<Item = &'a str>) -> std::result::Result<(), &'a str> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TaskSchema {
        TaskSchema {
            parameters: vec![ParameterSpec::new("goal", 0.0, -1.0, 1.0)],
            cost_terms: vec![
                CostTermSpec::quadratic("position", 1.0),
                CostTermSpec::smooth_abs("effort", 0.1, 0.2),
            ],
            modes: vec![
                ModeSpec::new("idle"),
                ModeSpec::new("reach").with_parameter("goal", 0.5).with_weight("effort", 0.0),
            ],
        }
    }

    #[test]
    fn valid_schema_passes() {
        let schema = schema();
        schema.validate("test").unwrap();
        assert_eq!(schema.default_mode(), "idle");
        assert_eq!(schema.mode_names(), vec!["idle", "reach"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut schema = schema();
        schema.cost_terms.push(CostTermSpec::quadratic("position", 1.0));
        assert!(matches!(
            schema.validate("test"),
            Err(TaskError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn mode_preset_must_reference_declared_keys() {
        let mut schema = schema();
        schema.modes.push(ModeSpec::new("bad").with_weight("missing", 1.0));
        assert!(schema.validate("test").is_err());

        let mut schema = self::schema();
        schema.modes.push(ModeSpec::new("far").with_parameter("goal", 3.0));
        assert!(schema.validate("test").is_err());
    }

    #[test]
    fn schema_without_modes_is_rejected() {
        let mut schema = schema();
        schema.modes.clear();
        assert!(schema.validate("test").is_err());
        assert_eq!(schema.default_mode(), "");
    }

    #[test]
    fn norms() {
        assert!((Norm::Quadratic.evaluate(&[3.0, 4.0]) - 12.5).abs() < 1e-12);

        let smooth = Norm::SmoothAbs { smoothing: 0.1 };
        assert!(smooth.evaluate(&[0.0]).abs() < 1e-12);
        // Far from zero the smooth-abs norm grows like |r|.
        assert!((smooth.evaluate(&[10.0]) - (10.0f64.hypot(0.1) - 0.1)).abs() < 1e-12);
    }

    #[test]
    fn parameter_bounds() {
        let spec = ParameterSpec::new("x", 0.0, -1.0, 1.0);
        assert!(spec.admits(1.0));
        assert!(!spec.admits(1.5));
        assert!(!spec.admits(f64::NAN));
    }

    #[test]
    fn switch_policy_serde() {
        let json = serde_json::to_string(&ModeSwitchPolicy::Merge).unwrap();
        assert_eq!(json, "\"merge\"");
    }
}
