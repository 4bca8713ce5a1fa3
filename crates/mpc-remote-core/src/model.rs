//! Physical model descriptions.
//!
//! A [`Model`] describes a fully actuated, linear second-order system with
//! `ndof` degrees of freedom:
//!
//! ```text
//! mass * qacc = control_gain * ctrl - damping * qvel - stiffness * qpos
//! ```
//!
//! Every degree of freedom has one actuator, and the sensor vector is the
//! concatenation of `qpos` and `qvel`.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Physical parameters of a simulated system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Human-readable model name.
    pub name: String,
    /// Number of degrees of freedom (`nq == nv == nu`).
    pub ndof: usize,
    /// Integration timestep in seconds.
    pub timestep: f64,
    /// Mass of every degree of freedom.
    pub mass: f64,
    /// Linear velocity damping.
    pub damping: f64,
    /// Linear position stiffness.
    pub stiffness: f64,
    /// Gain mapping `ctrl` to generalized force.
    pub control_gain: f64,
    /// Lower and upper control limits.
    pub ctrl_range: (f64, f64),
    /// Length of the free-form `userdata` buffer.
    #[serde(default)]
    pub nuserdata: usize,
}

impl Model {
    /// Create a unit-mass, undamped model with control limits of `[-1, 1]`.
    #[must_use]
    pub fn new(name: impl Into<String>, ndof: usize, timestep: f64) -> Self {
        Self {
            name: name.into(),
            ndof,
            timestep,
            mass: 1.0,
            damping: 0.0,
            stiffness: 0.0,
            control_gain: 1.0,
            ctrl_range: (-1.0, 1.0),
            nuserdata: 0,
        }
    }

    /// Set the mass.
    #[must_use]
    pub const fn with_mass(mut self, mass: f64) -> Self {
        self.mass = mass;
        self
    }

    /// Set the damping coefficient.
    #[must_use]
    pub const fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the stiffness coefficient.
    #[must_use]
    pub const fn with_stiffness(mut self, stiffness: f64) -> Self {
        self.stiffness = stiffness;
        self
    }

    /// Set the control gain.
    #[must_use]
    pub const fn with_control_gain(mut self, gain: f64) -> Self {
        self.control_gain = gain;
        self
    }

    /// Set the control limits.
    #[must_use]
    pub const fn with_ctrl_range(mut self, lower: f64, upper: f64) -> Self {
        self.ctrl_range = (lower, upper);
        self
    }

    /// Set the length of the `userdata` buffer.
    #[must_use]
    pub const fn with_userdata(mut self, nuserdata: usize) -> Self {
        self.nuserdata = nuserdata;
        self
    }

    /// Number of generalized coordinates.
    #[must_use]
    pub const fn nq(&self) -> usize {
        self.ndof
    }

    /// Number of generalized velocities.
    #[must_use]
    pub const fn nv(&self) -> usize {
        self.ndof
    }

    /// Number of actuators.
    #[must_use]
    pub const fn nu(&self) -> usize {
        self.ndof
    }

    /// Length of the sensor vector.
    #[must_use]
    pub const fn nsensor(&self) -> usize {
        2 * self.ndof
    }

    /// Clamp a control value to the model's limits.
    #[must_use]
    pub fn clamp_ctrl(&self, value: f64) -> f64 {
        value.clamp(self.ctrl_range.0, self.ctrl_range.1)
    }

    /// Width of the control range.
    #[must_use]
    pub fn ctrl_span(&self) -> f64 {
        self.ctrl_range.1 - self.ctrl_range.0
    }

    /// Check that all parameters are usable.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidModel` naming the first offending parameter.
    pub fn validate(&self) -> Result<()> {
        if self.ndof == 0 {
            return Err(CoreError::InvalidModel("ndof must be positive".into()));
        }
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err(CoreError::InvalidModel(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if !(self.mass.is_finite() && self.mass > 0.0) {
            return Err(CoreError::InvalidModel(format!(
                "mass must be positive, got {}",
                self.mass
            )));
        }
        for (name, value) in [
            ("damping", self.damping),
            ("stiffness", self.stiffness),
            ("control_gain", self.control_gain),
        ] {
            if !value.is_finite() {
                return Err(CoreError::InvalidModel(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        let (lower, upper) = self.ctrl_range;
        if !(lower.is_finite() && upper.is_finite() && lower < upper) {
            return Err(CoreError::InvalidModel(format!(
                "ctrl_range must be an increasing finite interval, got ({lower}, {upper})"
            )));
        }
        Ok(())
    }

    /// Return a copy of this model with the given overrides applied.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidModel` if the result fails validation.
    pub fn with_overrides(&self, overrides: &ModelOverrides) -> Result<Self> {
        let mut model = self.clone();
        if let Some(timestep) = overrides.timestep {
            model.timestep = timestep;
        }
        if let Some(mass) = overrides.mass {
            model.mass = mass;
        }
        if let Some(damping) = overrides.damping {
            model.damping = damping;
        }
        if let Some(stiffness) = overrides.stiffness {
            model.stiffness = stiffness;
        }
        if let Some(gain) = overrides.control_gain {
            model.control_gain = gain;
        }
        model.validate()?;
        Ok(model)
    }
}

/// Optional replacements for a task's default model parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverrides {
    /// Replacement timestep.
    #[serde(default)]
    pub timestep: Option<f64>,
    /// Replacement mass.
    #[serde(default)]
    pub mass: Option<f64>,
    /// Replacement damping.
    #[serde(default)]
    pub damping: Option<f64>,
    /// Replacement stiffness.
    #[serde(default)]
    pub stiffness: Option<f64>,
    /// Replacement control gain.
    #[serde(default)]
    pub control_gain: Option<f64>,
}

impl ModelOverrides {
    /// Returns true if no parameter is overridden.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.timestep.is_none()
            && self.mass.is_none()
            && self.damping.is_none()
            && self.stiffness.is_none()
            && self.control_gain.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_follow_ndof() {
        let model = Model::new("m", 3, 0.01);
        assert_eq!(model.nq(), 3);
        assert_eq!(model.nv(), 3);
        assert_eq!(model.nu(), 3);
        assert_eq!(model.nsensor(), 6);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Model::new("m", 0, 0.01).validate().is_err());
        assert!(Model::new("m", 1, 0.0).validate().is_err());
        assert!(Model::new("m", 1, 0.01).with_mass(-1.0).validate().is_err());
        assert!(Model::new("m", 1, 0.01)
            .with_ctrl_range(1.0, -1.0)
            .validate()
            .is_err());
        assert!(Model::new("m", 1, 0.01)
            .with_damping(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn overrides_apply_and_validate() {
        let base = Model::new("m", 2, 0.01);
        let overrides = ModelOverrides {
            timestep: Some(0.02),
            damping: Some(0.5),
            ..Default::default()
        };
        let model = base.with_overrides(&overrides).unwrap();
        assert!((model.timestep - 0.02).abs() < f64::EPSILON);
        assert!((model.damping - 0.5).abs() < f64::EPSILON);
        assert!((model.mass - 1.0).abs() < f64::EPSILON);

        let bad = ModelOverrides {
            mass: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(
            base.with_overrides(&bad),
            Err(CoreError::InvalidModel(_))
        ));
    }

    #[test]
    fn empty_overrides() {
        assert!(ModelOverrides::default().is_empty());
        let overrides = ModelOverrides {
            stiffness: Some(1.0),
            ..Default::default()
        };
        assert!(!overrides.is_empty());
    }

    #[test]
    fn clamps_controls() {
        let model = Model::new("m", 1, 0.01).with_ctrl_range(-2.0, 2.0);
        assert!((model.clamp_ctrl(5.0) - 2.0).abs() < f64::EPSILON);
        assert!((model.clamp_ctrl(-5.0) + 2.0).abs() < f64::EPSILON);
        assert!((model.ctrl_span() - 4.0).abs() < f64::EPSILON);
    }
}
