//! Simulation state and partial updates.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::Model;

/// The mutable physical state of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    /// Simulation time in seconds.
    pub time: f64,
    /// Generalized positions, length `nq`.
    pub qpos: Vec<f64>,
    /// Generalized velocities, length `nv`.
    pub qvel: Vec<f64>,
    /// Actuator controls, length `nu`.
    pub ctrl: Vec<f64>,
    /// Sensor readings, length `nsensor`.
    pub sensordata: Vec<f64>,
    /// Free-form user buffer, length `nuserdata`.
    pub userdata: Vec<f64>,
}

impl SimulationState {
    /// Create an all-zero state at time zero sized for `model`.
    #[must_use]
    pub fn zeros(model: &Model) -> Self {
        Self {
            time: 0.0,
            qpos: vec![0.0; model.nq()],
            qvel: vec![0.0; model.nv()],
            ctrl: vec![0.0; model.nu()],
            sensordata: vec![0.0; model.nsensor()],
            userdata: vec![0.0; model.nuserdata],
        }
    }

    /// Check that every buffer has the length `model` requires.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DimensionMismatch` for the first wrong buffer.
    pub fn validate(&self, model: &Model) -> Result<()> {
        check_len("qpos", model.nq(), self.qpos.len())?;
        check_len("qvel", model.nv(), self.qvel.len())?;
        check_len("ctrl", model.nu(), self.ctrl.len())?;
        check_len("sensordata", model.nsensor(), self.sensordata.len())?;
        check_len("userdata", model.nuserdata, self.userdata.len())?;
        Ok(())
    }
}

/// A partial replacement of [`SimulationState`] fields.
///
/// Fields that are `None` are left untouched when the update is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Replacement time.
    #[serde(default)]
    pub time: Option<f64>,
    /// Replacement positions.
    #[serde(default)]
    pub qpos: Option<Vec<f64>>,
    /// Replacement velocities.
    #[serde(default)]
    pub qvel: Option<Vec<f64>>,
    /// Replacement controls.
    #[serde(default)]
    pub ctrl: Option<Vec<f64>>,
    /// Replacement sensor readings.
    #[serde(default)]
    pub sensordata: Option<Vec<f64>>,
    /// Replacement user buffer.
    #[serde(default)]
    pub userdata: Option<Vec<f64>>,
}

impl StateUpdate {
    /// Returns true if the update changes positions or velocities.
    #[must_use]
    pub const fn touches_kinematics(&self) -> bool {
        self.qpos.is_some() || self.qvel.is_some()
    }

    /// Validate the update against `model` without applying it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DimensionMismatch` for a wrongly sized field, or
    /// `CoreError::NonFinite` if the time or a physical quantity is NaN or
    /// infinite. `userdata` is opaque and only checked for length.
    pub fn validate(&self, model: &Model) -> Result<()> {
        if let Some(time) = self.time {
            check_finite("time", &[time])?;
        }
        let fields = [
            ("qpos", model.nq(), self.qpos.as_ref(), true),
            ("qvel", model.nv(), self.qvel.as_ref(), true),
            ("ctrl", model.nu(), self.ctrl.as_ref(), true),
            ("sensordata", model.nsensor(), self.sensordata.as_ref(), true),
            ("userdata", model.nuserdata, self.userdata.as_ref(), false),
        ];
        for (field, expected, value, physical) in fields {
            if let Some(value) = value {
                check_len(field, expected, value.len())?;
                if physical {
                    check_finite(field, value)?;
                }
            }
        }
        Ok(())
    }

    /// Produce the state that results from applying this update to `state`.
    ///
    /// Validation happens before any field is copied, so an error leaves the
    /// caller with nothing half-applied.
    ///
    /// # Errors
    ///
    /// See [`StateUpdate::validate`].
    pub fn apply(&self, state: &SimulationState, model: &Model) -> Result<SimulationState> {
        self.validate(model)?;

        let mut next = state.clone();
        if let Some(time) = self.time {
            next.time = time;
        }
        if let Some(qpos) = &self.qpos {
            next.qpos.clone_from(qpos);
        }
        if let Some(qvel) = &self.qvel {
            next.qvel.clone_from(qvel);
        }
        if let Some(ctrl) = &self.ctrl {
            next.ctrl.clone_from(ctrl);
        }
        if let Some(sensordata) = &self.sensordata {
            next.sensordata.clone_from(sensordata);
        }
        if let Some(userdata) = &self.userdata {
            next.userdata.clone_from(userdata);
        }
        Ok(next)
    }
}

fn check_finite(field: &'static str, values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !v.is_finite()) {
        Some(&value) => Err(CoreError::NonFinite { field, value }),
        None => Ok(()),
    }
}

fn check_len(field: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(CoreError::DimensionMismatch {
            field,
            expected,
            got,
        })
    }
}
