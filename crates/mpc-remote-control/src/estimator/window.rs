//! The estimator's sliding window of observations.
//!
//! Slots are kept in a ring: shifting rotates the oldest slots to the back
//! and clears them, so buffers are allocated once per window length.

use std::collections::VecDeque;

use mpc_remote_core::Model;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// Buffer sizes of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Generalized positions.
    pub nq: usize,
    /// Generalized velocities.
    pub nv: usize,
    /// Actuators.
    pub nu: usize,
    /// Sensor values.
    pub nsensor: usize,
}

impl Dimensions {
    /// Dimensions of `model`.
    #[must_use]
    pub const fn of(model: &Model) -> Self {
        Self {
            nq: model.nq(),
            nv: model.nv(),
            nu: model.nu(),
            nsensor: model.nsensor(),
        }
    }
}

/// One recorded observation: the state a step started from and the control
/// applied during it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Time at the start of the step.
    pub time: f64,
    /// Control applied during the step.
    pub ctrl: Vec<f64>,
    /// Sensor readings at the start of the step.
    pub sensor: Vec<f64>,
}

/// Partial update of one slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotUpdate {
    /// Observation time.
    #[serde(default)]
    pub time: Option<f64>,
    /// Applied control, length `nu`.
    #[serde(default)]
    pub ctrl: Option<Vec<f64>>,
    /// Measured sensors, length `nsensor`.
    #[serde(default)]
    pub sensor_measurement: Option<Vec<f64>>,
    /// Configuration guess, length `nq`.
    #[serde(default)]
    pub configuration: Option<Vec<f64>>,
}

/// A snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotData {
    /// Absolute index of the slot.
    pub index: u64,
    /// Whether time, control and sensor measurement are all set.
    pub filled: bool,
    /// Observation time.
    pub time: Option<f64>,
    /// Applied control.
    pub ctrl: Option<Vec<f64>>,
    /// Measured sensors.
    pub sensor_measurement: Option<Vec<f64>>,
    /// Configuration guess or estimate.
    pub configuration: Vec<f64>,
    /// Estimated velocity.
    pub velocity: Vec<f64>,
    /// Sensors predicted from the estimate.
    pub sensor_prediction: Vec<f64>,
    /// Estimated inverse dynamics force.
    pub force: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Slot {
    time: f64,
    ctrl: Vec<f64>,
    sensor: Vec<f64>,
    has_time: bool,
    has_ctrl: bool,
    has_sensor: bool,
    configuration: Vec<f64>,
    velocity: Vec<f64>,
    sensor_prediction: Vec<f64>,
    force: Vec<f64>,
}

impl Slot {
    fn new(dims: Dimensions) -> Self {
        Self {
            time: 0.0,
            ctrl: vec![0.0; dims.nu],
            sensor: vec![0.0; dims.nsensor],
            has_time: false,
            has_ctrl: false,
            has_sensor: false,
            configuration: vec![0.0; dims.nq],
            velocity: vec![0.0; dims.nv],
            sensor_prediction: vec![0.0; dims.nsensor],
            force: vec![0.0; dims.nv],
        }
    }

    const fn is_filled(&self) -> bool {
        self.has_time && self.has_ctrl && self.has_sensor
    }

    fn clear(&mut self) {
        self.time = 0.0;
        self.has_time = false;
        self.has_ctrl = false;
        self.has_sensor = false;
        for buffer in [
            &mut self.ctrl,
            &mut self.sensor,
            &mut self.configuration,
            &mut self.velocity,
            &mut self.sensor_prediction,
            &mut self.force,
        ] {
            buffer.fill(0.0);
        }
    }
}

/// Estimated trajectories written back after an optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    /// Configurations, one per slot.
    pub configurations: Vec<Vec<f64>>,
    /// Velocities, one per slot.
    pub velocities: Vec<Vec<f64>>,
    /// Predicted sensors, one per slot.
    pub sensor_predictions: Vec<Vec<f64>>,
    /// Inverse dynamics forces, one per slot.
    pub forces: Vec<Vec<f64>>,
}

/// The sliding window.
#[derive(Debug, Clone)]
pub struct Window {
    dims: Dimensions,
    first_index: u64,
    slots: VecDeque<Slot>,
}

impl Window {
    /// An all-unfilled window of `len` slots starting at absolute index 0.
    #[must_use]
    pub fn new(dims: Dimensions, len: usize) -> Self {
        Self {
            dims,
            first_index: 0,
            slots: (0..len).map(|_| Slot::new(dims)).collect(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the window has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot buffer sizes.
    #[must_use]
    pub const fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Absolute index of the oldest slot.
    #[must_use]
    pub const fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Whether every slot is filled.
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.slots.iter().all(Slot::is_filled)
    }

    /// Position of the first unfilled slot.
    #[must_use]
    pub fn first_unfilled(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_filled())
    }

    fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots.get(index).ok_or(ServiceError::OutOfRange {
            index,
            len: self.slots.len(),
        })
    }

    /// Snapshot of the slot at window position `index`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::OutOfRange` if `index >= len()`.
    pub fn data(&self, index: usize) -> Result<SlotData> {
        let slot = self.slot(index)?;
        Ok(SlotData {
            index: self.first_index + index as u64,
            filled: slot.is_filled(),
            time: slot.has_time.then_some(slot.time),
            ctrl: slot.has_ctrl.then(|| slot.ctrl.clone()),
            sensor_measurement: slot.has_sensor.then(|| slot.sensor.clone()),
            configuration: slot.configuration.clone(),
            velocity: slot.velocity.clone(),
            sensor_prediction: slot.sensor_prediction.clone(),
            force: slot.force.clone(),
        })
    }

    /// Apply `update` to the slot at window position `index`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::OutOfRange` for a bad index and
    /// `ServiceError::InvalidArgument` for a wrongly sized or non-finite
    /// field; the slot is unchanged in both cases.
    pub fn set(&mut self, index: usize, update: &SlotUpdate) -> Result<SlotData> {
        self.slot(index)?;
        if let Some(time) = update.time {
            if !time.is_finite() {
                return Err(ServiceError::invalid(format!("time must be finite, got {time}")));
            }
        }
        check_vector("ctrl", self.dims.nu, update.ctrl.as_deref())?;
        check_vector(
            "sensor_measurement",
            self.dims.nsensor,
            update.sensor_measurement.as_deref(),
        )?;
        check_vector("configuration", self.dims.nq, update.configuration.as_deref())?;

        let slot = &mut self.slots[index];
        if let Some(time) = update.time {
            slot.time = time;
            slot.has_time = true;
        }
        if let Some(ctrl) = &update.ctrl {
            slot.ctrl.copy_from_slice(ctrl);
            slot.has_ctrl = true;
        }
        if let Some(sensor) = &update.sensor_measurement {
            slot.sensor.copy_from_slice(sensor);
            slot.has_sensor = true;
        }
        if let Some(configuration) = &update.configuration {
            slot.configuration.copy_from_slice(configuration);
        }
        self.data(index)
    }

    /// Discard the oldest `n` slots and append `n` unfilled ones whose
    /// configuration is warm-started from the newest slot.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` if `n > len()`; the window
    /// is unchanged.
    pub fn shift(&mut self, n: usize) -> Result<()> {
        if n > self.slots.len() {
            return Err(ServiceError::invalid(format!(
                "cannot shift {n} slots in a window of {}",
                self.slots.len()
            )));
        }
        if n == 0 {
            return Ok(());
        }
        let warm = self.newest_configuration();
        self.slots.rotate_left(n);
        let len = self.slots.len();
        for slot in self.slots.range_mut(len - n..) {
            slot.clear();
            slot.configuration.copy_from_slice(&warm);
        }
        self.first_index += n as u64;
        Ok(())
    }

    /// Change the number of slots, keeping the newest ones.
    pub fn resize(&mut self, len: usize) {
        let current = self.slots.len();
        if len < current {
            let dropped = current - len;
            self.slots.drain(..dropped);
            self.first_index += dropped as u64;
        } else {
            let warm = self.newest_configuration();
            for _ in current..len {
                let mut slot = Slot::new(self.dims);
                slot.configuration.copy_from_slice(&warm);
                self.slots.push_back(slot);
            }
        }
    }

    /// Clear every slot in place and restart absolute indexing at 0.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.first_index = 0;
    }

    /// Record an observation after the newest filled slot, shifting the
    /// window by one when it is full. Returns the slot's absolute index.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` if the observation does not
    /// match the window's dimensions.
    pub fn append(&mut self, observation: &Observation) -> Result<u64> {
        check_vector("ctrl", self.dims.nu, Some(observation.ctrl.as_slice()))?;
        check_vector("sensor", self.dims.nsensor, Some(observation.sensor.as_slice()))?;
        if self.slots.is_empty() {
            return Err(ServiceError::invalid("window has no slots"));
        }

        let mut position = self
            .slots
            .iter()
            .rposition(Slot::is_filled)
            .map_or(0, |last| last + 1);
        if position == self.slots.len() {
            self.shift(1)?;
            position -= 1;
        } else if position > 0 {
            let previous = self.slots[position - 1].configuration.clone();
            self.slots[position].configuration.copy_from_slice(&previous);
        }

        let slot = &mut self.slots[position];
        slot.time = observation.time;
        slot.ctrl.copy_from_slice(&observation.ctrl);
        slot.sensor.copy_from_slice(&observation.sensor);
        slot.has_time = true;
        slot.has_ctrl = true;
        slot.has_sensor = true;
        Ok(self.first_index + position as u64)
    }

    /// Observation times, one per slot.
    #[must_use]
    pub fn times(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.time).collect()
    }

    /// Applied controls, one per slot.
    #[must_use]
    pub fn controls(&self) -> Vec<Vec<f64>> {
        self.slots.iter().map(|s| s.ctrl.clone()).collect()
    }

    /// Measured sensors, one per slot.
    #[must_use]
    pub fn sensors(&self) -> Vec<Vec<f64>> {
        self.slots.iter().map(|s| s.sensor.clone()).collect()
    }

    /// Configurations, one per slot.
    #[must_use]
    pub fn configurations(&self) -> Vec<Vec<f64>> {
        self.slots.iter().map(|s| s.configuration.clone()).collect()
    }

    /// Write an optimization result back into the slots.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Internal` if the estimate does not cover
    /// every slot with correctly sized vectors.
    pub fn commit(&mut self, estimate: &Estimate) -> Result<()> {
        let len = self.slots.len();
        let sized = |rows: &[Vec<f64>], width: usize| {
            rows.len() == len && rows.iter().all(|r| r.len() == width)
        };
        if !(sized(&estimate.configurations, self.dims.nq)
            && sized(&estimate.velocities, self.dims.nv)
            && sized(&estimate.sensor_predictions, self.dims.nsensor)
            && sized(&estimate.forces, self.dims.nv))
        {
            return Err(ServiceError::Internal(
                "estimate does not match the window".to_string(),
            ));
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.configuration.copy_from_slice(&estimate.configurations[i]);
            slot.velocity.copy_from_slice(&estimate.velocities[i]);
            slot.sensor_prediction
                .copy_from_slice(&estimate.sensor_predictions[i]);
            slot.force.copy_from_slice(&estimate.forces[i]);
        }
        Ok(())
    }

    fn newest_configuration(&self) -> Vec<f64> {
        self.slots
            .back()
            .map_or_else(|| vec![0.0; self.dims.nq], |s| s.configuration.clone())
    }
}

fn check_vector(field: &str, expected: usize, value: Option<&[f64]>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value.len() != expected {
        return Err(ServiceError::invalid(format!(
            "{field} has length {}, expected {expected}",
            value.len()
        )));
    }
    if value.iter().any(|v| !v.is_finite()) {
        return Err(ServiceError::invalid(format!("{field} must be finite")));
    }
    Ok(())
}
