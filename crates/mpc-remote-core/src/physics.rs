//! Physics stepping interface.
//!
//! [`Physics`] is the narrow seam between the coordination layer and the
//! numerical integrator. Stepping is a pure function of `(model, state)`:
//! the input state is never modified, and a divergent step returns an error
//! instead of a poisoned state.

use nalgebra::DVector;
use std::fmt::Debug;

use crate::error::{CoreError, Result};
use crate::model::Model;
use crate::state::SimulationState;

/// Magnitude above which a state value is treated as divergent.
pub const DIVERGENCE_LIMIT: f64 = 1.0e8;

/// A physics engine that can advance a [`SimulationState`] by one tick.
///
/// Implementations must be `Send + Sync` so rollouts can run on worker
/// threads.
pub trait Physics: Debug + Send + Sync {
    /// Advance `state` by one `model.timestep` using `state.ctrl`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DimensionMismatch` if the state does not fit the
    /// model, or `CoreError::Divergence` if the result is not finite.
    fn step(&self, model: &Model, state: &SimulationState) -> Result<SimulationState>;

    /// Compute the sensor vector for the given positions and velocities.
    fn sensors(&self, model: &Model, qpos: &[f64], qvel: &[f64]) -> Vec<f64> {
        let _ = model;
        qpos.iter().chain(qvel).copied().collect()
    }

    /// Forward dynamics: `qacc = f(qpos, qvel, ctrl)`.
    fn acceleration(&self, model: &Model, qpos: &[f64], qvel: &[f64], ctrl: &[f64]) -> Vec<f64> {
        qpos.iter()
            .zip(qvel)
            .zip(ctrl)
            .map(|((q, v), u)| {
                (model.control_gain * model.clamp_ctrl(*u) - model.damping * v - model.stiffness * q)
                    / model.mass
            })
            .collect()
    }

    /// Inverse dynamics residual: the generalized force needed to produce
    /// `qacc` beyond what the actuators and passive terms supply.
    fn inverse_force(
        &self,
        model: &Model,
        qpos: &[f64],
        qvel: &[f64],
        qacc: &[f64],
        ctrl: &[f64],
    ) -> Vec<f64> {
        let predicted = self.acceleration(model, qpos, qvel, ctrl);
        qacc.iter()
            .zip(predicted)
            .map(|(a, p)| model.mass * (a - p))
            .collect()
    }
}

/// Semi-implicit (symplectic) Euler integration.
///
/// ```text
/// qvel' = qvel + dt * qacc
/// qpos' = qpos + dt * qvel'
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SemiImplicitEuler;

impl Physics for SemiImplicitEuler {
    fn step(&self, model: &Model, state: &SimulationState) -> Result<SimulationState> {
        state.validate(model)?;

        let dt = model.timestep;
        let qacc = DVector::from_vec(self.acceleration(model, &state.qpos, &state.qvel, &state.ctrl));
        let qvel = DVector::from_column_slice(&state.qvel) + qacc * dt;
        let qpos = DVector::from_column_slice(&state.qpos) + &qvel * dt;

        check_finite(state.time, "qvel", qvel.as_slice())?;
        check_finite(state.time, "qpos", qpos.as_slice())?;

        let qpos: Vec<f64> = qpos.iter().copied().collect();
        let qvel: Vec<f64> = qvel.iter().copied().collect();
        let sensordata = self.sensors(model, &qpos, &qvel);

        Ok(SimulationState {
            time: state.time + dt,
            qpos,
            qvel,
            ctrl: state.ctrl.clone(),
            sensordata,
            userdata: state.userdata.clone(),
        })
    }
}

fn check_finite(time: f64, field: &str, values: &[f64]) -> Result<()> {
    match values
        .iter()
        .position(|v| !v.is_finite() || v.abs() > DIVERGENCE_LIMIT)
    {
        None => Ok(()),
        Some(index) => Err(CoreError::Divergence {
            time,
            detail: format!("{field}[{index}] = {}", values[index]),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_advances_time_and_integrates() {
        let model = Model::new("m", 1, 0.1);
        let mut state = SimulationState::zeros(&model);
        state.ctrl = vec![1.0];

        let next = SemiImplicitEuler.step(&model, &state).unwrap();
        assert!((next.time - 0.1).abs() < 1e-12);
        assert!((next.qvel[0] - 0.1).abs() < 1e-12);
        assert!((next.qpos[0] - 0.01).abs() < 1e-12);
        assert_eq!(next.sensordata, vec![next.qpos[0], next.qvel[0]]);
    }

    #[test]
    fn step_does_not_modify_input() {
        let model = Model::new("m", 2, 0.01);
        let mut state = SimulationState::zeros(&model);
        state.ctrl = vec![1.0, -1.0];
        let before = state.clone();

        let _ = SemiImplicitEuler.step(&model, &state).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn controls_are_clamped() {
        let model = Model::new("m", 1, 0.1);
        let mut state = SimulationState::zeros(&model);
        state.ctrl = vec![100.0];

        let next = SemiImplicitEuler.step(&model, &state).unwrap();
        assert!((next.qvel[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn divergence_is_reported() {
        let model = Model::new("m", 1, 0.1);
        let mut state = SimulationState::zeros(&model);
        state.qvel = vec![f64::MAX];

        let err = SemiImplicitEuler.step(&model, &state).unwrap_err();
        assert!(err.is_divergence());
    }

    #[test]
    fn wrong_dimensions_are_rejected() {
        let model = Model::new("m", 2, 0.1);
        let mut state = SimulationState::zeros(&model);
        state.qpos.push(0.0);

        assert!(matches!(
            SemiImplicitEuler.step(&model, &state),
            Err(CoreError::DimensionMismatch { field: "qpos", .. })
        ));
    }

    #[test]
    fn inverse_force_vanishes_on_consistent_motion() {
        let model = Model::new("m", 1, 0.1)
            .with_damping(0.3)
            .with_stiffness(2.0);
        let qacc = SemiImplicitEuler.acceleration(&model, &[0.5], &[0.2], &[0.4]);
        let force = SemiImplicitEuler.inverse_force(&model, &[0.5], &[0.2], &qacc, &[0.4]);
        assert!(force[0].abs() < 1e-12);
    }
}
