//! Sliding-window batch smoother.
//!
//! The decision variables are the configurations `q_0 .. q_{T-1}` of every
//! slot. Velocities and accelerations follow from finite differences that
//! match the semi-implicit integrator:
//!
//! ```text
//! v_t = (q_t - q_{t-1}) / dt_t              t >= 1
//! a_t = (v_{t+1} - v_t) / dt_{t+1}          1 <= t <= T-2
//! ```
//!
//! and the weighted residual stacks three blocks:
//!
//! ```text
//! sensor  y_t - h(q_t, v_t)                 t >= 1
//! force   f(q_t, v_t, a_t, u_t)             1 <= t <= T-2
//! prior   q_t - q̄_t                         all t
//! ```
//!
//! where `q̄` is the configuration guess at the start of the optimization.
//! The cost is half the squared norm of the weighted residual.

use std::sync::Arc;

use mpc_remote_core::{Model, Physics};
use mpc_remote_pool::WorkerPool;
use nalgebra::{DMatrix, DVector};

use crate::error::{Result, ServiceError};
use crate::estimator::window::{Estimate, Window};
use crate::types::{EstimatorCosts, EstimatorSettings, EstimatorStatus, EstimatorWeights};

/// Smallest damping used once the plain Gauss-Newton step has been refused.
const MIN_DAMPING: f64 = 1.0e-9;

/// Damping increases tried per iteration before giving up.
const MAX_DAMPING_TRIES: usize = 12;

/// Relative perturbation of the finite-difference Jacobian.
const JACOBIAN_EPSILON: f64 = 1.0e-6;

/// A smoothing problem frozen from a filled window.
#[derive(Debug)]
pub struct Problem {
    model: Model,
    physics: Arc<dyn Physics>,
    dts: Vec<f64>,
    controls: Vec<Vec<f64>>,
    sensors: Vec<Vec<f64>>,
    prior: Vec<f64>,
    sqrt_sensor: Vec<f64>,
    sqrt_force: Vec<f64>,
    sqrt_prior: f64,
}

impl Problem {
    /// Freeze the window into a problem.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidArgument` if a slot is unfilled or the
    /// slot times do not strictly increase.
    pub fn from_window(
        window: &Window,
        model: &Model,
        physics: Arc<dyn Physics>,
        weights: &EstimatorWeights,
    ) -> Result<Self> {
        if let Some(index) = window.first_unfilled() {
            return Err(ServiceError::invalid(format!(
                "estimator slot {index} is not filled"
            )));
        }
        let times = window.times();
        let mut dts = vec![0.0; times.len()];
        for t in 1..times.len() {
            dts[t] = times[t] - times[t - 1];
            if dts[t] <= 0.0 {
                return Err(ServiceError::invalid(format!(
                    "estimator slot times must increase, slot {t} has time {}",
                    times[t]
                )));
            }
        }

        Ok(Self {
            model: model.clone(),
            physics,
            dts,
            controls: window.controls(),
            sensors: window.sensors(),
            prior: window.configurations().concat(),
            sqrt_sensor: weights.sensor.iter().map(|w| w.sqrt()).collect(),
            sqrt_force: weights.force.iter().map(|w| w.sqrt()).collect(),
            sqrt_prior: weights.prior.sqrt(),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dts.len()
    }

    /// Whether the problem has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dts.is_empty()
    }

    /// Number of decision variables.
    #[must_use]
    pub fn num_variables(&self) -> usize {
        self.prior.len()
    }

    /// The configuration guess the problem was frozen with.
    #[must_use]
    pub fn initial_guess(&self) -> Vec<f64> {
        self.prior.clone()
    }

    fn configuration<'a>(&self, q: &'a [f64], t: usize) -> &'a [f64] {
        let nq = self.model.nq();
        &q[t * nq..(t + 1) * nq]
    }

    fn velocities(&self, q: &[f64]) -> Vec<Vec<f64>> {
        let mut velocities = vec![vec![0.0; self.model.nv()]; self.len()];
        for t in 1..self.len() {
            let current = self.configuration(q, t);
            let previous = self.configuration(q, t - 1);
            velocities[t] = current
                .iter()
                .zip(previous)
                .map(|(c, p)| (c - p) / self.dts[t])
                .collect();
        }
        if self.len() > 1 {
            velocities[0] = velocities[1].clone();
        }
        velocities
    }

    fn acceleration(&self, velocities: &[Vec<f64>], t: usize) -> Vec<f64> {
        velocities[t + 1]
            .iter()
            .zip(&velocities[t])
            .map(|(next, current)| (next - current) / self.dts[t + 1])
            .collect()
    }

    fn force(&self, q: &[f64], velocities: &[Vec<f64>], t: usize) -> Vec<f64> {
        let acceleration = self.acceleration(velocities, t);
        self.physics.inverse_force(
            &self.model,
            self.configuration(q, t),
            &velocities[t],
            &acceleration,
            &self.controls[t],
        )
    }

    /// Residual blocks: `(sensor, force, prior)`, already weighted.
    fn residual_blocks(&self, q: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let velocities = self.velocities(q);
        let len = self.len();

        let mut sensor = Vec::with_capacity(len.saturating_sub(1) * self.model.nsensor());
        for t in 1..len {
            let predicted = self
                .physics
                .sensors(&self.model, self.configuration(q, t), &velocities[t]);
            sensor.extend(
                self.sensors[t]
                    .iter()
                    .zip(predicted)
                    .zip(&self.sqrt_sensor)
                    .map(|((y, h), w)| w * (y - h)),
            );
        }

        let mut force = Vec::with_capacity(len.saturating_sub(2) * self.model.nv());
        for t in 1..len.saturating_sub(1) {
            force.extend(
                self.force(q, &velocities, t)
                    .into_iter()
                    .zip(&self.sqrt_force)
                    .map(|(f, w)| w * f),
            );
        }

        let prior = q
            .iter()
            .zip(&self.prior)
            .map(|(value, reference)| self.sqrt_prior * (value - reference))
            .collect();

        (sensor, force, prior)
    }

    /// Stacked weighted residual at `q`.
    #[must_use]
    pub fn residual(&self, q: &[f64]) -> Vec<f64> {
        let (mut sensor, force, prior) = self.residual_blocks(q);
        sensor.extend(force);
        sensor.extend(prior);
        sensor
    }

    /// Cost breakdown at `q`.
    #[must_use]
    pub fn costs(&self, q: &[f64]) -> EstimatorCosts {
        let half_square = |block: &[f64]| 0.5 * block.iter().map(|r| r * r).sum::<f64>();
        let (sensor, force, prior) = self.residual_blocks(q);
        let sensor = half_square(&sensor);
        let force = half_square(&force);
        let prior = half_square(&prior);
        EstimatorCosts {
            total: sensor + force + prior,
            sensor,
            force,
            prior,
        }
    }

    /// Forward-difference column `j` of the residual Jacobian at `q`.
    #[must_use]
    pub fn jacobian_column(&self, q: &[f64], base: &[f64], j: usize) -> Vec<f64> {
        let step = JACOBIAN_EPSILON * q[j].abs().max(1.0);
        let mut perturbed = q.to_vec();
        perturbed[j] += step;
        self.residual(&perturbed)
            .iter()
            .zip(base)
            .map(|(r, r0)| (r - r0) / step)
            .collect()
    }

    /// Derived trajectories at `q`, ready to be committed to the window.
    #[must_use]
    pub fn estimate(&self, q: &[f64]) -> Estimate {
        let len = self.len();
        let velocities = self.velocities(q);
        let configurations: Vec<Vec<f64>> =
            (0..len).map(|t| self.configuration(q, t).to_vec()).collect();
        let sensor_predictions = (0..len)
            .map(|t| {
                self.physics
                    .sensors(&self.model, &configurations[t], &velocities[t])
            })
            .collect();
        let forces = (0..len)
            .map(|t| {
                if t >= 1 && t + 1 < len {
                    self.force(q, &velocities, t)
                } else {
                    vec![0.0; self.model.nv()]
                }
            })
            .collect();
        Estimate {
            configurations,
            velocities,
            sensor_predictions,
            forces,
        }
    }
}

/// Result of one smoother run.
#[derive(Debug, Clone, PartialEq)]
pub struct SmootherOutcome {
    /// Flattened optimized configurations.
    pub configurations: Vec<f64>,
    /// Convergence report; `optimizations` is left for the caller to set.
    pub status: EstimatorStatus,
    /// Cost breakdown at the optimized configurations.
    pub costs: EstimatorCosts,
}

/// Damped Gauss-Newton solver for [`Problem`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSmoother;

impl BatchSmoother {
    /// Minimize the problem's cost for at most `iterations` iterations.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NumericalFailure` if the residual is not
    /// finite or the damped normal equations cannot be factorized, and
    /// `ServiceError::Internal` if a Jacobian unit fails on the pool.
    pub fn optimize(
        problem: &Arc<Problem>,
        settings: &EstimatorSettings,
        iterations: usize,
        pool: &WorkerPool,
    ) -> Result<SmootherOutcome> {
        let n = problem.num_variables();
        let mut q = DVector::from_vec(problem.initial_guess());
        let mut residual = DVector::from_vec(problem.residual(q.as_slice()));
        let mut cost = 0.5 * residual.norm_squared();
        if !cost.is_finite() {
            return Err(ServiceError::NumericalFailure(
                "estimator residual is not finite".to_string(),
            ));
        }

        let mut status = EstimatorStatus {
            initial_cost: cost,
            regularization: settings.regularization,
            ..EstimatorStatus::default()
        };
        let mut damping = settings.regularization;

        for iteration in 0..iterations {
            let jacobian = Self::jacobian(problem, q.as_slice(), residual.as_slice(), pool)?;
            let gradient = jacobian.tr_mul(&residual);
            status.gradient_norm = gradient.norm();
            if status.gradient_norm <= settings.tolerance {
                status.converged = true;
                break;
            }

            let hessian = jacobian.tr_mul(&jacobian);
            let mut accepted = None;
            let mut factorized = false;
            for _ in 0..MAX_DAMPING_TRIES {
                let mut damped = hessian.clone();
                for i in 0..n {
                    damped[(i, i)] += damping;
                }
                if let Some(cholesky) = damped.cholesky() {
                    factorized = true;
                    let step = -cholesky.solve(&gradient);
                    let candidate = &q + &step;
                    let candidate_residual =
                        DVector::from_vec(problem.residual(candidate.as_slice()));
                    let candidate_cost = 0.5 * candidate_residual.norm_squared();
                    if candidate_cost.is_finite() && candidate_cost <= cost {
                        accepted = Some((step, candidate, candidate_residual, candidate_cost));
                        damping *= 0.1;
                        break;
                    }
                }
                damping = (damping * 10.0).max(MIN_DAMPING);
            }

            status.iterations = iteration + 1;
            status.regularization = damping;
            if !factorized {
                return Err(ServiceError::NumericalFailure(
                    "estimator normal equations are singular".to_string(),
                ));
            }
            let Some((step, candidate, candidate_residual, candidate_cost)) = accepted else {
                // No damping level reduces the cost: the iterate is a
                // numerical minimum.
                break;
            };

            status.step_norm = step.norm();
            q = candidate;
            residual = candidate_residual;
            cost = candidate_cost;
            if status.step_norm <= settings.tolerance * (1.0 + q.norm()) {
                status.converged = true;
                break;
            }
        }

        status.final_cost = cost;
        let configurations: Vec<f64> = q.iter().copied().collect();
        let costs = problem.costs(&configurations);
        Ok(SmootherOutcome {
            configurations,
            status,
            costs,
        })
    }

    fn jacobian(
        problem: &Arc<Problem>,
        q: &[f64],
        residual: &[f64],
        pool: &WorkerPool,
    ) -> Result<DMatrix<f64>> {
        let rows = residual.len();
        let cols = problem.num_variables();
        let columns = {
            let problem = Arc::clone(problem);
            let q = Arc::new(q.to_vec());
            let base = Arc::new(residual.to_vec());
            pool.map(cols, move |j| problem.jacobian_column(&q, &base, j))?
        };

        let mut data = Vec::with_capacity(rows * cols);
        for column in columns {
            data.extend(column?);
        }
        Ok(DMatrix::from_vec(rows, cols, data))
    }
}
