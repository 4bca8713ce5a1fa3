//! Policies and the sampling planner.
//!
//! A [`Policy`] is a piecewise-constant control spline tagged with the
//! [`PolicyVersion`] it was committed under. The [`SamplingPlanner`] improves
//! a nominal spline by perturbing its knots, rolling every candidate out on
//! the worker pool, and keeping the cheapest one.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use mpc_remote_core::{Model, Physics, PolicyVersion, SimulationState};
use mpc_remote_pool::WorkerPool;
use mpc_remote_tasks::{total_cost, Task, TaskSettings};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// A committed, immutable control policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    version: PolicyVersion,
    nu: usize,
    knot_times: Vec<f64>,
    knots: Vec<Vec<f64>>,
}

impl Policy {
    /// A policy that outputs zero control at all times.
    #[must_use]
    pub const fn zero(version: PolicyVersion, nu: usize) -> Self {
        Self {
            version,
            nu,
            knot_times: Vec::new(),
            knots: Vec::new(),
        }
    }

    /// A policy holding `knots[i]` from `knot_times[i]` until the next knot.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Internal` if the knot arrays disagree in
    /// length or a knot has the wrong dimension.
    pub fn new(
        version: PolicyVersion,
        nu: usize,
        knot_times: Vec<f64>,
        knots: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if knot_times.len() != knots.len() || knots.iter().any(|k| k.len() != nu) {
            return Err(ServiceError::Internal(format!(
                "malformed spline: {} times, {} knots",
                knot_times.len(),
                knots.len()
            )));
        }
        Ok(Self {
            version,
            nu,
            knot_times,
            knots,
        })
    }

    /// Version this policy was committed under.
    #[must_use]
    pub const fn version(&self) -> PolicyVersion {
        self.version
    }

    /// Knot times of the spline.
    #[must_use]
    pub fn knot_times(&self) -> &[f64] {
        &self.knot_times
    }

    /// Control at `time`.
    ///
    /// Before the first knot the first knot is held; after the last knot
    /// the last one is.
    #[must_use]
    pub fn action(&self, time: f64) -> Vec<f64> {
        spline_value(&self.knot_times, &self.knots, time)
            .map_or_else(|| vec![0.0; self.nu], <[f64]>::to_vec)
    }
}

fn spline_value<'a>(knot_times: &[f64], knots: &'a [Vec<f64>], time: f64) -> Option<&'a [f64]> {
    if knots.is_empty() {
        return None;
    }
    let index = knot_times
        .partition_point(|t| *t <= time)
        .saturating_sub(1)
        .min(knots.len() - 1);
    Some(&knots[index])
}

/// Tuning of the sampling planner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerSettings {
    /// Candidates per iteration, including the unperturbed nominal.
    pub samples: usize,
    /// Horizon in seconds.
    pub horizon: f64,
    /// Number of spline knots across the horizon.
    pub knots: usize,
    /// Perturbation standard deviation as a fraction of the control range.
    pub noise: f64,
    /// RNG seed.
    pub seed: u64,
}

/// Limits on one planner call.
#[derive(Debug, Clone, Copy)]
pub struct PlannerBudget {
    /// Iterations to run.
    pub iterations: usize,
    /// No iteration starts after this instant; the first always runs.
    pub deadline: Option<Instant>,
}

/// Read-only inputs of a planner call.
#[derive(Debug, Clone)]
pub struct PlanningContext {
    /// Active task.
    pub task: Arc<dyn Task>,
    /// Session model.
    pub model: Arc<Model>,
    /// Physics used for rollouts.
    pub physics: Arc<dyn Physics>,
    /// Snapshot of the task settings.
    pub settings: TaskSettings,
    /// Snapshot of the simulation state.
    pub state: SimulationState,
}

/// The best candidate found by a planner call.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerOutcome {
    /// Iterations run.
    pub iterations: usize,
    /// Rollout cost of the best candidate.
    pub best_cost: f64,
    /// Rollouts that diverged or panicked, over all iterations.
    pub failed_rollouts: usize,
    /// Knot times of the best candidate.
    pub knot_times: Vec<f64>,
    /// Knots of the best candidate.
    pub knots: Vec<Vec<f64>>,
}

/// An iterative policy optimizer.
pub trait Planner: Debug + Send {
    /// Improve the policy from the context's state within `budget`.
    ///
    /// The planner may keep internal warm-start data, but nothing it
    /// produces is visible until the caller commits the outcome.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NumericalFailure` if no candidate could be
    /// evaluated.
    fn optimize(
        &mut self,
        ctx: &PlanningContext,
        budget: &PlannerBudget,
        pool: &WorkerPool,
    ) -> Result<PlannerOutcome>;

    /// Discard all warm-start data.
    fn reset(&mut self);
}

/// Builds the planner owned by each new agent session.
pub trait PlannerFactory: Debug + Send + Sync {
    /// A fresh planner sized to `model`.
    fn build(&self, model: &Model) -> Box<dyn Planner>;
}

impl PlannerFactory for PlannerSettings {
    fn build(&self, model: &Model) -> Box<dyn Planner> {
        Box::new(SamplingPlanner::new(*self, model))
    }
}

/// Random-shooting planner over a piecewise-constant spline.
#[derive(Debug)]
pub struct SamplingPlanner {
    settings: PlannerSettings,
    nu: usize,
    nominal: Vec<Vec<f64>>,
    rng: ChaCha8Rng,
}

impl SamplingPlanner {
    /// Create a planner sized to `model`.
    #[must_use]
    pub fn new(settings: PlannerSettings, model: &Model) -> Self {
        let knots = settings.knots.max(1);
        Self {
            settings,
            nu: model.nu(),
            nominal: vec![vec![0.0; model.nu()]; knots],
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
        }
    }

    /// The current nominal knots.
    #[must_use]
    pub fn nominal(&self) -> &[Vec<f64>] {
        &self.nominal
    }

    #[allow(clippy::cast_precision_loss)]
    fn knot_times(&self, start: f64) -> Vec<f64> {
        let segment = self.settings.horizon / self.nominal.len() as f64;
        (0..self.nominal.len())
            .map(|i| start + segment * i as f64)
            .collect()
    }

    fn perturb(&mut self, model: &Model, noise: &Normal<f64>) -> Vec<Vec<f64>> {
        let rng = &mut self.rng;
        self.nominal
            .iter()
            .map(|knot| {
                knot.iter()
                    .map(|u| model.clamp_ctrl(u + noise.sample(rng)))
                    .collect()
            })
            .collect()
    }
}

impl Planner for SamplingPlanner {
    fn optimize(
        &mut self,
        ctx: &PlanningContext,
        budget: &PlannerBudget,
        pool: &WorkerPool,
    ) -> Result<PlannerOutcome> {
        let model = &ctx.model;
        if self.nominal.iter().any(|k| k.len() != model.nu()) {
            return Err(ServiceError::Internal(format!(
                "planner sized for nu={} used with nu={}",
                self.nu,
                model.nu()
            )));
        }

        let noise = Normal::new(0.0, self.settings.noise * model.ctrl_span())
            .map_err(|err| ServiceError::Internal(format!("planner noise: {err}")))?;
        let knot_times = Arc::new(self.knot_times(ctx.state.time));
        let rollout = Arc::new(Rollout::new(ctx, self.settings.horizon));

        let mut best_cost = f64::INFINITY;
        let mut failed_rollouts = 0;
        let mut iterations = 0;

        while iterations < budget.iterations {
            if iterations > 0 && budget.deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            let mut candidates = Vec::with_capacity(self.settings.samples);
            candidates.push(self.nominal.clone());
            for _ in 1..self.settings.samples {
                candidates.push(self.perturb(model, &noise));
            }
            let candidates = Arc::new(candidates);

            let results = {
                let candidates = Arc::clone(&candidates);
                let knot_times = Arc::clone(&knot_times);
                let rollout = Arc::clone(&rollout);
                pool.map(candidates.len(), move |i| {
                    rollout.evaluate(&knot_times, &candidates[i])
                })?
            };

            // The nominal is re-evaluated every iteration, so a candidate
            // only replaces it when strictly cheaper.
            let mut iteration_best: Option<(usize, f64)> = None;
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(Ok(cost)) if cost.is_finite() => {
                        if iteration_best.map_or(true, |(_, best)| cost < best) {
                            iteration_best = Some((index, cost));
                        }
                    }
                    Ok(Ok(_) | Err(_)) | Err(_) => failed_rollouts += 1,
                }
            }

            iterations += 1;
            if let Some((index, cost)) = iteration_best {
                self.nominal.clone_from(&candidates[index]);
                best_cost = cost;
            }
        }

        if !best_cost.is_finite() {
            return Err(ServiceError::NumericalFailure(format!(
                "all {failed_rollouts} rollouts failed"
            )));
        }

        Ok(PlannerOutcome {
            iterations,
            best_cost,
            failed_rollouts,
            knot_times: knot_times.to_vec(),
            knots: self.nominal.clone(),
        })
    }

    fn reset(&mut self) {
        for knot in &mut self.nominal {
            knot.fill(0.0);
        }
        self.rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
    }
}

/// Everything a worker needs to roll one candidate out.
#[derive(Debug)]
struct Rollout {
    task: Arc<dyn Task>,
    model: Arc<Model>,
    physics: Arc<dyn Physics>,
    settings: TaskSettings,
    start: SimulationState,
    steps: usize,
}

impl Rollout {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn new(ctx: &PlanningContext, horizon: f64) -> Self {
        let steps = (horizon / ctx.model.timestep).ceil().max(1.0) as usize;
        Self {
            task: Arc::clone(&ctx.task),
            model: Arc::clone(&ctx.model),
            physics: Arc::clone(&ctx.physics),
            settings: ctx.settings.clone(),
            start: ctx.state.clone(),
            steps,
        }
    }

    /// Integrated running cost plus terminal cost of one candidate.
    fn evaluate(&self, knot_times: &[f64], knots: &[Vec<f64>]) -> Result<f64> {
        let dt = self.model.timestep;
        let mut state = self.start.clone();
        let mut cost = 0.0;
        for _ in 0..self.steps {
            if let Some(action) = spline_value(knot_times, knots, state.time) {
                state.ctrl.copy_from_slice(action);
            }
            cost += dt * total_cost(self.task.as_ref(), &self.model, &state, &self.settings)?;
            state = self.physics.step(&self.model, &state)?;
        }
        cost += dt * total_cost(self.task.as_ref(), &self.model, &state, &self.settings)?;
        Ok(cost)
    }
}
