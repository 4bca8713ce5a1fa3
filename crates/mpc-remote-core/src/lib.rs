//! Core types for mpc-remote.
//!
//! This crate provides the foundational types shared by every other crate in
//! the workspace:
//!
//! - **Identifiers**: [`PolicyVersion`] tags for committed control policies
//! - **Model**: the physical parameters of a simulated system ([`Model`])
//! - **State**: the mutable simulation state ([`SimulationState`]) and partial
//!   updates to it ([`StateUpdate`])
//! - **Physics**: the [`Physics`] stepping interface and the reference
//!   [`SemiImplicitEuler`] integrator
//!
//! # Example
//!
//! ```
//! use mpc_remote_core::{Model, Physics, SemiImplicitEuler, SimulationState};
//!
//! let model = Model::new("particle", 2, 0.01);
//! let state = SimulationState::zeros(&model);
//!
//! let next = SemiImplicitEuler.step(&model, &state).unwrap();
//! assert!((next.time - 0.01).abs() < 1e-12);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod model;
pub mod physics;
pub mod state;

pub use error::{CoreError, Result};
pub use ids::{PolicyVersion, VersionCounter};
pub use model::{Model, ModelOverrides};
pub use physics::{Physics, SemiImplicitEuler, DIVERGENCE_LIMIT};
pub use state::{SimulationState, StateUpdate};
