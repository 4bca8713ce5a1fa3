//! Common error types for mpc-remote.
//!
//! This module provides the errors raised by the model, state and physics
//! layers. Higher-level crates wrap these into their own taxonomies.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while building models or stepping physics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// The simulation produced non-finite or unbounded values.
    #[error("simulation diverged at t={time}: {detail}")]
    Divergence {
        /// Simulation time of the last good state.
        time: f64,
        /// Which quantity diverged.
        detail: String,
    },

    /// A vector did not have the length the model requires.
    #[error("dimension mismatch for {field}: expected {expected}, got {got}")]
    DimensionMismatch {
        /// The field being validated.
        field: &'static str,
        /// Length required by the model.
        expected: usize,
        /// Length that was supplied.
        got: usize,
    },

    /// A supplied value was NaN or infinite.
    #[error("{field} must be finite, got {value}")]
    NonFinite {
        /// The field being validated.
        field: &'static str,
        /// The first offending value.
        value: f64,
    },

    /// Model parameters are not usable.
    #[error("invalid model: {0}")]
    InvalidModel(String),
}

impl CoreError {
    /// Returns true if this error was caused by numerical divergence.
    #[must_use]
    pub const fn is_divergence(&self) -> bool {
        matches!(self, Self::Divergence { .. })
    }
}
