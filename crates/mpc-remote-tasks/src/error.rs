//! Error types for task schemas and settings.

use thiserror::Error;

/// A result type using `TaskError`.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors raised while validating schemas or applying settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// No parameter with this name is declared by the active task.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// No cost term with this name is declared by the active task.
    #[error("unknown cost term: {0}")]
    UnknownCostTerm(String),

    /// No mode with this name is registered for the active task.
    #[error("unknown mode: {0}")]
    UnknownMode(String),

    /// A parameter value lies outside its declared bounds.
    #[error("parameter {name} = {value} is outside [{min}, {max}]")]
    ParameterOutOfBounds {
        /// Parameter name.
        name: String,
        /// Rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// A cost weight is negative or not finite.
    #[error("weight {name} = {value} must be finite and non-negative")]
    InvalidWeight {
        /// Cost term name.
        name: String,
        /// Rejected value.
        value: f64,
    },

    /// The task returned a different number of residuals than it declares.
    #[error("task {task} produced {got} residuals for {expected} cost terms")]
    ResidualMismatch {
        /// Task id.
        task: String,
        /// Number of declared cost terms.
        expected: usize,
        /// Number of residual vectors returned.
        got: usize,
    },

    /// A task schema is inconsistent.
    #[error("invalid schema for task {task}: {reason}")]
    InvalidSchema {
        /// Task id.
        task: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No task is registered at this index.
    #[error("task index {index} out of range: {len} tasks registered")]
    TaskIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of registered tasks.
        len: usize,
    },
}
