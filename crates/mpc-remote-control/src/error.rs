//! Error types for the agent service.
//!
//! Every operation reports failures through [`ServiceError`]. Lower-level
//! errors from the core, task and pool crates are mapped into it by the
//! `From` impls below.

use mpc_remote_core::CoreError;
use mpc_remote_pool::PoolError;
use mpc_remote_tasks::TaskError;
use thiserror::Error;

/// A result type using `ServiceError`.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur in agent service operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    /// The operation requires a prior `Init` or `InitEstimator`.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    /// The request violates a precondition or schema.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An index lies outside an allocated buffer.
    #[error("index {index} is out of range for length {len}")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Buffer length.
        len: usize,
    },

    /// The simulation or an optimization diverged.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// The worker pool or the blocking runtime could not take the work.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected invariant violation or malformed task definition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "not_initialized",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::OutOfRange { .. } => "out_of_range",
            Self::NumericalFailure(_) => "numerical_failure",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<CoreError> for ServiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Divergence { .. } => Self::NumericalFailure(err.to_string()),
            CoreError::DimensionMismatch { .. }
            | CoreError::NonFinite { .. }
            | CoreError::InvalidModel(_) => Self::InvalidArgument(err.to_string()),
        }
    }
}

impl From<TaskError> for ServiceError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::ResidualMismatch { .. } | TaskError::InvalidSchema { .. } => {
                tracing::error!(error = %err, "Task definition is inconsistent");
                Self::Internal(err.to_string())
            }
            _ => Self::InvalidArgument(err.to_string()),
        }
    }
}

impl From<PoolError> for ServiceError {
    fn from(err: PoolError) -> Self {
        tracing::error!(error = %err, "Worker pool failure");
        match err {
            PoolError::UnitPanicked { .. } => Self::Internal(err.to_string()),
            PoolError::ShutDown | PoolError::Spawn(_) => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!(error = %err, "Blocking task failed");
        if err.is_cancelled() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}
