//! Error types for the worker pool.

use thiserror::Error;

/// A result type using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;

/// The outcome of a single unit in a batch.
pub type UnitResult<T> = std::result::Result<T, PoolError>;

/// Errors that can occur while running work on the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A unit panicked; the other units of the batch are unaffected.
    #[error("unit {index} panicked: {message}")]
    UnitPanicked {
        /// Position of the unit within its batch.
        index: usize,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// The pool no longer accepts work.
    #[error("worker pool is shut down")]
    ShutDown,

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
