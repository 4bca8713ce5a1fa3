//! Fixed-size worker pool for mpc-remote.
//!
//! The planner and the estimator fan independent units of work (rollouts,
//! Jacobian columns) out onto a shared [`WorkerPool`] and block until the
//! whole batch has reported back.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │              Caller (planner / estimator)                 │
//! └───────────────────────────────────────────────────────────┘
//!                 │ run_batch(units)          ▲ Vec<UnitResult>
//!                 ▼                           │
//! ┌───────────────────────────────────────────────────────────┐
//! │                      job queue                            │
//! └───────────────────────────────────────────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//!   ┌─────────┐    ┌─────────┐    ┌─────────┐
//!   │worker 0 │    │worker 1 │    │worker N │   (catch_unwind per unit)
//!   └─────────┘    └─────────┘    └─────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use mpc_remote_pool::WorkerPool;
//!
//! let pool = WorkerPool::new(2).unwrap();
//! let results = pool.map(4, |i| i * i).unwrap();
//! let squares: Vec<usize> = results.into_iter().map(Result::unwrap).collect();
//! assert_eq!(squares, vec![0, 1, 4, 9]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod pool;

pub use error::{PoolError, Result, UnitResult};
pub use pool::WorkerPool;
