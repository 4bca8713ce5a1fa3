//! The worker pool implementation.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::error::{PoolError, Result, UnitResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of long-lived worker threads fed from one job queue.
///
/// Units submitted through [`WorkerPool::run_batch`] must be independent.
/// Units must not call back into the pool: a unit that waits on another batch
/// can starve the workers it is waiting for.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start a pool with `size` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if a worker thread cannot be created.
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("mpc-worker-{index}"))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }

        tracing::debug!(workers = size, "Started worker pool");

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Start a pool sized to the host's available hardware parallelism.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if a worker thread cannot be created.
    pub fn with_available_parallelism() -> Result<Self> {
        Self::new(Self::num_cpus())
    }

    /// Number of logical CPUs, falling back to 4 when unknown.
    #[must_use]
    pub fn num_cpus() -> usize {
        thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run every unit on the pool and wait until all of them have finished.
    ///
    /// Results come back in submission order. A panicking unit yields
    /// `PoolError::UnitPanicked` in its own slot and does not disturb the
    /// rest of the batch or the worker that ran it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutDown` if the pool stopped accepting work
    /// before the batch could be queued.
    pub fn run_batch<T, F>(&self, units: Vec<F>) -> Result<Vec<UnitResult<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolError::ShutDown)?;
        let count = units.len();
        let (result_tx, result_rx) = crossbeam_channel::bounded(count);

        for (index, unit) in units.into_iter().enumerate() {
            let result_tx = result_tx.clone();
            let job: Job = Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(unit))
                    .map_err(|payload| panic_message(payload.as_ref()));
                // The receiver only disappears if the caller stopped waiting.
                let _ = result_tx.send((index, outcome));
            });
            sender.send(job).map_err(|_| PoolError::ShutDown)?;
        }
        drop(result_tx);

        let mut slots: Vec<Option<UnitResult<T>>> = (0..count).map(|_| None).collect();
        for _ in 0..count {
            let Ok((index, outcome)) = result_rx.recv() else {
                break;
            };
            slots[index] = Some(outcome.map_err(|message| {
                tracing::warn!(unit = index, message = %message, "Worker unit panicked");
                PoolError::UnitPanicked { index, message }
            }));
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(PoolError::ShutDown)))
            .collect())
    }

    /// Run `f(0), f(1), ..., f(count - 1)` on the pool.
    ///
    /// # Errors
    ///
    /// See [`WorkerPool::run_batch`].
    pub fn map<T, F>(&self, count: usize, f: F) -> Result<Vec<UnitResult<T>>>
    where
        T: Send + 'static,
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let units: Vec<_> = (0..count)
            .map(|index| {
                let f = Arc::clone(&f);
                move || f(index)
            })
            .collect();
        self.run_batch(units)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("running", &self.sender.is_some())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue ends every worker loop once it drains.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Worker thread terminated abnormally");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

fn worker_loop(receiver: &Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        job();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
