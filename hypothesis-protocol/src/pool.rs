//! Bounded worker pool for CPU-heavy analyses.
//!
//! Jobs run on tokio's blocking threads, at most `workers` at a time, each
//! under a timeout that covers both waiting for a slot and running. A
//! timed-out job keeps running to completion on its thread and keeps its
//! slot until then; the caller just stops waiting for it. After
//! `max_consecutive_failures` timeouts or panics in a row the pool closes
//! its permit set and starts over with a fresh one sized for the jobs still
//! in flight.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PoolConfig;

/// Errors returned by [`WorkerPool::run`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The job did not finish within the per-call timeout.
    #[error("{label} timed out after {timeout_ms} ms")]
    Timeout { label: String, timeout_ms: u64 },

    /// The job panicked or was cancelled.
    #[error("{label} failed on worker: {message}")]
    WorkerFailed { label: String, message: String },

    /// No worker slot could be acquired.
    #[error("Worker pool unavailable")]
    Unavailable,
}

#[derive(Debug)]
struct PoolState {
    permits: Arc<Semaphore>,
    /// Jobs holding a slot, across generations.
    in_flight: usize,
    consecutive_failures: u32,
    generation: u64,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A held worker slot. Dropping it hands the slot back to whichever permit
/// set is current, so `available + in_flight == workers` survives rebuilds.
struct Slot {
    state: Arc<Mutex<PoolState>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
        state.permits.add_permits(1);
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: usize,
    timeout: Duration,
    max_consecutive_failures: u32,
    state: Arc<Mutex<PoolState>>,
}

impl WorkerPool {
    pub fn new(workers: usize, timeout: Duration, max_consecutive_failures: u32) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            timeout,
            max_consecutive_failures: max_consecutive_failures.max(1),
            state: Arc::new(Mutex::new(PoolState {
                permits: Arc::new(Semaphore::new(workers)),
                in_flight: 0,
                consecutive_failures: 0,
                generation: 0,
            })),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.workers,
            config.timeout(),
            config.max_consecutive_failures,
        )
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How many times the pool has been rebuilt.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Jobs currently holding a worker slot, including timed-out ones.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    fn timeout_error(&self, label: &str) -> PoolError {
        PoolError::Timeout {
            label: label.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Wait for a slot on the current permit set. A set closed by a rebuild
    /// sends waiters on to its replacement.
    async fn acquire(&self) -> Result<Slot, PoolError> {
        loop {
            let permits = Arc::clone(&self.lock().permits);
            let acquired = Arc::clone(&permits).acquire_owned().await;
            let mut state = self.lock();
            let current = Arc::ptr_eq(&permits, &state.permits);
            match acquired {
                Ok(permit) if current => {
                    permit.forget();
                    state.in_flight += 1;
                    return Ok(Slot {
                        state: Arc::clone(&self.state),
                    });
                }
                Err(_) if current => return Err(PoolError::Unavailable),
                _ => continue,
            }
        }
    }

    /// Run `job` on a worker. Waiting for a slot and running share one
    /// deadline of the pool timeout.
    pub async fn run<F, T>(&self, label: &str, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let slot = match tokio::time::timeout_at(deadline, self.acquire()).await {
            Ok(slot) => slot?,
            Err(_) => {
                debug!(label, "no worker slot before the deadline");
                return Err(self.timeout_error(label));
            }
        };

        debug!(label, "dispatching job to worker pool");
        let handle = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            job()
        });

        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(value)) => {
                self.lock().consecutive_failures = 0;
                Ok(value)
            }
            Ok(Err(join_error)) => {
                self.record_failure();
                let message = if join_error.is_panic() {
                    "worker panicked".to_string()
                } else {
                    join_error.to_string()
                };
                Err(PoolError::WorkerFailed {
                    label: label.to_string(),
                    message,
                })
            }
            Err(_) => {
                self.record_failure();
                Err(self.timeout_error(label))
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.max_consecutive_failures {
            state.permits.close();
            let available = self.workers.saturating_sub(state.in_flight);
            state.permits = Arc::new(Semaphore::new(available));
            state.consecutive_failures = 0;
            state.generation += 1;
            warn!(
                generation = state.generation,
                in_flight = state.in_flight,
                "worker pool recreated after repeated failures"
            );
        }
    }
}
