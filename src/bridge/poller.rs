//! Bounded drive loop
//!
//! The only place a caller's thread waits on the worker.

use crate::error::{Result, VfsError};

use super::{Completion, Worker};

/// Default number of poll attempts before giving up on an operation
pub const DEFAULT_POLL_BUDGET: u32 = 100_000;

/// Drives the worker until an operation completes or the budget runs out
#[derive(Debug, Clone, Copy)]
pub struct Bridge {
    budget: u32,
}

impl Bridge {
    /// Create a bridge with the given attempt budget (at least one attempt)
    pub fn new(budget: u32) -> Self {
        Self {
            budget: budget.max(1),
        }
    }

    /// Attempt ceiling per drive
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Schedule `start` on the worker and spin until `completion` is set.
    ///
    /// Each attempt is one non-blocking [`Worker::poll`]. When the budget is
    /// exhausted the operation is abandoned where it stands (nothing already
    /// issued is rolled back) and [`VfsError::Timeout`] is returned. A result
    /// carried by the completion is returned as-is, error or not.
    pub fn drive<T, F>(
        &self,
        worker: &Worker,
        operation: &'static str,
        start: F,
        completion: &Completion<Result<T>>,
    ) -> Result<T>
    where
        F: FnOnce() + Send + 'static,
    {
        worker
            .send_msg(Box::new(start))
            .map_err(|_| VfsError::WorkerStopped { operation })?;

        let mut attempts: u32 = 0;
        loop {
            worker.poll();
            attempts += 1;

            if completion.is_done() {
                break;
            }
            if worker.is_stopped() {
                tracing::warn!(operation, attempts, "Worker stopped mid-operation");
                return Err(VfsError::WorkerStopped { operation });
            }
            if attempts >= self.budget {
                tracing::warn!(operation, attempts, "Operation did not complete in budget");
                return Err(VfsError::Timeout {
                    operation,
                    attempts,
                });
            }
        }

        tracing::trace!(operation, attempts, "Operation completed");
        completion.take().unwrap_or(Err(VfsError::WorkerStopped { operation }))
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_BUDGET)
    }
}
