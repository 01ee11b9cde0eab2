//! Worker
//!
//! A single cooperative execution context. Messages are queued from anywhere
//! and only run when someone polls the worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{Result, VfsError};

/// A unit of work scheduled onto the worker
pub type Message = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded message loop driven by explicit polling
///
/// Nothing runs in the background: a message sent with [`Worker::send_msg`]
/// executes during a later call to [`Worker::poll`], on the polling thread.
pub struct Worker {
    /// Name used in log output
    name: String,

    /// Queue ends (unbounded, the worker never blocks a sender)
    sender: Sender<Message>,
    receiver: Receiver<Message>,

    /// Set once the engine asks the worker to stop
    stopped: AtomicBool,

    /// Messages executed so far
    executed: AtomicU64,
}

impl Worker {
    /// Create a new idle worker
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (sender, receiver) = channel::unbounded();
        Arc::new(Self {
            name: name.into(),
            sender,
            receiver,
            stopped: AtomicBool::new(false),
            executed: AtomicU64::new(0),
        })
    }

    /// Queue a message for the next poll
    pub fn send_msg(&self, msg: Message) -> Result<()> {
        if self.is_stopped() {
            return Err(VfsError::WorkerStopped {
                operation: "send_msg",
            });
        }

        self.sender.send(msg).map_err(|_| VfsError::WorkerStopped {
            operation: "send_msg",
        })
    }

    /// Advance the loop by one increment without blocking.
    ///
    /// Runs the messages that were queued when the call started; anything
    /// those messages enqueue waits for the next poll. Returns how many ran.
    pub fn poll(&self) -> usize {
        let pending = self.receiver.len();
        let mut ran = 0;

        for _ in 0..pending {
            if self.is_stopped() {
                break;
            }
            match self.receiver.try_recv() {
                Ok(msg) => {
                    msg();
                    ran += 1;
                }
                Err(_) => break,
            }
        }

        self.executed.fetch_add(ran as u64, Ordering::Relaxed);
        ran
    }

    /// Stop the worker and drop every queued message
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let dropped = self.receiver.try_iter().count();
        tracing::debug!(worker = %self.name, dropped, "Worker stopped");
    }

    /// Whether [`Worker::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Messages waiting for a poll
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Messages executed over the worker's lifetime
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Name used in log output
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
