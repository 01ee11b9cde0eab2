//! Completion flag
//!
//! Set-once slot shared between a caller and the callback that finishes its
//! operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct Inner<T> {
    done: AtomicBool,
    value: Mutex<Option<T>>,
}

/// Completion flag carrying the operation's result
///
/// Clones share the same slot: the caller keeps one, the callback chain moves
/// another onto the worker.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Completion<T> {
    /// Create an unset flag
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                done: AtomicBool::new(false),
                value: Mutex::new(None),
            }),
        }
    }

    /// Set the flag with the operation's result.
    ///
    /// Only the first call has any effect; returns whether this call set it.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.inner.value.lock();
        if self.inner.done.load(Ordering::Acquire) {
            tracing::warn!("Completion signalled twice, dropping second result");
            return false;
        }

        *slot = Some(value);
        self.inner.done.store(true, Ordering::Release);
        true
    }

    /// Whether the callback has fired
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Take the result out (the flag stays set)
    pub fn take(&self) -> Option<T> {
        self.inner.value.lock().take()
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
