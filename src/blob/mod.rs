//! Blob Module
//!
//! The backing storage object of a file: its lifecycle and its staging buffers.
//!
//! ## State Machine
//! ```text
//! Uncreated ─▶ Creating ─▶ Opening ─▶ Resizing ─▶ SyncingMetadata ─▶ Ready
//!                 │           │           │              │             │
//!                 └───────────┴─────┬─────┴──────────────┘             ▼
//!                                   ▼                              Unloading
//!                                Failed ◀──────────────────────────────┤
//!                                                                      ▼
//!                                                                  Unloaded
//! ```
//!
//! Every arrow is one engine completion. The chain from `Uncreated` to
//! `Ready` is started by a single bridge drive.

pub(crate) mod lifecycle;
pub(crate) mod staging;

use std::fmt;

use crate::backend::BlobHandle;
use crate::error::{Result, VfsError};

pub use staging::StagingBuffers;

/// Lifecycle state of a backing blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Uncreated,
    Creating,
    Opening,
    Resizing,
    SyncingMetadata,
    Ready,
    Unloading,
    Unloaded,
    /// Terminal; the blob is unusable
    Failed,
}

impl BlobState {
    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, BlobState::Unloaded | BlobState::Failed)
    }
}

impl fmt::Display for BlobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlobState::Uncreated => "uncreated",
            BlobState::Creating => "creating",
            BlobState::Opening => "opening",
            BlobState::Resizing => "resizing",
            BlobState::SyncingMetadata => "syncing-metadata",
            BlobState::Ready => "ready",
            BlobState::Unloading => "unloading",
            BlobState::Unloaded => "unloaded",
            BlobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A file's backing blob together with its staging buffers
#[derive(Debug)]
pub struct BlobObject {
    state: BlobState,
    handle: Option<BlobHandle>,
    buffers: Option<StagingBuffers>,
}

impl BlobObject {
    pub(crate) fn ready(handle: BlobHandle, buffers: StagingBuffers) -> Self {
        Self {
            state: BlobState::Ready,
            handle: Some(handle),
            buffers: Some(buffers),
        }
    }

    pub fn state(&self) -> BlobState {
        self.state
    }

    pub fn handle(&self) -> Option<BlobHandle> {
        self.handle
    }

    /// Whether both staging buffers are held
    pub fn has_buffers(&self) -> bool {
        self.buffers.as_ref().is_some_and(StagingBuffers::is_complete)
    }

    /// Handle of a `Ready` blob; anything else is a precondition violation
    pub(crate) fn ready_handle(&self) -> Result<BlobHandle> {
        match (self.state, self.handle) {
            (BlobState::Ready, Some(handle)) => Ok(handle),
            (state, _) => Err(VfsError::NotReady(state)),
        }
    }

    pub(crate) fn buffers_mut(&mut self) -> Result<&mut StagingBuffers> {
        let state = self.state;
        self.buffers.as_mut().ok_or(VfsError::NotReady(state))
    }

    /// Enter `Failed` and release the staging buffers
    pub(crate) fn fail(&mut self) {
        tracing::debug!(from = %self.state, "Blob failed");
        self.state = BlobState::Failed;
        self.buffers = None;
    }
}
