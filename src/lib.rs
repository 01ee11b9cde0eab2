//! # blobvfs
//!
//! Blocking, POSIX-shaped file operations over a callback-driven blob
//! storage engine:
//! - `open` creates a fresh blob, resizes it and syncs its metadata
//! - `write` / `read` move one I/O unit through aligned staging buffers
//! - `close` deletes the blob and stops the engine after the last file
//! - Every engine call is driven to completion by polling a single worker
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            posix::open / read / write / close               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Vfs (facade)                            │
//! │        one lock · lazy engine bring-up · teardown           │
//! └───────┬─────────────────────┬───────────────────────┬───────┘
//!         │                     │                       │
//!         ▼                     ▼                       ▼
//!  ┌─────────────┐      ┌──────────────┐        ┌──────────────┐
//!  │ Descriptor  │      │ Blob objects │        │   Engine     │
//!  │   table     │      │  lifecycle + │        │  instance    │
//!  │  (bitmap)   │      │  staging     │        │ (worker, ch) │
//!  └─────────────┘      └──────┬───────┘        └──────┬───────┘
//!                              │   bridge: drive()     │
//!                              └──────────┬────────────┘
//!                                         ▼
//!                              ┌──────────────────────┐
//!                              │  BlobBackend         │
//!                              │  (MemoryBackend)     │
//!                              └──────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod topology;

pub mod bridge;
pub mod backend;
pub mod blob;
pub mod fd;
pub mod engine;
pub mod vfs;
pub mod posix;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, VfsError};
pub use config::Config;
pub use topology::Topology;
pub use backend::{BlobBackend, MemoryBackend};
pub use blob::BlobState;
pub use fd::Fd;
pub use vfs::{FileInfo, Vfs};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of blobvfs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
