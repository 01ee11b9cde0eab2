//! Error types for blobvfs
//!
//! Provides a unified error type for all facade, bridge and engine operations.

use thiserror::Error;

use crate::backend::Errno;
use crate::blob::BlobState;

/// Result type alias using VfsError
pub type Result<T> = std::result::Result<T, VfsError>;

/// Unified error type for blobvfs operations
#[derive(Debug, Error)]
pub enum VfsError {
    // -------------------------------------------------------------------------
    // Descriptor Errors
    // -------------------------------------------------------------------------
    #[error("Bad file descriptor: {0}")]
    BadDescriptor(i32),

    #[error("Descriptor table full ({capacity} slots)")]
    TooManyOpenFiles { capacity: usize },

    #[error("File name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Out of DMA memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("Engine initialization failed while {stage}: {source}")]
    EngineInit {
        stage: &'static str,
        #[source]
        source: Box<VfsError>,
    },

    #[error("{operation} timed out after {attempts} poll attempts")]
    Timeout { operation: &'static str, attempts: u32 },

    #[error("Worker stopped before {operation} completed")]
    WorkerStopped { operation: &'static str },

    #[error("Engine error during {operation}: {errno}")]
    Engine { operation: &'static str, errno: Errno },

    // -------------------------------------------------------------------------
    // Precondition Errors
    // -------------------------------------------------------------------------
    #[error("Blob is not ready (state: {0})")]
    NotReady(BlobState),

    #[error("Write of {len} bytes exceeds the {unit}-byte I/O unit")]
    WriteTooLarge { len: usize, unit: usize },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VfsError {
    /// An engine completion that reported a failure status.
    pub fn engine(operation: &'static str, errno: Errno) -> Self {
        VfsError::Engine { operation, errno }
    }

    /// Wrap an error raised while bringing the engine up.
    pub fn engine_init(stage: &'static str, source: VfsError) -> Self {
        VfsError::EngineInit {
            stage,
            source: Box::new(source),
        }
    }

    /// POSIX errno equivalent, as reported through the `posix` entry points.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::BadDescriptor(_) => libc::EBADF,
            VfsError::TooManyOpenFiles { .. } => libc::EMFILE,
            VfsError::NameTooLong { .. } => libc::ENAMETOOLONG,
            VfsError::OutOfMemory { .. } => libc::ENOMEM,
            VfsError::EngineInit { source, .. } => source.errno(),
            VfsError::Timeout { .. } => libc::ETIMEDOUT,
            VfsError::WorkerStopped { .. } => libc::ESHUTDOWN,
            VfsError::Engine { errno, .. } => errno.raw(),
            VfsError::NotReady(_) => libc::EIO,
            VfsError::WriteTooLarge { .. } => libc::EFBIG,
            VfsError::Config(_) => libc::EINVAL,
            VfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            VfsError::Serialization(_) => libc::EIO,
        }
    }

    /// True for errors the caller may retry once resources free up.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            VfsError::TooManyOpenFiles { .. } | VfsError::OutOfMemory { .. }
        )
    }
}
