//! Storage Backend Module
//!
//! The narrow boundary to the blob storage engine.
//!
//! ## Contract
//! - Every asynchronous operation takes a callback that is invoked exactly
//!   once, as a message on the worker bound with [`BlobBackend::bind_worker`]
//! - Nothing completes unless that worker is polled
//! - Failures are reported through the callback as an [`Errno`]
//! - Staging buffers are lent to read/write requests and handed back in the
//!   completion, whatever the outcome
//!
//! [`MemoryBackend`] is the in-process engine shipped with the crate.

mod dma;
mod memory;
mod metadata;

use std::fmt;
use std::sync::Arc;

use tracing::level_filters::LevelFilter;

use crate::bridge::Worker;
use crate::topology::Topology;

pub use dma::{DmaAllocator, DmaBuf, DMA_ALIGN};
pub use memory::{BackendOp, MemoryBackend, MemoryBackendBuilder, DEFAULT_CLUSTER_SIZE};
pub use metadata::{BlobMetadata, MetadataPage};

/// Identifier the store assigns to a created blob
pub type BlobId = u64;

/// Result reported by an engine completion
pub type EngineResult<T> = std::result::Result<T, Errno>;

/// Completion callback for an engine operation
pub type Callback<T> = Box<dyn FnOnce(EngineResult<T>) + Send + 'static>;

/// Completion callback for a read/write; the buffer always comes back
pub type IoCallback = Box<dyn FnOnce(DmaBuf, EngineResult<()>) + Send + 'static>;

/// POSIX-style status code reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const NOENT: Errno = Errno(libc::ENOENT);
    pub const IO: Errno = Errno(libc::EIO);
    pub const BADF: Errno = Errno(libc::EBADF);
    pub const NOMEM: Errno = Errno(libc::ENOMEM);
    pub const BUSY: Errno = Errno(libc::EBUSY);
    pub const NODEV: Errno = Errno(libc::ENODEV);
    pub const INVAL: Errno = Errno(libc::EINVAL);
    pub const NOSPC: Errno = Errno(libc::ENOSPC);

    pub const fn new(raw: i32) -> Self {
        Errno(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Opaque handle to an opened blob; owned by the engine, not the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHandle {
    id: BlobId,
}

impl BlobHandle {
    pub fn new(id: BlobId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> BlobId {
        self.id
    }
}

/// Handle to an engine I/O channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoChannel {
    id: u64,
}

impl IoChannel {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Runtime environment options applied before anything else
#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Application name
    pub name: String,

    /// Engine log verbosity
    pub log_level: LevelFilter,
}

/// Geometry of an initialized blob store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    /// Bytes per read/write unit
    pub io_unit_size: usize,

    /// Bytes per allocation cluster
    pub cluster_size: u64,

    /// Clusters on the device, metadata included
    pub total_clusters: u64,
}

impl StoreInfo {
    /// I/O units per cluster
    pub fn units_per_cluster(&self) -> u64 {
        self.cluster_size / self.io_unit_size as u64
    }
}

/// Callback-driven blob storage engine
pub trait BlobBackend: Send + Sync {
    // -------------------------------------------------------------------------
    // Environment
    // -------------------------------------------------------------------------

    /// Prepare the runtime environment (synchronous)
    fn init_env(&self, opts: &EnvOptions) -> EngineResult<()>;

    /// Worker all completions are delivered on
    fn bind_worker(&self, worker: Arc<Worker>);

    /// Bring up the block devices described by `topology`
    fn load_topology(&self, topology: Topology, cb: Callback<()>);

    // -------------------------------------------------------------------------
    // Store
    // -------------------------------------------------------------------------

    /// Initialize a fresh blob store on the named block device
    fn init_store(&self, device: &str, cb: Callback<StoreInfo>);

    /// Clusters not allocated to any blob
    fn free_cluster_count(&self) -> u64;

    /// Allocate the I/O channel used for blob reads and writes
    fn alloc_io_channel(&self) -> Option<IoChannel>;

    fn free_io_channel(&self, channel: IoChannel);

    /// Allocator for staging buffers usable by read/write requests
    fn dma_allocator(&self) -> Arc<DmaAllocator>;

    /// Persist store metadata and release the store
    fn unload_store(&self, cb: Callback<()>);

    // -------------------------------------------------------------------------
    // Blobs
    // -------------------------------------------------------------------------

    fn create_blob(&self, cb: Callback<BlobId>);

    fn open_blob(&self, id: BlobId, cb: Callback<BlobHandle>);

    /// Resize to exactly `clusters` clusters
    fn resize_blob(&self, blob: BlobHandle, clusters: u64, cb: Callback<()>);

    /// Make the blob's metadata durable
    fn sync_blob_metadata(&self, blob: BlobHandle, cb: Callback<()>);

    /// Read `units` I/O units starting at `offset` (in units) into `buf`
    fn read_blob(
        &self,
        blob: BlobHandle,
        channel: IoChannel,
        buf: DmaBuf,
        offset: u64,
        units: u64,
        cb: IoCallback,
    );

    /// Write `units` I/O units from `buf` starting at `offset` (in units)
    fn write_blob(
        &self,
        blob: BlobHandle,
        channel: IoChannel,
        buf: DmaBuf,
        offset: u64,
        units: u64,
        cb: IoCallback,
    );

    fn close_blob(&self, blob: BlobHandle, cb: Callback<()>);

    /// Delete a closed blob and release its clusters
    fn delete_blob(&self, id: BlobId, cb: Callback<()>);
}
