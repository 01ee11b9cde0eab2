//! In-memory storage engine
//!
//! A blob store over RAM-backed block devices. Every operation applies its
//! effect immediately but delivers its completion as a message on the bound
//! worker, so callers observe the same "nothing finishes until you poll"
//! behaviour as a real polled-mode engine.
//!
//! ## Layout
//! ```text
//! device: ┌───────────┬───────────┬───────────┬─────┐
//!         │ cluster 0 │ cluster 1 │ cluster 2 │ ... │
//!         │ metadata  │  blob data (allocated on resize) │
//!         └───────────┴───────────┴───────────┴─────┘
//! ```
//!
//! Faults can be injected per operation: a stalled operation never delivers
//! its completion, a failing one completes with the configured errno.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing::Level;

use crate::bridge::Worker;
use crate::error::Result;
use crate::topology::{MallocDeviceSpec, Topology};

use super::{
    BlobBackend, BlobHandle, BlobId, BlobMetadata, Callback, DmaAllocator, DmaBuf, EngineResult,
    EnvOptions, Errno, IoCallback, IoChannel, MetadataPage, StoreInfo,
};

/// Default allocation cluster: 1 MiB
pub const DEFAULT_CLUSTER_SIZE: u64 = 1024 * 1024;

/// Default staging buffer budget: 64 MiB
pub const DEFAULT_DMA_LIMIT: usize = 64 * 1024 * 1024;

/// Clusters reserved at the start of the device for the metadata page
const METADATA_CLUSTERS: u64 = 1;

/// Operations faults can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    InitEnv,
    LoadTopology,
    InitStore,
    AllocChannel,
    CreateBlob,
    OpenBlob,
    ResizeBlob,
    SyncMetadata,
    Read,
    Write,
    CloseBlob,
    DeleteBlob,
    Unload,
}

#[derive(Default)]
struct Faults {
    stalled: HashSet<BackendOp>,
    failing: HashMap<BackendOp, Errno>,
}

struct MallocDevice {
    spec: MallocDeviceSpec,
    data: Vec<u8>,
}

impl MallocDevice {
    /// Allocate the device's backing memory, `NOMEM` if it cannot be had
    fn new(spec: MallocDeviceSpec) -> EngineResult<Self> {
        let capacity = spec
            .capacity()
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or(Errno::NOMEM)?;

        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| {
            tracing::warn!(device = %spec.name, capacity, "Cannot allocate malloc device");
            Errno::NOMEM
        })?;
        data.resize(capacity, 0);

        Ok(Self { spec, data })
    }
}

struct BlobRecord {
    clusters: Vec<u64>,
    open: bool,
}

struct Store {
    device: String,
    info: StoreInfo,
    /// One flag per cluster, `true` when free. Metadata clusters are never free.
    free: Vec<bool>,
    blobs: BTreeMap<BlobId, BlobRecord>,
    next_blob_id: BlobId,
}

impl Store {
    fn format(device: &MallocDevice, cluster_size: u64) -> EngineResult<Self> {
        let block_size = u64::from(device.spec.block_size);
        if cluster_size < block_size || cluster_size % block_size != 0 {
            return Err(Errno::INVAL);
        }

        let total_clusters = device.data.len() as u64 / cluster_size;
        if total_clusters <= METADATA_CLUSTERS {
            return Err(Errno::NOSPC);
        }

        let free = (0..total_clusters).map(|c| c >= METADATA_CLUSTERS).collect();

        Ok(Self {
            device: device.spec.name.clone(),
            info: StoreInfo {
                io_unit_size: device.spec.block_size as usize,
                cluster_size,
                total_clusters,
            },
            free,
            blobs: BTreeMap::new(),
            next_blob_id: 1,
        })
    }

    fn free_clusters(&self) -> u64 {
        self.free.iter().filter(|f| **f).count() as u64
    }

    fn blob_mut(&mut self, id: BlobId) -> EngineResult<&mut BlobRecord> {
        self.blobs.get_mut(&id).ok_or(Errno::NOENT)
    }

    fn resize(&mut self, id: BlobId, clusters: u64, device: &mut MallocDevice) -> EngineResult<()> {
        let cluster_size = self.info.cluster_size as usize;
        let current = self.blob_mut(id)?.clusters.len() as u64;

        if clusters > current {
            let needed = (clusters - current) as usize;
            let grabbed: Vec<u64> = self
                .free
                .iter()
                .enumerate()
                .filter(|(_, free)| **free)
                .map(|(c, _)| c as u64)
                .take(needed)
                .collect();
            if grabbed.len() < needed {
                return Err(Errno::NOSPC);
            }

            for &cluster in &grabbed {
                self.free[cluster as usize] = false;
                let start = cluster as usize * cluster_size;
                device.data[start..start + cluster_size].fill(0);
            }
            self.blob_mut(id)?.clusters.extend(grabbed);
        } else {
            let record = self.blob_mut(id)?;
            let released = record.clusters.split_off(clusters as usize);
            for cluster in released {
                self.free[cluster as usize] = true;
            }
        }

        Ok(())
    }

    /// Device byte offsets of `units` consecutive I/O units starting at `offset`
    fn unit_offsets(&self, id: BlobId, offset: u64, units: u64) -> EngineResult<Vec<usize>> {
        let record = self.blobs.get(&id).ok_or(Errno::NOENT)?;
        if !record.open {
            return Err(Errno::BADF);
        }

        let units_per_cluster = self.info.units_per_cluster();
        (offset..offset + units)
            .map(|unit| {
                let cluster = record
                    .clusters
                    .get((unit / units_per_cluster) as usize)
                    .ok_or(Errno::INVAL)?;
                let within = unit % units_per_cluster;
                Ok((cluster * self.info.cluster_size + within * self.info.io_unit_size as u64)
                    as usize)
            })
            .collect()
    }

    fn metadata_page(&self) -> MetadataPage {
        MetadataPage {
            cluster_size: self.info.cluster_size,
            blobs: self
                .blobs
                .iter()
                .map(|(id, record)| BlobMetadata {
                    id: *id,
                    clusters: record.clusters.clone(),
                })
                .collect(),
        }
    }

    fn persist_metadata(&self, device: &mut MallocDevice) -> EngineResult<()> {
        let page = self.metadata_page().encode().map_err(|e| {
            tracing::warn!("Failed to encode metadata page: {}", e);
            Errno::IO
        })?;

        let region = (METADATA_CLUSTERS * self.info.cluster_size) as usize;
        if page.len() > region {
            return Err(Errno::NOSPC);
        }
        device.data[..page.len()].copy_from_slice(&page);
        Ok(())
    }
}

#[derive(Default)]
struct State {
    env_ready: bool,
    devices: BTreeMap<String, MallocDevice>,
    store: Option<Store>,
    next_channel: u64,
    channels: HashSet<u64>,
    stores_initialized: u64,
}

impl State {
    /// The store and the device it lives on
    fn store_and_device(&mut self) -> EngineResult<(&mut Store, &mut MallocDevice)> {
        let store = self.store.as_mut().ok_or(Errno::NODEV)?;
        let device = self.devices.get_mut(&store.device).ok_or(Errno::NODEV)?;
        Ok((store, device))
    }
}

/// RAM-backed, worker-delivered blob storage engine
pub struct MemoryBackend {
    cluster_size: u64,
    dma: Arc<DmaAllocator>,
    worker: Mutex<Option<Arc<Worker>>>,
    log_level: Mutex<LevelFilter>,
    faults: Mutex<Faults>,
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Create a backend with default geometry
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MemoryBackendBuilder {
        MemoryBackendBuilder::default()
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Make `op` accept requests but never deliver their completion
    pub fn stall(&self, op: BackendOp) {
        self.faults.lock().stalled.insert(op);
    }

    /// Make `op` complete with `errno` without taking effect
    pub fn fail(&self, op: BackendOp, errno: Errno) {
        self.faults.lock().failing.insert(op, errno);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.stalled.clear();
        faults.failing.clear();
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Staging buffer allocator
    pub fn dma(&self) -> &Arc<DmaAllocator> {
        &self.dma
    }

    /// Whether a store is currently initialized
    pub fn has_store(&self) -> bool {
        self.state.lock().store.is_some()
    }

    /// Blobs in the current store
    pub fn blob_count(&self) -> usize {
        self.state.lock().store.as_ref().map_or(0, |s| s.blobs.len())
    }

    /// I/O channels not yet freed
    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Stores initialized over the backend's lifetime
    pub fn stores_initialized(&self) -> u64 {
        self.state.lock().stores_initialized
    }

    /// Block devices brought up from topologies
    pub fn devices(&self) -> Vec<MallocDeviceSpec> {
        self.state.lock().devices.values().map(|d| d.spec.clone()).collect()
    }

    /// Decode the metadata page persisted on `device`
    pub fn read_metadata(&self, device: &str) -> Result<Option<MetadataPage>> {
        let state = self.state.lock();
        let Some(device) = state.devices.get(device) else {
            return Ok(None);
        };
        let region = (METADATA_CLUSTERS * self.cluster_size) as usize;
        MetadataPage::decode(&device.data[..region.min(device.data.len())])
    }

    pub fn log_level(&self) -> LevelFilter {
        *self.log_level.lock()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Injected failure for `op`, if any
    fn injected(&self, op: BackendOp) -> EngineResult<()> {
        match self.faults.lock().failing.get(&op) {
            Some(errno) => {
                tracing::debug!(?op, %errno, "Injected failure");
                Err(*errno)
            }
            None => Ok(()),
        }
    }

    /// Deliver a completion on the bound worker
    fn deliver<F>(&self, op: BackendOp, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.faults.lock().stalled.contains(&op) {
            tracing::debug!(?op, "Completion withheld (stalled)");
            return;
        }

        let worker = self.worker.lock().clone();
        match worker {
            Some(worker) => {
                if worker.send_msg(Box::new(completion)).is_err() {
                    tracing::warn!(?op, "Worker stopped, completion dropped");
                }
            }
            None => tracing::warn!(?op, "No worker bound, completion dropped"),
        }
    }

    /// Engine notice, emitted only when the configured verbosity allows it
    fn notice(&self, op: BackendOp, detail: impl fmt::Display) {
        if Level::DEBUG <= self.log_level() {
            tracing::debug!(target: "blobvfs::engine", ?op, "{}", detail);
        }
    }

    fn io_unit_check(
        &self,
        op: BackendOp,
        blob: BlobHandle,
        channel: IoChannel,
        buf_len: usize,
        offset: u64,
        units: u64,
    ) -> EngineResult<Vec<usize>> {
        self.injected(op)?;

        let mut state = self.state.lock();
        if !state.channels.contains(&channel.id()) {
            return Err(Errno::BADF);
        }
        let (store, _) = state.store_and_device()?;
        if buf_len < units as usize * store.info.io_unit_size {
            return Err(Errno::INVAL);
        }
        store.unit_offsets(blob.id(), offset, units)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBackend for MemoryBackend {
    fn init_env(&self, opts: &EnvOptions) -> EngineResult<()> {
        self.injected(BackendOp::InitEnv)?;

        *self.log_level.lock() = opts.log_level;
        self.state.lock().env_ready = true;
        self.notice(BackendOp::InitEnv, format_args!("environment ready for {}", opts.name));
        Ok(())
    }

    fn bind_worker(&self, worker: Arc<Worker>) {
        tracing::debug!(worker = worker.name(), "Worker bound to memory backend");
        *self.worker.lock() = Some(worker);
    }

    fn load_topology(&self, topology: Topology, cb: Callback<()>) {
        let result = self.injected(BackendOp::LoadTopology).and_then(|_| {
            let specs = topology.malloc_devices().map_err(|e| {
                tracing::warn!("Rejected topology: {}", e);
                Errno::INVAL
            })?;

            let mut state = self.state.lock();
            for spec in specs {
                match state.devices.get(&spec.name) {
                    Some(existing) if existing.spec == spec => {
                        self.notice(BackendOp::LoadTopology, format_args!("{} already up", spec.name));
                        continue;
                    }
                    Some(_) if state.store.as_ref().is_some_and(|s| s.device == spec.name) => {
                        return Err(Errno::BUSY);
                    }
                    _ => {}
                }

                self.notice(
                    BackendOp::LoadTopology,
                    format_args!("{}: {} blocks of {} bytes", spec.name, spec.num_blocks, spec.block_size),
                );
                let device = MallocDevice::new(spec)?;
                state.devices.insert(device.spec.name.clone(), device);
            }
            Ok(())
        });

        self.deliver(BackendOp::LoadTopology, move || cb(result));
    }

    fn init_store(&self, device: &str, cb: Callback<StoreInfo>) {
        let result = self.injected(BackendOp::InitStore).and_then(|_| {
            let mut state = self.state.lock();
            if !state.env_ready {
                return Err(Errno::INVAL);
            }
            if state.store.is_some() {
                return Err(Errno::BUSY);
            }

            let store = {
                let device = state.devices.get_mut(device).ok_or(Errno::NODEV)?;
                let store = Store::format(device, self.cluster_size)?;
                store.persist_metadata(device)?;
                store
            };

            let info = store.info;
            state.store = Some(store);
            state.stores_initialized += 1;
            Ok(info)
        });

        if let Ok(info) = &result {
            self.notice(
                BackendOp::InitStore,
                format_args!("store on {}: io unit {} bytes, {} clusters", device, info.io_unit_size, info.total_clusters),
            );
        }
        self.deliver(BackendOp::InitStore, move || cb(result));
    }

    fn free_cluster_count(&self) -> u64 {
        self.state.lock().store.as_ref().map_or(0, Store::free_clusters)
    }

    fn alloc_io_channel(&self) -> Option<IoChannel> {
        if self.injected(BackendOp::AllocChannel).is_err() {
            return None;
        }

        let mut state = self.state.lock();
        state.store.as_ref()?;
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(id);
        Some(IoChannel::new(id))
    }

    fn free_io_channel(&self, channel: IoChannel) {
        if !self.state.lock().channels.remove(&channel.id()) {
            tracing::warn!(channel = channel.id(), "Freeing unknown I/O channel");
        }
    }

    fn dma_allocator(&self) -> Arc<DmaAllocator> {
        Arc::clone(&self.dma)
    }

    /// The store is released whatever the outcome, so a new one can be
    /// initialized after a failed unload.
    fn unload_store(&self, cb: Callback<()>) {
        let result = {
            let mut state = self.state.lock();
            match state.store.take() {
                Some(store) => {
                    if !state.channels.is_empty() {
                        tracing::warn!(channels = state.channels.len(), "Unloading store with live I/O channels");
                    }
                    self.injected(BackendOp::Unload).and_then(|_| {
                        let device = state.devices.get_mut(&store.device).ok_or(Errno::NODEV)?;
                        store.persist_metadata(device)
                    })
                }
                None => Err(Errno::NODEV),
            }
        };

        self.notice(BackendOp::Unload, "store unloaded");
        self.deliver(BackendOp::Unload, move || cb(result));
    }

    fn create_blob(&self, cb: Callback<BlobId>) {
        let result = self.injected(BackendOp::CreateBlob).and_then(|_| {
            let mut state = self.state.lock();
            let store = state.store.as_mut().ok_or(Errno::NODEV)?;
            let id = store.next_blob_id;
            store.next_blob_id += 1;
            store.blobs.insert(
                id,
                BlobRecord {
                    clusters: Vec::new(),
                    open: false,
                },
            );
            Ok(id)
        });

        self.deliver(BackendOp::CreateBlob, move || cb(result));
    }

    fn open_blob(&self, id: BlobId, cb: Callback<BlobHandle>) {
        let result = self.injected(BackendOp::OpenBlob).and_then(|_| {
            let mut state = self.state.lock();
            let store = state.store.as_mut().ok_or(Errno::NODEV)?;
            store.blob_mut(id)?.open = true;
            Ok(BlobHandle::new(id))
        });

        self.deliver(BackendOp::OpenBlob, move || cb(result));
    }

    fn resize_blob(&self, blob: BlobHandle, clusters: u64, cb: Callback<()>) {
        let result = self.injected(BackendOp::ResizeBlob).and_then(|_| {
            let mut state = self.state.lock();
            let (store, device) = state.store_and_device()?;
            store.resize(blob.id(), clusters, device)
        });

        self.notice(BackendOp::ResizeBlob, format_args!("blob {} -> {} clusters", blob.id(), clusters));
        self.deliver(BackendOp::ResizeBlob, move || cb(result));
    }

    fn sync_blob_metadata(&self, blob: BlobHandle, cb: Callback<()>) {
        let result = self.injected(BackendOp::SyncMetadata).and_then(|_| {
            let mut state = self.state.lock();
            let (store, device) = state.store_and_device()?;
            store.blob_mut(blob.id())?;
            store.persist_metadata(device)
        });

        self.deliver(BackendOp::SyncMetadata, move || cb(result));
    }

    fn read_blob(
        &self,
        blob: BlobHandle,
        channel: IoChannel,
        mut buf: DmaBuf,
        offset: u64,
        units: u64,
        cb: IoCallback,
    ) {
        let result = self
            .io_unit_check(BackendOp::Read, blob, channel, buf.len(), offset, units)
            .and_then(|offsets| {
                let mut state = self.state.lock();
                let (store, device) = state.store_and_device()?;
                let unit = store.info.io_unit_size;
                for (i, start) in offsets.into_iter().enumerate() {
                    buf[i * unit..(i + 1) * unit].copy_from_slice(&device.data[start..start + unit]);
                }
                Ok(())
            });

        self.deliver(BackendOp::Read, move || cb(buf, result));
    }

    fn write_blob(
        &self,
        blob: BlobHandle,
        channel: IoChannel,
        buf: DmaBuf,
        offset: u64,
        units: u64,
        cb: IoCallback,
    ) {
        let result = self
            .io_unit_check(BackendOp::Write, blob, channel, buf.len(), offset, units)
            .and_then(|offsets| {
                let mut state = self.state.lock();
                let (store, device) = state.store_and_device()?;
                let unit = store.info.io_unit_size;
                for (i, start) in offsets.into_iter().enumerate() {
                    device.data[start..start + unit].copy_from_slice(&buf[i * unit..(i + 1) * unit]);
                }
                Ok(())
            });

        self.deliver(BackendOp::Write, move || cb(buf, result));
    }

    fn close_blob(&self, blob: BlobHandle, cb: Callback<()>) {
        let result = self.injected(BackendOp::CloseBlob).and_then(|_| {
            let mut state = self.state.lock();
            let store = state.store.as_mut().ok_or(Errno::NODEV)?;
            store.blob_mut(blob.id())?.open = false;
            Ok(())
        });

        self.deliver(BackendOp::CloseBlob, move || cb(result));
    }

    fn delete_blob(&self, id: BlobId, cb: Callback<()>) {
        let result = self.injected(BackendOp::DeleteBlob).and_then(|_| {
            let mut state = self.state.lock();
            let store = state.store.as_mut().ok_or(Errno::NODEV)?;
            if store.blob_mut(id)?.open {
                return Err(Errno::BUSY);
            }
            if let Some(record) = store.blobs.remove(&id) {
                for cluster in record.clusters {
                    store.free[cluster as usize] = true;
                }
            }
            Ok(())
        });

        self.deliver(BackendOp::DeleteBlob, move || cb(result));
    }
}

/// Builder for MemoryBackend
pub struct MemoryBackendBuilder {
    cluster_size: u64,
    dma_limit: usize,
}

impl Default for MemoryBackendBuilder {
    fn default() -> Self {
        Self {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            dma_limit: DEFAULT_DMA_LIMIT,
        }
    }
}

impl MemoryBackendBuilder {
    /// Set the allocation cluster size in bytes
    pub fn cluster_size(mut self, bytes: u64) -> Self {
        self.cluster_size = bytes;
        self
    }

    /// Set the staging buffer budget in bytes
    pub fn dma_limit(mut self, bytes: usize) -> Self {
        self.dma_limit = bytes;
        self
    }

    pub fn build(self) -> MemoryBackend {
        MemoryBackend {
            cluster_size: self.cluster_size,
            dma: DmaAllocator::new(self.dma_limit),
            worker: Mutex::new(None),
            log_level: Mutex::new(LevelFilter::INFO),
            faults: Mutex::new(Faults::default()),
            state: Mutex::new(State::default()),
        }
    }
}
