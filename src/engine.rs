//! Engine Module
//!
//! The storage engine instance shared by every open file.
//!
//! ## Responsibilities
//! - Bring the engine up: environment, worker, topology, blob store, I/O channel
//! - Hand out the shared worker, bridge, channel and I/O unit size
//! - Tear everything down once no file needs it
//!
//! An instance is created by the first `open()` of a [`Vfs`](crate::Vfs) and
//! dropped after the last `close()`. A later `open()` brings up a new
//! generation.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BlobBackend, DmaAllocator, EnvOptions, Errno, IoChannel, StoreInfo};
use crate::bridge::{Bridge, Completion, Worker};
use crate::config::Config;
use crate::error::{Result, VfsError};

/// A running storage engine
///
/// ## Sharing
/// - One worker: every engine operation runs on it, driven by `bridge`
/// - One I/O channel: used by all files, released only at shutdown
/// - Files hold a `Weak` back-reference; the owning `Arc` lives in the `Vfs`
pub struct EngineInstance {
    /// Bring-up counter, for log correlation
    generation: u64,

    backend: Arc<dyn BlobBackend>,

    worker: Arc<Worker>,

    bridge: Bridge,

    /// Store geometry discovered at bring-up
    info: StoreInfo,

    /// Taken at shutdown
    channel: Mutex<Option<IoChannel>>,

    dma: Arc<DmaAllocator>,
}

impl EngineInstance {
    /// Bring up a new engine instance
    ///
    /// Steps:
    /// 1. Prepare the runtime environment (log verbosity included)
    /// 2. Create the worker and bind it to the backend
    /// 3. Load the device topology (one drive)
    /// 4. Initialize the blob store on the configured device (one drive)
    /// 5. Allocate the shared I/O channel
    ///
    /// Any failure is reported as [`VfsError::EngineInit`]; nothing is left running.
    pub(crate) fn start(config: &Config, backend: Arc<dyn BlobBackend>, generation: u64) -> Result<Self> {
        tracing::info!(generation, device = %config.store_device, "Bringing up storage engine");

        // Step 1: Environment
        let opts = EnvOptions {
            name: config.worker_name.clone(),
            log_level: config.backend_log_level,
        };
        backend.init_env(&opts).map_err(|errno| {
            VfsError::engine_init("preparing the environment", VfsError::engine("init env", errno))
        })?;

        // Step 2: Worker
        let worker = Worker::new(config.worker_name.clone());
        backend.bind_worker(Arc::clone(&worker));
        let bridge = Bridge::new(config.poll_budget);

        // Steps 3-5
        let (info, channel) = match Self::bring_up(config, &backend, &worker, &bridge) {
            Ok(ready) => ready,
            Err(e) => {
                worker.stop();
                tracing::warn!(generation, "Storage engine bring-up failed: {}", e);
                return Err(e);
            }
        };

        tracing::info!(
            generation,
            io_unit_size = info.io_unit_size,
            clusters = info.total_clusters,
            "Storage engine ready"
        );

        let dma = backend.dma_allocator();
        Ok(Self {
            generation,
            backend,
            worker,
            bridge,
            info,
            channel: Mutex::new(Some(channel)),
            dma,
        })
    }

    fn bring_up(
        config: &Config,
        backend: &Arc<dyn BlobBackend>,
        worker: &Arc<Worker>,
        bridge: &Bridge,
    ) -> Result<(StoreInfo, IoChannel)> {
        // Step 3: Topology
        let completion = Completion::new();
        let done = completion.clone();
        let loader = Arc::clone(backend);
        let topology = config.topology.clone();
        bridge
            .drive(
                worker,
                "load topology",
                move || {
                    loader.load_topology(
                        topology,
                        Box::new(move |result| {
                            done.complete(result.map_err(|e| VfsError::engine("load topology", e)));
                        }),
                    )
                },
                &completion,
            )
            .map_err(|e| VfsError::engine_init("loading the topology", e))?;

        // Step 4: Blob store
        let completion = Completion::new();
        let done = completion.clone();
        let store = Arc::clone(backend);
        let device = config.store_device.clone();
        let info = bridge
            .drive(
                worker,
                "init store",
                move || {
                    store.init_store(
                        &device,
                        Box::new(move |result| {
                            done.complete(result.map_err(|e| VfsError::engine("init store", e)));
                        }),
                    )
                },
                &completion,
            )
            .map_err(|e| VfsError::engine_init("initializing the blob store", e))?;

        // Step 5: Shared channel
        let Some(channel) = backend.alloc_io_channel() else {
            if let Err(e) = Self::unload(backend, worker, bridge) {
                tracing::warn!("Unload after channel failure also failed: {}", e);
            }
            return Err(VfsError::engine_init(
                "allocating the I/O channel",
                VfsError::engine("alloc io channel", Errno::NOMEM),
            ));
        };

        Ok((info, channel))
    }

    /// Unload the store; its completion stops the worker
    fn unload(backend: &Arc<dyn BlobBackend>, worker: &Arc<Worker>, bridge: &Bridge) -> Result<()> {
        let completion = Completion::new();
        let done = completion.clone();
        let unloader = Arc::clone(backend);
        let stopper = Arc::clone(worker);

        bridge.drive(
            worker,
            "unload store",
            move || {
                unloader.unload_store(Box::new(move |result| {
                    done.complete(result.map_err(|e| VfsError::engine("unload store", e)));
                    stopper.stop();
                }))
            },
            &completion,
        )
    }

    /// Release the channel, unload the store and stop the worker
    pub(crate) fn shutdown(&self) -> Result<()> {
        if self.worker.is_stopped() {
            return Ok(());
        }

        if let Some(channel) = self.channel.lock().take() {
            self.backend.free_io_channel(channel);
        }

        let result = Self::unload(&self.backend, &self.worker, &self.bridge);
        self.worker.stop();

        match &result {
            Ok(()) => tracing::info!(generation = self.generation, "Storage engine stopped"),
            Err(e) => tracing::warn!(generation = self.generation, "Storage engine stopped uncleanly: {}", e),
        }
        result
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bytes per read/write unit, as reported by the store
    pub fn io_unit_size(&self) -> usize {
        self.info.io_unit_size
    }

    /// Store geometry discovered at bring-up
    pub fn store_info(&self) -> StoreInfo {
        self.info
    }

    /// Bring-up counter of this instance
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Storage engine the instance drives
    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Worker every engine operation runs on
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Drive loop bound to the configured poll budget
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Allocator for staging buffers
    pub fn dma(&self) -> Arc<DmaAllocator> {
        Arc::clone(&self.dma)
    }

    /// The shared I/O channel, until shutdown
    pub fn channel(&self) -> Result<IoChannel> {
        (*self.channel.lock()).ok_or(VfsError::WorkerStopped {
            operation: "io channel lookup",
        })
    }
}
