//! Blob lifecycle
//!
//! Creation runs as a chain of engine completions, one transition function
//! per state. Teardown closes and deletes the blob: it has no name, so its
//! contents are unreachable once its file is closed.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BlobBackend, BlobHandle, BlobId, DmaAllocator, EngineResult};
use crate::bridge::Completion;
use crate::engine::EngineInstance;
use crate::error::{Result, VfsError};

use super::{BlobObject, BlobState, StagingBuffers};

/// What a successful creation chain hands back
struct ReadyBlob {
    handle: BlobHandle,
    buffers: StagingBuffers,
}

/// Creation chain travelling through engine callbacks
struct CreateChain {
    backend: Arc<dyn BlobBackend>,
    dma: Arc<DmaAllocator>,
    io_unit_size: usize,
    target_clusters: Option<u64>,
    /// Current state, shared with the caller for diagnostics
    state: Arc<Mutex<BlobState>>,
    completion: Completion<Result<ReadyBlob>>,
}

impl CreateChain {
    fn enter(&self, next: BlobState) {
        let mut state = self.state.lock();
        tracing::debug!(from = %*state, to = %next, "Blob transition");
        *state = next;
    }

    /// Uncreated → Creating
    fn start(self) {
        self.enter(BlobState::Creating);
        let backend = Arc::clone(&self.backend);
        backend.create_blob(Box::new(move |result| self.on_created(result)));
    }

    /// Creating → Opening
    fn on_created(self, result: EngineResult<BlobId>) {
        let id = match result {
            Ok(id) => id,
            Err(errno) => return self.fail(VfsError::engine("create blob", errno)),
        };

        self.enter(BlobState::Opening);
        let backend = Arc::clone(&self.backend);
        backend.open_blob(id, Box::new(move |result| self.on_opened(result)));
    }

    /// Opening → Resizing
    fn on_opened(self, result: EngineResult<BlobHandle>) {
        let blob = match result {
            Ok(blob) => blob,
            Err(errno) => return self.fail(VfsError::engine("open blob", errno)),
        };

        let buffers = match StagingBuffers::allocate(&self.dma, self.io_unit_size) {
            Ok(buffers) => buffers,
            Err(e) => return self.abort(blob, e),
        };

        let clusters = self
            .target_clusters
            .unwrap_or_else(|| self.backend.free_cluster_count());

        self.enter(BlobState::Resizing);
        let backend = Arc::clone(&self.backend);
        backend.resize_blob(
            blob,
            clusters,
            Box::new(move |result| self.on_resized(blob, buffers, result)),
        );
    }

    /// Resizing → SyncingMetadata
    fn on_resized(self, blob: BlobHandle, buffers: StagingBuffers, result: EngineResult<()>) {
        if let Err(errno) = result {
            drop(buffers);
            return self.abort(blob, VfsError::engine("resize blob", errno));
        }

        self.enter(BlobState::SyncingMetadata);
        let backend = Arc::clone(&self.backend);
        backend.sync_blob_metadata(
            blob,
            Box::new(move |result| self.on_synced(blob, buffers, result)),
        );
    }

    /// SyncingMetadata → Ready
    fn on_synced(self, blob: BlobHandle, buffers: StagingBuffers, result: EngineResult<()>) {
        if let Err(errno) = result {
            drop(buffers);
            return self.abort(blob, VfsError::engine("sync blob metadata", errno));
        }

        self.enter(BlobState::Ready);
        self.completion.complete(Ok(ReadyBlob {
            handle: blob,
            buffers,
        }));
    }

    /// Failure after the blob was opened: close and delete it in the background
    fn abort(self, blob: BlobHandle, error: VfsError) {
        let backend = Arc::clone(&self.backend);
        let deleter = Arc::clone(&self.backend);
        backend.close_blob(
            blob,
            Box::new(move |result| match result {
                Ok(()) => deleter.delete_blob(blob.id(), Box::new(|_| {})),
                Err(errno) => tracing::warn!(blob = blob.id(), %errno, "Abandoned blob not closed"),
            }),
        );
        self.fail(error);
    }

    /// Any → Failed
    fn fail(self, error: VfsError) {
        self.enter(BlobState::Failed);
        self.completion.complete(Err(error));
    }
}

/// Drive a fresh blob from `Uncreated` to `Ready`
pub(crate) fn create(engine: &EngineInstance, target_clusters: Option<u64>) -> Result<BlobObject> {
    let state = Arc::new(Mutex::new(BlobState::Uncreated));
    let completion = Completion::new();

    let chain = CreateChain {
        backend: Arc::clone(engine.backend()),
        dma: engine.dma(),
        io_unit_size: engine.io_unit_size(),
        target_clusters,
        state: Arc::clone(&state),
        completion: completion.clone(),
    };

    match engine
        .bridge()
        .drive(engine.worker(), "create blob", move || chain.start(), &completion)
    {
        Ok(ready) => Ok(BlobObject::ready(ready.handle, ready.buffers)),
        Err(e) => {
            tracing::warn!(state = %*state.lock(), "Blob creation failed: {}", e);
            Err(e)
        }
    }
}

/// Ready (or Failed) → Unloading → Unloaded
///
/// Staging buffers are released first, then the blob is closed and deleted.
pub(crate) fn teardown(engine: &EngineInstance, object: &mut BlobObject) -> Result<()> {
    object.state = BlobState::Unloading;
    object.buffers = None;

    let Some(blob) = object.handle.take() else {
        object.state = BlobState::Unloaded;
        return Ok(());
    };

    let completion = Completion::new();
    let done = completion.clone();
    let backend = Arc::clone(engine.backend());

    let result = engine.bridge().drive(
        engine.worker(),
        "close blob",
        move || {
            let deleter = Arc::clone(&backend);
            backend.close_blob(
                blob,
                Box::new(move |result| match result {
                    Ok(()) => deleter.delete_blob(
                        blob.id(),
                        Box::new(move |result| {
                            done.complete(result.map_err(|e| VfsError::engine("delete blob", e)));
                        }),
                    ),
                    Err(errno) => {
                        done.complete(Err(VfsError::engine("close blob", errno)));
                    }
                }),
            );
        },
        &completion,
    );

    object.state = match result {
        Ok(()) => BlobState::Unloaded,
        Err(_) => BlobState::Failed,
    };
    tracing::debug!(blob = blob.id(), state = %object.state, "Blob torn down");
    result
}
