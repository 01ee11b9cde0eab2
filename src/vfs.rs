//! File Facade
//!
//! The four blocking file operations, composed from the descriptor table,
//! the engine instance and the blob lifecycle.
//!
//! ## Responsibilities
//! - Bring the engine up on first use and down after the last close
//! - Map descriptors to files, each backed by one freshly created blob
//! - Turn every engine failure into an error for the caller

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{BlobBackend, MemoryBackend};
use crate::blob::{lifecycle, staging, BlobObject, BlobState};
use crate::config::Config;
use crate::engine::EngineInstance;
use crate::error::{Result, VfsError};
use crate::fd::{DescriptorTable, Fd};

/// Longest accepted path label, in bytes
pub const MAX_PATH_LEN: usize = 128;

/// An open file
struct File {
    /// Label only; never used for lookup
    path: String,

    flags: i32,

    object: BlobObject,

    engine: Weak<EngineInstance>,
}

impl File {
    fn engine(&self) -> Result<Arc<EngineInstance>> {
        self.engine
            .upgrade()
            .ok_or(VfsError::NotReady(self.object.state()))
    }
}

/// Snapshot of an open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub fd: Fd,
    pub path: String,
    pub flags: i32,
    pub state: BlobState,
    pub io_unit_size: usize,
}

struct VfsState {
    table: DescriptorTable<File>,
    engine: Option<Arc<EngineInstance>>,
    generation: u64,
}

/// Blocking file facade over a callback-driven blob engine
///
/// ## Concurrency Model
/// Every operation holds one lock for its whole duration, engine drives
/// included. Engine bring-up therefore happens exactly once per generation
/// and calls from different threads never interleave.
pub struct Vfs {
    config: Config,
    backend: Arc<dyn BlobBackend>,
    state: Mutex<VfsState>,
}

impl Vfs {
    /// Create a facade over `backend`; the engine is not started yet
    pub fn new(config: Config, backend: Arc<dyn BlobBackend>) -> Result<Self> {
        config.validate()?;

        let table = DescriptorTable::new(config.max_descriptors, config.reserved_descriptors);
        Ok(Self {
            config,
            backend,
            state: Mutex::new(VfsState {
                table,
                engine: None,
                generation: 0,
            }),
        })
    }

    /// Create a facade over a fresh [`MemoryBackend`]
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(MemoryBackend::new()))
    }

    /// Open a new file labelled `path`
    ///
    /// Steps:
    /// 1. Ensure the engine is up
    /// 2. Allocate a descriptor
    /// 3. Drive a fresh blob to `Ready`
    /// 4. Install the file under the descriptor
    pub fn open(&self, path: &str, flags: i32) -> Result<Fd> {
        if path.len() > MAX_PATH_LEN {
            return Err(VfsError::NameTooLong {
                len: path.len(),
                max: MAX_PATH_LEN,
            });
        }

        let mut state = self.state.lock();

        // Step 1: Engine
        let engine = self.ensure_engine(&mut state)?;

        // Step 2: Descriptor
        let fd = match state.table.allocate() {
            Ok(fd) => fd,
            Err(e) => {
                tracing::warn!(path, "Open failed: {}", e);
                self.release_engine_if_idle(&mut state);
                return Err(e);
            }
        };

        // Step 3: Blob
        let object = match lifecycle::create(&engine, self.config.blob_clusters) {
            Ok(object) => object,
            Err(e) => {
                state.table.release(fd);
                tracing::warn!(path, "Open failed: {}", e);
                self.release_engine_if_idle(&mut state);
                return Err(e);
            }
        };

        // Step 4: Install
        let file = File {
            path: path.to_string(),
            flags,
            object,
            engine: Arc::downgrade(&engine),
        };
        state.table.install(fd, file)?;

        tracing::debug!(fd, path, "File opened");
        Ok(fd)
    }

    /// Write `data` as the file's single unit; returns the bytes written
    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let file = state.table.get_mut(fd).ok_or(VfsError::BadDescriptor(fd))?;
        let engine = file.engine()?;

        staging::write(&engine, &mut file.object, data)
    }

    /// Read the file's unit into `buf`; returns the bytes copied
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let file = state.table.get_mut(fd).ok_or(VfsError::BadDescriptor(fd))?;
        let engine = file.engine()?;

        staging::read(&engine, &mut file.object, buf)
    }

    /// Close a file; closing an unknown descriptor succeeds without effect
    ///
    /// Steps:
    /// 1. Tear the blob down (buffers released, blob closed and deleted)
    /// 2. Free the descriptor and the file record
    /// 3. Stop the engine if this was the last open file
    pub fn close(&self, fd: Fd) -> Result<()> {
        let mut state = self.state.lock();

        // Step 1: Blob
        let Some(file) = state.table.get_mut(fd) else {
            tracing::debug!(fd, "Close of unknown descriptor ignored");
            return Ok(());
        };
        let result = file
            .engine()
            .and_then(|engine| lifecycle::teardown(&engine, &mut file.object));

        // Step 2: Descriptor
        if let Some(file) = state.table.release(fd) {
            tracing::debug!(fd, path = %file.path, "File closed");
        }

        // Step 3: Engine
        let engine_result = if state.table.is_empty() {
            Self::stop_engine(&mut state)
        } else {
            Ok(())
        };

        result.and(engine_result)
    }

    /// Describe an open file
    pub fn stat(&self, fd: Fd) -> Result<FileInfo> {
        let state = self.state.lock();
        let file = state.table.get(fd).ok_or(VfsError::BadDescriptor(fd))?;

        Ok(FileInfo {
            fd,
            path: file.path.clone(),
            flags: file.flags,
            state: file.object.state(),
            io_unit_size: file.engine().map_or(0, |e| e.io_unit_size()),
        })
    }

    /// Close every open file and stop the engine
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut first_error = None;

        let open = state.table.descriptors();
        for fd in open {
            if let Some(mut file) = state.table.release(fd) {
                let result = file
                    .engine()
                    .and_then(|engine| lifecycle::teardown(&engine, &mut file.object));
                if let Err(e) = result {
                    tracing::warn!(fd, "Teardown during shutdown failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = Self::stop_engine(&mut state) {
            first_error.get_or_insert(e);
        }

        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of open files
    pub fn open_files(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Whether an engine instance is currently up
    pub fn is_engine_running(&self) -> bool {
        self.state.lock().engine.is_some()
    }

    /// Engine bring-ups so far
    pub fn engine_generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// I/O unit of the running engine
    pub fn io_unit_size(&self) -> Option<usize> {
        self.state.lock().engine.as_ref().map(|e| e.io_unit_size())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_engine(&self, state: &mut VfsState) -> Result<Arc<EngineInstance>> {
        if let Some(engine) = &state.engine {
            return Ok(Arc::clone(engine));
        }

        let generation = state.generation + 1;
        let engine = Arc::new(EngineInstance::start(
            &self.config,
            Arc::clone(&self.backend),
            generation,
        )?);

        state.generation = generation;
        state.engine = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Stop the engine after a failed open left no file needing it
    fn release_engine_if_idle(&self, state: &mut VfsState) {
        if !state.table.is_empty() {
            return;
        }
        if let Err(e) = Self::stop_engine(state) {
            tracing::warn!("Engine teardown after failed open: {}", e);
        }
    }

    fn stop_engine(state: &mut VfsState) -> Result<()> {
        match state.engine.take() {
            Some(engine) => engine.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Shutdown on drop failed: {}", e);
        }
    }
}
