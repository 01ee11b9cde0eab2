//! I/O staging
//!
//! Each file owns one write and one read buffer of exactly one I/O unit.
//! Every request addresses unit 0 of the blob: a file is a single block.

use std::sync::Arc;

use crate::backend::{BlobBackend, DmaAllocator, DmaBuf, EngineResult, IoCallback, DMA_ALIGN};
use crate::bridge::Completion;
use crate::engine::EngineInstance;
use crate::error::{Result, VfsError};

use super::BlobObject;

/// A file's exclusively-owned staging buffers.
///
/// A buffer is absent only while lent to an in-flight request.
#[derive(Debug)]
pub struct StagingBuffers {
    write: Option<DmaBuf>,
    read: Option<DmaBuf>,
}

impl StagingBuffers {
    /// Allocate the write buffer, then the read buffer.
    ///
    /// If the read buffer cannot be allocated the write buffer is released
    /// before returning.
    pub fn allocate(dma: &Arc<DmaAllocator>, unit: usize) -> Result<Self> {
        let write = dma
            .try_alloc(unit, DMA_ALIGN)
            .ok_or(VfsError::OutOfMemory { requested: unit })?;

        let read = match dma.try_alloc(unit, DMA_ALIGN) {
            Some(buf) => buf,
            None => {
                drop(write);
                return Err(VfsError::OutOfMemory { requested: unit });
            }
        };

        Ok(Self {
            write: Some(write),
            read: Some(read),
        })
    }

    /// Whether neither buffer is out on loan
    pub fn is_complete(&self) -> bool {
        self.write.is_some() && self.read.is_some()
    }
}

/// Lend `buf` to one engine request and wait for it to come back
fn submit<F>(engine: &EngineInstance, operation: &'static str, issue: F) -> Result<(DmaBuf, EngineResult<()>)>
where
    F: FnOnce(&dyn BlobBackend, IoCallback) + Send + 'static,
{
    let completion = Completion::new();
    let done = completion.clone();
    let backend = Arc::clone(engine.backend());

    engine.bridge().drive(
        engine.worker(),
        operation,
        move || {
            issue(
                backend.as_ref(),
                Box::new(move |buf, status| {
                    done.complete(Ok((buf, status)));
                }),
            )
        },
        &completion,
    )
}

/// Copy `data` into the write buffer and write it as unit 0
pub(crate) fn write(engine: &EngineInstance, object: &mut BlobObject, data: &[u8]) -> Result<usize> {
    let blob = object.ready_handle()?;
    let unit = engine.io_unit_size();
    if data.len() > unit {
        return Err(VfsError::WriteTooLarge {
            len: data.len(),
            unit,
        });
    }

    let channel = engine.channel()?;
    let state = object.state();
    let mut buf = object
        .buffers_mut()?
        .write
        .take()
        .ok_or(VfsError::NotReady(state))?;
    buf[..data.len()].copy_from_slice(data);

    let outcome = submit(engine, "write blob", move |backend, cb| {
        backend.write_blob(blob, channel, buf, 0, 1, cb)
    });

    match outcome {
        Ok((buf, status)) => {
            object.buffers_mut()?.write = Some(buf);
            status.map_err(|e| VfsError::engine("write blob", e))?;
            tracing::trace!(blob = blob.id(), len = data.len(), "Unit written");
            Ok(data.len())
        }
        Err(e) => {
            object.fail();
            Err(e)
        }
    }
}

/// Read unit 0 into the zeroed read buffer and copy out what fits in `out`
pub(crate) fn read(engine: &EngineInstance, object: &mut BlobObject, out: &mut [u8]) -> Result<usize> {
    let blob = object.ready_handle()?;
    let channel = engine.channel()?;
    let state = object.state();
    let mut buf = object
        .buffers_mut()?
        .read
        .take()
        .ok_or(VfsError::NotReady(state))?;
    buf.zero();

    let outcome = submit(engine, "read blob", move |backend, cb| {
        backend.read_blob(blob, channel, buf, 0, 1, cb)
    });

    match outcome {
        Ok((buf, status)) => {
            let result = match status {
                Ok(()) => {
                    let copied = out.len().min(buf.len());
                    out[..copied].copy_from_slice(&buf[..copied]);
                    tracing::trace!(blob = blob.id(), len = copied, "Unit read");
                    Ok(copied)
                }
                Err(e) => Err(VfsError::engine("read blob", e)),
            };
            object.buffers_mut()?.read = Some(buf);
            result
        }
        Err(e) => {
            object.fail();
            Err(e)
        }
    }
}
