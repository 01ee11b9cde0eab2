//! DMA staging buffers
//!
//! Fixed-size, aligned buffers handed to the engine for reads and writes,
//! drawn from a byte budget so allocation can fail like pinned memory does.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};

/// Alignment required for every staging buffer
pub const DMA_ALIGN: usize = 0x1000;

/// Byte budget staging buffers are drawn from
#[derive(Debug)]
pub struct DmaAllocator {
    limit: usize,
    in_use: AtomicUsize,
}

impl DmaAllocator {
    /// Create an allocator that hands out at most `limit` bytes at once
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Allocate a zeroed buffer of `size` bytes starting on an `align` boundary.
    ///
    /// Returns `None` when the budget is exhausted or `align` is not a power of two.
    pub fn try_alloc(self: &Arc<Self>, size: usize, align: usize) -> Option<DmaBuf> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current + size > self.limit {
                tracing::debug!(size, in_use = current, limit = self.limit, "DMA budget exhausted");
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + size,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // Over-allocate, then skip to the first aligned byte.
        let mut data = BytesMut::zeroed(size + align);
        let skip = data.as_ptr().align_offset(align);
        data.advance(skip);
        data.truncate(size);

        Some(DmaBuf {
            data,
            align,
            allocator: Arc::clone(self),
        })
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Aligned staging buffer; its bytes return to the budget on drop
pub struct DmaBuf {
    data: BytesMut,
    align: usize,
    allocator: Arc<DmaAllocator>,
}

impl DmaBuf {
    /// Alignment this buffer was allocated with
    pub fn align(&self) -> usize {
        self.align
    }

    /// Whether the first byte sits on the requested boundary
    pub fn is_aligned(&self) -> bool {
        self.data.as_ptr().align_offset(self.align) == 0
    }

    /// Overwrite the whole buffer with zeroes
    pub fn zero(&mut self) {
        self.data.fill(0);
    }
}

impl Deref for DmaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for DmaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        self.allocator.release(self.data.len());
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("len", &self.data.len())
            .field("align", &self.align)
            .finish()
    }
}
