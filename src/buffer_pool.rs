//! Read-buffer pooling for the dispatcher threads.
//!
//! Each event loop owns exactly one [`BufferPool`] and passes it by `&mut` into
//! the socket read path, so the pool needs no locking. A read borrows the pooled
//! region, the filled prefix is split off with [`BytesMut::split_to`] and handed
//! to the connection's read queue, and the untouched suffix goes straight back
//! into the pool. Both halves keep pointing into the same allocation, which is
//! released once the last view of it is dropped.

use std::cmp;

use bytes::{Bytes, BytesMut};
use tracing::trace;

pub const DEFAULT_PREALLOCATION_SIZE: usize = 64 * 1024;
pub const DEFAULT_MIN_BUFFER_SIZE: usize = 64;

/// Growth factor applied to a request that does not fit the preallocation size.
const GROWTH_FACTOR: usize = 10;

pub struct BufferPool {
    pooled: Option<BytesMut>,
    preallocation_size: usize,
    min_buffer_size: usize,
    allocations: u64,
    allocated_bytes: u64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_PREALLOCATION_SIZE, DEFAULT_MIN_BUFFER_SIZE)
    }
}

impl BufferPool {
    pub fn new(preallocation_size: usize, min_buffer_size: usize) -> Self {
        Self {
            pooled: None,
            preallocation_size,
            min_buffer_size: cmp::max(1, min_buffer_size),
            allocations: 0,
            allocated_bytes: 0,
        }
    }

    /// Lends out a buffer whose window holds at least `min_size` bytes.
    ///
    /// The pooled region is used when it is large enough; otherwise it is
    /// dropped and a region of `max(preallocation_size, min_size * 10)` bytes
    /// is allocated.
    pub fn acquire(&mut self, min_size: usize) -> BytesMut {
        if let Some(buffer) = self.pooled.take() {
            if buffer.len() >= min_size {
                return buffer;
            }
        }

        let size = cmp::max(
            self.preallocation_size,
            min_size.saturating_mul(GROWTH_FACTOR),
        );
        self.allocate(cmp::max(size, 1))
    }

    /// Returns an unused buffer. Remainders smaller than the minimum buffer
    /// size are not worth keeping and are dropped.
    pub fn recycle(&mut self, buffer: BytesMut) {
        if buffer.len() < self.min_buffer_size {
            return;
        }
        match &self.pooled {
            Some(current) if current.len() >= buffer.len() => {}
            _ => self.pooled = Some(buffer),
        }
    }

    /// Splits a buffer that just received `read` bytes into the filled prefix,
    /// which is returned, and the free suffix, which is pooled again.
    pub fn extract_used_and_recycle_remainder(&mut self, mut buffer: BytesMut, read: usize) -> Bytes {
        if read == 0 {
            self.recycle(buffer);
            return Bytes::new();
        }

        let used = buffer.split_to(cmp::min(read, buffer.len())).freeze();
        if !buffer.is_empty() {
            self.recycle(buffer);
        }
        used
    }

    pub fn min_buffer_size(&self) -> usize {
        self.min_buffer_size
    }

    pub fn preallocation_size(&self) -> usize {
        self.preallocation_size
    }

    /// Window size of the currently pooled region, if any.
    pub fn pooled_len(&self) -> Option<usize> {
        self.pooled.as_ref().map(BytesMut::len)
    }

    /// Number of fresh regions allocated so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    fn allocate(&mut self, size: usize) -> BytesMut {
        self.allocations += 1;
        self.allocated_bytes += size as u64;
        trace!(
            size,
            allocations = self.allocations,
            preallocation_size = self.preallocation_size,
            "allocating read buffer"
        );
        BytesMut::zeroed(size)
    }
}
