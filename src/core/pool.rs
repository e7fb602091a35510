//! Pool of fixed-size send buffers
//!
//! A buffer is owned by exactly one party at a time: the pool while free, the
//! send queue while queued or in flight. Ownership moves by value, so a buffer
//! can never sit in the free list and the send queue at once.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

/// Fixed-capacity byte buffer with a used length.
#[derive(Debug)]
pub struct Buffer {
    seq: u64,
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    fn new(seq: u64, capacity: usize) -> Self {
        Self {
            seq,
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Allocation sequence number, stable across reuse.
    #[inline(always)]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Used bytes.
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole backing array, used or not.
    #[inline(always)]
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Append one byte. Returns `false` when full.
    #[inline]
    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.data[self.len] = byte;
        self.len += 1;
        true
    }

    /// Append as much of `src` as fits. Returns bytes copied.
    #[inline]
    pub fn extend_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

/// Counters for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub free: usize,
    pub rejected: u64,
}

/// Free list of equally sized buffers.
#[derive(Debug)]
pub struct BufferPool {
    chunk_size: usize,
    baseline: usize,
    free: Mutex<Vec<Buffer>>,
    next_seq: AtomicU64,
    rejected: AtomicU64,
}

impl BufferPool {
    pub fn new(chunk_size: usize, baseline: usize) -> Self {
        Self {
            chunk_size,
            baseline,
            free: Mutex::new(Vec::with_capacity(baseline)),
            next_seq: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Pop a free buffer, or allocate when the free list is empty.
    pub fn get_buffer(&self) -> Buffer {
        if let Some(buffer) = self.free.lock().pop() {
            return buffer;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Buffer::new(seq, self.chunk_size)
    }

    /// Zero-fill a buffer and put it back on the free list.
    ///
    /// Buffers of another size were not issued by this pool; they are logged
    /// and dropped.
    pub fn return_buffer(&self, mut buffer: Buffer) {
        if buffer.capacity() != self.chunk_size {
            error!(
                seq = buffer.seq(),
                capacity = buffer.capacity(),
                chunk_size = self.chunk_size,
                "buffer returned to a pool that did not issue it"
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buffer.reset();
        self.free.lock().push(buffer);
    }

    /// Drop free buffers above the baseline. Returns how many were released.
    pub fn clean_pool(&self) -> usize {
        let mut free = self.free.lock();
        let excess = free.len().saturating_sub(self.baseline);
        if excess > 0 {
            free.truncate(self.baseline);
            free.shrink_to(self.baseline);
            debug!(released = excess, baseline = self.baseline, "trimmed buffer pool");
        }
        excess
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.next_seq.load(Ordering::Relaxed),
            free: self.free_count(),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_after_return() {
        let pool = BufferPool::new(8, 2);
        let mut buffer = pool.get_buffer();
        let seq = buffer.seq();
        assert_eq!(buffer.extend_from(b"abc"), 3);
        pool.return_buffer(buffer);

        let again = pool.get_buffer();
        assert_eq!(again.seq(), seq);
        assert!(again.is_empty());
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_returned_buffer_is_zeroed() {
        let pool = BufferPool::new(8, 2);
        let mut buffer = pool.get_buffer();
        buffer.extend_from(&[0xFF; 8]);
        assert!(buffer.is_full());
        pool.return_buffer(buffer);

        let again = pool.get_buffer();
        assert!(again.raw().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let small = BufferPool::new(4, 1);
        let large = BufferPool::new(16, 1);
        large.return_buffer(small.get_buffer());
        assert_eq!(large.free_count(), 0);
        assert_eq!(large.stats().rejected, 1);
    }

    #[test]
    fn test_clean_pool_trims_to_baseline() {
        let pool = BufferPool::new(8, 2);
        let buffers: Vec<_> = (0..5).map(|_| pool.get_buffer()).collect();
        for buffer in buffers {
            pool.return_buffer(buffer);
        }
        assert_eq!(pool.free_count(), 5);
        assert_eq!(pool.clean_pool(), 3);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.clean_pool(), 0);
    }

    #[test]
    fn test_extend_partial() {
        let pool = BufferPool::new(4, 0);
        let mut buffer = pool.get_buffer();
        assert_eq!(buffer.extend_from(b"hello"), 4);
        assert!(!buffer.push(b'!'));
        assert_eq!(buffer.as_bytes(), b"hell");
    }
}
