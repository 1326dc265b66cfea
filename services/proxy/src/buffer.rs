//! Reusable copy buffers.
//!
//! Forwarding tasks check a buffer out for the lifetime of their copy loop
//! and hand it back when the guard drops. Acquisition never waits: an empty
//! pool allocates. Returned buffers are kept only up to `max_idle`, so idle
//! memory is bounded while in-use memory follows the connection count.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

/// Default size of a single copy buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Default number of idle buffers retained for reuse.
pub const DEFAULT_MAX_IDLE: usize = 1024;

#[derive(Debug)]
struct PoolInner {
    idle: SegQueue<Vec<u8>>,
    buffer_size: usize,
    max_idle: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

/// A lock-free pool of fixed-size byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the default buffer size and idle limit.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE)
    }

    /// Create a pool with custom buffer size and idle limit.
    pub fn with_capacity(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: SegQueue::new(),
                buffer_size: buffer_size.max(1),
                max_idle,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a buffer. Never blocks.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = match self.inner.idle.pop() {
            Some(buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buffer_size]
            }
        };

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Get pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            idle: self.inner.idle.len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for a buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocated: u64,
    pub reused: u64,
    pub idle: usize,
}

/// A checked-out buffer; returns itself to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if self.pool.idle.len() < self.pool.max_idle {
                self.pool.idle.push(buf);
            }
        }
    }
}
