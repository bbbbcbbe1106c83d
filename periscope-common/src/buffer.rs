//! Pooled, reference-counted byte buffers
//!
//! A report is encoded once into a `BufferMut` taken from a `BufferPool`,
//! frozen into a shareable `Buffer`, and handed to every sender with
//! `retain()`. The backing `Vec<u8>` goes back to the pool when the last
//! reference is released, never earlier.

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::Arc;

/// Initial capacity of freshly allocated buffers
const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Buffers larger than this are not returned to the pool
const MAX_POOLED_CAPACITY: usize = 16 * 1024 * 1024;

struct PoolInner {
    queue: ArrayQueue<Vec<u8>>,
}

impl PoolInner {
    fn put(&self, mut data: Vec<u8>) {
        if data.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        data.clear();
        // Pool full: let the allocation go.
        let _ = self.queue.push(data);
    }
}

/// Thread-safe pool of byte vectors
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool holding at most `capacity` idle buffers
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: ArrayQueue::new(capacity.max(1)),
            }),
        }
    }

    /// Take an empty buffer from the pool, allocating if the pool is empty
    pub fn acquire(&self) -> BufferMut {
        let data = self
            .inner
            .queue
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY));
        BufferMut {
            data,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Number of idle buffers currently held by the pool
    pub fn idle(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Exclusively owned, writable buffer
pub struct BufferMut {
    data: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl BufferMut {
    /// A buffer that does not belong to any pool
    pub fn unpooled() -> Self {
        Self {
            data: Vec::new(),
            pool: None,
        }
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Make the contents immutable and shareable
    pub fn freeze(mut self) -> Buffer {
        let data = std::mem::take(&mut self.data);
        let pool = self.pool.take();
        Buffer {
            shared: Arc::new(Shared { data, pool }),
        }
    }
}

impl io::Write for BufferMut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BufferMut {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.data));
        }
    }
}

struct Shared {
    data: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Runs exactly once, after the last Buffer referencing us is gone.
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.data));
        }
    }
}

/// Immutable, reference-counted view of an encoded payload
pub struct Buffer {
    shared: Arc<Shared>,
}

impl Buffer {
    /// Wrap bytes that do not come from a pool
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            shared: Arc::new(Shared { data, pool: None }),
        }
    }

    /// Take another reference to the same bytes
    pub fn retain(&self) -> Buffer {
        Buffer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Give up this reference
    pub fn release(self) {
        drop(self);
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.shared.data
    }

    pub fn len(&self) -> usize {
        self.shared.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.data.is_empty()
    }

    /// Convert into `Bytes` without copying; the reference is released when
    /// the returned `Bytes` (and all its clones) are dropped
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
