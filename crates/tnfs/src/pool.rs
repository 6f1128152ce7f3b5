//! Bounded pool of reusable message buffers.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;

/// Default number of buffers kept for reuse
pub const DEFAULT_POOL_ENTRIES: usize = 32;

struct Inner {
    max_entries: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// Shared pool of byte buffers.
///
/// `acquire` hands out the smallest pooled buffer large enough for the
/// request. When none fits, a new buffer is allocated; if the pool is full at
/// that point its largest entry is evicted to make room for the newcomer on
/// release.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new(max_entries: usize) -> Self {
        BufferPool {
            inner: Arc::new(Inner {
                max_entries,
                free: Mutex::new(Vec::with_capacity(max_entries)),
            }),
        }
    }

    /// Check out a buffer exposing exactly `size` bytes. Contents are unspecified.
    pub fn acquire(&self, size: usize) -> BufferLease {
        let buf = {
            let mut free = self.inner.free.lock();
            let best = free
                .iter()
                .enumerate()
                .filter(|(_, b)| b.capacity() >= size)
                .min_by_key(|(_, b)| b.capacity())
                .map(|(i, _)| i);

            match best {
                Some(i) => Some(free.swap_remove(i)),
                None => {
                    if !free.is_empty() && free.len() >= self.inner.max_entries {
                        let largest = free
                            .iter()
                            .enumerate()
                            .max_by_key(|(_, b)| b.capacity())
                            .map(|(i, _)| i);
                        if let Some(i) = largest {
                            free.swap_remove(i);
                        }
                    }
                    None
                }
            }
        };

        let mut buf = buf.unwrap_or_else(|| Vec::with_capacity(size));
        buf.resize(size, 0);

        BufferLease {
            buf: Some(buf),
            size,
            pool: self.inner.clone(),
        }
    }

    /// Number of buffers currently pooled
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn max_entries(&self) -> usize {
        self.inner.max_entries
    }

    /// Capacities of the pooled buffers
    pub fn capacities(&self) -> Vec<usize> {
        self.inner.free.lock().iter().map(Vec::capacity).collect()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_ENTRIES)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_entries", &self.inner.max_entries)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dereferences to exactly the requested number of bytes. Returned to the
/// pool on drop.
pub struct BufferLease {
    buf: Option<Vec<u8>>,
    size: usize,
    pool: Arc<Inner>,
}

impl BufferLease {
    /// Return the buffer to its pool. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max_entries {
                free.push(buf);
            }
        }
    }

    /// Requested size of this lease
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity of the backing buffer
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::capacity)
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.buf {
            Some(ref buf) => &buf[..self.size],
            None => &[],
        }
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.buf {
            Some(ref mut buf) => &mut buf[..self.size],
            None => &mut [],
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}
