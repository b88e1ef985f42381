//! Fixed arena of reusable transmission buffers.
//!
//! Buffers live in index-addressed slots. Checking one out moves the
//! `Vec` out of its slot, so a buffer is exclusively owned by one
//! sender by construction; returning it moves it back and pushes the
//! index onto the free list. When the arena is empty (or the request
//! is larger than a pooled buffer) the pool falls back to a direct
//! allocation and counts it.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

pub const DEFAULT_POOL_BUFFERS: usize = 4;
/// Enough for a 320x240 frame plus deflate worst-case overhead.
pub const DEFAULT_POOL_BUFFER_SIZE: usize = 80 * 1024;

struct Arena {
    slots: Vec<Option<Vec<u8>>>,
    free: VecDeque<usize>,
}

/// Counters reported by [`BufferPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub checkouts: u64,
    pub fallback_allocations: u64,
}

pub struct BufferPool {
    arena: Mutex<Arena>,
    buffer_size: usize,
    checkouts: AtomicU64,
    fallbacks: AtomicU64,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        Self {
            arena: Mutex::new(Arena {
                slots: (0..count).map(|_| Some(Vec::with_capacity(buffer_size))).collect(),
                free: (0..count).collect(),
            }),
            buffer_size,
            checkouts: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An empty buffer with at least `min_size` bytes of capacity.
    pub fn checkout(&self, min_size: usize) -> PoolBuffer {
        self.checkouts.fetch_add(1, Ordering::Relaxed);

        if min_size <= self.buffer_size {
            let mut arena = self.arena();
            if let Some(index) = arena.free.pop_front() {
                if let Some(mut data) = arena.slots[index].take() {
                    data.clear();
                    return PoolBuffer {
                        handle: Some(index),
                        data,
                    };
                }
            }
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        trace!(min_size, "pool fallback allocation");
        PoolBuffer {
            handle: None,
            data: Vec::with_capacity(min_size),
        }
    }

    /// Give a buffer back. Fallback buffers are simply dropped.
    pub fn return_to_pool(&self, buffer: PoolBuffer) {
        let Some(index) = buffer.handle else {
            return;
        };
        let mut data = buffer.data;
        data.clear();
        // Deflate output may have grown the vec; keep the pool's footprint flat.
        if data.capacity() > self.buffer_size * 2 {
            data = Vec::with_capacity(self.buffer_size);
        }

        let mut arena = self.arena();
        if let Some(slot) = arena.slots.get_mut(index) {
            if slot.is_none() {
                *slot = Some(data);
                arena.free.push_back(index);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let arena = self.arena();
        PoolStats {
            capacity: arena.slots.len(),
            available: arena.free.len(),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            fallback_allocations: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_BUFFERS, DEFAULT_POOL_BUFFER_SIZE)
    }
}

/// A buffer checked out of a [`BufferPool`].
#[derive(Debug)]
pub struct PoolBuffer {
    /// Arena slot, `None` for a fallback allocation.
    handle: Option<usize>,
    data: Vec<u8>,
}

impl PoolBuffer {
    pub fn is_pooled(&self) -> bool {
        self.handle.is_some()
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Deref for PoolBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkouts_are_exclusive() {
        let pool = BufferPool::new(2, 64);
        let a = pool.checkout(10);
        let b = pool.checkout(10);
        assert!(a.is_pooled() && b.is_pooled());
        assert_ne!(a.handle, b.handle);
        assert_eq!(pool.stats().available, 0);

        let c = pool.checkout(10);
        assert!(!c.is_pooled());
        assert_eq!(pool.stats().fallback_allocations, 1);

        pool.return_to_pool(a);
        pool.return_to_pool(c);
        assert_eq!(pool.stats().available, 1);
        let d = pool.checkout(10);
        assert!(d.is_pooled());
        pool.return_to_pool(b);
        pool.return_to_pool(d);
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn oversized_request_falls_back() {
        let pool = BufferPool::new(1, 64);
        let big = pool.checkout(65);
        assert!(!big.is_pooled());
        assert!(big.capacity() >= 65);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn returned_buffers_come_back_empty() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.checkout(0);
        buf.extend_from_slice(b"stale");
        pool.return_to_pool(buf);
        assert!(pool.checkout(0).is_empty());
    }

    #[test]
    fn stats_count_checkouts() {
        let pool = BufferPool::default();
        for _ in 0..3 {
            let b = pool.checkout(1);
            pool.return_to_pool(b);
        }
        let stats = pool.stats();
        assert_eq!(stats.capacity, DEFAULT_POOL_BUFFERS);
        assert_eq!(stats.checkouts, 3);
        assert_eq!(stats.fallback_allocations, 0);
    }
}
