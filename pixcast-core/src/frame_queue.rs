//! Bounded single-producer / single-consumer frame ring.
//!
//! The renderer fills pre-allocated frame buffers through a
//! [`FrameProducer`]; the network side drains them through a
//! [`FrameConsumer`]. Nothing here ever blocks the producer: a full
//! ring is reported as `None` and the caller skips that frame.
//!
//! ```text
//!            write_index (producer only)
//!                 │
//!   ┌────────┬────▼───┐
//!   │ slot 0 │ slot 1 │   slot = index % depth
//!   └────▲───┴────────┘
//!        │
//!   read_index (consumer only)      count = write_index - read_index
//! ```
//!
//! Both counters are monotonic atomics published with release stores
//! and observed with acquire loads, so slot contents written before a
//! `submit` are visible to the consumer that sees the new count. Each
//! slot also sits behind its own (uncontended) mutex.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Default ring depth: simple double buffering.
pub const DEFAULT_DEPTH: usize = 2;

struct Shared {
    slots: Box<[Mutex<Box<[u8]>>]>,
    write_index: AtomicU64,
    read_index: AtomicU64,
    ready: Notify,
    frame_len: usize,
}

impl Shared {
    fn depth(&self) -> u64 {
        self.slots.len() as u64
    }

    fn count(&self) -> usize {
        let written = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        written.saturating_sub(read) as usize
    }

    fn slot(&self, index: u64) -> MutexGuard<'_, Box<[u8]>> {
        let i = (index % self.depth()) as usize;
        self.slots[i].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Constructor namespace for the producer / consumer pair.
pub struct FrameQueue;

impl FrameQueue {
    /// Allocate `depth` buffers of `frame_len` bytes each and split
    /// the ring into its two halves.
    ///
    /// # Panics
    ///
    /// Panics if `depth` or `frame_len` is zero.
    pub fn new(depth: usize, frame_len: usize) -> (FrameProducer, FrameConsumer) {
        assert!(depth > 0, "frame queue depth must be non-zero");
        assert!(frame_len > 0, "frame length must be non-zero");

        let slots = (0..depth)
            .map(|_| Mutex::new(vec![0u8; frame_len].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(Shared {
            slots,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            ready: Notify::new(),
            frame_len,
        });

        (
            FrameProducer {
                shared: Arc::clone(&shared),
                pending: false,
            },
            FrameConsumer { shared },
        )
    }
}

// ── Producer ─────────────────────────────────────────────────────

/// Renderer-side half. Every method is O(1) and non-blocking.
pub struct FrameProducer {
    shared: Arc<Shared>,
    /// A slot was handed out and not yet submitted.
    pending: bool,
}

impl FrameProducer {
    /// Borrow the next free buffer, or `None` when all `depth` slots
    /// hold unreleased frames.
    ///
    /// The buffer keeps whatever the slot held last time; the caller
    /// is expected to overwrite all of it.
    pub fn acquire_write_slot(&mut self) -> Option<WriteSlot<'_>> {
        if self.shared.count() as u64 >= self.shared.depth() {
            return None;
        }
        let index = self.shared.write_index.load(Ordering::Relaxed);
        self.pending = true;
        Some(WriteSlot {
            guard: self.shared.slot(index),
        })
    }

    /// Publish the slot returned by the last
    /// [`acquire_write_slot`](Self::acquire_write_slot).
    ///
    /// Returns `false` (and does nothing) if no slot is pending.
    pub fn submit(&mut self) -> bool {
        if !std::mem::take(&mut self.pending) {
            return false;
        }
        self.shared.write_index.fetch_add(1, Ordering::Release);
        self.shared.ready.notify_one();
        true
    }

    /// Outstanding (submitted, unreleased) frames.
    pub fn len(&self) -> usize {
        self.shared.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Ring depth.
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Size of every frame buffer in bytes.
    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }
}

// ── Consumer ─────────────────────────────────────────────────────

/// Network-side half.
pub struct FrameConsumer {
    shared: Arc<Shared>,
}

impl FrameConsumer {
    /// The oldest unreleased frame, left in place.
    pub fn peek_next(&mut self) -> Option<ReadSlot<'_>> {
        if self.shared.count() == 0 {
            return None;
        }
        let index = self.shared.read_index.load(Ordering::Relaxed);
        Some(ReadSlot {
            guard: self.shared.slot(index),
        })
    }

    /// Hand the oldest frame's slot back to the producer.
    ///
    /// Returns `false` when there was nothing to release.
    pub fn release(&mut self) -> bool {
        if self.shared.count() == 0 {
            return false;
        }
        self.shared.read_index.fetch_add(1, Ordering::Release);
        true
    }

    /// Wait until at least one frame is available.
    pub async fn ready(&mut self) {
        loop {
            if self.shared.count() > 0 {
                return;
            }
            self.shared.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }
}

// ── Slot guards ──────────────────────────────────────────────────

/// Mutable view of a slot being filled by the producer.
pub struct WriteSlot<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl Deref for WriteSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// Read-only view of the oldest queued frame.
pub struct ReadSlot<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl Deref for ReadSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fill(producer: &mut FrameProducer, value: u8) -> bool {
        let filled = match producer.acquire_write_slot() {
            Some(mut slot) => {
                slot.fill(value);
                true
            }
            None => false,
        };
        filled && producer.submit()
    }

    #[test]
    fn backpressure_after_depth_submits() {
        let (mut producer, mut consumer) = FrameQueue::new(DEFAULT_DEPTH, 16);

        assert!(fill(&mut producer, 1));
        assert!(fill(&mut producer, 2));
        assert!(producer.is_full());
        assert!(producer.acquire_write_slot().is_none());

        assert!(consumer.release());
        assert!(producer.acquire_write_slot().is_some());
    }

    #[test]
    fn frames_come_out_in_submission_order() {
        let (mut producer, mut consumer) = FrameQueue::new(3, 4);

        for v in 1..=3 {
            assert!(fill(&mut producer, v));
        }
        for v in 1..=3 {
            let slot = consumer.peek_next().expect("frame available");
            assert!(slot.iter().all(|&b| b == v));
            drop(slot);
            assert!(consumer.release());
        }
        assert!(consumer.peek_next().is_none());
    }

    #[test]
    fn peek_does_not_remove() {
        let (mut producer, mut consumer) = FrameQueue::new(2, 4);
        fill(&mut producer, 7);

        assert_eq!(consumer.peek_next().unwrap()[0], 7);
        assert_eq!(consumer.peek_next().unwrap()[0], 7);
        assert_eq!(consumer.len(), 1);
    }

    #[test]
    fn release_on_empty_is_noop() {
        let (producer, mut consumer) = FrameQueue::new(2, 4);
        assert!(!consumer.release());
        assert_eq!(producer.len(), 0);
    }

    #[test]
    fn submit_without_acquire_is_noop() {
        let (mut producer, consumer) = FrameQueue::new(2, 4);
        assert!(!producer.submit());
        assert!(consumer.is_empty());

        // A single acquire allows a single submit.
        drop(producer.acquire_write_slot());
        assert!(producer.submit());
        assert!(!producer.submit());
        assert_eq!(consumer.len(), 1);
    }

    #[test]
    fn slots_wrap_around() {
        let (mut producer, mut consumer) = FrameQueue::new(2, 1);
        for round in 0..10u8 {
            assert!(fill(&mut producer, round));
            assert_eq!(consumer.peek_next().unwrap()[0], round);
            assert!(consumer.release());
        }
    }

    #[tokio::test]
    async fn ready_wakes_on_submit_from_another_thread() {
        let (mut producer, mut consumer) = FrameQueue::new(2, 8);

        let renderer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            fill(&mut producer, 0xAB)
        });

        tokio::time::timeout(Duration::from_secs(2), consumer.ready())
            .await
            .expect("consumer woke");
        assert!(renderer.join().unwrap());
        assert_eq!(consumer.peek_next().unwrap()[0], 0xAB);
    }
}
