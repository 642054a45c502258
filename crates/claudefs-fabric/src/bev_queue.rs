//! Buffer event queue: a lock-free single-producer/single-consumer circular queue.
//!
//! Entries live in a circular linked list threaded through a segmented arena,
//! so a slot's index never changes once allocated and growth never moves
//! existing entries. Two shared positions drive the queue:
//!
//! - `consumer` names the slot most recently consumed. The consumer owns that
//!   slot until its next [`BevConsumer::pop`], so the producer never reuses it.
//! - `producer` names the next slot the producer will fill.
//!
//! The queue is empty when `next(consumer) == producer` and full when
//! `producer == consumer`. Capacity therefore includes one slot that never
//! holds a pending event, which is why a queue has at least two slots.
//!
//! [`BevConsumer::append`] grows the queue by splicing a new slot in right
//! after `consumer` and moving `consumer` onto it. Only consumer state changes,
//! so growth is safe while the producer is running. Growth and `pop` both move
//! `consumer` and must not run concurrently; `&mut self` on the consumer handle
//! enforces that.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::MIN_QUEUE_CAPACITY;
use crate::error::{FabricError, FabricResult};

/// Slots in the first arena chunk; chunk `k` holds `BASE_CHUNK << k` slots.
const BASE_CHUNK: usize = 32;
/// Maximum number of arena chunks, bounding capacity at roughly 2^31 slots.
const MAX_CHUNKS: usize = 26;
const NO_LINK: usize = usize::MAX;

struct Slot<T> {
    next: AtomicUsize,
    entry: UnsafeCell<T>,
}

impl<T: Default> Slot<T> {
    fn blessed() -> Self {
        Self {
            next: AtomicUsize::new(NO_LINK),
            entry: UnsafeCell::new(T::default()),
        }
    }
}

/// Maps a slot index to its (chunk, offset) position.
fn locate(idx: usize) -> (usize, usize) {
    let n = idx / BASE_CHUNK + 1;
    let chunk = (usize::BITS - 1 - n.leading_zeros()) as usize;
    let start = BASE_CHUNK * ((1usize << chunk) - 1);
    (chunk, idx - start)
}

/// Append-only slot storage with stable indices.
struct Arena<T> {
    chunks: [OnceLock<Box<[Slot<T>]>>; MAX_CHUNKS],
    len: AtomicUsize,
}

impl<T: Default> Arena<T> {
    fn new() -> Self {
        Self {
            chunks: std::array::from_fn(|_| OnceLock::new()),
            len: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn slot(&self, idx: usize) -> &Slot<T> {
        let (chunk, offset) = locate(idx);
        match self.chunks[chunk].get() {
            Some(slots) => &slots[offset],
            None => unreachable!("slot {} lies outside the allocated arena", idx),
        }
    }

    /// Blesses one more slot. Only the consumer side calls this.
    fn push(&self) -> FabricResult<usize> {
        let idx = self.len.load(Ordering::Relaxed);
        let (chunk, offset) = locate(idx);
        if chunk >= MAX_CHUNKS {
            return Err(FabricError::OutOfMemory {
                requested: idx + 1,
                limit: idx,
            });
        }
        if offset == 0 && self.chunks[chunk].get().is_none() {
            let size = BASE_CHUNK << chunk;
            let mut slots = Vec::new();
            slots
                .try_reserve_exact(size)
                .map_err(|_| FabricError::OutOfMemory {
                    requested: idx + 1,
                    limit: idx,
                })?;
            slots.extend((0..size).map(|_| Slot::blessed()));
            let _ = self.chunks[chunk].set(slots.into_boxed_slice());
        }
        self.len.store(idx + 1, Ordering::Release);
        Ok(idx)
    }
}

struct Shared<T> {
    arena: Arena<T>,
    consumer: AtomicUsize,
    producer: AtomicUsize,
}

// Slot entries are only touched by the side that currently owns them: the
// producer writes slots in [producer, consumer) and the consumer reads the
// slot it advances onto. Ownership transfers through Release/Acquire on the
// two positions.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T: Default> Shared<T> {
    fn is_empty(&self) -> bool {
        let c = self.consumer.load(Ordering::Acquire);
        let p = self.producer.load(Ordering::Acquire);
        self.arena.slot(c).next.load(Ordering::Acquire) == p
    }

    fn is_full(&self) -> bool {
        self.producer.load(Ordering::Acquire) == self.consumer.load(Ordering::Acquire)
    }
}

/// Constructor namespace for buffer event queues.
pub struct BevQueue;

impl BevQueue {
    /// Creates an empty queue with `capacity` blessed slots, split into its two halves.
    pub fn new<T: Copy + Default + Send>(
        capacity: usize,
    ) -> FabricResult<(BevProducer<T>, BevConsumer<T>)> {
        if capacity < MIN_QUEUE_CAPACITY {
            return Err(FabricError::InvalidConfig {
                reason: format!(
                    "event queue capacity {} is below the minimum of {}",
                    capacity, MIN_QUEUE_CAPACITY
                ),
            });
        }

        let arena = Arena::new();
        for _ in 0..capacity {
            arena.push()?;
        }
        for idx in 0..capacity {
            arena
                .slot(idx)
                .next
                .store((idx + 1) % capacity, Ordering::Relaxed);
        }

        let shared = Arc::new(Shared {
            arena,
            consumer: AtomicUsize::new(0),
            producer: AtomicUsize::new(1),
        });
        let producer = BevProducer {
            shared: Arc::clone(&shared),
            reserved: None,
        };
        let consumer = BevConsumer { shared };
        Ok((producer, consumer))
    }
}

/// Producer half of a buffer event queue.
pub struct BevProducer<T> {
    shared: Arc<Shared<T>>,
    reserved: Option<usize>,
}

impl<T: Copy + Default + Send> BevProducer<T> {
    /// Returns the next free slot for the producer to fill, or `None` if the queue is full.
    ///
    /// Calling this again before [`publish`](Self::publish) returns the same slot.
    pub fn reserve_next(&mut self) -> Option<&mut T> {
        let p = self.shared.producer.load(Ordering::Relaxed);
        if p == self.shared.consumer.load(Ordering::Acquire) {
            return None;
        }
        self.reserved = Some(p);
        // SAFETY: p != consumer, so the slot is producer-owned until publish.
        Some(unsafe { &mut *self.shared.arena.slot(p).entry.get() })
    }

    /// Makes the slot returned by the last [`reserve_next`](Self::reserve_next) visible to the consumer.
    pub fn publish(&mut self) {
        let Some(p) = self.reserved.take() else {
            debug_assert!(false, "publish without a reserved slot");
            return;
        };
        let next = self.shared.arena.slot(p).next.load(Ordering::Acquire);
        self.shared.producer.store(next, Ordering::Release);
    }

    /// Returns true if no event is pending.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Returns true if the producer has no free slot.
    pub fn is_full(&self) -> bool {
        self.shared.is_full()
    }

    /// Total number of slots, including the consumer-owned one.
    pub fn size(&self) -> usize {
        self.shared.arena.len()
    }
}

/// Consumer half of a buffer event queue; also the only handle that can grow it.
pub struct BevConsumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Default + Send> BevConsumer<T> {
    /// Removes and returns the oldest pending event.
    pub fn pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let c = shared.consumer.load(Ordering::Relaxed);
        let next = shared.arena.slot(c).next.load(Ordering::Relaxed);
        if next == shared.producer.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: next precedes producer, so it was published and the
        // producer will not write it again until consumer moves past it.
        let entry = unsafe { *shared.arena.slot(next).entry.get() };
        shared.consumer.store(next, Ordering::Release);
        Some(entry)
    }

    /// Grows the queue by one blessed slot.
    pub fn append(&mut self) -> FabricResult<()> {
        let shared = &*self.shared;
        let n = shared.arena.push()?;
        let c = shared.consumer.load(Ordering::Relaxed);
        let c_slot = shared.arena.slot(c);
        shared
            .arena
            .slot(n)
            .next
            .store(c_slot.next.load(Ordering::Relaxed), Ordering::Relaxed);
        c_slot.next.store(n, Ordering::Release);
        shared.consumer.store(n, Ordering::Release);
        Ok(())
    }

    /// Returns true if no event is pending.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Returns true if the producer has no free slot.
    pub fn is_full(&self) -> bool {
        self.shared.is_full()
    }

    /// Total number of slots, including the consumer-owned one.
    pub fn size(&self) -> usize {
        self.shared.arena.len()
    }

    /// Walks the ring from the consumer and checks that it is a single cycle
    /// through every slot that passes the producer position.
    pub fn check_invariant(&self) -> bool {
        let shared = &*self.shared;
        let size = shared.arena.len();
        if size < MIN_QUEUE_CAPACITY {
            return false;
        }
        let c = shared.consumer.load(Ordering::Acquire);
        let p = shared.producer.load(Ordering::Acquire);
        let mut idx = c;
        let mut seen_producer = false;
        for _ in 0..size {
            if idx == p {
                seen_producer = true;
            }
            idx = shared.arena.slot(idx).next.load(Ordering::Acquire);
            if idx >= size {
                return false;
            }
        }
        idx == c && seen_producer
    }

    /// Tears the queue down, handing every slot's entry to `free_entry`.
    pub fn fini<F: FnMut(T)>(self, producer: BevProducer<T>, mut free_entry: F) -> FabricResult<()> {
        if !Arc::ptr_eq(&self.shared, &producer.shared) {
            return Err(FabricError::ProtocolViolation {
                reason: "queue halves belong to different queues".to_string(),
            });
        }
        drop(producer);
        let shared = &*self.shared;
        for idx in 0..shared.arena.len() {
            // SAFETY: both halves are owned here, so nothing else touches the slots.
            free_entry(unsafe { *shared.arena.slot(idx).entry.get() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produce(p: &mut BevProducer<u64>, value: u64) -> bool {
        match p.reserve_next() {
            Some(slot) => {
                *slot = value;
                p.publish();
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_locate_chunk_boundaries() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
    }

    #[test]
    fn test_capacity_below_minimum_rejected() {
        assert!(BevQueue::new::<u64>(1).is_err());
        assert!(BevQueue::new::<u64>(0).is_err());
    }

    #[test]
    fn test_minimal_queue_cycle() {
        let (mut p, mut c) = BevQueue::new::<u64>(2).unwrap();
        assert_eq!(c.size(), 2);
        assert!(c.is_empty());
        assert!(!c.is_full());
        assert!(c.check_invariant());

        assert!(produce(&mut p, 7));
        assert!(!c.is_empty());
        assert!(p.is_full());
        assert!(p.reserve_next().is_none());

        assert_eq!(c.pop(), Some(7));
        assert!(c.is_empty());
        assert!(!c.is_full());
        assert_eq!(c.pop(), None);
        assert!(c.check_invariant());
    }

    #[test]
    fn test_fifo_order_with_wraparound() {
        let (mut p, mut c) = BevQueue::new::<u64>(4).unwrap();
        let mut next_out = 0;
        for round in 0..10u64 {
            for i in 0..3 {
                assert!(produce(&mut p, round * 3 + i));
            }
            assert!(p.is_full());
            for _ in 0..3 {
                assert_eq!(c.pop(), Some(next_out));
                next_out += 1;
            }
            assert!(c.is_empty());
        }
    }

    #[test]
    fn test_reserve_is_idempotent_until_publish() {
        let (mut p, mut c) = BevQueue::new::<u64>(3).unwrap();
        *p.reserve_next().unwrap() = 1;
        *p.reserve_next().unwrap() = 2;
        assert!(c.is_empty());
        p.publish();
        assert_eq!(c.pop(), Some(2));
        assert_eq!(c.pop(), None);
    }

    #[test]
    fn test_append_while_full_keeps_pending_events() {
        let (mut p, mut c) = BevQueue::new::<u64>(2).unwrap();
        assert!(produce(&mut p, 1));
        assert!(p.is_full());

        c.append().unwrap();
        assert_eq!(c.size(), 3);
        assert!(!p.is_full());
        assert!(c.check_invariant());

        assert!(produce(&mut p, 2));
        assert!(p.is_full());
        assert_eq!(c.pop(), Some(1));
        assert_eq!(c.pop(), Some(2));
        assert_eq!(c.pop(), None);
    }

    #[test]
    fn test_append_across_chunks() {
        let (mut p, mut c) = BevQueue::new::<u64>(2).unwrap();
        for _ in 0..200 {
            c.append().unwrap();
        }
        assert_eq!(c.size(), 202);
        assert!(c.check_invariant());
        for i in 0..201 {
            assert!(produce(&mut p, i));
        }
        assert!(p.is_full());
        for i in 0..201 {
            assert_eq!(c.pop(), Some(i));
        }
        assert!(c.is_empty());
    }

    #[test]
    fn test_fini_visits_every_slot() {
        let (mut p, c) = BevQueue::new::<u64>(5).unwrap();
        assert!(produce(&mut p, 9));
        let mut freed = Vec::new();
        c.fini(p, |e| freed.push(e)).unwrap();
        assert_eq!(freed.len(), 5);
        assert!(freed.contains(&9));
    }

    #[test]
    fn test_fini_rejects_foreign_producer() {
        let (_p1, c1) = BevQueue::new::<u64>(2).unwrap();
        let (p2, _c2) = BevQueue::new::<u64>(2).unwrap();
        assert!(c1.fini(p2, |_| {}).is_err());
    }

    #[test]
    fn test_concurrent_producer_and_growing_consumer() {
        const EVENTS: u64 = 20_000;
        let (mut p, mut c) = BevQueue::new::<u64>(2).unwrap();

        let producer = std::thread::spawn(move || {
            let mut sent = 0;
            while sent < EVENTS {
                if produce(&mut p, sent) {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < EVENTS {
            if expected % 1000 == 0 && c.size() < 64 {
                c.append().unwrap();
            }
            match c.pop() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(c.is_empty());
        assert!(c.check_invariant());
    }
}
