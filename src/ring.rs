//! Bounded single-producer/single-consumer ring of `BookUpdate` records,
//! carrying book-update events from the matching thread to the
//! market-data thread without a lock. Uses `crossbeam_utils::CachePadded`
//! for false-sharing avoidance on the head/tail cursors.
//!
//! Producer: read head with acquire, write slot, then store tail with
//! release. Consumer: read tail with acquire, read slot, then store head
//! with release. `try_push` returns false when the ring is full — the
//! engine never blocks; sizing the ring above worst-case burst size is
//! the caller's responsibility.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::engine::BookUpdate;

struct RingHeader {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    capacity: usize,
    mask: usize,
}

/// `{header, slots[capacity]}` — a shared-memory-friendly layout: the
/// slots region sits immediately after the header, so this struct could
/// be placed in a shared-memory mapping unmodified if producer and
/// consumer ever move to separate processes. In-process the ring is
/// simply owned by an `Arc`.
pub struct Ring {
    header: RingHeader,
    slots: Box<[UnsafeCell<BookUpdate>]>,
}

unsafe impl Sync for Ring {}

impl Ring {
    /// `capacity` must be a power of two.
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| {
                UnsafeCell::new(BookUpdate {
                    price: 0,
                    amount: 0,
                    side: crate::engine::BookSide::Bid,
                    kind: crate::engine::BookUpdateKind::Add,
                    level_created: false,
                    level_removed: false,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ring {
            header: RingHeader {
                head: CachePadded::new(AtomicUsize::new(0)),
                tail: CachePadded::new(AtomicUsize::new(0)),
                capacity,
                mask: capacity - 1,
            },
            slots,
        }
    }

    fn len(&self) -> usize {
        let tail = self.header.tail.load(Ordering::Acquire);
        let head = self.header.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

/// Construct a ring and split it into its single producer and single
/// consumer handles.
pub fn channel(capacity: usize) -> (Producer, Consumer) {
    let ring = Arc::new(Ring::new(capacity));
    (
        Producer {
            ring: ring.clone(),
        },
        Consumer { ring },
    )
}

/// The single producer handle (engine thread).
pub struct Producer {
    ring: Arc<Ring>,
}

// Safety: the ring's memory-ordering contract makes Producer/Consumer
// individually Send as long as only one of each exists, which `channel`
// guarantees by construction.
unsafe impl Send for Producer {}

impl Producer {
    /// Attempts to push `update`. Returns `false` when the ring is full —
    /// the producer never blocks; a drop here is a correctness bug that
    /// must be precluded by sizing the ring for worst-case bursts.
    pub fn try_push(&self, update: BookUpdate) -> bool {
        let head = self.ring.header.head.load(Ordering::Acquire);
        let tail = self.ring.header.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) == self.ring.header.capacity {
            return false;
        }
        let idx = tail & self.ring.header.mask;
        unsafe {
            *self.ring.slots[idx].get() = update;
        }
        self.ring.header.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn capacity(&self) -> usize {
        self.ring.header.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

/// The single consumer handle (market-data thread).
pub struct Consumer {
    ring: Arc<Ring>,
}

unsafe impl Send for Consumer {}

impl Consumer {
    /// Attempts to pop the oldest pending update.
    pub fn try_pop(&self) -> Option<BookUpdate> {
        let tail = self.ring.header.tail.load(Ordering::Acquire);
        let head = self.ring.header.head.load(Ordering::Relaxed);
        if head == tail {
            return None;
        }
        let idx = head & self.ring.header.mask;
        let update = unsafe { *self.ring.slots[idx].get() };
        self.ring.header.head.store(head.wrapping_add(1), Ordering::Release);
        Some(update)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BookSide, BookUpdateKind};

    fn update(price: i64) -> BookUpdate {
        BookUpdate {
            price,
            amount: 10,
            side: BookSide::Bid,
            kind: BookUpdateKind::Add,
            level_created: false,
            level_removed: false,
        }
    }

    #[test]
    fn push_pop_preserves_order() {
        let (producer, consumer) = channel(4);
        assert!(producer.try_push(update(1)));
        assert!(producer.try_push(update(2)));
        assert_eq!(consumer.try_pop().unwrap().price, 1);
        assert_eq!(consumer.try_pop().unwrap().price, 2);
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn full_ring_rejects_push() {
        let (producer, _consumer) = channel(2);
        assert!(producer.try_push(update(1)));
        assert!(producer.try_push(update(2)));
        assert!(!producer.try_push(update(3)));
    }

    #[test]
    fn pop_after_drain_then_refill_wraps_correctly() {
        let (producer, consumer) = channel(2);
        producer.try_push(update(1));
        producer.try_push(update(2));
        consumer.try_pop();
        producer.try_push(update(3));
        assert_eq!(consumer.try_pop().unwrap().price, 2);
        assert_eq!(consumer.try_pop().unwrap().price, 3);
    }
}
