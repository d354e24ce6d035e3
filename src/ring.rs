//! Bounded multi-producer multi-consumer ring of atomic slots.
//!
//! Each slot pairs a sequence word with a payload cell. A sequence of zero
//! marks an empty slot, any other published value orders the payload relative
//! to other producers. The slot with the lowest published sequence is the
//! logical head of the ring, so ordering is approximately FIFO without a shared
//! head or tail index.
//!
//! ```rust
//! use escapement::Ring;
//!
//! let ring = Ring::with_capacity(4);
//!
//! ring.enqueue("first").unwrap();
//! ring.enqueue("second").unwrap();
//!
//! assert_eq!(Some("first"), ring.dequeue());
//! assert_eq!(Some("second"), ring.dequeue());
//! assert_eq!(None, ring.dequeue());
//! ```

use std::cell::UnsafeCell;
use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

use crate::destination::Destination;

/// Number of slots in a ring when none is configured.
pub const DEFAULT_RING_CAPACITY: usize = 32;

// Sequence value of an empty slot
const EMPTY:          u64 = 0;
// Sequence value while a single producer or consumer owns the payload cell
const RESERVED:       u64 = u64::MAX;
const FIRST_SEQUENCE: u64 = 1;

struct RingSlot<T> {
    sequence: AtomicU64,
    payload:  UnsafeCell<Option<T>>
}

impl<T> RingSlot<T> {
    fn new() -> RingSlot<T> {
        RingSlot{ sequence: AtomicU64::new(EMPTY), payload: UnsafeCell::new(None) }
    }
}

/// Bounded lock-free ring.
///
/// Neither `enqueue` nor `dequeue` blocks; both give up after a retry budget
/// derived from the capacity and report a definite status.
pub struct Ring<T> {
    slots:       Box<[RingSlot<T>]>,
    enq_counter: CachePadded<AtomicU64>,
    enq_retries: usize,
    deq_retries: usize
}

// SAFETY: A payload cell is only touched by the thread that moved its slot into
// the RESERVED state, and the sequence word publishes the write with release
// ordering before any other thread can observe the payload.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a new `Ring` with the given number of slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Ring<T> {
        assert!(capacity > 0, "Ring capacity must be greater than zero");

        let slots = (0..capacity).map(|_| RingSlot::new()).collect::<Vec<_>>().into_boxed_slice();

        Ring{ slots: slots, enq_counter: CachePadded::new(AtomicU64::new(FIRST_SEQUENCE)),
            enq_retries: cmp::max(capacity / 4, 1), deq_retries: cmp::max(capacity / 8, 1) }
    }

    /// Attempt to push an item onto the ring.
    ///
    /// The item is handed back if no empty slot could be claimed within the
    /// retry budget. This is a liveness bound, so a ring under heavy contention
    /// may report full while a slot is momentarily free.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let sequence = self.enq_counter.fetch_add(1, Ordering::Relaxed);
        debug_assert!(sequence != RESERVED, "Ring Sequence Counter Reached The Reserved Value");

        let backoff = Backoff::new();
        let mut index = 0;

        for _ in 0..self.enq_retries {
            // Find an empty slot, continuing after the last one we looked at
            let mut opt_found = None;
            for _ in 0..self.slots.len() {
                let candidate = index;
                index = self.next_index(index);

                if self.slots[candidate].sequence.load(Ordering::Acquire) == EMPTY {
                    opt_found = Some(candidate);
                    break;
                }
            }

            let slot = match opt_found {
                Some(found) => &self.slots[found],
                None        => return Err(item)
            };

            if slot.sequence.compare_exchange(EMPTY, RESERVED, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                // SAFETY: RESERVED gives us exclusive access to the payload cell
                unsafe {
                    *slot.payload.get() = Some(item);
                }
                slot.sequence.store(sequence, Ordering::Release);

                return Ok(());
            }

            // Another producer beat us to that slot
            backoff.spin();
        }

        Err(item)
    }

    /// Attempt to pop the item at the logical head of the ring.
    ///
    /// Returns `None` if the ring looked empty or every attempt lost a race to
    /// another consumer.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();

        for _ in 0..self.deq_retries {
            // Find the head, the published slot with the lowest sequence
            let mut opt_head = None;
            let mut lowest = RESERVED;
            for (index, slot) in self.slots.iter().enumerate() {
                let sequence = slot.sequence.load(Ordering::Acquire);

                if is_published(sequence) && sequence < lowest {
                    lowest = sequence;
                    opt_head = Some(index);
                }
            }

            let head_index = match opt_head {
                Some(head_index) => head_index,
                None             => return None
            };

            // Producers may have landed a lower sequence in the part we scanned before finding the head
            let mut lowest_index = head_index;
            for (index, slot) in self.slots[..head_index].iter().enumerate() {
                let sequence = slot.sequence.load(Ordering::Acquire);

                if is_published(sequence) && sequence < lowest {
                    lowest = sequence;
                    lowest_index = index;
                }
            }

            let slot = &self.slots[lowest_index];
            if slot.sequence.compare_exchange(lowest, RESERVED, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                // SAFETY: RESERVED gives us exclusive access to the payload cell
                let opt_item = unsafe { (*slot.payload.get()).take() };
                slot.sequence.store(EMPTY, Ordering::Release);

                return opt_item;
            }

            // Another consumer took the head first
            backoff.spin();
        }

        None
    }

    /// Approximate number of occupied slots.
    ///
    /// Concurrent producers and consumers make this a snapshot at best.
    pub fn len(&self) -> usize {
        self.slots.iter()
            .filter(|slot| slot.sequence.load(Ordering::Relaxed) != EMPTY)
            .count()
    }

    /// Whether the ring looked empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the ring holds.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drain every item and restart the sequence counter.
    ///
    /// Only meaningful while no other thread uses the ring, the registry calls
    /// this when handing a ring out again. Returns the number of items dropped.
    pub(crate) fn reset(&self) -> usize {
        let mut dropped = 0;
        while self.dequeue().is_some() {
            dropped += 1;
        }
        self.enq_counter.store(FIRST_SEQUENCE, Ordering::Relaxed);

        dropped
    }

    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;

        if next == self.slots.len() { 0 } else { next }
    }
}

fn is_published(sequence: u64) -> bool {
    sequence != EMPTY && sequence != RESERVED
}

impl<T> Destination<T> for Ring<T> where T: Send {
    fn enqueue(&self, item: T) -> Result<(), T> {
        Ring::enqueue(self, item)
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
