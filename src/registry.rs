//! Fixed-capacity table of rings handed out by handle.
//!
//! Every ring is allocated once when the registry is built. Creating and
//! destroying queues only moves ring indices through a bounded lock-free free
//! list and flips the per-ring state word, so neither touches the allocator.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use escapement::{Destination, QueueRegistryBuilder};
//!
//! let registry = Arc::new(QueueRegistryBuilder::default()
//!     .with_num_rings(4)
//!     .with_ring_capacity(8)
//!     .build::<u32>());
//!
//! let handle = registry.create().unwrap();
//! let queue = registry.queue(handle).unwrap();
//!
//! queue.enqueue(7).unwrap();
//! assert_eq!(Some(7), registry.dequeue(handle).unwrap());
//!
//! registry.destroy(handle).unwrap();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::destination::Destination;
use crate::error::{Error, ErrorKind, Result};
use crate::ring::{Ring, DEFAULT_RING_CAPACITY};

/// Number of rings in a registry when none is configured.
pub const DEFAULT_NUM_RINGS: usize = 128;

const IN_USE_BIT: u64 = 1;

/// Builder for configuring a `QueueRegistry`.
#[derive(Clone, Debug)]
pub struct QueueRegistryBuilder {
    num_rings: usize,
    ring_capacity: usize
}

impl QueueRegistryBuilder {
    /// Sets the number of rings the registry can hand out at once.
    pub fn with_num_rings(mut self, num_rings: usize) -> QueueRegistryBuilder {
        self.num_rings = num_rings;
        self
    }

    /// Sets the number of slots in every ring.
    pub fn with_ring_capacity(mut self, ring_capacity: usize) -> QueueRegistryBuilder {
        self.ring_capacity = ring_capacity;
        self
    }

    /// Get the number of rings that was set.
    pub fn num_rings(&self) -> usize {
        self.num_rings
    }

    /// Get the ring capacity that was set.
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Build a new `QueueRegistry` from the current builder.
    pub fn build<T>(self) -> QueueRegistry<T> {
        self.into()
    }
}

impl Default for QueueRegistryBuilder {
    fn default() -> QueueRegistryBuilder {
        QueueRegistryBuilder{ num_rings: DEFAULT_NUM_RINGS, ring_capacity: DEFAULT_RING_CAPACITY }
    }
}

//--------------------------------------------------------------//

/// Handle to a queue created from a `QueueRegistry`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    index: u32,
    generation: u32
}

impl QueueHandle {
    /// Index of the backing ring within its registry.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct RingEntry<T> {
    ring: Ring<T>,
    // Generation in the upper bits, in-use flag in the lowest bit
    state: AtomicU64
}

/// Registry of pre-allocated rings.
pub struct QueueRegistry<T> {
    entries: Box<[RingEntry<T>]>,
    free: ArrayQueue<usize>,
    ring_capacity: usize
}

impl<T> From<QueueRegistryBuilder> for QueueRegistry<T> {
    fn from(builder: QueueRegistryBuilder) -> QueueRegistry<T> {
        assert!(builder.num_rings() > 0, "Registry must hold at least one ring");

        let entries = (0..builder.num_rings())
            .map(|_| RingEntry{ ring: Ring::with_capacity(builder.ring_capacity()), state: AtomicU64::new(0) })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free = ArrayQueue::new(builder.num_rings());
        for index in 0..builder.num_rings() {
            // Exactly num_rings pushes into a queue of that capacity
            let _ = free.push(index);
        }

        QueueRegistry{ entries: entries, free: free, ring_capacity: builder.ring_capacity() }
    }
}

impl<T> QueueRegistry<T> {
    /// Create a registry with `num_rings` rings of `ring_capacity` slots each.
    pub fn with_capacity(num_rings: usize, ring_capacity: usize) -> QueueRegistry<T> {
        QueueRegistryBuilder::default()
            .with_num_rings(num_rings)
            .with_ring_capacity(ring_capacity)
            .build()
    }

    /// Reserve a ring and hand out a handle for it.
    pub fn create(&self) -> Result<QueueHandle, ()> {
        let index = self.free.pop()
            .ok_or_else(|| Error::bare(ErrorKind::PoolExhausted))?;
        let entry = &self.entries[index];

        // Nobody can reach this ring through a handle, leftovers are from stale references
        let dropped = entry.ring.reset();
        if dropped != 0 {
            warn!("Dropped {} Items Enqueued On Ring {} After It Was Destroyed", dropped, index);
        }

        let generation = generation_of(entry.state.load(Ordering::Relaxed));
        entry.state.store(pack_state(generation, true), Ordering::Release);

        debug!("Created Queue On Ring {} (Generation {})", index, generation);
        Ok(QueueHandle{ index: index as u32, generation: generation })
    }

    /// Return a drained ring to the registry.
    pub fn destroy(&self, handle: QueueHandle) -> Result<(), QueueHandle> {
        let entry = self.entry(handle)?;

        if !entry.ring.is_empty() {
            return Err(Error::new(handle, ErrorKind::QueueNotEmpty));
        }

        let current = pack_state(handle.generation, true);
        let released = pack_state(handle.generation.wrapping_add(1), false);
        if entry.state.compare_exchange(current, released, Ordering::AcqRel, Ordering::Relaxed).is_err() {
            // Someone destroyed it between our check and now
            return Err(Error::new(handle, ErrorKind::InvalidHandle));
        }

        if self.free.push(handle.index()).is_err() {
            error!("Ring {} Could Not Be Returned To A Full Free List", handle.index());
        }

        debug!("Destroyed Queue On Ring {}", handle.index());
        Ok(())
    }

    /// Push an item onto the queue behind `handle`.
    pub fn enqueue(&self, handle: QueueHandle, item: T) -> Result<(), T> {
        let entry = match self.entry(handle) {
            Ok(entry) => entry,
            Err(_)    => return Err(Error::new(item, ErrorKind::InvalidHandle))
        };

        entry.ring.enqueue(item).map_err(|item| Error::new(item, ErrorKind::QueueFull))
    }

    /// Pop the head of the queue behind `handle`.
    pub fn dequeue(&self, handle: QueueHandle) -> Result<Option<T>, QueueHandle> {
        self.entry(handle).map(|entry| entry.ring.dequeue())
    }

    /// Approximate number of items in the queue behind `handle`.
    pub fn len(&self, handle: QueueHandle) -> Result<usize, QueueHandle> {
        self.entry(handle).map(|entry| entry.ring.len())
    }

    /// Number of rings currently handed out.
    pub fn in_use(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Number of rings in the registry.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of slots in every ring.
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    fn entry(&self, handle: QueueHandle) -> Result<&RingEntry<T>, QueueHandle> {
        let entry = self.entries.get(handle.index())
            .ok_or_else(|| Error::new(handle, ErrorKind::InvalidHandle))?;

        if entry.state.load(Ordering::Acquire) != pack_state(handle.generation, true) {
            return Err(Error::new(handle, ErrorKind::InvalidHandle));
        }

        Ok(entry)
    }
}

impl<T> QueueRegistry<T> where T: Send {
    /// Bind a handle to the registry so it can be given out as a `Destination`.
    pub fn queue(self: &Arc<Self>, handle: QueueHandle) -> Result<QueueRef<T>, QueueHandle> {
        self.entry(handle)?;

        Ok(QueueRef{ registry: self.clone(), handle: handle })
    }
}

impl<T> fmt::Debug for QueueRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .field("ring_capacity", &self.ring_capacity)
            .finish()
    }
}

fn pack_state(generation: u32, in_use: bool) -> u64 {
    ((generation as u64) << 1) | if in_use { IN_USE_BIT } else { 0 }
}

fn generation_of(state: u64) -> u32 {
    (state >> 1) as u32
}

//--------------------------------------------------------------//

/// Queue handle bound to its registry.
///
/// Cheap to clone, and usable as the destination of timers.
pub struct QueueRef<T> {
    registry: Arc<QueueRegistry<T>>,
    handle: QueueHandle
}

impl<T> QueueRef<T> {
    /// Handle of the referenced queue.
    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    /// Pop the head of the referenced queue.
    pub fn dequeue(&self) -> Result<Option<T>, QueueHandle> {
        self.registry.dequeue(self.handle)
    }

    /// Approximate number of items in the referenced queue.
    pub fn len(&self) -> Result<usize, QueueHandle> {
        self.registry.len(self.handle)
    }
}

impl<T> Clone for QueueRef<T> {
    fn clone(&self) -> QueueRef<T> {
        QueueRef{ registry: self.registry.clone(), handle: self.handle }
    }
}

impl<T> Destination<T> for QueueRef<T> where T: Send {
    fn enqueue(&self, item: T) -> ::std::result::Result<(), T> {
        self.registry.enqueue(self.handle, item).map_err(Error::into_item)
    }
}

impl<T> fmt::Debug for QueueRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueRef").field("handle", &self.handle).finish()
    }
}
