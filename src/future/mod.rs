//! Futures based consumption of timeouts.
//!
//! A `NotifyQueue` is a ring that wakes the task waiting on it whenever
//! something is enqueued, so an async task can sit on a timer destination
//! instead of polling it.

//! ## Retransmit Example:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use futures::executor::block_on;
//! use futures::StreamExt;
//!
//! use escapement::future::NotifyQueue;
//! use escapement::{ClockSource, TimeoutEvent, TimerEngine, TimerPoolBuilder};
//!
//! #[derive(Debug, PartialEq, Eq)]
//! enum PeerEvent {
//!     Retransmit(u32)
//! }
//!
//! let engine = TimerEngine::default();
//! let pool = engine.create_pool(TimerPoolBuilder::default()
//!     .with_clock_source(ClockSource::Manual)).unwrap();
//! engine.start_pool(pool.id()).unwrap();
//!
//! let queue = Arc::new(NotifyQueue::<TimeoutEvent<PeerEvent>>::with_capacity(16));
//! let timer = pool.alloc(queue.clone(), 0).unwrap();
//! pool.arm_rel(timer, 10, PeerEvent::Retransmit(7)).unwrap();
//!
//! engine.advance(pool.id(), 10).unwrap();
//!
//! let mut timeouts = queue.stream();
//! let timeout = block_on(timeouts.next()).unwrap();
//! assert_eq!(PeerEvent::Retransmit(7), timeout.into_event());
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use futures::Stream;

use crate::destination::Destination;
use crate::ring::{Ring, DEFAULT_RING_CAPACITY};

/// Ring that wakes a waiting task on enqueue.
pub struct NotifyQueue<T> {
    ring: Ring<T>,
    waker: AtomicWaker
}

impl<T> NotifyQueue<T> {
    /// Create a queue with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> NotifyQueue<T> {
        NotifyQueue{ ring: Ring::with_capacity(capacity), waker: AtomicWaker::new() }
    }

    /// Pop the head of the queue without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        self.ring.dequeue()
    }

    /// Approximate number of items in the queue.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the queue currently holds nothing.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Stream of the items enqueued from now on.
    ///
    /// Only one task should wait on a queue at a time; a second stream
    /// replaces the waker of the first.
    pub fn stream(self: &Arc<Self>) -> NotifyStream<T> {
        NotifyStream{ queue: self.clone() }
    }
}

impl<T> Default for NotifyQueue<T> {
    fn default() -> NotifyQueue<T> {
        NotifyQueue::with_capacity(DEFAULT_RING_CAPACITY)
    }
}

impl<T> Destination<T> for NotifyQueue<T> where T: Send {
    fn enqueue(&self, item: T) -> Result<(), T> {
        self.ring.enqueue(item)?;
        self.waker.wake();

        Ok(())
    }
}

impl<T> fmt::Debug for NotifyQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NotifyQueue")
            .field("ring", &self.ring)
            .finish()
    }
}

/// `Stream` over the items of a `NotifyQueue`.
///
/// Never terminates; it yields whenever an item arrives.
pub struct NotifyStream<T> {
    queue: Arc<NotifyQueue<T>>
}

impl<T> Stream for NotifyStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if let Some(item) = self.queue.try_dequeue() {
            return Poll::Ready(Some(item));
        }

        // Register first, then look again so an enqueue in between is not missed
        self.queue.waker.register(cx.waker());
        match self.queue.try_dequeue() {
            Some(item) => Poll::Ready(Some(item)),
            None       => Poll::Pending
        }
    }
}
