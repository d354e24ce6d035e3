//! The single operation the timer engine needs from a queue.

use std::fmt;
use std::sync::Arc;

/// Queue that expiration events can be delivered into.
///
/// Implementations must not block. A full queue hands the item back so the
/// caller decides what to do with it; the timer engine counts it as a dropped
/// expiration.
pub trait Destination<T>: Send + Sync {
    /// Attempt to push an item onto the queue.
    fn enqueue(&self, item: T) -> Result<(), T>;
}

impl<T, D> Destination<T> for Arc<D> where D: Destination<T> + ?Sized {
    fn enqueue(&self, item: T) -> Result<(), T> {
        (**self).enqueue(item)
    }
}

impl<'a, T, D> Destination<T> for &'a D where D: Destination<T> + ?Sized {
    fn enqueue(&self, item: T) -> Result<(), T> {
        (**self).enqueue(item)
    }
}

impl<T> fmt::Debug for dyn Destination<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Destination")
    }
}
