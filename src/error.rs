//! Errors that rings, registries and timers can produce.
//!
//! Every error carries the item that the failed operation was handed, so an
//! event given to `arm` or `enqueue` is never lost on failure.

use std::error;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

/// Result type for `escapement` operations.
pub type Result<T1, T2> = ::std::result::Result<T1, Error<T2>>;

/// Error type for `escapement` operations.
pub struct Error<T> {
    item: T,
    kind: ErrorKind
}

impl<T> Error<T> {
    /// Create a new `Error`.
    pub fn new(item: T, kind: ErrorKind) -> Error<T> {
        Error{ item: item, kind: kind }
    }

    /// Retrieve the error kind of the `Error`.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Retrieve the item contained within the error.
    pub fn item(&self) -> &T {
        &self.item
    }

    /// Take back the item contained within the error.
    pub fn into_item(self) -> T {
        self.item
    }

    /// Break the error down into its parts.
    pub fn into_parts(self) -> (T, ErrorKind) {
        (self.item, self.kind)
    }

    /// Swap the contained item, keeping the kind.
    pub fn map<U, F>(self, f: F) -> Error<U> where F: FnOnce(T) -> U {
        Error{ item: f(self.item), kind: self.kind }
    }
}

impl Error<()> {
    /// Create an `Error` that carries no item.
    pub fn bare(kind: ErrorKind) -> Error<()> {
        Error::new((), kind)
    }
}

impl<T> Debug for Error<T> where T: Debug {
    fn fmt(&self, f: &mut Formatter) -> ::std::result::Result<(), fmt::Error> {
        f.write_fmt(format_args!("Error {{ item: {:?}, kind: {:?} }}", self.item, self.kind))
    }
}

impl<T> Display for Error<T> {
    fn fmt(&self, f: &mut Formatter) -> ::std::result::Result<(), fmt::Error> {
        Display::fmt(&self.kind, f)
    }
}

impl<T> error::Error for Error<T> where T: Debug {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Enumeration of `escapement` errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Pool parameters fall outside what the `Capabilities` allow.
    #[error("requested configuration exceeds platform capabilities")]
    CapabilityViolation,
    /// Target tick is closer than the pool's minimum timeout.
    #[error("expiration tick is too near")]
    TooNear,
    /// Target tick is further than the pool's maximum timeout.
    #[error("expiration tick is too far")]
    TooFar,
    /// The engine claimed the timer first; its event is on the destination queue.
    #[error("timer already expired")]
    AlreadyExpired,
    /// The timer holds no pending expiration.
    #[error("timer is not armed")]
    NotArmed,
    /// The timer already holds an event that has to come back first.
    #[error("timer already armed")]
    AlreadyArmed,
    /// The queue retry budget was exhausted.
    #[error("queue is full")]
    QueueFull,
    /// A queue can only be destroyed once drained.
    #[error("queue is not empty")]
    QueueNotEmpty,
    /// No free timer or ring slot remains.
    #[error("pool exhausted")]
    PoolExhausted,
    /// A timer pool can only be destroyed once all timers are freed.
    #[error("pool still has allocated timers")]
    PoolBusy,
    /// The pool has not been started yet.
    #[error("pool not started")]
    NotStarted,
    /// Periodic operation on a single shot pool, or the reverse.
    #[error("operation does not match the pool timer kind")]
    WrongTimerKind,
    /// Another thread kept the timer busy past the retry budget.
    #[error("timer contended")]
    Contended,
    /// Handle refers to a freed or foreign timer, queue or pool.
    #[error("invalid handle")]
    InvalidHandle
}
