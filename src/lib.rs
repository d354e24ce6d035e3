//! Lock-free event rings and a tick-driven timer engine for data-plane runtimes.
//!
//! Application threads arm, cancel and restart timers while the engine fires
//! them into destination queues. Neither side ever blocks the other. Every
//! hot-path operation is a bounded number of atomic compare-and-swaps on a
//! per-slot word, and returns a definite status.
//!
//! ## Escapement Example:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use escapement::{ClockSource, ErrorKind, QueueRegistryBuilder, TimeoutEvent, TimerEngine, TimerPoolBuilder};
//!
//! #[derive(Debug, PartialEq, Eq)]
//! struct SomeData(usize);
//!
//! // Destination queues come out of a fixed registry of rings
//! let registry = Arc::new(QueueRegistryBuilder::default()
//!     .with_num_rings(8)
//!     .build::<TimeoutEvent<SomeData>>());
//! let queue = registry.create().unwrap();
//!
//! // Manual clock, so this example controls time
//! let engine = TimerEngine::default();
//! let pool = engine.create_pool(TimerPoolBuilder::default()
//!     .with_name("example")
//!     .with_clock_source(ClockSource::Manual)).unwrap();
//! engine.start_pool(pool.id()).unwrap();
//!
//! let timer = pool.alloc(Arc::new(registry.queue(queue).unwrap()), 0).unwrap();
//! pool.arm(timer, 5, SomeData(5)).unwrap();
//!
//! // Tick the pool up to the target
//! engine.advance(pool.id(), 5).unwrap();
//!
//! // The event now sits in the destination queue
//! let timeout = registry.dequeue(queue).unwrap().unwrap();
//! assert_eq!(5, timeout.tick());
//! assert_eq!(SomeData(5), timeout.into_event());
//!
//! // Too late to cancel, the engine got there first
//! let result = pool.cancel(timer);
//! assert_eq!(Some(&ErrorKind::AlreadyExpired), result.as_ref().err().map(|error| error.kind()));
//! ```

#[macro_use]
extern crate log;

pub mod capability;
pub mod error;

#[cfg(feature = "future")]
pub mod future;

mod destination;
mod engine;
mod pool;
mod registry;
mod ring;
mod timer;

pub use capability::{Capabilities, ClockSource, PeriodicCapability, Resolution, ResolutionCapability};
pub use destination::Destination;
pub use engine::TimerEngine;
pub use error::{Error, ErrorKind, Result};
pub use pool::{ExpirationMode, PoolId, PoolInfo, PoolStats, PoolTicker, TimerKind, TimerPool, TimerPoolBuilder};
pub use registry::{QueueHandle, QueueRef, QueueRegistry, QueueRegistryBuilder};
pub use ring::Ring;
pub use timer::{PeriodicAck, TimeoutDestination, TimeoutEvent, TimerHandle, TimerState, MAX_TICK, TICK_INVALID};
