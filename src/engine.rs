//! Engine that owns the timer pools and moves them forward in time.
//!
//! Private pools get a dedicated driver thread. Every other pool is driven by
//! whichever application thread calls `poll`; one thread scans a pool at a
//! time and the others skip it rather than wait.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use escapement::{ClockSource, Ring, TimeoutEvent, TimerEngine, TimerPoolBuilder};
//!
//! let engine = TimerEngine::<&'static str>::default();
//! let pool = engine.create_pool(TimerPoolBuilder::default()
//!     .with_clock_source(ClockSource::Manual)).unwrap();
//! engine.start_pool(pool.id()).unwrap();
//!
//! let queue = Arc::new(Ring::<TimeoutEvent<&str>>::with_capacity(8));
//! let timer = pool.alloc(queue.clone(), 0).unwrap();
//! pool.arm(timer, 3, "retransmit").unwrap();
//!
//! engine.advance(pool.id(), 3).unwrap();
//! assert_eq!("retransmit", queue.dequeue().unwrap().into_event());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::thread::{self, JoinHandle};

use slab::Slab;

use crate::capability::Capabilities;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::{PoolId, TimerPool, TimerPoolBuilder};

struct Driver {
    pool: PoolId,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>
}

impl Driver {
    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();

        if self.handle.join().is_err() {
            error!("Driver Thread For Pool {} Panicked", self.pool.index());
        }
    }
}

/// Owner of every timer pool, and the thing that makes their timers fire.
pub struct TimerEngine<E> {
    capa: Capabilities,
    pools: RwLock<Slab<Arc<TimerPool<E>>>>,
    serial: AtomicU32,
    drivers: Mutex<Vec<Driver>>
}

impl<E> TimerEngine<E> {
    /// Create an engine whose pools are validated against `capa`.
    pub fn new(capa: Capabilities) -> TimerEngine<E> {
        let pools = Slab::with_capacity(capa.max_pools());

        TimerEngine{ capa: capa, pools: RwLock::new(pools), serial: AtomicU32::new(0), drivers: Mutex::new(Vec::new()) }
    }

    /// Capabilities pools are validated against.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capa
    }

    /// Stop and join every driver thread.
    ///
    /// Private pools stop firing; they can be started again with `start_pool`.
    pub fn shutdown(&self) {
        let drivers = {
            let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);

            drivers.drain(..).collect::<Vec<_>>()
        };

        for driver in drivers {
            driver.stop();
        }
    }
}

impl<E> TimerEngine<E> where E: Send + 'static {
    /// Create a pool from `builder`.
    ///
    /// The pool does not tick until it is started.
    pub fn create_pool(&self, builder: TimerPoolBuilder) -> Result<Arc<TimerPool<E>>, TimerPoolBuilder> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);

        if pools.len() >= self.capa.max_pools() {
            return Err(Error::new(builder, ErrorKind::PoolExhausted));
        }

        let entry = pools.vacant_entry();
        let id = PoolId::with_serial(entry.key(), self.serial.fetch_add(1, Ordering::Relaxed));
        let pool = Arc::new(TimerPool::new(id, builder, &self.capa)?);
        entry.insert(pool.clone());

        debug!("Created Timer Pool {:?} With {} Timers", pool.name(), pool.capacity());
        Ok(pool)
    }

    /// Start the pool's tick source, spawning its driver thread if it is private.
    ///
    /// Starting a running pool does nothing.
    pub fn start_pool(&self, id: PoolId) -> Result<(), PoolId> {
        let pool = self.pool(id)?;

        let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
        let driving = drivers.iter().any(|driver| driver.pool == id);
        if (pool.start() || !driving) && pool.is_private() {
            drivers.push(spawn_driver(pool));
        }

        Ok(())
    }

    /// Start every pool that was created, returning how many were not running yet.
    pub fn start_all(&self) -> usize {
        self.pools().into_iter()
            .filter(|pool| !pool.is_started())
            .filter(|pool| self.start_pool(pool.id()).is_ok())
            .count()
    }

    /// Remove a pool whose timers have all been freed.
    pub fn destroy_pool(&self, id: PoolId) -> Result<(), PoolId> {
        {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);

            let in_use = match pools.get(id.index()) {
                Some(pool) if pool.id() == id => pool.in_use(),
                _                             => return Err(Error::new(id, ErrorKind::InvalidHandle))
            };
            if in_use != 0 {
                return Err(Error::new(id, ErrorKind::PoolBusy));
            }

            pools.remove(id.index());
        }

        let opt_driver = {
            let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);

            let opt_position = drivers.iter().position(|driver| driver.pool == id);
            opt_position.map(|position| drivers.swap_remove(position))
        };
        if let Some(driver) = opt_driver {
            driver.stop();
        }

        debug!("Destroyed Timer Pool {}", id.index());
        Ok(())
    }

    /// Look up a pool by id.
    pub fn pool(&self, id: PoolId) -> Result<Arc<TimerPool<E>>, PoolId> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);

        pools.get(id.index())
            .filter(|pool| pool.id() == id)
            .cloned()
            .ok_or_else(|| Error::new(id, ErrorKind::InvalidHandle))
    }

    /// Every pool in the engine.
    pub fn pools(&self) -> Vec<Arc<TimerPool<E>>> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);

        pools.iter().map(|(_, pool)| pool.clone()).collect()
    }

    /// Fire due timers of every started non-private pool, returning how many fired.
    ///
    /// Never blocks: pools that another thread is scanning, or whose tick has
    /// not moved since their last scan, are skipped.
    pub fn poll(&self) -> usize {
        let pools = match self.pools.try_read() {
            Ok(pools)                           => pools,
            Err(TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(TryLockError::WouldBlock)       => return 0
        };

        pools.iter()
            .filter(|(_, pool)| !pool.is_private())
            .map(|(_, pool)| pool.scan(true))
            .sum()
    }

    /// Move a pool with a `Manual` clock forward and fire what became due.
    pub fn advance(&self, id: PoolId, ticks: u64) -> Result<usize, PoolId> {
        let pool = self.pool(id)?;

        pool.advance(ticks).map_err(|error| error.map(|_| id))
    }
}

impl<E> Default for TimerEngine<E> {
    fn default() -> TimerEngine<E> {
        TimerEngine::new(Capabilities::default())
    }
}

impl<E> Drop for TimerEngine<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<E> fmt::Debug for TimerEngine<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let num_pools = self.pools.read().unwrap_or_else(PoisonError::into_inner).len();

        f.debug_struct("TimerEngine")
            .field("capabilities", &self.capa)
            .field("pools", &num_pools)
            .finish()
    }
}

fn spawn_driver<E>(pool: Arc<TimerPool<E>>) -> Driver where E: Send + 'static {
    let id = pool.id();
    let stop = Arc::new(AtomicBool::new(false));

    let thread_stop = stop.clone();
    let handle = thread::spawn(move || run_pool_driver(pool, thread_stop));

    Driver{ pool: id, stop: stop, handle: handle }
}

fn run_pool_driver<E>(pool: Arc<TimerPool<E>>, stop: Arc<AtomicBool>) {
    debug!("Driver Thread Running For Timer Pool {:?}", pool.name());

    while !stop.load(Ordering::Acquire) {
        pool.scan(true);

        // Park the thread until the next tick boundary (or until shutdown unparks us)
        thread::park_timeout(pool.time_to_next_tick());
    }

    debug!("Driver Thread Stopped For Timer Pool {:?}", pool.name());
}

#[cfg(test)]
mod tests {
    use super::TimerEngine;
    use crate::capability::{Capabilities, ClockSource};
    use crate::error::{Error, ErrorKind};
    use crate::pool::{TimerKind, TimerPoolBuilder};
    use crate::ring::Ring;
    use crate::timer::{PeriodicAck, TimeoutEvent};

    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn manual() -> TimerPoolBuilder {
        TimerPoolBuilder::default().with_clock_source(ClockSource::Manual)
    }

    fn ring() -> Arc<Ring<TimeoutEvent<u32>>> {
        Arc::new(Ring::with_capacity(8))
    }

    fn periodic() -> TimerPoolBuilder {
        // 1 ms ticks, 10 Hz timers: one occurrence every 100 ticks
        manual().with_timer_kind(TimerKind::Periodic).with_periodic(10, 1)
    }

    #[test]
    fn positive_fires_exactly_at_target() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(manual()).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.arm(timer, 5, 11).unwrap();

        for _ in 0..4 {
            assert_eq!(0, engine.advance(pool.id(), 1).unwrap());
        }
        assert!(ring.dequeue().is_none());

        assert_eq!(1, engine.advance(pool.id(), 1).unwrap());
        let timeout = ring.dequeue().unwrap();
        assert_eq!(5, timeout.tick());
        assert_eq!(11, timeout.into_event());
    }

    #[test]
    fn positive_cancel_before_fire() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(manual()).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.arm(timer, 5, 9).unwrap();

        engine.advance(pool.id(), 2).unwrap();
        assert_eq!(9, pool.cancel(timer).unwrap());

        engine.advance(pool.id(), 10).unwrap();
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn negative_cancel_after_fire() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(manual()).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.arm(timer, 5, 9).unwrap();
        engine.advance(pool.id(), 5).unwrap();

        let result = pool.cancel(timer);
        match result.as_ref().map_err(Error::kind) {
            Err(&ErrorKind::AlreadyExpired) => (),
            _                               => panic!("AlreadyExpired Not Returned")
        }

        // Exactly one copy of the event exists, and it is in the queue
        let timeout = ring.dequeue().unwrap();
        assert!(!pool.is_fresh(&timeout));
        assert_eq!(9, timeout.into_event());
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn positive_periodic_phase_lock() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(periodic()).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.periodic_start(timer, Some(50), 1, 0).unwrap();

        engine.advance(pool.id(), 50).unwrap();
        for occurrence in 0..10 {
            let timeout = ring.dequeue().unwrap();
            assert_eq!(50 + occurrence * 100, timeout.tick());
            assert!(ring.dequeue().is_none());

            match pool.periodic_ack(timer, timeout.into_event()).unwrap() {
                PeriodicAck::MorePending => (),
                _                        => panic!("MorePending Not Returned")
            }
            engine.advance(pool.id(), 100).unwrap();
        }
    }

    #[test]
    fn positive_periodic_late_ack_keeps_schedule() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(periodic()).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.periodic_start(timer, Some(100), 1, 0).unwrap();

        engine.advance(pool.id(), 100).unwrap();
        let timeout = ring.dequeue().unwrap();

        // Nothing fires while the event is out, however long that takes
        engine.advance(pool.id(), 350).unwrap();
        assert!(ring.dequeue().is_none());

        pool.periodic_ack(timer, timeout.into_event()).unwrap();
        engine.advance(pool.id(), 0).unwrap();
        assert_eq!(200, ring.dequeue().unwrap().tick());
    }

    #[test]
    fn positive_periodic_terminates_once() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(periodic()).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.periodic_start(timer, None, 1, 7).unwrap();

        engine.advance(pool.id(), 100).unwrap();
        let timeout = ring.dequeue().unwrap();
        pool.periodic_cancel(timer).unwrap();

        let mut lasts = 0;
        let mut event = timeout.into_event();
        loop {
            match pool.periodic_ack(timer, event).unwrap() {
                PeriodicAck::Last(last) => {
                    assert_eq!(7, last);
                    lasts += 1;
                    break
                },
                _ => {
                    engine.advance(pool.id(), 1).unwrap();
                    event = ring.dequeue().unwrap().into_event();
                }
            }
        }
        assert_eq!(1, lasts);

        engine.advance(pool.id(), 1_000).unwrap();
        assert!(ring.dequeue().is_none());

        let result = pool.periodic_ack(timer, 7);
        match result.as_ref().map_err(Error::kind) {
            Err(&ErrorKind::NotArmed) => (),
            _                         => panic!("NotArmed Not Returned")
        }
        assert_eq!(None, pool.free(timer).unwrap());
    }

    #[test]
    fn positive_poll_drives_monotonic_pool() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(TimerPoolBuilder::default()).unwrap();
        assert_eq!(1, engine.start_all());

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.arm_rel(timer, 2, 1).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ring.is_empty() && Instant::now() < deadline {
            engine.poll();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(1, ring.dequeue().unwrap().into_event());
    }

    #[test]
    fn positive_private_pool_fires_without_poll() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(TimerPoolBuilder::default().with_private(true)).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = ring();
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.arm_rel(timer, 5, 1).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ring.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(1, ring.dequeue().unwrap().into_event());

        pool.free(timer).unwrap();
        engine.destroy_pool(pool.id()).unwrap();
    }

    #[test]
    fn negative_destroy_busy_pool() {
        let engine = TimerEngine::<u32>::default();
        let pool = engine.create_pool(manual()).unwrap();
        let timer = pool.alloc(ring(), 0).unwrap();

        let result = engine.destroy_pool(pool.id());
        match result.as_ref().map_err(Error::kind) {
            Err(&ErrorKind::PoolBusy) => (),
            _                         => panic!("PoolBusy Not Returned")
        }

        pool.free(timer).unwrap();
        engine.destroy_pool(pool.id()).unwrap();

        let result = engine.pool(pool.id());
        match result.as_ref().map(|_| ()).map_err(Error::kind) {
            Err(&ErrorKind::InvalidHandle) => (),
            _                              => panic!("InvalidHandle Not Returned")
        }
    }

    #[test]
    fn negative_reused_slot_rejects_old_id() {
        let engine = TimerEngine::<u32>::default();
        let old = engine.create_pool(manual()).unwrap().id();
        engine.destroy_pool(old).unwrap();

        let new = engine.create_pool(manual()).unwrap().id();
        assert_eq!(old.index(), new.index());
        assert!(engine.pool(old).is_err());
        assert!(engine.advance(old, 1).is_err());
    }

    #[test]
    fn negative_max_pools() {
        let engine = TimerEngine::<u32>::new(Capabilities::default().with_max_pools(1));
        engine.create_pool(manual()).unwrap();

        let result = engine.create_pool(manual());
        match result.as_ref().map(|_| ()).map_err(Error::kind) {
            Err(&ErrorKind::PoolExhausted) => (),
            _                              => panic!("PoolExhausted Not Returned")
        }
    }
}
