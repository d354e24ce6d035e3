//! Timer pools: configuration, the fixed timer table and its tick source.
//!
//! Pools are created through `TimerEngine::create_pool`, which validates the
//! builder against the engine's `Capabilities`. Every timer slot is allocated
//! up front; `alloc` and `free` only move indices through a bounded free list.

use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

use crate::capability::{Capabilities, ClockSource, Resolution, NSEC_PER_SEC};
use crate::error::{Error, ErrorKind, Result};
use crate::timer::{Expiration, PeriodicAck, TimeoutDestination, TimeoutEvent, TimerHandle, TimerSlot, TimerState,
                   MAX_TICK, TICK_INVALID};

const DEFAULT_RES_NS:          u64   = 1_000_000;
const DEFAULT_MAX_TMO_SECS:    u64   = 3_600;
const DEFAULT_CAPACITY:        usize = 1_024;
const DEFAULT_BASE_FREQ_HZ:    u64   = 1;
const DEFAULT_MAX_MULTIPLIER:  u64   = 1;

/// When an armed timer counts as due.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExpirationMode {
    /// Fire once the current tick reaches the target.
    After,
    /// Fire up to one tick early.
    Relaxed
}

/// Kind of timers a pool hands out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerKind {
    SingleShot,
    Periodic
}

/// Builder for configuring a `TimerPool`.
#[derive(Clone, Debug)]
pub struct TimerPoolBuilder {
    name: String,
    resolution: Resolution,
    min_timeout: Duration,
    max_timeout: Duration,
    capacity: usize,
    clock_source: ClockSource,
    private: bool,
    expiration: ExpirationMode,
    kind: TimerKind,
    base_freq_hz: u64,
    max_multiplier: u64
}

impl TimerPoolBuilder {
    /// Sets the name reported by `PoolInfo`.
    pub fn with_name(mut self, name: &str) -> TimerPoolBuilder {
        self.name = name.to_owned();
        self
    }

    /// Sets the tick resolution.
    ///
    /// Targets are expressed in ticks, so this is the granularity of every timeout.
    pub fn with_resolution(mut self, resolution: Resolution) -> TimerPoolBuilder {
        self.resolution = resolution;
        self
    }

    /// Sets the shortest distance between the current tick and a target.
    pub fn with_min_timeout(mut self, timeout: Duration) -> TimerPoolBuilder {
        self.min_timeout = timeout;
        self
    }

    /// Sets the longest distance between the current tick and a target.
    pub fn with_max_timeout(mut self, timeout: Duration) -> TimerPoolBuilder {
        self.max_timeout = timeout;
        self
    }

    /// Sets the number of timers in the pool.
    pub fn with_capacity(mut self, capacity: usize) -> TimerPoolBuilder {
        self.capacity = capacity;
        self
    }

    /// Sets where the pool takes its ticks from.
    pub fn with_clock_source(mut self, clock_source: ClockSource) -> TimerPoolBuilder {
        self.clock_source = clock_source;
        self
    }

    /// Drive the pool from its own thread instead of `TimerEngine::poll`.
    pub fn with_private(mut self, private: bool) -> TimerPoolBuilder {
        self.private = private;
        self
    }

    /// Sets when armed timers count as due.
    pub fn with_expiration_mode(mut self, expiration: ExpirationMode) -> TimerPoolBuilder {
        self.expiration = expiration;
        self
    }

    /// Sets the kind of timers the pool hands out.
    pub fn with_timer_kind(mut self, kind: TimerKind) -> TimerPoolBuilder {
        self.kind = kind;
        self
    }

    /// Sets the periodic base frequency and the largest multiplier of it a timer may run at.
    pub fn with_periodic(mut self, base_freq_hz: u64, max_multiplier: u64) -> TimerPoolBuilder {
        self.base_freq_hz = base_freq_hz;
        self.max_multiplier = max_multiplier;
        self
    }

    /// Get the name that was set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the resolution that was set.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Get the minimum timeout that was set.
    pub fn min_timeout(&self) -> Duration {
        self.min_timeout
    }

    /// Get the maximum timeout that was set.
    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Get the capacity that was set.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the clock source that was set.
    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    /// Whether the pool runs its own driver thread.
    pub fn private(&self) -> bool {
        self.private
    }

    /// Get the expiration mode that was set.
    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration
    }

    /// Get the timer kind that was set.
    pub fn timer_kind(&self) -> TimerKind {
        self.kind
    }

    /// Get the periodic base frequency that was set.
    pub fn base_freq_hz(&self) -> u64 {
        self.base_freq_hz
    }

    /// Get the largest periodic multiplier that was set.
    pub fn max_multiplier(&self) -> u64 {
        self.max_multiplier
    }
}

impl Default for TimerPoolBuilder {
    fn default() -> TimerPoolBuilder {
        TimerPoolBuilder{ name: String::new(), resolution: Resolution::Nanos(DEFAULT_RES_NS),
            min_timeout: Duration::from_nanos(0), max_timeout: Duration::from_secs(DEFAULT_MAX_TMO_SECS),
            capacity: DEFAULT_CAPACITY, clock_source: ClockSource::Monotonic, private: false,
            expiration: ExpirationMode::After, kind: TimerKind::SingleShot, base_freq_hz: DEFAULT_BASE_FREQ_HZ,
            max_multiplier: DEFAULT_MAX_MULTIPLIER }
    }
}

//--------------------------------------------------------------//

/// Identifier of a pool within its engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolId {
    index: u32,
    serial: u32
}

impl PoolId {
    #[cfg(test)]
    pub(crate) fn new(index: usize) -> PoolId {
        PoolId::with_serial(index, 0)
    }

    pub(crate) fn with_serial(index: usize, serial: u32) -> PoolId {
        PoolId{ index: index as u32, serial: serial }
    }

    /// Position of the pool in the engine's pool table.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Static description and occupancy of a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub res_ns: u64,
    pub tick_hz: u64,
    pub min_ticks: u64,
    pub max_ticks: u64,
    pub capacity: usize,
    pub in_use: usize,
    pub high_water: usize,
    pub clock_source: ClockSource,
    pub private: bool
}

/// Counters kept by the fire path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Timeouts handed to their destination.
    pub fired: u64,
    /// Timeouts dropped because the destination was full.
    pub dropped: u64,
    /// Scans over the timer table.
    pub scans: u64
}

#[derive(Default)]
struct PoolCounters {
    fired: AtomicU64,
    dropped: AtomicU64,
    scans: AtomicU64
}

/// Pool of timers sharing one resolution and tick source.
pub struct TimerPool<E> {
    id: PoolId,
    name: String,
    res_ns: u64,
    min_ticks: u64,
    max_ticks: u64,
    clock_source: ClockSource,
    private: bool,
    expiration: ExpirationMode,
    kind: TimerKind,
    base_freq_hz: u64,
    max_multiplier: u64,
    slots: Box<[TimerSlot<E>]>,
    free: ArrayQueue<usize>,
    allocated: AtomicUsize,
    high_water: AtomicUsize,
    ticks: Arc<CachePadded<AtomicU64>>,
    origin: OnceLock<Instant>,
    // Held by whichever thread is scanning the table
    scanning: AtomicBool,
    last_scan_tick: AtomicU64,
    counters: PoolCounters
}

impl<E> TimerPool<E> {
    /// Build a pool from `builder`, handing it back if it falls outside `capa`.
    pub(crate) fn new(id: PoolId, builder: TimerPoolBuilder, capa: &Capabilities) -> Result<TimerPool<E>, TimerPoolBuilder> {
        let res_ns = match validate(&builder, capa) {
            Ok(res_ns) => res_ns,
            Err(reason) => {
                debug!("Rejected Timer Pool {:?}: {}", builder.name(), reason);
                return Err(Error::new(builder, ErrorKind::CapabilityViolation));
            }
        };

        let slots = (0..builder.capacity())
            .map(|_| TimerSlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free = ArrayQueue::new(builder.capacity());
        for index in 0..builder.capacity() {
            // Exactly capacity pushes into a queue of that capacity
            let _ = free.push(index);
        }

        let min_ticks = div_ceil(duration_ns(builder.min_timeout()), res_ns);
        let max_ticks = duration_ns(builder.max_timeout()) / res_ns;

        Ok(TimerPool{ id: id, name: builder.name, res_ns: res_ns, min_ticks: min_ticks, max_ticks: max_ticks,
            clock_source: builder.clock_source, private: builder.private, expiration: builder.expiration,
            kind: builder.kind, base_freq_hz: builder.base_freq_hz, max_multiplier: builder.max_multiplier,
            slots: slots, free: free, allocated: AtomicUsize::new(0), high_water: AtomicUsize::new(0),
            ticks: Arc::new(CachePadded::new(AtomicU64::new(0))), origin: OnceLock::new(),
            scanning: AtomicBool::new(false), last_scan_tick: AtomicU64::new(TICK_INVALID),
            counters: PoolCounters::default() })
    }

    /// Identifier of the pool within its engine.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Name the pool was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of timers the pool hands out.
    pub fn timer_kind(&self) -> TimerKind {
        self.kind
    }

    /// Whether the pool runs its own driver thread.
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Whether the pool's tick source is running.
    pub fn is_started(&self) -> bool {
        self.origin.get().is_some()
    }

    /// Length of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(self.res_ns)
    }

    /// Ticker that drives a pool with a `Manual` clock source.
    pub fn ticker(&self) -> Option<PoolTicker> {
        match self.clock_source {
            ClockSource::Manual    => Some(PoolTicker{ tick_duration: self.tick_duration(), ticks: self.ticks.clone() }),
            ClockSource::Monotonic => None
        }
    }

    /// Reserve a timer whose expirations go to `destination`.
    pub fn alloc(&self, destination: TimeoutDestination<E>, user_ctx: usize) -> Result<TimerHandle, TimeoutDestination<E>> {
        let index = match self.free.pop() {
            Some(index) => index,
            None        => return Err(Error::new(destination, ErrorKind::PoolExhausted))
        };
        let slot = &self.slots[index];

        if !slot.alloc(destination.clone(), user_ctx) {
            error!("Timer {} In Pool {:?} Was On The Free List But Not Freed", index, self.name);
            return Err(Error::new(destination, ErrorKind::InvalidHandle));
        }

        let allocated = self.allocated.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(allocated, Ordering::Relaxed);

        Ok(TimerHandle::new(self.id, index, slot.generation()))
    }

    /// Release a timer, handing back its event if it was still armed.
    pub fn free(&self, handle: TimerHandle) -> Result<Option<E>, TimerHandle> {
        let slot = self.slot(handle).ok_or_else(|| Error::new(handle, ErrorKind::InvalidHandle))?;

        let opt_event = slot.free(handle.generation()).map_err(|kind| Error::new(handle, kind))?;
        self.allocated.fetch_sub(1, Ordering::AcqRel);
        if self.free.push(handle.index()).is_err() {
            error!("Timer {} Could Not Be Returned To A Full Free List", handle.index());
        }

        Ok(opt_event)
    }

    /// Arm a single shot timer to expire at tick `target`.
    ///
    /// Returns the event of an earlier arming that had not fired yet.
    pub fn arm(&self, handle: TimerHandle, target: u64, event: E) -> Result<Option<E>, E> {
        let slot = match self.single_shot_slot(handle) {
            Ok(slot)  => slot,
            Err(kind) => return Err(Error::new(event, kind))
        };

        if let Err(kind) = self.check_target(target) {
            return Err(Error::new(event, kind));
        }

        slot.arm(handle.generation(), target, event).map_err(|(event, kind)| Error::new(event, kind))
    }

    /// Arm a single shot timer to expire `ticks` from now.
    pub fn arm_rel(&self, handle: TimerHandle, ticks: u64, event: E) -> Result<Option<E>, E> {
        let target = self.current_tick().saturating_add(ticks);

        self.arm(handle, target, event)
    }

    /// Take back the event of a timer that has not fired yet.
    pub fn cancel(&self, handle: TimerHandle) -> Result<E, TimerHandle> {
        let slot = self.single_shot_slot(handle).map_err(|kind| Error::new(handle, kind))?;

        slot.cancel(handle.generation()).map_err(|kind| Error::new(handle, kind))
    }

    /// Move an armed timer to a new target, keeping its event.
    pub fn restart(&self, handle: TimerHandle, target: u64) -> Result<(), TimerHandle> {
        let slot = self.single_shot_slot(handle).map_err(|kind| Error::new(handle, kind))?;

        self.check_target(target).map_err(|kind| Error::new(handle, kind))?;
        slot.restart(handle.generation(), target).map_err(|kind| Error::new(handle, kind))
    }

    /// Move an armed timer to expire `ticks` from now.
    pub fn restart_rel(&self, handle: TimerHandle, ticks: u64) -> Result<(), TimerHandle> {
        let target = self.current_tick().saturating_add(ticks);

        self.restart(handle, target)
    }

    /// Start a periodic timer running at `base_freq_hz * multiplier`.
    ///
    /// The first occurrence lands on `first_tick`, or one period from now when
    /// it is `None`; occurrence `n` is scheduled at `first_tick + n * period`.
    pub fn periodic_start(&self, handle: TimerHandle, first_tick: Option<u64>, multiplier: u64, event: E) -> Result<(), E> {
        let slot = match self.periodic_slot(handle) {
            Ok(slot)  => slot,
            Err(kind) => return Err(Error::new(event, kind))
        };

        let period = match self.period_ticks(multiplier) {
            Some(period) => period,
            None         => return Err(Error::new(event, ErrorKind::CapabilityViolation))
        };

        let first_tick = first_tick.unwrap_or_else(|| self.current_tick().saturating_add(period));
        if let Err(kind) = self.check_target(first_tick) {
            return Err(Error::new(event, kind));
        }

        slot.periodic_start(handle.generation(), first_tick, period, event).map_err(|(event, kind)| Error::new(event, kind))
    }

    /// Hand a delivered periodic event back to its timer.
    pub fn periodic_ack(&self, handle: TimerHandle, event: E) -> Result<PeriodicAck<E>, E> {
        let slot = match self.periodic_slot(handle) {
            Ok(slot)  => slot,
            Err(kind) => return Err(Error::new(event, kind))
        };

        slot.periodic_ack(handle.generation(), event).map_err(|(event, kind)| Error::new(event, kind))
    }

    /// Stop a periodic timer; `periodic_ack` reports `Last` once the backlog is delivered.
    pub fn periodic_cancel(&self, handle: TimerHandle) -> Result<(), TimerHandle> {
        let slot = self.periodic_slot(handle).map_err(|kind| Error::new(handle, kind))?;

        slot.periodic_cancel(handle.generation(), self.current_tick()).map_err(|kind| Error::new(handle, kind))
    }

    /// Current state of a timer.
    pub fn state(&self, handle: TimerHandle) -> Result<TimerState, TimerHandle> {
        self.slot(handle)
            .map(TimerSlot::state)
            .ok_or_else(|| Error::new(handle, ErrorKind::InvalidHandle))
    }

    /// Whether a timeout still reflects its timer.
    ///
    /// A timeout goes stale once its timer is armed, cancelled, restarted or
    /// freed after the engine claimed it.
    pub fn is_fresh(&self, timeout: &TimeoutEvent<E>) -> bool {
        self.slot(timeout.timer())
            .map_or(false, |slot| slot.epoch() == timeout.epoch())
    }

    /// Current tick of the pool, zero until the pool is started.
    pub fn current_tick(&self) -> u64 {
        match (self.clock_source, self.origin.get()) {
            (ClockSource::Monotonic, Some(origin)) => {
                let elapsed = cmp::min(origin.elapsed().as_nanos(), u64::MAX as u128) as u64;
                let tick = elapsed / self.res_ns;

                cmp::max(self.ticks.fetch_max(tick, Ordering::SeqCst), tick)
            },
            _ => self.ticks.load(Ordering::SeqCst)
        }
    }

    /// Time left until the next tick boundary.
    pub(crate) fn time_to_next_tick(&self) -> Duration {
        match (self.clock_source, self.origin.get()) {
            (ClockSource::Monotonic, Some(origin)) => {
                let into_tick = (origin.elapsed().as_nanos() % self.res_ns as u128) as u64;

                Duration::from_nanos(self.res_ns - into_tick)
            },
            _ => self.tick_duration()
        }
    }

    /// Number of whole ticks in `ns` nanoseconds.
    pub fn ns_to_tick(&self, ns: u64) -> u64 {
        ns / self.res_ns
    }

    /// Nanoseconds covered by `tick` ticks.
    pub fn tick_to_ns(&self, tick: u64) -> u64 {
        tick.saturating_mul(self.res_ns)
    }

    /// Number of timers currently allocated.
    pub fn in_use(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Number of timers in the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Configuration and occupancy of the pool.
    pub fn info(&self) -> PoolInfo {
        PoolInfo{ name: self.name.clone(), res_ns: self.res_ns, tick_hz: NSEC_PER_SEC / self.res_ns,
            min_ticks: self.min_ticks, max_ticks: self.max_ticks, capacity: self.capacity(), in_use: self.in_use(),
            high_water: self.high_water.load(Ordering::Relaxed), clock_source: self.clock_source, private: self.private }
    }

    /// Snapshot of the fire path counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats{ fired: self.counters.fired.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            scans: self.counters.scans.load(Ordering::Relaxed) }
    }

    /// Record the clock origin; false if the pool was already started.
    pub(crate) fn start(&self) -> bool {
        let started = self.origin.set(Instant::now()).is_ok();
        if started {
            debug!("Started Timer Pool {:?} At {} ns Resolution", self.name, self.res_ns);
        }

        started
    }

    /// Scan the table unless another thread already is.
    ///
    /// A thread that finds a scan in progress leaves its tick to the scanning
    /// thread, which looks at the tick again after it lets go of the table and
    /// scans once more if it moved. With `skip_unchanged`, a tick that was
    /// already scanned is not scanned again.
    pub(crate) fn scan(&self, skip_unchanged: bool) -> usize {
        if !self.is_started() {
            return 0
        }

        let mut fired = 0;
        loop {
            // SeqCst pairs with the tick update of a thread that fails this exchange
            if self.scanning.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                return fired
            }

            let now = self.current_tick();
            if !skip_unchanged || self.last_scan_tick.load(Ordering::Relaxed) != now {
                self.last_scan_tick.store(now, Ordering::Relaxed);
                fired += self.fire_due(now);
            }

            self.scanning.store(false, Ordering::SeqCst);
            if self.current_tick() == now {
                return fired
            }
        }
    }

    /// Advance a manual clock by `ticks` and scan.
    pub(crate) fn advance(&self, ticks: u64) -> Result<usize, ()> {
        match self.ticker() {
            Some(ticker) => ticker.tick_by(ticks),
            None         => return Err(Error::bare(ErrorKind::CapabilityViolation))
        }

        Ok(self.scan(false))
    }

    fn fire_due(&self, now: u64) -> usize {
        let limit = match self.expiration {
            ExpirationMode::After   => now,
            ExpirationMode::Relaxed => now.saturating_add(1)
        };
        self.counters.scans.fetch_add(1, Ordering::Relaxed);

        let mut fired = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let word = slot.load();
            if !word.is_armed() || word.tick() > limit {
                continue
            }

            // Losing the claim means a cancel, re-arm or restart got there first
            if let Some(expiration) = slot.expire(word, self.id, index) {
                self.deliver(expiration);
                fired += 1;
            }
        }

        fired
    }

    fn deliver(&self, expiration: Expiration<E>) {
        let Expiration{ destination, timeout } = expiration;
        let index = timeout.timer().index();
        let tick = timeout.tick();

        trace!("Firing Timer {} In Pool {:?} For Tick {}", index, self.name, tick);
        match destination.enqueue(timeout) {
            Ok(()) => {
                self.counters.fired.fetch_add(1, Ordering::Relaxed);
            },
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Destination Full; Dropped Timeout Of Timer {} In Pool {:?} For Tick {}", index, self.name, tick);
            }
        }
    }

    fn slot(&self, handle: TimerHandle) -> Option<&TimerSlot<E>> {
        if handle.pool() != self.id {
            return None
        }

        self.slots.get(handle.index())
            .filter(|slot| slot.generation() == handle.generation())
    }

    fn single_shot_slot(&self, handle: TimerHandle) -> ::std::result::Result<&TimerSlot<E>, ErrorKind> {
        self.kind_slot(handle, TimerKind::SingleShot)
    }

    fn periodic_slot(&self, handle: TimerHandle) -> ::std::result::Result<&TimerSlot<E>, ErrorKind> {
        self.kind_slot(handle, TimerKind::Periodic)
    }

    fn kind_slot(&self, handle: TimerHandle, kind: TimerKind) -> ::std::result::Result<&TimerSlot<E>, ErrorKind> {
        let slot = self.slot(handle).ok_or(ErrorKind::InvalidHandle)?;

        if self.kind != kind {
            Err(ErrorKind::WrongTimerKind)
        } else if !self.is_started() {
            Err(ErrorKind::NotStarted)
        } else {
            Ok(slot)
        }
    }

    fn check_target(&self, target: u64) -> ::std::result::Result<(), ErrorKind> {
        let now = self.current_tick();

        if target < now.saturating_add(self.min_ticks) {
            Err(ErrorKind::TooNear)
        } else if target > now.saturating_add(self.max_ticks) || target > MAX_TICK {
            Err(ErrorKind::TooFar)
        } else {
            Ok(())
        }
    }

    fn period_ticks(&self, multiplier: u64) -> Option<u64> {
        if multiplier == 0 || multiplier > self.max_multiplier {
            return None
        }

        let period_ns = NSEC_PER_SEC.checked_div(self.base_freq_hz.checked_mul(multiplier)?)?;
        Some(period_ns / self.res_ns).filter(|&period| period > 0)
    }
}

impl<E> fmt::Debug for TimerPool<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("res_ns", &self.res_ns)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

fn validate(builder: &TimerPoolBuilder, capa: &Capabilities) -> ::std::result::Result<u64, &'static str> {
    let res_ns = builder.resolution().as_nanos().ok_or("Resolution Is Zero Or Finer Than A Nanosecond")?;
    let res_capa = capa.resolution_capability(res_ns).ok_or("Resolution Outside Supported Range")?;

    if !capa.supports_clock(builder.clock_source()) {
        return Err("Clock Source Not Supported");
    }
    if builder.capacity() == 0 || builder.capacity() > capa.max_timers() {
        return Err("Capacity Outside Supported Range");
    }

    let min_tmo_ns = duration_ns(builder.min_timeout());
    let max_tmo_ns = duration_ns(builder.max_timeout());
    if min_tmo_ns > max_tmo_ns || min_tmo_ns < res_capa.min_tmo_ns || max_tmo_ns > res_capa.max_tmo_ns {
        return Err("Timeout Bounds Outside Supported Range");
    }
    if max_tmo_ns / res_ns > MAX_TICK {
        return Err("Maximum Timeout Spans Too Many Ticks");
    }

    if builder.timer_kind() == TimerKind::Periodic {
        let periodic = capa.periodic_capability(builder.base_freq_hz(), builder.max_multiplier())
            .ok_or("Periodic Base Frequency Not Supported")?;

        if !periodic.exact {
            return Err("Periodic Multiplier Not Supported");
        }
        let fastest_ns = builder.base_freq_hz().checked_mul(builder.max_multiplier())
            .and_then(|freq_hz| NSEC_PER_SEC.checked_div(freq_hz))
            .ok_or("Periodic Frequency Out Of Range")?;
        // Fastest period has to be at least one tick long
        if fastest_ns < res_ns {
            return Err("Resolution Too Coarse For Periodic Frequency");
        }
    }

    Ok(res_ns)
}

fn duration_ns(duration: Duration) -> u64 {
    cmp::min(duration.as_nanos(), u64::MAX as u128) as u64
}

fn div_ceil(numerator: u64, denominator: u64) -> u64 {
    numerator / denominator + if numerator % denominator != 0 { 1 } else { 0 }
}

//--------------------------------------------------------------//

/// Ticker which drives a pool with a `Manual` clock source forward in time.
#[derive(Clone)]
pub struct PoolTicker {
    tick_duration: Duration,
    ticks: Arc<CachePadded<AtomicU64>>
}

impl PoolTicker {
    /// Tick duration that this ticker is supposed to operate on.
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Move the pool forward one tick.
    pub fn tick(&self) {
        self.tick_by(1);
    }

    /// Move the pool forward `ticks` ticks.
    pub fn tick_by(&self, ticks: u64) {
        let current_tick = self.ticks.fetch_add(ticks, Ordering::SeqCst);

        if current_tick.saturating_add(ticks) > MAX_TICK {
            error!("PoolTicker Passed The Largest Armable Tick; Timers Can No Longer Be Armed")
        }
    }
}

impl fmt::Debug for PoolTicker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolTicker")
            .field("tick_duration", &self.tick_duration)
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish()
    }
}
