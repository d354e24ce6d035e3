//! Per-timer state and the claim that arbitrates between callers and the engine.
//!
//! A timer's whole lifecycle lives in one atomic state word: a tag in the low
//! bits and, while armed, the target tick in the remaining bits. Whoever moves
//! an armed word out of the ARMED state owns the pending event. Cancel, re-arm
//! and free do that through `TimerSlot::claim`, and so does the engine when it
//! fires, so exactly one of them ever gets the event.
//!
//! BUSY is a short exclusive state held while the winner moves the event in or
//! out of the slot. Nothing else reads or writes the event cell meanwhile.

use std::cell::UnsafeCell;
use std::cmp;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::destination::Destination;
use crate::error::ErrorKind;
use crate::pool::PoolId;

/// Tick value that never expires.
pub const TICK_INVALID: u64 = u64::MAX;

const TAG_BITS: u32 = 3;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Largest tick a timer can be armed for.
pub const MAX_TICK: u64 = u64::MAX >> TAG_BITS;

const TAG_IDLE:    u64 = 0;
const TAG_ARMED:   u64 = 1;
const TAG_EXPIRED: u64 = 2;
const TAG_BUSY:    u64 = 3;
const TAG_FREED:   u64 = 4;

// Attempts made while another thread holds a timer BUSY
const CLAIM_RETRIES: usize = 64;

/// Queue that a timer's expirations are delivered into.
pub type TimeoutDestination<E> = Arc<dyn Destination<TimeoutEvent<E>>>;

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct StateWord(u64);

impl StateWord {
    const IDLE:    StateWord = StateWord(TAG_IDLE);
    const EXPIRED: StateWord = StateWord(TAG_EXPIRED);
    const BUSY:    StateWord = StateWord(TAG_BUSY);
    const FREED:   StateWord = StateWord(TAG_FREED);

    fn armed(tick: u64) -> StateWord {
        debug_assert!(tick <= MAX_TICK);

        StateWord((cmp::min(tick, MAX_TICK) << TAG_BITS) | TAG_ARMED)
    }

    fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    pub(crate) fn is_armed(self) -> bool {
        self.tag() == TAG_ARMED
    }

    /// Target tick of an armed word.
    pub(crate) fn tick(self) -> u64 {
        self.0 >> TAG_BITS
    }

    fn timer_state(self) -> TimerState {
        match self.tag() {
            TAG_IDLE    => TimerState::Idle,
            TAG_ARMED   => TimerState::Armed(self.tick()),
            TAG_EXPIRED => TimerState::Expired,
            TAG_BUSY    => TimerState::Busy,
            _           => TimerState::Freed
        }
    }
}

/// Observable state of a timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerState {
    /// Allocated, holds no event.
    Idle,
    /// Holds an event that expires at the given tick.
    Armed(u64),
    /// Fired, its event went to the destination queue.
    Expired,
    /// Momentarily owned by a thread moving its event.
    Busy,
    /// Returned to the pool.
    Freed
}

//--------------------------------------------------------------//

/// Handle to a timer allocated from a `TimerPool`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pool: PoolId,
    index: u32,
    generation: u32
}

impl TimerHandle {
    pub(crate) fn new(pool: PoolId, index: usize, generation: u32) -> TimerHandle {
        TimerHandle{ pool: pool, index: index as u32, generation: generation }
    }

    /// Pool the timer was allocated from.
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Index of the timer within its pool.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

/// Expiration delivered to a timer's destination queue.
pub struct TimeoutEvent<E> {
    timer: TimerHandle,
    tick: u64,
    epoch: u64,
    user_ctx: usize,
    event: E
}

impl<E> TimeoutEvent<E> {
    /// Timer that produced this timeout.
    pub fn timer(&self) -> TimerHandle {
        self.timer
    }

    /// Expiration tick the timer was armed for.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// User context given when the timer was allocated.
    pub fn user_ctx(&self) -> usize {
        self.user_ctx
    }

    /// Event that was armed with the timer.
    pub fn event(&self) -> &E {
        &self.event
    }

    /// Mutable access to the armed event.
    pub fn event_mut(&mut self) -> &mut E {
        &mut self.event
    }

    /// Take the armed event back.
    pub fn into_event(self) -> E {
        self.event
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<E> fmt::Debug for TimeoutEvent<E> where E: fmt::Debug {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutEvent")
            .field("timer", &self.timer)
            .field("tick", &self.tick)
            .field("user_ctx", &self.user_ctx)
            .field("event", &self.event)
            .finish()
    }
}

/// Outcome of acknowledging a periodic timeout.
#[derive(Debug, PartialEq, Eq)]
pub enum PeriodicAck<E> {
    /// The timer keeps running, the next occurrence is scheduled.
    MorePending,
    /// The timer was cancelled but an occurrence due before the cancel is still coming.
    CancelledWithBacklog,
    /// Final event of a cancelled timer, handed back to the caller.
    Last(E)
}

//--------------------------------------------------------------//

pub(crate) struct Expiration<E> {
    pub(crate) destination: TimeoutDestination<E>,
    pub(crate) timeout: TimeoutEvent<E>
}

pub(crate) struct TimerSlot<E> {
    state: AtomicU64,
    generation: AtomicU32,
    // Bumped whenever the application touches the timer, stale timeouts carry an older value
    epoch: AtomicU64,
    user_ctx: AtomicUsize,
    event: UnsafeCell<Option<E>>,
    destination: UnsafeCell<Option<TimeoutDestination<E>>>,
    first_tick: AtomicU64,
    // Zero for single shot timers
    period: AtomicU64,
    occurrence: AtomicU64,
    cancel_tick: AtomicU64
}

// SAFETY: The event and destination cells are only accessed by the thread that
// moved the state word into BUSY (or that popped a FREED slot off the free list),
// and the state word publishes those accesses with release/acquire ordering.
unsafe impl<E: Send> Send for TimerSlot<E> {}
unsafe impl<E: Send> Sync for TimerSlot<E> {}

impl<E> TimerSlot<E> {
    pub(crate) fn new() -> TimerSlot<E> {
        TimerSlot{ state: AtomicU64::new(TAG_FREED), generation: AtomicU32::new(0), epoch: AtomicU64::new(0),
            user_ctx: AtomicUsize::new(0), event: UnsafeCell::new(None), destination: UnsafeCell::new(None),
            first_tick: AtomicU64::new(0), period: AtomicU64::new(0), occurrence: AtomicU64::new(0),
            cancel_tick: AtomicU64::new(TICK_INVALID) }
    }

    pub(crate) fn load(&self) -> StateWord {
        StateWord(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn state(&self) -> TimerState {
        self.load().timer_state()
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn user_ctx(&self) -> usize {
        self.user_ctx.load(Ordering::Relaxed)
    }

    /// Move an armed word to BUSY.
    ///
    /// This is the only way out of ARMED, shared by cancel, re-arm, restart, free and the
    /// engine's fire path. The caller that succeeds owns the pending event.
    pub(crate) fn claim(&self, armed: StateWord) -> bool {
        debug_assert!(armed.is_armed());

        self.transition(armed, StateWord::BUSY)
    }

    // SeqCst keeps state word updates ordered against cancel_tick for periodic cancel
    fn transition(&self, from: StateWord, to: StateWord) -> bool {
        self.state.compare_exchange(from.0, to.0, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn publish(&self, word: StateWord) {
        self.state.store(word.0, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Put back `current` if the slot was freed and reallocated since the
    /// caller's handle was checked.
    ///
    /// Generations only change while the slot is held BUSY, so a claim made
    /// through a stale handle always sees the newer generation here.
    fn release_if_stale(&self, generation: u32, current: StateWord) -> bool {
        if self.generation() == generation {
            return false
        }

        self.publish(current);
        true
    }

    /// Turn a slot popped off the free list into an idle timer.
    pub(crate) fn alloc(&self, destination: TimeoutDestination<E>, user_ctx: usize) -> bool {
        if !self.transition(StateWord::FREED, StateWord::BUSY) {
            return false
        }

        // SAFETY: We hold the slot BUSY
        unsafe {
            *self.destination.get() = Some(destination);
        }
        self.user_ctx.store(user_ctx, Ordering::Relaxed);
        self.reset_periodic();
        self.publish(StateWord::IDLE);

        true
    }

    /// Arm the timer with a new event, handing back one that was still pending.
    pub(crate) fn arm(&self, generation: u32, target: u64, event: E) -> Result<Option<E>, (E, ErrorKind)> {
        let backoff = Backoff::new();

        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            let acquired = match current.tag() {
                TAG_IDLE | TAG_EXPIRED => self.transition(current, StateWord::BUSY),
                TAG_ARMED              => self.claim(current),
                TAG_FREED              => return Err((event, ErrorKind::InvalidHandle)),
                _                      => false
            };

            if acquired {
                if self.release_if_stale(generation, current) {
                    return Err((event, ErrorKind::InvalidHandle));
                }

                self.touch();
                // SAFETY: We hold the slot BUSY
                let previous = unsafe { mem::replace(&mut *self.event.get(), Some(event)) };
                self.publish(StateWord::armed(target));

                return Ok(previous);
            }

            backoff.snooze();
        }

        Err((event, ErrorKind::Contended))
    }

    /// Reclaim the pending event if the engine has not fired the timer yet.
    pub(crate) fn cancel(&self, generation: u32) -> Result<E, ErrorKind> {
        let backoff = Backoff::new();

        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            match current.tag() {
                TAG_ARMED => {
                    if self.claim(current) {
                        if self.release_if_stale(generation, current) {
                            return Err(ErrorKind::InvalidHandle);
                        }

                        self.touch();
                        // SAFETY: We hold the slot BUSY
                        let opt_event = unsafe { (*self.event.get()).take() };
                        self.reset_periodic();
                        self.publish(StateWord::IDLE);

                        return opt_event.ok_or(ErrorKind::NotArmed);
                    }
                },
                TAG_EXPIRED => {
                    if self.generation() != generation {
                        return Err(ErrorKind::InvalidHandle);
                    }

                    // Mark the delivered timeout as stale
                    self.touch();
                    return Err(ErrorKind::AlreadyExpired);
                },
                TAG_IDLE  => return Err(ErrorKind::NotArmed),
                TAG_FREED => return Err(ErrorKind::InvalidHandle),
                _         => ()
            }

            backoff.snooze();
        }

        Err(ErrorKind::Contended)
    }

    /// Move the target of an armed timer, keeping its event.
    ///
    /// Restarting to the target the timer already has changes nothing, and a
    /// timeout delivered for that target stays fresh.
    pub(crate) fn restart(&self, generation: u32, target: u64) -> Result<(), ErrorKind> {
        let backoff = Backoff::new();

        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            match current.tag() {
                TAG_ARMED if current.tick() == target => {
                    return if self.generation() == generation { Ok(()) } else { Err(ErrorKind::InvalidHandle) };
                },
                TAG_ARMED => {
                    if self.claim(current) {
                        if self.release_if_stale(generation, current) {
                            return Err(ErrorKind::InvalidHandle);
                        }

                        self.touch();
                        self.publish(StateWord::armed(target));

                        return Ok(());
                    }
                },
                TAG_EXPIRED => {
                    if self.generation() != generation {
                        return Err(ErrorKind::InvalidHandle);
                    }

                    self.touch();
                    return Err(ErrorKind::AlreadyExpired);
                },
                TAG_IDLE  => return Err(ErrorKind::NotArmed),
                TAG_FREED => return Err(ErrorKind::InvalidHandle),
                _         => ()
            }

            backoff.snooze();
        }

        Err(ErrorKind::Contended)
    }

    /// Release the slot, handing back an event that was still pending.
    pub(crate) fn free(&self, generation: u32) -> Result<Option<E>, ErrorKind> {
        let backoff = Backoff::new();

        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            let acquired = match current.tag() {
                TAG_ARMED              => self.claim(current),
                TAG_IDLE | TAG_EXPIRED => self.transition(current, StateWord::BUSY),
                TAG_FREED              => return Err(ErrorKind::InvalidHandle),
                _                      => false
            };

            if acquired {
                if self.release_if_stale(generation, current) {
                    return Err(ErrorKind::InvalidHandle);
                }

                self.touch();
                // SAFETY: We hold the slot BUSY
                let (opt_event, opt_destination) = unsafe {
                    ((*self.event.get()).take(), (*self.destination.get()).take())
                };
                drop(opt_destination);
                self.reset_periodic();
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.publish(StateWord::FREED);

                return Ok(opt_event);
            }

            backoff.snooze();
        }

        Err(ErrorKind::Contended)
    }

    /// Fire an armed timer on behalf of the engine.
    ///
    /// Returns `None` if someone else claimed `armed` first.
    pub(crate) fn expire(&self, armed: StateWord, pool: PoolId, index: usize) -> Option<Expiration<E>> {
        // Read before the claim so a cancel that loses afterwards marks this timeout stale
        let epoch = self.epoch();

        if !self.claim(armed) {
            return None
        }

        // SAFETY: We hold the slot BUSY
        let (opt_event, opt_destination) = unsafe {
            ((*self.event.get()).take(), (*self.destination.get()).clone())
        };
        let generation = self.generation.load(Ordering::Relaxed);
        let user_ctx = self.user_ctx();
        if self.period.load(Ordering::Relaxed) != 0 {
            self.occurrence.fetch_add(1, Ordering::Relaxed);
        }
        self.publish(StateWord::EXPIRED);

        match (opt_event, opt_destination) {
            (Some(event), Some(destination)) => {
                let timeout = TimeoutEvent{ timer: TimerHandle::new(pool, index, generation), tick: armed.tick(),
                    epoch: epoch, user_ctx: user_ctx, event: event };

                Some(Expiration{ destination: destination, timeout: timeout })
            },
            _ => {
                error!("Armed Timer {} Had No Event Or Destination; Dropping Expiration", index);
                None
            }
        }
    }

    /// Arm a periodic timer for its first occurrence.
    pub(crate) fn periodic_start(&self, generation: u32, first_tick: u64, period: u64, event: E) -> Result<(), (E, ErrorKind)> {
        let backoff = Backoff::new();

        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            let acquired = match current.tag() {
                TAG_IDLE                 => self.transition(current, StateWord::BUSY),
                TAG_ARMED | TAG_EXPIRED  => return Err((event, ErrorKind::AlreadyArmed)),
                TAG_FREED                => return Err((event, ErrorKind::InvalidHandle)),
                _                        => false
            };

            if acquired {
                if self.release_if_stale(generation, current) {
                    return Err((event, ErrorKind::InvalidHandle));
                }

                self.touch();
                // SAFETY: We hold the slot BUSY
                unsafe {
                    *self.event.get() = Some(event);
                }
                self.first_tick.store(first_tick, Ordering::Relaxed);
                self.period.store(period, Ordering::Relaxed);
                self.occurrence.store(0, Ordering::Relaxed);
                self.cancel_tick.store(TICK_INVALID, Ordering::SeqCst);
                self.publish(StateWord::armed(first_tick));

                return Ok(());
            }

            backoff.snooze();
        }

        Err((event, ErrorKind::Contended))
    }

    /// Hand a delivered periodic event back and schedule the next occurrence.
    pub(crate) fn periodic_ack(&self, generation: u32, event: E) -> Result<PeriodicAck<E>, (E, ErrorKind)> {
        let backoff = Backoff::new();

        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            let acquired = match current.tag() {
                TAG_EXPIRED           => self.transition(current, StateWord::BUSY),
                TAG_IDLE | TAG_ARMED  => return Err((event, ErrorKind::NotArmed)),
                TAG_FREED             => return Err((event, ErrorKind::InvalidHandle)),
                _                     => false
            };

            if acquired {
                if self.release_if_stale(generation, current) {
                    return Err((event, ErrorKind::InvalidHandle));
                }

                let cancel_tick = self.cancel_tick.load(Ordering::SeqCst);
                let next = self.next_occurrence();

                if cancel_tick == TICK_INVALID || next <= cancel_tick {
                    // SAFETY: We hold the slot BUSY
                    unsafe {
                        *self.event.get() = Some(event);
                    }
                    self.publish(StateWord::armed(next));

                    return Ok(if cancel_tick == TICK_INVALID {
                        PeriodicAck::MorePending
                    } else {
                        PeriodicAck::CancelledWithBacklog
                    });
                }

                self.touch();
                self.reset_periodic();
                self.publish(StateWord::IDLE);

                return Ok(PeriodicAck::Last(event));
            }

            backoff.snooze();
        }

        Err((event, ErrorKind::Contended))
    }

    /// Stop scheduling occurrences after `now`.
    ///
    /// A pending occurrence further out is pulled in to `now`, so the final
    /// event arrives promptly instead of one period later.
    pub(crate) fn periodic_cancel(&self, generation: u32, now: u64) -> Result<(), ErrorKind> {
        match self.load().tag() {
            TAG_IDLE  => return Err(ErrorKind::NotArmed),
            TAG_FREED => return Err(ErrorKind::InvalidHandle),
            _         => ()
        }

        // Acks read cancel_tick after claiming the state word, so record it before looking at the state again
        let recorded = self.cancel_tick.compare_exchange(TICK_INVALID, now, Ordering::SeqCst, Ordering::SeqCst).is_ok();
        if self.generation() != generation {
            if recorded {
                let _ = self.cancel_tick.compare_exchange(now, TICK_INVALID, Ordering::SeqCst, Ordering::SeqCst);
            }
            return Err(ErrorKind::InvalidHandle);
        }

        let backoff = Backoff::new();
        for _ in 0..CLAIM_RETRIES {
            let current = self.load();
            match current.tag() {
                TAG_ARMED if current.tick() > now => {
                    if self.transition(current, StateWord::armed(now)) {
                        return Ok(());
                    }
                },
                TAG_BUSY => (),
                _        => return Ok(())
            }

            backoff.snooze();
        }

        // Whoever holds the timer saw the cancel, the final event is one period away at most
        Ok(())
    }

    fn next_occurrence(&self) -> u64 {
        let first_tick = self.first_tick.load(Ordering::Relaxed);
        let period = self.period.load(Ordering::Relaxed);
        let occurrence = self.occurrence.load(Ordering::Relaxed);

        cmp::min(first_tick.saturating_add(period.saturating_mul(occurrence)), MAX_TICK)
    }

    fn reset_periodic(&self) {
        self.period.store(0, Ordering::Relaxed);
        self.occurrence.store(0, Ordering::Relaxed);
        self.cancel_tick.store(TICK_INVALID, Ordering::SeqCst);
    }
}
