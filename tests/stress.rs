use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use escapement::{ClockSource, Destination, ErrorKind, PeriodicAck, Ring, TimeoutEvent, TimerEngine, TimerKind,
                 TimerPoolBuilder, TimerState};

const NUM_TIMERS:     usize = 64;
const NUM_WORKERS:    usize = 4;
const OPS_PER_WORKER: usize = 20_000;

#[test]
fn positive_events_are_conserved_under_contention() {
    let engine = TimerEngine::<usize>::default();
    let pool = engine.create_pool(TimerPoolBuilder::default()
        .with_clock_source(ClockSource::Manual)
        .with_capacity(NUM_TIMERS)).unwrap();
    engine.start_pool(pool.id()).unwrap();

    let ring = Arc::new(Ring::<TimeoutEvent<usize>>::with_capacity(4 * NUM_TIMERS));
    let timers = (0..NUM_TIMERS)
        .map(|user_ctx| pool.alloc(ring.clone(), user_ctx).unwrap())
        .collect::<Vec<_>>();

    let armed = AtomicU64::new(0);
    let reclaimed = AtomicU64::new(0);
    let delivered = AtomicU64::new(0);
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                engine.advance(pool.id(), 1).unwrap();
                thread::yield_now();
            }
        });

        scope.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                match ring.dequeue() {
                    Some(_) => { delivered.fetch_add(1, Ordering::Relaxed); },
                    None    => thread::yield_now()
                }
            }
        });

        let mut workers = Vec::with_capacity(NUM_WORKERS);
        for worker in 0..NUM_WORKERS {
            let (timers, pool, armed, reclaimed) = (&timers, &pool, &armed, &reclaimed);

            workers.push(scope.spawn(move || {
                let mut rng = rand::rng();

                for op in 0..OPS_PER_WORKER {
                    let timer = timers[rng.random_range(0..NUM_TIMERS)];

                    match rng.random_range(0..3) {
                        0 => match pool.arm_rel(timer, rng.random_range(1..4), worker * OPS_PER_WORKER + op) {
                            Ok(opt_previous) => {
                                armed.fetch_add(1, Ordering::Relaxed);
                                if opt_previous.is_some() {
                                    reclaimed.fetch_add(1, Ordering::Relaxed);
                                }
                            },
                            // The tick moved under us, or another worker held the timer
                            Err(error) => match *error.kind() {
                                ErrorKind::TooNear | ErrorKind::Contended => (),
                                kind                                      => panic!("Unexpected Arm Error {:?}", kind)
                            }
                        },
                        1 => {
                            if pool.cancel(timer).is_ok() {
                                reclaimed.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        _ => {
                            let _ = pool.restart_rel(timer, rng.random_range(1..4));
                        }
                    }
                }
            }));
        }

        for worker in workers {
            worker.join().unwrap();
        }
        stop.store(true, Ordering::Release);
    });

    // Whatever is still armed comes back through cancel, whatever fired is in the ring
    for &timer in &timers {
        if pool.cancel(timer).is_ok() {
            reclaimed.fetch_add(1, Ordering::Relaxed);
        }
    }
    while ring.dequeue().is_some() {
        delivered.fetch_add(1, Ordering::Relaxed);
    }

    let dropped = pool.stats().dropped;
    assert_eq!(armed.load(Ordering::Relaxed),
        delivered.load(Ordering::Relaxed) + reclaimed.load(Ordering::Relaxed) + dropped);

    for timer in timers {
        pool.free(timer).unwrap();
    }
    engine.destroy_pool(pool.id()).unwrap();
}

#[test]
fn positive_concurrent_pollers_fire_each_timer_once() {
    let engine = TimerEngine::<usize>::default();
    let pool = engine.create_pool(TimerPoolBuilder::default()
        .with_capacity(NUM_TIMERS)).unwrap();
    engine.start_pool(pool.id()).unwrap();

    let ring = Arc::new(Ring::<TimeoutEvent<usize>>::with_capacity(2 * NUM_TIMERS));
    for user_ctx in 0..NUM_TIMERS {
        let timer = pool.alloc(ring.clone(), user_ctx).unwrap();
        pool.arm_rel(timer, 5, user_ctx).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    thread::scope(|scope| {
        for _ in 0..NUM_WORKERS {
            scope.spawn(|| {
                while pool.stats().fired < NUM_TIMERS as u64 && Instant::now() < deadline {
                    engine.poll();
                    thread::yield_now();
                }
            });
        }
    });

    let mut seen = vec![false; NUM_TIMERS];
    while let Some(timeout) = ring.dequeue() {
        assert_eq!(timeout.user_ctx(), *timeout.event());
        assert!(!seen[timeout.user_ctx()], "Timer Fired Twice");
        seen[timeout.user_ctx()] = true;
    }

    assert!(seen.iter().all(|&fired| fired));
    assert_eq!(NUM_TIMERS as u64, pool.stats().fired);
    assert_eq!(0, pool.stats().dropped);
}

/// Destination that takes its time with every delivery.
struct SlowQueue {
    ring: Ring<TimeoutEvent<usize>>,
    entered: AtomicBool,
    delay: Duration
}

impl SlowQueue {
    fn new(delay: Duration) -> SlowQueue {
        SlowQueue{ ring: Ring::with_capacity(4), entered: AtomicBool::new(false), delay: delay }
    }
}

impl Destination<TimeoutEvent<usize>> for SlowQueue {
    fn enqueue(&self, item: TimeoutEvent<usize>) -> Result<(), TimeoutEvent<usize>> {
        self.entered.store(true, Ordering::Release);
        thread::sleep(self.delay);

        self.ring.enqueue(item)
    }
}

#[test]
fn positive_advance_during_scan_is_not_lost() {
    let engine = TimerEngine::<usize>::default();
    let pool = engine.create_pool(TimerPoolBuilder::default()
        .with_clock_source(ClockSource::Manual)).unwrap();
    engine.start_pool(pool.id()).unwrap();

    let slow = Arc::new(SlowQueue::new(Duration::from_millis(200)));
    let fast = Arc::new(Ring::<TimeoutEvent<usize>>::with_capacity(4));
    let first = pool.alloc(slow.clone(), 0).unwrap();
    let second = pool.alloc(fast.clone(), 1).unwrap();

    pool.arm(first, 1, 0).unwrap();
    pool.arm(second, 2, 1).unwrap();

    thread::scope(|scope| {
        let scanner = scope.spawn(|| engine.advance(pool.id(), 1).unwrap());

        // Second tick lands while the first scan is stuck delivering
        while !slow.entered.load(Ordering::Acquire) {
            thread::yield_now();
        }
        engine.advance(pool.id(), 1).unwrap();

        scanner.join().unwrap();
    });

    assert_eq!(TimerState::Expired, pool.state(second).unwrap());
    assert_eq!(2, fast.dequeue().unwrap().tick());
    assert_eq!(1, slow.ring.dequeue().unwrap().tick());
}

#[test]
fn positive_concurrent_advancers_and_pollers_fire_every_due_timer() {
    const ADVANCERS: usize = 2;

    let engine = TimerEngine::<usize>::default();
    let pool = engine.create_pool(TimerPoolBuilder::default()
        .with_clock_source(ClockSource::Manual)
        .with_capacity(NUM_TIMERS)).unwrap();
    engine.start_pool(pool.id()).unwrap();

    let ring = Arc::new(Ring::<TimeoutEvent<usize>>::with_capacity(2 * NUM_TIMERS));
    for user_ctx in 0..NUM_TIMERS {
        let timer = pool.alloc(ring.clone(), user_ctx).unwrap();
        pool.arm(timer, user_ctx as u64 + 1, user_ctx).unwrap();
    }

    let advancing = AtomicU64::new(ADVANCERS as u64);
    thread::scope(|scope| {
        for _ in 0..ADVANCERS {
            scope.spawn(|| {
                for _ in 0..NUM_TIMERS / ADVANCERS {
                    engine.advance(pool.id(), 1).unwrap();
                    thread::yield_now();
                }
                advancing.fetch_sub(1, Ordering::AcqRel);
            });
        }

        for _ in 0..NUM_WORKERS {
            scope.spawn(|| {
                while advancing.load(Ordering::Acquire) != 0 {
                    engine.poll();
                    thread::yield_now();
                }
            });
        }
    });

    let mut seen = vec![false; NUM_TIMERS];
    while let Some(timeout) = ring.dequeue() {
        assert_eq!(timeout.user_ctx() as u64 + 1, timeout.tick());
        assert!(!seen[timeout.user_ctx()], "Timer Fired Twice");
        seen[timeout.user_ctx()] = true;
    }

    assert!(seen.iter().all(|&fired| fired));
    assert_eq!(NUM_TIMERS as u64, pool.stats().fired);
}

#[test]
fn positive_periodic_cancel_during_driving_ends_once() {
    for _ in 0..50 {
        let engine = TimerEngine::<usize>::default();
        // 1 ms ticks, 100 Hz timers: one occurrence every 10 ticks
        let pool = engine.create_pool(TimerPoolBuilder::default()
            .with_clock_source(ClockSource::Manual)
            .with_timer_kind(TimerKind::Periodic)
            .with_periodic(100, 1)).unwrap();
        engine.start_pool(pool.id()).unwrap();

        let ring = Arc::new(Ring::<TimeoutEvent<usize>>::with_capacity(16));
        let timer = pool.alloc(ring.clone(), 0).unwrap();
        pool.periodic_start(timer, None, 1, 7).unwrap();

        let delivered = AtomicU64::new(0);
        let done = AtomicBool::new(false);
        let mut lasts = 0;

        thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    engine.advance(pool.id(), 1).unwrap();
                    thread::yield_now();
                }
            });

            scope.spawn(|| {
                while delivered.load(Ordering::Acquire) < 3 && !done.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                pool.periodic_cancel(timer).unwrap();
            });

            let deadline = Instant::now() + Duration::from_secs(10);
            while lasts == 0 && Instant::now() < deadline {
                let mut event = match ring.dequeue() {
                    Some(timeout) => timeout.into_event(),
                    None          => { thread::yield_now(); continue },
                };
                delivered.fetch_add(1, Ordering::AcqRel);

                let ack = loop {
                    match pool.periodic_ack(timer, event) {
                        Ok(ack)    => break ack,
                        Err(error) => match *error.kind() {
                            ErrorKind::Contended => event = error.into_item(),
                            kind                 => panic!("Unexpected Ack Error {:?}", kind)
                        }
                    }
                };

                if let PeriodicAck::Last(event) = ack {
                    assert_eq!(7, event);
                    lasts += 1;
                }
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(1, lasts);

        // Nothing follows the last event
        engine.advance(pool.id(), 1_000).unwrap();
        assert!(ring.dequeue().is_none());
        assert_eq!(TimerState::Idle, pool.state(timer).unwrap());
    }
}
