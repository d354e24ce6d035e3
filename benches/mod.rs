use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use escapement::{ClockSource, Ring, TimeoutEvent, TimerEngine, TimerPoolBuilder};

fn bench_ring_enqueue_dequeue(c: &mut Criterion) {
    let ring = Ring::with_capacity(32);

    c.bench_function("ring_enqueue_dequeue", |b| {
        b.iter(|| {
            ring.enqueue(1u64).unwrap();
            ring.dequeue().unwrap()
        })
    });
}

fn bench_arm_cancel_thousand_timers(c: &mut Criterion) {
    let engine = TimerEngine::<()>::default();
    let pool = engine.create_pool(TimerPoolBuilder::default()
        .with_clock_source(ClockSource::Manual)
        .with_capacity(1_000)).unwrap();
    engine.start_pool(pool.id()).unwrap();

    let ring = Arc::new(Ring::<TimeoutEvent<()>>::with_capacity(32));
    let timers = (0..1_000).map(|_| pool.alloc(ring.clone(), 0).unwrap()).collect::<Vec<_>>();

    c.bench_function("arm_cancel_thousand_timers", |b| {
        b.iter(|| {
            for &timer in &timers {
                pool.arm_rel(timer, 1_000, ()).unwrap();
                pool.cancel(timer).unwrap();
            }
        })
    });
}

fn bench_expire_thousand_timers(c: &mut Criterion) {
    let engine = TimerEngine::<()>::default();
    let pool = engine.create_pool(TimerPoolBuilder::default()
        .with_clock_source(ClockSource::Manual)
        .with_capacity(1_000)).unwrap();
    engine.start_pool(pool.id()).unwrap();

    let ring = Arc::new(Ring::<TimeoutEvent<()>>::with_capacity(1_024));
    let timers = (0..1_000).map(|_| pool.alloc(ring.clone(), 0).unwrap()).collect::<Vec<_>>();

    c.bench_function("expire_thousand_timers", |b| {
        b.iter(|| {
            for &timer in &timers {
                pool.arm_rel(timer, 1, ()).unwrap();
            }
            engine.advance(pool.id(), 1).unwrap();
            while ring.dequeue().is_some() {}
        })
    });
}

criterion_group!(benches, bench_ring_enqueue_dequeue, bench_arm_cancel_thousand_timers, bench_expire_thousand_timers);
criterion_main!(benches);
