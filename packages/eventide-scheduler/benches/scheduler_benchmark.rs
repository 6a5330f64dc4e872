use criterion::{Criterion, black_box, criterion_group, criterion_main};
use eventide_scheduler::{EventLoop, ManualClock};
use std::rc::Rc;
use std::time::Duration;

fn benchmark_microtasks(c: &mut Criterion) {
    c.bench_function("schedule_microtask 1000", |b| {
        b.iter(|| {
            let scheduler = EventLoop::with_clock(ManualClock::new());
            for _ in 0..1000 {
                scheduler
                    .schedule_microtask(|| {
                        black_box(1 + 1);
                    })
                    .unwrap();
            }
            scheduler.run_until_idle().unwrap();
        })
    });
}

fn benchmark_macrotasks(c: &mut Criterion) {
    c.bench_function("schedule_macrotask 1000", |b| {
        b.iter(|| {
            let scheduler = EventLoop::with_clock(ManualClock::new());
            for _ in 0..1000 {
                scheduler
                    .schedule_macrotask(|| {
                        black_box(1 + 1);
                    })
                    .unwrap();
            }
            scheduler.run_until_idle().unwrap();
        })
    });
}

fn benchmark_nested_microtasks(c: &mut Criterion) {
    c.bench_function("macrotask with 10 microtasks x100", |b| {
        b.iter(|| {
            let scheduler = Rc::new(EventLoop::with_clock(ManualClock::new()));
            for _ in 0..100 {
                let sch = scheduler.clone();
                scheduler
                    .schedule_macrotask(move || {
                        for _ in 0..10 {
                            sch.schedule_microtask(|| {
                                black_box(1 + 1);
                            })
                            .unwrap();
                        }
                    })
                    .unwrap();
            }
            scheduler.run_until_idle().unwrap();
        })
    });
}

fn benchmark_timers(c: &mut Criterion) {
    c.bench_function("set_timeout 1000 reversed deadlines", |b| {
        b.iter(|| {
            let scheduler = EventLoop::with_clock(ManualClock::new());
            for delay in (0..1000).rev() {
                scheduler
                    .set_timeout(Duration::from_micros(delay), || {
                        black_box(1 + 1);
                    })
                    .unwrap();
            }
            scheduler.run_until_idle().unwrap();
        })
    });

    c.bench_function("set_timeout 1000 half cancelled", |b| {
        b.iter(|| {
            let scheduler = EventLoop::with_clock(ManualClock::new());
            let handles: Vec<_> = (0..1000)
                .map(|delay| {
                    scheduler
                        .set_timeout(Duration::from_micros(delay), || {
                            black_box(1 + 1);
                        })
                        .unwrap()
                })
                .collect();
            for handle in handles.into_iter().step_by(2) {
                scheduler.cancel(handle);
            }
            scheduler.run_until_idle().unwrap();
        })
    });
}

criterion_group!(
    benches,
    benchmark_microtasks,
    benchmark_macrotasks,
    benchmark_nested_microtasks,
    benchmark_timers
);
criterion_main!(benches);
