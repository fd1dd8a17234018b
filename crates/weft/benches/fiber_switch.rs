use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::{Fiber, Scheduler};

fn bench_swap_round_trip(c: &mut Criterion) {
    let fiber = Fiber::new(
        || loop {
            Fiber::yield_to_hold();
        },
        0,
        false,
    );

    c.bench_function("fiber_swap_round_trip", |b| {
        b.iter(|| {
            fiber.swap_in();
            black_box(fiber.state())
        });
    });
}

fn bench_create_and_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("fiber_lifecycle");

    for stack_kib in [64usize, 1024] {
        group.bench_with_input(BenchmarkId::new("new_run", stack_kib), &stack_kib, |b, &kib| {
            b.iter(|| {
                let fiber = Fiber::new(|| {}, kib * 1024, false);
                fiber.swap_in();
                black_box(fiber.state())
            });
        });
    }

    let fiber = Fiber::new(|| {}, 0, false);
    group.bench_function("reset_run", |b| {
        b.iter(|| {
            fiber.swap_in();
            fiber.reset(|| {});
        });
    });

    group.finish();
}

fn bench_scheduler_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    const TASKS: usize = 1_000;
    group.throughput(Throughput::Elements(TASKS as u64));

    for threads in [1usize, 4] {
        group.bench_with_input(BenchmarkId::new("callbacks", threads), &threads, |b, &threads| {
            b.iter(|| {
                let scheduler = Scheduler::new(threads, false, "bench");
                scheduler.start().unwrap();
                let hits = Arc::new(AtomicUsize::new(0));
                for _ in 0..TASKS {
                    let h = hits.clone();
                    scheduler.schedule_fn(
                        move || {
                            h.fetch_add(1, Ordering::Relaxed);
                        },
                        None,
                    );
                }
                scheduler.stop();
                assert_eq!(hits.load(Ordering::Relaxed), TASKS);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_swap_round_trip, bench_create_and_run, bench_scheduler_throughput);
criterion_main!(benches);
