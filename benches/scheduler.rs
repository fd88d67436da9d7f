//! Benchmarks for the deadline scheduler heap

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use vipcore::scheduler::{callback, ScheduledCallback, Scheduler};

fn noop() -> ScheduledCallback {
    callback(|| async { Ok(()) })
}

fn bench_schedule_once(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_once");
    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let base = Utc::now() + TimeDelta::hours(1);
            b.iter(|| {
                let scheduler = Scheduler::default();
                let cb = noop();
                for i in 0..count {
                    // Scattered deadlines with plenty of ties.
                    let offset = ((i * 7919) % 997) as i64;
                    scheduler.schedule_once(base + TimeDelta::milliseconds(offset), cb.clone());
                }
                black_box(scheduler.len())
            });
        });
    }
    group.finish();
}

fn bench_fire_due(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fire_due");
    group.measurement_time(Duration::from_secs(10));
    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let scheduler = Arc::new(Scheduler::default());
                let fired = Arc::new(AtomicUsize::new(0));
                let past = Utc::now() - TimeDelta::seconds(1);
                for _ in 0..count {
                    let fired = Arc::clone(&fired);
                    scheduler.schedule_once(
                        past,
                        callback(move || {
                            let fired = Arc::clone(&fired);
                            async move {
                                fired.fetch_add(1, Ordering::Relaxed);
                                Ok(())
                            }
                        }),
                    );
                }
                let s = Arc::clone(&scheduler);
                let task = tokio::spawn(async move { s.run().await });
                while fired.load(Ordering::Relaxed) < count {
                    tokio::task::yield_now().await;
                }
                task.abort();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_schedule_once, bench_fire_due);
criterion_main!(benches);
