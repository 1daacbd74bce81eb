//! Event fire benchmarks using criterion.
//!
//! Run with: cargo bench --bench fire_bench

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempo_runtime::{
    AsyncEventHandler, MinimumInterarrivalPolicy, QueueOverflowPolicy, ReleaseParameters, ReleaseRunner, RtResult,
    Runtime,
};

/// Runner that discards releases so the benchmark measures the fire path only.
#[derive(Debug)]
struct DiscardRunner;

impl ReleaseRunner for DiscardRunner {
    fn attach(&self, _handler: &Arc<AsyncEventHandler>) -> RtResult<()> {
        Ok(())
    }

    fn detach(&self, _handler: &AsyncEventHandler) {}

    fn release(&self, handler: Arc<AsyncEventHandler>) {
        handler.get_and_clear_pending_fire_count();
    }

    fn shutdown(&self) {}
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = Runtime::new(Default::default()).unwrap();
    let mut group = c.benchmark_group("fire_fan_out");

    for handlers in [1usize, 8, 64] {
        let event = rt.event();
        let attached: Vec<_> = (0..handlers)
            .map(|_| {
                let params = ReleaseParameters::aperiodic();
                params.set_overflow_policy(QueueOverflowPolicy::Replace).unwrap();
                params.set_initial_queue_length(4).unwrap();
                let handler = rt
                    .handler(|_| Ok(()))
                    .release(params)
                    .runner(Arc::new(DiscardRunner))
                    .build()
                    .unwrap();
                event.add_handler(&handler);
                handler
            })
            .collect();

        group.throughput(Throughput::Elements(handlers as u64));
        group.bench_with_input(BenchmarkId::new("fire_long", handlers), &handlers, |b, _| {
            b.iter(|| event.fire_long(black_box(42)).unwrap());
        });
        drop(attached);
    }

    group.finish();
}

fn bench_rejections(c: &mut Criterion) {
    let rt = Runtime::new(Default::default()).unwrap();
    let mut group = c.benchmark_group("fire_rejected");

    let event = rt.event();
    let params = ReleaseParameters::sporadic(Duration::from_secs(3600)).unwrap();
    params.set_mit_violation_policy(MinimumInterarrivalPolicy::Ignore).unwrap();
    let handler = rt
        .handler(|_| Ok(()))
        .release(params)
        .runner(Arc::new(DiscardRunner))
        .build()
        .unwrap();
    event.add_handler(&handler);
    event.fire().unwrap();

    group.bench_function("mit_ignored", |b| {
        b.iter(|| event.fire().unwrap());
    });

    event.disable();
    group.bench_function("disabled", |b| {
        b.iter(|| event.fire().unwrap());
    });

    group.finish();
}

fn bench_release_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new(Default::default()).unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handler = rt
        .handler(move |_| {
            let _ = tx.send(());
            Ok(())
        })
        .build()
        .unwrap();

    c.bench_function("release_to_completion", |b| {
        b.iter(|| {
            handler.release().unwrap();
            rx.recv().unwrap();
        });
    });
}

criterion_group!(benches, bench_fan_out, bench_rejections, bench_release_roundtrip);
criterion_main!(benches);
