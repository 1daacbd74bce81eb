//! Wait-free queue benchmarks using criterion.
//!
//! Run with: cargo bench --bench queue_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempo_runtime::scheduler::ReadyQueue;
use tempo_runtime::{WaitFreeReadQueue, WaitFreeWriteQueue};

fn bench_write_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait_free_write_queue");

    for capacity in [16usize, 256, 4096] {
        let queue = WaitFreeWriteQueue::new(capacity).unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("write_read", capacity), &capacity, |b, _| {
            b.iter(|| {
                queue.write(black_box(7u64)).unwrap();
                black_box(queue.read().unwrap())
            });
        });
    }

    let queue = WaitFreeWriteQueue::new(1).unwrap();
    queue.write(0u64).unwrap();
    group.bench_function("force_when_full", |b| {
        b.iter(|| black_box(queue.force(black_box(1u64))));
    });

    group.finish();
}

fn bench_read_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait_free_read_queue");

    for notify in [false, true] {
        let queue = WaitFreeReadQueue::new(256, notify).unwrap();
        group.bench_with_input(BenchmarkId::new("write_read", notify), &notify, |b, _| {
            b.iter(|| {
                queue.write(black_box(7u64)).unwrap();
                black_box(queue.read())
            });
        });
    }

    let empty: WaitFreeReadQueue<u64> = WaitFreeReadQueue::new(16, false).unwrap();
    group.bench_function("read_empty", |b| {
        b.iter(|| black_box(empty.read()));
    });

    group.finish();
}

fn bench_ready_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_queue");

    for levels in [1i32, 8, 28] {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::new("push_pop_256", levels), &levels, |b, &levels| {
            b.iter(|| {
                let mut queue = ReadyQueue::new();
                for i in 0..256i32 {
                    queue.push_back(11 + i % levels, i);
                }
                while let Some(item) = queue.pop_highest() {
                    black_box(item);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_queue, bench_read_queue, bench_ready_queue);
criterion_main!(benches);
