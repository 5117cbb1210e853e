//! Run-queue microbenchmarks: admission and pop-min throughput.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use vmsched_rs::{Executor, ExecutorHandle, RunQueue, Scheduler, StubExecutor, StubWork};

fn handles(scheduler: &Scheduler, count: usize) -> Vec<Arc<ExecutorHandle>> {
    (0..count)
        .map(|id| {
            ExecutorHandle::new(Arc::new(StubExecutor::new(
                scheduler,
                id as u64,
                StubWork::Noop,
            )) as Arc<dyn Executor>)
        })
        .collect()
}

fn bench_insert_pop(c: &mut Criterion) {
    let scheduler = Scheduler::new(1);
    let mut group = c.benchmark_group("run_queue");

    for &count in &[16usize, 256, 4096] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("insert_pop", count),
            &count,
            |b, &count| {
                let entries = handles(&scheduler, count);
                b.iter(|| {
                    let mut queue = RunQueue::new();
                    for handle in &entries {
                        queue.insert(Arc::clone(handle));
                    }
                    while let Some(popped) = queue.pop_min() {
                        black_box(popped);
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_insert_pop);
criterion_main!(benches);
