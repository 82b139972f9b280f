//! Discardable segment benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use discardable_shm::clock::{Clock, SystemClock};
use discardable_shm::memory::page_size;
use discardable_shm::DiscardableSegment;

fn bench_lock_unlock(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_unlock");

    for pages in [1, 16, 256] {
        let mut segment = DiscardableSegment::new();
        segment.create_and_map(pages * page_size()).unwrap();
        segment.unlock(0, 0);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(pages), &pages, |b, _| {
            b.iter(|| {
                assert!(segment.lock(0, 0));
                segment.unlock(0, 0);
            });
        });
    }

    group.finish();
}

fn bench_nested_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_lock");

    // One page stays locked, so every lock below skips the shared word.
    let mut segment = DiscardableSegment::new();
    segment.create_and_map(64 * page_size()).unwrap();
    segment.unlock(page_size(), 0);

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_page", |b| {
        b.iter(|| {
            assert!(segment.lock(page_size(), page_size()));
            segment.unlock(page_size(), page_size());
        });
    });

    group.finish();
}

fn bench_create_purge(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_purge");
    let clock = SystemClock::new();

    for pages in [1, 64] {
        group.throughput(Throughput::Bytes((pages * page_size()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pages), &pages, |b, &pages| {
            b.iter(|| {
                let mut segment = DiscardableSegment::new();
                segment.create_and_map(pages * page_size()).unwrap();
                segment.unlock(0, 0);
                assert!(segment.purge_and_truncate(clock.now()));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lock_unlock, bench_nested_lock, bench_create_purge);
criterion_main!(benches);
