//! Verification and cache benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resync_bench::{generate_ids, random_resource, remote_view};
use resync_core::{subset_matches, ResourceCache};

/// Benchmark subset comparison with unordered member lists.
fn bench_subset_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("subset_matches");

    for members in [0usize, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(members), members, |b, &members| {
            let desired = random_resource(16, members);
            let remote = remote_view(&desired);

            b.iter(|| {
                subset_matches(black_box(&desired), black_box(&remote)).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark cache population.
fn bench_cache_populate(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_populate");

    for count in [100usize, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let entries: Vec<_> = generate_ids(count)
                .into_iter()
                .map(|id| (id, random_resource(4, 0)))
                .collect();

            b.iter(|| {
                let cache = ResourceCache::new();
                black_box(cache.populate(entries.clone()));
            });
        });
    }
    group.finish();
}

/// Benchmark cache hits.
fn bench_cache_get(c: &mut Criterion) {
    let cache = ResourceCache::new();
    let ids = generate_ids(1000);
    cache.populate(ids.iter().map(|id| (id.clone(), random_resource(4, 0))));

    c.bench_function("cache_get", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(cache.get(&ids[i]));
        });
    });
}

criterion_group!(benches, bench_subset_matches, bench_cache_populate, bench_cache_get);
criterion_main!(benches);
