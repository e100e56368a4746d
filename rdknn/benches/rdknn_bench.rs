//! RdKNN tree benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdknn::{ObjectId, Point, RdKnnSettings, RdKnnTree};
use std::hint::black_box;
use tempfile::tempdir;

fn random_points(n: usize) -> Vec<(ObjectId, Point)> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n as u64)
        .map(|id| {
            let p = Point::from([rng.gen_range(0.0..1000.0), rng.gen_range(0.0..1000.0)]);
            (id, p)
        })
        .collect()
}

fn settings() -> RdKnnSettings {
    RdKnnSettings::builder().k_max(4).build().unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("RdKnnTree Insert");
    group.sample_size(10);

    for size in [100, 1000, 5000].iter() {
        let points = random_points(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &points, |b, points| {
            b.iter_with_setup(
                || RdKnnTree::in_memory(settings()).unwrap(),
                |tree| {
                    for (id, p) in points {
                        tree.insert(*id, p.clone()).unwrap();
                    }
                    black_box(tree.len())
                },
            );
        });
    }

    group.finish();
}

fn bench_bulk_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("RdKnnTree Bulk Load");
    group.sample_size(10);

    for size in [1000, 10000].iter() {
        let points = random_points(*size);
        group.bench_with_input(BenchmarkId::new("memory", size), &points, |b, points| {
            b.iter_with_setup(
                || RdKnnTree::in_memory(settings()).unwrap(),
                |tree| black_box(tree.insert_all(points.clone()).unwrap()),
            );
        });
        group.bench_with_input(BenchmarkId::new("disk", size), &points, |b, points| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let path = dir.path().join("bench.rdknn");
                    (RdKnnTree::create(&path, settings()).unwrap(), dir)
                },
                |(tree, _dir)| {
                    tree.insert_all(points.clone()).unwrap();
                    tree.flush().unwrap();
                    black_box(tree.len())
                },
            );
        });
    }

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("RdKnnTree Queries");

    let tree = RdKnnTree::in_memory(settings()).unwrap();
    tree.insert_all(random_points(10000)).unwrap();
    let query = Point::from([500.0, 500.0]);

    group.bench_function("knn_10_of_10k", |b| {
        b.iter(|| black_box(tree.knn_query(&query, 10).unwrap()));
    });
    group.bench_function("range_of_10k", |b| {
        b.iter(|| black_box(tree.range_query(&query, 25.0).unwrap()));
    });
    for k in [1, 4] {
        group.bench_with_input(BenchmarkId::new("rknn_of_10k", k), &k, |b, &k| {
            b.iter(|| black_box(tree.reverse_knn_query(&query, k).unwrap()));
        });
    }

    group.finish();
}

fn bench_delete(c: &mut Criterion) {
    let points = random_points(2000);
    c.bench_function("RdKnnTree Delete 100 of 2k", |b| {
        b.iter_with_setup(
            || {
                let tree = RdKnnTree::in_memory(settings()).unwrap();
                tree.insert_all(points.clone()).unwrap();
                tree
            },
            |tree| black_box(tree.delete_all(0..100).unwrap()),
        );
    });
}

criterion_group!(benches, bench_insert, bench_bulk_load, bench_queries, bench_delete);
criterion_main!(benches);
