//! Queries from many threads against one tree.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rdknn::{DistanceKind, Point, RknnIndex};
use rdknn_int_test::test_util::{
    cleanup, create_disk_context, create_disk_context_with_cache, create_memory_context,
    expected_knn_distances, oracle, random_points, random_query, run_test, small_settings,
    sorted_by_id,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_concurrent_readers() {
    run_test(
        || create_memory_context(small_settings(3)),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(1000, 2, 70);
            tree.insert_all(points.clone())?;

            let expected = oracle(DistanceKind::Euclidean, &points);
            let mut rng = StdRng::seed_from_u64(71);
            let queries: Vec<Point> = (0..64).map(|_| random_query(&mut rng, 2)).collect();
            let answers: Vec<_> = queries
                .iter()
                .map(|q| expected.reverse_k_nearest_to(q, 3, None))
                .collect();

            let num_threads = 8;
            let barrier = Barrier::new(num_threads);
            let checked = AtomicUsize::new(0);
            thread::scope(|s| {
                for _ in 0..num_threads {
                    let tree = tree.clone();
                    let (barrier, checked) = (&barrier, &checked);
                    let (queries, answers, expected) = (&queries, &answers, &expected);
                    s.spawn(move || {
                        barrier.wait();
                        for (q, answer) in queries.iter().zip(answers) {
                            let rknn = tree.reverse_knn_query(q, 3).expect("query");
                            assert_eq!(&sorted_by_id(rknn), answer);
                            let knn = tree.knn_query(q, 5).expect("query");
                            assert_eq!(knn, expected.k_nearest_to(q, 5, None));
                            checked.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });
            assert_eq!(checked.load(Ordering::Relaxed), num_threads * queries.len());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_concurrent_readers_on_disk() {
    run_test(
        || create_disk_context(small_settings(2)),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(1500, 2, 80);
            tree.insert_all(points.clone())?;
            let expected = oracle(DistanceKind::Euclidean, &points);

            thread::scope(|s| {
                for t in 0..4u64 {
                    let tree = tree.clone();
                    let expected = &expected;
                    s.spawn(move || {
                        let mut rng = StdRng::seed_from_u64(t);
                        for _ in 0..25 {
                            let q = random_query(&mut rng, 2);
                            let got = tree.range_query(&q, 8.0).expect("query");
                            let want: Vec<_> = expected
                                .k_nearest_to(&q, 1500, None)
                                .into_iter()
                                .filter(|n| n.distance <= 8.0)
                                .collect();
                            assert_eq!(got, want);
                        }
                    });
                }
            });
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_writer_with_readers() {
    run_test(
        || create_memory_context(small_settings(2)),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(1200, 2, 90);
            tree.insert_all(points[..600].to_vec())?;

            let index: Arc<dyn RknnIndex> = Arc::new(tree.clone());
            thread::scope(|s| {
                let writer = Arc::clone(&index);
                let batch = &points[600..];
                s.spawn(move || {
                    for (id, p) in batch {
                        writer.insert(*id, p.clone()).expect("insert");
                    }
                });

                for t in 0..3u64 {
                    let reader = Arc::clone(&index);
                    s.spawn(move || {
                        let mut rng = StdRng::seed_from_u64(100 + t);
                        for _ in 0..50 {
                            let q = random_query(&mut rng, 2);
                            let knn = reader.knn_query(&q, 4).expect("query");
                            assert_eq!(knn.len(), 4);
                            reader.reverse_knn_query(&q, 2).expect("query");
                        }
                    });
                }
            });

            assert_eq!(index.size(), 1200);
            assert!(tree.check_integrity()?.is_valid);
            assert!(tree.verify_knn_distances(0.0)?.is_empty());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_readers_evicting_dirty_pages() {
    run_test(
        || create_disk_context_with_cache(small_settings(2), 4),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(1200, 2, 120);
            // nothing is flushed: most pages only reach disk when readers evict them
            for (id, p) in &points {
                tree.insert(*id, p.clone())?;
            }
            let expected = oracle(DistanceKind::Euclidean, &points);

            for round in 0..5u64 {
                thread::scope(|s| {
                    for t in 0..8u64 {
                        let tree = tree.clone();
                        let expected = &expected;
                        s.spawn(move || {
                            let mut rng = StdRng::seed_from_u64(round * 100 + t);
                            for _ in 0..20 {
                                let q = random_query(&mut rng, 2);
                                let rknn = tree.reverse_knn_query(&q, 2).expect("query");
                                assert_eq!(
                                    sorted_by_id(rknn),
                                    expected.reverse_k_nearest_to(&q, 2, None)
                                );
                                let knn = tree.knn_query(&q, 3).expect("query");
                                assert_eq!(knn, expected.k_nearest_to(&q, 3, None));
                            }
                        });
                    }
                });

                // a writer after the readers must see every page as last written
                let id = 10_000 + round;
                let p = random_query(&mut StdRng::seed_from_u64(id), 2);
                tree.insert(id, p)?;
                assert!(tree.delete(id)?);
            }

            assert!(tree.stats()?.store.disk_writes > 0);
            assert!(tree.check_integrity()?.is_valid);
            assert_eq!(
                tree.knn_distances()?,
                expected_knn_distances(DistanceKind::Euclidean, &points, 2)
            );
            Ok(())
        },
        cleanup,
    )
}
