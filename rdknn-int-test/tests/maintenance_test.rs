//! Bulk loading, deletion and rebuilding keep the tree consistent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdknn::{DistanceKind, Point, RdKnnTree, SplitKind};
use rdknn_int_test::test_util::{
    cleanup, create_memory_context, expected_knn_distances, oracle, random_points, random_query,
    run_test, small_settings, sorted_by_id,
};
use std::collections::BTreeMap;

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_bulk_load_equals_incremental() {
    run_test(
        || create_memory_context(small_settings(3)),
        |ctx| {
            let points = random_points(400, 2, 8);
            let bulk = ctx.tree();
            bulk.insert_all(points.clone())?;

            let incremental = RdKnnTree::in_memory(small_settings(3))?;
            for (id, p) in &points {
                incremental.insert(*id, p.clone())?;
            }

            assert_eq!(bulk.knn_distances()?, incremental.knn_distances()?);
            assert_eq!(
                bulk.knn_distances()?,
                expected_knn_distances(DistanceKind::Euclidean, &points, 3)
            );
            assert!(bulk.check_integrity()?.is_valid);
            assert!(bulk.check_integrity()?.underfull_pages.is_empty());

            let mut rng = StdRng::seed_from_u64(9);
            for _ in 0..20 {
                let q = random_query(&mut rng, 2);
                for k in 1..=3 {
                    assert_eq!(
                        bulk.reverse_knn_query(&q, k)?,
                        incremental.reverse_knn_query(&q, k)?
                    );
                }
                assert_eq!(bulk.knn_query(&q, 7)?, incremental.knn_query(&q, 7)?);
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_delete_then_reinsert_restores_state() {
    run_test(
        || create_memory_context(small_settings(2)),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(300, 2, 17);
            tree.insert_all(points.clone())?;
            let original = tree.knn_distances()?;
            let probe = Point::from([40.0, 60.0]);
            let original_rknn = tree.reverse_knn_query(&probe, 2)?;

            for (id, p) in points.iter().step_by(13) {
                assert!(tree.delete(*id)?);
                assert!(!tree.contains(*id));
                assert!(tree.verify_knn_distances(0.0)?.is_empty());

                tree.insert(*id, p.clone())?;
                assert_eq!(tree.knn_distances()?, original);
            }
            assert_eq!(tree.reverse_knn_query(&probe, 2)?, original_rknn);
            assert!(tree.check_integrity()?.is_valid);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_mixed_workload_keeps_invariants() {
    for split in [SplitKind::Topological, SplitKind::Median] {
        run_test(
            || {
                let mut settings = small_settings(3);
                settings.split = split;
                create_memory_context(settings)
            },
            |ctx| {
                let tree = ctx.tree();
                let mut rng = StdRng::seed_from_u64(1234);
                let mut live: BTreeMap<u64, Point> = BTreeMap::new();
                let mut next_id = 0u64;

                for step in 1..=600 {
                    let delete = !live.is_empty() && rng.random_bool(0.35);
                    if delete {
                        let nth = rng.random_range(0..live.len());
                        let id = *live.keys().nth(nth).expect("non-empty");
                        assert!(tree.delete(id)?);
                        live.remove(&id);
                    } else {
                        let p = random_query(&mut rng, 2);
                        tree.insert(next_id, p.clone())?;
                        live.insert(next_id, p);
                        next_id += 1;
                    }

                    if step % 50 == 0 {
                        let report = tree.check_integrity()?;
                        assert!(report.is_valid, "{:?}", report.errors);
                        assert!(tree.verify_knn_distances(0.0)?.is_empty());
                    }
                }

                let points: Vec<_> = live.into_iter().collect();
                assert_eq!(tree.len(), points.len());
                assert_eq!(
                    tree.knn_distances()?,
                    expected_knn_distances(DistanceKind::Euclidean, &points, 3)
                );

                let expected = oracle(DistanceKind::Euclidean, &points);
                let q = Point::from([50.0, 50.0]);
                assert_eq!(
                    sorted_by_id(tree.reverse_knn_query(&q, 2)?),
                    expected.reverse_k_nearest_to(&q, 2, None)
                );
                Ok(())
            },
            cleanup,
        )
    }
}

#[test]
fn test_delete_all_and_missing_ids() {
    run_test(
        || create_memory_context(small_settings(1)),
        |ctx| {
            let tree = ctx.tree();
            tree.insert_all(random_points(200, 2, 4))?;

            assert_eq!(tree.delete_all([5, 6, 7, 1000, 5])?, 3);
            assert!(!tree.delete(5)?);
            assert_eq!(tree.len(), 197);

            assert_eq!(tree.delete_all(0..200)?, 197);
            assert!(tree.is_empty());
            assert_eq!(tree.height(), 1);
            assert!(tree.check_integrity()?.is_valid);

            // the emptied tree accepts new objects
            tree.insert(1, Point::from([1.0, 1.0]))?;
            tree.insert(2, Point::from([2.0, 1.0]))?;
            assert_eq!(tree.knn_distance(1)?, Some(1.0));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_insert_all_into_populated_tree() {
    run_test(
        || create_memory_context(small_settings(2)),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(300, 2, 60);
            tree.insert_all(points[..150].to_vec())?;
            tree.insert_all(points[150..].to_vec())?;

            assert_eq!(tree.len(), 300);
            assert_eq!(
                tree.knn_distances()?,
                expected_knn_distances(DistanceKind::Euclidean, &points, 2)
            );
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_rebuild_after_heavy_deletes() {
    run_test(
        || create_memory_context(small_settings(2)),
        |ctx| {
            let tree = ctx.tree();
            let points = random_points(800, 2, 90);
            for (id, p) in &points {
                tree.insert(*id, p.clone())?;
            }
            tree.delete_all((0..800).filter(|id| id % 4 != 0))?;
            let before = tree.knn_distances()?;
            let probe = Point::from([25.0, 75.0]);
            let rknn_before = tree.reverse_knn_query(&probe, 2)?;

            let stats = tree.rebuild()?;
            assert_eq!(stats.entries_rebuilt, 200);
            assert!(stats.new_height <= stats.old_height);

            assert_eq!(tree.knn_distances()?, before);
            assert_eq!(tree.reverse_knn_query(&probe, 2)?, rknn_before);
            assert!(tree.check_integrity()?.is_valid);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_clear_resets_tree() {
    run_test(
        || create_memory_context(small_settings(2)),
        |ctx| {
            let tree = ctx.tree();
            tree.insert_all(random_points(300, 2, 3))?;
            assert!(tree.height() > 1);

            tree.clear()?;
            assert!(tree.is_empty());
            assert_eq!(tree.height(), 1);
            let stats = tree.stats()?;
            assert_eq!(stats.total_entries, 0);
            assert_eq!(stats.leaf_nodes, 1);
            assert_eq!(stats.directory_nodes, 0);

            tree.insert_all(random_points(20, 2, 4))?;
            assert_eq!(tree.len(), 20);
            Ok(())
        },
        cleanup,
    )
}
