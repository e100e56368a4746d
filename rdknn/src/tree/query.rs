//! Range, kNN and reverse kNN queries.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use log::trace;

use crate::distance::SpatialDistance;
use crate::point::Point;
use crate::rknn_index::RknnIndex;

use super::oracle::{KnnHeap, KnnList, KnnOracle, Neighbor};
use super::page_store::PageStore;
use super::rdknn_impl::{check_open, RdKnnTree, RdKnnTreeInner};
use super::types::{Node, ObjectId, PageId, RknnError, RknnResult};

/// Objects a reverse kNN traversal leaves out of its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exclude {
    /// Objects located exactly at the query point
    AtQuery,
    Id(ObjectId),
}

impl Exclude {
    fn skips(&self, id: ObjectId, distance: f64) -> bool {
        match self {
            Exclude::AtQuery => distance == 0.0,
            Exclude::Id(excluded) => *excluded == id,
        }
    }
}

/// Page waiting in the best-first queue, closest first
struct QueueItem {
    min_dist: f64,
    page_id: PageId,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for a min-heap
        other
            .min_dist
            .total_cmp(&self.min_dist)
            .then_with(|| other.page_id.cmp(&self.page_id))
    }
}

impl<S: PageStore> RdKnnTreeInner<S> {
    /// Best-first search for the `k` objects nearest to `query`.
    pub(crate) fn knn_search(
        &self,
        root: PageId,
        query: &Point,
        k: usize,
        exclude: Option<ObjectId>,
    ) -> RknnResult<KnnList> {
        let mut heap = KnnHeap::new(k);
        if k == 0 {
            return Ok(heap.into_list());
        }
        let distance = self.settings.distance;

        let mut queue = BinaryHeap::new();
        queue.push(QueueItem {
            min_dist: 0.0,
            page_id: root,
        });
        while let Some(item) = queue.pop() {
            // equal distances are still visited so ties resolve by id
            if item.min_dist > heap.knn_distance() {
                break;
            }
            match self.store.get(item.page_id)? {
                Node::Leaf { entries } => {
                    for e in entries {
                        if Some(e.id) != exclude {
                            heap.insert(e.id, distance.distance(&e.point, query));
                        }
                    }
                }
                Node::Directory { entries, .. } => {
                    for e in entries {
                        let min_dist = distance.min_dist(&e.mbr, query);
                        if min_dist <= heap.knn_distance() {
                            queue.push(QueueItem {
                                min_dist,
                                page_id: e.page_id,
                            });
                        }
                    }
                }
            }
        }
        Ok(heap.into_list())
    }

    /// Objects within `radius` of `query`, unsorted.
    pub(crate) fn range_search(
        &self,
        page_id: PageId,
        query: &Point,
        radius: f64,
        result: &mut Vec<Neighbor>,
    ) -> RknnResult<()> {
        let distance = self.settings.distance;
        match self.store.get(page_id)? {
            Node::Leaf { entries } => {
                for e in entries {
                    let dist = distance.distance(&e.point, query);
                    if dist <= radius {
                        result.push(Neighbor::new(e.id, dist));
                    }
                }
            }
            Node::Directory { entries, .. } => {
                for e in entries {
                    if distance.min_dist(&e.mbr, query) <= radius {
                        self.range_search(e.page_id, query, radius, result)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Every object whose stored kNN distance reaches `query`: the reverse
    /// kNN answer at `k_max`, unsorted.
    pub(crate) fn reverse_candidates(
        &self,
        root: PageId,
        query: &Point,
        exclude: Exclude,
    ) -> RknnResult<Vec<Neighbor>> {
        let mut result = Vec::new();
        self.collect_reverse_candidates(root, query, exclude, &mut result)?;
        Ok(result)
    }

    fn collect_reverse_candidates(
        &self,
        page_id: PageId,
        query: &Point,
        exclude: Exclude,
        result: &mut Vec<Neighbor>,
    ) -> RknnResult<()> {
        let distance = self.settings.distance;
        match self.store.get(page_id)? {
            Node::Leaf { entries } => {
                for e in entries {
                    let dist = distance.distance(&e.point, query);
                    if dist <= e.knn_distance && !exclude.skips(e.id, dist) {
                        result.push(Neighbor::new(e.id, dist));
                    }
                }
            }
            Node::Directory { entries, .. } => {
                for e in entries {
                    if distance.min_dist(&e.mbr, query) <= e.knn_distance {
                        self.collect_reverse_candidates(e.page_id, query, exclude, result)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reverse kNN for any `k <= k_max`, sorted by distance then id.
    fn reverse_knn(
        &self,
        root: PageId,
        relation: &BTreeMap<ObjectId, Point>,
        query: &Point,
        k: usize,
        exclude: Exclude,
    ) -> RknnResult<Vec<Neighbor>> {
        let k_max = self.settings.k_max;
        if k == 0 || k > k_max {
            return Err(RknnError::UnsupportedQuery { k, k_max });
        }

        let mut candidates = self.reverse_candidates(root, query, exclude)?;
        if k < k_max {
            let before = candidates.len();
            let mut refined = Vec::with_capacity(before);
            for candidate in candidates {
                let point = relation.get(&candidate.id).ok_or_else(|| {
                    RknnError::IntegrityViolation(format!(
                        "object {} is in a leaf but not indexed",
                        candidate.id
                    ))
                })?;
                let kth = self
                    .knn_search(root, point, k, Some(candidate.id))?
                    .kth_distance(k);
                if candidate.distance <= kth {
                    refined.push(candidate);
                }
            }
            trace!(
                "Refinement at k = {} kept {} of {} candidates",
                k,
                refined.len(),
                before
            );
            candidates = refined;
        }

        candidates.sort();
        Ok(candidates)
    }
}

impl<S: PageStore> RdKnnTree<S> {
    /// All objects within `radius` of `point`, nearest first.
    ///
    /// A negative or NaN radius matches nothing.
    pub fn range_query(&self, point: &Point, radius: f64) -> RknnResult<Vec<Neighbor>> {
        let state = self.inner.state.read();
        check_open(&state)?;
        self.inner.check_point(point)?;
        if radius.is_nan() || radius < 0.0 {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        self.inner
            .range_search(state.meta.root_page, point, radius, &mut result)?;
        result.sort();
        Ok(result)
    }

    /// Like [`range_query`](Self::range_query), failing unless `distance`
    /// is the function the tree was built with.
    pub fn range_query_with(
        &self,
        distance: &impl SpatialDistance,
        point: &Point,
        radius: f64,
    ) -> RknnResult<Vec<Neighbor>> {
        self.check_distance(distance)?;
        self.range_query(point, radius)
    }

    /// The `k` objects nearest to `point`, nearest first. Ties are broken
    /// by object id.
    pub fn knn_query(&self, point: &Point, k: usize) -> RknnResult<KnnList> {
        let state = self.inner.state.read();
        check_open(&state)?;
        self.inner.check_point(point)?;
        self.inner.knn_search(state.meta.root_page, point, k, None)
    }

    pub fn knn_query_with(
        &self,
        distance: &impl SpatialDistance,
        point: &Point,
        k: usize,
    ) -> RknnResult<KnnList> {
        self.check_distance(distance)?;
        self.knn_query(point, k)
    }

    /// All objects that have `point` among their `k` nearest neighbours,
    /// sorted by distance then id.
    ///
    /// `point` acts as an additional object: an indexed object located
    /// exactly at `point` is taken to be the query itself and is not part
    /// of the answer.
    ///
    /// # Errors
    ///
    /// `UnsupportedQuery` unless `1 <= k <= k_max`.
    pub fn reverse_knn_query(&self, point: &Point, k: usize) -> RknnResult<Vec<Neighbor>> {
        let state = self.inner.state.read();
        check_open(&state)?;
        self.inner.check_point(point)?;
        self.inner.reverse_knn(
            state.meta.root_page,
            &state.relation,
            point,
            k,
            Exclude::AtQuery,
        )
    }

    pub fn reverse_knn_query_with(
        &self,
        distance: &impl SpatialDistance,
        point: &Point,
        k: usize,
    ) -> RknnResult<Vec<Neighbor>> {
        self.check_distance(distance)?;
        self.reverse_knn_query(point, k)
    }

    /// All objects that have the indexed object `id` among their `k`
    /// nearest neighbours. Returns `None` if `id` is not indexed.
    pub fn reverse_knn_query_by_id(
        &self,
        id: ObjectId,
        k: usize,
    ) -> RknnResult<Option<Vec<Neighbor>>> {
        let state = self.inner.state.read();
        check_open(&state)?;
        let Some(point) = state.relation.get(&id) else {
            return Ok(None);
        };
        self.inner
            .reverse_knn(
                state.meta.root_page,
                &state.relation,
                point,
                k,
                Exclude::Id(id),
            )
            .map(Some)
    }

    pub fn reverse_knn_query_by_id_with(
        &self,
        distance: &impl SpatialDistance,
        id: ObjectId,
        k: usize,
    ) -> RknnResult<Option<Vec<Neighbor>>> {
        self.check_distance(distance)?;
        self.reverse_knn_query_by_id(id, k)
    }

    fn check_distance(&self, distance: &impl SpatialDistance) -> RknnResult<()> {
        let expected = self.inner.settings.distance;
        let actual = distance.kind();
        if actual != expected {
            return Err(RknnError::DistanceMismatch { expected, actual });
        }
        Ok(())
    }
}

/// kNN oracle answering from the tree itself.
///
/// Borrows the pieces of the tree a writer already holds, so the
/// maintenance pipelines can use it under the write lock.
pub(crate) struct IndexOracle<'a, S> {
    inner: &'a RdKnnTreeInner<S>,
    root: PageId,
    relation: &'a BTreeMap<ObjectId, Point>,
}

impl<'a, S: PageStore> IndexOracle<'a, S> {
    pub(crate) fn new(
        inner: &'a RdKnnTreeInner<S>,
        root: PageId,
        relation: &'a BTreeMap<ObjectId, Point>,
    ) -> Self {
        Self {
            inner,
            root,
            relation,
        }
    }
}

impl<S: PageStore> KnnOracle for IndexOracle<'_, S> {
    fn k_nearest(&self, id: ObjectId, k: usize) -> RknnResult<KnnList> {
        let point = self.relation.get(&id).ok_or_else(|| {
            RknnError::IntegrityViolation(format!("object {} is not indexed", id))
        })?;
        self.inner.knn_search(self.root, point, k, Some(id))
    }
}

impl<S: PageStore> KnnOracle for RdKnnTree<S> {
    fn k_nearest(&self, id: ObjectId, k: usize) -> RknnResult<KnnList> {
        let state = self.inner.state.read();
        check_open(&state)?;
        IndexOracle::new(&self.inner, state.meta.root_page, &state.relation).k_nearest(id, k)
    }
}

impl<S: PageStore> RknnIndex for RdKnnTree<S> {
    fn insert(&self, id: ObjectId, point: Point) -> RknnResult<()> {
        RdKnnTree::insert(self, id, point)
    }

    fn delete(&self, id: ObjectId) -> RknnResult<bool> {
        RdKnnTree::delete(self, id)
    }

    fn range_query(&self, point: &Point, radius: f64) -> RknnResult<Vec<Neighbor>> {
        RdKnnTree::range_query(self, point, radius)
    }

    fn knn_query(&self, point: &Point, k: usize) -> RknnResult<KnnList> {
        RdKnnTree::knn_query(self, point, k)
    }

    fn reverse_knn_query(&self, point: &Point, k: usize) -> RknnResult<Vec<Neighbor>> {
        RdKnnTree::reverse_knn_query(self, point, k)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn close(&self) -> RknnResult<()> {
        RdKnnTree::close(self)
    }

    fn clear(&self) -> RknnResult<()> {
        RdKnnTree::clear(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceKind;
    use crate::settings::RdKnnSettings;
    use crate::tree::oracle::BruteForceOracle;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn scenario() -> RdKnnTree {
        let tree = RdKnnTree::in_memory(RdKnnSettings::default()).unwrap();
        for (id, xy) in [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [5.0, 6.0]]
            .into_iter()
            .enumerate()
        {
            tree.insert(id as u64, Point::from(xy)).unwrap();
        }
        tree
    }

    fn random_tree(n: usize, k_max: usize, seed: u64) -> (RdKnnTree, Vec<(ObjectId, Point)>) {
        let settings = RdKnnSettings::builder()
            .k_max(k_max)
            .page_size(256)
            .build()
            .unwrap();
        let tree = RdKnnTree::in_memory(settings).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let points: Vec<(ObjectId, Point)> = (0..n as u64)
            .map(|id| {
                let p = Point::from([rng.gen_range(0.0..50.0), rng.gen_range(0.0..50.0)]);
                (id, p)
            })
            .collect();
        for (id, p) in &points {
            tree.insert(*id, p.clone()).unwrap();
        }
        (tree, points)
    }

    #[test]
    fn test_scenario_queries() {
        let tree = scenario();
        let knn = tree.knn_query(&Point::from([0.0, 0.0]), 2).unwrap();
        assert_eq!(knn.ids(), vec![0, 1]);
        assert_eq!(tree.knn_distance(0).unwrap(), Some(1.0));
        assert_eq!(tree.knn_distance(3).unwrap(), Some(1.0));

        let rknn = tree.reverse_knn_query(&Point::from([1.0, 0.0]), 1).unwrap();
        assert_eq!(rknn.iter().map(|n| n.id).collect::<Vec<_>>(), vec![0]);

        let by_id = tree.reverse_knn_query_by_id(1, 1).unwrap().unwrap();
        assert_eq!(by_id.iter().map(|n| n.id).collect::<Vec<_>>(), vec![0]);
        assert!(tree.reverse_knn_query_by_id(42, 1).unwrap().is_none());
    }

    #[test]
    fn test_range_query_sorted_and_pruned() {
        let tree = scenario();
        let result = tree.range_query(&Point::from([0.0, 0.0]), 1.0).unwrap();
        let ids: Vec<_> = result.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(result[0].distance, 0.0);

        assert!(tree.range_query(&Point::from([0.0, 0.0]), -1.0).unwrap().is_empty());
        assert!(tree
            .range_query(&Point::from([0.0, 0.0]), f64::NAN)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let (tree, points) = random_tree(400, 2, 17);
        let oracle = BruteForceOracle::new(DistanceKind::Euclidean, points);
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..25 {
            let q = Point::from([rng.gen_range(-5.0..55.0), rng.gen_range(-5.0..55.0)]);
            for k in [1, 5, 20] {
                assert_eq!(
                    tree.knn_query(&q, k).unwrap(),
                    oracle.k_nearest_to(&q, k, None)
                );
            }
        }
        assert!(tree.knn_query(&Point::from([0.0, 0.0]), 0).unwrap().is_empty());
    }

    #[test]
    fn test_reverse_knn_matches_brute_force() {
        let (tree, points) = random_tree(300, 4, 23);
        let oracle = BruteForceOracle::new(DistanceKind::Euclidean, points.clone());
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..20 {
            let q = Point::from([rng.gen_range(0.0..50.0), rng.gen_range(0.0..50.0)]);
            for k in 1..=4 {
                let mut got = tree.reverse_knn_query(&q, k).unwrap();
                got.sort_by_key(|n| n.id);
                assert_eq!(got, oracle.reverse_k_nearest_to(&q, k, None), "k = {}", k);
            }
        }

        for (id, point) in points.iter().take(30) {
            let mut got = tree.reverse_knn_query_by_id(*id, 2).unwrap().unwrap();
            got.sort_by_key(|n| n.id);
            assert_eq!(got, oracle.reverse_k_nearest_to(point, 2, Some(*id)));
        }
    }

    #[test]
    fn test_reverse_knn_rejects_unsupported_k() {
        let tree = scenario();
        let q = Point::from([0.0, 0.0]);
        assert!(matches!(
            tree.reverse_knn_query(&q, 2),
            Err(RknnError::UnsupportedQuery { k: 2, k_max: 1 })
        ));
        assert!(matches!(
            tree.reverse_knn_query(&q, 0),
            Err(RknnError::UnsupportedQuery { k: 0, k_max: 1 })
        ));
    }

    #[test]
    fn test_distance_mismatch() {
        let tree = scenario();
        let q = Point::from([0.0, 0.0]);
        assert!(tree.knn_query_with(&DistanceKind::Euclidean, &q, 1).is_ok());
        assert!(matches!(
            tree.range_query_with(&DistanceKind::Manhattan, &q, 1.0),
            Err(RknnError::DistanceMismatch {
                expected: DistanceKind::Euclidean,
                actual: DistanceKind::Manhattan
            })
        ));
        assert!(matches!(
            tree.reverse_knn_query_with(&DistanceKind::Maximum, &q, 1),
            Err(RknnError::DistanceMismatch { .. })
        ));
    }

    #[test]
    fn test_queries_check_dimensions() {
        let tree = scenario();
        assert!(matches!(
            tree.knn_query(&Point::from([0.0]), 1),
            Err(RknnError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_index_oracle_agrees_with_brute_force() {
        let (tree, points) = random_tree(150, 3, 31);
        let oracle = BruteForceOracle::new(DistanceKind::Euclidean, points.clone());
        for (id, _) in &points {
            assert_eq!(
                tree.k_nearest(*id, 3).unwrap(),
                oracle.k_nearest(*id, 3).unwrap()
            );
        }
    }

    #[test]
    fn test_rknn_index_trait_object() {
        let index: Box<dyn RknnIndex> = Box::new(scenario());
        assert_eq!(index.size(), 5);
        assert!(index.delete(4).unwrap());
        assert_eq!(index.size(), 4);
        index.clear().unwrap();
        assert_eq!(index.size(), 0);
        index.close().unwrap();
    }
}
