//! Nearest-neighbour result types and kNN oracles.
//!
//! A [`KnnOracle`] answers "who are the k nearest other objects of this
//! object". The tree uses one to recompute stored kNN distances after
//! deletions and bulk loads; [`BruteForceOracle`] answers the same question
//! by a linear scan and serves as the reference in tests.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::distance::{DistanceKind, SpatialDistance};
use crate::point::Point;

use super::types::{ObjectId, RknnError, RknnResult, UNKNOWN_KNN_DISTANCE};

/// One neighbour of a query: object id and its distance.
///
/// Neighbours are ordered by distance, ties broken by id.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub id: ObjectId,
    pub distance: f64,
}

impl Neighbor {
    pub fn new(id: ObjectId, distance: f64) -> Self {
        Self { id, distance }
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A finished kNN answer, sorted by ascending distance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnnList {
    neighbors: Vec<Neighbor>,
}

impl KnnList {
    /// Distance of the k-th neighbour, `UNKNOWN_KNN_DISTANCE` if there are
    /// fewer than `k`.
    pub fn kth_distance(&self, k: usize) -> f64 {
        if k == 0 {
            return 0.0;
        }
        self.neighbors
            .get(k - 1)
            .map_or(UNKNOWN_KNN_DISTANCE, |n| n.distance)
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.iter()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.neighbors.iter().map(|n| n.id).collect()
    }

    pub fn as_slice(&self) -> &[Neighbor] {
        &self.neighbors
    }
}

impl IntoIterator for KnnList {
    type Item = Neighbor;
    type IntoIter = std::vec::IntoIter<Neighbor>;

    fn into_iter(self) -> Self::IntoIter {
        self.neighbors.into_iter()
    }
}

/// Bounded collector of the k best neighbours seen so far.
#[derive(Debug, Clone)]
pub struct KnnHeap {
    k: usize,
    // max-heap: the current k-th neighbour is on top
    heap: BinaryHeap<Neighbor>,
}

impl KnnHeap {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    /// Offer a candidate. Returns true if it was kept.
    pub fn insert(&mut self, id: ObjectId, distance: f64) -> bool {
        if self.k == 0 {
            return false;
        }
        let candidate = Neighbor::new(id, distance);
        if self.heap.len() < self.k {
            self.heap.push(candidate);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if candidate < *worst => {
                self.heap.pop();
                self.heap.push(candidate);
                true
            }
            _ => false,
        }
    }

    /// Distance of the current k-th neighbour, `UNKNOWN_KNN_DISTANCE`
    /// until k candidates have been kept.
    pub fn knn_distance(&self) -> f64 {
        if self.heap.len() < self.k {
            return UNKNOWN_KNN_DISTANCE;
        }
        self.heap.peek().map_or(UNKNOWN_KNN_DISTANCE, |n| n.distance)
    }

    pub fn into_list(self) -> KnnList {
        KnnList {
            neighbors: self.heap.into_sorted_vec(),
        }
    }
}

/// Answers k-nearest-neighbour queries about indexed objects.
pub trait KnnOracle {
    /// The `k` nearest objects to object `id`, not counting `id` itself.
    fn k_nearest(&self, id: ObjectId, k: usize) -> RknnResult<KnnList>;

    /// Distance from `id` to its k-th nearest other object.
    fn knn_distance(&self, id: ObjectId, k: usize) -> RknnResult<f64> {
        Ok(self.k_nearest(id, k)?.kth_distance(k))
    }
}

/// Linear-scan oracle over an explicit set of points.
#[derive(Debug, Clone)]
pub struct BruteForceOracle {
    distance: DistanceKind,
    points: Vec<(ObjectId, Point)>,
}

impl BruteForceOracle {
    pub fn new<I>(distance: DistanceKind, points: I) -> Self
    where
        I: IntoIterator<Item = (ObjectId, Point)>,
    {
        Self {
            distance,
            points: points.into_iter().collect(),
        }
    }

    /// The `k` nearest points to an arbitrary location, optionally skipping
    /// one object.
    pub fn k_nearest_to(&self, query: &Point, k: usize, exclude: Option<ObjectId>) -> KnnList {
        let mut heap = KnnHeap::new(k);
        for (id, point) in &self.points {
            if Some(*id) == exclude {
                continue;
            }
            heap.insert(*id, self.distance.distance(point, query));
        }
        heap.into_list()
    }

    /// All objects whose k-th nearest other object is at least as far away
    /// as `query`, skipping `exclude`. Sorted by id.
    pub fn reverse_k_nearest_to(
        &self,
        query: &Point,
        k: usize,
        exclude: Option<ObjectId>,
    ) -> Vec<Neighbor> {
        let mut result: Vec<Neighbor> = self
            .points
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .filter_map(|(id, point)| {
                let dist = self.distance.distance(point, query);
                let kdist = self.k_nearest_to(point, k, Some(*id)).kth_distance(k);
                (dist <= kdist).then(|| Neighbor::new(*id, dist))
            })
            .collect();
        result.sort_by_key(|n| n.id);
        result
    }

    fn point(&self, id: ObjectId) -> Option<&Point> {
        self.points.iter().find(|(pid, _)| *pid == id).map(|(_, p)| p)
    }
}

impl KnnOracle for BruteForceOracle {
    fn k_nearest(&self, id: ObjectId, k: usize) -> RknnResult<KnnList> {
        let point = self.point(id).ok_or_else(|| {
            RknnError::IntegrityViolation(format!("object {} is not known to the oracle", id))
        })?;
        Ok(self.k_nearest_to(point, k, Some(id)))
    }
}
