//! RknnIndex trait definition for reverse nearest neighbour indexing.

use crate::point::Point;
use crate::tree::oracle::{KnnList, Neighbor};
use crate::tree::types::{ObjectId, RknnResult};

/// A point index answering range, kNN and reverse kNN queries.
pub trait RknnIndex: Send + Sync {
    /// Adds an object to the index.
    fn insert(&self, id: ObjectId, point: Point) -> RknnResult<()>;

    /// Removes an object from the index. Returns false if it was not indexed.
    fn delete(&self, id: ObjectId) -> RknnResult<bool>;

    /// All objects within `radius` of `point`, nearest first.
    fn range_query(&self, point: &Point, radius: f64) -> RknnResult<Vec<Neighbor>>;

    /// The `k` objects nearest to `point`.
    fn knn_query(&self, point: &Point, k: usize) -> RknnResult<KnnList>;

    /// All objects that have `point` among their `k` nearest neighbours.
    fn reverse_knn_query(&self, point: &Point, k: usize) -> RknnResult<Vec<Neighbor>>;

    /// Gets the number of indexed objects.
    fn size(&self) -> u64;

    /// Closes this index, flushing all pending changes.
    fn close(&self) -> RknnResult<()>;

    /// Clears all data from the index.
    fn clear(&self) -> RknnResult<()>;
}
