//! Disk-page RdKNN tree.
//!
//! An R*-tree over points whose entries also carry kNN distances:
//! - Page-based node storage behind the [`PageStore`] trait, in memory or
//!   in a single file with an LRU cache of hot pages
//! - Exact `k_max`-nearest-neighbour distance on every leaf entry and the
//!   maximum of those on every directory entry
//! - Range, kNN and reverse kNN queries pruned by bounding boxes and by the
//!   aggregated kNN distances

pub mod constants;
pub mod cache;
pub mod integrity;
pub mod oracle;
pub mod page_store;
pub mod split;
pub mod storage;
pub mod types;
mod query;
mod rdknn_impl;

pub use constants::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE, DEFAULT_SLOT_SIZE};
pub use integrity::{IntegrityReport, KnnMismatch};
pub use oracle::{BruteForceOracle, KnnHeap, KnnList, KnnOracle, Neighbor};
pub use page_store::{DiskPageStore, MemoryPageStore, PageStore, StoreOptions};
pub use rdknn_impl::RdKnnTree;
pub use split::{MedianSplit, SplitKind, SplitStrategy, TopologicalSplit};
pub use types::{
    DirectoryEntry, LeafEntry, Node, ObjectId, PageId, RebuildStats, RknnError,
    RknnResult, SpatialEntry, StoreStats, TreeMeta, TreeStats, UNKNOWN_KNN_DISTANCE,
};
