//! # RdKNN - Reverse k-Nearest-Neighbour Index
//!
//! This crate provides an R*-tree over n-dimensional points in which every
//! entry carries a k-nearest-neighbour distance, so that reverse kNN
//! queries ("which objects have this point among their k nearest
//! neighbours?") are answered without scanning all objects.
//!
//! ## Features
//!
//! - **Reverse kNN**: exact answers for any `k` up to the `k_max` a tree is
//!   built with
//! - **Range and kNN**: bounding-box pruned range queries and best-first
//!   kNN search
//! - **Disk-Based Storage**: nodes live in fixed-size page slots of one file,
//!   loaded on demand through an LRU cache
//! - **Bulk Loading**: Sort-Tile-Recursive packing for batches into an empty
//!   tree
//! - **Thread Safe**: one writer, any number of concurrent readers
//!
//! ## Quick Start
//!
//! ```rust
//! use rdknn::{Point, RdKnnSettings, RdKnnTree};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = RdKnnSettings::builder().k_max(2).build()?;
//! let tree = RdKnnTree::in_memory(settings)?;
//!
//! tree.insert_all(vec![
//!     (1, Point::from([0.0, 0.0])),
//!     (2, Point::from([1.0, 0.0])),
//!     (3, Point::from([0.0, 1.0])),
//!     (4, Point::from([5.0, 5.0])),
//! ])?;
//!
//! let nearest = tree.knn_query(&Point::from([0.2, 0.1]), 2)?;
//! assert_eq!(nearest.ids(), vec![1, 2]);
//!
//! let influenced = tree.reverse_knn_query(&Point::from([0.2, 0.2]), 2)?;
//! assert_eq!(influenced.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Disk Trees
//!
//! ```rust,no_run
//! use rdknn::{Point, RdKnnSettings, RdKnnTree};
//! use tempfile::tempdir;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempdir()?;
//! let path = dir.path().join("places.rdknn");
//!
//! let tree = RdKnnTree::create(&path, RdKnnSettings::default())?;
//! tree.insert(7, Point::from([3.0, 4.0]))?;
//! tree.close()?;
//!
//! let tree = RdKnnTree::open(&path)?;
//! assert!(tree.contains(7));
//! # Ok(())
//! # }
//! ```

// Geometry
pub mod bounding_box;
pub mod distance;
pub mod point;

// Index
pub mod listener;
pub mod rknn_index;
pub mod settings;
pub mod tree;

pub use bounding_box::Mbr;
pub use distance::{DistanceKind, SpatialDistance};
pub use point::Point;

pub use listener::TreeListener;
pub use rknn_index::RknnIndex;
pub use settings::{NodeLayout, RdKnnSettings, RdKnnSettingsBuilder};

pub use tree::{
    BruteForceOracle, DiskPageStore, IntegrityReport, KnnList, KnnMismatch, KnnOracle,
    MemoryPageStore, Neighbor, ObjectId, PageId, PageStore, RdKnnTree, RebuildStats, RknnError,
    RknnResult, SplitKind, StoreOptions, TreeStats,
};
