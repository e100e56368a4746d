//! Core types and data structures for the RdKNN tree.
//!
//! This module defines the fundamental types used throughout the tree:
//! - Error types and result types
//! - Entry types (leaf and directory) and the node type
//! - Tree metadata and statistics
//! - Page slot wrappers used by the disk store

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::bounding_box::{union_all, Mbr};
use crate::distance::DistanceKind;
use crate::point::Point;
use crate::settings::RdKnnSettings;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in index operations
#[derive(Debug, Error)]
pub enum RknnError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Reverse kNN query not supported for k = {k} (k_max = {k_max})")]
    UnsupportedQuery { k: usize, k_max: usize },

    #[error("Distance function {actual} does not match the index distance {expected}")]
    DistanceMismatch {
        expected: DistanceKind,
        actual: DistanceKind,
    },

    #[error("Point has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    #[error("Object {0} is already indexed")]
    DuplicateObject(ObjectId),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Index is closed")]
    Closed,
}

/// Result type for index operations
pub type RknnResult<T> = Result<T, RknnError>;

/// Identifier of an indexed object
pub type ObjectId = u64;

/// Page ID - unique identifier for a node/page in the page store
pub type PageId = u64;

/// kNN distance of an object that has fewer than `k_max` other objects
/// around it. Every other object is then one of its neighbours, so no
/// query point can be pruned for it.
pub const UNKNOWN_KNN_DISTANCE: f64 = f64::INFINITY;

// ============================================================================
// Entry Types
// ============================================================================

/// An indexed object in a leaf node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub id: ObjectId,
    pub point: Point,
    /// Distance to the `k_max`-th nearest other object
    pub knn_distance: f64,
}

impl LeafEntry {
    pub fn new(id: ObjectId, point: Point) -> Self {
        Self {
            id,
            point,
            knn_distance: UNKNOWN_KNN_DISTANCE,
        }
    }
}

/// A child reference in a directory node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub page_id: PageId,
    pub mbr: Mbr,
    /// Maximum kNN distance of all objects in the child subtree
    pub knn_distance: f64,
}

/// Anything a node can hold: has a bounding box and a kNN distance.
pub trait SpatialEntry: Clone {
    fn mbr(&self) -> Mbr;

    fn knn_distance(&self) -> f64;

    /// Center along one dimension, used by splits and bulk partitioning
    fn center(&self, dim: usize) -> f64 {
        self.mbr().center(dim)
    }
}

impl SpatialEntry for LeafEntry {
    fn mbr(&self) -> Mbr {
        Mbr::from_point(&self.point)
    }

    fn knn_distance(&self) -> f64 {
        self.knn_distance
    }

    fn center(&self, dim: usize) -> f64 {
        self.point[dim]
    }
}

impl SpatialEntry for DirectoryEntry {
    fn mbr(&self) -> Mbr {
        self.mbr.clone()
    }

    fn knn_distance(&self) -> f64 {
        self.knn_distance
    }
}

// ============================================================================
// Node Types
// ============================================================================

/// Node types in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Leaf node containing indexed objects
    Leaf { entries: Vec<LeafEntry> },
    /// Directory node containing child references
    Directory {
        entries: Vec<DirectoryEntry>,
        level: u32, // Height above leaf level (leaves are 0)
    },
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    /// Bounding box enclosing all entries, `None` for an empty node
    pub fn compute_mbr(&self) -> Option<Mbr> {
        match self {
            Node::Leaf { entries } => {
                let mut iter = entries.iter();
                let mut mbr = Mbr::from_point(&iter.next()?.point);
                for e in iter {
                    mbr.extend_point(&e.point);
                }
                Some(mbr)
            }
            Node::Directory { entries, .. } => union_all(entries.iter().map(|e| &e.mbr)),
        }
    }

    /// Aggregate kNN distance: the maximum over all entries
    pub fn knn_distance(&self) -> f64 {
        match self {
            Node::Leaf { entries } => entries.iter().map(|e| e.knn_distance).fold(0.0, f64::max),
            Node::Directory { entries, .. } => {
                entries.iter().map(|e| e.knn_distance).fold(0.0, f64::max)
            }
        }
    }

    /// Directory entry describing this node when stored at `page_id`
    pub fn to_directory_entry(&self, page_id: PageId) -> RknnResult<DirectoryEntry> {
        let mbr = self.compute_mbr().ok_or_else(|| {
            RknnError::IntegrityViolation(format!("page {} is empty but still referenced", page_id))
        })?;
        Ok(DirectoryEntry {
            page_id,
            mbr,
            knn_distance: self.knn_distance(),
        })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// Levels above the leaves
    pub fn level(&self) -> u32 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Directory { level, .. } => *level,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Directory { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tree Metadata and Statistics
// ============================================================================

/// Persistent description of a tree, kept by the page store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeMeta {
    pub settings: RdKnnSettings,
    pub root_page: PageId,
    pub height: u32,
    pub entry_count: u64,
}

/// Page store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub allocated_pages: u64,
    pub free_pages: u64,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

/// Statistics about the tree shape
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub total_entries: u64,
    pub tree_height: u32,
    pub leaf_nodes: u64,
    pub directory_nodes: u64,
    /// Aggregate kNN distance of the root
    pub root_knn_distance: f64,
    pub store: StoreStats,
}

/// Outcome of a rebuild
#[derive(Debug, Clone, Default)]
pub struct RebuildStats {
    pub entries_rebuilt: u64,
    pub old_height: u32,
    pub new_height: u32,
    pub pages_before: u64,
    pub pages_after: u64,
}

// ============================================================================
// Disk Page Slots
// ============================================================================

/// A released page in the free list chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreePage {
    /// Next free page in the chain (0 = end of chain)
    pub next_free: PageId,
}

/// A node wrapped with a CRC32 checksum for corruption detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWithChecksum {
    pub checksum: u32,
    pub node: Node,
}

impl PageWithChecksum {
    pub fn new(node: Node) -> RknnResult<Self> {
        let checksum = Self::calculate_checksum(&node)?;
        Ok(Self { checksum, node })
    }

    pub fn calculate_checksum(node: &Node) -> RknnResult<u32> {
        let serialized = bincode::serde::encode_to_vec(node, bincode::config::legacy())
            .map_err(|e| RknnError::Serialization(e.to_string()))?;
        Ok(crc32fast::hash(&serialized))
    }

    /// Verify checksum and consume self to return the node
    pub fn into_node(self, page_id: PageId) -> RknnResult<Node> {
        let expected = Self::calculate_checksum(&self.node)?;
        if self.checksum != expected {
            return Err(RknnError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Page {} checksum mismatch - possible corruption (expected: {:x}, got: {:x})",
                    page_id, expected, self.checksum
                ),
            )));
        }
        Ok(self.node)
    }
}

/// Content of one fixed-size slot of the page file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PageSlot {
    Node(PageWithChecksum),
    Free(FreePage),
}
