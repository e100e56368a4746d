//! Construction parameters of an RdKNN tree.
//!
//! Settings are fixed for the lifetime of a tree. They are persisted with
//! the tree metadata so a disk tree reopens with the same `k_max`, distance
//! function and node capacities it was built with.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::distance::DistanceKind;
use crate::tree::constants::{
    COORD_SIZE, DEFAULT_PAGE_SIZE, DISTANCE_SIZE, ID_SIZE, NODE_OVERHEAD, SMALL_CAPACITY,
};
use crate::tree::split::SplitKind;
use crate::tree::types::{RknnError, RknnResult};

/// Construction parameters of a tree.
///
/// # Examples
///
/// ```rust
/// use rdknn::{DistanceKind, RdKnnSettings};
///
/// let settings = RdKnnSettings::builder()
///     .dimensionality(3)
///     .k_max(4)
///     .page_size(1024)
///     .distance(DistanceKind::Manhattan)
///     .build()
///     .expect("valid settings");
/// assert_eq!(settings.k_max, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdKnnSettings {
    /// Dimensionality of every indexed point
    pub dimensionality: usize,
    /// Largest k a reverse kNN query may ask for
    pub k_max: usize,
    /// Page budget in bytes, determines node capacities
    pub page_size: usize,
    pub distance: DistanceKind,
    pub split: SplitKind,
}

impl Default for RdKnnSettings {
    fn default() -> Self {
        Self {
            dimensionality: 2,
            k_max: 1,
            page_size: DEFAULT_PAGE_SIZE,
            distance: DistanceKind::Euclidean,
            split: SplitKind::Topological,
        }
    }
}

impl RdKnnSettings {
    pub fn builder() -> RdKnnSettingsBuilder {
        RdKnnSettingsBuilder::default()
    }

    /// Checks the settings and derives the node layout from them.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `k_max` or the dimensionality is zero, or
    /// if the page is too small to hold a splittable node.
    pub fn validate(&self) -> RknnResult<NodeLayout> {
        if self.k_max == 0 {
            return Err(RknnError::Configuration("k_max must be at least 1".into()));
        }
        if self.dimensionality == 0 {
            return Err(RknnError::Configuration(
                "dimensionality must be at least 1".into(),
            ));
        }
        NodeLayout::compute(self.page_size, self.dimensionality)
    }
}

/// Fluent builder for [`RdKnnSettings`]
#[derive(Debug, Clone, Default)]
pub struct RdKnnSettingsBuilder {
    settings: RdKnnSettings,
}

impl RdKnnSettingsBuilder {
    pub fn dimensionality(mut self, dimensionality: usize) -> Self {
        self.settings.dimensionality = dimensionality;
        self
    }

    pub fn k_max(mut self, k_max: usize) -> Self {
        self.settings.k_max = k_max;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.settings.page_size = page_size;
        self
    }

    pub fn distance(mut self, distance: DistanceKind) -> Self {
        self.settings.distance = distance;
        self
    }

    pub fn split(mut self, split: SplitKind) -> Self {
        self.settings.split = split;
        self
    }

    /// Validates and returns the settings.
    pub fn build(self) -> RknnResult<RdKnnSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

/// Node capacities derived from page size and dimensionality.
///
/// A node overflows once it holds `capacity` entries, so at most
/// `capacity - 1` entries are kept in a node after insertion completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub dir_capacity: usize,
    pub dir_minimum: usize,
    pub leaf_capacity: usize,
    pub leaf_minimum: usize,
}

impl NodeLayout {
    pub fn compute(page_size: usize, dimensionality: usize) -> RknnResult<Self> {
        let usable = page_size as f64 - NODE_OVERHEAD;
        if usable < 0.0 {
            return Err(too_small(page_size, dimensionality));
        }

        // child id + child MBR + aggregated knn distance
        let dir_entry = (ID_SIZE + 2 * dimensionality * COORD_SIZE + DISTANCE_SIZE) as f64;
        let dir_capacity = (usable / dir_entry) as usize + 1;
        // object id + coordinates + knn distance
        let leaf_entry = (ID_SIZE + dimensionality * COORD_SIZE + DISTANCE_SIZE) as f64;
        let leaf_capacity = (usable / leaf_entry) as usize + 1;

        if dir_capacity <= 1 || leaf_capacity <= 1 {
            return Err(too_small(page_size, dimensionality));
        }

        let dir_minimum = minimum_fill(dir_capacity);
        let leaf_minimum = minimum_fill(leaf_capacity);
        if 2 * dir_minimum > dir_capacity || 2 * leaf_minimum > leaf_capacity {
            return Err(too_small(page_size, dimensionality));
        }

        if dir_capacity < SMALL_CAPACITY {
            warn!(
                "Page size {} is small: a directory node holds at most {} entries",
                page_size,
                dir_capacity - 1
            );
        }
        if leaf_capacity < SMALL_CAPACITY {
            warn!(
                "Page size {} is small: a leaf node holds at most {} entries",
                page_size,
                leaf_capacity - 1
            );
        }
        debug!(
            "Directory capacity: {}, leaf capacity: {}",
            dir_capacity, leaf_capacity
        );

        Ok(Self {
            dir_capacity,
            dir_minimum,
            leaf_capacity,
            leaf_minimum,
        })
    }

    /// Most entries a leaf keeps without splitting
    pub fn leaf_max(&self) -> usize {
        self.leaf_capacity - 1
    }

    /// Most entries a directory node keeps without splitting
    pub fn dir_max(&self) -> usize {
        self.dir_capacity - 1
    }

    pub fn capacity(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_capacity
        } else {
            self.dir_capacity
        }
    }

    pub fn minimum(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_minimum
        } else {
            self.dir_minimum
        }
    }
}

fn minimum_fill(capacity: usize) -> usize {
    (((capacity - 1) as f64 * 0.5).round() as usize).max(2)
}

fn too_small(page_size: usize, dimensionality: usize) -> RknnError {
    RknnError::Configuration(format!(
        "Node size of {} bytes is chosen too small for {} dimensions",
        page_size, dimensionality
    ))
}
