//! Spatial distance functions.
//!
//! A tree is bound to exactly one distance function for its whole lifetime.
//! Every function here is a metric on the point space and provides an exact
//! lower bound (`min_dist`) from a point to anything inside a bounding box,
//! which is what the pruning rules of range, kNN and reverse kNN search rely
//! on.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::bounding_box::Mbr;
use crate::point::Point;

/// A metric with a box lower bound.
pub trait SpatialDistance {
    /// Distance between two points.
    fn distance(&self, a: &Point, b: &Point) -> f64;

    /// Smallest possible distance from `point` to any point inside `mbr`.
    fn min_dist(&self, mbr: &Mbr, point: &Point) -> f64;

    /// Identifies the function, used to reject queries issued with a
    /// different one than the tree was built with.
    fn kind(&self) -> DistanceKind;
}

/// The distance functions supported by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DistanceKind {
    /// L2 norm.
    #[default]
    Euclidean,
    /// L1 norm.
    Manhattan,
    /// L-infinity norm.
    Maximum,
}

impl DistanceKind {
    /// Folds per-dimension deltas according to the norm.
    fn fold<I>(&self, deltas: I) -> f64
    where
        I: Iterator<Item = f64>,
    {
        match self {
            DistanceKind::Euclidean => deltas.map(|d| d * d).sum::<f64>().sqrt(),
            DistanceKind::Manhattan => deltas.map(f64::abs).sum(),
            DistanceKind::Maximum => deltas.map(f64::abs).fold(0.0, f64::max),
        }
    }
}

impl SpatialDistance for DistanceKind {
    fn distance(&self, a: &Point, b: &Point) -> f64 {
        self.fold(a.coords().iter().zip(b.coords().iter()).map(|(x, y)| x - y))
    }

    fn min_dist(&self, mbr: &Mbr, point: &Point) -> f64 {
        // clamp the point into the box, then measure to the clamped point
        self.fold(point.coords().iter().enumerate().map(|(d, c)| {
            if *c < mbr.min()[d] {
                mbr.min()[d] - c
            } else if *c > mbr.max()[d] {
                c - mbr.max()[d]
            } else {
                0.0
            }
        }))
    }

    fn kind(&self) -> DistanceKind {
        *self
    }
}

impl Display for DistanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistanceKind::Euclidean => "euclidean",
            DistanceKind::Manhattan => "manhattan",
            DistanceKind::Maximum => "maximum",
        };
        f.write_str(name)
    }
}
