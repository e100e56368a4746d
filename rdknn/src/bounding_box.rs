use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::point::Point;

/// An n-dimensional minimum bounding rectangle.
///
/// `Mbr` stores the per-dimension minimum and maximum corner of a set of
/// points or subtrees. Every directory entry of the tree carries one, and
/// it must tightly enclose everything stored below that entry.
///
/// # Examples
///
/// ```rust
/// use rdknn::{Mbr, Point};
///
/// let mut mbr = Mbr::from_point(&Point::from([0.0, 0.0]));
/// mbr.extend_point(&Point::from([2.0, 1.0]));
/// assert_eq!(mbr.volume(), 2.0);
/// assert!(mbr.contains_point(&Point::from([1.0, 0.5])));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mbr {
    min: Box<[f64]>,
    max: Box<[f64]>,
}

impl Mbr {
    /// Creates a box from its corners. Both corners must have the same length.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Self {
        debug_assert_eq!(min.len(), max.len());
        Self {
            min: min.into_boxed_slice(),
            max: max.into_boxed_slice(),
        }
    }

    /// Degenerate box covering a single point.
    pub fn from_point(point: &Point) -> Self {
        Self {
            min: point.coords().into(),
            max: point.coords().into(),
        }
    }

    /// An inverted box that acts as the identity for `extend`.
    pub fn empty(dimensionality: usize) -> Self {
        Self {
            min: vec![f64::INFINITY; dimensionality].into_boxed_slice(),
            max: vec![f64::NEG_INFINITY; dimensionality].into_boxed_slice(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(self.max.iter()).any(|(lo, hi)| lo > hi)
    }

    pub fn dimensionality(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// Grows this box to also cover `other`.
    pub fn extend(&mut self, other: &Mbr) {
        for d in 0..self.min.len() {
            self.min[d] = self.min[d].min(other.min[d]);
            self.max[d] = self.max[d].max(other.max[d]);
        }
    }

    /// Grows this box to also cover `point`.
    pub fn extend_point(&mut self, point: &Point) {
        for (d, c) in point.coords().iter().enumerate() {
            self.min[d] = self.min[d].min(*c);
            self.max[d] = self.max[d].max(*c);
        }
    }

    pub fn union(&self, other: &Mbr) -> Mbr {
        let mut merged = self.clone();
        merged.extend(other);
        merged
    }

    /// Product of the side lengths.
    pub fn volume(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.min
            .iter()
            .zip(self.max.iter())
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Sum of the side lengths (the R* "margin" up to a constant factor).
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.min
            .iter()
            .zip(self.max.iter())
            .map(|(lo, hi)| hi - lo)
            .sum()
    }

    /// Volume of the intersection with `other`, zero when disjoint.
    pub fn overlap(&self, other: &Mbr) -> f64 {
        let mut volume = 1.0;
        for d in 0..self.min.len() {
            let lo = self.min[d].max(other.min[d]);
            let hi = self.max[d].min(other.max[d]);
            if hi <= lo {
                return 0.0;
            }
            volume *= hi - lo;
        }
        volume
    }

    /// Volume increase needed to also cover `other`.
    pub fn enlargement(&self, other: &Mbr) -> f64 {
        self.union(other).volume() - self.volume()
    }

    pub fn intersects(&self, other: &Mbr) -> bool {
        (0..self.min.len()).all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    pub fn contains(&self, other: &Mbr) -> bool {
        (0..self.min.len()).all(|d| self.min[d] <= other.min[d] && other.max[d] <= self.max[d])
    }

    pub fn contains_point(&self, point: &Point) -> bool {
        point
            .coords()
            .iter()
            .enumerate()
            .all(|(d, c)| self.min[d] <= *c && *c <= self.max[d])
    }

    /// Center coordinate along one dimension.
    pub fn center(&self, dim: usize) -> f64 {
        (self.min[dim] + self.max[dim]) / 2.0
    }

    /// Side length along one dimension.
    pub fn extent(&self, dim: usize) -> f64 {
        self.max[dim] - self.min[dim]
    }
}

impl Display for Mbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mbr({:?} .. {:?})", self.min, self.max)
    }
}

/// Bounding box of a sequence of boxes, `None` when the sequence is empty.
pub fn union_all<'a, I>(boxes: I) -> Option<Mbr>
where
    I: IntoIterator<Item = &'a Mbr>,
{
    let mut iter = boxes.into_iter();
    let mut merged = iter.next()?.clone();
    for mbr in iter {
        merged.extend(mbr);
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr(min: [f64; 2], max: [f64; 2]) -> Mbr {
        Mbr::new(min.to_vec(), max.to_vec())
    }

    #[test]
    fn test_empty_box_is_identity_for_extend() {
        let mut b = Mbr::empty(2);
        assert!(b.is_empty());
        assert_eq!(b.volume(), 0.0);
        b.extend(&mbr([1.0, 1.0], [2.0, 3.0]));
        assert_eq!(b, mbr([1.0, 1.0], [2.0, 3.0]));
        assert!(!b.is_empty());
    }

    #[test]
    fn test_volume_and_margin() {
        let b = mbr([0.0, 0.0], [2.0, 3.0]);
        assert_eq!(b.volume(), 6.0);
        assert_eq!(b.margin(), 5.0);
    }

    #[test]
    fn test_overlap() {
        let a = mbr([0.0, 0.0], [2.0, 2.0]);
        let b = mbr([1.0, 1.0], [3.0, 3.0]);
        let c = mbr([5.0, 5.0], [6.0, 6.0]);
        assert_eq!(a.overlap(&b), 1.0);
        assert_eq!(a.overlap(&c), 0.0);
        // touching boxes share no volume
        let d = mbr([2.0, 0.0], [3.0, 2.0]);
        assert_eq!(a.overlap(&d), 0.0);
    }

    #[test]
    fn test_enlargement() {
        let a = mbr([0.0, 0.0], [1.0, 1.0]);
        let inside = mbr([0.2, 0.2], [0.8, 0.8]);
        let outside = mbr([0.0, 0.0], [2.0, 1.0]);
        assert_eq!(a.enlargement(&inside), 0.0);
        assert_eq!(a.enlargement(&outside), 1.0);
    }

    #[test]
    fn test_intersects_and_contains() {
        let a = mbr([0.0, 0.0], [10.0, 10.0]);
        let b = mbr([5.0, 5.0], [15.0, 15.0]);
        let c = mbr([2.0, 2.0], [3.0, 3.0]);
        assert!(a.intersects(&b));
        assert!(a.contains(&c));
        assert!(!a.contains(&b));
        assert!(a.contains_point(&Point::from([10.0, 0.0])));
        assert!(!a.contains_point(&Point::from([10.1, 0.0])));
    }

    #[test]
    fn test_union_all() {
        let boxes = vec![mbr([0.0, 0.0], [1.0, 1.0]), mbr([-1.0, 2.0], [0.5, 4.0])];
        let merged = union_all(boxes.iter()).unwrap();
        assert_eq!(merged, mbr([-1.0, 0.0], [1.0, 4.0]));
        assert!(union_all(Vec::<Mbr>::new().iter()).is_none());
    }

    #[test]
    fn test_center_and_extent() {
        let b = mbr([0.0, 2.0], [4.0, 3.0]);
        assert_eq!(b.center(0), 2.0);
        assert_eq!(b.extent(1), 1.0);
    }
}
