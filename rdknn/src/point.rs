//! Point type stored in the leaves of the index.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// An immutable n-dimensional coordinate vector.
///
/// The dimensionality of every point indexed by one tree is fixed by the
/// tree's settings; points of a different dimensionality are rejected on
/// insert and on query.
///
/// # Examples
///
/// ```rust
/// use rdknn::Point;
///
/// let p = Point::new(vec![1.0, 2.0]);
/// assert_eq!(p.dimensionality(), 2);
/// assert_eq!(p[1], 2.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    coords: Box<[f64]>,
}

impl Point {
    /// Creates a point from its coordinates.
    pub fn new(coords: Vec<f64>) -> Self {
        Self {
            coords: coords.into_boxed_slice(),
        }
    }

    /// Number of coordinates.
    pub fn dimensionality(&self) -> usize {
        self.coords.len()
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    /// Returns true if every coordinate is finite.
    pub fn is_finite(&self) -> bool {
        self.coords.iter().all(|c| c.is_finite())
    }
}

impl std::ops::Index<usize> for Point {
    type Output = f64;

    fn index(&self, dim: usize) -> &f64 {
        &self.coords[dim]
    }
}

impl From<Vec<f64>> for Point {
    fn from(coords: Vec<f64>) -> Self {
        Point::new(coords)
    }
}

impl<const N: usize> From<[f64; N]> for Point {
    fn from(coords: [f64; N]) -> Self {
        Point::new(coords.to_vec())
    }
}

impl From<&[f64]> for Point {
    fn from(coords: &[f64]) -> Self {
        Point::new(coords.to_vec())
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.coords.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_from_array() {
        let p = Point::from([3.0, 4.0, 5.0]);
        assert_eq!(p.dimensionality(), 3);
        assert_eq!(p.coords(), &[3.0, 4.0, 5.0]);
        assert_eq!(p[2], 5.0);
    }

    #[test]
    fn test_point_display() {
        let p = Point::new(vec![1.5, -2.0]);
        assert_eq!(p.to_string(), "(1.5, -2)");
    }

    #[test]
    fn test_point_is_finite() {
        assert!(Point::from([0.0, 1.0]).is_finite());
        assert!(!Point::from([f64::NAN, 1.0]).is_finite());
        assert!(!Point::from([f64::INFINITY, 1.0]).is_finite());
    }

    #[test]
    fn test_point_equality() {
        assert_eq!(Point::from([1.0, 2.0]), Point::new(vec![1.0, 2.0]));
        assert_ne!(Point::from([1.0, 2.0]), Point::from([2.0, 1.0]));
    }
}
