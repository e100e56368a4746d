//! Node splitting and bulk partitioning.
//!
//! A split divides the entries of an overflowing node into two groups of
//! at least `min_fill` entries each. Partitioning cuts a large set of
//! entries into spatially coherent groups of bounded size for bulk loading.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::bounding_box::Mbr;

use super::types::SpatialEntry;

/// Strategy for dividing entries between nodes.
pub trait SplitStrategy {
    /// Divide `entries` into two groups of at least `min_fill` entries each.
    fn split<E: SpatialEntry>(&self, entries: Vec<E>, min_fill: usize) -> (Vec<E>, Vec<E>);

    /// Cut `entries` into groups of at most `max_entries`.
    ///
    /// Groups are as even as possible, so every group holds at least half of
    /// `max_entries` (rounded up) unless everything fits into one group.
    fn partition<E: SpatialEntry>(&self, entries: Vec<E>, max_entries: usize) -> Vec<Vec<E>> {
        str_partition(entries, max_entries)
    }
}

/// The split strategies a tree can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SplitKind {
    /// R*-tree topological split: minimum margin axis, then minimum overlap.
    #[default]
    Topological,
    /// Cut at the median of the widest axis.
    Median,
}

impl SplitStrategy for SplitKind {
    fn split<E: SpatialEntry>(&self, entries: Vec<E>, min_fill: usize) -> (Vec<E>, Vec<E>) {
        match self {
            SplitKind::Topological => TopologicalSplit.split(entries, min_fill),
            SplitKind::Median => MedianSplit.split(entries, min_fill),
        }
    }
}

/// The R*-tree split.
///
/// For every axis the entries are sorted by their lower and by their upper
/// box bound. The axis whose candidate distributions have the smallest
/// total margin is chosen; on that axis the distribution with the least
/// overlap between the two groups wins, ties going to the smaller total
/// volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopologicalSplit;

impl SplitStrategy for TopologicalSplit {
    fn split<E: SpatialEntry>(&self, entries: Vec<E>, min_fill: usize) -> (Vec<E>, Vec<E>) {
        let n = entries.len();
        if n < 2 {
            return (entries, Vec::new());
        }
        let m = min_fill.clamp(1, n / 2);
        let mbrs: Vec<Mbr> = entries.iter().map(|e| e.mbr()).collect();
        let dims = mbrs[0].dimensionality();

        let mut best_axis: Option<(f64, [Vec<usize>; 2])> = None;
        for dim in 0..dims {
            let by_min = sorted_indices(&mbrs, |b| b.min()[dim], |b| b.max()[dim]);
            let by_max = sorted_indices(&mbrs, |b| b.max()[dim], |b| b.min()[dim]);

            let margin: f64 = [&by_min, &by_max]
                .iter()
                .map(|order| {
                    let (prefix, suffix) = sweep(&mbrs, order);
                    (m..=n - m)
                        .map(|k| prefix[k - 1].margin() + suffix[k].margin())
                        .sum::<f64>()
                })
                .sum();

            if best_axis.as_ref().map_or(true, |(best, _)| margin < *best) {
                best_axis = Some((margin, [by_min, by_max]));
            }
        }

        let Some((_, orders)) = best_axis else {
            return (entries, Vec::new());
        };

        // (overlap, volume, order, k)
        let mut best: Option<(f64, f64, usize, usize)> = None;
        for (o, order) in orders.iter().enumerate() {
            let (prefix, suffix) = sweep(&mbrs, order);
            for k in m..=n - m {
                let overlap = prefix[k - 1].overlap(&suffix[k]);
                let volume = prefix[k - 1].volume() + suffix[k].volume();
                let better = match best {
                    None => true,
                    Some((bo, bv, _, _)) => overlap < bo || (overlap == bo && volume < bv),
                };
                if better {
                    best = Some((overlap, volume, o, k));
                }
            }
        }

        let (order, k) = best.map_or((0, n / 2), |(_, _, o, k)| (o, k));
        distribute(entries, &orders[order], k)
    }
}

/// Cuts at the middle of the entries sorted along the widest axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianSplit;

impl SplitStrategy for MedianSplit {
    fn split<E: SpatialEntry>(&self, mut entries: Vec<E>, min_fill: usize) -> (Vec<E>, Vec<E>) {
        let n = entries.len();
        if n < 2 {
            return (entries, Vec::new());
        }
        let m = min_fill.clamp(1, n / 2);

        let bounds = entries
            .iter()
            .map(|e| e.mbr())
            .reduce(|acc, b| acc.union(&b));
        let axis = bounds.map_or(0, |b| {
            (0..b.dimensionality())
                .max_by(|a, c| b.extent(*a).total_cmp(&b.extent(*c)))
                .unwrap_or(0)
        });

        entries.sort_by(|a, b| a.center(axis).total_cmp(&b.center(axis)));
        let cut = (n / 2).clamp(m, n - m);
        let right = entries.split_off(cut);
        (entries, right)
    }
}

/// Indices of `mbrs` sorted by a primary and a secondary key.
fn sorted_indices<F, G>(mbrs: &[Mbr], primary: F, secondary: G) -> Vec<usize>
where
    F: Fn(&Mbr) -> f64,
    G: Fn(&Mbr) -> f64,
{
    let mut order: Vec<usize> = (0..mbrs.len()).collect();
    order.sort_by(|&a, &b| {
        primary(&mbrs[a])
            .total_cmp(&primary(&mbrs[b]))
            .then_with(|| secondary(&mbrs[a]).total_cmp(&secondary(&mbrs[b])))
    });
    order
}

/// Prefix and suffix bounding boxes along an ordering.
///
/// `prefix[i]` covers `order[..=i]` and `suffix[i]` covers `order[i..]`.
fn sweep(mbrs: &[Mbr], order: &[usize]) -> (Vec<Mbr>, Vec<Mbr>) {
    let mut prefix: Vec<Mbr> = Vec::with_capacity(order.len());
    for &i in order {
        let next = match prefix.last() {
            Some(last) => last.union(&mbrs[i]),
            None => mbrs[i].clone(),
        };
        prefix.push(next);
    }

    let mut suffix: Vec<Mbr> = Vec::with_capacity(order.len());
    for &i in order.iter().rev() {
        let next = match suffix.last() {
            Some(last) => last.union(&mbrs[i]),
            None => mbrs[i].clone(),
        };
        suffix.push(next);
    }
    suffix.reverse();
    (prefix, suffix)
}

/// Moves the first `k` entries of `order` to the left group, the rest right.
fn distribute<E>(entries: Vec<E>, order: &[usize], k: usize) -> (Vec<E>, Vec<E>) {
    let mut slots: Vec<Option<E>> = entries.into_iter().map(Some).collect();
    let mut left = Vec::with_capacity(k);
    let mut right = Vec::with_capacity(order.len() - k);
    for (pos, &i) in order.iter().enumerate() {
        if let Some(entry) = slots[i].take() {
            if pos < k {
                left.push(entry);
            } else {
                right.push(entry);
            }
        }
    }
    (left, right)
}

// ============================================================================
// Sort-Tile-Recursive partitioning
// ============================================================================

/// Orders entries by Sort-Tile-Recursive slicing and cuts the ordering into
/// `ceil(n / max_entries)` groups of nearly equal size.
pub fn str_partition<E: SpatialEntry>(entries: Vec<E>, max_entries: usize) -> Vec<Vec<E>> {
    let n = entries.len();
    let max_entries = max_entries.max(1);
    if n <= max_entries {
        return vec![entries];
    }
    let dims = entries[0].mbr().dimensionality();
    let ordered = str_order(entries, 0, dims, max_entries);

    let groups = n.div_ceil(max_entries);
    let base = n / groups;
    let extra = n % groups;

    let mut result = Vec::with_capacity(groups);
    let mut iter = ordered.into_iter();
    for g in 0..groups {
        let size = if g < extra { base + 1 } else { base };
        result.push(iter.by_ref().take(size).collect());
    }
    result
}

fn str_order<E: SpatialEntry>(
    mut entries: Vec<E>,
    dim: usize,
    dims: usize,
    max_entries: usize,
) -> Vec<E> {
    entries.sort_by(|a, b| compare_center(a, b, dim));
    if dim + 1 >= dims || entries.len() <= max_entries {
        return entries;
    }

    // slices along this axis so that every remaining axis gets as many
    let pages = entries.len().div_ceil(max_entries) as f64;
    let slices = pages.powf(1.0 / (dims - dim) as f64).ceil().max(1.0) as usize;
    let slice_len = entries.len().div_ceil(slices);

    let mut ordered = Vec::with_capacity(entries.len());
    let mut rest = entries;
    while !rest.is_empty() {
        let tail = rest.split_off(slice_len.min(rest.len()));
        ordered.extend(str_order(rest, dim + 1, dims, max_entries));
        rest = tail;
    }
    ordered
}

fn compare_center<E: SpatialEntry>(a: &E, b: &E, dim: usize) -> Ordering {
    a.center(dim).total_cmp(&b.center(dim))
}
