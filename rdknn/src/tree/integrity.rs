//! Structural and kNN-distance consistency checks.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::point::Point;

use super::oracle::{BruteForceOracle, KnnOracle};
use super::page_store::PageStore;
use super::rdknn_impl::{check_open, RdKnnTree, RdKnnTreeInner, TreeState};
use super::types::{Node, ObjectId, PageId, RknnResult};

/// Result of an integrity check
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    /// Nodes visited
    pub pages_checked: u64,
    /// Leaf entries found below the root
    pub entries_counted: u64,
    /// Non-root nodes holding fewer entries than the minimum fill. These
    /// do not make the tree invalid.
    pub underfull_pages: Vec<PageId>,
    pub is_valid: bool,
    /// Detailed error messages
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            pages_checked: 0,
            entries_counted: 0,
            underfull_pages: Vec::new(),
            is_valid: true,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}

/// A leaf entry whose stored kNN distance differs from the exact one
#[derive(Debug, Clone, PartialEq)]
pub struct KnnMismatch {
    pub id: ObjectId,
    pub stored: f64,
    pub expected: f64,
}

impl<S: PageStore> RdKnnTree<S> {
    /// Walk the whole tree and check that
    /// every directory entry holds the exact bounding box and the maximum
    /// kNN distance of its child, all leaves sit at the same depth, no node
    /// overflows, and the leaves hold exactly the indexed objects.
    pub fn check_integrity(&self) -> RknnResult<IntegrityReport> {
        let state = self.inner.state.read();
        check_open(&state)?;

        let mut report = IntegrityReport::new();
        let mut seen = BTreeSet::new();
        let root = state.meta.root_page;
        let expected_level = state.meta.height.saturating_sub(1);
        self.inner
            .check_node(&state, root, expected_level, true, &mut seen, &mut report)?;

        if report.entries_counted != state.meta.entry_count {
            report.error(format!(
                "leaves hold {} objects, metadata counts {}",
                report.entries_counted, state.meta.entry_count
            ));
        }
        if seen.len() != state.relation.len() {
            report.error(format!(
                "leaves hold {} distinct objects, {} are indexed",
                seen.len(),
                state.relation.len()
            ));
        }

        if report.is_valid {
            debug!(
                "Integrity check passed: {} pages, {} objects",
                report.pages_checked, report.entries_counted
            );
        } else {
            warn!(
                "Integrity check found {} problems, first: {}",
                report.errors.len(),
                report.errors[0]
            );
        }
        Ok(report)
    }

    /// Compare every stored kNN distance against a linear scan.
    ///
    /// Quadratic in the number of objects, meant for tests and diagnostics.
    pub fn verify_knn_distances(&self, tolerance: f64) -> RknnResult<Vec<KnnMismatch>> {
        let state = self.inner.state.read();
        check_open(&state)?;

        let k_max = self.inner.settings.k_max;
        let oracle = BruteForceOracle::new(
            self.inner.settings.distance,
            state.relation.iter().map(|(id, p)| (*id, p.clone())),
        );

        let mut mismatches = Vec::new();
        let mut failure = None;
        self.inner
            .for_each_leaf_entry(state.meta.root_page, &mut |e| {
                if failure.is_some() {
                    return;
                }
                match oracle.knn_distance(e.id, k_max) {
                    Ok(expected) => {
                        if !within(e.knn_distance, expected, tolerance) {
                            mismatches.push(KnnMismatch {
                                id: e.id,
                                stored: e.knn_distance,
                                expected,
                            });
                        }
                    }
                    Err(err) => failure = Some(err),
                }
            })?;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(mismatches)
    }
}

fn within(stored: f64, expected: f64, tolerance: f64) -> bool {
    if stored.is_infinite() || expected.is_infinite() {
        return stored == expected;
    }
    (stored - expected).abs() <= tolerance
}

impl<S: PageStore> RdKnnTreeInner<S> {
    fn check_node(
        &self,
        state: &TreeState,
        page_id: PageId,
        expected_level: u32,
        is_root: bool,
        seen: &mut BTreeSet<ObjectId>,
        report: &mut IntegrityReport,
    ) -> RknnResult<()> {
        let node = match self.store.get(page_id) {
            Ok(node) => node,
            Err(e) => {
                report.error(format!("page {}: {}", page_id, e));
                return Ok(());
            }
        };
        report.pages_checked += 1;

        if node.level() != expected_level {
            report.error(format!(
                "page {} is at level {}, expected {}",
                page_id,
                node.level(),
                expected_level
            ));
            return Ok(());
        }

        let leaf = node.is_leaf();
        if node.len() >= self.layout.capacity(leaf) {
            report.error(format!(
                "page {} holds {} entries, more than the {} allowed",
                page_id,
                node.len(),
                self.layout.capacity(leaf) - 1
            ));
        }
        if !is_root && node.len() < self.layout.minimum(leaf) {
            report.underfull_pages.push(page_id);
        }

        match node {
            Node::Leaf { entries } => {
                for e in entries {
                    report.entries_counted += 1;
                    if !seen.insert(e.id) {
                        report.error(format!("object {} appears twice", e.id));
                    }
                    if e.knn_distance.is_nan() {
                        report.error(format!("object {} has a NaN kNN distance", e.id));
                    }
                    check_relation(state, e.id, &e.point, report);
                }
            }
            Node::Directory { entries, .. } => {
                if entries.is_empty() {
                    report.error(format!("directory page {} has no entries", page_id));
                }
                for e in entries {
                    if let Ok(child) = self.store.get(e.page_id) {
                        match child.compute_mbr() {
                            Some(mbr) if mbr == e.mbr => {}
                            Some(_) => report.error(format!(
                                "entry for page {} in page {} has a stale bounding box",
                                e.page_id, page_id
                            )),
                            None => report.error(format!(
                                "page {} is empty but referenced from page {}",
                                e.page_id, page_id
                            )),
                        }
                        let aggregate = child.knn_distance();
                        if aggregate != e.knn_distance {
                            report.error(format!(
                                "entry for page {} in page {} stores kNN distance {}, children have {}",
                                e.page_id, page_id, e.knn_distance, aggregate
                            ));
                        }
                    }
                    self.check_node(
                        state,
                        e.page_id,
                        expected_level.saturating_sub(1),
                        false,
                        seen,
                        report,
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn check_relation(state: &TreeState, id: ObjectId, point: &Point, report: &mut IntegrityReport) {
    match state.relation.get(&id) {
        Some(indexed) if indexed == point => {}
        Some(_) => report.error(format!("object {} is stored at a different point", id)),
        None => report.error(format!("object {} is in a leaf but not indexed", id)),
    }
}
