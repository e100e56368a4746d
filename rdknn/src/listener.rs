//! Callback hooks for structural events of a tree.
//!
//! A listener is installed explicitly on a tree and invoked synchronously
//! from the writer. Every method has a no-op default, so an implementation
//! only overrides what it cares about.

use crate::tree::types::{ObjectId, PageId};

/// Observer of tree maintenance.
///
/// # Examples
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use rdknn::{PageId, RdKnnSettings, RdKnnTree, TreeListener};
///
/// #[derive(Default)]
/// struct SplitCounter(AtomicUsize);
///
/// impl TreeListener for SplitCounter {
///     fn on_split(&self, _level: u32, _left: PageId, _right: PageId) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
///
/// let counter = Arc::new(SplitCounter::default());
/// let tree = RdKnnTree::in_memory(RdKnnSettings::default())
///     .unwrap()
///     .with_listener(counter.clone());
/// for i in 0..500u64 {
///     tree.insert(i, [i as f64, (i % 7) as f64].into()).unwrap();
/// }
/// assert!(counter.0.load(Ordering::Relaxed) > 0);
/// ```
pub trait TreeListener: Send + Sync {
    /// A node at `level` was split into two pages.
    fn on_split(&self, _level: u32, _left: PageId, _right: PageId) {}

    /// The tree grew or shrank at the root.
    fn on_root_change(&self, _old_height: u32, _new_height: u32) {}

    /// The stored kNN distance of an object changed.
    fn on_knn_adjusted(&self, _id: ObjectId, _old: f64, _new: f64) {}

    /// Progress of the kNN distance pass of a bulk load.
    fn on_bulk_progress(&self, _done: usize, _total: usize) {}
}
