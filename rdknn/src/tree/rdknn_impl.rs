//! RdKnnTree implementation.
//!
//! Every entry of the tree carries a kNN distance: a leaf entry stores the
//! distance from its object to the object's `k_max`-th nearest other object,
//! a directory entry stores the maximum over its subtree. Insertion keeps
//! these values exact incrementally; deletion and bulk loading recompute the
//! affected values through a kNN oracle and push them down the tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::RwLock;

use crate::bounding_box::Mbr;
use crate::distance::SpatialDistance;
use crate::listener::TreeListener;
use crate::point::Point;
use crate::settings::{NodeLayout, RdKnnSettings};

use super::constants::DEFAULT_CACHE_PAGES;
use super::oracle::{KnnHeap, KnnOracle};
use super::page_store::{check_page_fit, DiskPageStore, MemoryPageStore, PageStore, StoreOptions};
use super::query::{Exclude, IndexOracle};
use super::split::SplitStrategy;
use super::types::{
    DirectoryEntry, LeafEntry, Node, ObjectId, PageId, RebuildStats, RknnError, RknnResult,
    TreeMeta, TreeStats,
};

/// Directory pages from the root down, each with the index of the child
/// entry taken. Built per operation, never stored.
pub(crate) type TreePath = Vec<(PageId, usize)>;

/// Bulk loads report progress to the listener after this many objects
const PROGRESS_STEP: usize = 1000;

/// A reverse k-nearest-neighbour index over n-dimensional points.
///
/// The tree is an R*-tree whose entries additionally carry the aggregated
/// `k_max`-nearest-neighbour distance of the objects below them, which lets
/// a reverse kNN query prune every subtree that is farther from the query
/// than all of its objects are from their own neighbours.
///
/// Handles are cheap to clone and share one index. Mutations take an
/// exclusive lock; queries run concurrently with each other.
///
/// # Examples
///
/// ```rust
/// use rdknn::{RdKnnSettings, RdKnnTree};
///
/// let tree = RdKnnTree::in_memory(RdKnnSettings::default()).unwrap();
/// tree.insert(1, [0.0, 0.0].into()).unwrap();
/// tree.insert(2, [1.0, 0.0].into()).unwrap();
/// tree.insert(3, [5.0, 5.0].into()).unwrap();
///
/// let rknn = tree.reverse_knn_query(&[0.9, 0.0].into(), 1).unwrap();
/// let ids: Vec<_> = rknn.iter().map(|n| n.id).collect();
/// assert_eq!(ids, vec![2, 1]);
/// ```
pub struct RdKnnTree<S: PageStore = MemoryPageStore> {
    pub(crate) inner: Arc<RdKnnTreeInner<S>>,
}

pub(crate) struct RdKnnTreeInner<S> {
    pub(crate) store: S,
    pub(crate) settings: RdKnnSettings,
    pub(crate) layout: NodeLayout,
    pub(crate) state: RwLock<TreeState>,
    listener: RwLock<Option<Arc<dyn TreeListener>>>,
}

/// Everything a mutation changes besides the pages
pub(crate) struct TreeState {
    pub(crate) meta: TreeMeta,
    /// All indexed objects by id
    pub(crate) relation: BTreeMap<ObjectId, Point>,
    pub(crate) closed: bool,
}

impl<S: PageStore> Clone for RdKnnTree<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RdKnnTree<MemoryPageStore> {
    /// Create an empty tree held entirely in memory.
    pub fn in_memory(settings: RdKnnSettings) -> RknnResult<Self> {
        Self::new(MemoryPageStore::new(), settings)
    }
}

impl RdKnnTree<DiskPageStore> {
    /// Create a new disk-based tree at the given path.
    ///
    /// Any existing file at `path` is replaced.
    pub fn create(path: impl AsRef<Path>, settings: RdKnnSettings) -> RknnResult<Self> {
        Self::create_with_options(path, settings, StoreOptions::default())
    }

    /// Create with custom page slot and cache sizes
    pub fn create_with_options(
        path: impl AsRef<Path>,
        settings: RdKnnSettings,
        options: StoreOptions,
    ) -> RknnResult<Self> {
        // fail before touching the file system
        let layout = settings.validate()?;
        check_page_fit(Some(options.slot_size), &settings, &layout)?;
        let store = DiskPageStore::create(path.as_ref(), options)?;
        let tree = Self::new(store, settings)?;
        info!("Created index {}", path.as_ref().display());
        Ok(tree)
    }

    /// Open an existing disk-based tree.
    ///
    /// Settings, height and size come from the file header; the object
    /// table is rebuilt by one scan over the leaves.
    pub fn open(path: impl AsRef<Path>) -> RknnResult<Self> {
        Self::open_with_cache_size(path, DEFAULT_CACHE_PAGES)
    }

    /// Open with custom cache size
    pub fn open_with_cache_size(path: impl AsRef<Path>, cache_pages: usize) -> RknnResult<Self> {
        let store = DiskPageStore::open(path.as_ref(), cache_pages)?;
        let tree = Self::from_store(store)?;
        info!(
            "Opened index {} with {} objects",
            path.as_ref().display(),
            tree.len()
        );
        Ok(tree)
    }
}

impl<S: PageStore> RdKnnTree<S> {
    /// Create an empty tree in a store that holds no tree yet.
    ///
    /// # Errors
    ///
    /// `Configuration` if the settings are invalid, if a full node does not
    /// fit into a page of the store, or if the store already holds a tree.
    pub fn new(store: S, settings: RdKnnSettings) -> RknnResult<Self> {
        let layout = settings.validate()?;
        check_page_fit(store.max_page_bytes(), &settings, &layout)?;
        if store.load_meta()?.is_some() {
            return Err(RknnError::Configuration(
                "page store already holds an index, open it instead".into(),
            ));
        }

        let root_page = store.allocate()?;
        store.put(root_page, Node::empty_leaf())?;
        let meta = TreeMeta {
            settings: settings.clone(),
            root_page,
            height: 1,
            entry_count: 0,
        };
        store.store_meta(&meta)?;
        debug!(
            "New index: k_max {}, {} dimensions, {} distance, root page {}",
            settings.k_max, settings.dimensionality, settings.distance, root_page
        );

        Ok(Self::from_parts(store, settings, layout, meta))
    }

    /// Reopen the tree a store already holds.
    pub fn from_store(store: S) -> RknnResult<Self> {
        let meta = store
            .load_meta()?
            .ok_or_else(|| RknnError::Configuration("page store holds no index".into()))?;
        let settings = meta.settings.clone();
        let layout = settings.validate()?;
        check_page_fit(store.max_page_bytes(), &settings, &layout)?;
        let expected = meta.entry_count;

        let tree = Self::from_parts(store, settings, layout, meta);
        {
            let mut state = tree.inner.state.write();
            let root = state.meta.root_page;
            let mut relation = BTreeMap::new();
            tree.inner.for_each_leaf_entry(root, &mut |e| {
                relation.insert(e.id, e.point.clone());
            })?;
            if relation.len() as u64 != expected {
                return Err(RknnError::IntegrityViolation(format!(
                    "header counts {} objects but the leaves hold {}",
                    expected,
                    relation.len()
                )));
            }
            state.relation = relation;
        }
        Ok(tree)
    }

    fn from_parts(store: S, settings: RdKnnSettings, layout: NodeLayout, meta: TreeMeta) -> Self {
        Self {
            inner: Arc::new(RdKnnTreeInner {
                store,
                settings,
                layout,
                state: RwLock::new(TreeState {
                    meta,
                    relation: BTreeMap::new(),
                    closed: false,
                }),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Install a listener and return the tree.
    pub fn with_listener(self, listener: Arc<dyn TreeListener>) -> Self {
        self.set_listener(listener);
        self
    }

    pub fn set_listener(&self, listener: Arc<dyn TreeListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Index a new object.
    ///
    /// The kNN distance of the new object and of every object that now has
    /// it among its `k_max` nearest neighbours is updated before the entry
    /// is placed, so all entries are exact when the call returns.
    pub fn insert(&self, id: ObjectId, point: Point) -> RknnResult<()> {
        let mut state = self.inner.state.write();
        check_open(&state)?;
        self.inner.check_point(&point)?;
        if state.relation.contains_key(&id) {
            return Err(RknnError::DuplicateObject(id));
        }

        self.inner.insert_object(&mut state, id, point)?;
        self.inner.store.store_meta(&state.meta)
    }

    /// Index a batch of objects.
    ///
    /// An empty tree is bulk loaded, anything else gets one insert per
    /// object. The whole batch is validated before the tree is touched.
    pub fn insert_all<I>(&self, objects: I) -> RknnResult<usize>
    where
        I: IntoIterator<Item = (ObjectId, Point)>,
    {
        let objects: Vec<(ObjectId, Point)> = objects.into_iter().collect();
        let mut state = self.inner.state.write();
        check_open(&state)?;

        let mut seen = BTreeSet::new();
        for (id, point) in &objects {
            self.inner.check_point(point)?;
            if state.relation.contains_key(id) || !seen.insert(*id) {
                return Err(RknnError::DuplicateObject(*id));
            }
        }

        let count = objects.len();
        if state.relation.is_empty() && count > 1 {
            self.inner.bulk_load(&mut state, objects)?;
        } else {
            for (id, point) in objects {
                self.inner.insert_object(&mut state, id, point)?;
            }
        }
        self.inner.store.store_meta(&state.meta)?;
        Ok(count)
    }

    /// Remove an object. Returns false if it was not indexed.
    pub fn delete(&self, id: ObjectId) -> RknnResult<bool> {
        let mut state = self.inner.state.write();
        check_open(&state)?;
        let Some(point) = state.relation.get(&id).cloned() else {
            return Ok(false);
        };

        self.inner.delete_object(&mut state, id, &point)?;
        self.inner.store.store_meta(&state.meta)?;
        Ok(true)
    }

    /// Remove several objects, returning how many were indexed.
    pub fn delete_all<I>(&self, ids: I) -> RknnResult<usize>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let mut state = self.inner.state.write();
        check_open(&state)?;

        let mut removed = 0;
        for id in ids {
            if let Some(point) = state.relation.get(&id).cloned() {
                self.inner.delete_object(&mut state, id, &point)?;
                removed += 1;
            }
        }
        self.inner.store.store_meta(&state.meta)?;
        Ok(removed)
    }

    /// Remove every object, keeping settings and the root page.
    pub fn clear(&self) -> RknnResult<()> {
        let mut state = self.inner.state.write();
        check_open(&state)?;
        self.inner.reset(&mut state)?;
        self.inner.store.store_meta(&state.meta)
    }

    /// Reconstructs the tree by bulk loading all of its objects.
    ///
    /// Useful after many deletions have left the tree sparse. All kNN
    /// distances are recomputed.
    pub fn rebuild(&self) -> RknnResult<RebuildStats> {
        let mut state = self.inner.state.write();
        check_open(&state)?;

        let old_height = state.meta.height;
        let pages_before = self.inner.store.stats().allocated_pages;
        let objects: Vec<(ObjectId, Point)> = state
            .relation
            .iter()
            .map(|(id, point)| (*id, point.clone()))
            .collect();
        let entries_rebuilt = objects.len() as u64;

        self.inner.reset(&mut state)?;
        if objects.len() > 1 {
            self.inner.bulk_load(&mut state, objects)?;
        } else {
            for (id, point) in objects {
                self.inner.insert_object(&mut state, id, point)?;
            }
        }
        self.inner.store.store_meta(&state.meta)?;

        let stats = RebuildStats {
            entries_rebuilt,
            old_height,
            new_height: state.meta.height,
            pages_before,
            pages_after: self.inner.store.stats().allocated_pages,
        };
        debug!("Rebuilt index: {:?}", stats);
        Ok(stats)
    }

    /// Write all pending changes through to the page store.
    pub fn flush(&self) -> RknnResult<()> {
        let state = self.inner.state.read();
        check_open(&state)?;
        self.inner.store.store_meta(&state.meta)?;
        self.inner.store.flush()
    }

    /// Flush and refuse all further operations. Closing twice is a no-op.
    pub fn close(&self) -> RknnResult<()> {
        let mut state = self.inner.state.write();
        if state.closed {
            return Ok(());
        }
        self.inner.store.store_meta(&state.meta)?;
        self.inner.store.flush()?;
        state.closed = true;
        info!("Closed index with {} objects", state.relation.len());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of indexed objects
    pub fn len(&self) -> usize {
        self.inner.state.read().relation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of node levels, 1 for a tree that is a single leaf
    pub fn height(&self) -> u32 {
        self.inner.state.read().meta.height
    }

    pub fn k_max(&self) -> usize {
        self.inner.settings.k_max
    }

    pub fn settings(&self) -> &RdKnnSettings {
        &self.inner.settings
    }

    pub fn layout(&self) -> NodeLayout {
        self.inner.layout
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.state.read().relation.contains_key(&id)
    }

    /// Coordinates of an indexed object
    pub fn point(&self, id: ObjectId) -> Option<Point> {
        self.inner.state.read().relation.get(&id).cloned()
    }

    /// Stored kNN distance of an object, `None` if it is not indexed.
    pub fn knn_distance(&self, id: ObjectId) -> RknnResult<Option<f64>> {
        let state = self.inner.state.read();
        check_open(&state)?;
        let Some(point) = state.relation.get(&id) else {
            return Ok(None);
        };

        let mut path = TreePath::new();
        match self
            .inner
            .find_leaf(state.meta.root_page, id, point, &mut path)?
        {
            Some((page, idx)) => match self.inner.store.get(page)? {
                Node::Leaf { entries } => Ok(Some(entries[idx].knn_distance)),
                Node::Directory { .. } => Err(not_a_leaf(page)),
            },
            None => Err(missing_from_tree(id)),
        }
    }

    /// Stored kNN distances of all objects, by id.
    pub fn knn_distances(&self) -> RknnResult<BTreeMap<ObjectId, f64>> {
        let state = self.inner.state.read();
        check_open(&state)?;
        let mut result = BTreeMap::new();
        self.inner
            .for_each_leaf_entry(state.meta.root_page, &mut |e| {
                result.insert(e.id, e.knn_distance);
            })?;
        Ok(result)
    }

    /// Get comprehensive statistics
    pub fn stats(&self) -> RknnResult<TreeStats> {
        let state = self.inner.state.read();
        check_open(&state)?;
        let root = state.meta.root_page;
        let (leaf_nodes, directory_nodes) = self.inner.count_nodes(root)?;

        Ok(TreeStats {
            total_entries: state.meta.entry_count,
            tree_height: state.meta.height,
            leaf_nodes,
            directory_nodes,
            root_knn_distance: self.inner.store.get(root)?.knn_distance(),
            store: self.inner.store.stats(),
        })
    }
}

pub(crate) fn check_open(state: &TreeState) -> RknnResult<()> {
    if state.closed {
        Err(RknnError::Closed)
    } else {
        Ok(())
    }
}

fn not_a_leaf(page_id: PageId) -> RknnError {
    RknnError::IntegrityViolation(format!("page {} was expected to be a leaf", page_id))
}

fn not_a_directory(page_id: PageId) -> RknnError {
    RknnError::IntegrityViolation(format!("page {} was expected to be a directory", page_id))
}

fn missing_from_tree(id: ObjectId) -> RknnError {
    RknnError::IntegrityViolation(format!("object {} is indexed but not in any leaf", id))
}

// ============================================================================
// Engine
// ============================================================================

impl<S: PageStore> RdKnnTreeInner<S> {
    pub(crate) fn check_point(&self, point: &Point) -> RknnResult<()> {
        if point.dimensionality() != self.settings.dimensionality {
            return Err(RknnError::DimensionMismatch {
                expected: self.settings.dimensionality,
                actual: point.dimensionality(),
            });
        }
        if !point.is_finite() {
            return Err(RknnError::InvalidPoint(format!(
                "{} has a coordinate that is not finite",
                point
            )));
        }
        Ok(())
    }

    /// Read a node, let `f` change it, and write it back whatever `f`
    /// returns.
    pub(crate) fn with_node_mut<T, F>(&self, page_id: PageId, f: F) -> RknnResult<T>
    where
        F: FnOnce(&mut Node) -> RknnResult<T>,
    {
        let mut node = self.store.get(page_id)?;
        let result = f(&mut node);
        let written = self.store.put(page_id, node);
        let value = result?;
        written?;
        Ok(value)
    }

    fn notify<F>(&self, event: F)
    where
        F: FnOnce(&dyn TreeListener),
    {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            event(listener.as_ref());
        }
    }

    fn set_knn_distance(&self, entry: &mut LeafEntry, knn_distance: f64) {
        if entry.knn_distance != knn_distance {
            trace!(
                "kNN distance of {}: {} -> {}",
                entry.id,
                entry.knn_distance,
                knn_distance
            );
            self.notify(|l| l.on_knn_adjusted(entry.id, entry.knn_distance, knn_distance));
            entry.knn_distance = knn_distance;
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    pub(crate) fn insert_object(
        &self,
        state: &mut TreeState,
        id: ObjectId,
        point: Point,
    ) -> RknnResult<()> {
        let root = state.meta.root_page;
        let mut entry = LeafEntry::new(id, point);
        if !state.relation.is_empty() {
            let mut heap = KnnHeap::new(self.settings.k_max);
            self.pre_insert(root, root, &entry, &mut heap)?;
            entry.knn_distance = heap.knn_distance();
        }

        let point = entry.point.clone();
        self.insert_leaf_entry(state, entry)?;
        state.relation.insert(id, point);
        state.meta.entry_count += 1;
        Ok(())
    }

    /// Collects the neighbours of `q` into `heap` and updates the kNN
    /// distance of every object that gets `q` as a new neighbour. Returns
    /// the aggregate kNN distance of the node at `page_id` afterwards.
    fn pre_insert(
        &self,
        root: PageId,
        page_id: PageId,
        q: &LeafEntry,
        heap: &mut KnnHeap,
    ) -> RknnResult<f64> {
        let distance = self.settings.distance;
        self.with_node_mut(page_id, |node| {
            match node {
                Node::Leaf { entries } => {
                    for p in entries.iter_mut() {
                        let dist = distance.distance(&p.point, &q.point);
                        if dist <= heap.knn_distance() {
                            heap.insert(p.id, dist);
                        }
                        if dist <= p.knn_distance {
                            let updated = self.knn_distance_with(root, p, q.id, dist)?;
                            self.set_knn_distance(p, updated);
                        }
                    }
                }
                Node::Directory { entries, .. } => {
                    let mut order: Vec<(f64, usize)> = entries
                        .iter()
                        .enumerate()
                        .map(|(i, e)| (distance.min_dist(&e.mbr, &q.point), i))
                        .collect();
                    order.sort_by(|a, b| a.0.total_cmp(&b.0));

                    for (min_dist, i) in order {
                        let entry = &mut entries[i];
                        if min_dist < entry.knn_distance || min_dist < heap.knn_distance() {
                            entry.knn_distance = self.pre_insert(root, entry.page_id, q, heap)?;
                        }
                    }
                }
            }
            Ok(node.knn_distance())
        })
    }

    /// kNN distance of `p` once `q` joins its candidate neighbours at
    /// distance `dist_pq`.
    fn knn_distance_with(
        &self,
        root: PageId,
        p: &LeafEntry,
        q: ObjectId,
        dist_pq: f64,
    ) -> RknnResult<f64> {
        let k_max = self.settings.k_max;
        let mut heap = KnnHeap::new(k_max);
        for n in self.knn_search(root, &p.point, k_max, Some(p.id))? {
            heap.insert(n.id, n.distance);
        }
        heap.insert(q, dist_pq);
        Ok(heap.knn_distance())
    }

    /// Structural insertion only: place the entry, split what overflows and
    /// refresh the entries on the path. Leaves kNN distances as they are.
    fn insert_leaf_entry(&self, state: &mut TreeState, entry: LeafEntry) -> RknnResult<()> {
        let root = state.meta.root_page;
        let mbr = Mbr::from_point(&entry.point);
        let (path, leaf) = self.choose_path(root, &mbr)?;

        self.with_node_mut(leaf, |node| match node {
            Node::Leaf { entries } => {
                entries.push(entry);
                Ok(())
            }
            Node::Directory { .. } => Err(not_a_leaf(leaf)),
        })?;
        self.adjust_tree(state, &path, leaf)
    }

    /// Descend from the root to the leaf that should receive `mbr`.
    fn choose_path(&self, root: PageId, mbr: &Mbr) -> RknnResult<(TreePath, PageId)> {
        let mut path = TreePath::new();
        let mut page_id = root;
        loop {
            match self.store.get(page_id)? {
                Node::Leaf { .. } => return Ok((path, page_id)),
                Node::Directory { entries, .. } => {
                    let idx = choose_subtree(&entries, mbr).ok_or_else(|| {
                        RknnError::IntegrityViolation(format!(
                            "directory page {} has no entries",
                            page_id
                        ))
                    })?;
                    path.push((page_id, idx));
                    page_id = entries[idx].page_id;
                }
            }
        }
    }

    /// Walk up from `start`, splitting overflowing nodes and rewriting each
    /// parent entry from its child.
    fn adjust_tree(&self, state: &mut TreeState, path: &[(PageId, usize)], start: PageId) -> RknnResult<()> {
        let mut current = start;
        for &(parent, idx) in path.iter().rev() {
            let node = self.store.get(current)?;
            let (entry, sibling) = self.split_if_overflowing(current, node)?;
            self.with_node_mut(parent, |p| match p {
                Node::Directory { entries, .. } => {
                    entries[idx] = entry;
                    entries.extend(sibling);
                    Ok(())
                }
                Node::Leaf { .. } => Err(not_a_directory(parent)),
            })?;
            current = parent;
        }

        let root = self.store.get(current)?;
        if root.len() >= self.layout.capacity(root.is_leaf()) {
            self.split_root(state, current, root)?;
        }
        Ok(())
    }

    /// Entry for the node at `page_id`, plus one for a new sibling page if
    /// the node had to be split.
    fn split_if_overflowing(
        &self,
        page_id: PageId,
        node: Node,
    ) -> RknnResult<(DirectoryEntry, Option<DirectoryEntry>)> {
        if node.len() < self.layout.capacity(node.is_leaf()) {
            return Ok((node.to_directory_entry(page_id)?, None));
        }

        let level = node.level();
        let (left, right) = self.split_node(node);
        let right_page = self.store.allocate()?;
        let left_entry = left.to_directory_entry(page_id)?;
        let right_entry = right.to_directory_entry(right_page)?;
        debug!(
            "Split page {} at level {}: {} + {} entries, new page {}",
            page_id,
            level,
            left.len(),
            right.len(),
            right_page
        );
        self.store.put(page_id, left)?;
        self.store.put(right_page, right)?;
        self.notify(|l| l.on_split(level, page_id, right_page));
        Ok((left_entry, Some(right_entry)))
    }

    /// The root keeps its page: both halves move to new pages and the root
    /// becomes a directory one level higher.
    fn split_root(&self, state: &mut TreeState, root: PageId, node: Node) -> RknnResult<()> {
        let level = node.level();
        let (left, right) = self.split_node(node);
        let left_page = self.store.allocate()?;
        let right_page = self.store.allocate()?;
        let entries = vec![
            left.to_directory_entry(left_page)?,
            right.to_directory_entry(right_page)?,
        ];
        self.store.put(left_page, left)?;
        self.store.put(right_page, right)?;
        self.store.put(
            root,
            Node::Directory {
                entries,
                level: level + 1,
            },
        )?;

        let old_height = state.meta.height;
        state.meta.height += 1;
        debug!(
            "Root split: height {} -> {}, children {} and {}",
            old_height, state.meta.height, left_page, right_page
        );
        let new_height = state.meta.height;
        self.notify(|l| {
            l.on_split(level, left_page, right_page);
            l.on_root_change(old_height, new_height);
        });
        Ok(())
    }

    fn split_node(&self, node: Node) -> (Node, Node) {
        let split = self.settings.split;
        match node {
            Node::Leaf { entries } => {
                let (left, right) = split.split(entries, self.layout.leaf_minimum);
                (Node::Leaf { entries: left }, Node::Leaf { entries: right })
            }
            Node::Directory { entries, level } => {
                let (left, right) = split.split(entries, self.layout.dir_minimum);
                (
                    Node::Directory {
                        entries: left,
                        level,
                    },
                    Node::Directory {
                        entries: right,
                        level,
                    },
                )
            }
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    pub(crate) fn delete_object(
        &self,
        state: &mut TreeState,
        id: ObjectId,
        point: &Point,
    ) -> RknnResult<()> {
        let root = state.meta.root_page;
        let mut path = TreePath::new();
        let (leaf, idx) = self
            .find_leaf(root, id, point, &mut path)?
            .ok_or_else(|| missing_from_tree(id))?;

        // every object that may have had `id` among its k_max nearest,
        // plus the former neighbours of `id`
        let mut affected: Vec<ObjectId> = self
            .reverse_candidates(root, point, Exclude::Id(id))?
            .into_iter()
            .map(|n| n.id)
            .collect();
        affected.extend(self.knn_search(root, point, self.settings.k_max, Some(id))?.ids());
        affected.sort_unstable();
        affected.dedup();

        self.with_node_mut(leaf, |node| match node {
            Node::Leaf { entries } => {
                entries.remove(idx);
                Ok(())
            }
            Node::Directory { .. } => Err(not_a_leaf(leaf)),
        })?;
        state.relation.remove(&id);
        state.meta.entry_count = state.meta.entry_count.saturating_sub(1);

        let orphans = self.condense_tree(state, &path, leaf)?;
        if !orphans.is_empty() {
            debug!("Reinserting {} entries of dissolved nodes", orphans.len());
            for entry in orphans {
                self.insert_leaf_entry(state, entry)?;
            }
        }

        self.refresh_knn_distances(state, &affected, false)
    }

    /// Locate the leaf holding `id`, descending only into boxes that
    /// contain `point`. Fills `path` with the directory steps taken.
    pub(crate) fn find_leaf(
        &self,
        page_id: PageId,
        id: ObjectId,
        point: &Point,
        path: &mut TreePath,
    ) -> RknnResult<Option<(PageId, usize)>> {
        match self.store.get(page_id)? {
            Node::Leaf { entries } => {
                Ok(entries.iter().position(|e| e.id == id).map(|i| (page_id, i)))
            }
            Node::Directory { entries, .. } => {
                for (i, e) in entries.iter().enumerate() {
                    if !e.mbr.contains_point(point) {
                        continue;
                    }
                    path.push((page_id, i));
                    if let Some(found) = self.find_leaf(e.page_id, id, point, path)? {
                        return Ok(Some(found));
                    }
                    path.pop();
                }
                Ok(None)
            }
        }
    }

    /// Walk up from the leaf an entry was removed from. Underfull nodes
    /// other than the root are cut out and their objects returned for
    /// reinsertion; the remaining parent entries are refreshed.
    fn condense_tree(
        &self,
        state: &mut TreeState,
        path: &[(PageId, usize)],
        leaf: PageId,
    ) -> RknnResult<Vec<LeafEntry>> {
        let mut orphans = Vec::new();
        let mut current = leaf;
        for &(parent, idx) in path.iter().rev() {
            let node = self.store.get(current)?;
            let underfull = node.len() < self.layout.minimum(node.is_leaf());
            let entry = if underfull {
                None
            } else {
                Some(node.to_directory_entry(current)?)
            };

            self.with_node_mut(parent, |p| match p {
                Node::Directory { entries, .. } => {
                    match entry {
                        Some(entry) => entries[idx] = entry,
                        None => {
                            entries.remove(idx);
                        }
                    }
                    Ok(())
                }
                Node::Leaf { .. } => Err(not_a_directory(parent)),
            })?;
            if underfull {
                trace!("Dissolving underfull page {}", current);
                self.release_subtree(current, &mut orphans)?;
            }
            current = parent;
        }

        self.shrink_root(state)?;
        Ok(orphans)
    }

    /// Collapse a root that has a single child into the root page, and
    /// turn a root without children back into an empty leaf.
    fn shrink_root(&self, state: &mut TreeState) -> RknnResult<()> {
        let root = state.meta.root_page;
        loop {
            let node = self.store.get(root)?;
            let old_height = state.meta.height;
            match &node {
                Node::Directory { entries, .. } if entries.is_empty() => {
                    self.store.put(root, Node::empty_leaf())?;
                    state.meta.height = 1;
                }
                Node::Directory { entries, .. } if entries.len() == 1 => {
                    let child = entries[0].page_id;
                    let child_node = self.store.get(child)?;
                    self.store.put(root, child_node)?;
                    self.store.free(child)?;
                    state.meta.height -= 1;
                }
                _ => return Ok(()),
            }

            let new_height = state.meta.height;
            debug!("Root shrink: height {} -> {}", old_height, new_height);
            self.notify(|l| l.on_root_change(old_height, new_height));
        }
    }

    /// Free every page of a subtree, collecting its objects.
    fn release_subtree(&self, page_id: PageId, objects: &mut Vec<LeafEntry>) -> RknnResult<()> {
        match self.store.get(page_id)? {
            Node::Leaf { entries } => objects.extend(entries),
            Node::Directory { entries, .. } => {
                for e in entries {
                    self.release_subtree(e.page_id, objects)?;
                }
            }
        }
        self.store.free(page_id)
    }

    /// Remove everything below the root and empty the root.
    fn reset(&self, state: &mut TreeState) -> RknnResult<()> {
        let root = state.meta.root_page;
        if let Node::Directory { entries, .. } = self.store.get(root)? {
            let mut discarded = Vec::new();
            for e in entries {
                self.release_subtree(e.page_id, &mut discarded)?;
                discarded.clear();
            }
        }
        self.store.put(root, Node::empty_leaf())?;

        let old_height = state.meta.height;
        state.meta.height = 1;
        state.meta.entry_count = 0;
        state.relation.clear();
        if old_height != 1 {
            self.notify(|l| l.on_root_change(old_height, 1));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk loading
    // ------------------------------------------------------------------

    /// Build the tree bottom-up from sorted tiles, then compute every kNN
    /// distance in one pass. The tree must be empty.
    fn bulk_load(&self, state: &mut TreeState, objects: Vec<(ObjectId, Point)>) -> RknnResult<()> {
        let root = state.meta.root_page;
        let count = objects.len();
        let split = self.settings.split;

        for (id, point) in &objects {
            state.relation.insert(*id, point.clone());
        }
        let leaves: Vec<LeafEntry> = objects
            .into_iter()
            .map(|(id, point)| LeafEntry::new(id, point))
            .collect();

        let mut groups = split.partition(leaves, self.layout.leaf_max());
        let mut height = 1;
        if groups.len() == 1 {
            let entries = groups.pop().unwrap_or_default();
            self.store.put(root, Node::Leaf { entries })?;
        } else {
            let mut level_entries = groups
                .into_iter()
                .map(|entries| self.write_new_page(Node::Leaf { entries }))
                .collect::<RknnResult<Vec<_>>>()?;

            let mut level = 1;
            while level_entries.len() > self.layout.dir_max() {
                level_entries = split
                    .partition(level_entries, self.layout.dir_max())
                    .into_iter()
                    .map(|entries| self.write_new_page(Node::Directory { entries, level }))
                    .collect::<RknnResult<Vec<_>>>()?;
                level += 1;
            }
            self.store.put(
                root,
                Node::Directory {
                    entries: level_entries,
                    level,
                },
            )?;
            height = level + 1;
        }

        let old_height = state.meta.height;
        state.meta.height = height;
        state.meta.entry_count = count as u64;
        debug!("Bulk loaded {} objects into a tree of height {}", count, height);
        if old_height != height {
            self.notify(|l| l.on_root_change(old_height, height));
        }

        let ids: Vec<ObjectId> = state.relation.keys().copied().collect();
        self.refresh_knn_distances(state, &ids, true)
    }

    fn write_new_page(&self, node: Node) -> RknnResult<DirectoryEntry> {
        let page_id = self.store.allocate()?;
        let entry = node.to_directory_entry(page_id)?;
        self.store.put(page_id, node)?;
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // kNN distance maintenance
    // ------------------------------------------------------------------

    /// Recompute the kNN distances of `ids` (sorted, unique) through the
    /// index oracle and write them into the tree.
    fn refresh_knn_distances(
        &self,
        state: &TreeState,
        ids: &[ObjectId],
        report_progress: bool,
    ) -> RknnResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let root = state.meta.root_page;
        let k_max = self.settings.k_max;
        let oracle = IndexOracle::new(self, root, &state.relation);

        let mut knn_distances = Vec::with_capacity(ids.len());
        for (done, id) in ids.iter().enumerate() {
            knn_distances.push(oracle.knn_distance(*id, k_max)?);
            if report_progress && (done + 1) % PROGRESS_STEP == 0 {
                self.notify(|l| l.on_bulk_progress(done + 1, ids.len()));
            }
        }
        if report_progress {
            self.notify(|l| l.on_bulk_progress(ids.len(), ids.len()));
        }

        // only subtrees that may hold one of the objects need a visit
        let scope = if ids.len() == state.relation.len() {
            None
        } else {
            let mut scope = Mbr::empty(self.settings.dimensionality);
            for id in ids {
                let point = state.relation.get(id).ok_or_else(|| missing_from_tree(*id))?;
                scope.extend_point(point);
            }
            Some(scope)
        };
        self.adjust_knn_distances(root, ids, &knn_distances, scope.as_ref())?;
        Ok(())
    }

    /// Assign `knn_distances[i]` to the leaf entry of `ids[i]` and refresh
    /// the aggregates on the way back up. Returns the aggregate of the node.
    fn adjust_knn_distances(
        &self,
        page_id: PageId,
        ids: &[ObjectId],
        knn_distances: &[f64],
        scope: Option<&Mbr>,
    ) -> RknnResult<f64> {
        self.with_node_mut(page_id, |node| {
            match node {
                Node::Leaf { entries } => {
                    for e in entries.iter_mut() {
                        if let Ok(pos) = ids.binary_search(&e.id) {
                            self.set_knn_distance(e, knn_distances[pos]);
                        }
                    }
                }
                Node::Directory { entries, .. } => {
                    for e in entries.iter_mut() {
                        if scope.map_or(true, |s| s.intersects(&e.mbr)) {
                            e.knn_distance =
                                self.adjust_knn_distances(e.page_id, ids, knn_distances, scope)?;
                        }
                    }
                }
            }
            Ok(node.knn_distance())
        })
    }

    // ------------------------------------------------------------------
    // Traversal helpers
    // ------------------------------------------------------------------

    pub(crate) fn for_each_leaf_entry<F>(&self, page_id: PageId, f: &mut F) -> RknnResult<()>
    where
        F: FnMut(&LeafEntry),
    {
        match self.store.get(page_id)? {
            Node::Leaf { entries } => entries.iter().for_each(|e| f(e)),
            Node::Directory { entries, .. } => {
                for e in entries {
                    self.for_each_leaf_entry(e.page_id, f)?;
                }
            }
        }
        Ok(())
    }

    /// (leaf pages, directory pages) of a subtree
    fn count_nodes(&self, page_id: PageId) -> RknnResult<(u64, u64)> {
        match self.store.get(page_id)? {
            Node::Leaf { .. } => Ok((1, 0)),
            Node::Directory { entries, .. } => {
                let mut counts = (0, 1);
                for e in entries {
                    let (leaves, dirs) = self.count_nodes(e.page_id)?;
                    counts.0 += leaves;
                    counts.1 += dirs;
                }
                Ok(counts)
            }
        }
    }
}

/// Child to descend into for a new entry: among the children that already
/// contain it the one with the smallest volume, otherwise the one needing
/// the least enlargement, ties going to the smaller volume.
fn choose_subtree(entries: &[DirectoryEntry], mbr: &Mbr) -> Option<usize> {
    let containing = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.mbr.contains(mbr))
        .min_by(|(_, a), (_, b)| a.mbr.volume().total_cmp(&b.mbr.volume()))
        .map(|(i, _)| i);
    if containing.is_some() {
        return containing;
    }

    let mut best: Option<(usize, f64, f64)> = None;
    for (i, e) in entries.iter().enumerate() {
        let enlargement = e.mbr.enlargement(mbr);
        let volume = e.mbr.volume();
        let better = match best {
            None => true,
            Some((_, best_enlargement, best_volume)) => {
                enlargement < best_enlargement
                    || (enlargement == best_enlargement && volume < best_volume)
            }
        };
        if better {
            best = Some((i, enlargement, volume));
        }
    }
    best.map(|(i, _, _)| i)
}
