//! Page stores backing the tree.
//!
//! The tree never holds references into a store. It reads a node by value,
//! changes it and writes it back. [`MemoryPageStore`] keeps nodes in a map;
//! [`DiskPageStore`] keeps them in a slotted page file behind a write-back
//! LRU cache and reads each page lazily on first access.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::bounding_box::Mbr;
use crate::point::Point;
use crate::settings::{NodeLayout, RdKnnSettings};

use super::cache::PageCache;
use super::constants::{DEFAULT_CACHE_PAGES, DEFAULT_SLOT_SIZE};
use super::storage::{encoded_len, Storage, StoreHeader};
use super::types::{
    DirectoryEntry, FreePage, LeafEntry, Node, ObjectId, PageId, PageSlot, PageWithChecksum,
    RknnError, RknnResult, StoreStats, TreeMeta,
};

/// Storage abstraction over fixed-size node pages.
///
/// Page ids are never 0. A freed page id may be handed out again by a later
/// `allocate`.
pub trait PageStore: Send + Sync {
    /// Read a node by value
    fn get(&self, page_id: PageId) -> RknnResult<Node>;

    /// Write a node to an allocated page
    fn put(&self, page_id: PageId, node: Node) -> RknnResult<()>;

    /// Reserve a fresh page id
    fn allocate(&self) -> RknnResult<PageId>;

    /// Release a page for reuse
    fn free(&self, page_id: PageId) -> RknnResult<()>;

    /// Tree description saved by `store_meta`, if any
    fn load_meta(&self) -> RknnResult<Option<TreeMeta>>;

    fn store_meta(&self, meta: &TreeMeta) -> RknnResult<()>;

    /// Make all previous writes durable
    fn flush(&self) -> RknnResult<()>;

    fn stats(&self) -> StoreStats;

    /// Largest encoded page the store can hold, `None` if unbounded
    fn max_page_bytes(&self) -> Option<usize> {
        None
    }
}

/// Encoded size of the largest page a tree with these settings writes.
///
/// An overflowing node holds `capacity` entries until it is split, and it
/// is written back in that state.
pub(crate) fn largest_page_bytes(
    settings: &RdKnnSettings,
    layout: &NodeLayout,
) -> RknnResult<usize> {
    let dims = settings.dimensionality;
    let leaf = Node::Leaf {
        entries: (0..layout.leaf_capacity)
            .map(|i| LeafEntry::new(i as ObjectId, Point::from(vec![0.0; dims])))
            .collect(),
    };
    let directory = Node::Directory {
        entries: (0..layout.dir_capacity)
            .map(|i| DirectoryEntry {
                page_id: i as PageId,
                mbr: Mbr::new(vec![0.0; dims], vec![0.0; dims]),
                knn_distance: 0.0,
            })
            .collect(),
        level: 1,
    };

    let leaf_bytes = encoded_len(&PageSlot::Node(PageWithChecksum::new(leaf)?))?;
    let directory_bytes = encoded_len(&PageSlot::Node(PageWithChecksum::new(directory)?))?;
    Ok(leaf_bytes.max(directory_bytes))
}

/// Rejects settings whose full nodes do not fit into pages of `limit` bytes.
pub(crate) fn check_page_fit(
    limit: Option<usize>,
    settings: &RdKnnSettings,
    layout: &NodeLayout,
) -> RknnResult<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let needed = largest_page_bytes(settings, layout)?;
    if needed > limit {
        return Err(RknnError::Configuration(format!(
            "page size {} with {} dimensions needs {} byte page slots, the store has {}",
            settings.page_size, settings.dimensionality, needed, limit
        )));
    }
    Ok(())
}

/// Counters shared by both stores
#[derive(Default)]
struct StoreCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl StoreCounters {
    fn hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self) {
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    pages: HashMap<PageId, Node>,
    free: Vec<PageId>,
    /// Highest page id handed out so far
    last_page_id: PageId,
    meta: Option<TreeMeta>,
}

/// Page store holding every node in memory.
#[derive(Default)]
pub struct MemoryPageStore {
    state: RwLock<MemoryState>,
    counters: StoreCounters,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageStore for MemoryPageStore {
    fn get(&self, page_id: PageId) -> RknnResult<Node> {
        let state = self.state.read();
        let node = state
            .pages
            .get(&page_id)
            .cloned()
            .ok_or(RknnError::PageNotFound(page_id))?;
        self.counters.hit();
        Ok(node)
    }

    fn put(&self, page_id: PageId, node: Node) -> RknnResult<()> {
        let mut state = self.state.write();
        if page_id == 0 || page_id > state.last_page_id || state.free.contains(&page_id) {
            return Err(RknnError::PageNotFound(page_id));
        }
        state.pages.insert(page_id, node);
        Ok(())
    }

    fn allocate(&self) -> RknnResult<PageId> {
        let mut state = self.state.write();
        if let Some(page_id) = state.free.pop() {
            return Ok(page_id);
        }
        state.last_page_id += 1;
        Ok(state.last_page_id)
    }

    fn free(&self, page_id: PageId) -> RknnResult<()> {
        let mut state = self.state.write();
        if page_id == 0 || page_id > state.last_page_id || state.free.contains(&page_id) {
            return Err(RknnError::PageNotFound(page_id));
        }
        state.pages.remove(&page_id);
        state.free.push(page_id);
        Ok(())
    }

    fn load_meta(&self) -> RknnResult<Option<TreeMeta>> {
        Ok(self.state.read().meta.clone())
    }

    fn store_meta(&self, meta: &TreeMeta) -> RknnResult<()> {
        self.state.write().meta = Some(meta.clone());
        Ok(())
    }

    fn flush(&self) -> RknnResult<()> {
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            allocated_pages: state.pages.len() as u64,
            free_pages: state.free.len() as u64,
            cached_pages: state.pages.len() as u64,
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: 0,
            disk_reads: 0,
            disk_writes: 0,
        }
    }
}

// ============================================================================
// Disk store
// ============================================================================

/// Options of a [`DiskPageStore`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Physical size of one page slot in bytes. A serialized node must fit.
    pub slot_size: usize,
    /// Maximum number of pages held in the cache
    pub cache_pages: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

/// Page store over a slotted page file.
///
/// Opening a store reads only the header. Nodes are loaded one page at a
/// time on first access and written back on eviction or `flush`. Freed
/// pages form a linked list threaded through their own slots, so the free
/// list survives a reopen.
pub struct DiskPageStore {
    storage: Storage,
    cache: Mutex<PageCache>,
    header: RwLock<StoreHeader>,
    /// Header changed since it was last written
    header_dirty: AtomicBool,
    counters: StoreCounters,
}

impl DiskPageStore {
    /// Create a new page file, replacing any existing file at `path`
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> RknnResult<Self> {
        let storage = Storage::create(path.as_ref(), options.slot_size)?;
        let header = StoreHeader::new(options.slot_size);
        storage.write_header(&header)?;
        storage.sync()?;
        debug!(
            "Created page file {} with {} byte slots",
            path.as_ref().display(),
            options.slot_size
        );

        Ok(Self {
            storage,
            cache: Mutex::new(PageCache::new(options.cache_pages)),
            header: RwLock::new(header),
            header_dirty: AtomicBool::new(false),
            counters: StoreCounters::default(),
        })
    }

    /// Open an existing page file. Only the header is read.
    pub fn open(path: impl AsRef<Path>, cache_pages: usize) -> RknnResult<Self> {
        let (storage, header) = Storage::open(path.as_ref())?;
        debug!(
            "Opened page file {}: {} pages, {} free",
            path.as_ref().display(),
            header.next_page_id - 1,
            header.free_page_count
        );

        Ok(Self {
            storage,
            cache: Mutex::new(PageCache::new(cache_pages)),
            header: RwLock::new(header),
            header_dirty: AtomicBool::new(false),
            counters: StoreCounters::default(),
        })
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn slot_size(&self) -> usize {
        self.storage.slot_size()
    }

    fn check_page(&self, page_id: PageId) -> RknnResult<()> {
        if page_id == 0 || page_id >= self.header.read().next_page_id {
            return Err(RknnError::PageNotFound(page_id));
        }
        Ok(())
    }

    fn write_node(&self, page_id: PageId, node: Node) -> RknnResult<()> {
        let slot = PageSlot::Node(PageWithChecksum::new(node)?);
        self.storage.write_page(page_id, &slot)?;
        self.counters.write();
        Ok(())
    }

    /// Cache a node, first writing out the dirty page it would displace.
    ///
    /// The write happens under the cache lock: until it lands, a concurrent
    /// `get` of that page still finds it in the cache instead of reading the
    /// older copy on disk. If the write fails nothing is evicted.
    fn cache_node(&self, page_id: PageId, node: Node, dirty: bool) -> RknnResult<()> {
        let mut cache = self.cache.lock();
        let victim = cache
            .dirty_victim(page_id)
            .map(|(id, victim)| (id, victim.clone()));
        if let Some((victim_id, victim)) = victim {
            self.write_node(victim_id, victim)?;
            cache.mark_clean(victim_id);
        }
        if let Some((evicted_id, evicted)) = cache.insert(page_id, node, dirty) {
            self.write_node(evicted_id, evicted)?;
        }
        Ok(())
    }
}

impl PageStore for DiskPageStore {
    fn get(&self, page_id: PageId) -> RknnResult<Node> {
        self.check_page(page_id)?;
        if let Some(node) = self.cache.lock().get(page_id) {
            self.counters.hit();
            return Ok(node.clone());
        }

        self.counters.miss();
        let node = match self.storage.read_page(page_id)? {
            PageSlot::Node(page) => page.into_node(page_id)?,
            PageSlot::Free(_) => return Err(RknnError::PageNotFound(page_id)),
        };
        self.cache_node(page_id, node.clone(), false)?;
        Ok(node)
    }

    fn put(&self, page_id: PageId, node: Node) -> RknnResult<()> {
        self.check_page(page_id)?;
        self.cache_node(page_id, node, true)
    }

    fn allocate(&self) -> RknnResult<PageId> {
        let mut header = self.header.write();
        if header.free_list_head != 0 {
            let page_id = header.free_list_head;
            let next = match self.storage.read_page(page_id)? {
                PageSlot::Free(FreePage { next_free }) => next_free,
                PageSlot::Node(_) => {
                    return Err(RknnError::IntegrityViolation(format!(
                        "free list head {} holds a node",
                        page_id
                    )))
                }
            };
            header.free_list_head = next;
            header.free_page_count = header.free_page_count.saturating_sub(1);
            self.header_dirty.store(true, Ordering::Release);
            return Ok(page_id);
        }

        let page_id = header.next_page_id;
        header.next_page_id += 1;
        self.header_dirty.store(true, Ordering::Release);
        Ok(page_id)
    }

    fn free(&self, page_id: PageId) -> RknnResult<()> {
        self.check_page(page_id)?;
        self.cache.lock().remove(page_id);

        let mut header = self.header.write();
        let slot = PageSlot::Free(FreePage {
            next_free: header.free_list_head,
        });
        self.storage.write_page(page_id, &slot)?;
        self.counters.write();
        header.free_list_head = page_id;
        header.free_page_count += 1;
        self.header_dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn load_meta(&self) -> RknnResult<Option<TreeMeta>> {
        Ok(self.header.read().meta.clone())
    }

    fn store_meta(&self, meta: &TreeMeta) -> RknnResult<()> {
        let mut header = self.header.write();
        if header.meta.as_ref() != Some(meta) {
            header.meta = Some(meta.clone());
            self.header_dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Flush all dirty pages and the header to disk. A store without
    /// changes does not touch the file.
    fn flush(&self) -> RknnResult<()> {
        let dirty_pages = self.cache.lock().dirty_pages();
        if dirty_pages.is_empty() && !self.header_dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        for page_id in dirty_pages {
            let node = self.cache.lock().peek(page_id).cloned();
            if let Some(node) = node {
                self.write_node(page_id, node)?;
                self.cache.lock().mark_clean(page_id);
            }
        }

        self.header_dirty.store(false, Ordering::Release);
        self.storage.write_header(&self.header.read())?;
        self.storage.sync()?;
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let header = self.header.read();
        StoreStats {
            allocated_pages: header.next_page_id - 1 - header.free_page_count,
            free_pages: header.free_page_count,
            cached_pages: self.cache.lock().len() as u64,
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
        }
    }

    fn max_page_bytes(&self) -> Option<usize> {
        Some(self.slot_size())
    }
}

impl Drop for DiskPageStore {
    fn drop(&mut self) {
        // Best effort flush on drop
        if let Err(e) = self.flush() {
            warn!("Failed to flush {} on drop: {}", self.path().display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Point;
    use crate::settings::RdKnnSettings;
    use crate::tree::types::LeafEntry;
    use tempfile::tempdir;

    fn node(id: u64) -> Node {
        Node::Leaf {
            entries: vec![LeafEntry::new(id, Point::from([id as f64, 0.0]))],
        }
    }

    fn meta() -> TreeMeta {
        TreeMeta {
            settings: RdKnnSettings::default(),
            root_page: 1,
            height: 1,
            entry_count: 3,
        }
    }

    #[test]
    fn test_memory_store_allocate_and_reuse() {
        let store = MemoryPageStore::new();
        let a = store.allocate().unwrap();
        let b = store.allocate().unwrap();
        assert_eq!((a, b), (1, 2));

        store.put(a, node(1)).unwrap();
        assert_eq!(store.get(a).unwrap(), node(1));

        store.free(a).unwrap();
        assert!(matches!(store.get(a), Err(RknnError::PageNotFound(1))));
        assert!(store.free(a).is_err());
        assert_eq!(store.allocate().unwrap(), a);
    }

    #[test]
    fn test_memory_store_rejects_unallocated_pages() {
        let store = MemoryPageStore::new();
        assert!(matches!(store.put(3, node(1)), Err(RknnError::PageNotFound(3))));
        assert!(store.put(0, node(1)).is_err());
    }

    #[test]
    fn test_disk_store_lazy_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.rdknn");
        {
            let store = DiskPageStore::create(&path, StoreOptions::default()).unwrap();
            for i in 1..=5 {
                let page = store.allocate().unwrap();
                store.put(page, node(i)).unwrap();
            }
            store.store_meta(&meta()).unwrap();
            store.flush().unwrap();
        }

        let store = DiskPageStore::open(&path, 16).unwrap();
        assert_eq!(store.stats().cached_pages, 0);
        assert_eq!(store.load_meta().unwrap(), Some(meta()));

        assert_eq!(store.get(3).unwrap(), node(3));
        assert_eq!(store.stats().disk_reads, 1);
        assert_eq!(store.get(3).unwrap(), node(3));
        assert_eq!(store.stats().cache_hits, 1);
        assert_eq!(store.stats().cached_pages, 1);
    }

    #[test]
    fn test_disk_store_evicts_dirty_pages_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.rdknn");
        let options = StoreOptions {
            slot_size: 1024,
            cache_pages: 2,
        };
        let store = DiskPageStore::create(&path, options).unwrap();
        for i in 1..=6 {
            let page = store.allocate().unwrap();
            store.put(page, node(i)).unwrap();
        }
        assert!(store.stats().disk_writes >= 4);
        for i in 1..=6 {
            assert_eq!(store.get(i).unwrap(), node(i));
        }
    }

    #[test]
    fn test_failed_eviction_keeps_page_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.rdknn");
        let options = StoreOptions {
            slot_size: 256,
            cache_pages: 1,
        };
        let store = DiskPageStore::create(&path, options).unwrap();
        let big = Node::Leaf {
            entries: (0..16)
                .map(|i| LeafEntry::new(i, Point::from([i as f64, 0.0])))
                .collect(),
        };

        let first = store.allocate().unwrap();
        store.put(first, big.clone()).unwrap();
        let second = store.allocate().unwrap();
        // displacing `first` needs a write that cannot fit its slot
        assert!(store.put(second, node(2)).is_err());
        assert!(store.get(second).is_err());

        assert_eq!(store.get(first).unwrap(), big);
        assert_eq!(store.stats().disk_writes, 0);
        assert_eq!(store.stats().cached_pages, 1);
    }

    #[test]
    fn test_store_page_limit() {
        let dir = tempdir().unwrap();
        let options = StoreOptions {
            slot_size: 2048,
            cache_pages: 4,
        };
        let store = DiskPageStore::create(dir.path().join("store.rdknn"), options).unwrap();
        assert_eq!(store.max_page_bytes(), Some(2048));
        assert_eq!(MemoryPageStore::new().max_page_bytes(), None);
    }

    #[test]
    fn test_page_fit_follows_encoded_size() {
        let settings = RdKnnSettings::default();
        let layout = settings.validate().unwrap();
        let needed = largest_page_bytes(&settings, &layout).unwrap();
        // ids, length prefixes and tags make a full node larger than the page budget
        assert!(needed > settings.page_size);

        assert!(check_page_fit(None, &settings, &layout).is_ok());
        assert!(check_page_fit(Some(needed), &settings, &layout).is_ok());
        assert!(matches!(
            check_page_fit(Some(needed - 1), &settings, &layout),
            Err(RknnError::Configuration(_))
        ));
    }

    #[test]
    fn test_disk_free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.rdknn");
        {
            let store = DiskPageStore::create(&path, StoreOptions::default()).unwrap();
            for i in 1..=4 {
                let page = store.allocate().unwrap();
                store.put(page, node(i)).unwrap();
            }
            store.free(2).unwrap();
            store.free(4).unwrap();
            assert!(matches!(store.get(2), Err(RknnError::PageNotFound(2))));
            store.flush().unwrap();
        }

        let store = DiskPageStore::open(&path, 16).unwrap();
        let stats = store.stats();
        assert_eq!(stats.free_pages, 2);
        assert_eq!(stats.allocated_pages, 2);

        // most recently freed first
        assert_eq!(store.allocate().unwrap(), 4);
        assert_eq!(store.allocate().unwrap(), 2);
        assert_eq!(store.allocate().unwrap(), 5);
    }

    #[test]
    fn test_flushed_store_leaves_file_alone_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.rdknn");
        let first = DiskPageStore::create(&path, StoreOptions::default()).unwrap();
        let page = first.allocate().unwrap();
        first.put(page, node(1)).unwrap();
        first.store_meta(&meta()).unwrap();
        first.flush().unwrap();

        let updated = TreeMeta {
            entry_count: 9,
            ..meta()
        };
        {
            let second = DiskPageStore::open(&path, 4).unwrap();
            second.store_meta(&updated).unwrap();
        }
        drop(first);

        let store = DiskPageStore::open(&path, 4).unwrap();
        assert_eq!(store.load_meta().unwrap(), Some(updated));
    }

    #[test]
    fn test_disk_store_detects_corruption() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let path = dir.path().join("store.rdknn");
        let slot_size = 1024;
        {
            let options = StoreOptions {
                slot_size,
                cache_pages: 4,
            };
            let store = DiskPageStore::create(&path, options).unwrap();
            let page = store.allocate().unwrap();
            store.put(page, node(7)).unwrap();
            store.flush().unwrap();
        }
        {
            // flip a coordinate byte inside page 1, past the slot tag and checksum
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(slot_size as u64 + 40)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let store = DiskPageStore::open(&path, 4).unwrap();
        assert!(store.get(1).is_err());
    }
}
