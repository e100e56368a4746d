//! Write-back LRU cache for tree pages.
//!
//! Pages enter the cache only when they are first read or written. Nothing
//! is preloaded. When the cache is full the least recently used page makes
//! room. A dirty page must be written out before it is displaced, see
//! [`PageCache::dirty_victim`].

use std::num::NonZeroUsize;

use lru::LruCache;

use super::types::{Node, PageId};

/// A cached page with its data and dirty flag
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
}

/// LRU cache for tree pages
pub struct PageCache {
    pages: LruCache<PageId, CachedPage>,
}

impl PageCache {
    /// Create a new page cache holding at most `max_pages` pages (at least one)
    pub fn new(max_pages: usize) -> Self {
        let capacity = NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(capacity),
        }
    }

    /// Cached copy of a page, refreshing its recency.
    pub fn get(&mut self, page_id: PageId) -> Option<&Node> {
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Insert or replace a page. Returns the evicted least recently used
    /// page if the cache overflowed and that page is dirty.
    pub fn insert(&mut self, page_id: PageId, node: Node, dirty: bool) -> Option<(PageId, Node)> {
        // a replaced entry keeps its dirty flag
        let dirty = dirty
            || self
                .pages
                .peek(&page_id)
                .map(|cached| cached.dirty)
                .unwrap_or(false);
        match self.pages.push(page_id, CachedPage { node, dirty }) {
            Some((evicted_id, evicted)) if evicted_id != page_id && evicted.dirty => {
                Some((evicted_id, evicted.node))
            }
            _ => None,
        }
    }

    /// The dirty page that inserting `page_id` would evict, if any.
    ///
    /// The caller writes it out and marks it clean before inserting, so a
    /// failed write leaves the page cached.
    pub fn dirty_victim(&self, page_id: PageId) -> Option<(PageId, &Node)> {
        if self.pages.len() < self.pages.cap().get() || self.pages.contains(&page_id) {
            return None;
        }
        match self.pages.peek_lru() {
            Some((id, cached)) if cached.dirty => Some((*id, &cached.node)),
            _ => None,
        }
    }

    /// Ids of all pages not yet written out
    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn peek(&self, page_id: PageId) -> Option<&Node> {
        self.pages.peek(&page_id).map(|cached| &cached.node)
    }

    pub fn mark_clean(&mut self, page_id: PageId) {
        if let Some(cached) = self.pages.peek_mut(&page_id) {
            cached.dirty = false;
        }
    }

    /// Drop a page without writing it, used when the page is freed
    pub fn remove(&mut self, page_id: PageId) -> Option<(Node, bool)> {
        self.pages.pop(&page_id).map(|c| (c.node, c.dirty))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
