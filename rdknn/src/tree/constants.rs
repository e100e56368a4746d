//! Constants for the RdKNN tree and its disk page store.

/// Default logical page size used to derive node capacities
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default physical slot size of the disk page store (16KB)
pub const DEFAULT_SLOT_SIZE: usize = 16384;

/// Default cache size in number of pages
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Per-page bookkeeping: page id, entry count, parent id, node id, leaf flag
pub const NODE_OVERHEAD: f64 = 16.125;

/// Bytes for one child page id or object id
pub const ID_SIZE: usize = 4;

/// Bytes for one coordinate
pub const COORD_SIZE: usize = 8;

/// Bytes for one stored kNN distance
pub const DISTANCE_SIZE: usize = 8;

/// Capacities below this are legal but get a warning
pub const SMALL_CAPACITY: usize = 10;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x52444B4E; // "RDKN"

/// File format version
pub const VERSION: u32 = 1;
