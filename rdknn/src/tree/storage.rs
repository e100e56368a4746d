//! Disk storage layer for the page file.
//!
//! The file is an array of fixed-size slots. Slot 0 holds the
//! [`StoreHeader`]; every other slot holds one [`PageSlot`], either a node
//! wrapped with its checksum or a link in the free list. Each read or write
//! touches exactly one slot.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::constants::{MAGIC, VERSION};
use super::types::{PageId, PageSlot, RknnError, RknnResult, TreeMeta};

/// Content of slot 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeader {
    pub magic: u32,
    pub version: u32,
    pub slot_size: u32,
    /// Next never-used page id
    pub next_page_id: PageId,
    /// First page of the free list (0 = empty)
    pub free_list_head: PageId,
    pub free_page_count: u64,
    /// Tree description, absent until a tree has been stored
    pub meta: Option<TreeMeta>,
}

impl StoreHeader {
    pub fn new(slot_size: usize) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            slot_size: slot_size as u32,
            next_page_id: 1,
            free_list_head: 0,
            free_page_count: 0,
            meta: None,
        }
    }

    pub fn validate(&self) -> RknnResult<()> {
        if self.magic != MAGIC {
            return Err(invalid_data(format!(
                "Invalid magic number {:#x}, not an index file",
                self.magic
            )));
        }
        if self.version != VERSION {
            return Err(invalid_data(format!(
                "Unsupported file version {} (expected {})",
                self.version, VERSION
            )));
        }
        Ok(())
    }
}

/// Reads and writes single slots of the page file.
pub struct Storage {
    file: Mutex<File>,
    path: PathBuf,
    slot_size: usize,
}

impl Storage {
    /// Create a new, empty page file, truncating any existing one
    pub fn create(path: &Path, slot_size: usize) -> RknnResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            slot_size,
        })
    }

    /// Open an existing page file. The slot size is taken from its header.
    pub fn open(path: &Path) -> RknnResult<(Self, StoreHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        // the header fits in its first few bytes whatever the slot size is
        let len = file.metadata()?.len() as usize;
        let mut buffer = vec![0u8; len.min(64 * 1024)];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;
        let header: StoreHeader = decode(&buffer)?;
        header.validate()?;

        let storage = Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            slot_size: header.slot_size as usize,
        };
        Ok((storage, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn write_header(&self, header: &StoreHeader) -> RknnResult<()> {
        let bytes = encode(header)?;
        self.write_slot(0, bytes)
    }

    /// Read one page slot. The checksum of a node slot is not verified here.
    pub fn read_page(&self, page_id: PageId) -> RknnResult<PageSlot> {
        if page_id == 0 {
            return Err(reserved_slot());
        }
        let buffer = self.read_slot(page_id)?;
        decode(&buffer)
    }

    pub fn write_page(&self, page_id: PageId, slot: &PageSlot) -> RknnResult<()> {
        if page_id == 0 {
            return Err(reserved_slot());
        }
        let bytes = encode(slot)?;
        self.write_slot(page_id, bytes)
    }

    /// Sync file to disk
    pub fn sync(&self) -> RknnResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn read_slot(&self, slot: PageId) -> RknnResult<Vec<u8>> {
        let offset = slot * self.slot_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; self.slot_size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_slot(&self, slot: PageId, mut bytes: Vec<u8>) -> RknnResult<()> {
        if bytes.len() > self.slot_size {
            return Err(invalid_data(format!(
                "Page too large: {} bytes (max {})",
                bytes.len(),
                self.slot_size
            )));
        }
        bytes.resize(self.slot_size, 0);

        let offset = slot * self.slot_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> RknnResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| RknnError::Serialization(e.to_string()))
}

/// Bytes a page slot occupies on disk
pub(crate) fn encoded_len(slot: &PageSlot) -> RknnResult<usize> {
    Ok(encode(slot)?.len())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RknnResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(value, _)| value)
        .map_err(|e| RknnError::Serialization(e.to_string()))
}

fn invalid_data(message: String) -> RknnError {
    RknnError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

fn reserved_slot() -> RknnError {
    RknnError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        "Page 0 is reserved for the header",
    ))
}
