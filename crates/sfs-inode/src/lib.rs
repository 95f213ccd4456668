#![forbid(unsafe_code)]
//! Inode snapshots and the inode store contract.
//!
//! A [`Inode`] is a private, in-memory copy of a file's on-disk metadata.
//! File handles mutate their snapshot and persist it through an
//! [`InodeStore`] with explicit, caller-visible writes — there is no hidden
//! shared inode table.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_types::{InodeNumber, S_IFMT, S_IFREG};
use std::collections::HashMap;

/// Mapping slots directly addressing data blocks.
pub const DIRECT_BLOCKS: usize = 12;
/// Total mapping-root slots carried in the snapshot (direct plus the
/// single/double/triple indirect roots of the classic layout).
pub const MAPPING_SLOTS: usize = 15;

/// In-memory copy of a file's on-disk inode.
///
/// The 64-bit size is stored split into low and high halves, matching the
/// on-disk layout. `block` holds the mapping roots; their interpretation
/// belongs to the block mapper, the file layer only carries them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub links_count: u16,
    pub flags: u32,
    pub size_low: u32,
    pub size_high: u32,
    pub block: [u32; MAPPING_SLOTS],
}

impl Inode {
    /// A fresh zero-length regular file with the given permission bits.
    #[must_use]
    pub fn new_regular(perm: u16) -> Self {
        Self {
            mode: S_IFREG | (perm & !S_IFMT),
            links_count: 1,
            ..Self::default()
        }
    }

    /// Logical file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.size_low) | (u64::from(self.size_high) << 32)
    }

    /// Store a 64-bit size into the split on-disk fields.
    #[allow(clippy::cast_possible_truncation)] // masked to 32 bits
    pub fn set_size(&mut self, size: u64) {
        self.size_low = (size & 0xFFFF_FFFF) as u32;
        self.size_high = (size >> 32) as u32;
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Inode metadata service.
pub trait InodeStore: Send + Sync {
    /// Fetch the on-disk inode for `ino`.
    fn read_inode(&self, ino: InodeNumber) -> Result<Inode>;

    /// Persist `inode` as the on-disk copy for `ino`.
    fn write_inode(&self, ino: InodeNumber, inode: &Inode) -> Result<()>;
}

/// In-memory inode table for tests and scratch filesystems.
#[derive(Debug, Default)]
pub struct MemoryInodeStore {
    table: Mutex<HashMap<InodeNumber, Inode>>,
}

impl MemoryInodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InodeStore for MemoryInodeStore {
    fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        self.table
            .lock()
            .get(&ino)
            .cloned()
            .ok_or_else(|| SfsError::NotFound(format!("inode {ino}")))
    }

    fn write_inode(&self, ino: InodeNumber, inode: &Inode) -> Result<()> {
        self.table.lock().insert(ino, inode.clone());
        Ok(())
    }
}
