#![forbid(unsafe_code)]
//! SiltFS public API facade.
//!
//! Re-exports the buffered file layer and the service contracts it consumes
//! through a stable external interface. This is the crate downstream
//! consumers depend on.

pub use sfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemoryByteDevice};
pub use sfs_error::{Result, SfsError};
pub use sfs_file::{BlockFile, Filesystem, FsOptions, IoFailure, OpenFlags};
pub use sfs_inode::{Inode, InodeStore, MemoryInodeStore, DIRECT_BLOCKS, MAPPING_SLOTS};
pub use sfs_map::{BlockMap, DirectMap, MapWorkspace, Resolved};
pub use sfs_types::{BlockNumber, BlockSize, InodeNumber};
