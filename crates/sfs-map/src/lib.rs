#![forbid(unsafe_code)]
//! Block mapping: logical block to physical block resolution.
//!
//! The file layer consumes mapping through the narrow [`BlockMap`] contract:
//! resolve a file-relative block to its physical backing (allocating on
//! demand), punch a logical range free, and report the deepest addressable
//! block. Production mapping engines (indirect chains, extent trees) live
//! behind the same trait; [`DirectMap`] is the reference implementation used
//! by tests and small scratch images.

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_inode::{DIRECT_BLOCKS, Inode};
use sfs_types::{BlockNumber, BlockSize, InodeNumber};

/// Outcome of a mapping lookup.
///
/// `physical == None` reports a hole; with `alloc` requested the mapper
/// guarantees `Some` or an error. `uninit` marks regions the mapper knows
/// are allocated but never initialized (unwritten extents) — the truncate
/// path uses it to skip zeroing blocks that already read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub physical: Option<BlockNumber>,
    pub uninit: bool,
}

/// Scratch workspace handed to the mapper on every lookup.
///
/// Two block-sized areas the mapper may use while reading or rewriting
/// mapping metadata during an allocating lookup. Owned by the file handle
/// so lookups allocate nothing.
#[derive(Debug)]
pub struct MapWorkspace {
    a: Vec<u8>,
    b: Vec<u8>,
}

impl MapWorkspace {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            a: vec![0_u8; block_size.as_usize()],
            b: vec![0_u8; block_size.as_usize()],
        }
    }

    /// Both scratch areas, mutably.
    pub fn halves(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut self.a, &mut self.b)
    }
}

/// Block-address translation and allocation engine.
pub trait BlockMap: Send + Sync {
    /// Resolve `logical` within the file identified by `ino`/`inode`.
    ///
    /// With `alloc` false a missing mapping resolves to a hole. With `alloc`
    /// true the mapper allocates a physical block, records the new mapping
    /// in the inode snapshot as a side effect, and never reports a hole.
    fn resolve(
        &self,
        ino: InodeNumber,
        inode: &mut Inode,
        workspace: &mut MapWorkspace,
        alloc: bool,
        logical: BlockNumber,
    ) -> Result<Resolved>;

    /// Deallocate every mapped block in `start..=end` (logical), clearing
    /// the corresponding mapping roots in the snapshot.
    fn punch(
        &self,
        ino: InodeNumber,
        inode: &mut Inode,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<()>;

    /// Deepest logical block this mapper can address.
    fn max_logical_block(&self) -> BlockNumber;
}

#[derive(Debug)]
struct AllocState {
    first: u64,
    next_free: u64,
    limit: u64,
    freed: Vec<u64>,
}

/// Reference mapper backed by the snapshot's direct mapping roots.
///
/// Physical blocks are handed out from a bump allocator with a free list;
/// slot value 0 marks an unmapped root, so block 0 is never allocatable.
/// Addressing stops at the direct roots — deep files belong to a real
/// mapping engine, not to this one.
#[derive(Debug)]
pub struct DirectMap {
    state: Mutex<AllocState>,
}

impl DirectMap {
    /// `first_data_block` is the first allocatable physical block (must be
    /// non-zero: 0 is the hole sentinel in the mapping roots);
    /// `total_blocks` bounds allocation at the image size.
    pub fn new(first_data_block: u64, total_blocks: u64) -> Result<Self> {
        if first_data_block == 0 {
            return Err(SfsError::Format(
                "first_data_block must be non-zero (0 marks a hole)".to_owned(),
            ));
        }
        if first_data_block > total_blocks {
            return Err(SfsError::Format(format!(
                "first_data_block={first_data_block} exceeds total_blocks={total_blocks}"
            )));
        }
        Ok(Self {
            state: Mutex::new(AllocState {
                first: first_data_block,
                next_free: first_data_block,
                limit: total_blocks,
                freed: Vec::new(),
            }),
        })
    }

    /// Number of physical blocks currently handed out.
    #[must_use]
    pub fn allocated_blocks(&self) -> u64 {
        let state = self.state.lock();
        let freed = u64::try_from(state.freed.len()).unwrap_or(0);
        state.next_free - state.first - freed
    }

    fn allocate(&self) -> Result<BlockNumber> {
        let mut state = self.state.lock();
        if let Some(block) = state.freed.pop() {
            return Ok(BlockNumber(block));
        }
        if state.next_free >= state.limit {
            return Err(SfsError::NoSpace);
        }
        let block = state.next_free;
        state.next_free += 1;
        Ok(BlockNumber(block))
    }

    fn slot_index(logical: BlockNumber) -> Result<usize> {
        let idx = usize::try_from(logical.0)
            .map_err(|_| SfsError::FileTooLarge)?;
        if idx >= DIRECT_BLOCKS {
            return Err(SfsError::FileTooLarge);
        }
        Ok(idx)
    }
}

impl BlockMap for DirectMap {
    fn resolve(
        &self,
        _ino: InodeNumber,
        inode: &mut Inode,
        _workspace: &mut MapWorkspace,
        alloc: bool,
        logical: BlockNumber,
    ) -> Result<Resolved> {
        let idx = Self::slot_index(logical)?;
        let slot = inode.block[idx];
        if slot != 0 {
            return Ok(Resolved {
                physical: Some(BlockNumber(u64::from(slot))),
                uninit: false,
            });
        }
        if !alloc {
            return Ok(Resolved {
                physical: None,
                uninit: false,
            });
        }

        let physical = self.allocate()?;
        inode.block[idx] = u32::try_from(physical.0)
            .map_err(|_| SfsError::Format("physical block exceeds mapping root width".into()))?;
        Ok(Resolved {
            physical: Some(physical),
            uninit: false,
        })
    }

    fn punch(
        &self,
        _ino: InodeNumber,
        inode: &mut Inode,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<()> {
        if start > end {
            return Ok(());
        }
        let first = usize::try_from(start.0).unwrap_or(DIRECT_BLOCKS);
        let last = usize::try_from(end.0)
            .unwrap_or(DIRECT_BLOCKS - 1)
            .min(DIRECT_BLOCKS - 1);

        let mut state = self.state.lock();
        for slot in inode.block.iter_mut().take(last + 1).skip(first) {
            if *slot != 0 {
                state.freed.push(u64::from(*slot));
                *slot = 0;
            }
        }
        Ok(())
    }

    fn max_logical_block(&self) -> BlockNumber {
        BlockNumber(DIRECT_BLOCKS as u64 - 1)
    }
}
