#![forbid(unsafe_code)]
//! Buffered block file I/O.
//!
//! [`BlockFile`] gives POSIX-like read/write/seek/truncate semantics over a
//! single inode-backed logical file. It reconciles three granularities —
//! byte-addressed requests, fixed-size block storage, and sparse unmapped
//! regions — through one block-sized cache slab with explicit valid/dirty
//! flags:
//!
//! - the slab always represents the logical block under the cursor, or is
//!   invalid;
//! - partial-block writes load the block first (read-modify-write), whole-
//!   block writes skip the load;
//! - physical blocks are allocated on demand, either eagerly in the write
//!   loop or lazily at flush time, through the same resolution helper;
//! - flushing is lazy, and a failed flush keeps the dirty flag so close can
//!   retry.
//!
//! The handle owns a private inode snapshot and persists it with explicit
//! writes through the inode store; two handles on the same inode share no
//! cache coherency.

use parking_lot::Mutex;
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_inode::{Inode, InodeStore};
use sfs_map::{BlockMap, MapWorkspace};
use sfs_types::{BlockNumber, BlockSize, InodeNumber, needs_large_file};
use std::io::SeekFrom;
use std::sync::Arc;
use thiserror::Error;

/// Open-time behavior bits.
///
/// `WRITE` permits writes through the handle; `CREATE` declares creation
/// intent (checked against a read-only filesystem — inode creation itself
/// is the caller's concern). A default handle is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Read-only handle.
    pub const RDONLY: Self = Self(0);
    /// Handle may write.
    pub const WRITE: Self = Self(1);
    /// Creation intent.
    pub const CREATE: Self = Self(2);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Initial filesystem-wide state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOptions {
    /// Refuse handles opened for write or create.
    pub read_only: bool,
    /// Whether the large-file feature flag is already active on the image.
    pub large_file: bool,
}

#[derive(Debug, Default)]
struct SuperState {
    large_file: bool,
    super_dirty: bool,
}

struct FsInner {
    dev: Box<dyn BlockDevice>,
    map: Box<dyn BlockMap>,
    inodes: Box<dyn InodeStore>,
    block_size: BlockSize,
    read_only: bool,
    state: Mutex<SuperState>,
}

/// Shared filesystem context: block geometry, the device channel, the block
/// mapper, the inode store, and filesystem-wide feature bookkeeping.
///
/// Cheap to clone; every [`BlockFile`] holds one.
#[derive(Clone)]
pub struct Filesystem {
    inner: Arc<FsInner>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Filesystem")
            .field("block_size", &self.inner.block_size)
            .field("read_only", &self.inner.read_only)
            .field("block_count", &self.inner.dev.block_count())
            .field("large_file", &state.large_file)
            .field("super_dirty", &state.super_dirty)
            .finish()
    }
}

impl Filesystem {
    /// Assemble a filesystem context from its services.
    ///
    /// The device's block size must be a supported power of two.
    pub fn new(
        dev: Box<dyn BlockDevice>,
        map: Box<dyn BlockMap>,
        inodes: Box<dyn InodeStore>,
        options: FsOptions,
    ) -> Result<Self> {
        let block_size =
            BlockSize::new(dev.block_size()).map_err(|e| SfsError::Format(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(FsInner {
                dev,
                map,
                inodes,
                block_size,
                read_only: options.read_only,
                state: Mutex::new(SuperState {
                    large_file: options.large_file,
                    super_dirty: false,
                }),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &*self.inner.dev
    }

    #[must_use]
    pub fn mapper(&self) -> &dyn BlockMap {
        &*self.inner.map
    }

    #[must_use]
    pub fn inodes(&self) -> &dyn InodeStore {
        &*self.inner.inodes
    }

    #[must_use]
    pub fn has_large_file_feature(&self) -> bool {
        self.inner.state.lock().large_file
    }

    /// Activate the large-file feature flag and mark the superblock dirty.
    /// One-way: the flag is never cleared.
    pub fn enable_large_file_feature(&self) {
        let mut state = self.inner.state.lock();
        if !state.large_file {
            state.large_file = true;
            state.super_dirty = true;
            tracing::debug!(target: "sfs::file", "large_file_feature_enabled");
        }
    }

    pub fn mark_super_dirty(&self) {
        self.inner.state.lock().super_dirty = true;
    }

    #[must_use]
    pub fn super_dirty(&self) -> bool {
        self.inner.state.lock().super_dirty
    }
}

/// A read or write failed after transferring `completed` bytes.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct IoFailure {
    /// Bytes transferred before the failure.
    pub completed: usize,
    #[source]
    pub source: SfsError,
}

impl From<IoFailure> for SfsError {
    fn from(failure: IoFailure) -> Self {
        failure.source
    }
}

/// Buffered file handle over one inode.
///
/// All state is exclusively owned: the position cursor, the single-block
/// cache slab with its valid/dirty flags, the mapper workspace, and the
/// private inode snapshot.
pub struct BlockFile {
    fs: Filesystem,
    ino: InodeNumber,
    inode: Inode,
    flags: OpenFlags,
    pos: u64,
    blockno: BlockNumber,
    physblock: Option<BlockNumber>,
    buf_valid: bool,
    buf_dirty: bool,
    buf: Vec<u8>,
    workspace: MapWorkspace,
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("ino", &self.ino)
            .field("pos", &self.pos)
            .field("size", &self.inode.size())
            .field("blockno", &self.blockno)
            .field("physblock", &self.physblock)
            .field("buf_valid", &self.buf_valid)
            .field("buf_dirty", &self.buf_dirty)
            .finish()
    }
}

fn check_open_flags(fs: &Filesystem, flags: OpenFlags) -> Result<()> {
    if (flags.contains(OpenFlags::WRITE) || flags.contains(OpenFlags::CREATE))
        && fs.is_read_only()
    {
        return Err(SfsError::ReadOnlyFilesystem);
    }
    Ok(())
}

impl BlockFile {
    /// Open a handle on `ino`, fetching the inode from the store.
    pub fn open(fs: &Filesystem, ino: InodeNumber, flags: OpenFlags) -> Result<Self> {
        check_open_flags(fs, flags)?;
        let inode = fs.inodes().read_inode(ino)?;
        Self::open_with_inode(fs, ino, inode, flags)
    }

    /// Open a handle with a caller-supplied inode snapshot.
    ///
    /// Used for inodes not yet on disk and for anonymous scratch files
    /// (`ino == 0`, never persisted).
    pub fn open_with_inode(
        fs: &Filesystem,
        ino: InodeNumber,
        inode: Inode,
        flags: OpenFlags,
    ) -> Result<Self> {
        check_open_flags(fs, flags)?;
        let block_size = fs.block_size();
        tracing::debug!(
            target: "sfs::file",
            ino = ino.0,
            write = flags.is_writable(),
            size = inode.size(),
            "file_open"
        );
        Ok(Self {
            fs: fs.clone(),
            ino,
            inode,
            flags,
            pos: 0,
            blockno: BlockNumber(0),
            physblock: None,
            buf_valid: false,
            buf_dirty: false,
            buf: vec![0_u8; block_size.as_usize()],
            workspace: MapWorkspace::new(block_size),
        })
    }

    #[must_use]
    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    #[must_use]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Mutable access to the snapshot, for callers adjusting metadata
    /// (mode, ownership) before persisting it themselves.
    pub fn inode_mut(&mut self) -> &mut Inode {
        &mut self.inode
    }

    #[must_use]
    pub fn inode_number(&self) -> InodeNumber {
        self.ino
    }

    /// Current cursor position in bytes.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Logical file size in bytes, per the snapshot.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    /// Logical file size if it fits 32 bits.
    #[must_use]
    pub fn size32(&self) -> Option<u32> {
        u32::try_from(self.inode.size()).ok()
    }

    /// Re-resolve the physical backing of the cached logical block.
    fn resolve_cached(&mut self, alloc: bool) -> Result<()> {
        let resolved = self.fs.mapper().resolve(
            self.ino,
            &mut self.inode,
            &mut self.workspace,
            alloc,
            self.blockno,
        )?;
        self.physblock = resolved.physical;
        Ok(())
    }

    /// Resolve a physical block for the cached logical block if one is not
    /// already known. Both allocation sites — the write loop and flush —
    /// funnel through here.
    fn ensure_physical(&mut self, alloc: bool) -> Result<()> {
        if self.physblock.is_none() {
            self.resolve_cached(alloc)?;
        }
        Ok(())
    }

    /// Persist the cache slab if it holds unwritten changes.
    ///
    /// Allocates the physical block first when the cached block was a hole
    /// at load time. On error the dirty flag stays set so a later flush or
    /// close can retry.
    pub fn flush(&mut self) -> Result<()> {
        if !(self.buf_valid && self.buf_dirty) {
            return Ok(());
        }

        self.ensure_physical(true)?;
        let phys = self
            .physblock
            .ok_or_else(|| SfsError::Format("allocating lookup reported a hole".to_owned()))?;

        self.fs.device().write_block(phys, &self.buf)?;
        self.buf_dirty = false;
        tracing::trace!(
            target: "sfs::file",
            ino = self.ino.0,
            block = self.blockno.0,
            phys = phys.0,
            "file_flush"
        );
        Ok(())
    }

    /// Keep the cache slab on the logical block under the cursor, flushing
    /// and invalidating when the cursor has moved to a different block.
    fn sync_cursor(&mut self) -> Result<()> {
        let b = self.fs.block_size().byte_to_block(self.pos);
        if b != self.blockno {
            self.flush()?;
            self.buf_valid = false;
        }
        self.blockno = b;
        Ok(())
    }

    /// Make the cache slab valid for the cached logical block.
    ///
    /// With `skip_fill` the slab contents are left alone — the caller is
    /// about to overwrite the entire block, so only the physical-address
    /// resolution matters. Otherwise a mapped block is read from the
    /// device and a hole zero-fills the slab.
    fn load_buffer(&mut self, skip_fill: bool) -> Result<()> {
        if self.buf_valid {
            return Ok(());
        }

        self.resolve_cached(false)?;
        if !skip_fill {
            match self.physblock {
                Some(phys) => self.fs.device().read_block(phys, &mut self.buf)?,
                None => self.buf.fill(0),
            }
        }
        self.buf_valid = true;
        Ok(())
    }

    /// Read up to `out.len()` bytes at the cursor.
    ///
    /// Stops at end of file — a short count is not an error. An error mid-
    /// transfer carries the bytes already copied.
    pub fn read(&mut self, out: &mut [u8]) -> std::result::Result<usize, IoFailure> {
        let block_size = self.fs.block_size();
        let mut count = 0_usize;

        while self.pos < self.inode.size() && count < out.len() {
            if let Err(source) = self.sync_cursor().and_then(|()| self.load_buffer(false)) {
                return Err(IoFailure {
                    completed: count,
                    source,
                });
            }

            let start = block_size.offset_in_block(self.pos);
            let mut c = block_size.as_usize() - start;
            c = c.min(out.len() - count);
            let left = self.inode.size() - self.pos;
            c = c.min(usize::try_from(left).unwrap_or(usize::MAX));

            out[count..count + c].copy_from_slice(&self.buf[start..start + c]);
            self.pos += c as u64;
            count += c;
        }

        Ok(count)
    }

    /// Write `data` at the cursor, extending the file size if the cursor
    /// ends up past it.
    ///
    /// Whole-block chunks skip the read-modify-write load; partial chunks
    /// preserve the untouched bytes of the block. An error mid-transfer
    /// carries the bytes already written; if any were, the size extension
    /// still runs.
    pub fn write(&mut self, data: &[u8]) -> std::result::Result<usize, IoFailure> {
        if !self.flags.is_writable() {
            return Err(IoFailure {
                completed: 0,
                source: SfsError::FileNotWritable,
            });
        }

        let block_size = self.fs.block_size();
        let mut count = 0_usize;
        let mut failure: Option<SfsError> = None;

        while count < data.len() {
            if let Err(source) = self.sync_cursor() {
                failure = Some(source);
                break;
            }

            let start = block_size.offset_in_block(self.pos);
            let c = (block_size.as_usize() - start).min(data.len() - count);

            // A full-block chunk overwrites everything, so skip the load.
            let whole_block = c == block_size.as_usize();
            if let Err(source) = self
                .load_buffer(whole_block)
                .and_then(|()| self.ensure_physical(true))
            {
                failure = Some(source);
                break;
            }

            self.buf_dirty = true;
            self.buf[start..start + c].copy_from_slice(&data[count..count + c]);
            self.pos += c as u64;
            count += c;
        }

        if count > 0 && self.inode.size() < self.pos {
            let target = self.pos;
            if let Err(source) = self.set_size(target) {
                // A resize failure outranks nothing: report it only when
                // the write loop itself succeeded.
                if failure.is_none() {
                    failure = Some(source);
                }
            }
        }

        match failure {
            None => Ok(count),
            Some(source) => Err(IoFailure {
                completed: count,
                source,
            }),
        }
    }

    /// Move the cursor. `End` is relative to the current logical size.
    ///
    /// No clamping: seeking past end of file is legal and produces a
    /// sparse gap on a subsequent write.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let new = match from {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => self
                .pos
                .checked_add_signed(delta)
                .ok_or(SfsError::InvalidArgument("seek offset out of range"))?,
            SeekFrom::End(delta) => self
                .inode
                .size()
                .checked_add_signed(delta)
                .ok_or(SfsError::InvalidArgument("seek offset out of range"))?,
        };
        self.pos = new;
        Ok(new)
    }

    /// Seek with the POSIX integer whence encoding (0 = set, 1 = current,
    /// 2 = end). An unrecognized whence fails with `InvalidArgument`.
    pub fn seek_raw(&mut self, offset: i64, whence: u32) -> Result<u64> {
        let from = match whence {
            0 => SeekFrom::Start(
                u64::try_from(offset)
                    .map_err(|_| SfsError::InvalidArgument("negative absolute seek offset"))?,
            ),
            1 => SeekFrom::Current(offset),
            2 => SeekFrom::End(offset),
            _ => return Err(SfsError::InvalidArgument("unrecognized seek whence")),
        };
        self.seek(from)
    }

    /// Set the logical file size, truncating or growing.
    ///
    /// Shrinking zeroes the tail of the last retained block before
    /// releasing now-out-of-range blocks; growth never deallocates.
    /// Attached handles persist the snapshot; anonymous handles only
    /// update it in memory.
    pub fn set_size(&mut self, size: u64) -> Result<()> {
        let block_size = self.fs.block_size();
        if size > 0 && block_size.byte_to_block(size - 1) > self.fs.mapper().max_logical_block() {
            return Err(SfsError::FileTooLarge);
        }

        let new_blocks = block_size.blocks_for_bytes(size);
        let old_blocks = block_size.blocks_for_bytes(self.inode.size());

        if self.inode.is_regular()
            && needs_large_file(size)
            && !self.fs.has_large_file_feature()
        {
            self.fs.enable_large_file_feature();
        }

        tracing::debug!(
            target: "sfs::file",
            ino = self.ino.0,
            from = self.inode.size(),
            to = size,
            "file_set_size"
        );

        self.inode.set_size(size);
        if self.ino.is_attached() {
            self.fs.inodes().write_inode(self.ino, &self.inode)?;
        }

        self.zero_tail(size)?;

        if new_blocks >= old_blocks {
            return Ok(());
        }

        let max = self.fs.mapper().max_logical_block();
        self.fs
            .mapper()
            .punch(self.ino, &mut self.inode, BlockNumber(new_blocks), max)?;
        if self.ino.is_attached() {
            self.fs.inodes().write_inode(self.ino, &self.inode)?;
        }
        Ok(())
    }

    /// Narrow variant of [`set_size`](Self::set_size).
    pub fn set_size32(&mut self, size: u32) -> Result<()> {
        self.set_size(u64::from(size))
    }

    /// Zero the bytes of the last retained block past `size`.
    ///
    /// A no-op when `size` is block-aligned, when the tail block is a
    /// hole, or when the mapper reports it uninitialized (already reads
    /// as zero). Runs strictly before any deallocation so an interrupted
    /// truncate can not expose stale bytes.
    fn zero_tail(&mut self, size: u64) -> Result<()> {
        let block_size = self.fs.block_size();
        let off = block_size.offset_in_block(size);
        if off == 0 {
            return Ok(());
        }

        self.sync_cursor()?;

        let tail_block = block_size.byte_to_block(size);
        // If the slab holds the tail block, persist buffered bytes first so
        // the rewrite below starts from current contents.
        if self.buf_valid && self.blockno == tail_block {
            self.flush()?;
        }

        let resolved = self.fs.mapper().resolve(
            self.ino,
            &mut self.inode,
            &mut self.workspace,
            false,
            tail_block,
        )?;
        let Some(phys) = resolved.physical else {
            return Ok(());
        };
        if resolved.uninit {
            return Ok(());
        }

        let mut block = vec![0_u8; block_size.as_usize()];
        self.fs.device().read_block(phys, &mut block)?;
        block[off..].fill(0);
        self.fs.device().write_block(phys, &block)?;

        // The slab no longer reflects the on-disk block.
        if self.buf_valid && self.blockno == tail_block {
            self.buf_valid = false;
        }
        Ok(())
    }

    /// Flush and release the handle.
    ///
    /// Resources are released whatever the flush outcome; the flush error,
    /// if any, is reported.
    pub fn close(mut self) -> Result<()> {
        let ret = self.flush();
        // Drop must not retry a flush whose failure was already reported.
        self.buf_dirty = false;
        tracing::debug!(target: "sfs::file", ino = self.ino.0, "file_close");
        ret
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        if self.buf_valid && self.buf_dirty {
            if let Err(err) = self.flush() {
                tracing::warn!(
                    target: "sfs::file",
                    ino = self.ino.0,
                    block = self.blockno.0,
                    %err,
                    "flush on drop failed; buffered write lost"
                );
            }
        }
    }
}

fn to_io_error(err: &SfsError) -> std::io::Error {
    std::io::Error::from_raw_os_error(err.to_errno())
}

impl std::io::Read for BlockFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        BlockFile::read(self, buf).map_err(|failure| to_io_error(&failure.source))
    }
}

impl std::io::Write for BlockFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        BlockFile::write(self, buf).map_err(|failure| to_io_error(&failure.source))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        BlockFile::flush(self).map_err(|err| to_io_error(&err))
    }
}

impl std::io::Seek for BlockFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        BlockFile::seek(self, pos).map_err(|err| to_io_error(&err))
    }
}
