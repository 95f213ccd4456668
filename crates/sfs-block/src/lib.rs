#![forbid(unsafe_code)]
//! Block channel for SiltFS.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed
//! pread/pwrite device, the byte-to-block adapter with geometry
//! validation, and an in-memory device for tests and scratch images.

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::BlockNumber;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an image read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Whether the backing file was opened writable.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| SfsError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| SfsError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(SfsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SfsError::ReadOnlyFilesystem);
        }
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| SfsError::Format("write length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| SfsError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(SfsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests and scratch images.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Snapshot of the full image contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start =
            usize::try_from(offset).map_err(|_| SfsError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SfsError::Format("read range overflow".into()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SfsError::Format("read out of bounds".into()));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start =
            usize::try_from(offset).map_err(|_| SfsError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SfsError::Format("write range overflow".into()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SfsError::Format("write out of bounds".into()));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number into `buf`. `buf.len()` MUST equal `block_size()`.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Byte-to-block adapter: presents any [`ByteDevice`] as a [`BlockDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(SfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(SfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(SfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| SfsError::Format("block offset overflow".to_owned()))
    }

    fn check_len(&self, len: usize, what: &str) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| SfsError::Format("block_size does not fit usize".to_owned()))?;
        if len != expected {
            return Err(SfsError::Format(format!(
                "{what} buffer size mismatch: got={len} expected={expected}"
            )));
        }
        Ok(())
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len(), "read_block")?;
        let offset = self.block_offset(block)?;
        self.inner.read_exact_at(offset, buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.check_len(data.len(), "write_block")?;
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
