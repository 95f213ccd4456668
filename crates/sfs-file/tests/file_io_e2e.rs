#![forbid(unsafe_code)]

use parking_lot::Mutex;
use sfs_block::{BlockDevice, ByteBlockDevice, ByteDevice};
use sfs_error::{Result, SfsError};
use sfs_file::{BlockFile, Filesystem, FsOptions, OpenFlags};
use sfs_inode::{Inode, InodeStore, MemoryInodeStore};
use sfs_map::{BlockMap, DirectMap, MapWorkspace, Resolved};
use sfs_types::{BlockNumber, InodeNumber};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::Arc;

const BLOCK_SIZE: u32 = 1024;
const INO: InodeNumber = InodeNumber(12);

#[derive(Clone, Debug)]
struct SharedMemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedMemoryByteDevice {
    fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for SharedMemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start =
            usize::try_from(offset).map_err(|_| SfsError::Format("offset overflow".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SfsError::Format("read range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SfsError::Format("read out of bounds".to_owned()));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start =
            usize::try_from(offset).map_err(|_| SfsError::Format("offset overflow".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SfsError::Format("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SfsError::Format("write out of bounds".to_owned()));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Wrapper that fails selected physical blocks, for error-path tests.
#[derive(Debug)]
struct FaultyBlockDevice<D: BlockDevice> {
    inner: D,
    fail_reads: Arc<Mutex<HashSet<u64>>>,
    fail_writes: Arc<Mutex<HashSet<u64>>>,
}

impl<D: BlockDevice> FaultyBlockDevice<D> {
    fn new(inner: D) -> Self {
        Self {
            inner,
            fail_reads: Arc::new(Mutex::new(HashSet::new())),
            fail_writes: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<D: BlockDevice> BlockDevice for FaultyBlockDevice<D> {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads.lock().contains(&block.0) {
            return Err(SfsError::Io(std::io::Error::other("injected read fault")));
        }
        self.inner.read_block(block, buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if self.fail_writes.lock().contains(&block.0) {
            return Err(SfsError::Io(std::io::Error::other("injected write fault")));
        }
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

struct Fixture {
    fs: Filesystem,
    shared: SharedMemoryByteDevice,
    fail_reads: Arc<Mutex<HashSet<u64>>>,
    fail_writes: Arc<Mutex<HashSet<u64>>>,
}

fn fixture(blocks: u64) -> Fixture {
    let shared = SharedMemoryByteDevice::new(
        usize::try_from(blocks).expect("blocks") * BLOCK_SIZE as usize,
    );
    let dev = ByteBlockDevice::new(shared.clone(), BLOCK_SIZE).expect("device");
    let faulty = FaultyBlockDevice::new(dev);
    let fail_reads = Arc::clone(&faulty.fail_reads);
    let fail_writes = Arc::clone(&faulty.fail_writes);
    let map = DirectMap::new(1, blocks).expect("map");
    let inodes = MemoryInodeStore::new();
    inodes
        .write_inode(INO, &Inode::new_regular(0o644))
        .expect("seed inode");
    let fs = Filesystem::new(
        Box::new(faulty),
        Box::new(map),
        Box::new(inodes),
        FsOptions::default(),
    )
    .expect("filesystem");
    Fixture {
        fs,
        shared,
        fail_reads,
        fail_writes,
    }
}

fn open_rw(fs: &Filesystem) -> BlockFile {
    BlockFile::open(fs, INO, OpenFlags::WRITE).expect("open rw")
}

fn read_exact_vec(file: &mut BlockFile, len: usize) -> Vec<u8> {
    let mut out = vec![0_u8; len];
    let got = file.read(&mut out).expect("read");
    out.truncate(got);
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add(u8::try_from(i % 251).expect("mod fits")))
        .collect()
}

#[test]
fn unaligned_write_spans_two_blocks_and_reads_back() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    let data = pattern(1500, 3);
    assert_eq!(file.write(&data).expect("write"), 1500);
    assert_eq!(file.size(), 1500);

    let mapped = file.inode().block.iter().filter(|slot| **slot != 0).count();
    assert_eq!(mapped, 2, "1500 bytes at 1024-byte blocks maps two blocks");

    file.seek(SeekFrom::Start(0)).expect("rewind");
    assert_eq!(read_exact_vec(&mut file, 1500), data);

    // Reading past end of file comes back short, not as an error.
    file.seek(SeekFrom::Start(0)).expect("rewind");
    assert_eq!(read_exact_vec(&mut file, 4000).len(), 1500);
    assert_eq!(read_exact_vec(&mut file, 10).len(), 0);
}

#[test]
fn untouched_holes_read_as_zeros() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.set_size(3000).expect("grow");
    assert_eq!(file.size(), 3000);
    assert_eq!(
        file.inode().block.iter().filter(|slot| **slot != 0).count(),
        0,
        "growth never allocates"
    );

    assert_eq!(read_exact_vec(&mut file, 3000), vec![0_u8; 3000]);
}

#[test]
fn writing_into_a_hole_then_reading_back() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.set_size(4096).expect("grow");
    file.seek(SeekFrom::Start(2000)).expect("seek");
    let data = pattern(100, 7);
    file.write(&data).expect("write");

    file.seek(SeekFrom::Start(0)).expect("rewind");
    let all = read_exact_vec(&mut file, 4096);
    assert_eq!(&all[..2000], &vec![0_u8; 2000][..]);
    assert_eq!(&all[2000..2100], &data[..]);
    assert_eq!(&all[2100..], &vec![0_u8; 1996][..]);
}

#[test]
fn seek_past_end_write_extends_and_gap_reads_zero() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.write(&pattern(1500, 11)).expect("write");
    file.seek(SeekFrom::Start(5000)).expect("seek");
    let tail = pattern(10, 42);
    assert_eq!(file.write(&tail).expect("write"), 10);
    assert_eq!(file.size(), 5010);

    file.seek(SeekFrom::Start(1500)).expect("seek");
    assert_eq!(read_exact_vec(&mut file, 3500), vec![0_u8; 3500]);
    assert_eq!(read_exact_vec(&mut file, 10), tail);
}

#[test]
fn partial_block_write_preserves_neighboring_bytes() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    let original = pattern(20, 101);
    file.write(&original).expect("write");
    file.close().expect("close");

    let mut file = open_rw(&fx.fs);
    file.seek(SeekFrom::Start(5)).expect("seek");
    file.write(&[0xEE_u8; 10]).expect("overwrite");
    assert_eq!(file.size(), 20, "overwrite within the file does not grow it");

    file.seek(SeekFrom::Start(0)).expect("rewind");
    let all = read_exact_vec(&mut file, 20);
    assert_eq!(&all[..5], &original[..5]);
    assert_eq!(&all[5..15], &[0xEE_u8; 10][..]);
    assert_eq!(&all[15..], &original[15..]);
}

#[test]
fn shrink_then_regrow_exposes_only_zeros() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.write(&[0xAA_u8; 2048]).expect("write");
    file.set_size(700).expect("shrink");
    assert_eq!(file.size(), 700);
    assert_eq!(
        file.inode().block.iter().filter(|slot| **slot != 0).count(),
        1,
        "shrinking to one block punches the second"
    );

    file.set_size(2048).expect("regrow");
    file.seek(SeekFrom::Start(0)).expect("rewind");
    let all = read_exact_vec(&mut file, 2048);
    assert_eq!(&all[..700], &vec![0xAA_u8; 700][..]);
    assert_eq!(&all[700..], &vec![0_u8; 1348][..]);
}

#[test]
fn shrink_with_tail_block_cached_drops_stale_slab_bytes() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.write(&[0xAA_u8; 1024]).expect("write");
    file.seek(SeekFrom::Start(60)).expect("seek");
    file.write(&[0xBB_u8; 10]).expect("overwrite");

    // Cursor sits inside the tail block while the slab is dirty.
    file.set_size(100).expect("shrink");
    file.set_size(1024).expect("regrow");

    file.seek(SeekFrom::Start(0)).expect("rewind");
    let all = read_exact_vec(&mut file, 1024);
    assert_eq!(&all[..60], &vec![0xAA_u8; 60][..]);
    assert_eq!(&all[60..70], &[0xBB_u8; 10][..]);
    assert_eq!(&all[70..100], &vec![0xAA_u8; 30][..]);
    assert_eq!(&all[100..], &vec![0_u8; 924][..]);
}

#[test]
fn set_size_to_unchanged_size_is_idempotent() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.write(&pattern(1500, 29)).expect("write");
    file.flush().expect("flush");
    let before = file.inode().clone();
    let stored_before = fx.fs.inodes().read_inode(INO).expect("read inode");

    file.set_size(1500).expect("resize to same size");

    assert_eq!(file.inode(), &before);
    assert_eq!(fx.fs.inodes().read_inode(INO).expect("read inode"), stored_before);
}

#[test]
fn contents_survive_close_and_reopen() {
    let fx = fixture(64);
    let data = pattern(3000, 55);

    let mut file = open_rw(&fx.fs);
    file.write(&data).expect("write");
    file.close().expect("close");

    let mut file = BlockFile::open(&fx.fs, INO, OpenFlags::RDONLY).expect("reopen");
    assert_eq!(file.size(), 3000);
    assert_eq!(read_exact_vec(&mut file, 3000), data);
}

#[test]
fn read_fault_reports_partial_count() {
    let fx = fixture(64);
    let data = pattern(2048, 90);

    let mut file = open_rw(&fx.fs);
    file.write(&data).expect("write");
    file.close().expect("close");

    // Fail the physical block backing logical block 1.
    let inode = fx.fs.inodes().read_inode(INO).expect("read inode");
    fx.fail_reads.lock().insert(u64::from(inode.block[1]));

    let mut file = BlockFile::open(&fx.fs, INO, OpenFlags::RDONLY).expect("reopen");
    let mut out = vec![0_u8; 2048];
    let failure = file.read(&mut out).expect_err("injected fault");
    assert_eq!(failure.completed, 1024);
    assert!(matches!(failure.source, SfsError::Io(_)));
    assert_eq!(&out[..1024], &data[..1024]);
}

#[test]
fn failed_flush_keeps_dirty_state_for_retry() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    let data = pattern(300, 17);
    file.write(&data).expect("write");

    // First flush fails; the slab stays dirty.
    let phys = u64::from(file.inode().block[0]);
    fx.fail_writes.lock().insert(phys);
    assert!(matches!(file.flush(), Err(SfsError::Io(_))));

    // Clearing the fault lets the retry land the same bytes.
    fx.fail_writes.lock().clear();
    file.flush().expect("retry flush");
    file.close().expect("close");

    let mut file = BlockFile::open(&fx.fs, INO, OpenFlags::RDONLY).expect("reopen");
    assert_eq!(read_exact_vec(&mut file, 300), data);
}

#[test]
fn close_reports_flush_error_but_releases() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);
    file.write(&pattern(100, 5)).expect("write");

    let phys = u64::from(file.inode().block[0]);
    fx.fail_writes.lock().insert(phys);
    assert!(matches!(file.close(), Err(SfsError::Io(_))));
}

#[test]
fn write_beyond_mapping_depth_fails_before_transfer() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.seek(SeekFrom::Start(12 * u64::from(BLOCK_SIZE)))
        .expect("seek");
    let failure = file.write(&[1_u8; 10]).expect_err("beyond mapping");
    assert_eq!(failure.completed, 0);
    assert!(matches!(failure.source, SfsError::FileTooLarge));
    assert_eq!(file.size(), 0);
}

#[test]
fn partial_write_at_mapping_edge_extends_to_transferred_bytes() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    // Blocks 10 and 11 exist; block 12 is beyond the direct roots.
    file.seek(SeekFrom::Start(10 * u64::from(BLOCK_SIZE)))
        .expect("seek");
    let failure = file.write(&pattern(2058, 61)).expect_err("hits the edge");
    assert_eq!(failure.completed, 2048);
    assert!(matches!(failure.source, SfsError::FileTooLarge));
    assert_eq!(file.size(), 12 * u64::from(BLOCK_SIZE));
}

/// Mapper that marks every mapped block uninitialized, so the truncate
/// path must skip its tail rewrite.
#[derive(Debug)]
struct UninitReportingMap {
    inner: DirectMap,
}

impl BlockMap for UninitReportingMap {
    fn resolve(
        &self,
        ino: InodeNumber,
        inode: &mut Inode,
        workspace: &mut MapWorkspace,
        alloc: bool,
        logical: BlockNumber,
    ) -> Result<Resolved> {
        let resolved = self.inner.resolve(ino, inode, workspace, alloc, logical)?;
        Ok(Resolved {
            physical: resolved.physical,
            uninit: resolved.physical.is_some(),
        })
    }

    fn punch(
        &self,
        ino: InodeNumber,
        inode: &mut Inode,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<()> {
        self.inner.punch(ino, inode, start, end)
    }

    fn max_logical_block(&self) -> BlockNumber {
        self.inner.max_logical_block()
    }
}

#[test]
fn truncate_skips_zeroing_uninitialized_tail_blocks() {
    let shared = SharedMemoryByteDevice::new(64 * BLOCK_SIZE as usize);
    let dev = ByteBlockDevice::new(shared.clone(), BLOCK_SIZE).expect("device");
    let map = UninitReportingMap {
        inner: DirectMap::new(1, 64).expect("map"),
    };
    let inodes = MemoryInodeStore::new();
    inodes
        .write_inode(INO, &Inode::new_regular(0o644))
        .expect("seed inode");
    let fs = Filesystem::new(
        Box::new(dev),
        Box::new(map),
        Box::new(inodes),
        FsOptions::default(),
    )
    .expect("filesystem");

    let mut file = open_rw(&fs);
    file.write(&[0xCC_u8; 1024]).expect("write");
    file.flush().expect("flush");
    let phys = u64::from(file.inode().block[0]);

    file.set_size(100).expect("shrink");

    // The on-disk tail was left alone because the mapper reported the
    // block uninitialized.
    let image = shared.snapshot();
    let start = usize::try_from(phys).expect("phys") * BLOCK_SIZE as usize;
    assert_eq!(
        &image[start + 100..start + 1024],
        &vec![0xCC_u8; 924][..]
    );
}

#[test]
fn zeroed_tail_lands_on_disk_for_initialized_blocks() {
    let fx = fixture(64);
    let mut file = open_rw(&fx.fs);

    file.write(&[0xCC_u8; 1024]).expect("write");
    file.flush().expect("flush");
    let phys = u64::from(file.inode().block[0]);

    file.set_size(100).expect("shrink");

    let image = fx.shared.snapshot();
    let start = usize::try_from(phys).expect("phys") * BLOCK_SIZE as usize;
    assert_eq!(&image[start..start + 100], &vec![0xCC_u8; 100][..]);
    assert_eq!(&image[start + 100..start + 1024], &vec![0_u8; 924][..]);
}
