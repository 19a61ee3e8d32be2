#![forbid(unsafe_code)]
//! Storage and clock boundaries consumed by the relog engine.
//!
//! The engine never talks to a real filesystem directly. It needs three
//! collaborators, all defined here:
//!
//! - [`BlockDevice`]: the base store that original blocks live in and that
//!   reclamation writes committed data back to.
//! - [`ByteDevice`]: the backing media of one log segment (pread/pwrite
//!   semantics, fixed length).
//! - [`TickSource`]: a monotonic logical clock for age-based thresholds.
//!
//! In-memory and file-backed implementations of the device traits are
//! provided for production use and for tests.

use parking_lot::RwLock;
use relog_error::{RelogError, Result};
use relog_types::{BlockNumber, Tick};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn range_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| RelogError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| RelogError::Format(format!("{what} range overflows u64")))
}

// ── Byte-addressed media ────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync + std::fmt::Debug {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing file; its current length is the device length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) a file of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        tracing::debug!(
            target: "relog::block",
            path = %path.as_ref().display(),
            len,
            "file_device_created"
        );
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = range_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(RelogError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = range_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(RelogError::Format(format!(
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

/// In-memory byte device. Clones share the same bytes, so a test can
/// "crash" an engine and reopen it on the same media.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0_u8; len])),
        }
    }

    /// Copy of the raw media, for inspection in tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| RelogError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| RelogError::Format("read range overflow".to_owned()))?;
        let bytes = self.bytes.read();
        if end > bytes.len() {
            return Err(RelogError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| RelogError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| RelogError::Format("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.write();
        if end > bytes.len() {
            return Err(RelogError::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block-addressed base store ──────────────────────────────────────────────

/// Block-addressed base store.
///
/// This is the store the engine redirects writes away from. Reads that miss
/// every redirection fall through to it, and reclamation writes committed
/// log data back into it.
pub trait BlockDevice: Send + Sync + std::fmt::Debug {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(RelogError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(RelogError::Format(format!(
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
            return Err(RelogError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| RelogError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                RelogError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| RelogError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(RelogError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
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

/// Sparse in-memory base store. Unwritten blocks read as zeros.
///
/// Clones share the same blocks.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    blocks: Arc<RwLock<HashMap<BlockNumber, Vec<u8>>>>,
    block_size: u32,
    block_count: u64,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(HashMap::new())),
            block_size,
            block_count,
        }
    }

    /// Number of blocks that have been written at least once.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.read().len()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(RelogError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let bs = usize::try_from(self.block_size)
            .map_err(|_| RelogError::Format("block_size overflow".to_owned()))?;
        let data = self
            .blocks
            .read()
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; bs]);
        Ok(BlockBuf::new(data))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(RelogError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        if u64::try_from(data.len()).ok() != Some(u64::from(self.block_size)) {
            return Err(RelogError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        self.blocks.write().insert(block, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Logical clock ───────────────────────────────────────────────────────────

/// Monotonic logical clock consulted by the reclamation scheduler.
pub trait TickSource: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Tick;
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Advance by `ticks`, returning the new reading.
    pub fn advance(&self, ticks: u64) -> Tick {
        Tick(self.ticks.fetch_add(ticks, Ordering::AcqRel).saturating_add(ticks))
    }
}

impl TickSource for ManualClock {
    fn now(&self) -> Tick {
        Tick(self.ticks.load(Ordering::Acquire))
    }
}

/// Wall-clock backed ticks: whole seconds since the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicClock {
    fn now(&self) -> Tick {
        Tick(self.origin.elapsed().as_secs())
    }
}
