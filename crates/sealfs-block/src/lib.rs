#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` trait for raw fixed-offset I/O, the shared
//! `BlockBuffer` that stands in for transferable memory objects, and the
//! `BlockSession` request channel the engine issues all block I/O through:
//! buffers are attached to the session, then read/write/flush requests
//! reference them by id.

use parking_lot::{Mutex, RwLock};
use sealfs_error::{Result, SealError};
use sealfs_types::BLOCK_SIZE;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Shared, growable byte buffer.
///
/// Clones share storage; this is the engine's analog of a memory object
/// that both the owner and the block session can address.
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl BlockBuffer {
    /// A zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles share the same storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Copy out `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let end = offset.checked_add(buf.len()).ok_or(SealError::OutOfRange)?;
        if end > bytes.len() {
            return Err(SealError::OutOfRange);
        }
        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    /// Copy `buf` into the buffer starting at `offset`.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let end = offset.checked_add(buf.len()).ok_or(SealError::OutOfRange)?;
        if end > bytes.len() {
            return Err(SealError::OutOfRange);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    /// Run `f` with shared access to the full contents.
    pub fn with_ref<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }

    /// Run `f` with exclusive access to the full contents.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write())
    }

    /// Grow to `new_len` bytes, zero-filling the extension. No-op when the
    /// buffer is already at least that large.
    pub fn grow(&self, new_len: usize) {
        let mut bytes = self.bytes.write();
        if new_len > bytes.len() {
            bytes.resize(new_len, 0);
        }
    }

    /// Copy of the byte range `offset..offset + len`.
    pub fn snapshot(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; len];
        self.read_at(offset, &mut out)?;
        Ok(out)
    }
}

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

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only when the file is
    /// not writable.
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

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(SealError::OutOfRange)?;
        if end > self.len {
            return Err(SealError::OutOfRange);
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SealError::BadState);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(SealError::OutOfRange)?;
        if end > self.len {
            return Err(SealError::OutOfRange);
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
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0_u8; len])),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let offset = usize::try_from(offset).map_err(|_| SealError::OutOfRange)?;
        let end = offset.checked_add(buf.len()).ok_or(SealError::OutOfRange)?;
        if end > bytes.len() {
            return Err(SealError::OutOfRange);
        }
        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let offset = usize::try_from(offset).map_err(|_| SealError::OutOfRange)?;
        let end = offset.checked_add(buf.len()).ok_or(SealError::OutOfRange)?;
        if end > bytes.len() {
            return Err(SealError::OutOfRange);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle for a buffer attached to a `BlockSession`. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

impl BufferId {
    /// Placeholder for requests that carry no buffer (flush).
    pub const NONE: Self = Self(0);
}

/// Block request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
    CloseBuffer,
}

/// One request on the block channel. Offsets and lengths are in blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockRequest {
    pub op: BlockOp,
    pub buffer: BufferId,
    pub device_block: u64,
    pub buffer_block: u64,
    pub length: u32,
    pub group: u16,
}

impl BlockRequest {
    #[must_use]
    pub fn read(buffer: BufferId, device_block: u64, buffer_block: u64, length: u32) -> Self {
        Self {
            op: BlockOp::Read,
            buffer,
            device_block,
            buffer_block,
            length,
            group: 0,
        }
    }

    #[must_use]
    pub fn write(buffer: BufferId, device_block: u64, buffer_block: u64, length: u32) -> Self {
        Self {
            op: BlockOp::Write,
            buffer,
            device_block,
            buffer_block,
            length,
            group: 0,
        }
    }

    #[must_use]
    pub fn flush() -> Self {
        Self {
            op: BlockOp::Flush,
            buffer: BufferId::NONE,
            device_block: 0,
            buffer_block: 0,
            length: 0,
            group: 0,
        }
    }
}

/// The request channel between the engine and the block device.
///
/// Buffers must be detached when their owner is torn down; an id left
/// attached keeps the buffer's storage pinned on the device side.
pub trait BlockSession: Send + Sync {
    /// Register a shared buffer and receive its id.
    fn attach(&self, buffer: &BlockBuffer) -> Result<BufferId>;

    /// Release an id obtained from `attach`.
    fn detach(&self, id: BufferId) -> Result<()>;

    /// Execute a batch of requests in order.
    fn transact(&self, requests: &[BlockRequest]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of device blocks.
    fn block_count(&self) -> u64;

    /// Convenience barrier: a single flush request.
    fn flush(&self) -> Result<()> {
        self.transact(&[BlockRequest::flush()])
    }
}

/// Session over a `ByteDevice`, executing requests synchronously on the
/// caller's thread. Blocking callers (the writeback consumer, the journal
/// commit thread) provide the offload the engine's threading model expects.
pub struct DeviceSession {
    device: Arc<dyn ByteDevice>,
    buffers: Mutex<HashMap<BufferId, BlockBuffer>>,
    next_id: Mutex<u32>,
    block_count: u64,
}

impl DeviceSession {
    pub fn new(device: Arc<dyn ByteDevice>) -> Self {
        let block_count = device.len_bytes() / u64::from(BLOCK_SIZE);
        Self {
            device,
            buffers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            block_count,
        }
    }

    fn buffer(&self, id: BufferId) -> Result<BlockBuffer> {
        self.buffers
            .lock()
            .get(&id)
            .cloned()
            .ok_or(SealError::InvalidArgs)
    }

    fn check_range(&self, request: &BlockRequest) -> Result<()> {
        let end = request
            .device_block
            .checked_add(u64::from(request.length))
            .ok_or(SealError::OutOfRange)?;
        if end > self.block_count {
            warn!(
                target: "sealfs::block",
                device_block = request.device_block,
                length = request.length,
                block_count = self.block_count,
                "request beyond device"
            );
            return Err(SealError::OutOfRange);
        }
        Ok(())
    }
}

impl BlockSession for DeviceSession {
    fn attach(&self, buffer: &BlockBuffer) -> Result<BufferId> {
        let mut next = self.next_id.lock();
        let id = BufferId(*next);
        *next = next.checked_add(1).ok_or(SealError::OutOfMemory)?;
        self.buffers.lock().insert(id, buffer.clone());
        debug!(target: "sealfs::block", id = id.0, len = buffer.len(), "attach");
        Ok(id)
    }

    fn detach(&self, id: BufferId) -> Result<()> {
        self.buffers
            .lock()
            .remove(&id)
            .map(|_| {
                debug!(target: "sealfs::block", id = id.0, "detach");
            })
            .ok_or(SealError::InvalidArgs)
    }

    fn transact(&self, requests: &[BlockRequest]) -> Result<()> {
        for request in requests {
            match request.op {
                BlockOp::Read => {
                    self.check_range(request)?;
                    let buffer = self.buffer(request.buffer)?;
                    let byte_len = request.length as usize * BLOCK_SIZE as usize;
                    let dev_off = request.device_block * u64::from(BLOCK_SIZE);
                    let buf_off = usize::try_from(request.buffer_block * u64::from(BLOCK_SIZE))
                        .map_err(|_| SealError::OutOfRange)?;
                    let mut scratch = vec![0_u8; byte_len];
                    self.device.read_exact_at(dev_off, &mut scratch)?;
                    buffer.write_at(buf_off, &scratch)?;
                }
                BlockOp::Write => {
                    self.check_range(request)?;
                    let buffer = self.buffer(request.buffer)?;
                    let byte_len = request.length as usize * BLOCK_SIZE as usize;
                    let dev_off = request.device_block * u64::from(BLOCK_SIZE);
                    let buf_off = usize::try_from(request.buffer_block * u64::from(BLOCK_SIZE))
                        .map_err(|_| SealError::OutOfRange)?;
                    let payload = buffer.snapshot(buf_off, byte_len)?;
                    self.device.write_all_at(dev_off, &payload)?;
                }
                BlockOp::Flush => {
                    self.device.sync()?;
                }
                BlockOp::CloseBuffer => {
                    self.detach(request.buffer)?;
                }
            }
            trace!(
                target: "sealfs::block",
                op = ?request.op,
                device_block = request.device_block,
                length = request.length,
                "request done"
            );
        }
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}
