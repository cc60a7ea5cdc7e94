//! Per-blob vnode.
//!
//! A blob moves through `Empty → DataWrite → Readable` on the write path,
//! `Error` on any write-path failure, and `Purged` once unlinked and
//! released. The vnode owns the in-memory buffers: during a write, a
//! zeroed buffer sized for `[merkle || data]` plus an optional compressed
//! scratch; during reads, the lazily-materialized, verified copy of the
//! same layout.

use crate::fs::{EnqueueType, SealFs};
use parking_lot::{Condvar, Mutex};
use sealfs_alloc::iter::{stream_blocks, AllocatedExtentIterator, BlockIterator, VectorExtentIterator};
use sealfs_alloc::populator::{IterationCommand, NodePopulator};
use sealfs_alloc::{ReservedExtent, ReservedNode};
use sealfs_block::{BlockBuffer, BlockRequest, BlockSession, BufferId};
use sealfs_compress::{buffer_max, decompress, StreamingCompressor, MIN_BYTES_SAVED};
use sealfs_error::{Result, SealError};
use sealfs_merkle::{merkle_root, tree_blocks, tree_size, Digest};
use sealfs_ondisk::{Inode, Node};
use sealfs_types::{bytes_to_blocks, u64_to_u32, NodeIndex, BLOCK_SIZE, MAX_BLOB_EXTENTS};
use sealfs_writeback::WritebackWork;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

const BS: usize = BLOCK_SIZE as usize;

/// Blob lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Empty,
    DataWrite,
    Readable,
    Error,
    Purged,
}

/// Event signalled when a blob becomes readable. Created lazily; the
/// first request wins and later requests receive the same event.
#[derive(Debug, Default)]
pub struct ReadableEvent {
    signalled: Mutex<bool>,
    cv: Condvar,
}

impl ReadableEvent {
    pub(crate) fn signal(&self) {
        *self.signalled.lock() = true;
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Block until the blob is readable.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cv.wait(&mut signalled);
        }
    }
}

/// Writer-only state, dropped once metadata is committed (releasing any
/// unused reservations) or on error (releasing all of them).
struct WriteInfo {
    bytes_written: u64,
    extents: Vec<ReservedExtent>,
    nodes: Vec<ReservedNode>,
    compressor: Option<StreamingCompressor>,
}

/// The blob's buffer and its device attachment; detaching on drop keeps
/// the session from leaking buffer ids.
struct BlobBuffers {
    data: BlockBuffer,
    id: BufferId,
    session: Arc<dyn BlockSession>,
}

impl Drop for BlobBuffers {
    fn drop(&mut self) {
        let _ = self.session.detach(self.id);
    }
}

struct BlobInner {
    state: BlobState,
    deletable: bool,
    inode: Inode,
    map_index: Option<NodeIndex>,
    write: Option<WriteInfo>,
    buffers: Option<BlobBuffers>,
}

struct CloneState {
    count: usize,
    /// While clones are outstanding the vnode pins itself.
    pin: Option<Arc<Blob>>,
}

/// A live blob vnode.
pub struct Blob {
    fs: Weak<SealFs>,
    digest: Digest,
    inner: Mutex<BlobInner>,
    readable_event: Mutex<Option<Arc<ReadableEvent>>>,
    syncing: AtomicBool,
    open_count: AtomicUsize,
    clones: Mutex<CloneState>,
}

impl Blob {
    /// A fresh vnode in `Empty`, awaiting `space_allocate`.
    pub(crate) fn new_for_write(fs: &Arc<SealFs>, digest: Digest) -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::downgrade(fs),
            digest,
            inner: Mutex::new(BlobInner {
                state: BlobState::Empty,
                deletable: false,
                inode: Inode::new(digest, 0, 0),
                map_index: None,
                write: None,
                buffers: None,
            }),
            readable_event: Mutex::new(None),
            syncing: AtomicBool::new(false),
            open_count: AtomicUsize::new(0),
            clones: Mutex::new(CloneState {
                count: 0,
                pin: None,
            }),
        })
    }

    /// A vnode for a committed on-disk blob.
    pub(crate) fn new_readable(
        fs: &Arc<SealFs>,
        node_index: NodeIndex,
        inode: Inode,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::downgrade(fs),
            digest: inode.digest,
            inner: Mutex::new(BlobInner {
                state: BlobState::Readable,
                deletable: false,
                inode,
                map_index: Some(node_index),
                write: None,
                buffers: None,
            }),
            readable_event: Mutex::new(None),
            syncing: AtomicBool::new(false),
            open_count: AtomicUsize::new(0),
            clones: Mutex::new(CloneState {
                count: 0,
                pin: None,
            }),
        })
    }

    #[must_use]
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    #[must_use]
    pub fn state(&self) -> BlobState {
        self.inner.lock().state
    }

    /// Declared size when readable, zero otherwise.
    #[must_use]
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        match inner.state {
            BlobState::Readable => inner.inode.blob_size,
            _ => 0,
        }
    }

    /// Whether a metadata commit for this blob is still in flight.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Whether the committed form is compressed on disk.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.inner.lock().inode.compressed
    }

    /// On-disk footprint in blocks (merkle plus stored payload).
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.inner.lock().inode.block_count
    }

    #[must_use]
    pub(crate) fn node_index(&self) -> Option<NodeIndex> {
        self.inner.lock().map_index
    }

    pub(crate) fn set_deletable(&self) {
        self.inner.lock().deletable = true;
    }

    #[must_use]
    pub(crate) fn is_deletable(&self) -> bool {
        self.inner.lock().deletable
    }

    pub(crate) fn mark_purged(&self) {
        self.inner.lock().state = BlobState::Purged;
    }

    /// Bump the external handle count. Called only by the cache, under
    /// its lock, so the count cannot race the final-release transition.
    pub(crate) fn retain_handle(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one external handle; true when it was the last. Called only
    /// by the cache, under its lock.
    pub(crate) fn release_handle(&self) -> bool {
        let previous = self.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        previous == 1
    }

    fn fs(&self) -> Result<Arc<SealFs>> {
        self.fs.upgrade().ok_or(SealError::Unavailable)
    }

    /// The readable event; the first request creates it.
    pub fn readable_event(&self) -> Arc<ReadableEvent> {
        let event = {
            let mut slot = self.readable_event.lock();
            if let Some(event) = slot.as_ref() {
                return Arc::clone(event);
            }
            let event = Arc::new(ReadableEvent::default());
            *slot = Some(Arc::clone(&event));
            event
        };
        // Publish-then-check: a transition after the insert above signals
        // through the slot; one before it is caught here. Taking the two
        // locks one at a time keeps the order compatible with the commit
        // path, which signals while holding the state lock.
        if self.inner.lock().state == BlobState::Readable {
            event.signal();
        }
        event
    }

    /// `Empty → DataWrite`: size the blob, reserve space and nodes, map
    /// the write buffer. A zero-length blob commits its metadata here and
    /// is immediately readable.
    pub fn space_allocate(self: &Arc<Self>, blob_size: u64) -> Result<()> {
        let fs = self.fs()?;
        let mut inner = self.inner.lock();
        if inner.state != BlobState::Empty {
            return Err(SealError::BadState);
        }

        let merkle_blocks = tree_blocks(blob_size);
        let data_blocks = bytes_to_blocks(blob_size);
        let block_count = u64_to_u32(merkle_blocks + data_blocks, "block_count")
            .map_err(|_| SealError::OutOfRange)?;
        inner.inode = Inode::new(self.digest, blob_size, block_count);

        if blob_size == 0 {
            // Null blob: no data phase. The name must be the well-known
            // empty root.
            if merkle_root(&[]) != self.digest {
                return Err(SealError::IntegrityError);
            }
            let nodes = fs.reserve_nodes(1)?;
            inner.map_index = Some(nodes[0].index());
            inner.write = Some(WriteInfo {
                bytes_written: 0,
                extents: Vec::new(),
                nodes,
                compressor: None,
            });
            inner.state = BlobState::DataWrite;
            let outcome = self.write_metadata(&fs, &mut inner);
            if let Err(err) = outcome {
                error!(target: "sealfs::blob", digest = %self.digest, %err, "null blob commit failed");
                inner.state = BlobState::Error;
                inner.write = None;
                return Err(err);
            }
            fs.metrics().record_allocation(0);
            return Ok(());
        }

        let extents = fs.reserve_blocks(u64::from(block_count))?;
        if extents.len() > MAX_BLOB_EXTENTS {
            debug!(
                target: "sealfs::blob",
                extents = extents.len(),
                "reservation requires too many extents"
            );
            return Err(SealError::BadState);
        }
        let nodes = fs.reserve_nodes(NodePopulator::node_count_for_extents(extents.len()))?;

        let compressor = if blob_size >= MIN_BYTES_SAVED {
            Some(StreamingCompressor::new(buffer_max(blob_size as usize))?)
        } else {
            None
        };

        let data = BlockBuffer::new(block_count as usize * BS);
        let id = fs.session().attach(&data)?;
        inner.buffers = Some(BlobBuffers {
            data,
            id,
            session: fs.session(),
        });
        inner.map_index = Some(nodes[0].index());
        inner.write = Some(WriteInfo {
            bytes_written: 0,
            extents,
            nodes,
            compressor,
        });
        inner.state = BlobState::DataWrite;
        fs.metrics().record_allocation(blob_size);
        Ok(())
    }

    /// Append a chunk at the blob's write offset. Returns the bytes
    /// consumed; the final chunk triggers Merkle construction, data
    /// writeback, and the metadata commit.
    pub fn write_bytes(self: &Arc<Self>, data: &[u8]) -> Result<usize> {
        let fs = self.fs()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != BlobState::DataWrite {
            return Err(SealError::BadState);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let write = inner.write.as_mut().ok_or(SealError::BadState)?;
        let remaining = inner.inode.blob_size - write.bytes_written;
        let to_write = (data.len() as u64).min(remaining) as usize;
        let merkle_bytes = tree_blocks(inner.inode.blob_size) * BS as u64;
        let offset = (merkle_bytes + write.bytes_written) as usize;

        let buffers = inner.buffers.as_ref().ok_or(SealError::BadState)?;
        buffers.data.write_at(offset, &data[..to_write])?;

        let write = inner.write.as_mut().expect("checked above");
        write.bytes_written += to_write as u64;
        if let Some(compressor) = write.compressor.as_mut() {
            if compressor.is_active() {
                compressor.update(&data[..to_write])?;
            }
        }
        Self::consider_compression_abort(inner.inode.blob_size, write);

        if write.bytes_written < inner.inode.blob_size {
            return Ok(to_write);
        }

        // Buffering complete; seal the blob.
        let outcome = self.complete_write(&fs, inner);
        if let Err(err) = outcome {
            error!(target: "sealfs::blob", digest = %self.digest, %err, "write failed");
            inner.state = BlobState::Error;
            inner.write = None;
            return Err(err);
        }
        Ok(to_write)
    }

    /// Abandon compression once it can no longer save a block.
    fn consider_compression_abort(blob_size: u64, write: &mut WriteInfo) {
        if let Some(compressor) = write.compressor.as_mut() {
            if compressor.is_active()
                && blob_size.saturating_sub(MIN_BYTES_SAVED) < compressor.size()
            {
                trace!(target: "sealfs::blob", "compression abandoned");
                compressor.reset();
            }
        }
    }

    fn complete_write(self: &Arc<Self>, fs: &Arc<SealFs>, inner: &mut BlobInner) -> Result<()> {
        let blob_size = inner.inode.blob_size;
        let merkle_blocks = tree_blocks(blob_size);
        let merkle_bytes = merkle_blocks * BS as u64;

        {
            let write = inner.write.as_mut().ok_or(SealError::BadState)?;
            if let Some(compressor) = write.compressor.as_mut() {
                if compressor.is_active() {
                    compressor.end()?;
                }
            }
            Self::consider_compression_abort(blob_size, write);
        }

        // Build the Merkle tree over the buffered data and check that the
        // content matches the name the blob was opened under.
        let tree_len = tree_size(blob_size) as usize;
        let buffers = inner.buffers.as_ref().ok_or(SealError::BadState)?;
        let root = buffers.data.with_mut(|bytes| {
            let (tree_region, data_region) = bytes.split_at_mut(merkle_bytes as usize);
            let data = &data_region[..blob_size as usize];
            sealfs_merkle::build(data, &mut tree_region[..tree_len])
        })?;
        if root != self.digest {
            return Err(SealError::IntegrityError);
        }

        let write = inner.write.as_ref().ok_or(SealError::BadState)?;
        let compressed = write
            .compressor
            .as_ref()
            .is_some_and(StreamingCompressor::is_active);

        let mut work = fs.create_work()?;
        let data_start = fs.data_start();
        let extent_iter = VectorExtentIterator::new(&write.extents);
        let mut block_iter = BlockIterator::new(extent_iter);

        if compressed {
            let compressor = write.compressor.as_ref().expect("checked");
            let payload = compressor.output().ok_or(SealError::BadState)?;
            let compressed_blocks = bytes_to_blocks(payload.len() as u64);
            let mut scratch = vec![0_u8; compressed_blocks as usize * BS];
            scratch[..payload.len()].copy_from_slice(payload);
            let scratch = BlockBuffer::from_vec(scratch);

            stream_blocks(&mut block_iter, merkle_blocks, |vmo_block, dev_block, length| {
                fs.enqueue_paginated(
                    &mut work,
                    &buffers.data,
                    vmo_block,
                    data_start + dev_block,
                    u64::from(length),
                )
            })?;
            stream_blocks(
                &mut block_iter,
                compressed_blocks,
                |vmo_block, dev_block, length| {
                    fs.enqueue_paginated(
                        &mut work,
                        &scratch,
                        vmo_block - merkle_blocks,
                        data_start + dev_block,
                        u64::from(length),
                    )
                },
            )?;

            // Fewer blocks than reserved; record the real footprint.
            let block_count = u64_to_u32(merkle_blocks + compressed_blocks, "block_count")
                .map_err(|_| SealError::OutOfRange)?;
            debug_assert!(block_count < inner.inode.block_count);
            inner.inode.block_count = block_count;
            inner.inode.compressed = true;
        } else {
            let data_blocks = bytes_to_blocks(blob_size);
            stream_blocks(
                &mut block_iter,
                merkle_blocks + data_blocks,
                |vmo_block, dev_block, length| {
                    fs.enqueue_paginated(
                        &mut work,
                        &buffers.data,
                        vmo_block,
                        data_start + dev_block,
                        u64::from(length),
                    )
                },
            )?;
        }

        fs.enqueue_work(work, EnqueueType::Data)?;
        fs.metrics()
            .record_client_write(blob_size, tree_len as u64);
        self.write_metadata(fs, inner)
    }

    /// Commit the inode chain, bitmap bits, and superblock through the
    /// journal; transition to `Readable` and signal the event.
    fn write_metadata(self: &Arc<Self>, fs: &Arc<SealFs>, inner: &mut BlobInner) -> Result<()> {
        debug_assert_eq!(inner.state, BlobState::DataWrite);
        let work = RefCell::new(fs.create_work()?);

        inner.state = BlobState::Readable;
        if let Some(event) = self.readable_event.lock().as_ref() {
            event.signal();
        }
        self.syncing.store(true, Ordering::Release);

        let write = inner.write.take().ok_or(SealError::BadState)?;
        let map_index = inner.map_index.ok_or(SealError::BadState)?;

        if inner.inode.block_count > 0 {
            fs.allocator()
                .set_node(map_index, &Node::Inode(inner.inode.clone()))?;

            let mut remaining = u64::from(inner.inode.block_count);
            let populator = NodePopulator::new(write.extents, write.nodes);
            populator.walk(
                fs.allocator(),
                |node| fs.persist_node(&mut work.borrow_mut(), node.index()),
                |extent| {
                    debug_assert!(remaining > 0);
                    let length = u64::from(extent.extent().length());
                    if remaining < length {
                        extent.shrink_to(remaining as u16);
                        remaining = 0;
                    } else {
                        remaining -= length;
                    }
                    fs.persist_blocks(&mut work.borrow_mut(), extent)?;
                    if remaining == 0 {
                        Ok(IterationCommand::Stop)
                    } else {
                        Ok(IterationCommand::Continue)
                    }
                },
            )?;
        } else {
            // Null blob: a single node, no extents.
            let mut nodes = write.nodes;
            fs.allocator()
                .set_node(map_index, &Node::Inode(inner.inode.clone()))?;
            fs.allocator().mark_node_allocated(&mut nodes[0]);
            fs.persist_node(&mut work.borrow_mut(), map_index)?;
        }

        let mut work = work.into_inner();
        let weak = Arc::downgrade(self);
        work.set_sync_callback(Box::new(move |status| {
            if let Some(blob) = weak.upgrade() {
                blob.syncing.store(false, Ordering::Release);
                if let Err(err) = status {
                    error!(target: "sealfs::blob", digest = %blob.digest, %err, "metadata commit failed");
                }
            }
        }));
        fs.enqueue_work(work, EnqueueType::Journal)?;
        trace!(target: "sealfs::blob", digest = %self.digest, "metadata enqueued");
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset` from the verified data.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let fs = self.fs()?;
        let mut inner = self.inner.lock();
        if inner.state != BlobState::Readable {
            return Err(SealError::BadState);
        }
        if inner.inode.blob_size == 0 {
            return Ok(0);
        }
        self.init_buffers(&fs, &mut inner)?;

        let blob_size = inner.inode.blob_size;
        if offset >= blob_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(blob_size - offset) as usize;
        let merkle_bytes = tree_blocks(blob_size) * BS as u64;
        let buffers = inner.buffers.as_ref().ok_or(SealError::BadState)?;
        buffers
            .data
            .read_at((merkle_bytes + offset) as usize, &mut buf[..len])?;
        Ok(len)
    }

    /// Materialize and verify the blob's buffers. Idempotent; races
    /// serialize on the vnode lock.
    fn init_buffers(&self, fs: &Arc<SealFs>, inner: &mut BlobInner) -> Result<()> {
        if inner.buffers.is_some() {
            return Ok(());
        }
        let blob_size = inner.inode.blob_size;
        let merkle_blocks = tree_blocks(blob_size);
        let data_blocks = bytes_to_blocks(blob_size);
        let total_blocks = merkle_blocks + data_blocks;
        if total_blocks == 0 {
            return Ok(());
        }
        let map_index = inner.map_index.ok_or(SealError::BadState)?;

        let data = BlockBuffer::new(total_blocks as usize * BS);
        let id = fs.session().attach(&data)?;
        let buffers = BlobBuffers {
            data,
            id,
            session: fs.session(),
        };

        let outcome = self.load_and_verify(fs, inner, &buffers, map_index);
        match outcome {
            Ok(()) => {
                inner.buffers = Some(buffers);
                Ok(())
            }
            Err(err) => {
                // Buffers drop here, reverting the blob to its
                // unmaterialized state.
                Err(err)
            }
        }
    }

    fn load_and_verify(
        &self,
        fs: &Arc<SealFs>,
        inner: &BlobInner,
        buffers: &BlobBuffers,
        map_index: NodeIndex,
    ) -> Result<()> {
        let blob_size = inner.inode.blob_size;
        let merkle_blocks = tree_blocks(blob_size);
        let data_start = fs.data_start();
        let session = fs.session();

        let extent_iter = AllocatedExtentIterator::new(fs.allocator(), map_index)?;
        let mut block_iter = BlockIterator::new(extent_iter);
        let mut requests = Vec::new();

        if inner.inode.compressed {
            let compressed_blocks =
                u64::from(inner.inode.block_count) - merkle_blocks;
            let scratch = BlockBuffer::new(compressed_blocks as usize * BS);
            let scratch_id = session.attach(&scratch)?;

            stream_blocks(&mut block_iter, merkle_blocks, |vmo_block, dev_block, length| {
                requests.push(BlockRequest::read(
                    buffers.id,
                    data_start + dev_block,
                    vmo_block,
                    length,
                ));
                Ok(())
            })?;
            stream_blocks(
                &mut block_iter,
                compressed_blocks,
                |vmo_block, dev_block, length| {
                    requests.push(BlockRequest::read(
                        scratch_id,
                        data_start + dev_block,
                        vmo_block - merkle_blocks,
                        length,
                    ));
                    Ok(())
                },
            )?;
            let outcome = session.transact(&requests);
            let detach = session.detach(scratch_id);
            outcome.and(detach)?;
            fs.metrics()
                .record_disk_read(u64::from(inner.inode.block_count) * BS as u64);

            let payload = scratch.snapshot(0, compressed_blocks as usize * BS)?;
            let decompressed = decompress(&payload)?;
            if decompressed.len() as u64 != blob_size {
                error!(
                    target: "sealfs::blob",
                    digest = %self.digest,
                    expected = blob_size,
                    actual = decompressed.len(),
                    "decompressed size mismatch"
                );
                return Err(SealError::IntegrityError);
            }
            buffers
                .data
                .write_at((merkle_blocks * BS as u64) as usize, &decompressed)?;
            fs.metrics().record_decompress(blob_size);
        } else {
            let total = merkle_blocks + bytes_to_blocks(blob_size);
            stream_blocks(&mut block_iter, total, |vmo_block, dev_block, length| {
                requests.push(BlockRequest::read(
                    buffers.id,
                    data_start + dev_block,
                    vmo_block,
                    length,
                ));
                Ok(())
            })?;
            session.transact(&requests)?;
            fs.metrics().record_disk_read(total * BS as u64);
        }

        self.verify_buffer(fs, &buffers.data, blob_size)
    }

    /// Verify `[merkle || data]` in `buffer` against the blob's digest.
    fn verify_buffer(&self, fs: &Arc<SealFs>, buffer: &BlockBuffer, blob_size: u64) -> Result<()> {
        let merkle_bytes = tree_blocks(blob_size) * BS as u64;
        let tree_len = tree_size(blob_size) as usize;
        let outcome = buffer.with_ref(|bytes| {
            let tree = &bytes[..tree_len];
            let data = &bytes[merkle_bytes as usize..merkle_bytes as usize + blob_size as usize];
            sealfs_merkle::verify(data, tree, 0, blob_size, &self.digest)
        });
        fs.metrics().record_verify();
        if outcome.is_err() {
            error!(target: "sealfs::blob", digest = %self.digest, "verification failed");
        }
        outcome
    }

    /// Read the blob back from disk and verify it, without caching.
    pub(crate) fn verify_disk(&self) -> Result<()> {
        let fs = self.fs()?;
        let mut inner = self.inner.lock();
        if inner.inode.blob_size == 0 {
            return if merkle_root(&[]) == self.digest {
                Ok(())
            } else {
                Err(SealError::IntegrityError)
            };
        }
        self.init_buffers(&fs, &mut inner)?;
        inner.buffers = None;
        Ok(())
    }

    /// A read-only view of the verified data region. The vnode pins
    /// itself while any clone is outstanding.
    pub fn clone_data(self: &Arc<Self>) -> Result<BlobClone> {
        let fs = self.fs()?;
        let mut inner = self.inner.lock();
        if inner.state != BlobState::Readable || inner.inode.blob_size == 0 {
            return Err(SealError::BadState);
        }
        self.init_buffers(&fs, &mut inner)?;
        let buffers = inner.buffers.as_ref().ok_or(SealError::BadState)?;
        let data = buffers.data.clone();
        let blob_size = inner.inode.blob_size;
        let merkle_bytes = tree_blocks(blob_size) * BS as u64;
        drop(inner);

        {
            let mut clones = self.clones.lock();
            clones.count += 1;
            if clones.pin.is_none() {
                clones.pin = Some(Arc::clone(self));
            }
        }
        Ok(BlobClone {
            data,
            offset: merkle_bytes as usize,
            len: blob_size as usize,
            guard: CloneGuard {
                blob: Arc::downgrade(self),
            },
        })
    }

    #[must_use]
    pub(crate) fn has_clones(&self) -> bool {
        self.clones.lock().count > 0
    }

    /// Break the clone self-pin (shutdown teardown).
    pub(crate) fn teardown_clones(&self) -> Option<Arc<Blob>> {
        self.clones.lock().pin.take()
    }

    /// Drop cached buffers and the readable event (eviction). Skipped
    /// while clones still reference the data buffer.
    pub(crate) fn teardown(&self) {
        if self.has_clones() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.buffers = None;
        *self.readable_event.lock() = None;
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blob({}, {:?})", self.digest, self.state())
    }
}

/// RAII release of one outstanding clone.
struct CloneGuard {
    blob: Weak<Blob>,
}

impl Drop for CloneGuard {
    fn drop(&mut self) {
        let Some(blob) = self.blob.upgrade() else {
            return;
        };
        let pin = {
            let mut clones = blob.clones.lock();
            clones.count -= 1;
            if clones.count == 0 {
                clones.pin.take()
            } else {
                None
            }
        };
        // The pin may be the last strong reference; it must not die while
        // the clone lock is held.
        drop(pin);
    }
}

/// Read-only, copy-on-write view of a blob's data region.
pub struct BlobClone {
    data: BlockBuffer,
    offset: usize,
    len: usize,
    #[allow(dead_code)]
    guard: CloneGuard,
}

impl BlobClone {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy out up to `buf.len()` bytes at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let len = buf.len().min(self.len - offset);
        self.data.read_at(self.offset + offset, &mut buf[..len])?;
        Ok(len)
    }

    /// The whole data region as a vector.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.data.snapshot(self.offset, self.len)
    }
}
