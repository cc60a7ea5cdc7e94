//! Mount orchestration and the engine object.
//!
//! `SealFs` is a single object whose lifetime is the mount: it owns the
//! superblock image, the allocator's bitmap and node-table images, the
//! writeback queue, the journal, and the blob cache. Bring-up order is
//! fixed: read the superblock, replay the journal, reload metadata,
//! check volume consistency, start the queues, populate the cache.
//! Teardown reverses it: drain, stop the journal, drain writeback, mark
//! the superblock clean.

use crate::blob::{Blob, BlobState};
use crate::cache::{BlobCache, ReleaseOutcome};
use crate::metrics::Metrics;
use crate::volume::VolumeManager;
use crate::MountOptions;
use parking_lot::Mutex;
use sealfs_alloc::iter::{AllocatedExtentIterator, ExtentIterator};
use sealfs_alloc::{Allocator, ReservedExtent, ReservedNode};
use sealfs_block::{BlockBuffer, BlockRequest, BlockSession, ByteDevice, DeviceSession};
use sealfs_error::{Result, SealError};
use sealfs_journal::Journal;
use sealfs_merkle::Digest;
use sealfs_ondisk::{
    Node, Superblock, SLICE_BLOCK_MAP_START, SLICE_DATA_START, SLICE_JOURNAL_START,
    SLICE_NODE_MAP_START,
};
use sealfs_types::{Extent, NodeIndex, BLOCK_BITS, BLOCK_SIZE, NODE_SIZE};
use sealfs_writeback::{SyncCallback, WritebackQueue, WritebackWork};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const BS: usize = BLOCK_SIZE as usize;

/// Where a work item goes: through the journal (metadata) or straight to
/// writeback (blob data). With the journal disabled, metadata falls
/// through to writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueType {
    Journal,
    Data,
}

/// Opaque cursor for [`SealFs::readdir`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirCursor {
    next_index: u64,
}

/// Per-entry overhead charged against the caller's buffer capacity, on
/// top of the 64-character name.
const DIRENT_OVERHEAD: usize = 8;

/// The mounted filesystem engine.
pub struct SealFs {
    options: MountOptions,
    device: Arc<dyn ByteDevice>,
    session: Arc<dyn BlockSession>,
    superblock: Mutex<Superblock>,
    info_buffer: BlockBuffer,
    allocator: Allocator,
    cache: BlobCache,
    metrics: Metrics,
    volume: Option<Box<dyn VolumeManager>>,
    shut_down: AtomicBool,
    // Field order matters: the journal must drop (and drain) before the
    // writeback queue it feeds.
    journal: Mutex<Option<Journal>>,
    writeback: Option<Arc<WritebackQueue>>,
}

impl SealFs {
    /// Mount a formatted device.
    pub fn mount(
        device: Arc<dyn ByteDevice>,
        volume: Option<Box<dyn VolumeManager>>,
        options: MountOptions,
    ) -> Result<Arc<Self>> {
        let device_blocks = device.len_bytes() / BS as u64;
        let superblock = read_superblock(device.as_ref(), device_blocks)?;

        // Replay before trusting any other metadata; entries may rewrite
        // the superblock, the bitmap, and the node table.
        if !options.readonly {
            sealfs_journal::replay(
                device.as_ref(),
                superblock.journal_start_block(),
                superblock.journal_block_count,
            )?;
        }
        let mut superblock = read_superblock(device.as_ref(), device_blocks)?;
        let replay_sequence = current_journal_sequence(device.as_ref(), &superblock)?;

        let session: Arc<dyn BlockSession> = Arc::new(DeviceSession::new(Arc::clone(&device)));

        let info_buffer = BlockBuffer::from_vec(superblock.serialize());
        let block_map = BlockBuffer::new(superblock.block_map_blocks() as usize * BS);
        let node_map = BlockBuffer::new(superblock.node_map_blocks() as usize * BS);
        read_region(
            session.as_ref(),
            &block_map,
            superblock.block_map_start_block(),
            superblock.block_map_blocks(),
        )?;
        read_region(
            session.as_ref(),
            &node_map,
            superblock.node_map_start_block(),
            superblock.node_map_blocks(),
        )?;
        let allocator = Allocator::new(
            block_map,
            node_map,
            superblock.data_block_count,
            superblock.inode_count,
        );

        if superblock.is_sliced() {
            let Some(volume) = volume.as_deref() else {
                warn!(target: "sealfs::fs", "sliced container mounted without a volume manager");
                return Err(SealError::Unavailable);
            };
            check_volume_consistency(&superblock, volume)?;
        }

        let writeback = if options.readonly {
            None
        } else {
            let capacity_blocks = (options.writeback_buffer_size / BS as u64).max(4);
            Some(Arc::new(WritebackQueue::new(
                Arc::clone(&session),
                capacity_blocks,
            )))
        };
        let journal = match (&writeback, options.journal) {
            (Some(queue), true) => Some(Journal::new(
                Arc::clone(&session),
                Arc::clone(queue),
                superblock.journal_start_block(),
                superblock.journal_block_count,
                replay_sequence,
            )),
            _ => None,
        };

        // A writable mount is dirty until it shuts down cleanly.
        if !options.readonly {
            superblock.set_clean(false);
            device.write_all_at(0, &superblock.serialize())?;
            device.sync()?;
        }

        let fs = Arc::new(Self {
            cache: BlobCache::new(options.cache_policy),
            metrics: Metrics::new(options.metrics),
            options,
            device,
            session,
            superblock: Mutex::new(superblock),
            info_buffer,
            allocator,
            volume,
            shut_down: AtomicBool::new(false),
            journal: Mutex::new(journal),
            writeback,
        });
        fs.populate_cache()?;
        {
            let superblock = fs.superblock.lock();
            info!(
                target: "sealfs::fs",
                blocks = superblock.data_block_count,
                inodes = superblock.inode_count,
                "mounted"
            );
        }
        Ok(fs)
    }

    /// Load every committed blob into the closed cache for warm lookup.
    fn populate_cache(self: &Arc<Self>) -> Result<()> {
        let inode_count = self.allocator.inode_count();
        for index in 0..inode_count {
            let index = NodeIndex(index as u32);
            if let Node::Inode(inode) = self.allocator.node(index)? {
                let blob = Blob::new_readable(self, index, inode);
                if self.cache.insert_closed(blob).is_err() {
                    error!(
                        target: "sealfs::fs",
                        node = %index,
                        "corrupted filesystem: duplicate digest in node table"
                    );
                    return Err(SealError::AlreadyExists);
                }
            }
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub(crate) fn session(&self) -> Arc<dyn BlockSession> {
        Arc::clone(&self.session)
    }

    #[must_use]
    pub(crate) fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[must_use]
    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// First device block of the data region.
    #[must_use]
    pub(crate) fn data_start(&self) -> u64 {
        self.superblock.lock().data_start_block()
    }

    /// Copy of the in-memory superblock.
    #[must_use]
    pub fn info(&self) -> Superblock {
        self.superblock.lock().clone()
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> crate::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Set bits in the on-disk allocation bitmap (accounting checks).
    #[must_use]
    pub fn allocated_blocks(&self) -> u64 {
        self.allocator.allocated_block_count()
    }

    /// Allocated node-table records, containers included.
    #[must_use]
    pub fn allocated_nodes(&self) -> u64 {
        self.allocator.allocated_node_count()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.options.readonly
    }

    // ── Work plumbing ───────────────────────────────────────────────────

    pub(crate) fn create_work(&self) -> Result<WritebackWork> {
        if self.writeback.is_none() || self.shut_down.load(Ordering::Acquire) {
            return Err(SealError::BadState);
        }
        Ok(WritebackWork::new())
    }

    pub(crate) fn enqueue_work(&self, work: WritebackWork, ty: EnqueueType) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            work.reset();
            return Err(SealError::BadState);
        }
        if ty == EnqueueType::Journal {
            let journal = self.journal.lock();
            if let Some(journal) = journal.as_ref() {
                return journal.enqueue(work);
            }
            // Journal disabled: metadata falls through to writeback.
        }
        if let Some(writeback) = &self.writeback {
            return writeback.enqueue(work);
        }
        work.reset();
        Err(SealError::BadState)
    }

    /// Append a bulk write, splitting the work item whenever it would
    /// exceed the writeback queue's per-item limit.
    pub(crate) fn enqueue_paginated(
        &self,
        work: &mut WritebackWork,
        buffer: &BlockBuffer,
        vmo_block: u64,
        device_block: u64,
        nblocks: u64,
    ) -> Result<()> {
        let max_chunk = self
            .writeback
            .as_ref()
            .map(|queue| queue.max_work_blocks())
            .ok_or(SealError::BadState)?
            .max(1);

        let mut vmo_block = vmo_block;
        let mut device_block = device_block;
        let mut remaining = nblocks;
        let mut delta = remaining.min(max_chunk);
        while remaining > 0 {
            work.enqueue(buffer, vmo_block, device_block, delta as u32);
            vmo_block += delta;
            device_block += delta;
            remaining -= delta;
            delta = remaining.min(max_chunk);
            if remaining > 0 {
                let full = std::mem::take(work);
                self.enqueue_work(full, EnqueueType::Data)?;
            }
        }
        Ok(())
    }

    // ── Metadata persistence ────────────────────────────────────────────

    fn write_info_locked(&self, superblock: &Superblock, work: &mut WritebackWork) {
        self.info_buffer
            .with_mut(|bytes| bytes.copy_from_slice(&superblock.serialize()));
        work.enqueue(&self.info_buffer, 0, 0, 1);
    }

    fn write_bitmap_locked(
        &self,
        superblock: &Superblock,
        work: &mut WritebackWork,
        nblocks: u64,
        start_block: u64,
    ) {
        let bbm_start = start_block / BLOCK_BITS;
        let bbm_end = (start_block + nblocks).div_ceil(BLOCK_BITS);
        work.enqueue(
            self.allocator.block_map(),
            bbm_start,
            superblock.block_map_start_block() + bbm_start,
            (bbm_end - bbm_start) as u32,
        );
    }

    fn write_node_locked(
        &self,
        superblock: &Superblock,
        work: &mut WritebackWork,
        index: NodeIndex,
    ) {
        let block = index.table_block();
        work.enqueue(
            self.allocator.node_map(),
            block,
            superblock.node_map_start_block() + block,
            1,
        );
    }

    /// Commit a reserved extent: bitmap bits, counts, superblock.
    pub(crate) fn persist_blocks(
        &self,
        work: &mut WritebackWork,
        extent: &mut ReservedExtent,
    ) -> Result<()> {
        self.allocator.mark_blocks_allocated(extent);
        let run = extent.extent();
        let mut superblock = self.superblock.lock();
        superblock.alloc_block_count += u64::from(run.length());
        self.write_bitmap_locked(
            &superblock,
            work,
            u64::from(run.length()),
            u64::from(run.start()),
        );
        self.write_info_locked(&superblock, work);
        Ok(())
    }

    /// Free a committed extent's bits, if they are in fact allocated.
    pub(crate) fn free_extent(&self, work: &mut WritebackWork, extent: Extent) {
        let start = u64::from(extent.start());
        let end = extent.end();
        if self.allocator.check_blocks_allocated(start, end) {
            self.allocator.free_blocks(extent);
            let mut superblock = self.superblock.lock();
            superblock.alloc_block_count -= u64::from(extent.length());
            self.write_bitmap_locked(&superblock, work, u64::from(extent.length()), start);
            self.write_info_locked(&superblock, work);
        }
    }

    /// Persist a newly-allocated node record.
    pub(crate) fn persist_node(&self, work: &mut WritebackWork, index: NodeIndex) -> Result<()> {
        let mut superblock = self.superblock.lock();
        superblock.alloc_inode_count += 1;
        self.write_node_locked(&superblock, work, index);
        self.write_info_locked(&superblock, work);
        Ok(())
    }

    fn free_node_record(&self, work: &mut WritebackWork, index: NodeIndex) -> Result<()> {
        self.allocator.free_node(index)?;
        let mut superblock = self.superblock.lock();
        superblock.alloc_inode_count -= 1;
        self.write_node_locked(&superblock, work, index);
        Ok(())
    }

    /// Free a blob's whole inode chain: every node, every extent.
    pub(crate) fn free_inode(&self, work: &mut WritebackWork, index: NodeIndex) -> Result<()> {
        let Node::Inode(_) = self.allocator.node(index)? else {
            return Ok(());
        };

        // Collect the chain before mutating it.
        let mut nodes = vec![index];
        let mut extents = Vec::new();
        {
            let mut iter = AllocatedExtentIterator::new(&self.allocator, index)?;
            let mut current = index;
            while let Some(extent) = iter.next_extent()? {
                if iter.node_index() != current {
                    current = iter.node_index();
                    nodes.push(current);
                }
                extents.push(extent);
            }
        }

        for node in nodes {
            self.free_node_record(work, node)?;
        }
        for extent in extents {
            self.free_extent(work, extent);
        }
        let superblock = self.superblock.lock();
        self.write_info_locked(&superblock, work);
        Ok(())
    }

    // ── Space reservation & volume growth ───────────────────────────────

    /// Reserve data blocks, growing the container once on `NoSpace`.
    pub(crate) fn reserve_blocks(&self, count: u64) -> Result<Vec<ReservedExtent>> {
        match self.allocator.reserve_blocks(count) {
            Err(SealError::NoSpace) => {
                self.grow_blocks(count)?;
                self.allocator.reserve_blocks(count)
            }
            other => other,
        }
    }

    /// Reserve node slots, growing the node table once on `NoSpace`.
    pub(crate) fn reserve_nodes(&self, count: usize) -> Result<Vec<ReservedNode>> {
        match self.allocator.reserve_nodes(count) {
            Err(SealError::NoSpace) => {
                self.grow_inodes()?;
                self.allocator.reserve_nodes(count)
            }
            other => other,
        }
    }

    fn grow_blocks(&self, nblocks: u64) -> Result<()> {
        let mut superblock = self.superblock.lock();
        if !superblock.is_sliced() {
            return Err(SealError::NoSpace);
        }
        let Some(volume) = self.volume.as_deref() else {
            return Err(SealError::NoSpace);
        };

        let bps = superblock.blocks_per_slice();
        let slices = nblocks.div_ceil(bps);
        let offset = SLICE_DATA_START / bps + u64::from(superblock.dat_slices);
        let blocks = (u64::from(superblock.dat_slices) + slices) * bps;
        let abm_blocks = blocks.div_ceil(BLOCK_BITS);
        let abm_blocks_old = superblock.data_block_count.div_ceil(BLOCK_BITS);

        if abm_blocks > u64::from(superblock.abm_slices) * bps {
            // Growing the bitmap region itself needs another bitmap
            // slice, which this revision does not support.
            warn!(target: "sealfs::fs", "data growth exceeds bitmap slice capacity");
            return Err(SealError::NeedBitmapSlice);
        }
        if volume.extend(offset, slices).is_err() {
            return Err(SealError::NoSpace);
        }

        self.allocator.block_map().grow(abm_blocks as usize * BS);
        self.allocator.grow_data_blocks(blocks);
        superblock.vslice_count += slices as u32;
        superblock.dat_slices += slices as u32;
        superblock.data_block_count = blocks;
        debug!(
            target: "sealfs::fs",
            slices,
            data_blocks = blocks,
            "data region grown"
        );

        let mut work = self.create_work()?;
        if abm_blocks > abm_blocks_old {
            work.enqueue(
                self.allocator.block_map(),
                abm_blocks_old,
                superblock.block_map_start_block() + abm_blocks_old,
                (abm_blocks - abm_blocks_old) as u32,
            );
        }
        self.write_info_locked(&superblock, &mut work);
        drop(superblock);
        self.enqueue_work(work, EnqueueType::Journal)
    }

    fn grow_inodes(&self) -> Result<()> {
        let mut superblock = self.superblock.lock();
        if !superblock.is_sliced() {
            return Err(SealError::NoSpace);
        }
        let Some(volume) = self.volume.as_deref() else {
            return Err(SealError::NoSpace);
        };

        let bps = superblock.blocks_per_slice();
        let offset = SLICE_NODE_MAP_START / bps + u64::from(superblock.ino_slices);
        if volume.extend(offset, 1).is_err() {
            return Err(SealError::NoSpace);
        }

        let inodes =
            (u64::from(superblock.ino_slices) + 1) * (superblock.slice_size / NODE_SIZE as u64);
        let ino_blocks_old = superblock.node_map_blocks();
        self.allocator.node_map().grow(inodes as usize * NODE_SIZE);
        self.allocator.grow_inode_count(inodes);
        superblock.vslice_count += 1;
        superblock.ino_slices += 1;
        superblock.inode_count = inodes;
        let ino_blocks = superblock.node_map_blocks();
        debug!(target: "sealfs::fs", inodes, "node table grown");

        let mut work = self.create_work()?;
        self.write_info_locked(&superblock, &mut work);
        work.enqueue(
            self.allocator.node_map(),
            ino_blocks_old,
            superblock.node_map_start_block() + ino_blocks_old,
            (ino_blocks - ino_blocks_old) as u32,
        );
        drop(superblock);
        self.enqueue_work(work, EnqueueType::Journal)
    }

    // ── Blob lifecycle ──────────────────────────────────────────────────

    /// Open a new blob for writing. The digest is the name the content
    /// must hash to.
    pub fn create_blob(self: &Arc<Self>, digest: Digest) -> Result<Arc<Blob>> {
        if self.options.readonly || self.shut_down.load(Ordering::Acquire) {
            return Err(SealError::BadState);
        }
        // Existence probe only: `lookup` would resurrect a closed entry.
        if self.cache.contains(&digest) {
            return Err(SealError::AlreadyExists);
        }
        let blob = Blob::new_for_write(self, digest);
        self.cache.insert_open(&blob)?;
        Ok(blob)
    }

    /// Look up a live blob by digest. The returned handle is retained by
    /// the cache and must be dropped through `close_blob`.
    pub fn open_blob(&self, digest: &Digest) -> Result<Arc<Blob>> {
        let Some(blob) = self.cache.lookup(digest) else {
            return Err(SealError::NotFound);
        };
        self.metrics.record_lookup(blob.size());
        Ok(blob)
    }

    /// Release a handle returned by `create_blob`/`open_blob`.
    pub fn close_blob(&self, blob: &Arc<Blob>) -> Result<()> {
        match self.cache.release(blob) {
            ReleaseOutcome::Retained | ReleaseOutcome::Cached => Ok(()),
            ReleaseOutcome::NeedsPurge => self.purge_blob(blob),
        }
    }

    /// Mark a blob for deletion; it disappears now if unreferenced, or on
    /// last close otherwise.
    pub fn unlink(&self, digest: &Digest) -> Result<()> {
        // Take a handle, mark, and release it: the release path decides
        // atomically whether this was the only reference.
        let Some(blob) = self.cache.lookup(digest) else {
            return Err(SealError::NotFound);
        };
        blob.set_deletable();
        self.close_blob(&blob)
    }

    /// Remove all traces of a blob. For readable blobs this frees the
    /// inode chain through the journal.
    fn purge_blob(&self, blob: &Arc<Blob>) -> Result<()> {
        match blob.state() {
            BlobState::Empty | BlobState::DataWrite | BlobState::Error => {
                self.cache.evict(blob.digest());
                blob.mark_purged();
                Ok(())
            }
            BlobState::Readable => {
                debug_assert!(blob.is_deletable());
                let index = blob.node_index().ok_or(SealError::BadState)?;
                let mut work = self.create_work()?;
                self.free_inode(&mut work, index)?;
                self.cache.evict(blob.digest());
                blob.mark_purged();
                debug!(target: "sealfs::fs", digest = %blob.digest(), "blob purged");
                self.enqueue_work(work, EnqueueType::Journal)
            }
            BlobState::Purged => Ok(()),
        }
    }

    /// Read a blob back from disk by node index and verify it against its
    /// recorded digest, without touching the cache.
    pub fn verify_blob(self: &Arc<Self>, node_index: u32) -> Result<()> {
        let index = NodeIndex(node_index);
        let Node::Inode(inode) = self.allocator.node(index)? else {
            return Err(SealError::InvalidArgs);
        };
        let blob = Blob::new_readable(self, index, inode);
        blob.verify_disk()
    }

    // ── Enumeration ─────────────────────────────────────────────────────

    /// Enumerate committed blob names (hex digests) from the cursor,
    /// stopping when `capacity` bytes of directory buffer are exhausted.
    pub fn readdir(&self, cursor: &mut DirCursor, capacity: usize) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut used = 0_usize;
        let inode_count = self.allocator.inode_count();

        for index in cursor.next_index..inode_count {
            let node = self.allocator.node(NodeIndex(index as u32))?;
            if let Node::Inode(inode) = node {
                let name = inode.digest.to_hex();
                let cost = name.len() + DIRENT_OVERHEAD;
                if used + cost > capacity {
                    break;
                }
                used += cost;
                names.push(name);
                cursor.next_index = index + 1;
            }
        }
        Ok(names)
    }

    // ── Durability ──────────────────────────────────────────────────────

    /// Enqueue a barrier through the journal; `callback` fires with the
    /// final status once everything before it is durable.
    pub fn sync(&self, callback: SyncCallback) {
        let mut work = match self.create_work() {
            Ok(work) => work,
            Err(err) => {
                callback(Err(err));
                return;
            }
        };
        work.set_sync_callback(callback);
        // The callback fires either way; a failed enqueue reports through it.
        let _ = self.enqueue_work(work, EnqueueType::Journal);
    }

    /// Synchronous flavor of [`SealFs::sync`].
    pub fn sync_blocking(&self) -> Result<()> {
        let done: Arc<(Mutex<Option<Result<()>>>, parking_lot::Condvar)> =
            Arc::new((Mutex::new(None), parking_lot::Condvar::new()));
        let signal = Arc::clone(&done);
        self.sync(Box::new(move |status| {
            *signal.0.lock() = Some(status);
            signal.1.notify_all();
        }));
        let mut slot = done.0.lock();
        while slot.is_none() {
            done.1.wait(&mut slot);
        }
        slot.take().expect("signalled")
    }

    /// Ordered teardown: break clone pins, drain the journal and
    /// writeback, persist the clean flag. The engine refuses new work
    /// afterwards.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(target: "sealfs::fs", "shutting down");

        for blob in self.cache.live_blobs() {
            drop(blob.teardown_clones());
        }

        if !self.options.readonly {
            // Drain the journal: a final empty barrier, then stop the
            // commit thread.
            {
                let journal = self.journal.lock();
                if let Some(journal) = journal.as_ref() {
                    let mut work = WritebackWork::new();
                    work.set_sync_callback(Box::new(|_| {}));
                    let _ = journal.enqueue(work);
                    journal.wait_idle();
                }
            }
            let journal = self.journal.lock().take();
            drop(journal);

            if let Some(writeback) = &self.writeback {
                let _ = writeback.barrier();
                writeback.wait_idle();
            }

            let mut superblock = self.superblock.lock();
            superblock.set_clean(true);
            self.device.write_all_at(0, &superblock.serialize())?;
            self.device.sync()?;
        }

        self.cache.clear();
        Ok(())
    }
}

impl std::fmt::Debug for SealFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealFs({:?})", self.cache)
    }
}

impl Drop for SealFs {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            // An un-shut-down engine still drains its queues on drop; it
            // just skips the clean-flag write, so the next mount replays.
            debug!(target: "sealfs::fs", "dropped without shutdown");
        }
    }
}

fn read_superblock(device: &dyn ByteDevice, device_blocks: u64) -> Result<Superblock> {
    let mut block = vec![0_u8; BS];
    device.read_exact_at(0, &mut block)?;
    let superblock = Superblock::parse(&block)?;
    superblock.check(device_blocks)?;
    Ok(superblock)
}

/// The journal's next sequence number, read from its info block after
/// replay reset it.
fn current_journal_sequence(device: &dyn ByteDevice, superblock: &Superblock) -> Result<u64> {
    let mut block = vec![0_u8; BS];
    device.read_exact_at(superblock.journal_start_block() * BS as u64, &mut block)?;
    sealfs_journal::info_sequence(&block).map_err(SealError::Format)
}

fn read_region(
    session: &dyn BlockSession,
    buffer: &BlockBuffer,
    device_start: u64,
    blocks: u64,
) -> Result<()> {
    if blocks == 0 {
        return Ok(());
    }
    let id = session.attach(buffer)?;
    let outcome = session.transact(&[BlockRequest::read(id, device_start, 0, blocks as u32)]);
    let detach = session.detach(id);
    outcome.and(detach)
}

/// Mount-time consistency check between the superblock's slice counts and
/// what the volume manager reports. Excess slices are returned; a
/// shortfall is fatal, since filesystem structures may live there.
fn check_volume_consistency(superblock: &Superblock, volume: &dyn VolumeManager) -> Result<()> {
    let info = volume.query().map_err(|_| SealError::Unavailable)?;
    if info.slice_size != superblock.slice_size {
        error!(target: "sealfs::fs", "volume slice size does not match superblock");
        return Err(SealError::BadState);
    }

    let bps = superblock.blocks_per_slice();
    let starts = [
        SLICE_BLOCK_MAP_START / bps,
        SLICE_NODE_MAP_START / bps,
        SLICE_JOURNAL_START / bps,
        SLICE_DATA_START / bps,
    ];
    let expected = [
        u64::from(superblock.abm_slices),
        u64::from(superblock.ino_slices),
        u64::from(superblock.journal_slices),
        u64::from(superblock.dat_slices),
    ];
    let ranges = volume
        .vslice_query(&starts)
        .map_err(|_| SealError::Unavailable)?;
    if ranges.len() != starts.len() {
        return Err(SealError::BadState);
    }

    for ((start, expected), range) in starts.iter().zip(expected).zip(ranges) {
        if !range.allocated || range.count < expected {
            error!(
                target: "sealfs::fs",
                start_slice = start,
                expected,
                reported = range.count,
                "volume reports fewer slices than the superblock"
            );
            return Err(SealError::IntegrityError);
        }
        if range.count > expected
            && volume
                .shrink(start + expected, range.count - expected)
                .is_err()
        {
            return Err(SealError::IntegrityError);
        }
    }
    Ok(())
}
