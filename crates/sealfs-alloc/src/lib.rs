#![forbid(unsafe_code)]
//! Block and node allocation.
//!
//! The allocator owns the in-memory images of the allocation bitmap and
//! the node table (both shared `BlockBuffer`s, so metadata writeback can
//! address them directly) plus a parallel reserved bitmap that is never
//! persisted. A reservation claims space for one writer; committing flips
//! the on-disk bits, and dropping an uncommitted reservation releases the
//! claim silently.
//!
//! ## Layering
//!
//! 1. **Bitmap** — raw bit manipulation on byte slices.
//! 2. **Allocator** — reserve/commit/free over the shared images.
//! 3. **Iterators** (`iter`) — walk a blob's extent chain.
//! 4. **NodePopulator** (`populator`) — turn reservations into a
//!    committed inode chain.

pub mod iter;
pub mod populator;

use parking_lot::Mutex;
use sealfs_block::BlockBuffer;
use sealfs_error::{Result, SealError};
use sealfs_ondisk::{node_at, write_node, Node};
use sealfs_types::{Extent, NodeIndex, MAX_EXTENT_LENGTH, NODE_SIZE};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_ones(bitmap: &[u8], count: u64) -> u64 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut ones = 0_u64;

    for &byte in bitmap.iter().take(full_bytes) {
        ones += u64::from(byte.count_ones());
    }
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 1 {
                ones += 1;
            }
        }
    }
    ones
}

// ── Reservations ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AllocState {
    data_block_count: u64,
    inode_count: u64,
    /// Bits claimed by in-flight writers; never persisted.
    reserved_blocks: Vec<u8>,
    reserved_nodes: BTreeSet<u32>,
}

impl AllocState {
    fn reserved_bitmap_len(data_block_count: u64) -> usize {
        (data_block_count.div_ceil(8)) as usize
    }
}

/// A transient claim on a run of data blocks.
///
/// Dropping an uncommitted reservation releases the claim.
pub struct ReservedExtent {
    state: Arc<Mutex<AllocState>>,
    extent: Extent,
    committed: bool,
}

impl ReservedExtent {
    #[must_use]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Keep only the first `length` blocks; the tail claim is released
    /// immediately. Used when compression leaves part of the final extent
    /// unused.
    pub fn shrink_to(&mut self, length: u16) {
        debug_assert!(length <= self.extent.length());
        debug_assert!(!self.committed);
        let tail = self.extent.suffix(length);
        if !tail.is_empty() {
            let mut state = self.state.lock();
            for block in tail.start()..u64_end(tail) {
                bitmap_clear(&mut state.reserved_blocks, u64::from(block));
            }
        }
        self.extent = self.extent.prefix(length);
    }
}

fn u64_end(extent: Extent) -> u32 {
    // Extent ends are validated against data_block_count (u32-addressable)
    // at reservation time.
    extent.end() as u32
}

impl Drop for ReservedExtent {
    fn drop(&mut self) {
        if self.committed || self.extent.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for block in self.extent.start()..u64_end(self.extent) {
            bitmap_clear(&mut state.reserved_blocks, u64::from(block));
        }
    }
}

impl std::fmt::Debug for ReservedExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReservedExtent({}, committed={})", self.extent, self.committed)
    }
}

/// A transient claim on one node-table slot.
pub struct ReservedNode {
    state: Arc<Mutex<AllocState>>,
    index: u32,
    committed: bool,
}

impl ReservedNode {
    #[must_use]
    pub fn index(&self) -> NodeIndex {
        NodeIndex(self.index)
    }
}

impl Drop for ReservedNode {
    fn drop(&mut self) {
        if !self.committed {
            self.state.lock().reserved_nodes.remove(&self.index);
        }
    }
}

impl std::fmt::Debug for ReservedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReservedNode({}, committed={})", self.index, self.committed)
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Reserve/commit/free over the bitmap and node-table images.
///
/// Lock order: the allocator's own state lock is taken before the shared
/// buffer locks and released before any writeback enqueue.
pub struct Allocator {
    block_map: BlockBuffer,
    node_map: BlockBuffer,
    state: Arc<Mutex<AllocState>>,
}

impl Allocator {
    #[must_use]
    pub fn new(
        block_map: BlockBuffer,
        node_map: BlockBuffer,
        data_block_count: u64,
        inode_count: u64,
    ) -> Self {
        let reserved_len = AllocState::reserved_bitmap_len(data_block_count);
        Self {
            block_map,
            node_map,
            state: Arc::new(Mutex::new(AllocState {
                data_block_count,
                inode_count,
                reserved_blocks: vec![0_u8; reserved_len],
                reserved_nodes: BTreeSet::new(),
            })),
        }
    }

    /// The shared bitmap image (for writeback and reload).
    #[must_use]
    pub fn block_map(&self) -> &BlockBuffer {
        &self.block_map
    }

    /// The shared node-table image (for writeback and reload).
    #[must_use]
    pub fn node_map(&self) -> &BlockBuffer {
        &self.node_map
    }

    /// Claim `count` data blocks using a first-fit scan from block zero.
    ///
    /// Returns multiple extents when free space is fragmented. On
    /// `NoSpace`, nothing is reserved.
    pub fn reserve_blocks(&self, count: u64) -> Result<Vec<ReservedExtent>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        let data_block_count = state.data_block_count;

        let runs = self.block_map.with_ref(|disk| {
            let mut runs: Vec<Extent> = Vec::new();
            let mut needed = count;
            let mut run_start: Option<u64> = None;
            let mut run_len = 0_u64;

            let mut flush_run =
                |runs: &mut Vec<Extent>, start: u64, len: u64, needed: &mut u64| {
                    let mut start = start;
                    let mut len = len.min(*needed);
                    while len > 0 {
                        let take = len.min(u64::from(MAX_EXTENT_LENGTH));
                        runs.push(Extent::new(start as u32, take as u16));
                        *needed -= take;
                        start += take;
                        len -= take;
                    }
                };

            for idx in 0..data_block_count {
                let busy = bitmap_get(disk, idx) || bitmap_get(&state.reserved_blocks, idx);
                if busy {
                    if let Some(start) = run_start.take() {
                        flush_run(&mut runs, start, run_len, &mut needed);
                        run_len = 0;
                    }
                } else {
                    if run_start.is_none() {
                        run_start = Some(idx);
                    }
                    run_len += 1;
                }
                if needed == 0 {
                    break;
                }
            }
            if needed > 0 {
                if let Some(start) = run_start.take() {
                    flush_run(&mut runs, start, run_len, &mut needed);
                }
            }

            if needed > 0 {
                None
            } else {
                Some(runs)
            }
        });

        let Some(runs) = runs else {
            debug!(target: "sealfs::alloc", count, "block reservation failed: no space");
            return Err(SealError::NoSpace);
        };

        for extent in &runs {
            for block in extent.start()..u64_end(*extent) {
                bitmap_set(&mut state.reserved_blocks, u64::from(block));
            }
        }
        trace!(target: "sealfs::alloc", count, extents = runs.len(), "reserved blocks");

        Ok(runs
            .into_iter()
            .map(|extent| ReservedExtent {
                state: Arc::clone(&self.state),
                extent,
                committed: false,
            })
            .collect())
    }

    /// Claim `count` free node-table slots. All-or-nothing.
    pub fn reserve_nodes(&self, count: usize) -> Result<Vec<ReservedNode>> {
        let mut state = self.state.lock();
        let inode_count = state.inode_count;

        let picked = self.node_map.with_ref(|image| {
            let mut picked = Vec::with_capacity(count);
            for index in 0..inode_count {
                if picked.len() == count {
                    break;
                }
                let index = index as u32;
                if state.reserved_nodes.contains(&index) {
                    continue;
                }
                match node_at(image, index) {
                    Ok(Node::Free) => picked.push(index),
                    Ok(_) => {}
                    Err(_) => {}
                }
            }
            picked
        });

        if picked.len() < count {
            debug!(target: "sealfs::alloc", count, "node reservation failed: no space");
            return Err(SealError::NoSpace);
        }
        for index in &picked {
            state.reserved_nodes.insert(*index);
        }
        Ok(picked
            .into_iter()
            .map(|index| ReservedNode {
                state: Arc::clone(&self.state),
                index,
                committed: false,
            })
            .collect())
    }

    /// Commit a reservation: flip the on-disk bits and drop the claim.
    pub fn mark_blocks_allocated(&self, extent: &mut ReservedExtent) {
        let mut state = self.state.lock();
        let run = extent.extent();
        self.block_map.with_mut(|disk| {
            for block in run.start()..u64_end(run) {
                bitmap_set(disk, u64::from(block));
                bitmap_clear(&mut state.reserved_blocks, u64::from(block));
            }
        });
        extent.committed = true;
    }

    /// Commit a node reservation. The caller is responsible for having
    /// written the record itself via `set_node`.
    pub fn mark_node_allocated(&self, node: &mut ReservedNode) {
        self.state.lock().reserved_nodes.remove(&node.index);
        node.committed = true;
    }

    /// Clear the on-disk bits of a committed extent.
    pub fn free_blocks(&self, extent: Extent) {
        let _state = self.state.lock();
        self.block_map.with_mut(|disk| {
            for block in extent.start()..u64_end(extent) {
                bitmap_clear(disk, u64::from(block));
            }
        });
    }

    /// Whether every block in `start..end` is allocated on disk.
    #[must_use]
    pub fn check_blocks_allocated(&self, start: u64, end: u64) -> bool {
        let _state = self.state.lock();
        self.block_map
            .with_ref(|disk| (start..end).all(|idx| bitmap_get(disk, idx)))
    }

    /// Decode the node at `index`.
    pub fn node(&self, index: NodeIndex) -> Result<Node> {
        if u64::from(index.0) >= self.state.lock().inode_count {
            return Err(SealError::OutOfRange);
        }
        self.node_map
            .with_ref(|image| node_at(image, index.0))
            .map_err(SealError::from)
    }

    /// Encode `node` at `index`.
    pub fn set_node(&self, index: NodeIndex, node: &Node) -> Result<()> {
        if u64::from(index.0) >= self.state.lock().inode_count {
            return Err(SealError::OutOfRange);
        }
        self.node_map
            .with_mut(|image| write_node(image, index.0, node))
            .map_err(SealError::from)
    }

    /// Release the node-table slot at `index`.
    pub fn free_node(&self, index: NodeIndex) -> Result<()> {
        self.set_node(index, &Node::Free)
    }

    /// Free data blocks not yet reserved or allocated.
    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        let state = self.state.lock();
        let allocated = self
            .block_map
            .with_ref(|disk| bitmap_count_ones(disk, state.data_block_count));
        let reserved = bitmap_count_ones(&state.reserved_blocks, state.data_block_count);
        state.data_block_count - allocated - reserved
    }

    /// Set bits in the on-disk bitmap (accounting checks).
    #[must_use]
    pub fn allocated_block_count(&self) -> u64 {
        let state = self.state.lock();
        self.block_map
            .with_ref(|disk| bitmap_count_ones(disk, state.data_block_count))
    }

    /// Allocated records in the node table, containers included.
    #[must_use]
    pub fn allocated_node_count(&self) -> u64 {
        let state = self.state.lock();
        let inode_count = state.inode_count;
        self.node_map.with_ref(|image| {
            (0..inode_count)
                .filter(|index| {
                    !matches!(node_at(image, *index as u32), Ok(Node::Free) | Err(_))
                })
                .count() as u64
        })
    }

    #[must_use]
    pub fn data_block_count(&self) -> u64 {
        self.state.lock().data_block_count
    }

    #[must_use]
    pub fn inode_count(&self) -> u64 {
        self.state.lock().inode_count
    }

    /// Adopt a larger data region after volume growth. The caller grows
    /// the bitmap buffer itself (it must stay block-aligned on disk).
    pub fn grow_data_blocks(&self, new_count: u64) {
        let mut state = self.state.lock();
        debug_assert!(new_count >= state.data_block_count);
        state.data_block_count = new_count;
        let len = AllocState::reserved_bitmap_len(new_count);
        if len > state.reserved_blocks.len() {
            state.reserved_blocks.resize(len, 0);
        }
    }

    /// Adopt a larger node table after volume growth.
    pub fn grow_inode_count(&self, new_count: u64) {
        let mut state = self.state.lock();
        debug_assert!(new_count >= state.inode_count);
        state.inode_count = new_count;
    }

    /// Forget all outstanding reservations (journal replay reload path).
    pub fn reset_reservations(&self) {
        let mut state = self.state.lock();
        state.reserved_blocks.fill(0);
        state.reserved_nodes.clear();
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "Allocator(data_blocks={}, inodes={})",
            state.data_block_count, state.inode_count
        )
    }
}

/// Build an allocator sized for `data_block_count`/`inode_count` with
/// zeroed images (format and tests).
#[must_use]
pub fn empty_allocator(data_block_count: u64, inode_count: u64) -> Allocator {
    let bitmap_bytes =
        sealfs_types::round_up(data_block_count.div_ceil(8), u64::from(sealfs_types::BLOCK_SIZE));
    let block_map = BlockBuffer::new(bitmap_bytes as usize);
    let node_map = BlockBuffer::new(inode_count as usize * NODE_SIZE);
    Allocator::new(block_map, node_map, data_block_count, inode_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealfs_merkle::merkle_root;
    use sealfs_ondisk::Inode;

    #[test]
    fn bitmap_primitives() {
        let mut map = vec![0_u8; 4];
        assert!(!bitmap_get(&map, 9));
        bitmap_set(&mut map, 9);
        assert!(bitmap_get(&map, 9));
        assert_eq!(bitmap_count_ones(&map, 32), 1);
        bitmap_clear(&mut map, 9);
        assert!(!bitmap_get(&map, 9));
        assert_eq!(bitmap_count_ones(&map, 32), 0);
        // Out-of-range reads are false, writes are ignored.
        assert!(!bitmap_get(&map, 1000));
        bitmap_set(&mut map, 1000);
        assert_eq!(bitmap_count_ones(&map, 32), 0);
    }

    #[test]
    fn reserve_is_first_fit_from_zero() {
        let alloc = empty_allocator(256, 128);
        let first = alloc.reserve_blocks(10).expect("reserve");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].extent(), Extent::new(0, 10));

        // A second writer cannot see the reserved blocks.
        let second = alloc.reserve_blocks(10).expect("reserve");
        assert_eq!(second[0].extent(), Extent::new(10, 10));
    }

    #[test]
    fn dropping_a_reservation_releases_it() {
        let alloc = empty_allocator(64, 128);
        {
            let _claim = alloc.reserve_blocks(64).expect("reserve");
            assert!(matches!(
                alloc.reserve_blocks(1),
                Err(SealError::NoSpace)
            ));
        }
        let again = alloc.reserve_blocks(64).expect("released");
        assert_eq!(again[0].extent(), Extent::new(0, 64));
    }

    #[test]
    fn failed_reservation_reserves_nothing() {
        let alloc = empty_allocator(32, 128);
        assert!(matches!(
            alloc.reserve_blocks(33),
            Err(SealError::NoSpace)
        ));
        assert_eq!(alloc.free_block_count(), 32);
    }

    #[test]
    fn fragmentation_yields_multiple_extents() {
        let alloc = empty_allocator(64, 128);
        let mut hold = alloc.reserve_blocks(48).expect("reserve");
        // Commit blocks 8..16 to punch a hole pattern: free 0..8 after
        // shrinking the committed claim's neighbors.
        for extent in &mut hold {
            alloc.mark_blocks_allocated(extent);
        }
        alloc.free_blocks(Extent::new(0, 8));
        alloc.free_blocks(Extent::new(24, 8));

        let claim = alloc.reserve_blocks(16).expect("reserve");
        let extents: Vec<Extent> = claim.iter().map(ReservedExtent::extent).collect();
        assert_eq!(extents, vec![Extent::new(0, 8), Extent::new(24, 8)]);
    }

    #[test]
    fn commit_updates_disk_bitmap() {
        let alloc = empty_allocator(128, 128);
        let mut claim = alloc.reserve_blocks(5).expect("reserve");
        assert_eq!(alloc.allocated_block_count(), 0);
        alloc.mark_blocks_allocated(&mut claim[0]);
        assert_eq!(alloc.allocated_block_count(), 5);
        assert!(alloc.check_blocks_allocated(0, 5));
        assert!(!alloc.check_blocks_allocated(0, 6));
        drop(claim);
        // Commit survives the drop.
        assert_eq!(alloc.allocated_block_count(), 5);

        alloc.free_blocks(Extent::new(0, 5));
        assert_eq!(alloc.allocated_block_count(), 0);
    }

    #[test]
    fn shrink_releases_the_tail() {
        let alloc = empty_allocator(64, 128);
        let mut claim = alloc.reserve_blocks(20).expect("reserve");
        claim[0].shrink_to(4);
        assert_eq!(claim[0].extent(), Extent::new(0, 4));
        // Blocks 4..20 are claimable again.
        let next = alloc.reserve_blocks(16).expect("reserve");
        assert_eq!(next[0].extent(), Extent::new(4, 16));
    }

    #[test]
    fn node_reservation_and_commit() {
        let alloc = empty_allocator(64, 16);
        let mut nodes = alloc.reserve_nodes(3).expect("reserve");
        let indices: Vec<u32> = nodes.iter().map(|n| n.index().0).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // Reserved slots are invisible to a second reservation.
        let more = alloc.reserve_nodes(2).expect("reserve");
        assert_eq!(more[0].index().0, 3);

        let digest = merkle_root(b"x");
        alloc
            .set_node(NodeIndex(0), &Node::Inode(Inode::new(digest, 1, 1)))
            .expect("set");
        alloc.mark_node_allocated(&mut nodes[0]);
        drop(nodes);
        drop(more);

        // Slot 0 stays allocated, the rest were released.
        assert_eq!(alloc.allocated_node_count(), 1);
        let reclaimed = alloc.reserve_nodes(15).expect("reserve all free");
        assert!(reclaimed.iter().all(|n| n.index().0 != 0));
    }

    #[test]
    fn reserve_more_nodes_than_exist_fails() {
        let alloc = empty_allocator(8, 4);
        assert!(matches!(
            alloc.reserve_nodes(5),
            Err(SealError::NoSpace)
        ));
        assert_eq!(alloc.reserve_nodes(4).expect("fits").len(), 4);
    }

    #[test]
    fn long_runs_split_at_extent_length_cap() {
        let blocks = u64::from(MAX_EXTENT_LENGTH) + 10;
        let alloc = empty_allocator(blocks, 128);
        let claim = alloc.reserve_blocks(blocks).expect("reserve");
        assert_eq!(claim.len(), 2);
        assert_eq!(claim[0].extent().length(), MAX_EXTENT_LENGTH);
        assert_eq!(claim[1].extent().length(), 10);
        assert_eq!(claim[1].extent().start(), u32::from(MAX_EXTENT_LENGTH));
    }

    #[test]
    fn grow_extends_capacity() {
        let alloc = empty_allocator(16, 128);
        assert!(alloc.reserve_blocks(17).is_err());
        alloc.block_map().grow(8192);
        alloc.grow_data_blocks(32);
        let claim = alloc.reserve_blocks(17).expect("fits after growth");
        assert_eq!(claim[0].extent().length(), 17);
    }
}
