//! Extent and block iterators.
//!
//! An extent iterator yields a blob's extents in disk order; the block
//! iterator flattens those extents into contiguous runs of blocks and
//! tracks the cumulative block index, which is also the blob buffer's
//! block offset for that run.

use crate::{Allocator, ReservedExtent};
use sealfs_error::{Result, SealError};
use sealfs_ondisk::Node;
use sealfs_types::{Extent, NodeIndex};

/// Yields the extents of one blob in disk order.
pub trait ExtentIterator {
    fn next_extent(&mut self) -> Result<Option<Extent>>;
}

/// Iterator over an explicit reservation list, used while writing a blob
/// whose chain is not yet on disk.
pub struct VectorExtentIterator<'a> {
    extents: &'a [ReservedExtent],
    index: usize,
}

impl<'a> VectorExtentIterator<'a> {
    #[must_use]
    pub fn new(extents: &'a [ReservedExtent]) -> Self {
        Self { extents, index: 0 }
    }
}

impl ExtentIterator for VectorExtentIterator<'_> {
    fn next_extent(&mut self) -> Result<Option<Extent>> {
        let Some(reserved) = self.extents.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;
        Ok(Some(reserved.extent()))
    }
}

enum ChainNode {
    Primary(sealfs_ondisk::Inode),
    Container(sealfs_ondisk::ExtentContainer),
}

/// Iterator over the committed extent chain of a primary inode: the inline
/// extent first, then each extent container in `next` order.
pub struct AllocatedExtentIterator<'a> {
    allocator: &'a Allocator,
    node_index: NodeIndex,
    node: ChainNode,
    slot: usize,
    extent_index: usize,
    done: bool,
}

impl<'a> AllocatedExtentIterator<'a> {
    /// Start at `node_index`, which must be an allocated primary inode.
    pub fn new(allocator: &'a Allocator, node_index: NodeIndex) -> Result<Self> {
        match allocator.node(node_index)? {
            Node::Inode(inode) => Ok(Self {
                allocator,
                node_index,
                node: ChainNode::Primary(inode),
                slot: 0,
                extent_index: 0,
                done: false,
            }),
            Node::Free | Node::Container(_) => Err(SealError::BadState),
        }
    }

    /// Index of the node currently being read.
    #[must_use]
    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    /// Absolute index of the next extent to be yielded.
    #[must_use]
    pub fn extent_index(&self) -> usize {
        self.extent_index
    }

    fn advance_node(&mut self) -> Result<bool> {
        let next = match &self.node {
            ChainNode::Primary(inode) => inode.next,
            ChainNode::Container(container) => container.next,
        };
        if next == 0 {
            self.done = true;
            return Ok(false);
        }
        let container = match self.allocator.node(NodeIndex(next))? {
            Node::Container(container) => container,
            // A chain that leads to a free node or another primary inode
            // is corrupt.
            Node::Free | Node::Inode(_) => return Err(SealError::IntegrityError),
        };
        if container.previous != self.node_index.0 {
            return Err(SealError::IntegrityError);
        }
        self.node_index = NodeIndex(next);
        self.node = ChainNode::Container(container);
        self.slot = 0;
        Ok(true)
    }
}

impl ExtentIterator for AllocatedExtentIterator<'_> {
    fn next_extent(&mut self) -> Result<Option<Extent>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let extent = match &self.node {
                ChainNode::Primary(inode) => {
                    (self.slot < usize::from(inode.extent_count)).then(|| inode.inline_extent)
                }
                ChainNode::Container(container) => (self.slot
                    < usize::from(container.extent_count))
                .then(|| container.extents[self.slot]),
            };
            match extent {
                Some(extent) => {
                    self.slot += 1;
                    self.extent_index += 1;
                    return Ok(Some(extent));
                }
                None => {
                    if !self.advance_node()? {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Flattens an extent iterator into contiguous block runs.
pub struct BlockIterator<I> {
    iter: I,
    current: Option<(Extent, u16)>,
    block_index: u64,
}

impl<I: ExtentIterator> BlockIterator<I> {
    #[must_use]
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            current: None,
            block_index: 0,
        }
    }

    /// Blob-relative index of the next block to be yielded.
    #[must_use]
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    /// The next run of up to `max` contiguous blocks:
    /// `(blob_block, data_relative_block, length)`. `None` when the chain
    /// is exhausted.
    pub fn next_run(&mut self, max: u64) -> Result<Option<(u64, u64, u32)>> {
        if max == 0 {
            return Ok(None);
        }
        loop {
            if self.current.is_none() {
                match self.iter.next_extent()? {
                    Some(extent) if extent.is_empty() => continue,
                    Some(extent) => self.current = Some((extent, 0)),
                    None => return Ok(None),
                }
            }
            let (extent, used) = self.current.take().expect("current set above");
            let available = extent.length() - used;
            let take = u64::from(available).min(max) as u32;
            let run = (
                self.block_index,
                u64::from(extent.start()) + u64::from(used),
                take,
            );
            let now_used = used + take as u16;
            if now_used < extent.length() {
                self.current = Some((extent, now_used));
            }
            self.block_index += u64::from(take);
            return Ok(Some(run));
        }
    }
}

/// Invoke `emit(blob_block, data_relative_block, length)` for each run
/// covering the next `count` blocks. Runs split at extent boundaries.
/// Running out of extents before `count` blocks is an `OutOfRange` error.
pub fn stream_blocks<I: ExtentIterator>(
    iter: &mut BlockIterator<I>,
    count: u64,
    mut emit: impl FnMut(u64, u64, u32) -> Result<()>,
) -> Result<()> {
    let mut remaining = count;
    while remaining > 0 {
        let Some((blob_block, dev_block, length)) = iter.next_run(remaining)? else {
            return Err(SealError::OutOfRange);
        };
        emit(blob_block, dev_block, length)?;
        remaining -= u64::from(length);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::empty_allocator;
    use sealfs_merkle::merkle_root;
    use sealfs_ondisk::{ExtentContainer, Inode};

    fn chain_allocator() -> Allocator {
        // Inode 2 with inline extent [0+4], container 5 with [10+2] [20+1],
        // container 7 with [30+3].
        let alloc = empty_allocator(64, 16);
        let mut inode = Inode::new(merkle_root(b"chain"), 0, 10);
        inode.extent_count = 1;
        inode.inline_extent = Extent::new(0, 4);
        inode.next = 5;
        alloc.set_node(NodeIndex(2), &Node::Inode(inode)).expect("set");

        let mut c5 = ExtentContainer::new(2);
        c5.extent_count = 2;
        c5.extents[0] = Extent::new(10, 2);
        c5.extents[1] = Extent::new(20, 1);
        c5.next = 7;
        alloc.set_node(NodeIndex(5), &Node::Container(c5)).expect("set");

        let mut c7 = ExtentContainer::new(5);
        c7.extent_count = 1;
        c7.extents[0] = Extent::new(30, 3);
        alloc.set_node(NodeIndex(7), &Node::Container(c7)).expect("set");
        alloc
    }

    #[test]
    fn allocated_iterator_walks_the_chain() {
        let alloc = chain_allocator();
        let mut iter = AllocatedExtentIterator::new(&alloc, NodeIndex(2)).expect("new");
        assert_eq!(iter.node_index(), NodeIndex(2));
        assert_eq!(iter.next_extent().expect("next"), Some(Extent::new(0, 4)));
        assert_eq!(iter.next_extent().expect("next"), Some(Extent::new(10, 2)));
        assert_eq!(iter.node_index(), NodeIndex(5));
        assert_eq!(iter.next_extent().expect("next"), Some(Extent::new(20, 1)));
        assert_eq!(iter.next_extent().expect("next"), Some(Extent::new(30, 3)));
        assert_eq!(iter.node_index(), NodeIndex(7));
        assert_eq!(iter.extent_index(), 4);
        assert_eq!(iter.next_extent().expect("next"), None);
        assert_eq!(iter.next_extent().expect("next"), None);
    }

    #[test]
    fn allocated_iterator_rejects_non_inode_start() {
        let alloc = chain_allocator();
        assert!(matches!(
            AllocatedExtentIterator::new(&alloc, NodeIndex(0)),
            Err(SealError::BadState)
        ));
        assert!(matches!(
            AllocatedExtentIterator::new(&alloc, NodeIndex(5)),
            Err(SealError::BadState)
        ));
    }

    #[test]
    fn broken_chain_is_an_integrity_error() {
        let alloc = chain_allocator();
        // Point the second container's back-link somewhere else.
        let mut c7 = ExtentContainer::new(9);
        c7.extent_count = 1;
        c7.extents[0] = Extent::new(30, 3);
        alloc.set_node(NodeIndex(7), &Node::Container(c7)).expect("set");

        let mut iter = AllocatedExtentIterator::new(&alloc, NodeIndex(2)).expect("new");
        iter.next_extent().expect("inline");
        iter.next_extent().expect("c5[0]");
        iter.next_extent().expect("c5[1]");
        assert!(matches!(
            iter.next_extent(),
            Err(SealError::IntegrityError)
        ));
    }

    #[test]
    fn chain_to_free_node_is_an_integrity_error() {
        let alloc = chain_allocator();
        alloc.free_node(NodeIndex(5)).expect("free");
        let mut iter = AllocatedExtentIterator::new(&alloc, NodeIndex(2)).expect("new");
        iter.next_extent().expect("inline");
        assert!(matches!(
            iter.next_extent(),
            Err(SealError::IntegrityError)
        ));
    }

    #[test]
    fn block_iterator_splits_runs_at_extent_boundaries() {
        let alloc = chain_allocator();
        let iter = AllocatedExtentIterator::new(&alloc, NodeIndex(2)).expect("new");
        let mut blocks = BlockIterator::new(iter);

        let mut runs = Vec::new();
        stream_blocks(&mut blocks, 10, |blob_block, dev_block, length| {
            runs.push((blob_block, dev_block, length));
            Ok(())
        })
        .expect("stream");
        assert_eq!(
            runs,
            vec![(0, 0, 4), (4, 10, 2), (6, 20, 1), (7, 30, 3)]
        );
        assert_eq!(blocks.block_index(), 10);
    }

    #[test]
    fn stream_can_stop_mid_extent() {
        let alloc = chain_allocator();
        let iter = AllocatedExtentIterator::new(&alloc, NodeIndex(2)).expect("new");
        let mut blocks = BlockIterator::new(iter);

        let mut runs = Vec::new();
        stream_blocks(&mut blocks, 5, |blob_block, dev_block, length| {
            runs.push((blob_block, dev_block, length));
            Ok(())
        })
        .expect("stream");
        assert_eq!(runs, vec![(0, 0, 4), (4, 10, 1)]);
        assert_eq!(blocks.block_index(), 5);

        // The next stream resumes inside the split extent.
        let mut tail = Vec::new();
        stream_blocks(&mut blocks, 5, |blob_block, dev_block, length| {
            tail.push((blob_block, dev_block, length));
            Ok(())
        })
        .expect("stream");
        assert_eq!(tail, vec![(5, 11, 1), (6, 20, 1), (7, 30, 3)]);
    }

    #[test]
    fn streaming_past_the_chain_is_out_of_range() {
        let alloc = chain_allocator();
        let iter = AllocatedExtentIterator::new(&alloc, NodeIndex(2)).expect("new");
        let mut blocks = BlockIterator::new(iter);
        assert!(matches!(
            stream_blocks(&mut blocks, 11, |_, _, _| Ok(())),
            Err(SealError::OutOfRange)
        ));
    }

    #[test]
    fn vector_iterator_yields_reservations_in_order() {
        let alloc = empty_allocator(64, 16);
        let claim = alloc.reserve_blocks(10).expect("reserve");
        let mut iter = VectorExtentIterator::new(&claim);
        assert_eq!(iter.next_extent().expect("next"), Some(Extent::new(0, 10)));
        assert_eq!(iter.next_extent().expect("next"), None);
    }
}
