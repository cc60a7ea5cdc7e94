//! Node populator.
//!
//! Takes the extents and nodes a writer reserved and materializes the
//! committed inode chain: extents are assigned to the primary inode first,
//! overflowing into containers linked through `next`. The caller observes
//! every used node and extent through callbacks so it can persist the
//! affected metadata blocks; `on_extent` may stop the walk early after
//! splitting the final reservation, and unused reservations are released
//! when the populator is consumed.

use crate::{Allocator, ReservedExtent, ReservedNode};
use sealfs_error::{Result, SealError};
use sealfs_ondisk::{ExtentContainer, Inode, Node};
use sealfs_types::{NodeIndex, CONTAINER_EXTENTS, INODE_INLINE_EXTENTS};

/// Flow control for the `on_extent` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationCommand {
    Continue,
    Stop,
}

enum Slot {
    Primary(Inode),
    Container(ExtentContainer),
}

impl Slot {
    fn is_full(&self) -> bool {
        match self {
            Self::Primary(inode) => usize::from(inode.extent_count) >= INODE_INLINE_EXTENTS,
            Self::Container(container) => {
                usize::from(container.extent_count) >= CONTAINER_EXTENTS
            }
        }
    }

    fn push(&mut self, extent: sealfs_types::Extent) {
        match self {
            Self::Primary(inode) => {
                debug_assert_eq!(inode.extent_count, 0);
                inode.inline_extent = extent;
                inode.extent_count = 1;
            }
            Self::Container(container) => {
                let slot = usize::from(container.extent_count);
                container.extents[slot] = extent;
                container.extent_count += 1;
            }
        }
    }

    fn set_next(&mut self, next: u32) {
        match self {
            Self::Primary(inode) => inode.next = next,
            Self::Container(container) => container.next = next,
        }
    }

    fn into_node(self) -> Node {
        match self {
            Self::Primary(inode) => Node::Inode(inode),
            Self::Container(container) => Node::Container(container),
        }
    }
}

/// Assigns reserved extents into reserved nodes.
pub struct NodePopulator {
    extents: Vec<ReservedExtent>,
    nodes: Vec<ReservedNode>,
}

impl NodePopulator {
    #[must_use]
    pub fn new(extents: Vec<ReservedExtent>, nodes: Vec<ReservedNode>) -> Self {
        Self { extents, nodes }
    }

    /// Minimum nodes required to hold `extent_count` extents.
    #[must_use]
    pub fn node_count_for_extents(extent_count: usize) -> usize {
        1 + extent_count
            .saturating_sub(INODE_INLINE_EXTENTS)
            .div_ceil(CONTAINER_EXTENTS)
    }

    /// Materialize the chain.
    ///
    /// The primary inode record must already be written at the first
    /// reserved node; `walk` preserves its identity fields and fills in the
    /// extent fields and links. `on_extent` runs before its extent is
    /// placed (it may shrink the reservation and return `Stop`); `on_node`
    /// runs after each used node is written and committed.
    pub fn walk(
        self,
        allocator: &Allocator,
        mut on_node: impl FnMut(&ReservedNode) -> Result<()>,
        mut on_extent: impl FnMut(&mut ReservedExtent) -> Result<IterationCommand>,
    ) -> Result<()> {
        let Self { extents, mut nodes } = self;
        if nodes.is_empty() {
            return Err(SealError::InvalidArgs);
        }

        let primary_index = nodes[0].index();
        let Node::Inode(mut inode) = allocator.node(primary_index)? else {
            return Err(SealError::BadState);
        };
        inode.next = 0;
        inode.extent_count = 0;

        let mut current = Slot::Primary(inode);
        let mut current_index = primary_index;
        let mut used_nodes = 1_usize;

        for mut reserved in extents {
            let command = on_extent(&mut reserved)?;

            if current.is_full() {
                let Some(next_node) = nodes.get_mut(used_nodes) else {
                    // The caller reserved fewer nodes than
                    // `node_count_for_extents` demands.
                    return Err(SealError::BadState);
                };
                let next_index = next_node.index();
                current.set_next(next_index.0);
                allocator.set_node(current_index, &current.into_node())?;
                allocator.mark_node_allocated(&mut nodes[used_nodes - 1]);
                on_node(&nodes[used_nodes - 1])?;

                current = Slot::Container(ExtentContainer::new(current_index.0));
                current_index = next_index;
                used_nodes += 1;
            }

            current.push(reserved.extent());
            if command == IterationCommand::Stop {
                break;
            }
        }

        allocator.set_node(current_index, &current.into_node())?;
        allocator.mark_node_allocated(&mut nodes[used_nodes - 1]);
        on_node(&nodes[used_nodes - 1])?;

        // Remaining reserved nodes drop here and release their claims.
        Ok(())
    }
}
