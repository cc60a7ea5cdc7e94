//! Format (mkfs).
//!
//! Writes a fresh, empty filesystem onto a device: computed layout,
//! zeroed bitmap and node table, an empty journal, and a clean
//! superblock at block 0.

use sealfs_block::ByteDevice;
use sealfs_error::Result;
use sealfs_ondisk::{plain_layout, sliced_layout, Superblock};
use sealfs_types::{BLOCK_SIZE, NODES_PER_BLOCK};
use serde::{Deserialize, Serialize};
use tracing::info;

const BS: usize = BLOCK_SIZE as usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Node-table capacity; must be a multiple of the nodes per block.
    pub inode_count: u64,
    /// Journal region size in blocks, info block included.
    pub journal_blocks: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            inode_count: 32 * NODES_PER_BLOCK,
            journal_blocks: 64,
        }
    }
}

fn write_zero_blocks(device: &dyn ByteDevice, start_block: u64, count: u64) -> Result<()> {
    const CHUNK_BLOCKS: u64 = 64;
    let zeros = vec![0_u8; (CHUNK_BLOCKS as usize) * BS];
    let mut block = start_block;
    let mut remaining = count;
    while remaining > 0 {
        let take = remaining.min(CHUNK_BLOCKS);
        device.write_all_at(block * BS as u64, &zeros[..take as usize * BS])?;
        block += take;
        remaining -= take;
    }
    Ok(())
}

fn write_fresh(device: &dyn ByteDevice, superblock: &Superblock) -> Result<()> {
    write_zero_blocks(
        device,
        superblock.block_map_start_block(),
        superblock.block_map_blocks(),
    )?;
    write_zero_blocks(
        device,
        superblock.node_map_start_block(),
        superblock.node_map_blocks(),
    )?;
    sealfs_journal::format_region(device, superblock.journal_start_block())?;
    device.write_all_at(0, &superblock.serialize())?;
    device.sync()?;
    info!(
        target: "sealfs::format",
        data_blocks = superblock.data_block_count,
        inodes = superblock.inode_count,
        "formatted"
    );
    Ok(())
}

/// Format a plain (non-sliced) container filling the whole device.
pub fn format(device: &dyn ByteDevice, options: &FormatOptions) -> Result<Superblock> {
    let device_blocks = device.len_bytes() / BS as u64;
    let superblock = plain_layout(device_blocks, options.inode_count, options.journal_blocks)?;
    write_fresh(device, &superblock)?;
    Ok(superblock)
}

/// Format a sliced container with one slice per region. The device must
/// span the fixed region windows.
pub fn format_sliced(device: &dyn ByteDevice, slice_size: u64) -> Result<Superblock> {
    let superblock = sliced_layout(slice_size)?;
    superblock.check(device.len_bytes() / BS as u64)?;
    let device_blocks = device.len_bytes() / BS as u64;
    if superblock.total_blocks() > device_blocks {
        return Err(sealfs_types::ParseError::InvalidField {
            field: "device_blocks",
            reason: "device does not span the sliced region windows",
        }
        .into());
    }
    write_fresh(device, &superblock)?;
    Ok(superblock)
}
