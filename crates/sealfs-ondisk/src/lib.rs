#![forbid(unsafe_code)]
//! On-disk formats.
//!
//! The superblock (block 0), the fixed-size node records that make up the
//! node table, and the region math that derives where each metadata region
//! lives. Two layouts exist: the plain layout packs regions back to back,
//! the sliced layout pins each region to a fixed virtual start so a volume
//! manager can grow them independently.
//!
//! All encodings are little-endian and hand-packed; record sizes are fixed.

use sealfs_merkle::Digest;
use sealfs_types::{
    read_fixed, read_le_u16, read_le_u32, read_le_u64, ParseError, Extent, BLOCK_BITS,
    BLOCK_SIZE, CONTAINER_EXTENTS, FLAG_CLEAN, FLAG_SLICED, FORMAT_VERSION, NODES_PER_BLOCK,
    NODE_SIZE, SUPERBLOCK_MAGIC,
};

/// Serialized superblock header length in bytes (the rest of block 0 is
/// reserved and zero).
pub const SUPERBLOCK_LEN: usize = 88;

/// Sliced layout: fixed virtual start blocks for each region.
pub const SLICE_BLOCK_MAP_START: u64 = 0x400;
pub const SLICE_NODE_MAP_START: u64 = 0x800;
pub const SLICE_JOURNAL_START: u64 = 0xC00;
pub const SLICE_DATA_START: u64 = 0x1000;

/// Minimum journal region size: one info block plus room for an entry.
pub const MIN_JOURNAL_BLOCKS: u64 = 4;

/// Node header flag bits.
pub const NODE_FLAG_ALLOCATED: u32 = 0x0000_0001;
pub const NODE_FLAG_CONTAINER: u32 = 0x0000_0002;
pub const NODE_FLAG_COMPRESSED: u32 = 0x0000_0004;

/// In-memory image of block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub flags: u32,
    pub slice_size: u64,
    pub inode_count: u64,
    pub data_block_count: u64,
    pub alloc_inode_count: u64,
    pub alloc_block_count: u64,
    pub journal_block_count: u64,
    pub abm_slices: u32,
    pub ino_slices: u32,
    pub journal_slices: u32,
    pub dat_slices: u32,
    pub vslice_count: u32,
}

impl Superblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(block, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }
        let version = read_le_u32(block, 8)?;
        if version != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format revision",
            });
        }
        let block_size = read_le_u32(block, 16)?;
        if block_size != BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "mismatched block size",
            });
        }

        Ok(Self {
            flags: read_le_u32(block, 12)?,
            slice_size: read_le_u64(block, 20)?,
            inode_count: read_le_u64(block, 28)?,
            data_block_count: read_le_u64(block, 36)?,
            alloc_inode_count: read_le_u64(block, 44)?,
            alloc_block_count: read_le_u64(block, 52)?,
            journal_block_count: read_le_u64(block, 60)?,
            abm_slices: read_le_u32(block, 68)?,
            ino_slices: read_le_u32(block, 72)?,
            journal_slices: read_le_u32(block, 76)?,
            dat_slices: read_le_u32(block, 80)?,
            vslice_count: read_le_u32(block, 84)?,
        })
    }

    /// Serialize into a full, zero-padded block image.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        block[0..8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        block[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        block[12..16].copy_from_slice(&self.flags.to_le_bytes());
        block[16..20].copy_from_slice(&BLOCK_SIZE.to_le_bytes());
        block[20..28].copy_from_slice(&self.slice_size.to_le_bytes());
        block[28..36].copy_from_slice(&self.inode_count.to_le_bytes());
        block[36..44].copy_from_slice(&self.data_block_count.to_le_bytes());
        block[44..52].copy_from_slice(&self.alloc_inode_count.to_le_bytes());
        block[52..60].copy_from_slice(&self.alloc_block_count.to_le_bytes());
        block[60..68].copy_from_slice(&self.journal_block_count.to_le_bytes());
        block[68..72].copy_from_slice(&self.abm_slices.to_le_bytes());
        block[72..76].copy_from_slice(&self.ino_slices.to_le_bytes());
        block[76..80].copy_from_slice(&self.journal_slices.to_le_bytes());
        block[80..84].copy_from_slice(&self.dat_slices.to_le_bytes());
        block[84..88].copy_from_slice(&self.vslice_count.to_le_bytes());
        block
    }

    #[must_use]
    pub fn is_sliced(&self) -> bool {
        self.flags & FLAG_SLICED != 0
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.flags & FLAG_CLEAN != 0
    }

    pub fn set_clean(&mut self, clean: bool) {
        if clean {
            self.flags |= FLAG_CLEAN;
        } else {
            self.flags &= !FLAG_CLEAN;
        }
    }

    #[must_use]
    pub fn blocks_per_slice(&self) -> u64 {
        self.slice_size / u64::from(BLOCK_SIZE)
    }

    /// Blocks occupied by the allocation bitmap.
    #[must_use]
    pub fn block_map_blocks(&self) -> u64 {
        self.data_block_count.div_ceil(BLOCK_BITS)
    }

    /// Blocks occupied by the node table.
    #[must_use]
    pub fn node_map_blocks(&self) -> u64 {
        self.inode_count.div_ceil(NODES_PER_BLOCK)
    }

    #[must_use]
    pub fn journal_start_block(&self) -> u64 {
        if self.is_sliced() {
            SLICE_JOURNAL_START
        } else {
            1
        }
    }

    #[must_use]
    pub fn block_map_start_block(&self) -> u64 {
        if self.is_sliced() {
            SLICE_BLOCK_MAP_START
        } else {
            1 + self.journal_block_count
        }
    }

    #[must_use]
    pub fn node_map_start_block(&self) -> u64 {
        if self.is_sliced() {
            SLICE_NODE_MAP_START
        } else {
            self.block_map_start_block() + self.block_map_blocks()
        }
    }

    #[must_use]
    pub fn data_start_block(&self) -> u64 {
        if self.is_sliced() {
            SLICE_DATA_START
        } else {
            self.node_map_start_block() + self.node_map_blocks()
        }
    }

    /// Total blocks the filesystem addresses, including metadata.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.data_start_block() + self.data_block_count
    }

    /// Validate geometry against the device size.
    pub fn check(&self, device_blocks: u64) -> Result<(), ParseError> {
        if self.journal_block_count < MIN_JOURNAL_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "journal_block_count",
                reason: "journal region too small",
            });
        }
        if self.alloc_block_count > self.data_block_count {
            return Err(ParseError::InvalidField {
                field: "alloc_block_count",
                reason: "exceeds data_block_count",
            });
        }
        if self.alloc_inode_count > self.inode_count {
            return Err(ParseError::InvalidField {
                field: "alloc_inode_count",
                reason: "exceeds inode_count",
            });
        }

        if self.is_sliced() {
            if self.slice_size == 0 || self.slice_size % u64::from(BLOCK_SIZE) != 0 {
                return Err(ParseError::InvalidField {
                    field: "slice_size",
                    reason: "must be a non-zero multiple of the block size",
                });
            }
            let bps = self.blocks_per_slice();
            let fits = |slices: u32, need: u64, cap: u64| -> bool {
                let have = u64::from(slices) * bps;
                have >= need && have <= cap
            };
            if !fits(
                self.abm_slices,
                self.block_map_blocks(),
                SLICE_NODE_MAP_START - SLICE_BLOCK_MAP_START,
            ) {
                return Err(ParseError::InvalidField {
                    field: "abm_slices",
                    reason: "bitmap slices do not cover the bitmap",
                });
            }
            if !fits(
                self.ino_slices,
                self.node_map_blocks(),
                SLICE_JOURNAL_START - SLICE_NODE_MAP_START,
            ) {
                return Err(ParseError::InvalidField {
                    field: "ino_slices",
                    reason: "node slices do not cover the node table",
                });
            }
            if !fits(
                self.journal_slices,
                self.journal_block_count,
                SLICE_DATA_START - SLICE_JOURNAL_START,
            ) {
                return Err(ParseError::InvalidField {
                    field: "journal_slices",
                    reason: "journal slices do not cover the journal",
                });
            }
            if u64::from(self.dat_slices) * bps < self.data_block_count {
                return Err(ParseError::InvalidField {
                    field: "dat_slices",
                    reason: "data slices do not cover the data region",
                });
            }
        } else if self.total_blocks() > device_blocks {
            return Err(ParseError::InvalidField {
                field: "data_block_count",
                reason: "filesystem larger than device",
            });
        }
        Ok(())
    }
}

/// Compute a plain-layout superblock for a device of `device_blocks`.
///
/// Fits the largest data region the device can carry after the fixed
/// metadata regions and the bitmap needed to describe that data.
pub fn plain_layout(
    device_blocks: u64,
    inode_count: u64,
    journal_blocks: u64,
) -> Result<Superblock, ParseError> {
    if inode_count == 0 || inode_count % NODES_PER_BLOCK != 0 {
        return Err(ParseError::InvalidField {
            field: "inode_count",
            reason: "must be a non-zero multiple of the nodes per block",
        });
    }
    if journal_blocks < MIN_JOURNAL_BLOCKS {
        return Err(ParseError::InvalidField {
            field: "journal_blocks",
            reason: "journal region too small",
        });
    }

    let node_map_blocks = inode_count / NODES_PER_BLOCK;
    let fixed = 1 + journal_blocks + node_map_blocks;
    let available = device_blocks
        .checked_sub(fixed + 1)
        .ok_or(ParseError::InvalidField {
            field: "device_blocks",
            reason: "device too small for metadata",
        })?;

    // One bitmap block per BLOCK_BITS data blocks; shrink data until the
    // pair fits.
    let mut data_block_count = available;
    while data_block_count > 0
        && data_block_count + data_block_count.div_ceil(BLOCK_BITS) > available + 1
    {
        data_block_count -= 1;
    }
    if data_block_count == 0 {
        return Err(ParseError::InvalidField {
            field: "device_blocks",
            reason: "no room for data blocks",
        });
    }

    Ok(Superblock {
        flags: FLAG_CLEAN,
        slice_size: 0,
        inode_count,
        data_block_count,
        alloc_inode_count: 0,
        alloc_block_count: 0,
        journal_block_count: journal_blocks,
        abm_slices: 0,
        ino_slices: 0,
        journal_slices: 0,
        dat_slices: 0,
        vslice_count: 0,
    })
}

/// Compute a sliced-layout superblock with one slice per region.
pub fn sliced_layout(slice_size: u64) -> Result<Superblock, ParseError> {
    if slice_size == 0 || slice_size % u64::from(BLOCK_SIZE) != 0 {
        return Err(ParseError::InvalidField {
            field: "slice_size",
            reason: "must be a non-zero multiple of the block size",
        });
    }
    let bps = slice_size / u64::from(BLOCK_SIZE);
    if bps < MIN_JOURNAL_BLOCKS || bps > SLICE_NODE_MAP_START - SLICE_BLOCK_MAP_START {
        return Err(ParseError::InvalidField {
            field: "slice_size",
            reason: "slice does not fit the region windows",
        });
    }

    let sb = Superblock {
        flags: FLAG_SLICED | FLAG_CLEAN,
        slice_size,
        inode_count: bps * NODES_PER_BLOCK,
        data_block_count: bps,
        alloc_inode_count: 0,
        alloc_block_count: 0,
        journal_block_count: bps,
        abm_slices: 1,
        ino_slices: 1,
        journal_slices: 1,
        dat_slices: 1,
        vslice_count: 5,
    };
    Ok(sb)
}

/// A decoded node-table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Free,
    Inode(Inode),
    Container(ExtentContainer),
}

/// Primary record of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Node index of the first extent container, 0 for none.
    pub next: u32,
    pub compressed: bool,
    pub digest: Digest,
    pub blob_size: u64,
    pub block_count: u32,
    /// Extents stored in this record (0 or 1).
    pub extent_count: u16,
    pub inline_extent: Extent,
}

impl Inode {
    /// Fresh inode for a blob of `blob_size` named `digest`; the extent
    /// fields are filled in by the node populator.
    #[must_use]
    pub fn new(digest: Digest, blob_size: u64, block_count: u32) -> Self {
        Self {
            next: 0,
            compressed: false,
            digest,
            blob_size,
            block_count,
            extent_count: 0,
            inline_extent: Extent::new(0, 0),
        }
    }
}

/// Continuation record carrying extra extents for one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentContainer {
    pub next: u32,
    /// Node index of the record this container chains from.
    pub previous: u32,
    pub extent_count: u16,
    pub extents: [Extent; CONTAINER_EXTENTS],
}

impl ExtentContainer {
    #[must_use]
    pub fn new(previous: u32) -> Self {
        Self {
            next: 0,
            previous,
            extent_count: 0,
            extents: [Extent::new(0, 0); CONTAINER_EXTENTS],
        }
    }
}

fn parse_extent(slot: &[u8], offset: usize) -> Result<Extent, ParseError> {
    let start = read_le_u32(slot, offset)?;
    let length = read_le_u16(slot, offset + 4)?;
    Ok(Extent::new(start, length))
}

fn write_extent(slot: &mut [u8], offset: usize, extent: Extent) {
    slot[offset..offset + 4].copy_from_slice(&extent.start().to_le_bytes());
    slot[offset + 4..offset + 6].copy_from_slice(&extent.length().to_le_bytes());
    slot[offset + 6..offset + 8].fill(0);
}

impl Node {
    /// Decode one `NODE_SIZE` slot.
    pub fn parse(slot: &[u8]) -> Result<Self, ParseError> {
        let flags = read_le_u32(slot, 0)?;
        if flags & NODE_FLAG_ALLOCATED == 0 {
            return Ok(Self::Free);
        }

        if flags & NODE_FLAG_CONTAINER != 0 {
            let extent_count = read_le_u16(slot, 12)?;
            if usize::from(extent_count) > CONTAINER_EXTENTS {
                return Err(ParseError::InvalidField {
                    field: "extent_count",
                    reason: "container extent count out of range",
                });
            }
            let mut extents = [Extent::new(0, 0); CONTAINER_EXTENTS];
            for (i, extent) in extents.iter_mut().enumerate() {
                *extent = parse_extent(slot, 16 + i * 8)?;
            }
            Ok(Self::Container(ExtentContainer {
                next: read_le_u32(slot, 4)?,
                previous: read_le_u32(slot, 8)?,
                extent_count,
                extents,
            }))
        } else {
            let extent_count = read_le_u16(slot, 52)?;
            if extent_count > 1 {
                return Err(ParseError::InvalidField {
                    field: "extent_count",
                    reason: "inode extent count out of range",
                });
            }
            Ok(Self::Inode(Inode {
                next: read_le_u32(slot, 4)?,
                compressed: flags & NODE_FLAG_COMPRESSED != 0,
                digest: Digest::new(read_fixed::<32>(slot, 8)?),
                blob_size: read_le_u64(slot, 40)?,
                block_count: read_le_u32(slot, 48)?,
                extent_count,
                inline_extent: parse_extent(slot, 56)?,
            }))
        }
    }

    /// Encode into one `NODE_SIZE` slot.
    pub fn serialize(&self, slot: &mut [u8]) {
        debug_assert!(slot.len() >= NODE_SIZE);
        slot[..NODE_SIZE].fill(0);
        match self {
            Self::Free => {}
            Self::Inode(inode) => {
                let mut flags = NODE_FLAG_ALLOCATED;
                if inode.compressed {
                    flags |= NODE_FLAG_COMPRESSED;
                }
                slot[0..4].copy_from_slice(&flags.to_le_bytes());
                slot[4..8].copy_from_slice(&inode.next.to_le_bytes());
                slot[8..40].copy_from_slice(inode.digest.as_bytes());
                slot[40..48].copy_from_slice(&inode.blob_size.to_le_bytes());
                slot[48..52].copy_from_slice(&inode.block_count.to_le_bytes());
                slot[52..54].copy_from_slice(&inode.extent_count.to_le_bytes());
                write_extent(slot, 56, inode.inline_extent);
            }
            Self::Container(container) => {
                let flags = NODE_FLAG_ALLOCATED | NODE_FLAG_CONTAINER;
                slot[0..4].copy_from_slice(&flags.to_le_bytes());
                slot[4..8].copy_from_slice(&container.next.to_le_bytes());
                slot[8..12].copy_from_slice(&container.previous.to_le_bytes());
                slot[12..14].copy_from_slice(&container.extent_count.to_le_bytes());
                for (i, extent) in container.extents.iter().enumerate() {
                    write_extent(slot, 16 + i * 8, *extent);
                }
            }
        }
    }
}

/// Decode the node at `index` from a node-table image.
pub fn node_at(image: &[u8], index: u32) -> Result<Node, ParseError> {
    let offset = index as usize * NODE_SIZE;
    let slot = sealfs_types::ensure_slice(image, offset, NODE_SIZE)?;
    Node::parse(slot)
}

/// Encode `node` at `index` into a node-table image.
pub fn write_node(image: &mut [u8], index: u32, node: &Node) -> Result<(), ParseError> {
    let offset = index as usize * NODE_SIZE;
    if offset + NODE_SIZE > image.len() {
        return Err(ParseError::InsufficientData {
            needed: NODE_SIZE,
            offset,
            actual: image.len().saturating_sub(offset),
        });
    }
    node.serialize(&mut image[offset..offset + NODE_SIZE]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealfs_merkle::merkle_root;

    fn sample_superblock() -> Superblock {
        plain_layout(2048, 4096, 16).expect("layout")
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let image = sb.serialize();
        assert_eq!(image.len(), BLOCK_SIZE as usize);
        let parsed = Superblock::parse(&image).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut image = sample_superblock().serialize();
        image[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&image),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_bad_version() {
        let mut image = sample_superblock().serialize();
        image[8] = 0xEE;
        assert!(Superblock::parse(&image).is_err());
    }

    #[test]
    fn plain_regions_are_disjoint_and_fit() {
        let sb = sample_superblock();
        assert_eq!(sb.journal_start_block(), 1);
        assert_eq!(sb.block_map_start_block(), 1 + sb.journal_block_count);
        assert_eq!(
            sb.node_map_start_block(),
            sb.block_map_start_block() + sb.block_map_blocks()
        );
        assert_eq!(
            sb.data_start_block(),
            sb.node_map_start_block() + sb.node_map_blocks()
        );
        assert!(sb.total_blocks() <= 2048);
        sb.check(2048).expect("valid");
        // Can't claim more data blocks than the device has room for.
        assert!(sb.check(sb.total_blocks() - 1).is_err());
    }

    #[test]
    fn plain_layout_uses_most_of_the_device() {
        let sb = sample_superblock();
        // Metadata overhead for a 16 MiB image should be a few dozen blocks.
        assert!(sb.data_block_count > 1900, "{}", sb.data_block_count);
    }

    #[test]
    fn sliced_layout_checks() {
        let sb = sliced_layout(1024 * 1024).expect("layout");
        assert!(sb.is_sliced());
        assert_eq!(sb.blocks_per_slice(), 128);
        assert_eq!(sb.data_block_count, 128);
        assert_eq!(sb.journal_start_block(), SLICE_JOURNAL_START);
        assert_eq!(sb.data_start_block(), SLICE_DATA_START);
        sb.check(sb.total_blocks()).expect("valid");
    }

    #[test]
    fn clean_flag_toggles() {
        let mut sb = sample_superblock();
        assert!(sb.is_clean());
        sb.set_clean(false);
        assert!(!sb.is_clean());
        sb.set_clean(true);
        assert!(sb.is_clean());
    }

    #[test]
    fn inode_record_round_trip() {
        let digest = merkle_root(b"node");
        let mut inode = Inode::new(digest, 70_000, 9);
        inode.next = 17;
        inode.compressed = true;
        inode.extent_count = 1;
        inode.inline_extent = Extent::new(55, 9);

        let mut image = vec![0_u8; NODE_SIZE * 4];
        write_node(&mut image, 2, &Node::Inode(inode.clone())).expect("write");
        assert_eq!(node_at(&image, 1).expect("free"), Node::Free);
        let Node::Inode(parsed) = node_at(&image, 2).expect("parse") else {
            panic!("expected inode");
        };
        assert_eq!(parsed, inode);
    }

    #[test]
    fn container_record_round_trip() {
        let mut container = ExtentContainer::new(3);
        container.next = 8;
        container.extent_count = 2;
        container.extents[0] = Extent::new(10, 4);
        container.extents[1] = Extent::new(900, 1);

        let mut image = vec![0_u8; NODE_SIZE];
        write_node(&mut image, 0, &Node::Container(container.clone())).expect("write");
        let Node::Container(parsed) = node_at(&image, 0).expect("parse") else {
            panic!("expected container");
        };
        assert_eq!(parsed, container);
    }

    #[test]
    fn node_index_out_of_image_is_an_error() {
        let mut image = vec![0_u8; NODE_SIZE];
        assert!(node_at(&image, 1).is_err());
        assert!(write_node(&mut image, 1, &Node::Free).is_err());
    }
}
