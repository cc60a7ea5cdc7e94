#![forbid(unsafe_code)]
//! Core types for sealfs.
//!
//! Newtype identifiers, fixed format parameters, and the little-endian
//! read helpers shared by the on-disk parsers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Superblock magic, block 0 bytes 0..8.
pub const SUPERBLOCK_MAGIC: u64 = 0x9D5E_A1B1_0BF5_2077;
/// On-disk format revision.
pub const FORMAT_VERSION: u32 = 1;

/// Filesystem block size in bytes. Fixed; the superblock records it so a
/// future revision can change it without a magic bump.
pub const BLOCK_SIZE: u32 = 8192;
/// Size of one node-table record in bytes.
pub const NODE_SIZE: usize = 64;
/// Node records per filesystem block.
pub const NODES_PER_BLOCK: u64 = BLOCK_SIZE as u64 / NODE_SIZE as u64;
/// Allocation bits covered by one bitmap block.
pub const BLOCK_BITS: u64 = BLOCK_SIZE as u64 * 8;

/// Extents store their length in a u16.
pub const MAX_EXTENT_LENGTH: u16 = u16::MAX;
/// Cap on the number of extents a single blob may span.
pub const MAX_BLOB_EXTENTS: usize = 96;
/// Extents stored inline in a primary inode.
pub const INODE_INLINE_EXTENTS: usize = 1;
/// Extents stored in one extent container.
pub const CONTAINER_EXTENTS: usize = 6;

/// Superblock flag: the container is backed by a slice-granting volume
/// manager and uses the sliced region layout.
pub const FLAG_SLICED: u32 = 0x0000_0001;
/// Superblock flag: the filesystem was unmounted cleanly.
pub const FLAG_CLEAN: u32 = 0x0000_0002;

/// Absolute block address on the underlying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for the fixed block size.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(u64::from(BLOCK_SIZE))
    }
}

/// Index into the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    /// Node-table block that holds this record.
    #[must_use]
    pub fn table_block(self) -> u64 {
        u64::from(self.0) / NODES_PER_BLOCK
    }

    /// Byte offset of this record within the node-table image.
    #[must_use]
    pub fn byte_offset(self) -> usize {
        self.0 as usize * NODE_SIZE
    }
}

/// A contiguous run of data blocks belonging to one blob.
///
/// `start` is relative to the data region, not the device. The on-disk
/// encoding is `(start: u32, length: u16)`, so lengths are u16-bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    start: u32,
    length: u16,
}

impl Extent {
    #[must_use]
    pub fn new(start: u32, length: u16) -> Self {
        Self { start, length }
    }

    #[must_use]
    pub fn start(self) -> u32 {
        self.start
    }

    #[must_use]
    pub fn length(self) -> u16 {
        self.length
    }

    /// One past the last block, widened so `start == u32::MAX` cannot wrap.
    #[must_use]
    pub fn end(self) -> u64 {
        u64::from(self.start) + u64::from(self.length)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.length == 0
    }

    /// The first `length` blocks of this extent.
    ///
    /// `length` must not exceed the current length.
    #[must_use]
    pub fn prefix(self, length: u16) -> Self {
        debug_assert!(length <= self.length);
        Self {
            start: self.start,
            length,
        }
    }

    /// The blocks past the first `length`.
    #[must_use]
    pub fn suffix(self, length: u16) -> Self {
        debug_assert!(length <= self.length);
        Self {
            start: self.start + u32::from(length),
            length: self.length - length,
        }
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}+{}]", self.start, self.length)
    }
}

/// Round a byte count up to whole blocks.
#[must_use]
pub fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(u64::from(BLOCK_SIZE))
}

/// Round `value` up to the nearest multiple of `multiple` (non-zero).
#[must_use]
pub fn round_up(value: u64, multiple: u64) -> u64 {
    debug_assert!(multiple > 0);
    value.div_ceil(multiple) * multiple
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn extent_split_math() {
        let e = Extent::new(100, 10);
        assert_eq!(e.end(), 110);
        assert_eq!(e.prefix(4), Extent::new(100, 4));
        assert_eq!(e.suffix(4), Extent::new(104, 6));
        assert_eq!(e.prefix(10), e);
        assert!(e.suffix(10).is_empty());
    }

    #[test]
    fn extent_end_does_not_wrap() {
        let e = Extent::new(u32::MAX, MAX_EXTENT_LENGTH);
        assert_eq!(e.end(), u64::from(u32::MAX) + u64::from(MAX_EXTENT_LENGTH));
    }

    #[test]
    fn block_rounding() {
        assert_eq!(bytes_to_blocks(0), 0);
        assert_eq!(bytes_to_blocks(1), 1);
        assert_eq!(bytes_to_blocks(u64::from(BLOCK_SIZE)), 1);
        assert_eq!(bytes_to_blocks(u64::from(BLOCK_SIZE) + 1), 2);
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(9, 8), 16);
    }

    #[test]
    fn node_index_placement() {
        assert_eq!(NodeIndex(0).table_block(), 0);
        assert_eq!(NodeIndex(127).table_block(), 0);
        assert_eq!(NodeIndex(128).table_block(), 1);
        assert_eq!(NodeIndex(3).byte_offset(), 192);
    }

    #[test]
    fn node_geometry_is_exact() {
        // A node record must tile the block exactly.
        assert_eq!(BLOCK_SIZE as u64 % NODE_SIZE as u64, 0);
        assert_eq!(NODES_PER_BLOCK, 128);
    }
}
