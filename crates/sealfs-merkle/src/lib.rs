#![forbid(unsafe_code)]
//! Content digests and the Merkle engine.
//!
//! A blob's name is the root of a hash tree over its data. The tree hashes
//! fixed-size nodes with BLAKE3; each level above the leaves hashes the
//! packed (zero-padded) hash array of the level below it. A blob that fits
//! in a single node stores no tree at all: its root is the hash of the data
//! itself, and the empty blob's root is the hash of zero bytes.

use sealfs_error::{Result, SealError};
use sealfs_types::{round_up, ParseError};
use std::fmt;
use std::str::FromStr;

/// Digest length in bytes.
pub const HASH_SIZE: usize = 32;
/// Merkle node size in bytes. Matches the filesystem block size so the
/// stored tree occupies whole blocks.
pub const MERKLE_NODE_SIZE: usize = 8192;

/// 32-byte content digest; both a blob's name and its integrity anchor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; HASH_SIZE]);

impl Digest {
    #[must_use]
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Lowercase hex form, used as the blob's directory name.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex name.
    pub fn from_hex(name: &str) -> std::result::Result<Self, ParseError> {
        let raw = hex::decode(name).map_err(|_| ParseError::InvalidField {
            field: "digest",
            reason: "not valid hex",
        })?;
        let bytes: [u8; HASH_SIZE] =
            raw.try_into().map_err(|_| ParseError::InvalidField {
                field: "digest",
                reason: "must be 32 bytes",
            })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; HASH_SIZE]> for Digest {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

fn hash_node(data: &[u8]) -> [u8; HASH_SIZE] {
    *blake3::hash(data).as_bytes()
}

fn leaf_count(data_len: u64) -> u64 {
    if data_len == 0 {
        1
    } else {
        data_len.div_ceil(MERKLE_NODE_SIZE as u64)
    }
}

/// Size in bytes of the stored tree for a blob of `data_len` bytes.
///
/// Zero when the blob fits in one node. Each stored level is padded to a
/// node boundary; the root hash is never stored.
#[must_use]
pub fn tree_size(data_len: u64) -> u64 {
    let mut level_hashes = leaf_count(data_len);
    let mut total = 0_u64;
    while level_hashes > 1 {
        let level_bytes = round_up(level_hashes * HASH_SIZE as u64, MERKLE_NODE_SIZE as u64);
        total += level_bytes;
        level_hashes = level_bytes / MERKLE_NODE_SIZE as u64;
    }
    total
}

/// Stored tree size in whole filesystem blocks.
#[must_use]
pub fn tree_blocks(data_len: u64) -> u64 {
    sealfs_types::bytes_to_blocks(tree_size(data_len))
}

/// Root digest of the empty blob; the well-known name of the null blob.
#[must_use]
pub fn empty_root() -> Digest {
    Digest(hash_node(&[]))
}

/// Build the Merkle tree for `data` into `tree` and return the root.
///
/// `tree.len()` must equal `tree_size(data.len() as u64)`.
pub fn build(data: &[u8], tree: &mut [u8]) -> Result<Digest> {
    let expected = tree_size(data.len() as u64);
    if tree.len() as u64 != expected {
        return Err(SealError::InvalidArgs);
    }

    let leaves = leaf_count(data.len() as u64);
    if leaves == 1 {
        return Ok(Digest(hash_node(data)));
    }

    // Leaf level: one hash per data node, zero-padded to a node boundary.
    for (i, chunk) in data.chunks(MERKLE_NODE_SIZE).enumerate() {
        let at = i * HASH_SIZE;
        tree[at..at + HASH_SIZE].copy_from_slice(&hash_node(chunk));
    }

    let mut level_start = 0_usize;
    let mut level_hashes = leaves as usize;
    loop {
        let level_bytes = round_up(
            (level_hashes * HASH_SIZE) as u64,
            MERKLE_NODE_SIZE as u64,
        ) as usize;
        tree[level_start + level_hashes * HASH_SIZE..level_start + level_bytes].fill(0);

        let next_hashes = level_bytes / MERKLE_NODE_SIZE;
        if next_hashes == 1 {
            let root = hash_node(&tree[level_start..level_start + level_bytes]);
            return Ok(Digest(root));
        }

        let next_start = level_start + level_bytes;
        let (lower, upper) = tree.split_at_mut(next_start);
        let level = &lower[level_start..];
        for i in 0..next_hashes {
            let node = &level[i * MERKLE_NODE_SIZE..(i + 1) * MERKLE_NODE_SIZE];
            upper[i * HASH_SIZE..(i + 1) * HASH_SIZE].copy_from_slice(&hash_node(node));
        }
        level_start = next_start;
        level_hashes = next_hashes;
    }
}

/// Root digest of `data`, discarding the intermediate tree.
#[must_use]
pub fn merkle_root(data: &[u8]) -> Digest {
    let mut tree = vec![0_u8; tree_size(data.len() as u64) as usize];
    build(data, &mut tree).expect("scratch tree is correctly sized")
}

/// Verify `data` against its stored `tree` and the expected root.
///
/// `offset`/`length` describe the byte range the caller is about to consume
/// and are range-checked, but the whole blob is always verified; verifying
/// only the touched subtree is a future optimization the format permits.
pub fn verify(
    data: &[u8],
    tree: &[u8],
    offset: u64,
    length: u64,
    expected: &Digest,
) -> Result<()> {
    let end = offset.checked_add(length).ok_or(SealError::OutOfRange)?;
    if end > data.len() as u64 {
        return Err(SealError::OutOfRange);
    }
    if tree.len() as u64 != tree_size(data.len() as u64) {
        return Err(SealError::IntegrityError);
    }

    let mut rebuilt = vec![0_u8; tree.len()];
    let root = build(data, &mut rebuilt)?;
    if root != *expected || rebuilt != tree {
        return Err(SealError::IntegrityError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: usize = MERKLE_NODE_SIZE;

    #[test]
    fn empty_root_is_well_known() {
        // BLAKE3 of zero bytes.
        assert_eq!(
            empty_root().to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
        assert_eq!(merkle_root(&[]), empty_root());
        assert_eq!(tree_size(0), 0);
    }

    #[test]
    fn digest_hex_round_trip() {
        let d = merkle_root(b"hello");
        let parsed = Digest::from_hex(&d.to_hex()).expect("round trip");
        assert_eq!(d, parsed);
        assert_eq!(d.to_hex().len(), 64);
        assert!(Digest::from_hex("xyz").is_err());
        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn single_node_blob_has_no_tree() {
        assert_eq!(tree_size(1), 0);
        assert_eq!(tree_size(NODE as u64), 0);
        let data = vec![7_u8; NODE];
        let root = merkle_root(&data);
        verify(&data, &[], 0, data.len() as u64, &root).expect("verifies");
    }

    #[test]
    fn tree_size_levels() {
        // Two leaves: one padded level.
        assert_eq!(tree_size(NODE as u64 + 1), NODE as u64);
        // 256 leaves pack exactly into one level node.
        assert_eq!(tree_size((NODE * 256) as u64), NODE as u64);
        // 257 leaves need a second level.
        assert_eq!(tree_size((NODE * 257) as u64), (3 * NODE) as u64);
    }

    #[test]
    fn multi_node_build_and_verify() {
        let mut data = vec![0_u8; NODE * 3 + 17];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let mut tree = vec![0_u8; tree_size(data.len() as u64) as usize];
        let root = build(&data, &mut tree).expect("build");
        verify(&data, &tree, 0, data.len() as u64, &root).expect("verifies");
    }

    #[test]
    fn corrupt_data_fails_verification() {
        let mut data = vec![3_u8; NODE * 2];
        let mut tree = vec![0_u8; tree_size(data.len() as u64) as usize];
        let root = build(&data, &mut tree).expect("build");

        data[NODE + 5] ^= 0xFF;
        assert!(matches!(
            verify(&data, &tree, 0, data.len() as u64, &root),
            Err(SealError::IntegrityError)
        ));
    }

    #[test]
    fn corrupt_tree_fails_verification() {
        let data = vec![9_u8; NODE * 2];
        let mut tree = vec![0_u8; tree_size(data.len() as u64) as usize];
        let root = build(&data, &mut tree).expect("build");

        tree[0] ^= 0x01;
        assert!(matches!(
            verify(&data, &tree, 0, data.len() as u64, &root),
            Err(SealError::IntegrityError)
        ));
    }

    #[test]
    fn verify_range_checks() {
        let data = vec![1_u8; 100];
        let root = merkle_root(&data);
        verify(&data, &[], 100, 0, &root).expect("empty range at end is ok");
        assert!(matches!(
            verify(&data, &[], 100, 1, &root),
            Err(SealError::OutOfRange)
        ));
        assert!(matches!(
            verify(&data, &[], u64::MAX, 1, &root),
            Err(SealError::OutOfRange)
        ));
    }

    #[test]
    fn mismatched_tree_length_is_integrity_error() {
        let data = vec![1_u8; NODE * 2];
        let root = merkle_root(&data);
        assert!(matches!(
            verify(&data, &[], 0, 0, &root),
            Err(SealError::IntegrityError)
        ));
    }
}
