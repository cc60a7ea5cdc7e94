//! Volume manager interface.
//!
//! When the superblock carries the sliced flag, the container sits on a
//! slice-granting volume manager and each metadata region can grow by
//! whole slices. The manager itself is an external collaborator; the
//! engine only issues the four query/extend/shrink operations.

use parking_lot::Mutex;
use sealfs_error::{Result, SealError};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub slice_size: u64,
    pub total_slices: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub allocated: bool,
    pub count: u64,
}

pub trait VolumeManager: Send + Sync {
    fn query(&self) -> Result<VolumeInfo>;

    /// For each start slice, report whether it is allocated and how many
    /// contiguous slices the allocation spans.
    fn vslice_query(&self, starts: &[u64]) -> Result<Vec<SliceRange>>;

    fn extend(&self, start_slice: u64, count: u64) -> Result<()>;

    fn shrink(&self, start_slice: u64, count: u64) -> Result<()>;
}

/// In-memory volume manager for tests and tooling.
///
/// Tracks allocated ranges as `start -> count`; `extend` fails once
/// `total_slices` is exhausted, which is how tests provoke `NoSpace`.
#[derive(Debug)]
pub struct FakeVolumeManager {
    slice_size: u64,
    total_slices: u64,
    allocated: Mutex<BTreeMap<u64, u64>>,
}

impl FakeVolumeManager {
    #[must_use]
    pub fn new(slice_size: u64, total_slices: u64) -> Self {
        Self {
            slice_size,
            total_slices,
            allocated: Mutex::new(BTreeMap::new()),
        }
    }

    /// Pre-allocate a range, as the formatter would.
    pub fn seed(&self, start_slice: u64, count: u64) {
        self.allocated.lock().insert(start_slice, count);
    }

    fn allocated_total(allocated: &BTreeMap<u64, u64>) -> u64 {
        allocated.values().sum()
    }

    fn range_containing(allocated: &BTreeMap<u64, u64>, slice: u64) -> Option<(u64, u64)> {
        allocated
            .range(..=slice)
            .next_back()
            .filter(|(start, count)| slice < *start + **count)
            .map(|(start, count)| (*start, *count))
    }
}

impl VolumeManager for FakeVolumeManager {
    fn query(&self) -> Result<VolumeInfo> {
        Ok(VolumeInfo {
            slice_size: self.slice_size,
            total_slices: self.total_slices,
        })
    }

    fn vslice_query(&self, starts: &[u64]) -> Result<Vec<SliceRange>> {
        let allocated = self.allocated.lock();
        Ok(starts
            .iter()
            .map(|start| match Self::range_containing(&allocated, *start) {
                Some((range_start, range_count)) => SliceRange {
                    allocated: true,
                    count: range_count - (start - range_start),
                },
                None => SliceRange {
                    allocated: false,
                    count: 0,
                },
            })
            .collect())
    }

    fn extend(&self, start_slice: u64, count: u64) -> Result<()> {
        let mut allocated = self.allocated.lock();
        if Self::allocated_total(&allocated) + count > self.total_slices {
            return Err(SealError::NoSpace);
        }
        // Merge with an adjacent preceding range when possible.
        if let Some((range_start, range_count)) =
            Self::range_containing(&allocated, start_slice.saturating_sub(1))
        {
            if range_start + range_count == start_slice {
                allocated.insert(range_start, range_count + count);
                return Ok(());
            }
        }
        allocated.insert(start_slice, count);
        Ok(())
    }

    fn shrink(&self, start_slice: u64, count: u64) -> Result<()> {
        let mut allocated = self.allocated.lock();
        let Some((range_start, range_count)) = Self::range_containing(&allocated, start_slice)
        else {
            return Err(SealError::InvalidArgs);
        };
        if start_slice + count != range_start + range_count {
            // Only tail shrinks are supported.
            return Err(SealError::InvalidArgs);
        }
        let keep = start_slice - range_start;
        if keep == 0 {
            allocated.remove(&range_start);
        } else {
            allocated.insert(range_start, keep);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_query_shrink_round_trip() {
        let volume = FakeVolumeManager::new(1024 * 1024, 10);
        volume.extend(4, 2).expect("extend");
        let ranges = volume.vslice_query(&[4, 5, 6]).expect("query");
        assert!(ranges[0].allocated);
        assert_eq!(ranges[0].count, 2);
        assert!(ranges[1].allocated);
        assert_eq!(ranges[1].count, 1);
        assert!(!ranges[2].allocated);

        volume.shrink(5, 1).expect("shrink tail");
        let ranges = volume.vslice_query(&[4, 5]).expect("query");
        assert_eq!(ranges[0].count, 1);
        assert!(!ranges[1].allocated);
    }

    #[test]
    fn extend_merges_adjacent_ranges() {
        let volume = FakeVolumeManager::new(1024 * 1024, 10);
        volume.extend(4, 1).expect("extend");
        volume.extend(5, 1).expect("extend adjacent");
        let ranges = volume.vslice_query(&[4]).expect("query");
        assert_eq!(ranges[0].count, 2);
    }

    #[test]
    fn exhausted_volume_refuses_extend() {
        let volume = FakeVolumeManager::new(1024 * 1024, 3);
        volume.extend(0, 3).expect("extend");
        assert!(matches!(volume.extend(5, 1), Err(SealError::NoSpace)));
    }
}
