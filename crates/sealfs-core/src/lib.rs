#![forbid(unsafe_code)]
//! sealfs engine.
//!
//! A content-addressed, write-once filesystem for immutable blobs. Blobs
//! are named by the Merkle root of their contents, verified on read, and
//! optionally stored compressed. The engine owns the on-disk container:
//! superblock, allocation bitmap, node table, journal, and data region.
//!
//! The public surface is [`SealFs`] (mount, blob lifecycle, enumeration)
//! and [`Blob`] (the per-blob state machine).

mod blob;
mod cache;
mod format;
mod fs;
mod metrics;
mod volume;

pub use blob::{Blob, BlobClone, BlobState, ReadableEvent};
pub use cache::{BlobCache, CachePolicy, ReleaseOutcome};
pub use format::{format, format_sliced, FormatOptions};
pub use fs::{DirCursor, SealFs};
pub use metrics::MetricsSnapshot;
pub use volume::{FakeVolumeManager, SliceRange, VolumeInfo, VolumeManager};

use serde::{Deserialize, Serialize};

/// Default writeback queue depth in bytes.
pub const DEFAULT_WRITEBACK_BUFFER_SIZE: u64 = 2 * 1024 * 1024;

/// Mount-time configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOptions {
    /// Disable all writeback; the filesystem serves reads only.
    pub readonly: bool,
    /// Enable operation counters.
    pub metrics: bool,
    /// Write metadata through the journal. Replay always runs at mount
    /// regardless of this setting.
    pub journal: bool,
    pub cache_policy: CachePolicy,
    /// Writeback queue depth in bytes; rounded down to whole blocks.
    pub writeback_buffer_size: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            metrics: false,
            journal: true,
            cache_policy: CachePolicy::EvictImmediately,
            writeback_buffer_size: DEFAULT_WRITEBACK_BUFFER_SIZE,
        }
    }
}
