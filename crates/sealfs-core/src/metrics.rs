//! Operation counters, enabled by the `metrics` mount option.
//!
//! The collector that would consume these lives outside the engine; here
//! they are just cheap counters behind one lock, snapshotted on demand.

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub blobs_created: u64,
    pub blobs_created_total_size: u64,
    pub blobs_opened: u64,
    pub blobs_opened_total_size: u64,
    pub blobs_verified: u64,
    pub data_bytes_written: u64,
    pub merkle_bytes_written: u64,
    pub bytes_read_from_disk: u64,
    pub bytes_decompressed_from_disk: u64,
}

#[derive(Debug)]
pub(crate) struct Metrics {
    enabled: bool,
    counters: Mutex<MetricsSnapshot>,
}

impl Metrics {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: Mutex::new(MetricsSnapshot::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        self.counters.lock().clone()
    }

    pub(crate) fn record_allocation(&self, size: u64) {
        if self.enabled {
            let mut counters = self.counters.lock();
            counters.blobs_created += 1;
            counters.blobs_created_total_size += size;
        }
    }

    pub(crate) fn record_lookup(&self, size: u64) {
        if self.enabled {
            let mut counters = self.counters.lock();
            counters.blobs_opened += 1;
            counters.blobs_opened_total_size += size;
        }
    }

    pub(crate) fn record_verify(&self) {
        if self.enabled {
            self.counters.lock().blobs_verified += 1;
        }
    }

    pub(crate) fn record_client_write(&self, data_bytes: u64, merkle_bytes: u64) {
        if self.enabled {
            let mut counters = self.counters.lock();
            counters.data_bytes_written += data_bytes;
            counters.merkle_bytes_written += merkle_bytes;
        }
    }

    pub(crate) fn record_disk_read(&self, bytes: u64) {
        if self.enabled {
            self.counters.lock().bytes_read_from_disk += bytes;
        }
    }

    pub(crate) fn record_decompress(&self, bytes: u64) {
        if self.enabled {
            self.counters.lock().bytes_decompressed_from_disk += bytes;
        }
    }
}
