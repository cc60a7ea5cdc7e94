//! Blob cache.
//!
//! Two digest-keyed tables behind one lock. `open` holds weak references
//! to vnodes with at least one external handle; `closed` holds owning
//! references to vnodes that were fully released but are retained for
//! warm lookup. A vnode is destroyed only when it is in neither table and
//! no clone pin keeps it alive.

use crate::blob::{Blob, BlobState};
use parking_lot::Mutex;
use sealfs_error::{Result, SealError};
use sealfs_merkle::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// What `release` did with the vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other external handles remain.
    Retained,
    /// Final release; moved to the closed table per policy.
    Cached,
    /// Final release of a deletable or never-committed vnode; removed
    /// from the tables. The caller must purge it.
    NeedsPurge,
}

/// What happens to a vnode when its last handle closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Drop the vnode's in-memory buffers immediately; keep the digest
    /// mapping so a warm lookup avoids the node-table scan.
    EvictImmediately,
    /// Keep buffers and mapping until unlink or unmount.
    NeverEvict,
}

struct CacheInner {
    open: HashMap<Digest, Weak<Blob>>,
    closed: HashMap<Digest, Arc<Blob>>,
}

pub struct BlobCache {
    inner: Mutex<CacheInner>,
    policy: CachePolicy,
}

impl BlobCache {
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                open: HashMap::new(),
                closed: HashMap::new(),
            }),
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Find a live vnode by digest and retain an external handle on it.
    ///
    /// The handle count bumps under the cache lock, so a concurrent
    /// final release in `release` either observes this handle or has
    /// already moved the vnode to the closed table (where it is
    /// resurrected here). An entry in `open` whose strong count already
    /// hit zero means its holder abandoned it without a close; the
    /// stale entry is dropped and the lookup misses.
    pub fn lookup(&self, digest: &Digest) -> Option<Arc<Blob>> {
        let mut inner = self.inner.lock();
        if let Some(weak) = inner.open.get(digest) {
            return match weak.upgrade() {
                Some(blob) => {
                    blob.retain_handle();
                    Some(blob)
                }
                None => {
                    warn!(
                        target: "sealfs::cache",
                        digest = %digest,
                        "dropping stale open-table entry"
                    );
                    inner.open.remove(digest);
                    None
                }
            };
        }
        if let Some(blob) = inner.closed.remove(digest) {
            inner.open.insert(*digest, Arc::downgrade(&blob));
            blob.retain_handle();
            trace!(target: "sealfs::cache", digest = %digest, "resurrected from closed table");
            return Some(blob);
        }
        None
    }

    /// Register a new vnode in the open table, retaining the creator's
    /// handle on it.
    pub fn insert_open(&self, blob: &Arc<Blob>) -> Result<()> {
        let mut inner = self.inner.lock();
        let digest = *blob.digest();
        let occupied = inner
            .open
            .get(&digest)
            .is_some_and(|weak| weak.strong_count() > 0)
            || inner.closed.contains_key(&digest);
        if occupied {
            return Err(SealError::AlreadyExists);
        }
        inner.open.insert(digest, Arc::downgrade(blob));
        blob.retain_handle();
        Ok(())
    }

    /// Register a vnode straight into the closed table (mount-time
    /// population). Duplicate digests mean a corrupted node table.
    pub fn insert_closed(&self, blob: Arc<Blob>) -> Result<()> {
        let mut inner = self.inner.lock();
        let digest = *blob.digest();
        if inner.closed.contains_key(&digest) || inner.open.contains_key(&digest) {
            return Err(SealError::AlreadyExists);
        }
        if self.policy == CachePolicy::EvictImmediately {
            blob.teardown();
        }
        inner.closed.insert(digest, blob);
        Ok(())
    }

    /// Drop one external handle.
    ///
    /// On the final release the count check and the table transition are
    /// one atomic step under the cache lock: the vnode either moves to
    /// the closed table (eviction policy applied) or leaves the tables
    /// entirely when it must be purged. A lookup racing this call either
    /// lands before the lock (the count stays above zero) or after the
    /// move (and resurrects from the closed table).
    pub fn release(&self, blob: &Arc<Blob>) -> ReleaseOutcome {
        let mut inner = self.inner.lock();
        if !blob.release_handle() {
            return ReleaseOutcome::Retained;
        }

        let digest = *blob.digest();
        inner.open.remove(&digest);
        if blob.is_deletable() || blob.state() != BlobState::Readable {
            return ReleaseOutcome::NeedsPurge;
        }
        if self.policy == CachePolicy::EvictImmediately {
            blob.teardown();
        }
        inner.closed.insert(digest, Arc::clone(blob));
        ReleaseOutcome::Cached
    }

    /// Remove a vnode from both tables (unlink/purge and error paths).
    pub fn evict(&self, digest: &Digest) {
        let mut inner = self.inner.lock();
        inner.open.remove(digest);
        inner.closed.remove(digest);
    }

    /// All vnodes currently reachable, for shutdown teardown.
    #[must_use]
    pub fn live_blobs(&self) -> Vec<Arc<Blob>> {
        let inner = self.inner.lock();
        inner
            .open
            .values()
            .filter_map(Weak::upgrade)
            .chain(inner.closed.values().cloned())
            .collect()
    }

    /// Drop every cached vnode (ordered teardown).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.open.clear();
        inner.closed.clear();
    }

    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        let inner = self.inner.lock();
        inner
            .open
            .get(digest)
            .is_some_and(|weak| weak.strong_count() > 0)
            || inner.closed.contains_key(digest)
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "BlobCache(open={}, closed={}, policy={:?})",
            inner.open.len(),
            inner.closed.len(),
            self.policy
        )
    }
}
