//! Engine-owned caches for verified revisions, handle IDs and key bundles.
//!
//! All caches are safe to share between tasks. Key bundles are content
//! addressed, so a cached bundle is never stale.

use std::collections::HashMap;

use moka::sync::Cache;
use parking_lot::RwLock;
use tlfmd_core::{
    BranchId, ReaderKeyBundle, ReaderKeyBundleId, Revision, TlfId, WriterKeyBundle, WriterKeyBundleId,
};

use crate::metadata::ImmutableRootMetadata;

pub const DEFAULT_MD_CACHE_CAPACITY: u64 = 5000;

type MdKey = (TlfId, Revision, BranchId);

/// Verified revisions keyed by (folder, revision, branch), bounded by
/// entry count.
pub struct MdCache {
    entries: Cache<MdKey, ImmutableRootMetadata>,
}

impl Default for MdCache {
    fn default() -> Self {
        Self::new(DEFAULT_MD_CACHE_CAPACITY)
    }
}

impl MdCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity.max(1)).build(),
        }
    }

    pub fn get(&self, tlf: TlfId, rev: Revision, bid: BranchId) -> Option<ImmutableRootMetadata> {
        self.entries.get(&(tlf, rev, bid))
    }

    /// Insert a revision fetched from the server. An existing entry wins.
    pub fn put(&self, irmd: ImmutableRootMetadata) {
        let key = (irmd.tlf_id(), irmd.revision(), irmd.branch_id());
        self.entries.entry(key).or_insert(irmd);
    }

    /// Record a locally written revision, overriding anything cached for
    /// the same revision under `old_bid` or the revision's own branch.
    pub fn replace(&self, irmd: ImmutableRootMetadata, old_bid: BranchId) {
        let key = (irmd.tlf_id(), irmd.revision(), irmd.branch_id());
        self.entries.invalidate(&(key.0, key.1, old_bid));
        self.entries.insert(key, irmd);
    }

    /// Entry count after pending evictions have been applied.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to folder ID, keyed by the handle's store key.
#[derive(Default)]
pub struct IdCache {
    ids: RwLock<HashMap<String, TlfId>>,
}

impl IdCache {
    pub fn get(&self, handle_key: &str) -> Option<TlfId> {
        self.ids.read().get(handle_key).copied()
    }

    pub fn put(&self, handle_key: String, id: TlfId) {
        self.ids.write().insert(handle_key, id);
    }
}

/// Writer and reader key bundles by content ID.
#[derive(Default)]
pub struct KeyBundleCache {
    writers: RwLock<HashMap<(TlfId, WriterKeyBundleId), WriterKeyBundle>>,
    readers: RwLock<HashMap<(TlfId, ReaderKeyBundleId), ReaderKeyBundle>>,
}

impl KeyBundleCache {
    pub fn writer_bundle(&self, tlf: TlfId, id: WriterKeyBundleId) -> Option<WriterKeyBundle> {
        self.writers.read().get(&(tlf, id)).cloned()
    }

    pub fn reader_bundle(&self, tlf: TlfId, id: ReaderKeyBundleId) -> Option<ReaderKeyBundle> {
        self.readers.read().get(&(tlf, id)).cloned()
    }

    pub fn put_writer_bundle(&self, tlf: TlfId, id: WriterKeyBundleId, bundle: WriterKeyBundle) {
        self.writers.write().insert((tlf, id), bundle);
    }

    pub fn put_reader_bundle(&self, tlf: TlfId, id: ReaderKeyBundleId, bundle: ReaderKeyBundle) {
        self.readers.write().insert((tlf, id), bundle);
    }
}
