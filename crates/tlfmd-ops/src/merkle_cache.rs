//! Memoized Merkle evidence: located KBFS leaves, validated successor
//! chains and the best known revocation record per key.

use std::collections::HashMap;

use parking_lot::RwLock;
use tlfmd_core::{NextMd, Revision, RevokedKeyInfo, TlfId, VerifyingKey};
use tracing::debug;

#[derive(Default)]
pub struct MerkleChainCache {
    next_md: RwLock<HashMap<(TlfId, i64), NextMd>>,
    // (folder, checkpoint revision) -> earliest revision known to chain to it
    validated: RwLock<HashMap<(TlfId, Revision), Revision>>,
}

impl MerkleChainCache {
    pub fn next_md(&self, tlf: TlfId, root_seqno: i64) -> Option<NextMd> {
        self.next_md.read().get(&(tlf, root_seqno)).cloned()
    }

    pub fn put_next_md(&self, tlf: TlfId, root_seqno: i64, next: NextMd) {
        self.next_md.write().insert((tlf, root_seqno), next);
    }

    /// Earliest revision known to chain up to `end`, or `end` itself.
    pub fn validated_chain_start(&self, tlf: TlfId, end: Revision) -> Revision {
        self.validated.read().get(&(tlf, end)).copied().unwrap_or(end)
    }

    /// Record that `start..=end` forms a verified chain. The recorded start
    /// only ever moves down.
    pub fn record_validated_chain(&self, tlf: TlfId, end: Revision, start: Revision) {
        let mut validated = self.validated.write();
        let current = validated.entry((tlf, end)).or_insert(end);
        if start < *current {
            debug!(tlf = %tlf, end = %end, start = %start, "extended validated chain");
            *current = start;
        }
    }
}

/// Revocation records observed while verifying keys.
#[derive(Default)]
pub struct RevocationCache {
    records: RwLock<HashMap<VerifyingKey, RevokedKeyInfo>>,
}

impl RevocationCache {
    pub fn get(&self, key: &VerifyingKey) -> Option<RevokedKeyInfo> {
        self.records.read().get(key).cloned()
    }

    /// Merge a fresh record with what is cached and return the most
    /// informative of the two.
    pub fn observe(&self, key: VerifyingKey, info: RevokedKeyInfo) -> RevokedKeyInfo {
        let mut records = self.records.write();
        match records.get(&key) {
            Some(cached) if !cached.is_refined_by(&info) => cached.clone(),
            _ => {
                records.insert(key, info.clone());
                info
            }
        }
    }
}
