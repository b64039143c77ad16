//! Durable store state: everything except locks and update registrations.
//!
//! Maps are nested by folder so every key serializes as a string and the
//! whole state can be snapshotted to JSON by the disk variant.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tlfmd_core::clock::from_unix_millis;
use tlfmd_core::{
    codec, BranchId, CryptPublicKey, KbfsMerkleRoot, MerkleTreeId, MetadataVer, NextMd, ReaderKeyBundle,
    ReaderKeyBundleId, Revision, RootMetadataSigned, TlfHandle, TlfId, WriterKeyBundle, WriterKeyBundleId,
};

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredBlock {
    #[serde(with = "codec::b64")]
    pub encoded: Vec<u8>,
    pub timestamp_ms: i64,
    pub version: MetadataVer,
}

impl StoredBlock {
    pub fn decode(&self) -> ServerResult<RootMetadataSigned> {
        let mut rmds: RootMetadataSigned =
            codec::decode(&self.encoded).map_err(|e| ServerError::Codec(format!("{e:#}")))?;
        rmds.untrusted_server_timestamp = Some(from_unix_millis(self.timestamp_ms));
        Ok(rmds)
    }
}

/// Revisions of one (folder, branch), contiguous from `initial_revision`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BlockList {
    pub initial_revision: Revision,
    pub blocks: Vec<StoredBlock>,
}

impl BlockList {
    pub fn head(&self) -> Option<&StoredBlock> {
        self.blocks.last()
    }

    pub fn at(&self, rev: Revision) -> Option<&StoredBlock> {
        let idx = rev.0.checked_sub(self.initial_revision.0)?;
        usize::try_from(idx).ok().and_then(|i| self.blocks.get(i))
    }

    /// Blocks in `[start, stop]`, clamped to what exists.
    pub fn range(&self, start: Revision, stop: Revision) -> &[StoredBlock] {
        let len = self.blocks.len() as i64;
        let start_i = (start.0 - self.initial_revision.0).clamp(0, len);
        let end_i = (stop.0 - self.initial_revision.0 + 1).clamp(0, len);
        if start_i >= end_i {
            return &[];
        }
        &self.blocks[start_i as usize..end_i as usize]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    /// Handle store key to folder ID.
    pub handles: HashMap<String, TlfId>,
    pub latest_handles: HashMap<TlfId, TlfHandle>,
    pub md: HashMap<TlfId, HashMap<BranchId, BlockList>>,
    /// Each device's active unmerged branch.
    pub branches: HashMap<TlfId, HashMap<CryptPublicKey, BranchId>>,
    pub merkle_roots: BTreeMap<MerkleTreeId, KbfsMerkleRoot>,
    /// Published leaves per folder, ordered by global root seqno.
    pub next_mds: HashMap<TlfId, Vec<NextMd>>,
}

impl StoreState {
    pub fn block_list(&self, tlf: TlfId, bid: BranchId) -> Option<&BlockList> {
        self.md.get(&tlf)?.get(&bid)
    }

    pub fn head(&self, tlf: TlfId, bid: BranchId) -> ServerResult<Option<RootMetadataSigned>> {
        self.block_list(tlf, bid)
            .and_then(BlockList::head)
            .map(StoredBlock::decode)
            .transpose()
    }

    pub fn merged_head_revision(&self, tlf: TlfId) -> ServerResult<Revision> {
        Ok(self
            .head(tlf, BranchId::NULL)?
            .map(|h| h.revision())
            .unwrap_or(Revision::UNINITIALIZED))
    }

    pub fn merged_at(&self, tlf: TlfId, rev: Revision) -> ServerResult<Option<RootMetadataSigned>> {
        self.block_list(tlf, BranchId::NULL)
            .and_then(|l| l.at(rev))
            .map(StoredBlock::decode)
            .transpose()
    }

    pub fn append(&mut self, tlf: TlfId, bid: BranchId, rev: Revision, block: StoredBlock) {
        self.md
            .entry(tlf)
            .or_default()
            .entry(bid)
            .or_insert_with(|| BlockList {
                initial_revision: rev,
                blocks: Vec::new(),
            })
            .blocks
            .push(block);
    }

    pub fn branch_for(&self, tlf: TlfId, device: &CryptPublicKey) -> Option<BranchId> {
        self.branches.get(&tlf)?.get(device).copied()
    }

    pub fn set_branch(&mut self, tlf: TlfId, device: CryptPublicKey, bid: BranchId) {
        self.branches.entry(tlf).or_default().insert(device, bid);
    }

    pub fn remove_branch(&mut self, tlf: TlfId, device: &CryptPublicKey) {
        if let Some(per_tlf) = self.branches.get_mut(&tlf) {
            per_tlf.remove(device);
            if per_tlf.is_empty() {
                self.branches.remove(&tlf);
            }
        }
    }

    pub fn publish_next_md(&mut self, tlf: TlfId, next: NextMd) {
        let list = self.next_mds.entry(tlf).or_default();
        let pos = list.partition_point(|n| n.root_seqno <= next.root_seqno);
        list.insert(pos, next);
    }

    pub fn find_next_md(&self, tlf: TlfId, after_seqno: i64) -> Option<NextMd> {
        self.next_mds
            .get(&tlf)?
            .iter()
            .find(|n| n.root_seqno > after_seqno)
            .cloned()
    }
}

/// Key bundles, kept apart from the revision state so lookups do not
/// contend with writers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct KeyBundleStore {
    pub writers: HashMap<TlfId, HashMap<WriterKeyBundleId, WriterKeyBundle>>,
    pub readers: HashMap<TlfId, HashMap<ReaderKeyBundleId, ReaderKeyBundle>>,
}

impl KeyBundleStore {
    pub fn writer(&self, tlf: TlfId, id: WriterKeyBundleId) -> ServerResult<Option<WriterKeyBundle>> {
        if id.is_zero() {
            return Ok(None);
        }
        let wkb = self
            .writers
            .get(&tlf)
            .and_then(|m| m.get(&id))
            .ok_or_else(|| ServerError::NoSuchKeyBundle(format!("writer bundle {id}")))?;
        if wkb.id()? != id {
            return Err(ServerError::Codec(format!("writer bundle {id} does not match its content")));
        }
        Ok(Some(wkb.clone()))
    }

    pub fn reader(&self, tlf: TlfId, id: ReaderKeyBundleId) -> ServerResult<Option<ReaderKeyBundle>> {
        if id.is_zero() {
            return Ok(None);
        }
        let rkb = self
            .readers
            .get(&tlf)
            .and_then(|m| m.get(&id))
            .ok_or_else(|| ServerError::NoSuchKeyBundle(format!("reader bundle {id}")))?;
        if rkb.id()? != id {
            return Err(ServerError::Codec(format!("reader bundle {id} does not match its content")));
        }
        Ok(Some(rkb.clone()))
    }
}

/// Full snapshot written by the disk variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PersistedStore {
    pub state: StoreState,
    pub bundles: KeyBundleStore,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u8) -> StoredBlock {
        StoredBlock {
            encoded: vec![n],
            timestamp_ms: n as i64,
            version: MetadataVer::CURRENT,
        }
    }

    fn list(initial: i64, n: u8) -> BlockList {
        BlockList {
            initial_revision: Revision(initial),
            blocks: (0..n).map(block).collect(),
        }
    }

    #[test]
    fn test_range_clamps() {
        let l = list(5, 4); // revisions 5..=8
        assert_eq!(l.range(Revision(1), Revision(100)).len(), 4);
        assert_eq!(l.range(Revision(6), Revision(7)).len(), 2);
        assert_eq!(l.range(Revision(6), Revision(7))[0].encoded, vec![1]);
        assert!(l.range(Revision(9), Revision(12)).is_empty());
        assert!(l.range(Revision(1), Revision(4)).is_empty());
        assert!(l.range(Revision(7), Revision(6)).is_empty());
    }

    #[test]
    fn test_at() {
        let l = list(5, 4);
        assert_eq!(l.at(Revision(5)).unwrap().encoded, vec![0]);
        assert_eq!(l.at(Revision(8)).unwrap().encoded, vec![3]);
        assert!(l.at(Revision(4)).is_none());
        assert!(l.at(Revision(9)).is_none());
    }

    #[test]
    fn test_next_md_ordering() {
        use tlfmd_core::TlfType;
        let tlf = TlfId::random(TlfType::Public);
        let mut state = StoreState::default();
        let next = |seqno: i64| NextMd {
            kbfs_root: KbfsMerkleRoot {
                tree: MerkleTreeId::Public,
                seqno,
                timestamp_ms: 0,
                root_hash: [0; 32],
                nonce: [0; 24],
            },
            merkle_nodes: vec![],
            root_seqno: seqno,
        };
        state.publish_next_md(tlf, next(120));
        state.publish_next_md(tlf, next(101));
        assert_eq!(state.find_next_md(tlf, 100).unwrap().root_seqno, 101);
        assert_eq!(state.find_next_md(tlf, 101).unwrap().root_seqno, 120);
        assert!(state.find_next_md(tlf, 120).is_none());
    }

    #[test]
    fn test_state_serializes_to_json() {
        use tlfmd_core::TlfType;
        let tlf = TlfId::random(TlfType::Private);
        let mut state = StoreState::default();
        state.append(tlf, BranchId::NULL, Revision(1), block(1));
        state.set_branch(tlf, CryptPublicKey([1; 32]), BranchId::random());
        let json = serde_json::to_string(&PersistedStore {
            state,
            bundles: KeyBundleStore::default(),
        })
        .unwrap();
        let back: PersistedStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state.block_list(tlf, BranchId::NULL).unwrap().blocks.len(), 1);
        assert!(back.state.branch_for(tlf, &CryptPublicKey([1; 32])).is_some());
    }
}
