//! The signed metadata block and its bare (signed-over) content.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{InvalidMetadata, SuccessorError};
use crate::handle::TlfHandle;
use crate::types::{
    BranchId, KeyGen, MdId, MergeStatus, MetadataVer, ReaderKeyBundleId, Revision, TeamId, TlfId,
    TlfType, UserId, VerifyingKey, WriterKeyBundleId,
};

/// A detached signature plus the key that made it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub version: u8,
    #[serde(with = "codec::b64")]
    pub signature: Vec<u8>,
    pub verifying_key: VerifyingKey,
}

impl SignatureInfo {
    pub fn is_empty(&self) -> bool {
        self.signature.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterFlags {
    pub unmerged: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFlags {
    pub rekey: bool,
    pub writer_metadata_copied: bool,
    pub is_final: bool,
}

/// The part of a revision only writers may change. Signed separately so a
/// reader-driven rekey can carry it forward unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetadata {
    pub tlf_id: TlfId,
    pub branch_id: BranchId,
    pub writers: Vec<UserId>,
    pub team: Option<TeamId>,
    pub last_modifying_writer: UserId,
    #[serde(with = "codec::b64")]
    pub serialized_private_metadata: Vec<u8>,
    pub flags: WriterFlags,
    pub disk_usage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BareRootMetadata {
    pub version: MetadataVer,
    pub writer_metadata: WriterMetadata,
    pub writer_metadata_sig: SignatureInfo,
    pub revision: Revision,
    /// `MdId` of the preceding revision on this branch.
    pub prev_root: MdId,
    pub last_modifying_user: UserId,
    pub flags: MetadataFlags,
    pub readers: Vec<UserId>,
    pub latest_key_gen: KeyGen,
    pub writer_key_bundle_id: WriterKeyBundleId,
    pub reader_key_bundle_id: ReaderKeyBundleId,
}

impl BareRootMetadata {
    /// Revision 1 of a new folder.
    pub fn new_initial(tlf_id: TlfId, handle: &TlfHandle) -> Self {
        let latest_key_gen = if handle.tlf_type == TlfType::Public {
            KeyGen::PUBLIC
        } else {
            KeyGen::FIRST
        };
        Self {
            version: MetadataVer::CURRENT,
            writer_metadata: WriterMetadata {
                tlf_id,
                branch_id: BranchId::NULL,
                writers: handle.writers.clone(),
                team: handle.team.clone(),
                last_modifying_writer: UserId::new(""),
                serialized_private_metadata: Vec::new(),
                flags: WriterFlags::default(),
                disk_usage: 0,
            },
            writer_metadata_sig: SignatureInfo::default(),
            revision: Revision::INITIAL,
            prev_root: MdId::NULL,
            last_modifying_user: UserId::new(""),
            flags: MetadataFlags::default(),
            readers: handle.readers.clone(),
            latest_key_gen,
            writer_key_bundle_id: WriterKeyBundleId::default(),
            reader_key_bundle_id: ReaderKeyBundleId::default(),
        }
    }

    /// Next revision on the same branch, pointing back at `curr_id`.
    /// Signatures and rekey/copy flags are cleared.
    pub fn make_successor(&self, curr_id: MdId) -> Self {
        let mut next = self.clone();
        next.revision = self.revision.next();
        next.prev_root = curr_id;
        next.writer_metadata_sig = SignatureInfo::default();
        next.flags = MetadataFlags::default();
        next
    }

    pub fn tlf_id(&self) -> TlfId {
        self.writer_metadata.tlf_id
    }

    pub fn tlf_type(&self) -> Option<TlfType> {
        self.tlf_id().tlf_type()
    }

    pub fn branch_id(&self) -> BranchId {
        self.writer_metadata.branch_id
    }

    pub fn merge_status(&self) -> MergeStatus {
        if self.writer_metadata.flags.unmerged {
            MergeStatus::Unmerged
        } else {
            MergeStatus::Merged
        }
    }

    pub fn set_unmerged(&mut self, bid: BranchId) {
        self.writer_metadata.flags.unmerged = true;
        self.writer_metadata.branch_id = bid;
    }

    pub fn set_merged(&mut self) {
        self.writer_metadata.flags.unmerged = false;
        self.writer_metadata.branch_id = BranchId::NULL;
    }

    pub fn is_final(&self) -> bool {
        self.flags.is_final
    }

    pub fn is_rekey_set(&self) -> bool {
        self.flags.rekey
    }

    pub fn is_writer_metadata_copied(&self) -> bool {
        self.flags.writer_metadata_copied
    }

    pub fn team(&self) -> Option<&TeamId> {
        self.writer_metadata.team.as_ref()
    }

    pub fn last_modifying_writer(&self) -> &UserId {
        &self.writer_metadata.last_modifying_writer
    }

    /// User-folder writer check. Team folders defer to the identity layer.
    pub fn is_writer(&self, uid: &UserId) -> bool {
        self.writer_metadata.writers.contains(uid)
    }

    pub fn is_reader(&self, uid: &UserId) -> bool {
        self.tlf_type() == Some(TlfType::Public) || self.is_writer(uid) || self.readers.contains(uid)
    }

    /// Rebuild the handle this revision was written for.
    pub fn handle(&self) -> TlfHandle {
        match (self.tlf_type(), self.team()) {
            (Some(TlfType::SingleTeam), Some(team)) => TlfHandle::team(team.clone()),
            (Some(TlfType::Public), _) => TlfHandle::public(self.writer_metadata.writers.clone()),
            _ => TlfHandle::private(self.writer_metadata.writers.clone(), self.readers.clone()),
        }
    }

    pub fn md_id(&self) -> anyhow::Result<MdId> {
        Ok(MdId(codec::content_hash(self)?))
    }

    /// Bytes covered by the writer-metadata signature.
    pub fn writer_metadata_payload(&self) -> anyhow::Result<Vec<u8>> {
        codec::encode(&self.writer_metadata)
    }

    /// Structural checks that need no keys.
    pub fn check_well_formed(&self) -> Result<(), InvalidMetadata> {
        let tlf_type = self
            .tlf_type()
            .ok_or_else(|| InvalidMetadata(format!("unknown folder type in {}", self.tlf_id())))?;
        if !self.revision.is_valid() {
            return Err(InvalidMetadata(format!("invalid revision {}", self.revision)));
        }
        match self.merge_status() {
            MergeStatus::Merged if !self.branch_id().is_null() => {
                return Err(InvalidMetadata("merged revision with a non-null branch".into()));
            }
            MergeStatus::Unmerged if self.branch_id().is_null() => {
                return Err(InvalidMetadata("unmerged revision with a null branch".into()));
            }
            _ => {}
        }
        match tlf_type {
            TlfType::SingleTeam if self.team().is_none() => {
                return Err(InvalidMetadata("team folder without a team".into()));
            }
            TlfType::Private | TlfType::Public if self.writer_metadata.writers.is_empty() => {
                return Err(InvalidMetadata("folder without writers".into()));
            }
            _ => {}
        }
        if tlf_type == TlfType::Public && self.latest_key_gen != KeyGen::PUBLIC {
            return Err(InvalidMetadata(format!(
                "public folder with key generation {}",
                self.latest_key_gen
            )));
        }
        if self.last_modifying_user.0.is_empty() {
            return Err(InvalidMetadata("no last modifying user".into()));
        }
        if !self.is_writer_metadata_copied() && self.writer_metadata_sig.is_empty() {
            return Err(InvalidMetadata("missing writer metadata signature".into()));
        }
        Ok(())
    }

    /// Whether `next` may directly follow `self`, whose ID is `curr_id`.
    pub fn check_valid_successor(&self, curr_id: &MdId, next: &BareRootMetadata) -> Result<(), SuccessorError> {
        if self.is_final() {
            return Err(SuccessorError::Finalized {
                revision: self.revision,
            });
        }
        if self.tlf_id() != next.tlf_id() {
            return Err(SuccessorError::TlfMismatch {
                curr: self.tlf_id(),
                next: next.tlf_id(),
            });
        }
        if next.revision != self.revision.next() {
            return Err(SuccessorError::RevisionMismatch {
                curr: self.revision,
                next: next.revision,
            });
        }
        if next.prev_root != *curr_id {
            return Err(SuccessorError::PrevRootMismatch {
                expected: *curr_id,
                actual: next.prev_root,
            });
        }
        let (curr_status, next_status) = (self.merge_status(), next.merge_status());
        if curr_status == next_status && self.branch_id() != next.branch_id() {
            return Err(SuccessorError::BranchMismatch {
                curr: self.branch_id(),
                next: next.branch_id(),
            });
        }
        if curr_status == MergeStatus::Unmerged && next_status == MergeStatus::Merged {
            return Err(SuccessorError::UnmergedToMerged);
        }
        Ok(())
    }
}

/// Wire form of one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadataSigned {
    pub md: BareRootMetadata,
    pub sig_info: SignatureInfo,
    /// Assigned by the store on read; not covered by any signature.
    #[serde(skip)]
    pub untrusted_server_timestamp: Option<SystemTime>,
}

impl RootMetadataSigned {
    pub fn new(md: BareRootMetadata, sig_info: SignatureInfo) -> Self {
        Self {
            md,
            sig_info,
            untrusted_server_timestamp: None,
        }
    }

    /// Bytes covered by the overall signature.
    pub fn signed_payload(&self) -> anyhow::Result<Vec<u8>> {
        codec::encode(&self.md)
    }

    pub fn md_id(&self) -> anyhow::Result<MdId> {
        self.md.md_id()
    }

    pub fn revision(&self) -> Revision {
        self.md.revision
    }
}

/// Description of block changes made by a revision. Either carried inline
/// (`ops`) or moved out-of-band behind `pointer`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChanges {
    pub pointer: Option<String>,
    #[serde(with = "codec::b64_vec")]
    pub ops: Vec<Vec<u8>>,
}

impl BlockChanges {
    pub fn size_estimate(&self) -> usize {
        self.ops.iter().map(Vec::len).sum()
    }

    pub fn is_embedded(&self) -> bool {
        self.pointer.is_none()
    }
}

/// Decrypted private section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMetadata {
    /// Encoded root directory entry; opaque to this crate.
    #[serde(with = "codec::b64")]
    pub root_dir: Vec<u8>,
    /// Folder private key for this key generation, used to read Merkle leaves.
    pub tlf_private_key: Option<[u8; 32]>,
    pub changes: BlockChanges,
}
