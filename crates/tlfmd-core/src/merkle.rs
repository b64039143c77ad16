//! Records exchanged with the global Merkle tree and the KBFS-internal trees
//! it commits to.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::clock::{from_unix_millis, to_unix_millis};
use crate::codec;
use crate::types::{MdId, Revision, TlfType};

/// The three KBFS trees, one per folder type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerkleTreeId {
    Private,
    Public,
    PrivateTeam,
}

impl MerkleTreeId {
    pub fn for_tlf_type(tlf_type: TlfType) -> Self {
        match tlf_type {
            TlfType::Private => MerkleTreeId::Private,
            TlfType::Public => MerkleTreeId::Public,
            TlfType::SingleTeam => MerkleTreeId::PrivateTeam,
        }
    }
}

impl fmt::Display for MerkleTreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MerkleTreeId::Private => "private",
            MerkleTreeId::Public => "public",
            MerkleTreeId::PrivateTeam => "private_team",
        };
        f.write_str(s)
    }
}

/// Reference to a global Merkle root by sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MerkleRootRef {
    pub seqno: i64,
    #[serde(with = "codec::b64")]
    pub hash_meta: Vec<u8>,
}

/// A published root of one KBFS tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbfsMerkleRoot {
    pub tree: MerkleTreeId,
    pub seqno: i64,
    /// Publication time, unix milliseconds.
    pub timestamp_ms: i64,
    pub root_hash: [u8; 32],
    /// Nonce used to encrypt the leaves under this root.
    pub nonce: [u8; 24],
}

impl KbfsMerkleRoot {
    pub fn timestamp(&self) -> SystemTime {
        from_unix_millis(self.timestamp_ms)
    }
}

/// The per-folder leaf: which revision was current at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub revision: Revision,
    pub md_id: MdId,
    pub timestamp_ms: i64,
}

/// A leaf as stored in the tree. Public folders carry the encoded leaf in
/// the clear, other folders an encryption under the folder's private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMerkleLeaf {
    pub version: u8,
    #[serde(with = "codec::b64")]
    pub encrypted_data: Vec<u8>,
}

/// Answer to "what was the first leaf for this folder after global root N".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextMd {
    pub kbfs_root: KbfsMerkleRoot,
    /// Proof path from the KBFS root down to the folder's leaf. The last node
    /// is the encoded (and possibly encrypted) leaf.
    #[serde(with = "codec::b64_vec")]
    pub merkle_nodes: Vec<Vec<u8>>,
    /// Global root that committed `kbfs_root`.
    pub root_seqno: i64,
}

/// What the identity layer knows about a key's revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedKeyInfo {
    pub revoked_at_ms: i64,
    pub merkle_root: MerkleRootRef,
    /// Whether `merkle_root` carries complete chain-of-custody data.
    pub filled_in: bool,
    pub reset_seqno: Option<i64>,
}

impl RevokedKeyInfo {
    pub fn revoked_at(&self) -> SystemTime {
        from_unix_millis(self.revoked_at_ms)
    }

    pub fn new(revoked_at: SystemTime, merkle_root: MerkleRootRef) -> Self {
        Self {
            revoked_at_ms: to_unix_millis(revoked_at),
            merkle_root,
            filled_in: false,
            reset_seqno: None,
        }
    }

    /// Whether `other` carries strictly more information than `self`.
    /// Filled-in beats not filled-in, and an anchored root beats none.
    pub fn is_refined_by(&self, other: &RevokedKeyInfo) -> bool {
        if self.filled_in != other.filled_in {
            return other.filled_in;
        }
        self.merkle_root.seqno <= 0 && other.merkle_root.seqno > 0
    }
}
