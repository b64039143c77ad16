//! Collaborators the engine consumes: the identity layer, the global
//! Merkle service and team crypto.

use std::time::SystemTime;

use async_trait::async_trait;
use tlfmd_core::{
    EncryptedMerkleLeaf, KbfsMerkleRoot, MerkleRootRef, RequestContext, RevokedKeyInfo, SessionSource, TeamId,
    TeamMembership, TlfType, UserId, VerifyingKey,
};

/// Status of a verifying key at a given point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    Valid,
    Revoked(RevokedKeyInfo),
    /// The identity layer has never seen this key for this user.
    Unknown,
}

/// Identity layer: sessions, current team membership, key history.
#[async_trait]
pub trait KeyPki: SessionSource + TeamMembership {
    /// Whether `key` belonged to `uid` at `at`. A key revoked since then is
    /// reported as `Revoked` with the record needed to prove ordering.
    async fn key_status(
        &self,
        ctx: &RequestContext,
        uid: &UserId,
        key: &VerifyingKey,
        at: Option<SystemTime>,
    ) -> anyhow::Result<KeyStatus>;

    /// Global Merkle root at which `uid`/`key` stopped being a writer of
    /// `team`. `None` when the change predates Merkle anchoring.
    async fn no_longer_team_writer(
        &self,
        ctx: &RequestContext,
        team: &TeamId,
        tlf_type: TlfType,
        uid: &UserId,
        key: &VerifyingKey,
    ) -> anyhow::Result<Option<MerkleRootRef>>;

    async fn normalized_username(&self, ctx: &RequestContext, uid: &UserId) -> anyhow::Result<String>;
}

/// The global append-only Merkle tree.
#[async_trait]
pub trait MerkleService: Send + Sync {
    /// Latest global root and the time it was published.
    async fn current_root(&self, ctx: &RequestContext) -> anyhow::Result<(MerkleRootRef, SystemTime)>;

    /// Check that `kbfs_root` is committed to by global root `root_seqno`
    /// along the proof path `nodes`.
    async fn verify_kbfs_root(
        &self,
        ctx: &RequestContext,
        kbfs_root: &KbfsMerkleRoot,
        root_seqno: i64,
        nodes: &[Vec<u8>],
    ) -> anyhow::Result<()>;
}

/// Team-held decryption of Merkle leaves for team folders.
#[async_trait]
pub trait TeamCrypto: Send + Sync {
    async fn decrypt_team_merkle_leaf(
        &self,
        ctx: &RequestContext,
        team: &TeamId,
        leaf: &EncryptedMerkleLeaf,
        nonce: &[u8; 24],
    ) -> anyhow::Result<Vec<u8>>;
}

/// Team crypto for deployments without team folders.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTeamCrypto;

#[async_trait]
impl TeamCrypto for NoTeamCrypto {
    async fn decrypt_team_merkle_leaf(
        &self,
        _ctx: &RequestContext,
        team: &TeamId,
        _leaf: &EncryptedMerkleLeaf,
        _nonce: &[u8; 24],
    ) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no team crypto configured for team {team}")
    }
}
