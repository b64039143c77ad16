//! Signer key verification, including historical team writership.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use tlfmd_core::{
    MergeStatus, RequestContext, Revision, RootMetadataSigned, TeamId, TeamMembership, TlfType, UserId,
    VerifyingKey,
};
use tlfmd_crypto::verify_signature;

use crate::error::{MdOpsError, OpsResult};
use crate::metadata::ImmutableRootMetadata;
use crate::ops::MdOps;
use crate::services::KeyStatus;

/// How much of the verification a read performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Full,
    /// Accept revoked keys without consulting Merkle evidence. Used for the
    /// reads a revocation check itself makes; such results are not cached.
    SkipRevocationCheck,
}

impl MdOps {
    /// Check that `key` belonged to `uid` when the block was written.
    /// Returns whether the result may be cached.
    pub(crate) async fn verify_key(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        uid: &UserId,
        key: &VerifyingKey,
        irmd: &ImmutableRootMetadata,
        mode: VerifyMode,
    ) -> OpsResult<bool> {
        let status = self
            .kbpki
            .key_status(ctx, uid, key, rmds.untrusted_server_timestamp)
            .await?;
        let info = match status {
            KeyStatus::Valid => return Ok(true),
            KeyStatus::Unknown => {
                return Err(self
                    .unverifiable_key(ctx, uid, key, "key does not belong to the user")
                    .await)
            }
            KeyStatus::Revoked(info) => self.caches.revocations.observe(*key, info),
        };

        if mode == VerifyMode::SkipRevocationCheck {
            debug!(tlf = %irmd.tlf_id(), revision = %irmd.revision(), "skipping revoked key verification");
            return Ok(false);
        }
        if info.merkle_root.seqno <= 0 {
            debug!(
                tlf = %irmd.tlf_id(),
                revision = %irmd.revision(),
                key = %key,
                "revoked key has no merkle anchor; accepting"
            );
            return Ok(true);
        }

        debug!(
            tlf = %irmd.tlf_id(),
            revision = %irmd.revision(),
            revoked_at_ms = info.revoked_at_ms,
            seqno = info.merkle_root.seqno,
            "revision signed by a revoked key; checking via merkle"
        );
        self.check_revision_came_before_merkle(ctx, rmds, key, irmd, &info.merkle_root, Some(info.revoked_at()))
            .await?;
        Ok(true)
    }

    async fn unverifiable_key(&self, ctx: &RequestContext, uid: &UserId, key: &VerifyingKey, reason: &str) -> MdOpsError {
        let name = match self.kbpki.normalized_username(ctx, uid).await {
            Ok(name) => name,
            Err(_) => format!("uid: {uid}"),
        };
        MdOpsError::UnverifiableKey {
            uid: name,
            key: *key,
            reason: reason.to_string(),
        }
    }

    /// Verify the key that signed the writer metadata. Copied writer
    /// metadata is checked against the revision that last wrote it.
    /// Returns whether the result may be cached.
    pub(crate) async fn verify_writer_key(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        irmd: &ImmutableRootMetadata,
        get_range_lock: Option<&Mutex<()>>,
        mode: VerifyMode,
    ) -> OpsResult<bool> {
        let md = &rmds.md;
        let writer_key = &md.writer_metadata_sig.verifying_key;
        if !md.is_writer_metadata_copied() {
            // The overall signer's key is verified separately.
            if *writer_key == rmds.sig_info.verifying_key {
                return Ok(true);
            }
            return self
                .verify_key(ctx, rmds, md.last_modifying_writer(), writer_key, irmd, mode)
                .await;
        }

        let tlf = md.tlf_id();
        if md.merge_status() != MergeStatus::Merged {
            return Err(MdOpsError::mismatch(
                tlf,
                md.revision,
                "copied writer metadata on an unmerged revision",
            ));
        }

        // One backwards search at a time per range.
        let _guard = match get_range_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut prev = md.revision.prev();
        while prev >= Revision::INITIAL {
            let prev_md = self
                .get_single_md(ctx, tlf, md.branch_id(), prev, MergeStatus::Merged, mode)
                .await?;
            if !prev_md.bare.is_writer_metadata_copied() {
                let payload = prev_md.bare.writer_metadata_payload()?;
                verify_signature(&payload, &md.writer_metadata_sig).map_err(|e| {
                    MdOpsError::mismatch(
                        tlf,
                        md.revision,
                        format!("copied writer signature does not cover revision {prev}: {e:#}"),
                    )
                })?;
                return Ok(true);
            }
            prev = prev.prev();
        }
        Err(MdOpsError::mismatch(
            tlf,
            md.revision,
            "no uncopied writer metadata precedes this revision",
        ))
    }
}

/// Team membership that also accepts writers who have since left the team,
/// as long as Merkle evidence shows the revision predates their removal.
pub(crate) struct MerkleTeamChecker<'a> {
    ops: &'a MdOps,
    rmds: &'a RootMetadataSigned,
    irmd: &'a ImmutableRootMetadata,
    mode: VerifyMode,
    not_cacheable: AtomicBool,
}

impl<'a> MerkleTeamChecker<'a> {
    pub(crate) fn new(
        ops: &'a MdOps,
        rmds: &'a RootMetadataSigned,
        irmd: &'a ImmutableRootMetadata,
        mode: VerifyMode,
    ) -> Self {
        Self {
            ops,
            rmds,
            irmd,
            mode,
            not_cacheable: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_cacheable(&self) -> bool {
        !self.not_cacheable.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<'a> TeamMembership for MerkleTeamChecker<'a> {
    async fn is_team_writer(
        &self,
        ctx: &RequestContext,
        team: &TeamId,
        uid: &UserId,
        key: &VerifyingKey,
    ) -> anyhow::Result<bool> {
        if self.ops.kbpki.is_team_writer(ctx, team, uid, key).await? {
            return Ok(true);
        }
        if self.mode == VerifyMode::SkipRevocationCheck {
            self.not_cacheable.store(true, Ordering::Relaxed);
            debug!(team = %team, uid = %uid, "skipping former team writer verification");
            return Ok(true);
        }

        debug!(team = %team, uid = %uid, "no longer a team writer; checking merkle");
        let tlf_type = self.irmd.bare.tlf_type().unwrap_or(TlfType::SingleTeam);
        match self
            .ops
            .kbpki
            .no_longer_team_writer(ctx, team, tlf_type, uid, key)
            .await?
        {
            Some(root) => {
                self.ops
                    .check_revision_came_before_merkle(ctx, self.rmds, key, self.irmd, &root, None)
                    .await
                    .map_err(anyhow::Error::new)?;
            }
            None => {
                debug!(team = %team, uid = %uid, "merkle root too old to check former writer");
            }
        }
        Ok(true)
    }

    async fn is_team_reader(&self, ctx: &RequestContext, team: &TeamId, uid: &UserId) -> anyhow::Result<bool> {
        if self.irmd.bare.tlf_type() == Some(TlfType::Public) {
            return Ok(true);
        }
        if self.ops.kbpki.is_team_reader(ctx, team, uid).await? {
            return Ok(true);
        }
        // Past readership cannot be proven yet; only the last modifying
        // user is checked here and writers are verified above.
        debug!(team = %team, uid = %uid, "accepting former team reader");
        Ok(true)
    }
}
