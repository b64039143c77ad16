//! Proof that a revision signed by a since-revoked key was written before
//! the revocation.
//!
//! The store is not trusted to say when a key stopped being valid. Instead
//! the revocation is anchored at a global Merkle root; the first KBFS root
//! published after it commits to the folder revision that was current at
//! that point. A revision at or below that checkpoint, chained to it by
//! verified successor links, provably came first.
//!
//! Every read issued from here uses [`VerifyMode::SkipRevocationCheck`] so a
//! chain of revoked signers cannot recurse without bound.

use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use tlfmd_core::clock::{from_unix_millis, signed_millis_between, to_unix_millis};
use tlfmd_core::{
    codec, EncryptedMerkleLeaf, KbfsMerkleRoot, MerkleLeaf, MerkleRootRef, MerkleTreeId, NextMd, RequestContext,
    RootMetadataSigned, TlfType, VerifyingKey,
};

use crate::error::{MdOpsError, OpsResult};
use crate::metadata::ImmutableRootMetadata;
use crate::ops::MdOps;
use crate::verify::VerifyMode;

const SKIP: VerifyMode = VerifyMode::SkipRevocationCheck;

impl MdOps {
    /// Fail unless `irmd` provably predates global Merkle root `root`.
    /// With `time_to_check` set, the KBFS root following the anchor must
    /// also have been published within the allowed gap after that time.
    pub(crate) fn check_revision_came_before_merkle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        rmds: &'a RootMetadataSigned,
        key: &'a VerifyingKey,
        irmd: &'a ImmutableRootMetadata,
        root: &'a MerkleRootRef,
        time_to_check: Option<SystemTime>,
    ) -> BoxFuture<'a, OpsResult<()>> {
        async move {
            let tlf = rmds.md.tlf_id();
            let next = match self.caches.merkle.next_md(tlf, root.seqno) {
                Some(next) => Some(next),
                None => {
                    debug!(tlf = %tlf, seqno = root.seqno, "finding next md after global root");
                    let next = self.server.find_next_md(ctx, tlf, root.seqno).await?;
                    if let Some(next) = &next {
                        self.caches.merkle.put_next_md(tlf, root.seqno, next.clone());
                    }
                    next
                }
            };

            let next = match next {
                Some(next) if !next.merkle_nodes.is_empty() => next,
                _ => return self.check_without_leaf(ctx, irmd).await,
            };
            self.check_against_leaf(ctx, key, irmd, &next, time_to_check).await
        }
        .boxed()
    }

    /// No KBFS root follows the anchor yet. Accept only if the latest
    /// publications are recent and the chain up to the head is intact.
    async fn check_without_leaf(&self, ctx: &RequestContext, irmd: &ImmutableRootMetadata) -> OpsResult<()> {
        let tlf = irmd.tlf_id();
        debug!(tlf = %tlf, "no kbfs merkle root published since the global root");

        let (_, latest_root_time) = self.merkle.current_root(ctx).await?;
        let tree = MerkleTreeId::for_tlf_type(irmd.bare.tlf_type().unwrap_or(TlfType::Private));
        let latest_kbfs_root = self.server.get_merkle_root_latest(ctx, tree).await?;

        let offset_ms = self.server.offset_from_server_time().unwrap_or(0);
        let max_ms = millis(self.config.max_server_clock_offset());
        if offset_ms.abs() > max_ms {
            return Err(MdOpsError::ServerClockOffsetTooLarge { offset_ms, max_ms });
        }
        let server_now = from_unix_millis(to_unix_millis(self.clock.now()) - offset_ms);
        check_merkle_times(
            latest_root_time,
            latest_kbfs_root.as_ref(),
            server_now,
            millis(self.config.max_allowed_merkle_gap()),
        )?;

        let chain = self
            .get_merged_updates(ctx, tlf, irmd.revision().next(), None, SKIP)
            .await?;
        if let Some(first) = chain.first() {
            irmd.check_valid_successor(first)
                .map_err(|e| MdOpsError::mismatch(tlf, first.revision(), e))?;
        }
        Ok(())
    }

    async fn check_against_leaf(
        &self,
        ctx: &RequestContext,
        key: &VerifyingKey,
        irmd: &ImmutableRootMetadata,
        next: &NextMd,
        time_to_check: Option<SystemTime>,
    ) -> OpsResult<()> {
        let tlf = irmd.tlf_id();
        let kbfs_root = &next.kbfs_root;

        self.merkle
            .verify_kbfs_root(ctx, kbfs_root, next.root_seqno, &next.merkle_nodes)
            .await
            .map_err(|e| MdOpsError::UntrustedMerkleRoot {
                seqno: next.root_seqno,
                reason: format!("{e:#}"),
            })?;

        if let Some(event) = time_to_check {
            if event > self.config.merkle_gap_enforcement_start() {
                // The roots must follow the event, within the gap.
                check_merkle_times(
                    kbfs_root.timestamp(),
                    Some(kbfs_root),
                    event,
                    -millis(self.config.max_allowed_merkle_gap()),
                )?;
            }
        }

        debug!(
            tlf = %tlf,
            kbfs_seqno = kbfs_root.seqno,
            root_seqno = next.root_seqno,
            "next kbfs merkle root located"
        );

        let leaf_bytes = next.merkle_nodes.last().map(Vec::as_slice).unwrap_or_default();
        let leaf = self.make_merkle_leaf(ctx, irmd, kbfs_root, leaf_bytes).await?;

        if irmd.revision() > leaf.revision {
            return Err(MdOpsError::WrittenAfterRevoke {
                tlf: tlf.to_string(),
                revision: irmd.revision(),
                limit: leaf.revision,
                key: *key,
            });
        }
        if irmd.revision() == leaf.revision {
            return Ok(());
        }

        let chain_end = self.caches.merkle.validated_chain_start(tlf, leaf.revision);
        if chain_end <= irmd.revision() {
            return Ok(());
        }

        debug!(
            tlf = %tlf,
            start = %irmd.revision().next(),
            end = %chain_end,
            "validating chain up to merkle leaf"
        );
        let chain = self
            .get_merged_updates(ctx, tlf, irmd.revision().next(), Some(chain_end), SKIP)
            .await?;
        let Some(first) = chain.first() else {
            return Err(MdOpsError::MissingRevisions {
                tlf: tlf.to_string(),
                reason: format!(
                    "no revisions after {} although the merkle tree includes revision {}",
                    irmd.revision(),
                    leaf.revision
                ),
            });
        };
        if chain.last().map(|last| last.revision()) != Some(chain_end) {
            return Err(MdOpsError::MissingRevisions {
                tlf: tlf.to_string(),
                reason: format!("chain from {} stops before revision {chain_end}", irmd.revision()),
            });
        }
        irmd.check_valid_successor(first)
            .map_err(|e| MdOpsError::mismatch(tlf, first.revision(), e))?;

        self.caches
            .merkle
            .record_validated_chain(tlf, leaf.revision, irmd.revision());
        Ok(())
    }

    async fn make_merkle_leaf(
        &self,
        ctx: &RequestContext,
        irmd: &ImmutableRootMetadata,
        kbfs_root: &KbfsMerkleRoot,
        leaf_bytes: &[u8],
    ) -> OpsResult<MerkleLeaf> {
        match irmd.bare.tlf_type() {
            Some(TlfType::Public) => Ok(codec::decode(leaf_bytes)?),
            Some(TlfType::SingleTeam) => {
                let eleaf: EncryptedMerkleLeaf = codec::decode(leaf_bytes)?;
                let team = irmd.bare.team().ok_or_else(|| {
                    MdOpsError::mismatch(irmd.tlf_id(), irmd.revision(), "team folder without a team")
                })?;
                debug!(team = %team, "decrypting merkle leaf through the team");
                let plaintext = self
                    .team_crypto
                    .decrypt_team_merkle_leaf(ctx, team, &eleaf, &kbfs_root.nonce)
                    .await?;
                Ok(codec::decode(&plaintext)?)
            }
            _ => {
                let eleaf: EncryptedMerkleLeaf = codec::decode(leaf_bytes)?;
                self.decrypt_merkle_leaf(ctx, irmd, kbfs_root, &eleaf).await
            }
        }
    }

    /// The leaf key lives only in the private sections of one key
    /// generation, which must be at or after `irmd`. Try each generation
    /// in turn, walking forward in batches.
    async fn decrypt_merkle_leaf(
        &self,
        ctx: &RequestContext,
        irmd: &ImmutableRootMetadata,
        kbfs_root: &KbfsMerkleRoot,
        eleaf: &EncryptedMerkleLeaf,
    ) -> OpsResult<MerkleLeaf> {
        let tlf = irmd.tlf_id();
        let batch = self.batch_size();
        let mut curr = irmd.clone();
        loop {
            let key_gen = curr.key_gen();
            let private_key = curr.data.tlf_private_key.ok_or_else(|| MdOpsError::KeyGenerationNotFound {
                tlf: tlf.to_string(),
                key_gen,
            })?;
            match tlfmd_crypto::decrypt_merkle_leaf(&private_key, &tlf, &kbfs_root.nonce, eleaf) {
                Ok(leaf) => return Ok(leaf),
                Err(e) => debug!(tlf = %tlf, key_gen = %key_gen, "key generation did not open the leaf: {e:#}"),
            }

            loop {
                ctx.check()?;
                let start = curr.revision().next();
                let mut later = self
                    .get_merged_updates(ctx, tlf, start, Some(start + (batch as i64 - 1)), SKIP)
                    .await?;
                if let Some(found) = later.iter().find(|r| r.key_gen() > key_gen) {
                    debug!(tlf = %tlf, revision = %found.revision(), key_gen = %found.key_gen(), "found newer key generation");
                    curr = found.clone();
                    break;
                }
                let short = later.len() < batch;
                match later.pop() {
                    Some(last) if !short => curr = last,
                    _ => {
                        return Err(MdOpsError::Decryption {
                            tlf: tlf.to_string(),
                            revision: irmd.revision(),
                            reason: "no key generation opens the merkle leaf".to_string(),
                        })
                    }
                }
            }
        }
    }
}

fn millis(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Compare an event against the latest global and KBFS root times. A
/// positive `allowed_gap_ms` bounds how long before the event the roots
/// were published; a negative one requires them after the event, within
/// the absolute gap.
pub(crate) fn check_merkle_times(
    latest_root_time: SystemTime,
    kbfs_root: Option<&KbfsMerkleRoot>,
    time_to_check: SystemTime,
    allowed_gap_ms: i64,
) -> OpsResult<()> {
    let latest_kbfs_time = kbfs_root.map(KbfsMerkleRoot::timestamp).unwrap_or(UNIX_EPOCH);
    let mut root_gap = signed_millis_between(time_to_check, latest_root_time);
    let mut kbfs_gap = signed_millis_between(time_to_check, latest_kbfs_time);
    let mut bound = allowed_gap_ms;

    if allowed_gap_ms < 0 {
        if root_gap > 0 || kbfs_gap > 0 {
            return Err(MdOpsError::MerkleGapTooLarge {
                reason: format!(
                    "roots published before the event: event={}ms root={}ms kbfs={}ms",
                    to_unix_millis(time_to_check),
                    to_unix_millis(latest_root_time),
                    to_unix_millis(latest_kbfs_time)
                ),
            });
        }
        root_gap = -root_gap;
        kbfs_gap = -kbfs_gap;
        bound = -bound;
    }

    if root_gap > bound {
        return Err(MdOpsError::MerkleGapTooLarge {
            reason: format!("global root is {root_gap}ms from the event (max {bound}ms)"),
        });
    }
    if kbfs_gap > bound {
        return Err(MdOpsError::MerkleGapTooLarge {
            reason: format!("kbfs root is {kbfs_gap}ms from the event (max {bound}ms)"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    fn kbfs_root_at(t: SystemTime) -> KbfsMerkleRoot {
        KbfsMerkleRoot {
            tree: MerkleTreeId::Public,
            seqno: 1,
            timestamp_ms: to_unix_millis(t),
            root_hash: [0; 32],
            nonce: [0; 24],
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_recent_roots_pass() {
        let now = at(1_700_000_000);
        let root = now - Duration::from_secs(600);
        check_merkle_times(root, Some(&kbfs_root_at(root)), now, 2 * HOUR_MS).unwrap();
    }

    #[test]
    fn test_stale_kbfs_root_fails() {
        let now = at(1_700_000_000);
        let global = now - Duration::from_secs(60);
        let kbfs = now - Duration::from_secs(3 * 3600);
        let err = check_merkle_times(global, Some(&kbfs_root_at(kbfs)), now, 2 * HOUR_MS).unwrap_err();
        assert!(matches!(err, MdOpsError::MerkleGapTooLarge { .. }));
    }

    #[test]
    fn test_missing_kbfs_root_fails() {
        let now = at(1_700_000_000);
        let err = check_merkle_times(now, None, now, 2 * HOUR_MS).unwrap_err();
        assert!(matches!(err, MdOpsError::MerkleGapTooLarge { .. }));
    }

    #[test]
    fn test_reverse_gap_requires_roots_after_event() {
        let event = at(1_700_000_000);
        let after = event + Duration::from_secs(1800);
        check_merkle_times(after, Some(&kbfs_root_at(after)), event, -2 * HOUR_MS).unwrap();

        let before = event - Duration::from_secs(1);
        let err = check_merkle_times(before, Some(&kbfs_root_at(before)), event, -2 * HOUR_MS).unwrap_err();
        assert!(matches!(err, MdOpsError::MerkleGapTooLarge { .. }));

        let much_later = event + Duration::from_secs(3 * 3600);
        let err =
            check_merkle_times(much_later, Some(&kbfs_root_at(much_later)), event, -2 * HOUR_MS).unwrap_err();
        assert!(matches!(err, MdOpsError::MerkleGapTooLarge { .. }));
    }
}
