//! The verification and publication engine.
//!
//! Reads turn untrusted signed blocks from the store into
//! [`ImmutableRootMetadata`]: bundles are fetched, the private section is
//! decrypted, signatures and signer keys are verified (falling back to
//! Merkle evidence for revoked keys) and the result is cached. Writes
//! encrypt, sign and submit a [`RootMetadata`] working copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tlfmd_core::clock::{from_unix_millis, to_unix_millis};
use tlfmd_core::config::OpsConfig;
use tlfmd_core::{
    codec, BranchId, Clock, KeyBundles, LockContext, LockId, MdPriority, MergeStatus, RequestContext, Revision,
    RootMetadataSigned, SystemClock, TlfHandle, TlfId, TlfType,
};
use tlfmd_crypto::SigningIdentity;
use tlfmd_server::validate::is_valid_and_signed;
use tlfmd_server::{MdServer, ServerError};

use crate::cache::{IdCache, KeyBundleCache, MdCache};
use crate::error::{MdOpsError, OpsResult};
use crate::keys::KeyManager;
use crate::merkle_cache::{MerkleChainCache, RevocationCache};
use crate::metadata::{ImmutableRootMetadata, RootMetadata};
use crate::services::{KeyPki, MerkleService, NoTeamCrypto, TeamCrypto};
use crate::verify::{MerkleTeamChecker, VerifyMode};

/// Caches owned by one engine. Construct them up front to share or inspect
/// them; they live as long as the engine holding them.
#[derive(Clone, Default)]
pub struct OpsCaches {
    pub md: Arc<MdCache>,
    pub ids: Arc<IdCache>,
    pub bundles: Arc<KeyBundleCache>,
    pub merkle: Arc<MerkleChainCache>,
    pub revocations: Arc<RevocationCache>,
}

type BranchSlot = Arc<Mutex<Option<BranchId>>>;

pub struct MdOps {
    pub(crate) server: Arc<dyn MdServer>,
    pub(crate) kbpki: Arc<dyn KeyPki>,
    pub(crate) merkle: Arc<dyn MerkleService>,
    pub(crate) team_crypto: Arc<dyn TeamCrypto>,
    pub(crate) keys: Arc<dyn KeyManager>,
    pub(crate) signer: SigningIdentity,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: OpsConfig,
    pub(crate) caches: OpsCaches,
    // Unmerged branch this engine writes to, per folder.
    branches: SyncMutex<HashMap<TlfId, BranchSlot>>,
}

pub struct MdOpsBuilder {
    server: Arc<dyn MdServer>,
    kbpki: Arc<dyn KeyPki>,
    merkle: Arc<dyn MerkleService>,
    keys: Arc<dyn KeyManager>,
    signer: SigningIdentity,
    team_crypto: Arc<dyn TeamCrypto>,
    clock: Arc<dyn Clock>,
    config: OpsConfig,
    caches: OpsCaches,
}

impl MdOpsBuilder {
    pub fn team_crypto(mut self, team_crypto: Arc<dyn TeamCrypto>) -> Self {
        self.team_crypto = team_crypto;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: OpsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn caches(mut self, caches: OpsCaches) -> Self {
        self.caches = caches;
        self
    }

    pub fn build(self) -> MdOps {
        MdOps {
            server: self.server,
            kbpki: self.kbpki,
            merkle: self.merkle,
            team_crypto: self.team_crypto,
            keys: self.keys,
            signer: self.signer,
            clock: self.clock,
            config: self.config,
            caches: self.caches,
            branches: SyncMutex::new(HashMap::new()),
        }
    }
}

impl MdOps {
    pub fn builder(
        server: Arc<dyn MdServer>,
        kbpki: Arc<dyn KeyPki>,
        merkle: Arc<dyn MerkleService>,
        keys: Arc<dyn KeyManager>,
        signer: SigningIdentity,
    ) -> MdOpsBuilder {
        MdOpsBuilder {
            server,
            kbpki,
            merkle,
            keys,
            signer,
            team_crypto: Arc::new(NoTeamCrypto),
            clock: Arc::new(SystemClock),
            config: OpsConfig::default(),
            caches: OpsCaches::default(),
        }
    }

    pub fn caches(&self) -> &OpsCaches {
        &self.caches
    }

    pub fn config(&self) -> &OpsConfig {
        &self.config
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.config.max_mds_at_a_time.max(1)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Resolve `handle` and fetch its head. A folder without revisions
    /// yields `(id, None)`.
    pub async fn get_for_handle(
        &self,
        ctx: &RequestContext,
        handle: &TlfHandle,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> OpsResult<(TlfId, Option<ImmutableRootMetadata>)> {
        if handle.tlf_type == TlfType::Private && handle.team.is_none() {
            let session = self.kbpki.current_session(ctx).await?;
            if !handle.is_reader(&session.uid) {
                return Err(MdOpsError::ReadAccess {
                    user: session.uid,
                    tlf: handle.to_string(),
                });
            }
        }

        debug!(handle = %handle, status = %status, "get for handle");
        let (id, rmds) = self
            .server
            .get_for_handle(ctx, handle, status, lock_before_get)
            .await?;
        let Some(rmds) = rmds else {
            debug!(tlf = %id, status = %status, "no revisions yet");
            return Ok((id, None));
        };

        let md_handle = rmds.md.handle();
        if md_handle.tlf_type != handle.tlf_type || md_handle.canonical_name() != handle.canonical_name() {
            return Err(MdOpsError::HandleMismatch {
                expected: handle.to_string(),
                actual: md_handle.to_string(),
            });
        }

        let irmd = self
            .process_signed_md(ctx, id, BranchId::NULL, rmds, None, VerifyMode::Full)
            .await?;
        debug!(tlf = %id, revision = %irmd.revision(), "get for handle done");
        Ok((id, Some(irmd)))
    }

    /// Folder ID for `handle`, or `None` when the store wants an implicit
    /// team instead of a classic folder.
    pub async fn get_id_for_handle(
        &self,
        ctx: &RequestContext,
        handle: &TlfHandle,
    ) -> OpsResult<Option<TlfId>> {
        let key = handle.store_key();
        if let Some(id) = self.caches.ids.get(&key) {
            return Ok(Some(id));
        }
        match self.get_for_handle(ctx, handle, MergeStatus::Merged, None).await {
            Ok((id, _)) => {
                self.caches.ids.put(key, id);
                Ok(Some(id))
            }
            Err(MdOpsError::Server(ServerError::ClassicTlfDoesNotExist)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_for_tlf(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        lock_before_get: Option<LockId>,
    ) -> OpsResult<Option<ImmutableRootMetadata>> {
        self.get_head(ctx, id, BranchId::NULL, MergeStatus::Merged, lock_before_get)
            .await
    }

    /// Head of this device's unmerged branch. A null `bid` asks the store
    /// for whatever branch the device has.
    pub async fn get_unmerged_for_tlf(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
    ) -> OpsResult<Option<ImmutableRootMetadata>> {
        self.get_head(ctx, id, bid, MergeStatus::Unmerged, None).await
    }

    pub async fn get_for_tlf_by_time(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        server_time: SystemTime,
    ) -> OpsResult<ImmutableRootMetadata> {
        debug!(tlf = %id, server_time = to_unix_millis(server_time), "get for tlf by time");
        let rmds = self.server.get_for_tlf_by_time(ctx, id, server_time).await?;
        let irmd = self
            .process_signed_md(ctx, id, BranchId::NULL, rmds, None, VerifyMode::Full)
            .await?;
        debug!(tlf = %id, revision = %irmd.revision(), "get for tlf by time done");
        Ok(irmd)
    }

    pub async fn get_range(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        start: Revision,
        stop: Revision,
        lock_before_get: Option<LockId>,
    ) -> OpsResult<Vec<ImmutableRootMetadata>> {
        self.fetch_range(
            ctx,
            id,
            BranchId::NULL,
            MergeStatus::Merged,
            start,
            stop,
            lock_before_get,
            VerifyMode::Full,
        )
        .await
    }

    pub async fn get_unmerged_range(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        start: Revision,
        stop: Revision,
    ) -> OpsResult<Vec<ImmutableRootMetadata>> {
        self.fetch_range(ctx, id, bid, MergeStatus::Unmerged, start, stop, None, VerifyMode::Full)
            .await
    }

    pub async fn get_latest_handle_for_tlf(
        &self,
        ctx: &RequestContext,
        id: TlfId,
    ) -> OpsResult<Option<TlfHandle>> {
        Ok(self.server.get_latest_handle_for_tlf(ctx, id).await?)
    }

    async fn get_head(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> OpsResult<Option<ImmutableRootMetadata>> {
        let Some(rmds) = self
            .server
            .get_for_tlf(ctx, id, bid, status, lock_before_get)
            .await?
        else {
            return Ok(None);
        };
        let irmd = self
            .process_signed_md(ctx, id, bid, rmds, None, VerifyMode::Full)
            .await?;
        Ok(Some(irmd))
    }

    // ── Range processing ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn fetch_range(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
        lock_before_get: Option<LockId>,
        mode: VerifyMode,
    ) -> OpsResult<Vec<ImmutableRootMetadata>> {
        let rmdses = self
            .server
            .get_range(ctx, id, bid, status, start, stop, lock_before_get)
            .await?;
        self.process_range(ctx, id, bid, rmdses, mode).await
    }

    /// Verify a batch of blocks on a bounded worker pool, then check the
    /// successor links in revision order.
    async fn process_range(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        rmdses: Vec<RootMetadataSigned>,
        mode: VerifyMode,
    ) -> OpsResult<Vec<ImmutableRootMetadata>> {
        let Some(first) = rmdses.first() else {
            return Ok(Vec::new());
        };
        let start = first.revision();
        let workers = rmdses.len().min(self.batch_size());
        let get_range_lock = Mutex::new(());
        let lock = &get_range_lock;

        let pending: Vec<_> = rmdses
            .into_iter()
            .map(|rmds| self.process_signed_md(ctx, id, bid, rmds, Some(lock), mode))
            .collect();
        let mut irmds: Vec<ImmutableRootMetadata> = stream::iter(pending)
            .buffer_unordered(workers)
            .try_collect()
            .await?;
        irmds.sort_by_key(|irmd| irmd.revision());

        for (i, irmd) in irmds.iter().enumerate() {
            let expected = start + i as i64;
            if irmd.revision() != expected {
                return Err(MdOpsError::MissingRevisions {
                    tlf: id.to_string(),
                    reason: format!("expected revision {expected}, got {}", irmd.revision()),
                });
            }
        }
        for pair in irmds.windows(2) {
            pair[0]
                .check_valid_successor(&pair[1])
                .map_err(|e| MdOpsError::mismatch(id, pair[1].revision(), e))?;
        }
        Ok(irmds)
    }

    /// Merged revisions from `start` up to `end` (or the head), fetched in
    /// batches. Links across batch boundaries are checked too.
    pub(crate) async fn get_merged_updates(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        start: Revision,
        end: Option<Revision>,
        mode: VerifyMode,
    ) -> OpsResult<Vec<ImmutableRootMetadata>> {
        let batch = self.batch_size() as i64;
        let mut updates: Vec<ImmutableRootMetadata> = Vec::new();
        let mut start = start;
        loop {
            ctx.check()?;
            let mut stop = start + (batch - 1);
            if let Some(end) = end {
                stop = stop.min(end);
            }
            if stop < start {
                break;
            }
            let got = self
                .fetch_range(ctx, id, BranchId::NULL, MergeStatus::Merged, start, stop, None, mode)
                .await?;
            if let (Some(prev), Some(first)) = (updates.last(), got.first()) {
                prev.check_valid_successor(first)
                    .map_err(|e| MdOpsError::mismatch(id, first.revision(), e))?;
            }
            let short = (got.len() as i64) < stop.0 - start.0 + 1;
            if let Some(last) = got.last() {
                start = last.revision().next();
            }
            updates.extend(got);
            if short {
                break;
            }
        }
        Ok(updates)
    }

    /// One revision, cache-first.
    pub(crate) fn get_single_md<'a>(
        &'a self,
        ctx: &'a RequestContext,
        id: TlfId,
        bid: BranchId,
        rev: Revision,
        status: MergeStatus,
        mode: VerifyMode,
    ) -> BoxFuture<'a, OpsResult<ImmutableRootMetadata>> {
        async move {
            if let Some(irmd) = self.caches.md.get(id, rev, bid) {
                return Ok(irmd);
            }
            let mut got = self.fetch_range(ctx, id, bid, status, rev, rev, None, mode).await?;
            match got.pop() {
                Some(irmd) if irmd.revision() == rev => Ok(irmd),
                _ => Err(MdOpsError::MissingRevisions {
                    tlf: id.to_string(),
                    reason: format!("revision {rev} not found"),
                }),
            }
        }
        .boxed()
    }

    // ── Verification ────────────────────────────────────────────────────

    async fn process_signed_md(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        rmds: RootMetadataSigned,
        get_range_lock: Option<&Mutex<()>>,
        mode: VerifyMode,
    ) -> OpsResult<ImmutableRootMetadata> {
        let tlf = rmds.md.tlf_id();
        if tlf != id {
            return Err(MdOpsError::mismatch(
                id,
                rmds.revision(),
                format!("block carries unexpected folder id {tlf}"),
            ));
        }
        if !bid.is_null() && bid != rmds.md.branch_id() {
            return Err(MdOpsError::mismatch(
                id,
                rmds.revision(),
                format!("block carries unexpected branch {}, expected {bid}", rmds.md.branch_id()),
            ));
        }
        let bundles = self.get_key_bundles(ctx, &rmds.md).await?;
        self.process_metadata(ctx, rmds, bundles, get_range_lock, mode).await
    }

    async fn process_metadata(
        &self,
        ctx: &RequestContext,
        rmds: RootMetadataSigned,
        bundles: Option<KeyBundles>,
        get_range_lock: Option<&Mutex<()>>,
        mode: VerifyMode,
    ) -> OpsResult<ImmutableRootMetadata> {
        let tlf = rmds.md.tlf_id();
        let revision = rmds.revision();
        let data = self.decrypt_private(ctx, &rmds.md, bundles.as_ref()).await?;
        let md_id = rmds.md_id()?;

        let server_time = rmds.untrusted_server_timestamp.unwrap_or_else(|| self.clock.now());
        let local_timestamp = match self.server.offset_from_server_time() {
            Some(offset_ms) => from_unix_millis(to_unix_millis(server_time) + offset_ms),
            None => server_time,
        };
        let irmd = ImmutableRootMetadata::new(
            RootMetadata {
                bare: rmds.md.clone(),
                data,
                bundles,
            },
            md_id,
            rmds.md.writer_metadata_sig.verifying_key,
            local_timestamp,
            true,
        );

        let checker = MerkleTeamChecker::new(self, &rmds, &irmd, mode);
        if let Err(e) = is_valid_and_signed(ctx, &rmds, &checker).await {
            return Err(match e.downcast::<MdOpsError>() {
                Ok(ops_err) => ops_err,
                Err(e) => MdOpsError::mismatch(tlf, revision, format!("{e:#}")),
            });
        }

        let writer_cacheable = self
            .verify_writer_key(ctx, &rmds, &irmd, get_range_lock, mode)
            .await?;
        let cacheable = self
            .verify_key(
                ctx,
                &rmds,
                &rmds.md.last_modifying_user,
                &rmds.sig_info.verifying_key,
                &irmd,
                mode,
            )
            .await?;

        if writer_cacheable && cacheable && checker.is_cacheable() {
            self.caches.md.put(irmd.clone());
        }
        Ok(irmd)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Encrypt, sign and submit a merged revision.
    pub async fn put(
        &self,
        ctx: &RequestContext,
        rmd: RootMetadata,
        lock_context: Option<LockContext>,
        priority: MdPriority,
    ) -> OpsResult<ImmutableRootMetadata> {
        if rmd.merge_status() == MergeStatus::Unmerged {
            return Err(MdOpsError::UnexpectedUnmergedPut);
        }
        let old_bid = rmd.branch_id();
        self.put_signed(ctx, rmd, lock_context, priority, old_bid).await
    }

    /// Submit a revision to this device's unmerged branch, allocating the
    /// branch on first use. Concurrent calls for one folder agree on the
    /// branch ID.
    pub async fn put_unmerged(
        &self,
        ctx: &RequestContext,
        mut rmd: RootMetadata,
    ) -> OpsResult<ImmutableRootMetadata> {
        let tlf = rmd.tlf_id();
        let slot = self.branch_slot(tlf);
        let mut remembered = slot.lock().await;

        let bid = if !rmd.branch_id().is_null() {
            rmd.branch_id()
        } else if let Some(bid) = *remembered {
            bid
        } else {
            match self
                .server
                .get_for_tlf(ctx, tlf, BranchId::NULL, MergeStatus::Unmerged, None)
                .await?
            {
                Some(head) => head.md.branch_id(),
                None => {
                    let bid = BranchId::random();
                    debug!(tlf = %tlf, branch = %bid, "allocated unmerged branch");
                    bid
                }
            }
        };
        rmd.bare.set_unmerged(bid);

        let irmd = self
            .put_signed(ctx, rmd, None, MdPriority::Normal, bid)
            .await?;
        *remembered = Some(bid);
        Ok(irmd)
    }

    /// Forget this device's branch record for `bid`.
    pub async fn prune_branch(&self, ctx: &RequestContext, id: TlfId, bid: BranchId) -> OpsResult<()> {
        self.server.prune_branch(ctx, id, bid).await?;
        let slot = self.branch_slot(id);
        let mut remembered = slot.lock().await;
        if *remembered == Some(bid) {
            *remembered = None;
        }
        Ok(())
    }

    /// Put the merged resolution of branch `bid`, then prune the branch. A
    /// failed prune does not undo the put.
    pub async fn resolve_branch(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        rmd: RootMetadata,
    ) -> OpsResult<ImmutableRootMetadata> {
        if rmd.merge_status() == MergeStatus::Unmerged {
            return Err(MdOpsError::UnexpectedUnmergedPut);
        }
        let irmd = self
            .put_signed(ctx, rmd, None, MdPriority::Normal, bid)
            .await?;

        if let Err(e) = self.prune_branch(ctx, id, bid).await {
            warn!(tlf = %id, branch = %bid, revision = %irmd.revision(), "pruning resolved branch failed: {e}");
            return Err(match e {
                MdOpsError::Server(source) => MdOpsError::BranchPruneAfterResolve {
                    revision: irmd.revision(),
                    source,
                },
                other => other,
            });
        }
        Ok(irmd)
    }

    fn branch_slot(&self, tlf: TlfId) -> BranchSlot {
        Arc::clone(self.branches.lock().entry(tlf).or_default())
    }

    async fn put_signed(
        &self,
        ctx: &RequestContext,
        mut rmd: RootMetadata,
        lock_context: Option<LockContext>,
        priority: MdPriority,
        old_bid: BranchId,
    ) -> OpsResult<ImmutableRootMetadata> {
        let session = self.kbpki.current_session(ctx).await?;
        let copied = rmd.bare.is_writer_metadata_copied();

        if !copied && rmd.data.changes.is_embedded() {
            let size = rmd.data.changes.size_estimate();
            if size > self.config.max_embedded_changes_bytes {
                return Err(MdOpsError::EmbeddedChangesTooLarge {
                    size,
                    max: self.config.max_embedded_changes_bytes,
                });
            }
        }

        rmd.bare.last_modifying_user = session.uid.clone();
        if !copied {
            rmd.bare.writer_metadata.last_modifying_writer = session.uid.clone();
            rmd.bare.writer_metadata.serialized_private_metadata = self.encrypt_private(ctx, &rmd).await?;
            let payload = rmd.bare.writer_metadata_payload()?;
            rmd.bare.writer_metadata_sig = self.signer.sign(&payload);
        }
        let sig_info = self.signer.sign(&codec::encode(&rmd.bare)?);
        let rmds = RootMetadataSigned::new(rmd.bare.clone(), sig_info);

        self.server
            .put(ctx, &rmds, rmd.bundles.as_ref(), lock_context, priority)
            .await?;

        let md_id = rmds.md_id()?;
        let tlf = rmd.tlf_id();
        if let Some(bundles) = &rmd.bundles {
            self.caches
                .bundles
                .put_writer_bundle(tlf, rmd.bare.writer_key_bundle_id, bundles.writer.clone());
            self.caches
                .bundles
                .put_reader_bundle(tlf, rmd.bare.reader_key_bundle_id, bundles.reader.clone());
        }
        let irmd = ImmutableRootMetadata::new(rmd, md_id, self.signer.verifying_key(), self.clock.now(), true);
        self.caches.md.replace(irmd.clone(), old_bid);
        debug!(
            tlf = %tlf,
            revision = %irmd.revision(),
            branch = %irmd.branch_id(),
            md_id = %md_id,
            "put metadata"
        );
        Ok(irmd)
    }
}
