//! In-memory revision store.
//!
//! All revision state sits behind one async `RwLock`; key bundles and update
//! registrations have their own locks. Values made with [`MdServerMemory::for_session`]
//! share state but act as distinct sessions for locks and notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tlfmd_core::clock::to_unix_millis;
use tlfmd_core::config::ServerConfig;
use tlfmd_core::{
    codec, BareRootMetadata, BranchId, Clock, KbfsMerkleRoot, KeyBundles, LockContext, LockId, MdPriority,
    MergeStatus, MerkleTreeId, NextMd, ReaderKeyBundle, ReaderKeyBundleId, RequestContext, Revision,
    RootMetadataSigned, Session, SessionSource, TeamMembership, TlfHandle, TlfId, TlfType, WriterKeyBundle,
    WriterKeyBundleId,
};

use crate::api::MdServer;
use crate::error::{ServerError, ServerResult};
use crate::lock::{LockTable, LockWait};
use crate::state::{KeyBundleStore, PersistedStore, StoreState, StoredBlock};
use crate::update::{UpdateManager, UpdateWaiter};
use crate::validate;

struct Inner {
    state: StoreState,
    locks: LockTable,
}

struct Shared {
    inner: RwLock<Inner>,
    bundles: parking_lot::RwLock<KeyBundleStore>,
    updates: parking_lot::Mutex<UpdateManager>,
    shut_down: AtomicBool,
}

pub struct MdServerMemory {
    shared: Arc<Shared>,
    session: Arc<dyn SessionSource>,
    teams: Arc<dyn TeamMembership>,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
    instance: Uuid,
}

impl MdServerMemory {
    pub fn new(
        config: ServerConfig,
        session: Arc<dyn SessionSource>,
        teams: Arc<dyn TeamMembership>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::from_persisted(PersistedStore::default(), config, session, teams, clock)
    }

    pub(crate) fn from_persisted(
        persisted: PersistedStore,
        config: ServerConfig,
        session: Arc<dyn SessionSource>,
        teams: Arc<dyn TeamMembership>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Shared {
            inner: RwLock::new(Inner {
                state: persisted.state,
                locks: LockTable::default(),
            }),
            bundles: parking_lot::RwLock::new(persisted.bundles),
            updates: parking_lot::Mutex::new(UpdateManager::default()),
            shut_down: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
            session,
            teams,
            clock,
            config,
            instance: Uuid::new_v4(),
        }
    }

    /// Another session on the same store.
    pub fn for_session(&self, session: Arc<dyn SessionSource>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            session,
            teams: Arc::clone(&self.teams),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            instance: Uuid::new_v4(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.instance
    }

    pub(crate) fn teams(&self) -> &dyn TeamMembership {
        self.teams.as_ref()
    }

    /// Record a newly published KBFS root.
    pub async fn publish_merkle_root(&self, root: KbfsMerkleRoot) -> ServerResult<()> {
        self.check_live()?;
        let mut guard = self.shared.inner.write().await;
        debug!(tree = %root.tree, seqno = root.seqno, "published merkle root");
        guard.state.merkle_roots.insert(root.tree, root);
        Ok(())
    }

    /// Record the leaf for `tlf` committed by global root `next.root_seqno`.
    pub async fn publish_next_md(&self, tlf: TlfId, next: NextMd) -> ServerResult<()> {
        self.check_live()?;
        let mut guard = self.shared.inner.write().await;
        debug!(tlf = %tlf, root_seqno = next.root_seqno, "published merkle leaf");
        guard.state.publish_next_md(tlf, next);
        Ok(())
    }

    pub(crate) async fn snapshot(&self) -> ServerResult<PersistedStore> {
        self.check_live()?;
        let guard = self.shared.inner.read().await;
        let bundles = self.shared.bundles.read().clone();
        Ok(PersistedStore {
            state: guard.state.clone(),
            bundles,
        })
    }

    fn check_live(&self) -> ServerResult<()> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(ServerError::Shutdown);
        }
        Ok(())
    }

    async fn current_session(&self, ctx: &RequestContext) -> ServerResult<Session> {
        self.session.current_session(ctx).await.map_err(ServerError::Other)
    }

    async fn check_reader(
        &self,
        ctx: &RequestContext,
        state: &StoreState,
        id: TlfId,
        session: &Session,
    ) -> ServerResult<()> {
        if let Some(head) = state.head(id, BranchId::NULL)? {
            if !validate::is_reader(ctx, self.teams.as_ref(), &head.md, &session.uid).await? {
                return Err(ServerError::Unauthorized {
                    uid: session.uid.clone(),
                    tlf: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate the fetch parameters and resolve the branch to read.
    async fn check_get_params(
        &self,
        ctx: &RequestContext,
        state: &StoreState,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        session: &Session,
    ) -> ServerResult<BranchId> {
        if status == MergeStatus::Merged && !bid.is_null() {
            return Err(ServerError::bad_request("invalid branch ID"));
        }
        self.check_reader(ctx, state, id, session).await?;
        if status == MergeStatus::Unmerged && bid.is_null() {
            return Ok(state
                .branch_for(id, &session.crypt_public_key)
                .unwrap_or(BranchId::NULL));
        }
        Ok(bid)
    }

    /// Run `fetch` under the parameters check, first taking `lock_before_get`
    /// if given and waiting while someone else holds it.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_with_lock<T, F>(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
        empty: T,
        fetch: F,
    ) -> ServerResult<T>
    where
        T: Send,
        F: Fn(&StoreState, BranchId) -> ServerResult<T> + Send + Sync,
    {
        self.check_live()?;
        ctx.check()?;
        let session = self.current_session(ctx).await?;

        let Some(lock_id) = lock_before_get else {
            let guard = self.shared.inner.read().await;
            let bid = self.check_get_params(ctx, &guard.state, id, bid, status, &session).await?;
            if status == MergeStatus::Unmerged && bid.is_null() {
                return Ok(empty);
            }
            return fetch(&guard.state, bid);
        };

        let mut waits = 0u32;
        loop {
            ctx.check()?;
            self.check_live()?;
            let wait = {
                let mut guard = self.shared.inner.write().await;
                let inner = &mut *guard;
                let bid = self.check_get_params(ctx, &inner.state, id, bid, status, &session).await?;
                if status == MergeStatus::Unmerged && bid.is_null() {
                    return Ok(empty);
                }
                match self.try_lock(&mut inner.locks, id, lock_id) {
                    None => {
                        return match fetch(&inner.state, bid) {
                            Ok(v) => Ok(v),
                            Err(e) => {
                                inner.locks.release(id, lock_id, self.instance);
                                Err(e)
                            }
                        };
                    }
                    Some(wait) => wait,
                }
            };
            self.wait_for_lock(ctx, id, lock_id, wait, &mut waits).await?;
        }
    }

    fn try_lock(&self, locks: &mut LockTable, id: TlfId, lock_id: LockId) -> Option<LockWait> {
        locks.acquire(id, lock_id, self.instance, self.clock.now(), self.config.lock_timeout())
    }

    async fn wait_for_lock(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        lock_id: LockId,
        mut wait: LockWait,
        waits: &mut u32,
    ) -> ServerResult<()> {
        *waits += 1;
        let max = self.config.max_lock_wait_retries;
        if max > 0 && *waits > max {
            warn!(tlf = %id, lock = %lock_id, waits = max, "giving up on contended lock");
            return Err(ServerError::LockConflict { tlf: id, lock_id });
        }

        let until_expiry = wait
            .expires_at
            .duration_since(self.clock.now())
            .unwrap_or(Duration::ZERO);
        let nap = until_expiry.min(self.config.lock_retry_poll());
        debug!(tlf = %id, lock = %lock_id, attempt = *waits, ?nap, "lock held elsewhere, waiting");

        tokio::select! {
            // An error here means the holder's record is gone: released or replaced.
            _ = wait.released.changed() => {}
            _ = tokio::time::sleep(nap) => {}
            err = ctx.done() => return Err(err.into()),
        }
        Ok(())
    }

    async fn get_handle_id(&self, ctx: &RequestContext, handle: &TlfHandle) -> ServerResult<(TlfId, bool)> {
        let key = handle.store_key();
        if let Some(id) = self.shared.inner.read().await.state.handles.get(&key) {
            return Ok((*id, false));
        }

        // Non-readers may not create the folder.
        let session = self.current_session(ctx).await?;
        let is_reader = match (&handle.team, handle.tlf_type) {
            (Some(team), TlfType::SingleTeam) => self.teams.is_team_reader(ctx, team, &session.uid).await?,
            _ => handle.is_reader(&session.uid),
        };
        if !is_reader {
            return Err(ServerError::Unauthorized {
                uid: session.uid,
                tlf: handle.to_string(),
            });
        }
        if self.config.implicit_teams_enabled {
            return Err(ServerError::ClassicTlfDoesNotExist);
        }

        let mut guard = self.shared.inner.write().await;
        if let Some(id) = guard.state.handles.get(&key) {
            return Ok((*id, false));
        }
        let id = TlfId::random(handle.tlf_type);
        guard.state.handles.insert(key, id);
        guard.state.latest_handles.insert(id, handle.clone());
        info!(tlf = %id, handle = %handle, "created folder");
        Ok((id, true))
    }

    fn check_extra(md: &BareRootMetadata, extra: Option<&KeyBundles>) -> ServerResult<()> {
        let Some(extra) = extra else {
            return Ok(());
        };
        if extra.writer_new && extra.writer.id()? != md.writer_key_bundle_id {
            return Err(ServerError::bad_request("writer key bundle does not match its ID"));
        }
        if extra.reader_new && extra.reader.id()? != md.reader_key_bundle_id {
            return Err(ServerError::bad_request("reader key bundle does not match its ID"));
        }
        Ok(())
    }

    fn store_extra(&self, md: &BareRootMetadata, extra: Option<&KeyBundles>) {
        let Some(extra) = extra else {
            return;
        };
        let tlf = md.tlf_id();
        let mut bundles = self.shared.bundles.write();
        if extra.writer_new {
            bundles
                .writers
                .entry(tlf)
                .or_default()
                .insert(md.writer_key_bundle_id, extra.writer.clone());
        }
        if extra.reader_new {
            bundles
                .readers
                .entry(tlf)
                .or_default()
                .insert(md.reader_key_bundle_id, extra.reader.clone());
        }
    }
}

#[async_trait]
impl MdServer for MdServerMemory {
    async fn get_for_handle(
        &self,
        ctx: &RequestContext,
        handle: &TlfHandle,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<(TlfId, Option<RootMetadataSigned>)> {
        self.check_live()?;
        ctx.check()?;
        let (id, created) = self.get_handle_id(ctx, handle).await?;
        if created {
            return Ok((id, None));
        }
        let rmds = self
            .get_for_tlf(ctx, id, BranchId::NULL, status, lock_before_get)
            .await?;
        Ok((id, rmds))
    }

    async fn get_for_tlf(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<Option<RootMetadataSigned>> {
        self.fetch_with_lock(ctx, id, bid, status, lock_before_get, None, |state, bid| {
            state.head(id, bid)
        })
        .await
    }

    async fn get_for_tlf_by_time(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        server_time: SystemTime,
    ) -> ServerResult<RootMetadataSigned> {
        self.check_live()?;
        ctx.check()?;
        let session = self.current_session(ctx).await?;
        let guard = self.shared.inner.read().await;
        self.check_reader(ctx, &guard.state, id, &session).await?;

        let cutoff = to_unix_millis(server_time);
        guard
            .state
            .block_list(id, BranchId::NULL)
            .and_then(|list| list.blocks.iter().rev().find(|b| b.timestamp_ms <= cutoff))
            .ok_or_else(|| ServerError::NotFound(format!("no revision of {id} at or before {cutoff}ms")))?
            .decode()
    }

    async fn get_range(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<Vec<RootMetadataSigned>> {
        self.fetch_with_lock(ctx, id, bid, status, lock_before_get, Vec::new(), |state, bid| {
            state
                .block_list(id, bid)
                .map(|list| list.range(start, stop).iter().map(StoredBlock::decode).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        })
        .await
    }

    async fn put(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        extra: Option<&KeyBundles>,
        lock_context: Option<LockContext>,
        _priority: MdPriority,
    ) -> ServerResult<()> {
        self.check_live()?;
        ctx.check()?;
        let session = self.current_session(ctx).await?;

        validate::is_valid_and_signed(ctx, rmds, self.teams.as_ref())
            .await
            .map_err(|e| ServerError::bad_request(format!("{e:#}")))?;
        if !validate::is_last_modified_by(rmds, &session.uid, &session.verifying_key) {
            return Err(ServerError::bad_request(format!(
                "block is not last modified by {} with the session key",
                session.uid
            )));
        }
        Self::check_extra(&rmds.md, extra)?;

        let id = rmds.md.tlf_id();
        let bid = rmds.md.branch_id();
        let status = rmds.md.merge_status();
        let encoded = codec::encode(rmds)?;
        let new_id = rmds.md_id()?;

        let mut guard = self.shared.inner.write().await;
        let inner = &mut *guard;

        if let Some(lc) = lock_context {
            if !inner
                .locks
                .is_held_by(id, lc.require_lock_id, self.instance, self.clock.now())
            {
                return Err(ServerError::LockConflict {
                    tlf: id,
                    lock_id: lc.require_lock_id,
                });
            }
        }

        // Authorization is judged against the merged head as of now.
        let merged_head = inner.state.head(id, BranchId::NULL)?;
        let authority = merged_head.as_ref().map(|h| &h.md).unwrap_or(&rmds.md);
        if !validate::is_writer_or_valid_rekey(
            ctx,
            self.teams.as_ref(),
            authority,
            &rmds.md,
            &session.uid,
            &session.verifying_key,
        )
        .await?
        {
            return Err(ServerError::Unauthorized {
                uid: session.uid,
                tlf: id.to_string(),
            });
        }

        let device = session.crypt_public_key;
        if status == MergeStatus::Unmerged {
            if let Some(existing) = inner.state.branch_for(id, &device) {
                if existing != bid {
                    return Err(ServerError::BranchConflict { tlf: id, existing });
                }
            }
        }

        let mut head = inner.state.head(id, bid)?;
        if status == MergeStatus::Unmerged && head.is_none() {
            // A new branch forks off the merged revision before it.
            head = inner.state.merged_at(id, rmds.revision().prev())?;
        }

        match &head {
            Some(head) => {
                let head_id = head.md_id()?;
                if head.revision() == rmds.revision() && head_id == new_id {
                    debug!(tlf = %id, branch = %bid, revision = %rmds.revision(), "duplicate put ignored");
                    return Ok(());
                }
                head.md
                    .check_valid_successor(&head_id, &rmds.md)
                    .map_err(ServerError::from_successor)?;
            }
            None if rmds.revision() != Revision::INITIAL => {
                return Err(ServerError::ConflictRevision {
                    expected: Revision::INITIAL,
                    actual: rmds.revision(),
                });
            }
            None => {}
        }

        if status == MergeStatus::Unmerged {
            inner.state.set_branch(id, device, bid);
        }
        inner.state.append(
            id,
            bid,
            rmds.revision(),
            StoredBlock {
                encoded,
                timestamp_ms: to_unix_millis(self.clock.now()),
                version: rmds.md.version,
            },
        );
        self.store_extra(&rmds.md, extra);

        if let Some(lc) = lock_context {
            if lc.release_after_success {
                inner.locks.release(id, lc.require_lock_id, self.instance);
            }
        }

        debug!(
            tlf = %id,
            branch = %bid,
            revision = %rmds.revision(),
            md_id = %new_id,
            "put revision"
        );

        let pure_rekey = rmds.md.is_rekey_set() && rmds.md.is_writer_metadata_copied();
        if status == MergeStatus::Merged && !pure_rekey {
            self.shared.updates.lock().set_head(id, self.instance);
        }
        Ok(())
    }

    async fn lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()> {
        let mut waits = 0u32;
        loop {
            self.check_live()?;
            ctx.check()?;
            let wait = {
                let mut guard = self.shared.inner.write().await;
                match self.try_lock(&mut guard.locks, id, lock_id) {
                    None => return Ok(()),
                    Some(wait) => wait,
                }
            };
            self.wait_for_lock(ctx, id, lock_id, wait, &mut waits).await?;
        }
    }

    async fn release_lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()> {
        self.check_live()?;
        ctx.check()?;
        let mut guard = self.shared.inner.write().await;
        if !guard.locks.release(id, lock_id, self.instance) {
            debug!(tlf = %id, lock = %lock_id, "release of a lock this session does not hold");
        }
        Ok(())
    }

    async fn prune_branch(&self, ctx: &RequestContext, id: TlfId, bid: BranchId) -> ServerResult<()> {
        self.check_live()?;
        ctx.check()?;
        if bid.is_null() {
            return Err(ServerError::bad_request("invalid branch ID"));
        }
        let session = self.current_session(ctx).await?;
        let mut guard = self.shared.inner.write().await;
        if guard.state.branch_for(id, &session.crypt_public_key) != Some(bid) {
            return Err(ServerError::bad_request("invalid branch ID"));
        }
        guard.state.remove_branch(id, &session.crypt_public_key);
        debug!(tlf = %id, branch = %bid, "pruned branch");
        Ok(())
    }

    async fn register_for_update(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        curr_head: Revision,
    ) -> ServerResult<UpdateWaiter> {
        self.check_live()?;
        ctx.check()?;
        // Registering under the state lock orders this against Put's set_head.
        let guard = self.shared.inner.read().await;
        let merged_head = guard.state.merged_head_revision(id)?;
        let waiter = self
            .shared
            .updates
            .lock()
            .register(id, curr_head, merged_head, self.instance);
        Ok(waiter)
    }

    fn cancel_registration(&self, id: TlfId) {
        self.shared.updates.lock().cancel(id, self.instance);
    }

    async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        wkb_id: WriterKeyBundleId,
        rkb_id: ReaderKeyBundleId,
    ) -> ServerResult<(Option<WriterKeyBundle>, Option<ReaderKeyBundle>)> {
        self.check_live()?;
        ctx.check()?;
        let bundles = self.shared.bundles.read();
        Ok((bundles.writer(id, wkb_id)?, bundles.reader(id, rkb_id)?))
    }

    async fn find_next_md(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        after_root_seqno: i64,
    ) -> ServerResult<Option<NextMd>> {
        self.check_live()?;
        ctx.check()?;
        Ok(self
            .shared
            .inner
            .read()
            .await
            .state
            .find_next_md(id, after_root_seqno))
    }

    async fn get_merkle_root_latest(
        &self,
        ctx: &RequestContext,
        tree: MerkleTreeId,
    ) -> ServerResult<Option<KbfsMerkleRoot>> {
        self.check_live()?;
        ctx.check()?;
        Ok(self.shared.inner.read().await.state.merkle_roots.get(&tree).cloned())
    }

    async fn get_latest_handle_for_tlf(&self, ctx: &RequestContext, id: TlfId) -> ServerResult<Option<TlfHandle>> {
        self.check_live()?;
        ctx.check()?;
        Ok(self.shared.inner.read().await.state.latest_handles.get(&id).cloned())
    }

    fn offset_from_server_time(&self) -> Option<i64> {
        Some(0)
    }

    fn is_connected(&self) -> bool {
        !self.shared.shut_down.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.updates.lock().clear();
        if let Ok(mut guard) = self.shared.inner.try_write() {
            guard.locks.clear();
        }
        info!("metadata server shut down");
    }
}
