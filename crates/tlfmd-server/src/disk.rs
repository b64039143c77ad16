//! Disk-backed revision store.
//!
//! Wraps [`MdServerMemory`] and snapshots its durable state to one JSON file
//! after every mutation, using a temp file and rename. Locks and update
//! registrations are not persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tlfmd_core::config::ServerConfig;
use tlfmd_core::{
    BranchId, Clock, KbfsMerkleRoot, KeyBundles, LockContext, LockId, MdPriority, MergeStatus, MerkleTreeId,
    NextMd, ReaderKeyBundle, ReaderKeyBundleId, RequestContext, Revision, RootMetadataSigned, SessionSource,
    TeamMembership, TlfHandle, TlfId, WriterKeyBundle, WriterKeyBundleId,
};

use crate::api::MdServer;
use crate::error::{ServerError, ServerResult};
use crate::memory::MdServerMemory;
use crate::state::PersistedStore;
use crate::update::UpdateWaiter;

pub struct MdServerDisk {
    memory: MdServerMemory,
    path: PathBuf,
    persist_lock: Arc<Mutex<()>>,
}

impl MdServerDisk {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(
        path: impl Into<PathBuf>,
        config: ServerConfig,
        session: Arc<dyn SessionSource>,
        teams: Arc<dyn TeamMembership>,
        clock: Arc<dyn Clock>,
    ) -> ServerResult<Self> {
        let path = path.into();
        let persisted = load(&path).await?;
        info!(
            path = %path.display(),
            folders = persisted.state.md.len(),
            "opened metadata store"
        );
        Ok(Self {
            memory: MdServerMemory::from_persisted(persisted, config, session, teams, clock),
            path,
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn for_session(&self, session: Arc<dyn SessionSource>) -> Self {
        Self {
            memory: self.memory.for_session(session),
            path: self.path.clone(),
            persist_lock: Arc::clone(&self.persist_lock),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn memory(&self) -> &MdServerMemory {
        &self.memory
    }

    pub async fn publish_merkle_root(&self, root: KbfsMerkleRoot) -> ServerResult<()> {
        self.memory.publish_merkle_root(root).await?;
        self.persist().await
    }

    pub async fn publish_next_md(&self, tlf: TlfId, next: NextMd) -> ServerResult<()> {
        self.memory.publish_next_md(tlf, next).await?;
        self.persist().await
    }

    /// Write the current snapshot. Concurrent callers are serialized so a
    /// stale snapshot never overwrites a newer one.
    async fn persist(&self) -> ServerResult<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.memory.snapshot().await?;
        let json = serde_json::to_vec_pretty(&snapshot).context("serializing metadata store")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating store dir: {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .with_context(|| format!("writing store temp: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming store: {}", self.path.display()))?;

        debug!(path = %self.path.display(), bytes = json.len(), "persisted metadata store");
        Ok(())
    }

    /// Persist after a mutation that already committed in memory. The
    /// in-memory state is kept; a failed write is logged and returned.
    async fn persist_after_commit(&self, op: &'static str) -> ServerResult<()> {
        self.persist().await.map_err(|e| {
            warn!(op, path = %self.path.display(), "failed to persist metadata store: {e:#}");
            ServerError::Other(anyhow::Error::new(e).context(format!(
                "{op} committed in memory but not persisted to {}",
                self.path.display()
            )))
        })
    }
}

async fn load(path: &Path) -> ServerResult<PersistedStore> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let store = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing metadata store: {}", path.display()))?;
            Ok(store)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedStore::default()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("reading metadata store: {}", path.display()))
            .into()),
    }
}

#[async_trait]
impl MdServer for MdServerDisk {
    async fn get_for_handle(
        &self,
        ctx: &RequestContext,
        handle: &TlfHandle,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<(TlfId, Option<RootMetadataSigned>)> {
        let (id, rmds) = self
            .memory
            .get_for_handle(ctx, handle, status, lock_before_get)
            .await?;
        if rmds.is_none() {
            // The handle may have just been minted.
            self.persist_after_commit("get_for_handle").await?;
        }
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
        self.memory.get_for_tlf(ctx, id, bid, status, lock_before_get).await
    }

    async fn get_for_tlf_by_time(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        server_time: SystemTime,
    ) -> ServerResult<RootMetadataSigned> {
        self.memory.get_for_tlf_by_time(ctx, id, server_time).await
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
        self.memory
            .get_range(ctx, id, bid, status, start, stop, lock_before_get)
            .await
    }

    async fn put(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        extra: Option<&KeyBundles>,
        lock_context: Option<LockContext>,
        priority: MdPriority,
    ) -> ServerResult<()> {
        self.memory.put(ctx, rmds, extra, lock_context, priority).await?;
        self.persist_after_commit("put").await?;
        Ok(())
    }

    async fn lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()> {
        self.memory.lock(ctx, id, lock_id).await
    }

    async fn release_lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()> {
        self.memory.release_lock(ctx, id, lock_id).await
    }

    async fn prune_branch(&self, ctx: &RequestContext, id: TlfId, bid: BranchId) -> ServerResult<()> {
        self.memory.prune_branch(ctx, id, bid).await?;
        self.persist_after_commit("prune_branch").await?;
        Ok(())
    }

    async fn register_for_update(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        curr_head: Revision,
    ) -> ServerResult<UpdateWaiter> {
        self.memory.register_for_update(ctx, id, curr_head).await
    }

    fn cancel_registration(&self, id: TlfId) {
        self.memory.cancel_registration(id)
    }

    async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        wkb_id: WriterKeyBundleId,
        rkb_id: ReaderKeyBundleId,
    ) -> ServerResult<(Option<WriterKeyBundle>, Option<ReaderKeyBundle>)> {
        self.memory.get_key_bundles(ctx, id, wkb_id, rkb_id).await
    }

    async fn find_next_md(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        after_root_seqno: i64,
    ) -> ServerResult<Option<NextMd>> {
        self.memory.find_next_md(ctx, id, after_root_seqno).await
    }

    async fn get_merkle_root_latest(
        &self,
        ctx: &RequestContext,
        tree: MerkleTreeId,
    ) -> ServerResult<Option<KbfsMerkleRoot>> {
        self.memory.get_merkle_root_latest(ctx, tree).await
    }

    async fn get_latest_handle_for_tlf(&self, ctx: &RequestContext, id: TlfId) -> ServerResult<Option<TlfHandle>> {
        self.memory.get_latest_handle_for_tlf(ctx, id).await
    }

    fn offset_from_server_time(&self) -> Option<i64> {
        self.memory.offset_from_server_time()
    }

    fn is_connected(&self) -> bool {
        self.memory.is_connected()
    }

    fn shutdown(&self) {
        self.memory.shutdown()
    }
}
