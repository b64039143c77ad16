use std::time::SystemTime;

use async_trait::async_trait;
use tlfmd_core::{
    BranchId, KbfsMerkleRoot, KeyBundles, LockContext, LockId, MdPriority, MergeStatus, MerkleTreeId, NextMd,
    ReaderKeyBundle, ReaderKeyBundleId, RequestContext, Revision, RootMetadataSigned, TlfHandle, TlfId,
    WriterKeyBundle, WriterKeyBundleId,
};

use crate::error::ServerResult;
use crate::update::UpdateWaiter;

/// The metadata revision store.
///
/// Each value speaks for one session: lock ownership and update
/// registrations belong to the instance they were made through.
#[async_trait]
pub trait MdServer: Send + Sync {
    /// Resolve (or mint) the folder ID for `handle` and return its head.
    /// A freshly minted folder has no head.
    async fn get_for_handle(
        &self,
        ctx: &RequestContext,
        handle: &TlfHandle,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<(TlfId, Option<RootMetadataSigned>)>;

    /// Latest block of (id, bid). For unmerged status with a null branch,
    /// the caller's own branch is used.
    async fn get_for_tlf(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<Option<RootMetadataSigned>>;

    /// Newest merged block whose server timestamp is not after `server_time`.
    async fn get_for_tlf_by_time(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        server_time: SystemTime,
    ) -> ServerResult<RootMetadataSigned>;

    /// Blocks in `[start, stop]`. Waits while `lock_before_get` is held by
    /// another session.
    #[allow(clippy::too_many_arguments)]
    async fn get_range(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<Vec<RootMetadataSigned>>;

    async fn put(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        extra: Option<&KeyBundles>,
        lock_context: Option<LockContext>,
        priority: MdPriority,
    ) -> ServerResult<()>;

    async fn lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()>;

    async fn release_lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()>;

    /// Forget the caller's branch record. History is retained.
    async fn prune_branch(&self, ctx: &RequestContext, id: TlfId, bid: BranchId) -> ServerResult<()>;

    async fn register_for_update(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        curr_head: Revision,
    ) -> ServerResult<UpdateWaiter>;

    fn cancel_registration(&self, id: TlfId);

    /// Zero IDs are skipped.
    async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        wkb_id: WriterKeyBundleId,
        rkb_id: ReaderKeyBundleId,
    ) -> ServerResult<(Option<WriterKeyBundle>, Option<ReaderKeyBundle>)>;

    /// First leaf for `id` published after global root `after_root_seqno`.
    async fn find_next_md(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        after_root_seqno: i64,
    ) -> ServerResult<Option<NextMd>>;

    async fn get_merkle_root_latest(
        &self,
        ctx: &RequestContext,
        tree: MerkleTreeId,
    ) -> ServerResult<Option<KbfsMerkleRoot>>;

    async fn get_latest_handle_for_tlf(&self, ctx: &RequestContext, id: TlfId) -> ServerResult<Option<TlfHandle>>;

    /// Local clock minus server clock in milliseconds, if known.
    fn offset_from_server_time(&self) -> Option<i64>;

    fn is_connected(&self) -> bool;

    fn shutdown(&self);
}
