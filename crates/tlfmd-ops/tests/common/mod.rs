//! Shared fixtures: an engine wired to an in-memory store, an identity layer
//! whose key history tests can rewrite, and a Merkle service that trusts
//! every proof.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use tlfmd_core::config::{OpsConfig, ServerConfig};
use tlfmd_core::{
    BranchId, Clock, KbfsMerkleRoot, KeyBundles, KeyGen, LockContext, LockId, ManualClock, MdPriority, MergeStatus,
    MerkleRootRef, MerkleTreeId, NextMd, ReaderKeyBundle, ReaderKeyBundleId, RequestContext, Revision,
    RevokedKeyInfo, RootMetadataSigned, Session, SessionSource, TeamId, TeamMembership, TlfHandle, TlfId, TlfType,
    UserId, VerifyingKey, WriterKeyBundle, WriterKeyBundleId,
};
use tlfmd_crypto::{generate_tlf_crypt_key, DeviceSecret, SigningIdentity, TlfCryptKey};
use tlfmd_ops::{add_device_key, BundleKeyManager, KeyPki, KeyStatus, MdOps, MerkleService, RootMetadata};
use tlfmd_server::{MdServer, MdServerMemory, ServerResult, UpdateWaiter};

// ── Identity layer ──────────────────────────────────────────────────────────

/// Every key is valid unless a test says otherwise.
pub struct TestPki {
    session: Session,
    statuses: Mutex<HashMap<VerifyingKey, KeyStatus>>,
}

impl TestPki {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn revoke(&self, key: VerifyingKey, info: RevokedKeyInfo) {
        self.statuses.lock().insert(key, KeyStatus::Revoked(info));
    }

    pub fn disown(&self, key: VerifyingKey) {
        self.statuses.lock().insert(key, KeyStatus::Unknown);
    }
}

#[async_trait]
impl SessionSource for TestPki {
    async fn current_session(&self, _ctx: &RequestContext) -> anyhow::Result<Session> {
        Ok(self.session.clone())
    }
}

#[async_trait]
impl TeamMembership for TestPki {
    async fn is_team_writer(
        &self,
        _ctx: &RequestContext,
        _team: &TeamId,
        _uid: &UserId,
        _key: &VerifyingKey,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn is_team_reader(&self, _ctx: &RequestContext, _team: &TeamId, _uid: &UserId) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl KeyPki for TestPki {
    async fn key_status(
        &self,
        _ctx: &RequestContext,
        _uid: &UserId,
        key: &VerifyingKey,
        _at: Option<SystemTime>,
    ) -> anyhow::Result<KeyStatus> {
        Ok(self.statuses.lock().get(key).cloned().unwrap_or(KeyStatus::Valid))
    }

    async fn no_longer_team_writer(
        &self,
        _ctx: &RequestContext,
        _team: &TeamId,
        _tlf_type: TlfType,
        _uid: &UserId,
        _key: &VerifyingKey,
    ) -> anyhow::Result<Option<MerkleRootRef>> {
        Ok(None)
    }

    async fn normalized_username(&self, _ctx: &RequestContext, uid: &UserId) -> anyhow::Result<String> {
        Ok(uid.to_string())
    }
}

// ── Global Merkle tree ──────────────────────────────────────────────────────

pub struct TrustingMerkle {
    root_time: Mutex<SystemTime>,
}

impl TrustingMerkle {
    pub fn new(root_time: SystemTime) -> Self {
        Self {
            root_time: Mutex::new(root_time),
        }
    }

    pub fn set_root_time(&self, t: SystemTime) {
        *self.root_time.lock() = t;
    }
}

#[async_trait]
impl MerkleService for TrustingMerkle {
    async fn current_root(&self, _ctx: &RequestContext) -> anyhow::Result<(MerkleRootRef, SystemTime)> {
        let root = MerkleRootRef {
            seqno: 1_000,
            hash_meta: vec![0xab; 32],
        };
        Ok((root, *self.root_time.lock()))
    }

    async fn verify_kbfs_root(
        &self,
        _ctx: &RequestContext,
        _kbfs_root: &KbfsMerkleRoot,
        _root_seqno: i64,
        _nodes: &[Vec<u8>],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Devices ─────────────────────────────────────────────────────────────────

pub struct Device {
    pub uid: UserId,
    pub signer: SigningIdentity,
    pub secret: DeviceSecret,
}

impl Device {
    pub fn new(uid: &str, n: u8) -> Self {
        Self {
            uid: UserId::new(uid),
            signer: SigningIdentity::from_seed(&[n; 32]),
            secret: DeviceSecret::from_bytes([n.wrapping_add(100); 32]),
        }
    }

    pub fn session(&self) -> Session {
        Session {
            uid: self.uid.clone(),
            name: self.uid.to_string(),
            verifying_key: self.signer.verifying_key(),
            crypt_public_key: self.secret.public_key(),
        }
    }
}

pub fn alice() -> Device {
    Device::new("alice", 1)
}

pub fn alice_phone() -> Device {
    Device::new("alice", 3)
}

pub fn private_handle() -> TlfHandle {
    TlfHandle::private([UserId::new("alice")], [UserId::new("bob")])
}

pub fn public_handle() -> TlfHandle {
    TlfHandle::public([UserId::new("alice")])
}

// ── Engine wiring ───────────────────────────────────────────────────────────

pub fn start_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub struct Harness {
    pub server: Arc<MdServerMemory>,
    pub ops: MdOps,
    pub pki: Arc<TestPki>,
    pub merkle: Arc<TrustingMerkle>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(device: &Device) -> Self {
        Self::with_config(device, OpsConfig::default())
    }

    pub fn with_config(device: &Device, config: OpsConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let pki = Arc::new(TestPki::new(device.session()));
        let server_config = ServerConfig {
            lock_retry_poll_ms: 10,
            ..ServerConfig::default()
        };
        let server = Arc::new(MdServerMemory::new(
            server_config,
            pki.clone(),
            pki.clone(),
            clock.clone(),
        ));
        Self::assemble(device, server, pki, clock, config)
    }

    /// Another device on the same store, with its own engine and caches.
    pub fn join(&self, device: &Device) -> Self {
        let pki = Arc::new(TestPki::new(device.session()));
        let server = Arc::new(self.server.for_session(pki.clone()));
        Self::assemble(device, server, pki, self.clock.clone(), self.ops.config().clone())
    }

    fn assemble(
        device: &Device,
        server: Arc<MdServerMemory>,
        pki: Arc<TestPki>,
        clock: Arc<ManualClock>,
        config: OpsConfig,
    ) -> Self {
        let merkle = Arc::new(TrustingMerkle::new(clock.now()));
        let ops = MdOps::builder(
            server.clone(),
            pki.clone(),
            merkle.clone(),
            Arc::new(BundleKeyManager::new(device.uid.clone(), device.secret.clone())),
            device.signer.clone(),
        )
        .clock(clock.clone())
        .config(config)
        .build();
        Self {
            server,
            ops,
            pki,
            merkle,
            clock,
        }
    }

    pub async fn new_folder(&self, handle: &TlfHandle) -> TlfId {
        let ctx = RequestContext::new();
        let (id, head) = self
            .ops
            .get_for_handle(&ctx, handle, MergeStatus::Merged, None)
            .await
            .unwrap();
        assert!(head.is_none());
        id
    }
}

/// Revision 1 of a private folder, keyed for `device` at the first key
/// generation.
pub fn keyed_initial(id: TlfId, handle: &TlfHandle, device: &Device, key: &TlfCryptKey) -> RootMetadata {
    let mut rmd = RootMetadata::new_initial(id, handle);
    let mut writer = WriterKeyBundle::default();
    add_device_key(&mut writer.devices, &device.uid, &device.secret, &id, KeyGen::FIRST, key).unwrap();
    rmd.set_key_bundles(writer, ReaderKeyBundle::default()).unwrap();
    rmd.data.tlf_private_key = Some([7; 32]);
    rmd
}

/// Add a key generation for `device`, rotating the folder's private key.
pub fn rekey(rmd: &mut RootMetadata, device: &Device, private_key: [u8; 32]) -> TlfCryptKey {
    let key = generate_tlf_crypt_key();
    let key_gen = KeyGen(rmd.key_gen().0 + 1);
    let bundles = rmd.bundles.clone().unwrap_or_default();
    let mut writer = bundles.writer;
    add_device_key(&mut writer.devices, &device.uid, &device.secret, &rmd.tlf_id(), key_gen, &key).unwrap();
    rmd.bare.latest_key_gen = key_gen;
    rmd.set_key_bundles(writer, bundles.reader).unwrap();
    rmd.data.tlf_private_key = Some(private_key);
    key
}

pub fn revoked_at(t: SystemTime, seqno: i64) -> RevokedKeyInfo {
    RevokedKeyInfo::new(
        t,
        MerkleRootRef {
            seqno,
            hash_meta: vec![seqno as u8; 32],
        },
    )
}

pub fn kbfs_root(tree: MerkleTreeId, seqno: i64, t: SystemTime) -> KbfsMerkleRoot {
    KbfsMerkleRoot {
        tree,
        seqno,
        timestamp_ms: tlfmd_core::clock::to_unix_millis(t),
        root_hash: [seqno as u8; 32],
        nonce: [seqno as u8; 24],
    }
}

pub fn next_md(kbfs_root: KbfsMerkleRoot, root_seqno: i64, leaf: Vec<u8>) -> NextMd {
    NextMd {
        kbfs_root,
        merkle_nodes: vec![vec![0x11; 32], leaf],
        root_seqno,
    }
}

// ── Store wrappers ──────────────────────────────────────────────────────────

type Rewrite = Box<dyn Fn(RootMetadataSigned) -> RootMetadataSigned + Send + Sync>;

/// A store that rewrites the blocks it serves: stands in for a malicious
/// server.
pub struct RewritingServer {
    inner: Arc<MdServerMemory>,
    rewrite: Rewrite,
}

impl RewritingServer {
    pub fn new(
        inner: Arc<MdServerMemory>,
        rewrite: impl Fn(RootMetadataSigned) -> RootMetadataSigned + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            rewrite: Box::new(rewrite),
        }
    }
}

#[async_trait]
impl MdServer for RewritingServer {
    async fn get_for_handle(
        &self,
        ctx: &RequestContext,
        handle: &TlfHandle,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<(TlfId, Option<RootMetadataSigned>)> {
        let (id, head) = self.inner.get_for_handle(ctx, handle, status, lock_before_get).await?;
        Ok((id, head.map(&self.rewrite)))
    }

    async fn get_for_tlf(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        lock_before_get: Option<LockId>,
    ) -> ServerResult<Option<RootMetadataSigned>> {
        let head = self.inner.get_for_tlf(ctx, id, bid, status, lock_before_get).await?;
        Ok(head.map(&self.rewrite))
    }

    async fn get_for_tlf_by_time(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        server_time: SystemTime,
    ) -> ServerResult<RootMetadataSigned> {
        Ok((self.rewrite)(self.inner.get_for_tlf_by_time(ctx, id, server_time).await?))
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
        let range = self
            .inner
            .get_range(ctx, id, bid, status, start, stop, lock_before_get)
            .await?;
        Ok(range.into_iter().map(&self.rewrite).collect())
    }

    async fn put(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        extra: Option<&KeyBundles>,
        lock_context: Option<LockContext>,
        priority: MdPriority,
    ) -> ServerResult<()> {
        self.inner.put(ctx, rmds, extra, lock_context, priority).await
    }

    async fn lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()> {
        self.inner.lock(ctx, id, lock_id).await
    }

    async fn release_lock(&self, ctx: &RequestContext, id: TlfId, lock_id: LockId) -> ServerResult<()> {
        self.inner.release_lock(ctx, id, lock_id).await
    }

    async fn prune_branch(&self, ctx: &RequestContext, id: TlfId, bid: BranchId) -> ServerResult<()> {
        self.inner.prune_branch(ctx, id, bid).await
    }

    async fn register_for_update(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        curr_head: Revision,
    ) -> ServerResult<UpdateWaiter> {
        self.inner.register_for_update(ctx, id, curr_head).await
    }

    fn cancel_registration(&self, id: TlfId) {
        self.inner.cancel_registration(id)
    }

    async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        wkb_id: WriterKeyBundleId,
        rkb_id: ReaderKeyBundleId,
    ) -> ServerResult<(Option<WriterKeyBundle>, Option<ReaderKeyBundle>)> {
        self.inner.get_key_bundles(ctx, id, wkb_id, rkb_id).await
    }

    async fn find_next_md(
        &self,
        ctx: &RequestContext,
        id: TlfId,
        after_root_seqno: i64,
    ) -> ServerResult<Option<NextMd>> {
        self.inner.find_next_md(ctx, id, after_root_seqno).await
    }

    async fn get_merkle_root_latest(
        &self,
        ctx: &RequestContext,
        tree: MerkleTreeId,
    ) -> ServerResult<Option<KbfsMerkleRoot>> {
        self.inner.get_merkle_root_latest(ctx, tree).await
    }

    async fn get_latest_handle_for_tlf(&self, ctx: &RequestContext, id: TlfId) -> ServerResult<Option<TlfHandle>> {
        self.inner.get_latest_handle_for_tlf(ctx, id).await
    }

    fn offset_from_server_time(&self) -> Option<i64> {
        self.inner.offset_from_server_time()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}

/// An engine reading through `server` as `device`.
pub fn engine_over(server: Arc<dyn MdServer>, device: &Device, clock: Arc<ManualClock>) -> MdOps {
    let pki = Arc::new(TestPki::new(device.session()));
    let merkle = Arc::new(TrustingMerkle::new(clock.now()));
    MdOps::builder(
        server,
        pki,
        merkle,
        Arc::new(BundleKeyManager::new(device.uid.clone(), device.secret.clone())),
        device.signer.clone(),
    )
    .clock(clock)
    .build()
}
