//! Store behaviour seen through the `MdServer` trait: append rules, branches,
//! leases, update notifications, and the disk snapshot.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tlfmd_core::{
    BranchId, Clock, KeyBundles, KeyGen, LockContext, LockId, MdId, MdPriority, MergeStatus, NoTeams, ReaderKeyBundleId,
    RequestContext, Revision, TlfHandle, UserId, WrappedTlfKey, WriterKeyBundle, WriterKeyBundleId,
};
use tlfmd_server::{MdServer, MdServerDisk, MdServerMemory, ServerError};

const NORMAL: MdPriority = MdPriority::Normal;

async fn new_folder(store: &MdServerMemory) -> tlfmd_core::TlfId {
    let ctx = RequestContext::new();
    let (id, head) = store
        .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
        .await
        .unwrap();
    assert!(head.is_none());
    id
}

// ── Append rules ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_linear_history() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;

    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();
    let r2 = alice.next(&r1);
    store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();

    let head = store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Merged, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.revision(), Revision(2));
    assert_eq!(head.md_id().unwrap(), r2.md_id().unwrap());
    assert!(head.untrusted_server_timestamp.is_some());

    // Bob loses the race for revision 2.
    let bob = bob();
    let bob_store = store.for_session(bob.session());
    let stale = bob.next(&r1);
    let err = bob_store.put(&ctx, &stale, None, None, NORMAL).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::ConflictRevision {
            expected: Revision(3),
            actual: Revision(2)
        }
    ));
    assert!(err.is_retryable());

    // Right revision, wrong predecessor.
    let mut md = alice.next(&r2).md;
    md.prev_root = r1.md_id().unwrap();
    let err = store.put(&ctx, &alice.sign(md), None, None, NORMAL).await.unwrap_err();
    assert!(matches!(err, ServerError::ConflictPrevRoot { .. }));

    let all = store
        .get_range(&ctx, id, BranchId::NULL, MergeStatus::Merged, Revision(1), Revision(100), None)
        .await
        .unwrap();
    assert_eq!(all.iter().map(|r| r.revision()).collect::<Vec<_>>(), vec![Revision(1), Revision(2)]);
}

#[tokio::test]
async fn test_first_revision_must_be_initial() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;

    let mut md = alice.initial(id, &private_handle()).md;
    md.revision = Revision(2);
    let err = store.put(&ctx, &alice.sign(md), None, None, NORMAL).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::ConflictRevision {
            expected: Revision::INITIAL,
            ..
        }
    ));
}

#[tokio::test]
async fn test_duplicate_put_is_ignored() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;

    let r1 = alice.initial(id, &private_handle());
    let r2 = alice.next(&r1);
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();
    store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();
    store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();

    let all = store
        .get_range(&ctx, id, BranchId::NULL, MergeStatus::Merged, Revision(1), Revision(10), None)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_put_rejects_bad_signers() {
    let ctx = RequestContext::new();
    let (alice, bob, mallory) = (alice(), bob(), mallory());
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;
    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();

    // Signed by bob but sent on alice's session.
    let err = store.put(&ctx, &bob.next(&r1), None, None, NORMAL).await.unwrap_err();
    assert!(matches!(err, ServerError::BadRequest { .. }));

    // Tampered after signing.
    let mut tampered = alice.next(&r1);
    tampered.md.writer_metadata.disk_usage = 1_000;
    let err = store.put(&ctx, &tampered, None, None, NORMAL).await.unwrap_err();
    assert!(matches!(err, ServerError::BadRequest { .. }));

    // Mallory writes herself into the writer list; the current head says no.
    let mallory_store = store.for_session(mallory.session());
    let mut md = r1.md.make_successor(r1.md_id().unwrap());
    md.writer_metadata.writers.push(UserId::new("mallory"));
    let err = mallory_store
        .put(&ctx, &mallory.sign(md), None, None, NORMAL)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Unauthorized { .. }), "{err}");
}

#[tokio::test]
async fn test_key_bundles_stored_with_put() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;

    let mut wkb = WriterKeyBundle::default();
    wkb.devices.entry(alice.uid.clone()).or_default().insert(
        alice.crypt_key,
        vec![WrappedTlfKey {
            key_gen: KeyGen::FIRST,
            wrapped: vec![7; 72],
        }],
    );
    let wkb_id = wkb.id().unwrap();
    let extra = KeyBundles {
        writer: wkb.clone(),
        writer_new: true,
        ..KeyBundles::default()
    };

    // Bundle content must match the ID in the block.
    let mut md = alice.initial(id, &private_handle()).md;
    md.writer_key_bundle_id = WriterKeyBundleId([3; 32]);
    let err = store
        .put(&ctx, &alice.sign(md.clone()), Some(&extra), None, NORMAL)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BadRequest { .. }));

    md.writer_key_bundle_id = wkb_id;
    store
        .put(&ctx, &alice.sign(md), Some(&extra), None, NORMAL)
        .await
        .unwrap();

    let (w, r) = store
        .get_key_bundles(&ctx, id, wkb_id, ReaderKeyBundleId::default())
        .await
        .unwrap();
    assert_eq!(w, Some(wkb));
    assert!(r.is_none());

    let err = store
        .get_key_bundles(&ctx, id, WriterKeyBundleId([9; 32]), ReaderKeyBundleId::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NoSuchKeyBundle(_)));
}

// ── Handles ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_for_handle_mints_once() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;

    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();

    let (again, head) = store
        .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
        .await
        .unwrap();
    assert_eq!(again, id);
    assert_eq!(head.unwrap().revision(), Revision(1));
    assert_eq!(
        store.get_latest_handle_for_tlf(&ctx, id).await.unwrap(),
        Some(private_handle())
    );
}

#[tokio::test]
async fn test_get_for_handle_requires_reader() {
    let ctx = RequestContext::new();
    let store = store_for(&mallory(), manual_clock());
    let err = store
        .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Unauthorized { .. }));

    // A reader may create the folder.
    let carol = common::Device::new("carol", 3);
    let (_, head) = store
        .for_session(carol.session())
        .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
        .await
        .unwrap();
    assert!(head.is_none());
}

#[tokio::test]
async fn test_implicit_teams_refuse_new_classic_folders() {
    let ctx = RequestContext::new();
    let alice = alice();
    let config = tlfmd_core::config::ServerConfig {
        implicit_teams_enabled: true,
        ..test_config()
    };
    let store = MdServerMemory::new(config, alice.session(), Arc::new(NoTeams), manual_clock());
    let handle = TlfHandle::private([alice.uid.clone()], Vec::<UserId>::new());
    let err = store
        .get_for_handle(&ctx, &handle, MergeStatus::Merged, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ClassicTlfDoesNotExist));
}

// ── Branches ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unmerged_branch_lifecycle() {
    let ctx = RequestContext::new();
    let (alice, bob) = (alice(), bob());
    let store = store_for(&alice, manual_clock());
    let bob_store = store.for_session(bob.session());
    let id = new_folder(&store).await;

    let r1 = alice.initial(id, &private_handle());
    let r2 = alice.next(&r1);
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();
    store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();

    // The first unmerged block forks from merged revision 2.
    let bid = BranchId::random();
    let u3 = alice.next_unmerged(&r2, bid);
    store.put(&ctx, &u3, None, None, NORMAL).await.unwrap();

    let own = store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Unmerged, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.md.branch_id(), bid);
    let merged = store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Merged, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.revision(), Revision(2));

    // One branch per device.
    let other = BranchId::random();
    let err = store
        .put(&ctx, &alice.next_unmerged(&r2, other), None, None, NORMAL)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BranchConflict { existing, .. } if existing == bid));

    // Bob's device has no branch.
    assert!(bob_store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Unmerged, None)
        .await
        .unwrap()
        .is_none());

    let err = store
        .get_for_tlf(&ctx, id, bid, MergeStatus::Merged, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BadRequest { .. }));

    let branch = store
        .get_range(&ctx, id, bid, MergeStatus::Unmerged, Revision(1), Revision(10), None)
        .await
        .unwrap();
    assert_eq!(branch.len(), 1);
    assert_eq!(branch[0].revision(), Revision(3));

    // Pruning needs the caller's own, non-null branch.
    for wrong in [BranchId::NULL, other] {
        let err = store.prune_branch(&ctx, id, wrong).await.unwrap_err();
        assert!(matches!(err, ServerError::BadRequest { .. }));
    }
    assert!(bob_store.prune_branch(&ctx, id, bid).await.is_err());
    store.prune_branch(&ctx, id, bid).await.unwrap();

    assert!(store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Unmerged, None)
        .await
        .unwrap()
        .is_none());
    // History of the pruned branch is kept.
    assert!(store
        .get_for_tlf(&ctx, id, bid, MergeStatus::Unmerged, None)
        .await
        .unwrap()
        .is_some());

    // A fresh branch is allowed after pruning.
    store
        .put(&ctx, &alice.next_unmerged(&r2, other), None, None, NORMAL)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unmerged_fork_needs_merged_predecessor() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;
    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();

    let mut md = r1.md.make_successor(MdId::NULL);
    md.revision = Revision(5);
    md.set_unmerged(BranchId::random());
    let err = store.put(&ctx, &alice.sign(md), None, None, NORMAL).await.unwrap_err();
    assert!(matches!(err, ServerError::ConflictRevision { .. }));
}

// ── Leases ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_locked_get_range_waits_for_release() {
    let ctx = RequestContext::new();
    let (alice, bob) = (alice(), bob());
    let store = Arc::new(store_for(&alice, manual_clock()));
    let bob_store = Arc::new(store.for_session(bob.session()));
    let id = new_folder(&store).await;
    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();

    store.lock(&ctx, id, LockId(7)).await.unwrap();
    // Re-acquiring one's own lock is a no-op.
    store.lock(&ctx, id, LockId(7)).await.unwrap();

    let waiter = {
        let bob_store = Arc::clone(&bob_store);
        tokio::spawn(async move {
            bob_store
                .get_range(
                    &RequestContext::new(),
                    id,
                    BranchId::NULL,
                    MergeStatus::Merged,
                    Revision(1),
                    Revision(10),
                    Some(LockId(7)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    let r2 = alice.next(&r1);
    let release = LockContext {
        require_lock_id: LockId(7),
        release_after_success: true,
    };
    store.put(&ctx, &r2, None, Some(release), NORMAL).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.len(), 2);

    // Bob now holds the lock; alice's locked put is refused.
    let r3 = alice.next(&r2);
    let err = store.put(&ctx, &r3, None, Some(release), NORMAL).await.unwrap_err();
    assert!(matches!(err, ServerError::LockConflict { .. }));

    // Releasing someone else's lock is silently ignored.
    store.release_lock(&ctx, id, LockId(7)).await.unwrap();
    assert!(store.put(&ctx, &r3, None, Some(release), NORMAL).await.is_err());

    bob_store.release_lock(&ctx, id, LockId(7)).await.unwrap();
    store.lock(&ctx, id, LockId(7)).await.unwrap();
    store.put(&ctx, &r3, None, Some(release), NORMAL).await.unwrap();
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let ctx = RequestContext::new();
    let (alice, bob) = (alice(), bob());
    let clock = manual_clock();
    let store = store_for(&alice, clock.clone());
    let bob_store = store.for_session(bob.session());
    let id = new_folder(&store).await;

    store.lock(&ctx, id, LockId(1)).await.unwrap();
    clock.advance(Duration::from_secs(61));
    tokio::time::timeout(Duration::from_secs(1), bob_store.lock(&ctx, id, LockId(1)))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_lock_wait_honours_deadline() {
    let (alice, bob) = (alice(), bob());
    let store = store_for(&alice, manual_clock());
    let bob_store = store.for_session(bob.session());
    let id = new_folder(&store).await;
    store.lock(&RequestContext::new(), id, LockId(1)).await.unwrap();

    let short = RequestContext::new().with_timeout(Duration::from_millis(50));
    let err = bob_store.lock(&short, id, LockId(1)).await.unwrap_err();
    assert!(matches!(err, ServerError::Context(_)));
}

#[tokio::test]
async fn test_lock_wait_gives_up_after_retries() {
    let (alice, bob) = (alice(), bob());
    let config = tlfmd_core::config::ServerConfig {
        lock_retry_poll_ms: 1,
        max_lock_wait_retries: 3,
        ..test_config()
    };
    let store = MdServerMemory::new(config, alice.session(), Arc::new(NoTeams), manual_clock());
    let bob_store = store.for_session(bob.session());
    let id = new_folder(&store).await;
    store.lock(&RequestContext::new(), id, LockId(1)).await.unwrap();

    let ctx = RequestContext::new().with_timeout(Duration::from_secs(10));
    let err = bob_store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Merged, Some(LockId(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::LockConflict { .. }));
}

// ── Notifications ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_register_for_update() {
    let ctx = RequestContext::new();
    let (alice, bob) = (alice(), bob());
    let store = store_for(&alice, manual_clock());
    let bob_store = store.for_session(bob.session());
    let id = new_folder(&store).await;
    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();

    let bob_waiter = bob_store.register_for_update(&ctx, id, Revision(1)).await.unwrap();
    let mut alice_waiter = store.register_for_update(&ctx, id, Revision(1)).await.unwrap();

    // Unmerged writes notify nobody.
    store
        .put(&ctx, &alice.next_unmerged(&r1, BranchId::random()), None, None, NORMAL)
        .await
        .unwrap();

    let r2 = alice.next(&r1);
    store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), bob_waiter.wait(&ctx))
        .await
        .unwrap()
        .unwrap();
    assert!(alice_waiter.try_take().is_none());

    // Bob registering behind the head hears about it at once.
    let mut late = bob_store.register_for_update(&ctx, id, Revision(1)).await.unwrap();
    assert!(matches!(late.try_take(), Some(Ok(()))));
    assert!(late.try_take().is_none());

    // A second registration from the same session is refused.
    let mut dup = store.register_for_update(&ctx, id, Revision(2)).await.unwrap();
    assert!(matches!(
        dup.try_take(),
        Some(Err(ServerError::DuplicateRegistration { .. }))
    ));

    store.cancel_registration(id);
    assert!(matches!(
        alice_waiter.wait(&ctx).await,
        Err(ServerError::RegistrationCancelled)
    ));
}

// ── Time lookup ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_for_tlf_by_time() {
    let ctx = RequestContext::new();
    let alice = alice();
    let clock = manual_clock();
    let t0 = clock.now();
    let store = store_for(&alice, clock.clone());
    let id = new_folder(&store).await;

    let r1 = alice.initial(id, &private_handle());
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();
    clock.advance(Duration::from_secs(10));
    let r2 = alice.next(&r1);
    store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();

    let at = |secs: u64| t0 + Duration::from_secs(secs);
    let got = store.get_for_tlf_by_time(&ctx, id, at(5)).await.unwrap();
    assert_eq!(got.revision(), Revision(1));
    assert_eq!(got.untrusted_server_timestamp, Some(t0));
    let got = store.get_for_tlf_by_time(&ctx, id, at(10)).await.unwrap();
    assert_eq!(got.revision(), Revision(2));

    let err = store
        .get_for_tlf_by_time(&ctx, id, t0 - Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
}

// ── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;
    let waiter = store.register_for_update(&ctx, id, Revision(0)).await.unwrap();

    assert!(store.is_connected());
    store.shutdown();
    assert!(!store.is_connected());
    assert!(matches!(waiter.wait(&ctx).await, Err(ServerError::RegistrationCancelled)));

    let err = store
        .put(&ctx, &alice.initial(id, &private_handle()), None, None, NORMAL)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Shutdown));
}

#[tokio::test]
async fn test_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("mdserver.json");
    let ctx = RequestContext::new();
    let alice = alice();
    let clock = manual_clock();

    let open = || {
        MdServerDisk::open(
            path.clone(),
            test_config(),
            alice.session(),
            Arc::new(NoTeams),
            clock.clone(),
        )
    };

    let bid = BranchId::random();
    let id = {
        let store = open().await.unwrap();
        let (id, _) = store
            .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
            .await
            .unwrap();
        let r1 = alice.initial(id, &private_handle());
        let r2 = alice.next(&r1);
        store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();
        store.put(&ctx, &r2, None, None, NORMAL).await.unwrap();
        store
            .put(&ctx, &alice.next_unmerged(&r2, bid), None, None, NORMAL)
            .await
            .unwrap();
        id
    };
    assert!(path.exists());

    let store = open().await.unwrap();
    let (again, head) = store
        .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
        .await
        .unwrap();
    assert_eq!(again, id);
    assert_eq!(head.unwrap().revision(), Revision(2));

    let own = store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Unmerged, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.md.branch_id(), bid);
}

#[tokio::test]
async fn test_disk_put_reports_failed_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mdserver.json");
    let ctx = RequestContext::new();
    let alice = alice();
    let clock = manual_clock();
    let open = || MdServerDisk::open(path.clone(), test_config(), alice.session(), Arc::new(NoTeams), clock.clone());

    let store = open().await.unwrap();
    let (id, _) = store
        .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
        .await
        .unwrap();

    // A non-empty directory where the snapshot belongs cannot be replaced.
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("blocker"), b"x").unwrap();

    let r1 = alice.initial(id, &private_handle());
    let err = store.put(&ctx, &r1, None, None, NORMAL).await.unwrap_err();
    assert!(matches!(err, ServerError::Other(_)), "{err}");
    assert!(!err.is_retryable());

    // The revision stays committed in memory.
    let head = store
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Merged, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.revision(), Revision::INITIAL);

    // Once the path is writable again, repeating the put persists it.
    std::fs::remove_dir_all(&path).unwrap();
    store.put(&ctx, &r1, None, None, NORMAL).await.unwrap();
    drop(store);

    let reopened = open().await.unwrap();
    let head = reopened
        .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Merged, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.revision(), Revision::INITIAL);
}

// ── Inspection ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_folder_summaries_and_block_listing() {
    let ctx = RequestContext::new();
    let alice = alice();
    let store = store_for(&alice, manual_clock());
    let id = new_folder(&store).await;

    let r1 = alice.initial(id, &private_handle());
    let r2 = alice.next(&r1);
    let bid = BranchId::random();
    let r3 = alice.next_unmerged(&r2, bid);
    for rmds in [&r1, &r2, &r3] {
        store.put(&ctx, rmds, None, None, NORMAL).await.unwrap();
    }

    let folders = store.folders().await.unwrap();
    assert_eq!(folders.len(), 1);
    let folder = &folders[0];
    assert_eq!(folder.id, id);
    assert_eq!(folder.handle.as_ref(), Some(&private_handle()));
    assert_eq!(folder.branches.len(), 2);
    assert_eq!(folder.branches[0].bid, BranchId::NULL);
    assert_eq!(folder.branches[0].head_revision, Revision(2));
    assert_eq!(folder.branches[1].bid, bid);
    assert_eq!(folder.branches[1].initial_revision, Revision(3));
    assert_eq!(folder.devices, vec![(alice.crypt_key, bid)]);

    let blocks = store.list_blocks(id, BranchId::NULL).await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].prev_root, r1.md_id().unwrap());
    assert_eq!(blocks[1].md_id, r2.md_id().unwrap());
    assert_eq!(blocks[1].last_modifying_user, alice.uid);

    let err = store.list_blocks(id, BranchId::random()).await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
}

#[tokio::test]
async fn test_audit_flags_corrupted_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mdserver.json");
    let ctx = RequestContext::new();
    let alice = alice();
    let clock = manual_clock();
    let open = || MdServerDisk::open(path.clone(), test_config(), alice.session(), Arc::new(NoTeams), clock.clone());

    let id = {
        let store = open().await.unwrap();
        let (id, _) = store
            .get_for_handle(&ctx, &private_handle(), MergeStatus::Merged, None)
            .await
            .unwrap();
        let r1 = alice.initial(id, &private_handle());
        let r2 = alice.next(&r1);
        let r3 = alice.next(&r2);
        for rmds in [&r1, &r2, &r3] {
            store.put(&ctx, rmds, None, None, NORMAL).await.unwrap();
        }
        let report = store.audit(&ctx, id).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.blocks_checked, 3);
        id
    };

    // Overwrite revision 2 on disk with bytes that do not decode.
    let mut snapshot: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    snapshot["state"]["md"][id.to_string()][BranchId::NULL.to_string()]["blocks"][1]["encoded"] =
        serde_json::Value::String("bm90IGEgYmxvY2s=".to_string());
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let store = open().await.unwrap();
    let report = store.audit(&ctx, id).await.unwrap();
    assert_eq!(report.blocks_checked, 3);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].revision, Revision(2));
    assert!(report.findings[0].problem.contains("undecodable"));
}

// ── Chain invariant ─────────────────────────────────────────────────────────

mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Attempt {
        Extend,
        Stale,
        WrongPrev,
        Repeat,
    }

    fn attempt() -> impl Strategy<Value = Attempt> {
        prop_oneof![
            3 => Just(Attempt::Extend),
            1 => Just(Attempt::Stale),
            1 => Just(Attempt::WrongPrev),
            1 => Just(Attempt::Repeat),
        ]
    }

    proptest! {
        #[test]
        fn stored_history_is_always_a_chain(attempts in proptest::collection::vec(attempt(), 1..25)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let ctx = RequestContext::new();
                let alice = alice();
                let store = store_for(&alice, manual_clock());
                let id = new_folder(&store).await;

                let mut accepted = vec![alice.initial(id, &private_handle())];
                store.put(&ctx, &accepted[0], None, None, NORMAL).await.unwrap();

                for a in attempts {
                    let head = accepted.last().unwrap().clone();
                    let candidate = match a {
                        Attempt::Extend => alice.next(&head),
                        Attempt::Repeat => head.clone(),
                        Attempt::Stale if accepted.len() > 1 => {
                            let mut c = alice.next(&accepted[accepted.len() - 2]);
                            c.md.writer_metadata.disk_usage += 100;
                            alice.sign(c.md)
                        }
                        Attempt::Stale => continue,
                        Attempt::WrongPrev => {
                            let mut md = alice.next(&head).md;
                            md.prev_root = MdId([0xAB; 32]);
                            alice.sign(md)
                        }
                    };
                    let res = store.put(&ctx, &candidate, None, None, NORMAL).await;
                    match a {
                        Attempt::Extend => {
                            res.unwrap();
                            accepted.push(candidate);
                        }
                        Attempt::Repeat => res.unwrap(),
                        _ => assert!(res.unwrap_err().is_retryable()),
                    }
                }

                let stored = store
                    .get_range(&ctx, id, BranchId::NULL, MergeStatus::Merged, Revision(1), Revision(1000), None)
                    .await
                    .unwrap();
                assert_eq!(stored.len(), accepted.len());
                for pair in stored.windows(2) {
                    pair[0]
                        .md
                        .check_valid_successor(&pair[0].md_id().unwrap(), &pair[1].md)
                        .unwrap();
                }
            });
        }
    }
}
