use std::sync::Arc;

use crate::test_utils::test_harness;
use crate::test_utils::Fault;
use crate::BackendError;
use crate::CoordinationError;
use crate::Error;
use crate::FailureReason;
use crate::LeaseMode;
use crate::LockError;
use crate::LockManager;
use crate::MemoryRecordStore;
use crate::MockBackendExecutor;
use crate::Outcome;
use crate::RecordStore;
use crate::SystemError;
use crate::TransitionError;
use crate::VolumeLifecycle;
use crate::VolumeRecord;
use crate::VolumeState;

const GIB: u64 = 1024 * 1024 * 1024;

/// # Case 1: Create drives Pending to Provisioned
///
/// ## Validation criterias:
/// 1. The record is Provisioned with a backend id
/// 2. The backend volume exists with the requested size
/// 3. The generation advanced past the initial insert
#[tokio::test]
async fn test_create_case1_provisions_volume() {
    let h = test_harness();

    let record = h
        .lifecycle
        .create("pvc-demo", 10 * GIB, "create-1")
        .await
        .expect("create");

    assert_eq!(record.state, VolumeState::Provisioned);
    let backend_id = record.backend_id.clone().unwrap();
    assert!(h.backend.volume_exists(&backend_id));
    assert_eq!(h.backend.volume_size(&backend_id), Some(10 * GIB));
    assert!(record.generation > 1);

    let stored = h.store.get_volume(&record.volume_id).await.unwrap().unwrap();
    assert_eq!(stored, record);
}

/// # Case 2: Create replays idempotently
///
/// ## Validation criterias:
/// 1. The same token yields the identical response
/// 2. Only one backend side effect happened
/// 3. The same name and size without the token also replays
#[tokio::test]
async fn test_create_case2_idempotent_replay() {
    let h = test_harness();

    let first = h
        .lifecycle
        .create("pvc-demo", 10 * GIB, "create-1")
        .await
        .expect("create");
    let second = h
        .lifecycle
        .create("pvc-demo", 10 * GIB, "create-1")
        .await
        .expect("replay");

    assert_eq!(first, second);
    assert_eq!(h.backend.executed_count("create"), 1);

    let by_name = h
        .lifecycle
        .create("pvc-demo", 10 * GIB, "create-other")
        .await
        .expect("replay by name");
    assert_eq!(by_name.volume_id, first.volume_id);
    assert_eq!(h.backend.executed_count("create"), 1);

    // Same name, different size is a distinct volume request
    let result = h.lifecycle.create("pvc-demo", 20 * GIB, "create-2").await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::AlreadyExists { .. }))
    ));
}

/// # Case 3: CapacityExceeded keeps the record Pending and retryable
#[tokio::test]
async fn test_create_case3_capacity_exceeded_retryable() {
    let h = test_harness();
    h.backend
        .inject("create", Fault::Fail(FailureReason::CapacityExceeded));

    let result = h.lifecycle.create("pvc-demo", 10 * GIB, "create-1").await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::CapacityExceeded { .. }))
    ));

    let pending = h.store.find_volume_by_name("pvc-demo").await.unwrap().unwrap();
    assert_eq!(pending.state, VolumeState::Pending);

    // Capacity freed up; the same request now completes
    let record = h
        .lifecycle
        .create("pvc-demo", 10 * GIB, "create-1")
        .await
        .expect("retry");
    assert_eq!(record.state, VolumeState::Provisioned);
    assert_eq!(record.volume_id, pending.volume_id);
}

/// # Case 4: Publish acquires the lease, maps the node and commits
#[tokio::test]
async fn test_publish_case4_exclusive_publish() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();

    let published = h
        .lifecycle
        .publish(&created.volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
        .await
        .expect("publish");

    assert_eq!(published.state, VolumeState::Published);
    assert_eq!(published.exclusive_owner.as_deref(), Some("node-x"));
    assert!(published.fencing_token > created.fencing_token);

    let backend_id = published.backend_id.clone().unwrap();
    assert_eq!(h.backend.mapped_nodes(&backend_id), vec!["node-x"]);

    // Idempotent repeat
    let again = h
        .lifecycle
        .publish(&created.volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
        .await
        .expect("republish");
    assert_eq!(again, published);
    assert_eq!(h.backend.executed_count("map"), 1);
}

/// # Case 5: A conflicting exclusive publish fails until the holder detaches
#[tokio::test]
async fn test_publish_case5_exclusive_conflict() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();

    h.lifecycle
        .publish(&created.volume_id, "node-x", LeaseMode::Exclusive, "pub-x")
        .await
        .expect("first publish");

    let result = h
        .lifecycle
        .publish(&created.volume_id, "node-y", LeaseMode::Exclusive, "pub-y")
        .await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Conflict { .. }
        )))
    ));

    h.lifecycle
        .unpublish(&created.volume_id, "node-x", "unpub-x")
        .await
        .expect("unpublish");

    let published = h
        .lifecycle
        .publish(&created.volume_id, "node-y", LeaseMode::Exclusive, "pub-y")
        .await
        .expect("publish after detach");
    assert_eq!(published.exclusive_owner.as_deref(), Some("node-y"));
}

/// # Case 6: An Unknown map outcome is deferred, leaving the in-flight shape
#[tokio::test]
async fn test_publish_case6_unknown_outcome_deferred() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    h.backend.inject("map", Fault::Unknown);

    let result = h
        .lifecycle
        .publish(&created.volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
        .await;
    assert!(matches!(
        result,
        Err(Error::System(SystemError::Backend(BackendError::Unknown { .. })))
    ));

    // Owner committed by the grant, state not yet Published: the shape
    // the reconciler completes from
    let record = h.store.get_volume(&created.volume_id).await.unwrap().unwrap();
    assert_eq!(record.state, VolumeState::Provisioned);
    assert_eq!(record.exclusive_owner.as_deref(), Some("node-x"));
}

/// # Case 7: Stage, mark_in_use and unstage follow the attachment chain
#[tokio::test]
async fn test_stage_case7_stage_chain() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();

    // Staging before publish is illegal
    assert!(matches!(
        h.lifecycle.stage(&volume_id, "node-x", "stage-1").await,
        Err(Error::Coordination(CoordinationError::Transition(
            TransitionError::Illegal { .. }
        )))
    ));

    h.lifecycle
        .publish(&volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
        .await
        .unwrap();

    let staged = h
        .lifecycle
        .stage(&volume_id, "node-x", "stage-1")
        .await
        .expect("stage");
    assert_eq!(staged.state, VolumeState::Staged);

    let in_use = h
        .lifecycle
        .mark_in_use(&volume_id, "node-x")
        .await
        .expect("mark_in_use");
    assert_eq!(in_use.state, VolumeState::InUse);

    let unstaging = h
        .lifecycle
        .unstage(&volume_id, "node-x", "unstage-1")
        .await
        .expect("unstage");
    assert_eq!(unstaging.state, VolumeState::Unstaging);

    let unpublished = h
        .lifecycle
        .unpublish(&volume_id, "node-x", "unpub-1")
        .await
        .expect("unpublish");
    assert_eq!(unpublished.state, VolumeState::Unpublished);
    assert!(!unpublished.has_owner());
}

/// # Case 8: Shared readers detach one at a time
///
/// ## Validation criterias:
/// 1. The volume stays Published while a reader remains
/// 2. It reaches Unpublished when the last reader leaves
#[tokio::test]
async fn test_unpublish_case8_shared_readers() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();

    h.lifecycle
        .publish(&volume_id, "node-a", LeaseMode::Shared, "pub-a")
        .await
        .unwrap();
    h.lifecycle
        .publish(&volume_id, "node-b", LeaseMode::Shared, "pub-b")
        .await
        .unwrap();

    let backend_id = created.backend_id.clone().unwrap();
    assert_eq!(h.backend.mapped_nodes(&backend_id).len(), 2);

    let after_first = h
        .lifecycle
        .unpublish(&volume_id, "node-a", "unpub-a")
        .await
        .expect("first unpublish");
    assert_eq!(after_first.state, VolumeState::Published);
    assert!(after_first.shared_owners.contains("node-b"));

    let after_last = h
        .lifecycle
        .unpublish(&volume_id, "node-b", "unpub-b")
        .await
        .expect("last unpublish");
    assert_eq!(after_last.state, VolumeState::Unpublished);
    assert!(!after_last.has_owner());
}

/// # Case 9: Delete refuses an attached volume, then tombstones
///
/// ## Validation criterias:
/// 1. Delete while Published fails with VolumeInUse
/// 2. Delete after Unpublish commits Deleted and removes the backend volume
/// 3. A repeated Delete is an idempotent no-op
#[tokio::test]
async fn test_delete_case9_delete_flow() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();
    let backend_id = created.backend_id.clone().unwrap();

    h.lifecycle
        .publish(&volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
        .await
        .unwrap();

    let result = h.lifecycle.delete(&volume_id, "del-1").await;
    match result {
        Err(Error::Coordination(CoordinationError::VolumeInUse { holders, .. })) => {
            assert_eq!(holders, vec!["node-x".to_string()]);
        }
        other => panic!("expected VolumeInUse, got {:?}", other),
    }

    h.lifecycle
        .unpublish(&volume_id, "node-x", "unpub-1")
        .await
        .unwrap();

    let deleted = h.lifecycle.delete(&volume_id, "del-1").await.expect("delete");
    assert_eq!(deleted.state, VolumeState::Deleted);
    assert!(deleted.deleted_at_ms.is_some());
    assert!(!h.backend.volume_exists(&backend_id));

    let again = h.lifecycle.delete(&volume_id, "del-1").await.expect("re-delete");
    assert_eq!(again, deleted);
    let fresh_token = h
        .lifecycle
        .delete(&volume_id, "del-2")
        .await
        .expect("re-delete, new token");
    assert_eq!(fresh_token.state, VolumeState::Deleted);
    assert_eq!(h.backend.executed_count("delete"), 1);
}

/// # Case 10: Deleting a volume that never provisioned skips the backend
#[tokio::test]
async fn test_delete_case10_pending_delete_skips_backend() {
    let h = test_harness();
    h.backend
        .inject("create", Fault::Fail(FailureReason::CapacityExceeded));
    let _ = h.lifecycle.create("pvc-demo", GIB, "create-1").await;

    let pending = h.store.find_volume_by_name("pvc-demo").await.unwrap().unwrap();
    let deleted = h
        .lifecycle
        .delete(&pending.volume_id, "del-1")
        .await
        .expect("delete pending");

    assert_eq!(deleted.state, VolumeState::Deleted);
    assert_eq!(h.backend.executed_count("delete"), 0);
}

/// # Case 11: Resize re-enters the same state and clears its marker
#[tokio::test]
async fn test_resize_case11_resize_rules() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();
    let backend_id = created.backend_id.clone().unwrap();

    let resized = h
        .lifecycle
        .resize(&volume_id, 2 * GIB, "resize-1")
        .await
        .expect("resize");
    assert_eq!(resized.state, VolumeState::Provisioned);
    assert_eq!(resized.requested_size, 2 * GIB);
    assert!(resized.pending_resize.is_none());
    assert_eq!(h.backend.volume_size(&backend_id), Some(2 * GIB));

    // Shrinking (or matching) requests are satisfied as-is
    let unchanged = h
        .lifecycle
        .resize(&volume_id, GIB, "resize-2")
        .await
        .expect("no-op resize");
    assert_eq!(unchanged.requested_size, 2 * GIB);
    assert_eq!(h.backend.executed_count("resize"), 1);
}

/// # Case 12: A pending resize blocks a conflicting resize
#[tokio::test]
async fn test_resize_case12_resize_in_progress() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();

    // Crash mid-resize: marker committed, outcome lost
    h.backend.inject("resize", Fault::Unknown);
    let result = h.lifecycle.resize(&volume_id, 2 * GIB, "resize-1").await;
    assert!(matches!(
        result,
        Err(Error::System(SystemError::Backend(BackendError::Unknown { .. })))
    ));

    let record = h.store.get_volume(&volume_id).await.unwrap().unwrap();
    assert!(record.pending_resize.is_some());

    // A different target is rejected while the marker stands
    let result = h.lifecycle.resize(&volume_id, 4 * GIB, "resize-2").await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Transition(
            TransitionError::ResizeInProgress { .. }
        )))
    ));

    // The same target resumes through the marker
    let resized = h
        .lifecycle
        .resize(&volume_id, 2 * GIB, "resize-1b")
        .await
        .expect("resumed resize");
    assert_eq!(resized.requested_size, 2 * GIB);
    assert!(resized.pending_resize.is_none());
}

/// # Case 13: Snapshot produces an independent provenance-linked record
#[tokio::test]
async fn test_snapshot_case13_snapshot_rules() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();

    let snapshot = h
        .lifecycle
        .snapshot(&volume_id, "snap-demo", "snap-1")
        .await
        .expect("snapshot");
    assert_eq!(snapshot.state, VolumeState::Provisioned);
    assert_eq!(snapshot.source_volume.as_deref(), Some(volume_id.as_str()));
    assert_ne!(snapshot.volume_id, volume_id);
    assert_ne!(snapshot.backend_id, created.backend_id);

    // Idempotent repeat
    let again = h
        .lifecycle
        .snapshot(&volume_id, "snap-demo", "snap-1")
        .await
        .expect("replay");
    assert_eq!(again.volume_id, snapshot.volume_id);
    assert_eq!(h.backend.executed_count("snapshot"), 1);
}

/// # Case 14: Online snapshot is gated on the backend capability
#[tokio::test]
async fn test_snapshot_case14_online_snapshot_gate() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();

    h.lifecycle
        .publish(&volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
        .await
        .unwrap();
    h.lifecycle.stage(&volume_id, "node-x", "stage-1").await.unwrap();
    h.lifecycle.mark_in_use(&volume_id, "node-x").await.unwrap();

    let result = h.lifecycle.snapshot(&volume_id, "snap-demo", "snap-1").await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Transition(
            TransitionError::OnlineSnapshotUnsupported
        )))
    ));

    h.backend.set_online_snapshot(true);
    let snapshot = h
        .lifecycle
        .snapshot(&volume_id, "snap-demo", "snap-1")
        .await
        .expect("online snapshot");
    assert_eq!(snapshot.source_volume.as_deref(), Some(volume_id.as_str()));
}

/// # Case 15: Generations strictly increase across committed transitions
#[tokio::test]
async fn test_generation_case15_strictly_increasing() {
    let h = test_harness();
    let mut last = 0;

    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();
    assert!(created.generation > last);
    last = created.generation;

    for (record, label) in [
        (
            h.lifecycle
                .publish(&volume_id, "node-x", LeaseMode::Exclusive, "pub-1")
                .await
                .unwrap(),
            "publish",
        ),
        (
            h.lifecycle.stage(&volume_id, "node-x", "stage-1").await.unwrap(),
            "stage",
        ),
        (
            h.lifecycle.mark_in_use(&volume_id, "node-x").await.unwrap(),
            "mark_in_use",
        ),
        (
            h.lifecycle
                .unstage(&volume_id, "node-x", "unstage-1")
                .await
                .unwrap(),
            "unstage",
        ),
        (
            h.lifecycle
                .unpublish(&volume_id, "node-x", "unpub-1")
                .await
                .unwrap(),
            "unpublish",
        ),
        (
            h.lifecycle.delete(&volume_id, "del-1").await.unwrap(),
            "delete",
        ),
    ] {
        assert!(
            record.generation > last,
            "{} did not advance the generation",
            label
        );
        last = record.generation;
    }
}

/// # Case 16: A deleted volume's name is free for reuse
#[tokio::test]
async fn test_create_case16_name_reuse_after_delete() {
    let h = test_harness();

    let first = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    h.lifecycle.delete(&first.volume_id, "del-1").await.unwrap();

    let second = h
        .lifecycle
        .create("pvc-demo", GIB, "create-2")
        .await
        .expect("recreate");
    assert_ne!(second.volume_id, first.volume_id);
    assert_eq!(second.state, VolumeState::Provisioned);
    assert_eq!(h.backend.executed_count("create"), 2);
}

/// # Case 17: A publish retry by the holder re-issues a lost map
///
/// ## Validation criterias:
/// 1. The retry succeeds instead of trusting the held lease
/// 2. The missing backend mapping is restored
#[tokio::test]
async fn test_publish_case17_retry_restores_lost_map() {
    let h = test_harness();
    let created = h
        .lifecycle
        .create("pvc-demo", GIB, "create-1")
        .await
        .unwrap();
    let volume_id = created.volume_id.clone();
    let backend_id = created.backend_id.clone().unwrap();

    h.lifecycle
        .publish(&volume_id, "node-a", LeaseMode::Shared, "pub-a")
        .await
        .unwrap();

    // The second reader's owner mark commits but its map reply is lost
    h.backend.inject("map", Fault::Unknown);
    assert!(h
        .lifecycle
        .publish(&volume_id, "node-b", LeaseMode::Shared, "pub-b")
        .await
        .is_err());
    assert_eq!(h.backend.mapped_nodes(&backend_id), vec!["node-a"]);

    let retried = h
        .lifecycle
        .publish(&volume_id, "node-b", LeaseMode::Shared, "pub-b")
        .await
        .expect("retry");
    assert_eq!(retried.state, VolumeState::Published);
    assert_eq!(h.backend.mapped_nodes(&backend_id).len(), 2);
}

/// # Case 18: The map command carries the granted fencing token
#[tokio::test]
async fn test_publish_case18_map_presents_fencing_token() {
    let store = Arc::new(MemoryRecordStore::new());
    let mut backend = MockBackendExecutor::new();

    let mut record = VolumeRecord::new("vol-1", "pvc-demo", GIB);
    record.state = VolumeState::Provisioned;
    record.backend_id = Some("lv-9".to_string());
    store.put_volume(None, &record).await.unwrap();

    // The volume has seen no grant yet, so the first lease carries token 1
    backend
        .expect_map_volume()
        .times(1)
        .withf(|backend_id, node, fencing_token, _| {
            backend_id == "lv-9" && node == "node-x" && *fencing_token == 1
        })
        .returning(|_, _, _, _| Ok(Outcome::Success(())));

    let lock_manager = Arc::new(LockManager::new(
        store.clone(),
        crate::LockConfig::default(),
    ));
    let lifecycle = VolumeLifecycle::new(
        store.clone(),
        Arc::new(backend),
        lock_manager,
        crate::test_utils::fast_retry(),
    );

    let published = lifecycle
        .publish("vol-1", "node-x", LeaseMode::Exclusive, "pub-1")
        .await
        .expect("publish");
    assert_eq!(published.fencing_token, 1);
}
