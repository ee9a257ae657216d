use std::sync::Arc;

use crate::utils::time::now_ms;
use crate::CoordinationError;
use crate::Error;
use crate::Lease;
use crate::LeaseMode;
use crate::LockConfig;
use crate::LockError;
use crate::LockManager;
use crate::MemoryRecordStore;
use crate::RecordStore;
use crate::VolumeRecord;
use crate::VolumeState;

struct TestContext {
    store: Arc<MemoryRecordStore>,
    lock_manager: LockManager<MemoryRecordStore>,
}

async fn setup() -> TestContext {
    let store = Arc::new(MemoryRecordStore::new());

    let mut record = VolumeRecord::new("vol-1", "pvc-demo", 1024);
    record.state = VolumeState::Provisioned;
    record.backend_id = Some("backend-1".to_string());
    store.put_volume(None, &record).await.expect("insert");

    let lock_manager = LockManager::new(store.clone(), LockConfig::default());
    TestContext {
        store,
        lock_manager,
    }
}

/// # Case 1: At most one exclusive lease at a time
///
/// ## Validation criterias:
/// 1. First exclusive acquire succeeds
/// 2. A second node's exclusive acquire fails with a lock Conflict
/// 3. After release, the second node acquires successfully
#[tokio::test]
async fn test_acquire_case1_exclusive_mutual_exclusion() {
    let ctx = setup().await;

    let lease_x = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-x")
        .await
        .expect("first exclusive grant");

    let result = ctx
        .lock_manager
        .acquire("vol-1", "node-y", LeaseMode::Exclusive, "tok-y")
        .await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Conflict { .. }
        )))
    ));

    ctx.lock_manager
        .release("vol-1", "node-x", lease_x.fencing_token)
        .await
        .expect("release");

    ctx.lock_manager
        .acquire("vol-1", "node-y", LeaseMode::Exclusive, "tok-y")
        .await
        .expect("grant after release");
}

/// # Case 2: Shared leases coexist; exclusive and shared exclude each other
#[tokio::test]
async fn test_acquire_case2_shared_semantics() {
    let ctx = setup().await;

    ctx.lock_manager
        .acquire("vol-1", "node-a", LeaseMode::Shared, "tok-a")
        .await
        .expect("first shared grant");
    ctx.lock_manager
        .acquire("vol-1", "node-b", LeaseMode::Shared, "tok-b")
        .await
        .expect("second shared grant");

    let record = ctx.store.get_volume("vol-1").await.unwrap().unwrap();
    assert_eq!(record.shared_owners.len(), 2);
    assert!(record.exclusive_owner.is_none());

    // Exclusive blocked while readers hold the volume
    let result = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-x")
        .await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Conflict { .. }
        )))
    ));

    // And shared blocked while an exclusive lease is held elsewhere
    let mut record2 = VolumeRecord::new("vol-2", "pvc-two", 1024);
    record2.state = VolumeState::Provisioned;
    ctx.store.put_volume(None, &record2).await.unwrap();
    ctx.lock_manager
        .acquire("vol-2", "node-x", LeaseMode::Exclusive, "tok-x")
        .await
        .expect("exclusive grant");
    let result = ctx
        .lock_manager
        .acquire("vol-2", "node-a", LeaseMode::Shared, "tok-a")
        .await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Conflict { .. }
        )))
    ));
}

/// # Case 3: Fencing tokens strictly increase across grants
#[tokio::test]
async fn test_acquire_case3_fencing_token_monotonicity() {
    let ctx = setup().await;

    let first = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-1")
        .await
        .unwrap();
    ctx.lock_manager
        .release("vol-1", "node-x", first.fencing_token)
        .await
        .unwrap();

    let second = ctx
        .lock_manager
        .acquire("vol-1", "node-y", LeaseMode::Exclusive, "tok-2")
        .await
        .unwrap();

    assert!(second.fencing_token > first.fencing_token);

    let record = ctx.store.get_volume("vol-1").await.unwrap().unwrap();
    assert_eq!(record.fencing_token, second.fencing_token);
}

/// # Case 4: Re-acquisition by the holder is idempotent
#[tokio::test]
async fn test_acquire_case4_idempotent_reacquire() {
    let ctx = setup().await;

    let first = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-1")
        .await
        .unwrap();
    let again = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-1")
        .await
        .unwrap();

    assert_eq!(first.fencing_token, again.fencing_token);
    let record = ctx.store.get_volume("vol-1").await.unwrap().unwrap();
    assert_eq!(record.fencing_token, first.fencing_token);
}

/// # Case 5: An expired lease blocks grants until explicitly revoked
///
/// ## Validation criterias:
/// 1. Acquire fails while the expired lease row remains
/// 2. revoke_expired returns the stale lease and clears the owner mark
/// 3. A new grant then succeeds with a higher fencing token
#[tokio::test]
async fn test_revoke_case5_expired_lease_blocks_until_revoked() {
    let ctx = setup().await;

    // Plant an already-expired exclusive lease
    let record = ctx.store.get_volume("vol-1").await.unwrap().unwrap();
    let mut owned = record.clone();
    owned.fencing_token += 1;
    owned.exclusive_owner = Some("node-dead".to_string());
    owned.bump();
    ctx.store
        .put_volume(Some(record.generation), &owned)
        .await
        .unwrap();
    ctx.store
        .put_lease(&Lease {
            volume_id: "vol-1".to_string(),
            node: "node-dead".to_string(),
            mode: LeaseMode::Exclusive,
            fencing_token: owned.fencing_token,
            expires_at_ms: now_ms() - 1,
            idempotency_token: "tok-dead".to_string(),
        })
        .await
        .unwrap();

    let result = ctx
        .lock_manager
        .acquire("vol-1", "node-y", LeaseMode::Exclusive, "tok-y")
        .await;
    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Conflict { .. }
        )))
    ));

    let revoked = ctx.lock_manager.revoke_expired("vol-1").await.unwrap();
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked[0].node, "node-dead");

    let record = ctx.store.get_volume("vol-1").await.unwrap().unwrap();
    assert!(record.exclusive_owner.is_none());

    let lease = ctx
        .lock_manager
        .acquire("vol-1", "node-y", LeaseMode::Exclusive, "tok-y")
        .await
        .expect("grant after revoke");
    assert!(lease.fencing_token > revoked[0].fencing_token);
}

/// # Case 6: Renewal extends a live lease and rejects an expired one
#[tokio::test]
async fn test_renew_case6_renewal_rules() {
    let ctx = setup().await;

    let lease = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-1")
        .await
        .unwrap();
    let renewed = ctx.lock_manager.renew(&lease).await.expect("renew");
    assert!(renewed.expires_at_ms >= lease.expires_at_ms);
    assert_eq!(renewed.fencing_token, lease.fencing_token);

    // Expired leases are not renewable
    let mut dead = renewed.clone();
    dead.expires_at_ms = now_ms() - 1;
    ctx.store.put_lease(&dead).await.unwrap();
    assert!(matches!(
        ctx.lock_manager.renew(&dead).await,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Expired { .. }
        )))
    ));
}

/// # Case 7: Release is fencing-checked and otherwise idempotent
#[tokio::test]
async fn test_release_case7_release_rules() {
    let ctx = setup().await;

    let lease = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-1")
        .await
        .unwrap();

    // Stale token rejected
    assert!(matches!(
        ctx.lock_manager
            .release("vol-1", "node-x", lease.fencing_token - 1)
            .await,
        Err(Error::Coordination(CoordinationError::Fenced { .. }))
    ));

    ctx.lock_manager
        .release("vol-1", "node-x", lease.fencing_token)
        .await
        .expect("release");

    // Releasing again is an ack, not an error
    ctx.lock_manager
        .release("vol-1", "node-x", lease.fencing_token)
        .await
        .expect("idempotent release");
}

/// # Case 8: verify_held confirms liveness and fencing before side effects
#[tokio::test]
async fn test_verify_case8_verify_held() {
    let ctx = setup().await;

    assert!(matches!(
        ctx.lock_manager.verify_held("vol-1", "node-x").await,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::NotHeld { .. }
        )))
    ));

    let lease = ctx
        .lock_manager
        .acquire("vol-1", "node-x", LeaseMode::Exclusive, "tok-1")
        .await
        .unwrap();
    let held = ctx
        .lock_manager
        .verify_held("vol-1", "node-x")
        .await
        .expect("held");
    assert_eq!(held.fencing_token, lease.fencing_token);

    // A fencing token bumped past the lease marks the holder stale
    let record = ctx.store.get_volume("vol-1").await.unwrap().unwrap();
    let mut bumped = record.clone();
    bumped.fencing_token += 1;
    bumped.bump();
    ctx.store
        .put_volume(Some(record.generation), &bumped)
        .await
        .unwrap();

    assert!(matches!(
        ctx.lock_manager.verify_held("vol-1", "node-x").await,
        Err(Error::Coordination(CoordinationError::Fenced { .. }))
    ));
}
