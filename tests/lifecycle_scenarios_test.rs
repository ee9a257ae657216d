//! End-to-end attachment scenarios driven through the CSI surface over
//! the in-memory record store and the fake backend.

use sanvol::test_utils::test_harness;
use sanvol::CoordinationError;
use sanvol::Error;
use sanvol::LeaseMode;
use sanvol::LockError;
use sanvol::RecordStore;
use sanvol::VolumeState;

const GIB: u64 = 1024 * 1024 * 1024;

/// # Scenario 1: Exclusive attachment hand-off between two nodes
///
/// Create(volA, 10Gi), Publish(volA, nodeX, exclusive) succeeds; a
/// concurrent Publish(volA, nodeY, exclusive) fails; after
/// Unpublish(volA, nodeX), Publish(volA, nodeY, exclusive) succeeds.
#[tokio::test]
async fn test_scenario1_exclusive_handoff() {
    let h = test_harness();

    let vol_a = h
        .lifecycle
        .create("vol-a", 10 * GIB, "create-a")
        .await
        .expect("create volA");

    // Two nodes race for the exclusive attachment
    let publish_x = h
        .lifecycle
        .publish(&vol_a.volume_id, "node-x", LeaseMode::Exclusive, "pub-x");
    let publish_y = h
        .lifecycle
        .publish(&vol_a.volume_id, "node-y", LeaseMode::Exclusive, "pub-y");
    let (result_x, result_y) = tokio::join!(publish_x, publish_y);

    let successes = [result_x.is_ok(), result_y.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(successes, 1, "exactly one exclusive publish may win");

    let (winner, loser_result) = if result_x.is_ok() {
        ("node-x", result_y)
    } else {
        ("node-y", result_x)
    };
    assert!(matches!(
        loser_result,
        Err(Error::Coordination(CoordinationError::Lock(
            LockError::Conflict { .. }
        )))
    ));

    let record = h.store.get_volume(&vol_a.volume_id).await.unwrap().unwrap();
    assert_eq!(record.state, VolumeState::Published);
    assert_eq!(record.exclusive_owner.as_deref(), Some(winner));

    // The loser retries after the winner detaches
    let loser = if winner == "node-x" { "node-y" } else { "node-x" };
    h.lifecycle
        .unpublish(&vol_a.volume_id, winner, "unpub-winner")
        .await
        .expect("winner detaches");

    let republished = h
        .lifecycle
        .publish(&vol_a.volume_id, loser, LeaseMode::Exclusive, "pub-retry")
        .await
        .expect("loser attaches after detach");
    assert_eq!(republished.exclusive_owner.as_deref(), Some(loser));
}

/// # Scenario 2: Delete ordering against an active attachment
///
/// Delete(volA) while Published fails with VolumeInUse; after
/// Unpublish(volA), Delete(volA) succeeds and a duplicate Delete is an
/// idempotent no-op.
#[tokio::test]
async fn test_scenario2_delete_ordering() {
    let h = test_harness();

    let vol_a = h
        .lifecycle
        .create("vol-a", 10 * GIB, "create-a")
        .await
        .expect("create volA");
    h.lifecycle
        .publish(&vol_a.volume_id, "node-x", LeaseMode::Exclusive, "pub-x")
        .await
        .expect("publish");

    assert!(matches!(
        h.lifecycle.delete(&vol_a.volume_id, "del-1").await,
        Err(Error::Coordination(CoordinationError::VolumeInUse { .. }))
    ));

    h.lifecycle
        .unpublish(&vol_a.volume_id, "node-x", "unpub-x")
        .await
        .expect("unpublish");

    let deleted = h
        .lifecycle
        .delete(&vol_a.volume_id, "del-1")
        .await
        .expect("delete after detach");
    assert_eq!(deleted.state, VolumeState::Deleted);

    let replayed = h
        .lifecycle
        .delete(&vol_a.volume_id, "del-1")
        .await
        .expect("duplicate delete");
    assert_eq!(replayed, deleted);
    assert_eq!(h.backend.executed_count("delete"), 1);
}

/// # Property: concurrent exclusive acquisition never double-grants
///
/// Many nodes hammer the same volume; at every point at most one
/// exclusive owner is recorded, and each successful grant carries a
/// strictly higher fencing token.
#[tokio::test]
async fn test_property_exclusive_mutual_exclusion_under_contention() {
    let h = test_harness();
    let vol = h
        .lifecycle
        .create("vol-contended", GIB, "create-1")
        .await
        .expect("create");

    let mut last_token = 0;
    for round in 0..5 {
        let mut handles = Vec::new();
        for node in ["node-a", "node-b", "node-c", "node-d"] {
            let lifecycle = h.lifecycle.clone();
            let volume_id = vol.volume_id.clone();
            let token = format!("pub-{}-{}", node, round);
            handles.push(tokio::spawn(async move {
                lifecycle
                    .publish(&volume_id, node, LeaseMode::Exclusive, &token)
                    .await
                    .map(|record| (node, record.fencing_token))
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(Ok(win)) = handle.await {
                winners.push(win);
            }
        }
        assert_eq!(winners.len(), 1, "round {}: one exclusive winner", round);

        let (winner, fencing_token) = winners[0];
        assert!(
            fencing_token > last_token,
            "fencing token must increase monotonically"
        );
        last_token = fencing_token;

        let record = h.store.get_volume(&vol.volume_id).await.unwrap().unwrap();
        assert_eq!(record.exclusive_owner.as_deref(), Some(winner));

        h.lifecycle
            .unpublish(&vol.volume_id, winner, &format!("unpub-{}", round))
            .await
            .expect("detach between rounds");
    }
}

/// # Property: shared readers coexist and detach independently
#[tokio::test]
async fn test_property_shared_readers() {
    let h = test_harness();
    let vol = h
        .lifecycle
        .create("vol-shared", GIB, "create-1")
        .await
        .expect("create");
    let backend_id = vol.backend_id.clone().unwrap();

    for node in ["node-a", "node-b", "node-c"] {
        h.lifecycle
            .publish(&vol.volume_id, node, LeaseMode::Shared, &format!("pub-{}", node))
            .await
            .expect("shared publish");
    }
    assert_eq!(h.backend.mapped_nodes(&backend_id).len(), 3);

    // A writer is fenced out while any reader remains
    assert!(h
        .lifecycle
        .publish(&vol.volume_id, "node-w", LeaseMode::Exclusive, "pub-w")
        .await
        .is_err());

    for node in ["node-a", "node-b"] {
        h.lifecycle
            .unpublish(&vol.volume_id, node, &format!("unpub-{}", node))
            .await
            .expect("reader detach");
    }
    let record = h.store.get_volume(&vol.volume_id).await.unwrap().unwrap();
    assert_eq!(record.state, VolumeState::Published);
    assert_eq!(record.shared_owners.len(), 1);

    h.lifecycle
        .unpublish(&vol.volume_id, "node-c", "unpub-c")
        .await
        .expect("last reader detach");

    let writer = h
        .lifecycle
        .publish(&vol.volume_id, "node-w", LeaseMode::Exclusive, "pub-w2")
        .await
        .expect("writer after readers leave");
    assert_eq!(writer.exclusive_owner.as_deref(), Some("node-w"));
}
