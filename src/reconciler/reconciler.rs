use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend_node_token;
use crate::backend_token;
use crate::metrics;
use crate::utils::time::now_ms;
use crate::BackendExecutor;
use crate::LockManager;
use crate::OperationKind;
use crate::Outcome;
use crate::RecordEvent;
use crate::RecordStore;
use crate::ReconcilerConfig;
use crate::Result;
use crate::VolumeRecord;
use crate::VolumeState;

/// Converges volume records with backend ground truth.
///
/// Interval-driven scans plus store change wakeups. A volume stuck in an
/// in-flight state past the staleness threshold gets its pending
/// transition completed (the backend confirms it already happened) or
/// re-issued (it did not), always under the same derived idempotency
/// token the original transition used. Inconclusive outcomes are counted
/// per volume; past the bound the volume is parked in `Error` for
/// operator intervention.
pub struct Reconciler<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    store: Arc<R>,
    backend: Arc<B>,
    lock_manager: Arc<LockManager<R>>,
    config: ReconcilerConfig,
    tombstone_retention_ms: u64,
    /// Inconclusive attempts per volume. A short-lived cache: it resets
    /// with the process, the bound only governs operator surfacing.
    attempts: DashMap<String, u32>,
    shutdown_signal: watch::Receiver<()>,
}

impl<R, B> Reconciler<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    pub fn new(
        store: Arc<R>,
        backend: Arc<B>,
        lock_manager: Arc<LockManager<R>>,
        config: ReconcilerConfig,
        tombstone_retention_ms: u64,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            store,
            backend,
            lock_manager,
            config,
            tombstone_retention_ms,
            attempts: DashMap::new(),
            shutdown_signal,
        }
    }

    /// Runs until the shutdown signal fires
    pub async fn run(self) -> Result<()> {
        info!(
            "reconciler started (scan every {}ms, staleness {}ms)",
            self.config.scan_interval_ms, self.config.staleness_threshold_ms
        );

        let mut tick = interval(Duration::from_millis(self.config.scan_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.store.subscribe();
        let mut shutdown = self.shutdown_signal.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    return Ok(());
                }
                _ = tick.tick() => {
                    self.scan().await;
                }
                event = events.recv() => {
                    match event {
                        Ok(RecordEvent::VolumeUpdated { volume_id, .. }) => {
                            self.reconcile_by_id(&volume_id).await;
                        }
                        Ok(RecordEvent::VolumeRemoved { .. }) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("reconciler wakeups lagged by {}, next scan covers them", skipped);
                        }
                        Err(RecvError::Closed) => {
                            warn!("record event channel closed");
                        }
                    }
                }
            }
        }
    }

    /// One full pass over every volume record
    pub async fn scan(&self) {
        let records = match self.store.list_volumes().await {
            Ok(records) => records,
            Err(e) => {
                error!("reconciler scan failed to list volumes: {:?}", e);
                return;
            }
        };

        metrics::observe_volume_states(&records);

        for record in records {
            if let Err(e) = self.reconcile_volume(&record).await {
                warn!("reconcile of {} failed: {:?}", record.volume_id, e);
            }
        }
    }

    async fn reconcile_by_id(
        &self,
        volume_id: &str,
    ) {
        match self.store.get_volume(volume_id).await {
            Ok(Some(record)) => {
                if let Err(e) = self.reconcile_volume(&record).await {
                    warn!("reconcile of {} failed: {:?}", volume_id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("reconcile read of {} failed: {:?}", volume_id, e),
        }
    }

    /// Applies at most one corrective step to a volume. Later steps pick
    /// up where this one left off; a CAS conflict simply defers to the
    /// next pass.
    pub async fn reconcile_volume(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        // Tombstones: drop the record and its journal once the
        // idempotency window has passed
        if record.is_tombstone() {
            let expired = record
                .deleted_at_ms
                .map(|at| at + self.tombstone_retention_ms <= now_ms())
                .unwrap_or(true);
            if expired {
                info!("garbage-collecting tombstone {}", record.volume_id);
                self.store.remove_receipts(&record.volume_id).await?;
                self.store.remove_volume(&record.volume_id).await?;
                self.attempts.remove(&record.volume_id);
                metrics::observe_reconciler_correction("tombstone_gc");
            }
            return Ok(());
        }

        if record.state == VolumeState::Error {
            return Ok(());
        }

        // Expired leases are revoked regardless of staleness; the fenced
        // node is unmapped first so it cannot keep writing
        if self.revoke_expired_leases(record).await? {
            return Ok(());
        }

        let age_ms = now_ms().saturating_sub(record.last_transition_ms);
        if age_ms < self.config.staleness_threshold_ms {
            return Ok(());
        }

        if let Some(pending) = record.pending_resize {
            return self.finish_resize(record, pending.target_size, pending.generation).await;
        }

        match record.state {
            VolumeState::Pending => self.finish_create(record).await,
            VolumeState::Provisioned | VolumeState::Unpublished if record.has_owner() => {
                self.finish_publish(record).await
            }
            // A later reader can be stranded half-mapped on a volume
            // that is already attached: its owner mark committed but
            // the map reply was lost while other readers kept the
            // state Published or beyond
            VolumeState::Published | VolumeState::Staged | VolumeState::InUse
                if record.has_owner() =>
            {
                self.finish_publish(record).await
            }
            VolumeState::Unstaging => self.finish_unpublish(record).await,
            VolumeState::Deleting => self.finish_delete(record).await,
            _ => Ok(()),
        }
    }

    /// Revokes expired leases and unmaps the fenced nodes. Returns true
    /// if this pass took a corrective action.
    async fn revoke_expired_leases(
        &self,
        record: &VolumeRecord,
    ) -> Result<bool> {
        let now = now_ms();
        let expired: Vec<_> = self
            .store
            .list_leases(&record.volume_id)
            .await?
            .into_iter()
            .filter(|l| l.is_expired(now))
            .collect();
        if expired.is_empty() {
            return Ok(false);
        }

        if let Some(backend_id) = record.backend_id.as_deref() {
            for lease in &expired {
                warn!(
                    "unmapping fenced node {} from volume {}",
                    lease.node, record.volume_id
                );
                let token = backend_node_token(
                    &record.volume_id,
                    OperationKind::Unpublish,
                    record.generation,
                    &lease.node,
                );
                let outcome = self.backend.unmap_volume(backend_id, &lease.node, &token).await?;
                metrics::observe_backend_outcome("unmap", &outcome);
                if outcome.is_unknown() {
                    return self.note_inconclusive(record).await.map(|_| true);
                }
            }
        }

        self.lock_manager.revoke_expired(&record.volume_id).await?;

        // With the fenced owner gone, an attached state falls back to
        // Unpublished
        if let Some(fresh) = self.store.get_volume(&record.volume_id).await? {
            if !fresh.has_owner()
                && matches!(
                    fresh.state,
                    VolumeState::Published | VolumeState::Staged | VolumeState::InUse | VolumeState::Unstaging
                )
            {
                let mut updated = fresh.clone();
                updated.state = VolumeState::Unpublished;
                updated.bump();
                self.store.put_volume(Some(fresh.generation), &updated).await?;
            }
        }

        self.conclude(&record.volume_id, "lease_revoked");
        Ok(true)
    }

    /// Pending past the threshold: the create either happened (complete
    /// it) or is re-issued under the original token
    async fn finish_create(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        let token = backend_token(&record.volume_id, OperationKind::Create, record.generation);
        let outcome = self
            .backend
            .create_volume(record.requested_size, &token)
            .await?;
        metrics::observe_backend_outcome("create", &outcome);

        match outcome {
            Outcome::Success(backend_id) => {
                let mut updated = record.clone();
                updated.backend_id = Some(backend_id);
                updated.state = VolumeState::Provisioned;
                updated.bump();
                self.store
                    .put_volume(Some(record.generation), &updated)
                    .await?;
                self.conclude(&record.volume_id, "create_completed");
                Ok(())
            }
            _ => self.note_inconclusive(record).await,
        }
    }

    /// An owner committed but its map never confirmed: probe, then map
    /// the missing nodes with their granted fencing tokens. Covers both
    /// a half-done first publish and a later reader stranded on an
    /// already-attached volume.
    async fn finish_publish(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        let backend_id = match record.backend_id.as_deref() {
            Some(backend_id) => backend_id,
            None => return self.note_inconclusive(record).await,
        };
        let report = self.backend.probe_volume(backend_id).await?;

        let mut restored = false;
        for node in record.owners() {
            if report.mapped_nodes.contains(&node) {
                continue;
            }
            let lease = match self.store.get_lease(&record.volume_id, &node).await? {
                Some(lease) => lease,
                None => {
                    // Grant committed but the lease row never landed;
                    // treat the orphaned owner as expired
                    warn!(
                        "owner {} of {} has no lease, clearing",
                        node, record.volume_id
                    );
                    self.clear_orphaned_owner(record, &node).await?;
                    self.conclude(&record.volume_id, "orphaned_owner_cleared");
                    return Ok(());
                }
            };
            let token = backend_node_token(
                &record.volume_id,
                OperationKind::Publish,
                record.generation,
                &node,
            );
            let outcome = self
                .backend
                .map_volume(backend_id, &node, lease.fencing_token, &token)
                .await?;
            metrics::observe_backend_outcome("map", &outcome);
            if !matches!(outcome, Outcome::Success(())) {
                return self.note_inconclusive(record).await;
            }
            restored = true;
        }

        // Already-attached states keep their place in the lifecycle;
        // only a half-done first publish commits Published
        if matches!(
            record.state,
            VolumeState::Provisioned | VolumeState::Unpublished
        ) {
            let mut updated = record.clone();
            updated.state = VolumeState::Published;
            updated.bump();
            self.store
                .put_volume(Some(record.generation), &updated)
                .await?;
            self.conclude(&record.volume_id, "publish_completed");
        } else if restored {
            self.conclude(&record.volume_id, "mapping_restored");
        }
        Ok(())
    }

    /// Unstaging past the threshold: finish the unmap, release the
    /// leases and commit Unpublished
    async fn finish_unpublish(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        for node in record.owners() {
            if let Some(backend_id) = record.backend_id.as_deref() {
                let token = backend_node_token(
                    &record.volume_id,
                    OperationKind::Unpublish,
                    record.generation,
                    &node,
                );
                let outcome = self.backend.unmap_volume(backend_id, &node, &token).await?;
                metrics::observe_backend_outcome("unmap", &outcome);
                if outcome.is_unknown() {
                    return self.note_inconclusive(record).await;
                }
            }
            match self.store.get_lease(&record.volume_id, &node).await? {
                Some(lease) => {
                    self.lock_manager
                        .release(&record.volume_id, &node, lease.fencing_token)
                        .await?;
                }
                None => self.clear_orphaned_owner(record, &node).await?,
            }
        }

        let fresh = match self.store.get_volume(&record.volume_id).await? {
            Some(fresh) => fresh,
            None => return Ok(()),
        };
        if !fresh.has_owner() && fresh.state == VolumeState::Unstaging {
            let mut updated = fresh.clone();
            updated.state = VolumeState::Unpublished;
            updated.bump();
            self.store.put_volume(Some(fresh.generation), &updated).await?;
        }
        self.conclude(&record.volume_id, "unpublish_completed");
        Ok(())
    }

    /// Deleting past the threshold: probe ground truth, re-issue the
    /// delete only if the backend volume still exists
    async fn finish_delete(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        let backend_id = match record.backend_id.as_deref() {
            Some(backend_id) => backend_id,
            None => {
                return self.commit_deleted(record).await;
            }
        };

        let report = self.backend.probe_volume(backend_id).await?;
        if !report.exists {
            return self.commit_deleted(record).await;
        }

        let token = backend_token(&record.volume_id, OperationKind::Delete, record.generation);
        let outcome = self.backend.delete_volume(backend_id, &token).await?;
        metrics::observe_backend_outcome("delete", &outcome);
        match outcome {
            Outcome::Success(()) => self.commit_deleted(record).await,
            _ => self.note_inconclusive(record).await,
        }
    }

    /// Resize marker past the threshold: probe the size, commit if the
    /// backend already grew the volume, otherwise re-issue
    async fn finish_resize(
        &self,
        record: &VolumeRecord,
        target_size: u64,
        marker_generation: u64,
    ) -> Result<()> {
        let backend_id = match record.backend_id.as_deref() {
            Some(backend_id) => backend_id,
            None => return self.note_inconclusive(record).await,
        };

        let report = self.backend.probe_volume(backend_id).await?;
        if report.exists && report.size < target_size {
            let token = backend_token(&record.volume_id, OperationKind::Resize, marker_generation);
            let outcome = self
                .backend
                .resize_volume(backend_id, target_size, &token)
                .await?;
            metrics::observe_backend_outcome("resize", &outcome);
            if !matches!(outcome, Outcome::Success(())) {
                return self.note_inconclusive(record).await;
            }
        }

        let mut updated = record.clone();
        updated.requested_size = target_size;
        updated.pending_resize = None;
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        self.conclude(&record.volume_id, "resize_completed");
        Ok(())
    }

    async fn commit_deleted(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        let mut updated = record.clone();
        updated.state = VolumeState::Deleted;
        updated.deleted_at_ms = Some(now_ms());
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        self.conclude(&record.volume_id, "delete_completed");
        Ok(())
    }

    async fn clear_orphaned_owner(
        &self,
        record: &VolumeRecord,
        node: &str,
    ) -> Result<()> {
        let fresh = match self.store.get_volume(&record.volume_id).await? {
            Some(fresh) => fresh,
            None => return Ok(()),
        };
        let mut updated = fresh.clone();
        if updated.exclusive_owner.as_deref() == Some(node) {
            updated.exclusive_owner = None;
        }
        updated.shared_owners.remove(node);
        updated.bump();
        self.store.put_volume(Some(fresh.generation), &updated).await
    }

    /// Counts an inconclusive attempt; past the bound the volume is
    /// parked in Error and surfaced
    async fn note_inconclusive(
        &self,
        record: &VolumeRecord,
    ) -> Result<()> {
        let attempts = {
            let mut entry = self.attempts.entry(record.volume_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        debug!(
            "inconclusive reconcile of {} (attempt {}/{})",
            record.volume_id, attempts, self.config.max_attempts
        );

        if attempts < self.config.max_attempts {
            return Ok(());
        }

        error!(
            "volume {} still diverged after {} attempts, marking Error",
            record.volume_id, attempts
        );
        let mut updated = record.clone();
        updated.state = VolumeState::Error;
        updated.bump();
        updated.reconcile_attempts = attempts;
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        self.attempts.remove(&record.volume_id);
        metrics::observe_reconciler_correction("marked_error");
        Ok(())
    }

    fn conclude(
        &self,
        volume_id: &str,
        case: &'static str,
    ) {
        self.attempts.remove(volume_id);
        metrics::observe_reconciler_correction(case);
    }
}
