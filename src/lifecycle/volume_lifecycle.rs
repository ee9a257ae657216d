use std::sync::Arc;

use autometrics::autometrics;
use nanoid::nanoid;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend_node_token;
use crate::backend_token;
use crate::metrics;
use crate::utils::retry::task_with_timeout_and_exponential_backoff;
use crate::utils::time::now_ms;
use crate::BackendError;
use crate::BackendExecutor;
use crate::BackoffPolicy;
use crate::CoordinationError;
use crate::Error;
use crate::FailureReason;
use crate::LeaseMode;
use crate::LockManager;
use crate::OperationKind;
use crate::OperationReceipt;
use crate::Outcome;
use crate::RecordStore;
use crate::Result;
use crate::SystemError;
use crate::TransitionError;
use crate::VolumeRecord;
use crate::VolumeState;
use crate::API_SLO;

/// The per-volume state machine. The only writer of provisioning state.
///
/// Holds no in-process lock across store or backend I/O: correctness
/// comes from the record store's generation CAS plus the lock manager's
/// lease semantics. A transition losing its CAS race or hitting a
/// transient backend fault is re-run from the re-read, bounded by the
/// configured retry policy, before the error surfaces.
pub struct VolumeLifecycle<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    store: Arc<R>,
    backend: Arc<B>,
    lock_manager: Arc<LockManager<R>>,
    retry: BackoffPolicy,
}

impl<R, B> VolumeLifecycle<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    pub fn new(
        store: Arc<R>,
        backend: Arc<B>,
        lock_manager: Arc<LockManager<R>>,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            backend,
            lock_manager,
            retry,
        }
    }

    /// Provisions a new volume, or resumes a half-provisioned one.
    ///
    /// Idempotent on both the idempotency token and the volume name: a
    /// repeat with the same name and size returns the existing record
    /// with no backend side effect.
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn create(
        &self,
        name: &str,
        requested_size: u64,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let name = name.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("create", || {
            self.try_create(name.clone(), requested_size, token.clone())
        })
        .await
    }

    /// Attaches the volume to `node` in the requested mode.
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn publish(
        &self,
        volume_id: &str,
        node: &str,
        mode: LeaseMode,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let node = node.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("publish", || {
            self.try_publish(volume_id.clone(), node.clone(), mode, token.clone())
        })
        .await
    }

    /// Marks the published device ready for mount on `node`
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn stage(
        &self,
        volume_id: &str,
        node: &str,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let node = node.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("stage", || {
            self.try_stage(volume_id.clone(), node.clone(), token.clone())
        })
        .await
    }

    /// First-use notification from the embedding driver
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn mark_in_use(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let node = node.to_string();
        self.run_transition("mark_in_use", || {
            self.try_mark_in_use(volume_id.clone(), node.clone())
        })
        .await
    }

    /// Begins detaching: tears the device down on `node`
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn unstage(
        &self,
        volume_id: &str,
        node: &str,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let node = node.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("unstage", || {
            self.try_unstage(volume_id.clone(), node.clone(), token.clone())
        })
        .await
    }

    /// Unmaps the volume from `node` and releases its lease
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn unpublish(
        &self,
        volume_id: &str,
        node: &str,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let node = node.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("unpublish", || {
            self.try_unpublish(volume_id.clone(), node.clone(), token.clone())
        })
        .await
    }

    /// Destroys the volume once no lease is active. The record is
    /// retained tombstoned so duplicate deletes replay idempotently.
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn delete(
        &self,
        volume_id: &str,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("delete", || {
            self.try_delete(volume_id.clone(), token.clone())
        })
        .await
    }

    /// Grows the volume; re-enters the current state on success
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn resize(
        &self,
        volume_id: &str,
        target_size: u64,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("resize", || {
            self.try_resize(volume_id.clone(), target_size, token.clone())
        })
        .await
    }

    /// Takes a point-in-time copy into a new independent volume record
    /// linked to the source by provenance
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn snapshot(
        &self,
        volume_id: &str,
        snapshot_name: &str,
        idempotency_token: &str,
    ) -> Result<VolumeRecord> {
        let volume_id = volume_id.to_string();
        let snapshot_name = snapshot_name.to_string();
        let token = idempotency_token.to_string();
        self.run_transition("snapshot", || {
            self.try_snapshot(volume_id.clone(), snapshot_name.clone(), token.clone())
        })
        .await
    }

    // ---- transition bodies ----

    async fn try_create(
        &self,
        name: String,
        requested_size: u64,
        token: String,
    ) -> Result<VolumeRecord> {
        let record = match self.store.find_volume_by_name(&name).await? {
            Some(existing) => {
                if let Some(prior) = self.replay(&existing.volume_id, &token).await? {
                    return Ok(prior);
                }
                if existing.state != VolumeState::Pending {
                    if existing.requested_size == requested_size {
                        debug!("create({}) replays existing volume {}", name, existing.volume_id);
                        return Ok(existing);
                    }
                    return Err(CoordinationError::AlreadyExists {
                        volume_id: existing.volume_id,
                        name,
                    }
                    .into());
                }
                // Resume a half-provisioned volume
                existing
            }
            None => {
                let record = VolumeRecord::new(format!("vol-{}", nanoid!(12)), name, requested_size);
                self.store.put_volume(None, &record).await?;
                record
            }
        };

        let backend_token = backend_token(&record.volume_id, OperationKind::Create, record.generation);
        let outcome = self
            .backend
            .create_volume(record.requested_size, &backend_token)
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
                self.journal(OperationKind::Create, &token, &updated).await?;
                info!("volume {} provisioned ({} bytes)", updated.volume_id, updated.requested_size);
                Ok(updated)
            }
            // The record stays Pending; the request is retryable once
            // capacity frees up
            Outcome::Failure(FailureReason::CapacityExceeded) => {
                Err(CoordinationError::CapacityExceeded {
                    requested: record.requested_size,
                }
                .into())
            }
            Outcome::Failure(reason) => {
                Err(BackendError::CommandFailed(format!("create: {:?}", reason)).into())
            }
            Outcome::Unknown => Err(BackendError::Unknown {
                operation: "create",
                volume_id: record.volume_id,
            }
            .into()),
        }
    }

    async fn try_publish(
        &self,
        volume_id: String,
        node: String,
        mode: LeaseMode,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let record = self.must_get(&volume_id).await?;

        let already_owner = match mode {
            LeaseMode::Exclusive => record.exclusive_owner.as_deref() == Some(node.as_str()),
            LeaseMode::Shared => record.shared_owners.contains(&node),
        };
        if already_owner
            && matches!(
                record.state,
                VolumeState::Published | VolumeState::Staged | VolumeState::InUse
            )
        {
            let lease = self.lock_manager.verify_held(&volume_id, &node).await?;
            // A held lease does not prove the device is reachable: a
            // lost map reply strands the owner mark without the
            // mapping. Probe before acking the replay.
            let report = self
                .backend
                .probe_volume(Self::backend_id(&record)?)
                .await?;
            if !report.mapped_nodes.contains(&node) {
                self.issue_map(&record, &node, lease.fencing_token).await?;
            }
            return Ok(record);
        }

        // Additional shared readers join an already-published volume
        if !matches!(
            record.state,
            VolumeState::Provisioned | VolumeState::Unpublished | VolumeState::Published
        ) {
            return Err(TransitionError::Illegal {
                operation: "publish",
                from: record.state.as_str(),
            }
            .into());
        }

        let lease = self
            .lock_manager
            .acquire(&volume_id, &node, mode, &token)
            .await?;

        // The grant bumped the generation; commit against the fresh read
        let record = self.must_get(&volume_id).await?;
        self.issue_map(&record, &node, lease.fencing_token).await?;

        let mut updated = record.clone();
        updated.state = VolumeState::Published;
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        self.journal(OperationKind::Publish, &token, &updated).await?;
        info!(
            "volume {} published to {} ({})",
            volume_id,
            node,
            mode.as_str()
        );
        Ok(updated)
    }

    async fn try_stage(
        &self,
        volume_id: String,
        node: String,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let record = self.must_get(&volume_id).await?;

        if matches!(record.state, VolumeState::Staged | VolumeState::InUse)
            && record.owners().contains(&node)
        {
            return Ok(record);
        }
        if record.state != VolumeState::Published {
            return Err(TransitionError::Illegal {
                operation: "stage",
                from: record.state.as_str(),
            }
            .into());
        }

        self.lock_manager.verify_held(&volume_id, &node).await?;

        let mut updated = record.clone();
        updated.state = VolumeState::Staged;
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        self.journal(OperationKind::Stage, &token, &updated).await?;
        Ok(updated)
    }

    async fn try_mark_in_use(
        &self,
        volume_id: String,
        node: String,
    ) -> Result<VolumeRecord> {
        let record = self.must_get(&volume_id).await?;

        if record.state == VolumeState::InUse && record.owners().contains(&node) {
            return Ok(record);
        }
        if record.state != VolumeState::Staged {
            return Err(TransitionError::Illegal {
                operation: "mark_in_use",
                from: record.state.as_str(),
            }
            .into());
        }

        self.lock_manager.verify_held(&volume_id, &node).await?;

        let mut updated = record.clone();
        updated.state = VolumeState::InUse;
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        Ok(updated)
    }

    async fn try_unstage(
        &self,
        volume_id: String,
        node: String,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let record = self.must_get(&volume_id).await?;

        if matches!(
            record.state,
            VolumeState::Unstaging | VolumeState::Unpublished
        ) {
            return Ok(record);
        }
        if !matches!(record.state, VolumeState::Staged | VolumeState::InUse) {
            return Err(TransitionError::Illegal {
                operation: "unstage",
                from: record.state.as_str(),
            }
            .into());
        }

        self.lock_manager.verify_held(&volume_id, &node).await?;

        let mut updated = record.clone();
        updated.state = VolumeState::Unstaging;
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;
        self.journal(OperationKind::Unstage, &token, &updated).await?;
        Ok(updated)
    }

    async fn try_unpublish(
        &self,
        volume_id: String,
        node: String,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let record = self.must_get(&volume_id).await?;

        let is_owner = record.owners().contains(&node);
        if matches!(
            record.state,
            VolumeState::Unpublished | VolumeState::Provisioned
        ) || (!is_owner && record.state == VolumeState::Published)
        {
            return Ok(record);
        }
        if !matches!(
            record.state,
            VolumeState::Published | VolumeState::Unstaging
        ) {
            return Err(TransitionError::Illegal {
                operation: "unpublish",
                from: record.state.as_str(),
            }
            .into());
        }

        let backend_id = Self::backend_id(&record)?.to_string();
        let lease = self.store.get_lease(&volume_id, &node).await?;
        let fencing_token = lease
            .as_ref()
            .map(|l| l.fencing_token)
            .unwrap_or(record.fencing_token);

        let backend_token =
            backend_node_token(&volume_id, OperationKind::Unpublish, record.generation, &node);
        let outcome = self
            .backend
            .unmap_volume(&backend_id, &node, &backend_token)
            .await?;
        metrics::observe_backend_outcome("unmap", &outcome);

        match outcome {
            // A vanished backend volume has nothing mapped either way
            Outcome::Success(()) | Outcome::Failure(FailureReason::NotFound) => {}
            Outcome::Failure(reason) => {
                return Err(BackendError::CommandFailed(format!("unmap: {:?}", reason)).into());
            }
            Outcome::Unknown => {
                return Err(BackendError::Unknown {
                    operation: "unmap",
                    volume_id,
                }
                .into());
            }
        }

        self.lock_manager
            .release(&volume_id, &node, fencing_token)
            .await?;

        // Shared volumes stay Published while other readers remain
        let record = self.must_get(&volume_id).await?;
        let updated = if record.has_owner() {
            record
        } else {
            let mut updated = record.clone();
            updated.state = VolumeState::Unpublished;
            updated.bump();
            self.store
                .put_volume(Some(record.generation), &updated)
                .await?;
            updated
        };

        self.journal(OperationKind::Unpublish, &token, &updated).await?;
        info!("volume {} unpublished from {}", volume_id, node);
        Ok(updated)
    }

    async fn try_delete(
        &self,
        volume_id: String,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let record = self.must_get(&volume_id).await?;

        if record.is_tombstone() {
            return Ok(record);
        }

        let leases = self.store.list_leases(&volume_id).await?;
        if !leases.is_empty() || record.has_owner() {
            let mut holders = record.owners();
            for lease in &leases {
                if !holders.contains(&lease.node) {
                    holders.push(lease.node.clone());
                }
            }
            return Err(CoordinationError::VolumeInUse { volume_id, holders }.into());
        }

        // Nothing was provisioned yet; tombstone directly
        if record.state == VolumeState::Pending || record.backend_id.is_none() {
            let mut updated = record.clone();
            updated.state = VolumeState::Deleted;
            updated.deleted_at_ms = Some(now_ms());
            updated.bump();
            self.store
                .put_volume(Some(record.generation), &updated)
                .await?;
            self.journal(OperationKind::Delete, &token, &updated).await?;
            return Ok(updated);
        }

        let record = if record.state == VolumeState::Deleting {
            record
        } else {
            let mut deleting = record.clone();
            deleting.state = VolumeState::Deleting;
            deleting.bump();
            self.store
                .put_volume(Some(record.generation), &deleting)
                .await?;
            deleting
        };

        let backend_id = Self::backend_id(&record)?;
        let backend_token = backend_token(&volume_id, OperationKind::Delete, record.generation);
        let outcome = self.backend.delete_volume(backend_id, &backend_token).await?;
        metrics::observe_backend_outcome("delete", &outcome);

        match outcome {
            Outcome::Success(()) | Outcome::Failure(FailureReason::NotFound) => {
                let mut updated = record.clone();
                updated.state = VolumeState::Deleted;
                updated.deleted_at_ms = Some(now_ms());
                updated.bump();
                self.store
                    .put_volume(Some(record.generation), &updated)
                    .await?;
                self.journal(OperationKind::Delete, &token, &updated).await?;
                info!("volume {} deleted", volume_id);
                Ok(updated)
            }
            Outcome::Failure(reason) => {
                Err(BackendError::CommandFailed(format!("delete: {:?}", reason)).into())
            }
            Outcome::Unknown => Err(BackendError::Unknown {
                operation: "delete",
                volume_id,
            }
            .into()),
        }
    }

    async fn try_resize(
        &self,
        volume_id: String,
        target_size: u64,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let record = self.must_get(&volume_id).await?;

        if target_size <= record.requested_size {
            return Ok(record);
        }
        if !matches!(
            record.state,
            VolumeState::Provisioned | VolumeState::Published | VolumeState::Staged
        ) {
            return Err(TransitionError::Illegal {
                operation: "resize",
                from: record.state.as_str(),
            }
            .into());
        }

        let record = match record.pending_resize {
            Some(pending) if pending.target_size != target_size => {
                return Err(TransitionError::ResizeInProgress {
                    target_size: pending.target_size,
                }
                .into());
            }
            // Resume the marker committed by a crashed attempt
            Some(_) => record,
            None => {
                let mut marked = record.clone();
                marked.bump();
                marked.pending_resize = Some(crate::PendingResize {
                    target_size,
                    generation: marked.generation,
                });
                self.store
                    .put_volume(Some(record.generation), &marked)
                    .await?;
                marked
            }
        };

        let marker = record
            .pending_resize
            .ok_or_else(|| SystemError::General("resize marker vanished".to_string()))?;
        let backend_id = Self::backend_id(&record)?;
        let backend_token = backend_token(&volume_id, OperationKind::Resize, marker.generation);
        let outcome = self
            .backend
            .resize_volume(backend_id, target_size, &backend_token)
            .await?;
        metrics::observe_backend_outcome("resize", &outcome);

        match outcome {
            Outcome::Success(()) => {
                let mut updated = record.clone();
                updated.requested_size = target_size;
                updated.pending_resize = None;
                updated.bump();
                self.store
                    .put_volume(Some(record.generation), &updated)
                    .await?;
                self.journal(OperationKind::Resize, &token, &updated).await?;
                info!("volume {} resized to {} bytes", volume_id, target_size);
                Ok(updated)
            }
            Outcome::Failure(reason) => {
                // Clear the marker; a definite failure is not in flight
                let mut updated = record.clone();
                updated.pending_resize = None;
                updated.bump();
                self.store
                    .put_volume(Some(record.generation), &updated)
                    .await?;
                match reason {
                    FailureReason::CapacityExceeded => {
                        Err(CoordinationError::CapacityExceeded {
                            requested: target_size,
                        }
                        .into())
                    }
                    other => {
                        Err(BackendError::CommandFailed(format!("resize: {:?}", other)).into())
                    }
                }
            }
            Outcome::Unknown => Err(BackendError::Unknown {
                operation: "resize",
                volume_id,
            }
            .into()),
        }
    }

    async fn try_snapshot(
        &self,
        volume_id: String,
        snapshot_name: String,
        token: String,
    ) -> Result<VolumeRecord> {
        if let Some(prior) = self.replay(&volume_id, &token).await? {
            return Ok(prior);
        }
        let source = self.must_get(&volume_id).await?;

        match source.state {
            VolumeState::Provisioned | VolumeState::Staged => {}
            VolumeState::InUse => {
                if !self.backend.capabilities().online_snapshot {
                    return Err(TransitionError::OnlineSnapshotUnsupported.into());
                }
            }
            other => {
                return Err(TransitionError::Illegal {
                    operation: "snapshot",
                    from: other.as_str(),
                }
                .into());
            }
        }

        if let Some(existing) = self.store.find_volume_by_name(&snapshot_name).await? {
            if existing.source_volume.as_deref() == Some(volume_id.as_str()) {
                return Ok(existing);
            }
            return Err(CoordinationError::AlreadyExists {
                volume_id: existing.volume_id,
                name: snapshot_name,
            }
            .into());
        }

        let source_backend_id = Self::backend_id(&source)?;
        let backend_token = backend_token(&volume_id, OperationKind::Snapshot, source.generation);
        let outcome = self
            .backend
            .snapshot_volume(source_backend_id, &backend_token)
            .await?;
        metrics::observe_backend_outcome("snapshot", &outcome);

        match outcome {
            Outcome::Success(snapshot_backend_id) => {
                let mut snapshot =
                    VolumeRecord::new(format!("vol-{}", nanoid!(12)), snapshot_name, source.requested_size);
                snapshot.state = VolumeState::Provisioned;
                snapshot.backend_id = Some(snapshot_backend_id);
                snapshot.source_volume = Some(volume_id.clone());
                self.store.put_volume(None, &snapshot).await?;

                // Journaled under the source volume, where the request is
                // addressed
                self.store
                    .put_receipt(&OperationReceipt {
                        volume_id: volume_id.clone(),
                        idempotency_token: token,
                        kind: OperationKind::Snapshot,
                        record: snapshot.clone(),
                        completed_at_ms: now_ms(),
                    })
                    .await?;
                info!(
                    "volume {} snapshotted into {}",
                    volume_id, snapshot.volume_id
                );
                Ok(snapshot)
            }
            Outcome::Failure(FailureReason::CapacityExceeded) => {
                Err(CoordinationError::CapacityExceeded {
                    requested: source.requested_size,
                }
                .into())
            }
            Outcome::Failure(reason) => {
                Err(BackendError::CommandFailed(format!("snapshot: {:?}", reason)).into())
            }
            Outcome::Unknown => Err(BackendError::Unknown {
                operation: "snapshot",
                volume_id,
            }
            .into()),
        }
    }

    // ---- shared plumbing ----

    async fn run_transition<F, T, P>(
        &self,
        op: &'static str,
        task: F,
    ) -> Result<P>
    where
        F: Fn() -> T,
        T: std::future::Future<Output = Result<P>>,
    {
        let start = std::time::Instant::now();
        let result =
            task_with_timeout_and_exponential_backoff(op, self.retry, Error::is_retryable, task)
                .await;
        metrics::observe_transition(op, result.is_ok());
        metrics::TRANSITION_DURATION_METRIC
            .with_label_values(&[op])
            .observe(start.elapsed().as_millis() as f64);
        if let Err(e) = &result {
            warn!("{op} failed: {:?}", e);
        }
        result
    }

    /// Issues the map command for `node` and classifies the outcome.
    /// Anything but an acknowledged mapping surfaces as an error for the
    /// retry and reconcile machinery.
    async fn issue_map(
        &self,
        record: &VolumeRecord,
        node: &str,
        fencing_token: u64,
    ) -> Result<()> {
        let backend_id = Self::backend_id(record)?;
        let backend_token = backend_node_token(
            &record.volume_id,
            OperationKind::Publish,
            record.generation,
            node,
        );
        let outcome = self
            .backend
            .map_volume(backend_id, node, fencing_token, &backend_token)
            .await?;
        metrics::observe_backend_outcome("map", &outcome);

        match outcome {
            Outcome::Success(()) => Ok(()),
            Outcome::Failure(FailureReason::Fenced) => Err(CoordinationError::Fenced {
                volume_id: record.volume_id.clone(),
                presented: fencing_token,
                current: record.fencing_token,
            }
            .into()),
            Outcome::Failure(reason) => {
                Err(BackendError::CommandFailed(format!("map: {:?}", reason)).into())
            }
            Outcome::Unknown => Err(BackendError::Unknown {
                operation: "map",
                volume_id: record.volume_id.clone(),
            }
            .into()),
        }
    }

    /// Returns the journaled result of a completed request, if any
    async fn replay(
        &self,
        volume_id: &str,
        token: &str,
    ) -> Result<Option<VolumeRecord>> {
        match self.store.get_receipt(volume_id, token).await? {
            Some(receipt) => {
                debug!(
                    "replaying {} {:?} from journal",
                    volume_id, receipt.kind
                );
                Ok(Some(receipt.record))
            }
            None => Ok(None),
        }
    }

    async fn journal(
        &self,
        kind: OperationKind,
        token: &str,
        record: &VolumeRecord,
    ) -> Result<()> {
        self.store
            .put_receipt(&OperationReceipt::new(kind, token, record))
            .await
    }

    async fn must_get(
        &self,
        volume_id: &str,
    ) -> Result<VolumeRecord> {
        self.store
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| CoordinationError::VolumeNotFound(volume_id.to_string()).into())
    }

    fn backend_id(record: &VolumeRecord) -> Result<&str> {
        record
            .backend_id
            .as_deref()
            .ok_or_else(|| {
                SystemError::General(format!(
                    "volume {} has no backend id in state {}",
                    record.volume_id, record.state
                ))
                .into()
            })
    }
}
