use tokio::sync::broadcast;
use tonic::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Lease;
use crate::OperationReceipt;
use crate::Result;
use crate::VolumeRecord;

/// Change notification published after every committed store write.
/// Consumed by the reconciler to wake up without waiting for the next
/// scan interval.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    VolumeUpdated { volume_id: String, generation: u64 },
    VolumeRemoved { volume_id: String },
}

/// The single source of truth for volume, lease and journal records.
///
/// Stands in for the cluster state store: all writes are conditional.
/// `put_volume` succeeds only when the stored generation matches the
/// caller's expectation, which is what linearizes concurrent transitions
/// per volume. No coordinator component writes provisioning state except
/// through this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn get_volume(
        &self,
        volume_id: &str,
    ) -> Result<Option<VolumeRecord>>;

    /// Volume lookup by user-facing name, for create idempotency.
    /// Deleted tombstones are not considered; their name is free for
    /// reuse.
    async fn find_volume_by_name(
        &self,
        name: &str,
    ) -> Result<Option<VolumeRecord>>;

    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>>;

    /// Conditional write of a volume record.
    ///
    /// * `expected_generation == None` inserts a fresh record; fails with
    ///   `Conflict` if the volume already exists.
    /// * `expected_generation == Some(g)` replaces the record only if the
    ///   stored generation is exactly `g`; fails with `Conflict` otherwise.
    async fn put_volume(
        &self,
        expected_generation: Option<u64>,
        record: &VolumeRecord,
    ) -> Result<()>;

    /// Unconditional removal; used only for tombstone garbage collection
    async fn remove_volume(
        &self,
        volume_id: &str,
    ) -> Result<()>;

    async fn get_lease(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<Option<Lease>>;

    async fn list_leases(
        &self,
        volume_id: &str,
    ) -> Result<Vec<Lease>>;

    async fn put_lease(
        &self,
        lease: &Lease,
    ) -> Result<()>;

    async fn remove_lease(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<()>;

    async fn get_receipt(
        &self,
        volume_id: &str,
        idempotency_token: &str,
    ) -> Result<Option<OperationReceipt>>;

    async fn put_receipt(
        &self,
        receipt: &OperationReceipt,
    ) -> Result<()>;

    /// Drops every journal entry of a volume; part of tombstone GC
    async fn remove_receipts(
        &self,
        volume_id: &str,
    ) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent>;
}
