use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tonic::async_trait;
use tracing::trace;

use crate::constants::RECORD_EVENT_CHANNEL_CAPACITY;
use crate::CoordinationError;
use crate::Lease;
use crate::OperationReceipt;
use crate::RecordEvent;
use crate::RecordStore;
use crate::Result;
use crate::VolumeRecord;

/// In-memory record store.
///
/// Used by tests and embedded runs. The volume table sits behind a
/// single `RwLock` so the generation check and the write happen under one
/// critical section; leases and receipts are plain concurrent maps.
#[derive(Debug)]
pub struct MemoryRecordStore {
    volumes: RwLock<HashMap<String, VolumeRecord>>,
    leases: DashMap<String, Lease>,
    receipts: DashMap<String, OperationReceipt>,
    event_tx: broadcast::Sender<RecordEvent>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(RECORD_EVENT_CHANNEL_CAPACITY);
        Self {
            volumes: RwLock::new(HashMap::new()),
            leases: DashMap::new(),
            receipts: DashMap::new(),
            event_tx,
        }
    }

    fn lease_key(
        volume_id: &str,
        node: &str,
    ) -> String {
        format!("{}/{}", volume_id, node)
    }

    fn receipt_key(
        volume_id: &str,
        token: &str,
    ) -> String {
        format!("{}/{}", volume_id, token)
    }

    fn notify(
        &self,
        event: RecordEvent,
    ) {
        // Nobody subscribed is fine
        let _ = self.event_tx.send(event);
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_volume(
        &self,
        volume_id: &str,
    ) -> Result<Option<VolumeRecord>> {
        Ok(self.volumes.read().get(volume_id).cloned())
    }

    async fn find_volume_by_name(
        &self,
        name: &str,
    ) -> Result<Option<VolumeRecord>> {
        Ok(self
            .volumes
            .read()
            .values()
            .find(|r| r.name == name && !r.is_tombstone())
            .cloned())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self.volumes.read().values().cloned().collect())
    }

    async fn put_volume(
        &self,
        expected_generation: Option<u64>,
        record: &VolumeRecord,
    ) -> Result<()> {
        {
            let mut volumes = self.volumes.write();
            match (expected_generation, volumes.get(&record.volume_id)) {
                (None, Some(existing)) => {
                    return Err(CoordinationError::Conflict {
                        volume_id: record.volume_id.clone(),
                        expected: 0,
                        found: existing.generation,
                    }
                    .into());
                }
                (Some(expected), None) => {
                    return Err(CoordinationError::Conflict {
                        volume_id: record.volume_id.clone(),
                        expected,
                        found: 0,
                    }
                    .into());
                }
                (Some(expected), Some(existing)) if existing.generation != expected => {
                    return Err(CoordinationError::Conflict {
                        volume_id: record.volume_id.clone(),
                        expected,
                        found: existing.generation,
                    }
                    .into());
                }
                _ => {}
            }
            trace!(
                "put_volume {} gen {} state {}",
                record.volume_id,
                record.generation,
                record.state
            );
            volumes.insert(record.volume_id.clone(), record.clone());
        }

        self.notify(RecordEvent::VolumeUpdated {
            volume_id: record.volume_id.clone(),
            generation: record.generation,
        });
        Ok(())
    }

    async fn remove_volume(
        &self,
        volume_id: &str,
    ) -> Result<()> {
        self.volumes.write().remove(volume_id);
        self.notify(RecordEvent::VolumeRemoved {
            volume_id: volume_id.to_string(),
        });
        Ok(())
    }

    async fn get_lease(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<Option<Lease>> {
        Ok(self
            .leases
            .get(&Self::lease_key(volume_id, node))
            .map(|e| e.value().clone()))
    }

    async fn list_leases(
        &self,
        volume_id: &str,
    ) -> Result<Vec<Lease>> {
        Ok(self
            .leases
            .iter()
            .filter(|e| e.value().volume_id == volume_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn put_lease(
        &self,
        lease: &Lease,
    ) -> Result<()> {
        self.leases
            .insert(Self::lease_key(&lease.volume_id, &lease.node), lease.clone());
        Ok(())
    }

    async fn remove_lease(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<()> {
        self.leases.remove(&Self::lease_key(volume_id, node));
        Ok(())
    }

    async fn get_receipt(
        &self,
        volume_id: &str,
        idempotency_token: &str,
    ) -> Result<Option<OperationReceipt>> {
        Ok(self
            .receipts
            .get(&Self::receipt_key(volume_id, idempotency_token))
            .map(|e| e.value().clone()))
    }

    async fn put_receipt(
        &self,
        receipt: &OperationReceipt,
    ) -> Result<()> {
        self.receipts.insert(
            Self::receipt_key(&receipt.volume_id, &receipt.idempotency_token),
            receipt.clone(),
        );
        Ok(())
    }

    async fn remove_receipts(
        &self,
        volume_id: &str,
    ) -> Result<()> {
        let prefix = format!("{}/", volume_id);
        self.receipts.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.event_tx.subscribe()
    }
}
