use std::sync::Arc;

use tokio::sync::broadcast;
use tonic::async_trait;
use tracing::trace;

use crate::constants::LEASE_TREE;
use crate::constants::RECEIPT_TREE;
use crate::constants::RECORD_EVENT_CHANNEL_CAPACITY;
use crate::constants::VOLUME_TREE;
use crate::CoordinationError;
use crate::Lease;
use crate::OperationReceipt;
use crate::RecordEvent;
use crate::RecordStore;
use crate::Result;
use crate::StoreError;
use crate::VolumeRecord;

/// Sled-backed record store for single-binary deployments.
///
/// Volume records, leases and operation receipts live in separate trees.
/// The generation check rides on sled's byte-level compare-and-swap: the
/// old serialized record is the comparand, so a concurrent writer who
/// committed first makes the swap fail and the caller observes `Conflict`.
pub struct SledRecordStore {
    volumes: sled::Tree,
    leases: sled::Tree,
    receipts: sled::Tree,
    db: Arc<sled::Db>,
    event_tx: broadcast::Sender<RecordEvent>,
}

impl SledRecordStore {
    pub fn new(db: Arc<sled::Db>) -> Result<Self> {
        let volumes = db.open_tree(VOLUME_TREE)?;
        let leases = db.open_tree(LEASE_TREE)?;
        let receipts = db.open_tree(RECEIPT_TREE)?;
        let (event_tx, _) = broadcast::channel(RECORD_EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            volumes,
            leases,
            receipts,
            db,
            event_tx,
        })
    }

    fn lease_key(
        volume_id: &str,
        node: &str,
    ) -> Vec<u8> {
        format!("{}/{}", volume_id, node).into_bytes()
    }

    fn receipt_key(
        volume_id: &str,
        token: &str,
    ) -> Vec<u8> {
        format!("{}/{}", volume_id, token).into_bytes()
    }

    fn decode_volume(bytes: &[u8]) -> Result<VolumeRecord> {
        bincode::deserialize(bytes).map_err(|_| {
            StoreError::DataCorruption {
                location: VOLUME_TREE.to_string(),
            }
            .into()
        })
    }

    fn notify(
        &self,
        event: RecordEvent,
    ) {
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl RecordStore for SledRecordStore {
    async fn get_volume(
        &self,
        volume_id: &str,
    ) -> Result<Option<VolumeRecord>> {
        match self.volumes.get(volume_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_volume(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_volume_by_name(
        &self,
        name: &str,
    ) -> Result<Option<VolumeRecord>> {
        for entry in self.volumes.iter() {
            let (_, bytes) = entry?;
            let record = Self::decode_volume(&bytes)?;
            if record.name == name && !record.is_tombstone() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        let mut records = Vec::new();
        for entry in self.volumes.iter() {
            let (_, bytes) = entry?;
            records.push(Self::decode_volume(&bytes)?);
        }
        Ok(records)
    }

    async fn put_volume(
        &self,
        expected_generation: Option<u64>,
        record: &VolumeRecord,
    ) -> Result<()> {
        let key = record.volume_id.as_bytes();
        let new_bytes = bincode::serialize(record)?;

        let old_bytes = match self.volumes.get(key)? {
            Some(bytes) => {
                let existing = Self::decode_volume(&bytes)?;
                match expected_generation {
                    None => {
                        return Err(CoordinationError::Conflict {
                            volume_id: record.volume_id.clone(),
                            expected: 0,
                            found: existing.generation,
                        }
                        .into());
                    }
                    Some(expected) if existing.generation != expected => {
                        return Err(CoordinationError::Conflict {
                            volume_id: record.volume_id.clone(),
                            expected,
                            found: existing.generation,
                        }
                        .into());
                    }
                    Some(_) => Some(bytes),
                }
            }
            None => match expected_generation {
                Some(expected) => {
                    return Err(CoordinationError::Conflict {
                        volume_id: record.volume_id.clone(),
                        expected,
                        found: 0,
                    }
                    .into());
                }
                None => None,
            },
        };

        trace!(
            "put_volume {} gen {} state {}",
            record.volume_id,
            record.generation,
            record.state
        );

        // The byte comparand catches writers who raced past the
        // generation check above
        match self
            .volumes
            .compare_and_swap(key, old_bytes, Some(new_bytes))?
        {
            Ok(()) => {}
            Err(cas_err) => {
                let found = match cas_err.current {
                    Some(bytes) => Self::decode_volume(&bytes)?.generation,
                    None => 0,
                };
                return Err(CoordinationError::Conflict {
                    volume_id: record.volume_id.clone(),
                    expected: expected_generation.unwrap_or(0),
                    found,
                }
                .into());
            }
        }

        self.db.flush_async().await?;
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
        self.volumes.remove(volume_id.as_bytes())?;
        self.db.flush_async().await?;
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
        match self.leases.get(Self::lease_key(volume_id, node))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_leases(
        &self,
        volume_id: &str,
    ) -> Result<Vec<Lease>> {
        let prefix = format!("{}/", volume_id);
        let mut leases = Vec::new();
        for entry in self.leases.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            leases.push(bincode::deserialize::<Lease>(&bytes)?);
        }
        Ok(leases)
    }

    async fn put_lease(
        &self,
        lease: &Lease,
    ) -> Result<()> {
        let key = Self::lease_key(&lease.volume_id, &lease.node);
        let bytes = bincode::serialize(lease)?;
        self.leases.insert(key, bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove_lease(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<()> {
        self.leases.remove(Self::lease_key(volume_id, node))?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn get_receipt(
        &self,
        volume_id: &str,
        idempotency_token: &str,
    ) -> Result<Option<OperationReceipt>> {
        match self
            .receipts
            .get(Self::receipt_key(volume_id, idempotency_token))?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_receipt(
        &self,
        receipt: &OperationReceipt,
    ) -> Result<()> {
        let key = Self::receipt_key(&receipt.volume_id, &receipt.idempotency_token);
        let bytes = bincode::serialize(receipt)?;
        self.receipts.insert(key, bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove_receipts(
        &self,
        volume_id: &str,
    ) -> Result<()> {
        let prefix = format!("{}/", volume_id);
        let keys: Vec<_> = self
            .receipts
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            self.receipts.remove(key)?;
        }
        self.db.flush_async().await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.event_tx.subscribe()
    }
}
