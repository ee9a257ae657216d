use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::constants::EXCLUSIVE;
use crate::constants::SHARED;
use crate::utils::time::now_ms;
use crate::CoordinationError;
use crate::Lease;
use crate::LeaseMode;
use crate::LockConfig;
use crate::LockError;
use crate::RecordStore;
use crate::Result;
use crate::VolumeRecord;

/// Grants, renews and revokes leases on volumes.
///
/// Correctness rides on the record store's generation CAS, not on any
/// in-process lock: every grant bumps the volume's fencing token through
/// a conditional write, so two racing acquirers cannot both commit
/// against the same generation. An expired lease blocks further grants
/// until it is explicitly revoked.
pub struct LockManager<R>
where
    R: RecordStore,
{
    store: Arc<R>,
    config: LockConfig,
}

impl<R> LockManager<R>
where
    R: RecordStore,
{
    pub fn new(
        store: Arc<R>,
        config: LockConfig,
    ) -> Self {
        Self { store, config }
    }

    /// Acquires a lease for `node` on the volume.
    ///
    /// Re-acquisition by the same node in the same mode while its lease
    /// is unexpired is idempotent and returns the held lease. Fails with
    /// a lock `Conflict` while any blocking or expired-but-unrevoked
    /// lease exists. The fencing token bump and owner update commit
    /// through CAS; a generation race surfaces as `Conflict` for the
    /// caller's transition retry.
    pub async fn acquire(
        &self,
        volume_id: &str,
        node: &str,
        mode: LeaseMode,
        idempotency_token: &str,
    ) -> Result<Lease> {
        let record = self.must_get(volume_id).await?;
        let now = now_ms();
        let leases = self.store.list_leases(volume_id).await?;

        if let Some(held) = leases
            .iter()
            .find(|l| l.node == node && l.mode == mode && !l.is_expired(now))
        {
            debug!("lease re-acquired idempotently: {}/{}", volume_id, node);
            return Ok(held.clone());
        }

        // Expired leases are not renewable and must be revoked before
        // any new grant on the volume
        if let Some(expired) = leases.iter().find(|l| l.is_expired(now)) {
            warn!(
                "acquire({}/{}) blocked by expired lease of {}",
                volume_id, node, expired.node
            );
            return Err(LockError::Conflict {
                volume_id: volume_id.to_string(),
                holder: expired.node.clone(),
                mode: expired.mode.as_str(),
            }
            .into());
        }

        if let Some(blocking) = leases.iter().find(|l| l.blocks(mode)) {
            return Err(LockError::Conflict {
                volume_id: volume_id.to_string(),
                holder: blocking.node.clone(),
                mode: blocking.mode.as_str(),
            }
            .into());
        }

        // Owner marks commit before the lease row lands; they block
        // conflicting grants through that window too
        if let Some(owner) = &record.exclusive_owner {
            if owner.as_str() != node {
                return Err(LockError::Conflict {
                    volume_id: volume_id.to_string(),
                    holder: owner.clone(),
                    mode: EXCLUSIVE,
                }
                .into());
            }
        }
        if mode == LeaseMode::Exclusive {
            if let Some(holder) = record.shared_owners.iter().find(|n| n.as_str() != node) {
                return Err(LockError::Conflict {
                    volume_id: volume_id.to_string(),
                    holder: holder.clone(),
                    mode: SHARED,
                }
                .into());
            }
        }

        let mut updated = record.clone();
        updated.fencing_token += 1;
        match mode {
            LeaseMode::Exclusive => {
                updated.exclusive_owner = Some(node.to_string());
            }
            LeaseMode::Shared => {
                updated.shared_owners.insert(node.to_string());
            }
        }
        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
            .await?;

        let lease = Lease {
            volume_id: volume_id.to_string(),
            node: node.to_string(),
            mode,
            fencing_token: updated.fencing_token,
            expires_at_ms: now + self.config.lease_ttl_ms,
            idempotency_token: idempotency_token.to_string(),
        };
        self.store.put_lease(&lease).await?;

        debug!(
            "lease granted: {}/{} {} token {}",
            volume_id,
            node,
            mode.as_str(),
            lease.fencing_token
        );
        Ok(lease)
    }

    /// Releases the lease held by `node`.
    ///
    /// Releasing a lease that no longer exists is an idempotent ack; a
    /// mismatched fencing token is rejected as `Fenced`. The lease row
    /// is dropped before the owner mark so a crash in between leaves a
    /// shape the reconciler recognizes as an orphaned owner.
    pub async fn release(
        &self,
        volume_id: &str,
        node: &str,
        fencing_token: u64,
    ) -> Result<()> {
        let record = self.must_get(volume_id).await?;

        if let Some(lease) = self.store.get_lease(volume_id, node).await? {
            if lease.fencing_token != fencing_token {
                return Err(CoordinationError::Fenced {
                    volume_id: volume_id.to_string(),
                    presented: fencing_token,
                    current: lease.fencing_token,
                }
                .into());
            }
            self.store.remove_lease(volume_id, node).await?;
        } else {
            debug!("release({}/{}): no lease held, ack", volume_id, node);
        }

        self.clear_owner(&record, &[node.to_string()]).await
    }

    /// Extends an unexpired lease by the configured TTL.
    ///
    /// An expired lease is not renewable; a lease superseded by a newer
    /// grant for the same node is rejected as `Fenced`.
    pub async fn renew(
        &self,
        lease: &Lease,
    ) -> Result<Lease> {
        let now = now_ms();
        let current = self
            .store
            .get_lease(&lease.volume_id, &lease.node)
            .await?
            .ok_or_else(|| LockError::NotHeld {
                volume_id: lease.volume_id.clone(),
                node: lease.node.clone(),
            })?;

        if current.is_expired(now) {
            return Err(LockError::Expired {
                volume_id: lease.volume_id.clone(),
                node: lease.node.clone(),
            }
            .into());
        }
        if current.fencing_token != lease.fencing_token {
            return Err(CoordinationError::Fenced {
                volume_id: lease.volume_id.clone(),
                presented: lease.fencing_token,
                current: current.fencing_token,
            }
            .into());
        }

        let renewed = Lease {
            expires_at_ms: now + self.config.lease_ttl_ms,
            ..current
        };
        self.store.put_lease(&renewed).await?;
        Ok(renewed)
    }

    /// Confirms `node` holds a live lease the backend will honor.
    ///
    /// Called immediately before every backend side effect: an exclusive
    /// lease must carry the volume's current fencing token, a shared
    /// lease must simply be present and unexpired.
    pub async fn verify_held(
        &self,
        volume_id: &str,
        node: &str,
    ) -> Result<Lease> {
        let record = self.must_get(volume_id).await?;
        let lease = self
            .store
            .get_lease(volume_id, node)
            .await?
            .ok_or_else(|| LockError::NotHeld {
                volume_id: volume_id.to_string(),
                node: node.to_string(),
            })?;

        if lease.is_expired(now_ms()) {
            return Err(LockError::Expired {
                volume_id: volume_id.to_string(),
                node: node.to_string(),
            }
            .into());
        }
        if lease.mode == LeaseMode::Exclusive && lease.fencing_token != record.fencing_token {
            return Err(CoordinationError::Fenced {
                volume_id: volume_id.to_string(),
                presented: lease.fencing_token,
                current: record.fencing_token,
            }
            .into());
        }
        Ok(lease)
    }

    /// Drops every expired lease on the volume and clears the matching
    /// owner marks. Returns the revoked leases so the caller can unmap
    /// the fenced nodes on the backend.
    pub async fn revoke_expired(
        &self,
        volume_id: &str,
    ) -> Result<Vec<Lease>> {
        let record = self.must_get(volume_id).await?;
        let now = now_ms();

        let expired: Vec<Lease> = self
            .store
            .list_leases(volume_id)
            .await?
            .into_iter()
            .filter(|l| l.is_expired(now))
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        for lease in &expired {
            warn!(
                "revoking expired lease: {}/{} token {}",
                volume_id, lease.node, lease.fencing_token
            );
            self.store.remove_lease(volume_id, &lease.node).await?;
        }

        let nodes: Vec<String> = expired.iter().map(|l| l.node.clone()).collect();
        self.clear_owner(&record, &nodes).await?;
        Ok(expired)
    }

    /// CAS-clears owner marks for the given nodes, if any are set
    async fn clear_owner(
        &self,
        record: &VolumeRecord,
        nodes: &[String],
    ) -> Result<()> {
        let mut updated = record.clone();
        let mut changed = false;

        for node in nodes {
            if updated.exclusive_owner.as_deref() == Some(node.as_str()) {
                updated.exclusive_owner = None;
                changed = true;
            }
            if updated.shared_owners.remove(node.as_str()) {
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        updated.bump();
        self.store
            .put_volume(Some(record.generation), &updated)
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
}
