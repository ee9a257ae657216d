use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::EXCLUSIVE;
use crate::constants::SHARED;
use crate::utils::time::now_ms;

/// Provisioning state of a logical volume.
///
/// `Pending` is initial, `Deleted` is terminal. `Error` is the
/// operator-intervention state the reconciler parks a volume in after
/// exhausting its corrective attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Pending,
    Provisioned,
    Published,
    Staged,
    InUse,
    Unstaging,
    Unpublished,
    Deleting,
    Deleted,
    Error,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Pending => "Pending",
            VolumeState::Provisioned => "Provisioned",
            VolumeState::Published => "Published",
            VolumeState::Staged => "Staged",
            VolumeState::InUse => "InUse",
            VolumeState::Unstaging => "Unstaging",
            VolumeState::Unpublished => "Unpublished",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
            VolumeState::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VolumeState::Deleted)
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a volume operation request. Used for idempotency journaling
/// and for deriving deterministic backend command tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Publish,
    Stage,
    Unstage,
    Unpublish,
    Delete,
    Resize,
    Snapshot,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Publish => "publish",
            OperationKind::Stage => "stage",
            OperationKind::Unstage => "unstage",
            OperationKind::Unpublish => "unpublish",
            OperationKind::Delete => "delete",
            OperationKind::Resize => "resize",
            OperationKind::Snapshot => "snapshot",
        }
    }
}

/// Derives the backend idempotency token for a command issued on behalf
/// of a transition committed at `generation`. A crashed transition
/// re-issues the identical token, so the backend deduplicates the side
/// effect.
pub fn backend_token(
    volume_id: &str,
    kind: OperationKind,
    generation: u64,
) -> String {
    format!("{}:{}:{}", volume_id, kind.as_str(), generation)
}

/// Node-scoped token variant for map and unmap commands, which act per
/// node. Two nodes detached in the same pass must not share a token, or
/// the backend would dedupe the second command as a replay of the first.
pub fn backend_node_token(
    volume_id: &str,
    kind: OperationKind,
    generation: u64,
    node: &str,
) -> String {
    format!("{}:{}:{}:{}", volume_id, kind.as_str(), generation, node)
}

/// An in-flight resize marker. `generation` is the record generation the
/// marker was committed at; it pins the derived backend token across
/// crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResize {
    pub target_size: u64,
    pub generation: u64,
}

/// Durable record of one logical volume.
///
/// `generation` strictly increases on every committed write and is the
/// compare-and-swap key for optimistic concurrency; a write conditioned
/// on a stale generation is rejected by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub volume_id: String,
    pub name: String,
    /// Requested size in bytes
    pub requested_size: u64,
    pub state: VolumeState,
    /// Identifier of the backing block device, set once Create succeeds
    pub backend_id: Option<String>,
    /// Node holding the exclusive lease. Mutually exclusive with
    /// `shared_owners`.
    pub exclusive_owner: Option<String>,
    /// Nodes holding shared read leases
    pub shared_owners: BTreeSet<String>,
    pub generation: u64,
    /// Issued at the most recent lease grant; backend commands carrying a
    /// smaller token are rejected
    pub fencing_token: u64,
    /// Provenance link to the snapshot source, if any. Always acyclic: a
    /// snapshot links to an already-existing volume.
    pub source_volume: Option<String>,
    pub pending_resize: Option<PendingResize>,
    pub last_transition_ms: u64,
    /// Inconclusive reconcile attempts since the last successful commit
    pub reconcile_attempts: u32,
    /// Tombstone timestamp, set when the volume reaches `Deleted`
    pub deleted_at_ms: Option<u64>,
}

impl VolumeRecord {
    pub fn new(
        volume_id: impl Into<String>,
        name: impl Into<String>,
        requested_size: u64,
    ) -> Self {
        Self {
            volume_id: volume_id.into(),
            name: name.into(),
            requested_size,
            state: VolumeState::Pending,
            backend_id: None,
            exclusive_owner: None,
            shared_owners: BTreeSet::new(),
            generation: 1,
            fencing_token: 0,
            source_volume: None,
            pending_resize: None,
            last_transition_ms: now_ms(),
            reconcile_attempts: 0,
            deleted_at_ms: None,
        }
    }

    /// Advances the record for the next committed write: bumps the
    /// generation, stamps the transition time and clears the reconcile
    /// attempt counter.
    pub fn bump(&mut self) {
        self.generation += 1;
        self.last_transition_ms = now_ms();
        self.reconcile_attempts = 0;
    }

    /// Nodes currently owning the volume, exclusive or shared
    pub fn owners(&self) -> Vec<String> {
        match &self.exclusive_owner {
            Some(node) => vec![node.clone()],
            None => self.shared_owners.iter().cloned().collect(),
        }
    }

    pub fn has_owner(&self) -> bool {
        self.exclusive_owner.is_some() || !self.shared_owners.is_empty()
    }

    pub fn is_tombstone(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Access mode of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseMode {
    Exclusive,
    Shared,
}

impl LeaseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseMode::Exclusive => EXCLUSIVE,
            LeaseMode::Shared => SHARED,
        }
    }
}

/// A granted lease on a volume.
///
/// Honored by the backend only while `fencing_token` equals the volume's
/// current token. Expired leases are not renewable; they block new grants
/// until explicitly revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub volume_id: String,
    pub node: String,
    pub mode: LeaseMode,
    pub fencing_token: u64,
    pub expires_at_ms: u64,
    pub idempotency_token: String,
}

impl Lease {
    pub fn is_expired(
        &self,
        now_ms: u64,
    ) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Whether this lease blocks a new acquisition in `requested` mode.
    /// Exclusive blocks everything; shared blocks only exclusive.
    pub fn blocks(
        &self,
        requested: LeaseMode,
    ) -> bool {
        match self.mode {
            LeaseMode::Exclusive => true,
            LeaseMode::Shared => requested == LeaseMode::Exclusive,
        }
    }
}

/// Journal entry recording a completed operation for idempotent replay.
///
/// A request carrying an already-journaled idempotency token returns the
/// recorded snapshot without re-executing side effects. Entries are
/// garbage-collected together with the volume's tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReceipt {
    pub volume_id: String,
    pub idempotency_token: String,
    pub kind: OperationKind,
    /// Snapshot of the record as committed by the original request
    pub record: VolumeRecord,
    pub completed_at_ms: u64,
}

impl OperationReceipt {
    pub fn new(
        kind: OperationKind,
        idempotency_token: impl Into<String>,
        record: &VolumeRecord,
    ) -> Self {
        Self {
            volume_id: record.volume_id.clone(),
            idempotency_token: idempotency_token.into(),
            kind,
            record: record.clone(),
            completed_at_ms: now_ms(),
        }
    }
}
