use tonic::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Ternary outcome of a backend command.
///
/// `Unknown` is reported when the command's deadline elapsed or its
/// reply was lost; it is never treated as success or failure by callers.
/// Completing an `Unknown` operation is the reconciler's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    Failure(FailureReason),
    Unknown,
}

impl<T> Outcome<T> {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Outcome::Unknown)
    }

    /// Discards the success payload
    pub fn map_unit(self) -> Outcome<()> {
        match self {
            Outcome::Success(_) => Outcome::Success(()),
            Outcome::Failure(reason) => Outcome::Failure(reason),
            Outcome::Unknown => Outcome::Unknown,
        }
    }
}

/// Definite failures the backend distinguishes for the coordinator's
/// error taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No room for the requested allocation; terminal for the request
    CapacityExceeded,
    /// The presented fencing token is stale; a newer lease exists
    Fenced,
    /// The target backend volume does not exist
    NotFound,
    Other(String),
}

/// Ground-truth report of one backend volume, used by the reconciler to
/// converge records after a crash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub exists: bool,
    pub size: u64,
    pub mapped_nodes: Vec<String>,
}

impl ProbeReport {
    pub fn absent() -> Self {
        Self {
            exists: false,
            size: 0,
            mapped_nodes: Vec::new(),
        }
    }
}

/// Optional features the backend advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Whether an in-use volume may be snapshotted without quiescing
    pub online_snapshot: bool,
}

/// Narrow command interface to the SAN backend.
///
/// Every mutation is idempotent for a given idempotency token and is
/// bounded by a deadline; an elapsed deadline yields `Outcome::Unknown`.
/// Mapping commands carry the caller's fencing token and the backend
/// rejects stale tokens, so a fenced node cannot mutate a volume even
/// after regaining connectivity.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendExecutor: Send + Sync + 'static {
    /// Allocates a thin-provisioned volume; returns the backend id
    async fn create_volume(
        &self,
        size: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<String>>;

    async fn delete_volume(
        &self,
        backend_id: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<()>>;

    /// Makes the volume's block device reachable from `node`
    async fn map_volume(
        &self,
        backend_id: &str,
        node: &str,
        fencing_token: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<()>>;

    async fn unmap_volume(
        &self,
        backend_id: &str,
        node: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<()>>;

    async fn resize_volume(
        &self,
        backend_id: &str,
        size: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<()>>;

    /// Takes a point-in-time copy; returns the new backend id
    async fn snapshot_volume(
        &self,
        backend_id: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<String>>;

    /// Read-only ground-truth query; never deduplicated
    async fn probe_volume(
        &self,
        backend_id: &str,
    ) -> Result<ProbeReport>;

    fn capabilities(&self) -> BackendCapabilities;
}
