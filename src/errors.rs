//! Volume Coordinator Error Hierarchy
//!
//! Defines the error types for the volume lifecycle and attachment
//! coordinator, categorized by infrastructure layer and coordination
//! concerns.

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (record store, backend, serialization)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Volume coordination violations and failures
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// Generation compare-and-swap lost against a concurrent writer
    #[error("Generation conflict on volume {volume_id} (expected: {expected}, found: {found})")]
    Conflict {
        volume_id: String,
        expected: u64,
        found: u64,
    },

    /// Operation requires the volume to be detached first
    #[error("Volume {volume_id} is in use by {holders:?}")]
    VolumeInUse {
        volume_id: String,
        holders: Vec<String>,
    },

    /// Backend has no room for the requested allocation; not retried
    #[error("Capacity exceeded: requested {requested} bytes")]
    CapacityExceeded { requested: u64 },

    /// Stale fencing token rejected; a newer lease exists on the volume
    #[error("Fencing token {presented} is stale for volume {volume_id} (current: {current})")]
    Fenced {
        volume_id: String,
        presented: u64,
        current: u64,
    },

    #[error("Volume {0} not found")]
    VolumeNotFound(String),

    #[error("Volume named {name} already exists with a different size (id: {volume_id})")]
    AlreadyExists { volume_id: String, name: String },

    /// Illegal volume state transitions
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Lease acquisition and renewal failures
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("{operation} is not legal from state {from}")]
    Illegal {
        operation: &'static str,
        from: &'static str,
    },

    #[error("A resize to {target_size} bytes is already pending")]
    ResizeInProgress { target_size: u64 },

    #[error("Backend does not support snapshots of in-use volumes")]
    OnlineSnapshotUnsupported,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another valid lease blocks the requested acquisition
    #[error("Lease conflict on volume {volume_id}: held by {holder} ({mode})")]
    Conflict {
        volume_id: String,
        holder: String,
        mode: &'static str,
    },

    /// Expired leases are not renewable and block new grants until revoked
    #[error("Lease on volume {volume_id} held by {node} has expired")]
    Expired { volume_id: String, node: String },

    #[error("No lease on volume {volume_id} is held by {node}")]
    NotHeld { volume_id: String, node: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    // Record store layer
    #[error("Record store operation failed")]
    Store(#[from] StoreError),

    // Block-storage backend layer
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    //Serialization
    #[error("Serialization error")]
    Serialization(#[from] SerializationError),

    // Basic coordinator operations
    #[error("Coordinator failed to start: {0}")]
    StartupFailed(String),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSendFailed(String),

    #[error("General coordinator error: {0}")]
    General(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Disk I/O failures of the embedded store
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Record decoding failures
    #[error("Record corruption detected at {location}")]
    DataCorruption { location: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transient infrastructure fault; retried with backoff
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Deadline elapsed or the reply was lost; neither success nor failure.
    /// Completion is owned by the reconciler.
    #[error("Backend outcome unknown for {operation} on volume {volume_id}")]
    Unknown {
        operation: &'static str,
        volume_id: String,
    },

    /// The backend reported a definite failure
    #[error("Backend command failed: {0}")]
    CommandFailed(String),

    /// Helper reply could not be parsed
    #[error("Backend reply malformed: {0}")]
    MalformedReply(String),

    /// Retry policy exhaustion
    #[error("Backend retries exhausted for {operation}")]
    RetriesExhausted { operation: &'static str },
}

// Serialization is classified separately (record store and helper reply framing)
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Bincode serialization failed: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

// ============== Conversion Implementations ============== //
impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::System(SystemError::Store(e))
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::System(SystemError::Backend(e))
    }
}

impl From<SerializationError> for Error {
    fn from(e: SerializationError) -> Self {
        Error::System(SystemError::Serialization(e))
    }
}

// ===== Coordination error conversions =====

impl From<TransitionError> for Error {
    fn from(e: TransitionError) -> Self {
        Error::Coordination(CoordinationError::Transition(e))
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        Error::Coordination(CoordinationError::Lock(e))
    }
}

// ===== Infrastructure conversions =====

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StoreError::DbError(err.to_string()).into()
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        SerializationError::Bincode(err).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::Json(err).into()
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        SystemError::TaskFailed(err).into()
    }
}

impl Error {
    /// Whether a caller-side retry of the whole transition may succeed.
    ///
    /// Generation conflicts and transient backend faults are retryable;
    /// capacity exhaustion, fencing and illegal transitions are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Coordination(CoordinationError::Conflict { .. })
                | Error::System(SystemError::Backend(BackendError::Unavailable(_)))
        )
    }
}
