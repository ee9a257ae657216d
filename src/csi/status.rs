use tonic::Status;

use crate::BackendError;
use crate::CoordinationError;
use crate::Error;
use crate::LockError;
use crate::SystemError;
use crate::TransitionError;

/// Maps the internal error taxonomy onto the CSI status surface.
///
/// Retryable races surface as ABORTED, attachment and ordering
/// violations as FAILED_PRECONDITION, infrastructure faults and unknown
/// outcomes as UNAVAILABLE so the CO retries them.
pub fn error_to_status(e: Error) -> Status {
    match e {
        Error::Coordination(coordination) => coordination_status(coordination),
        Error::System(system) => system_status(system),
        Error::Config(e) => Status::internal(e.to_string()),
        Error::Fatal(message) => Status::internal(message),
    }
}

fn coordination_status(e: CoordinationError) -> Status {
    match e {
        CoordinationError::Conflict { .. } => Status::aborted(e.to_string()),
        CoordinationError::VolumeInUse { .. } => Status::failed_precondition(e.to_string()),
        CoordinationError::CapacityExceeded { .. } => Status::resource_exhausted(e.to_string()),
        CoordinationError::Fenced { .. } => Status::aborted(e.to_string()),
        CoordinationError::VolumeNotFound(_) => Status::not_found(e.to_string()),
        CoordinationError::AlreadyExists { .. } => Status::already_exists(e.to_string()),
        CoordinationError::Transition(ref transition) => match transition {
            TransitionError::ResizeInProgress { .. } => Status::aborted(e.to_string()),
            TransitionError::Illegal { .. } | TransitionError::OnlineSnapshotUnsupported => {
                Status::failed_precondition(e.to_string())
            }
        },
        CoordinationError::Lock(ref lock) => match lock {
            LockError::Conflict { .. } | LockError::NotHeld { .. } => {
                Status::failed_precondition(e.to_string())
            }
            LockError::Expired { .. } => Status::aborted(e.to_string()),
        },
    }
}

fn system_status(e: SystemError) -> Status {
    match e {
        SystemError::Backend(ref backend) => match backend {
            BackendError::Unavailable(_)
            | BackendError::Unknown { .. }
            | BackendError::RetriesExhausted { .. } => Status::unavailable(e.to_string()),
            BackendError::CommandFailed(_) | BackendError::MalformedReply(_) => {
                Status::internal(e.to_string())
            }
        },
        other => Status::internal(other.to_string()),
    }
}
