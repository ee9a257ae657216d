use std::sync::Arc;

use autometrics::autometrics;
use tonic::Status;
use tracing::debug;

use super::error_to_status;
use crate::BackendExecutor;
use crate::CoordinationError;
use crate::Error;
use crate::LeaseMode;
use crate::RecordStore;
use crate::VolumeLifecycle;
use crate::VolumeState;
use crate::API_SLO;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeResponse {
    pub volume_id: String,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    /// Read-only attachments take a shared lease; writable ones are
    /// exclusive
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPublishVolumeResponse {
    /// Handed to the node plumbing; the backend rejects smaller tokens
    pub fencing_token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotResponse {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub ready_to_use: bool,
}

/// Service logic behind the CSI controller and node RPCs.
///
/// Every call derives its idempotency token from the request parameters,
/// so replaying an identical request replays the recorded result instead
/// of re-executing side effects.
pub struct CsiService<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    lifecycle: Arc<VolumeLifecycle<R, B>>,
}

impl<R, B> CsiService<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    pub fn new(lifecycle: Arc<VolumeLifecycle<R, B>>) -> Self {
        Self { lifecycle }
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn create_volume(
        &self,
        request: CreateVolumeRequest,
    ) -> std::result::Result<CreateVolumeResponse, Status> {
        if request.name.is_empty() {
            return Err(Status::invalid_argument("volume name missing in request"));
        }
        if request.capacity_bytes == 0 {
            return Err(Status::invalid_argument("capacity_bytes must be positive"));
        }

        let token = format!("csi-create:{}:{}", request.name, request.capacity_bytes);
        let record = self
            .lifecycle
            .create(&request.name, request.capacity_bytes, &token)
            .await
            .map_err(error_to_status)?;

        Ok(CreateVolumeResponse {
            volume_id: record.volume_id,
            capacity_bytes: record.requested_size,
        })
    }

    /// Idempotent: deleting an unknown or already-deleted volume succeeds
    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn delete_volume(
        &self,
        request: DeleteVolumeRequest,
    ) -> std::result::Result<(), Status> {
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id missing in request"));
        }

        let token = format!("csi-delete:{}", request.volume_id);
        match self.lifecycle.delete(&request.volume_id, &token).await {
            Ok(_) => Ok(()),
            Err(Error::Coordination(CoordinationError::VolumeNotFound(volume_id))) => {
                debug!("delete of unknown volume {} acked", volume_id);
                Ok(())
            }
            Err(e) => Err(error_to_status(e)),
        }
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn controller_publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
    ) -> std::result::Result<ControllerPublishVolumeResponse, Status> {
        if request.volume_id.is_empty() || request.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "volume_id and node_id required in request",
            ));
        }

        let mode = if request.readonly {
            LeaseMode::Shared
        } else {
            LeaseMode::Exclusive
        };
        let token = format!(
            "csi-publish:{}:{}:{}",
            request.volume_id,
            request.node_id,
            mode.as_str()
        );
        let record = self
            .lifecycle
            .publish(&request.volume_id, &request.node_id, mode, &token)
            .await
            .map_err(error_to_status)?;

        Ok(ControllerPublishVolumeResponse {
            fencing_token: record.fencing_token,
        })
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn controller_unpublish_volume(
        &self,
        request: ControllerUnpublishVolumeRequest,
    ) -> std::result::Result<(), Status> {
        if request.volume_id.is_empty() || request.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "volume_id and node_id required in request",
            ));
        }

        let token = format!("csi-unpublish:{}:{}", request.volume_id, request.node_id);
        match self
            .lifecycle
            .unpublish(&request.volume_id, &request.node_id, &token)
            .await
        {
            Ok(_) => Ok(()),
            // Unpublish of a vanished volume is an idempotent ack
            Err(Error::Coordination(CoordinationError::VolumeNotFound(_))) => Ok(()),
            Err(e) => Err(error_to_status(e)),
        }
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn node_stage_volume(
        &self,
        request: NodeStageVolumeRequest,
    ) -> std::result::Result<(), Status> {
        if request.volume_id.is_empty() || request.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "volume_id and node_id required in request",
            ));
        }

        let token = format!("csi-stage:{}:{}", request.volume_id, request.node_id);
        self.lifecycle
            .stage(&request.volume_id, &request.node_id, &token)
            .await
            .map(|_| ())
            .map_err(error_to_status)
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn node_unstage_volume(
        &self,
        request: NodeUnstageVolumeRequest,
    ) -> std::result::Result<(), Status> {
        if request.volume_id.is_empty() || request.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "volume_id and node_id required in request",
            ));
        }

        let token = format!("csi-unstage:{}:{}", request.volume_id, request.node_id);
        match self
            .lifecycle
            .unstage(&request.volume_id, &request.node_id, &token)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Coordination(CoordinationError::VolumeNotFound(_))) => Ok(()),
            Err(e) => Err(error_to_status(e)),
        }
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn controller_expand_volume(
        &self,
        request: ControllerExpandVolumeRequest,
    ) -> std::result::Result<ControllerExpandVolumeResponse, Status> {
        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id missing in request"));
        }
        if request.capacity_bytes == 0 {
            return Err(Status::invalid_argument("capacity_bytes must be positive"));
        }

        let token = format!(
            "csi-expand:{}:{}",
            request.volume_id, request.capacity_bytes
        );
        let record = self
            .lifecycle
            .resize(&request.volume_id, request.capacity_bytes, &token)
            .await
            .map_err(error_to_status)?;

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: record.requested_size,
        })
    }

    #[cfg_attr(not(doc), autometrics(objective = API_SLO))]
    pub async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> std::result::Result<CreateSnapshotResponse, Status> {
        if request.name.is_empty() {
            return Err(Status::invalid_argument("snapshot name missing in request"));
        }
        if request.source_volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "source_volume_id missing in request",
            ));
        }

        let token = format!(
            "csi-snapshot:{}:{}",
            request.source_volume_id, request.name
        );
        let record = self
            .lifecycle
            .snapshot(&request.source_volume_id, &request.name, &token)
            .await
            .map_err(error_to_status)?;

        Ok(CreateSnapshotResponse {
            snapshot_id: record.volume_id,
            source_volume_id: request.source_volume_id,
            ready_to_use: record.state == VolumeState::Provisioned,
        })
    }
}
