//! Device push channel.
//!
//! The coordinator talks to devices through the [`PackagePusher`] trait so
//! distribution logic can be exercised against counting mocks; the
//! production implementation dials the agent's gRPC server at its
//! registered address with a per-call timeout.

use std::time::Duration;

use tonic::transport::Endpoint;
use tracing::debug;

use fleetgate_proto::v1::agent_service_client::AgentServiceClient;
use fleetgate_proto::v1::{PushCommandRequest, PushPackageRequest, PushStatus};

use crate::storage::DeviceRecord;

use super::{CommandSpec, PackageSpec};

/// Acknowledgment from an agent for a package push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    /// Package accepted; an update session has started on the device.
    Accepted,
    /// The device has an active session; try again later.
    Busy,
    /// Policy rejection on the device (signature, version, license).
    Rejected(String),
}

/// Transport-level push failures (retryable).
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Push failed: {0}")]
    Rpc(String),
}

#[tonic::async_trait]
pub trait PackagePusher: Send + Sync {
    async fn push_package(
        &self,
        device: &DeviceRecord,
        package: &PackageSpec,
        force: bool,
    ) -> Result<PushAck, PushError>;

    async fn push_command(
        &self,
        device: &DeviceRecord,
        command: &CommandSpec,
    ) -> Result<PushAck, PushError>;
}

/// Production pusher dialing each agent's gRPC server.
#[derive(Debug, Clone)]
pub struct GrpcPackagePusher {
    timeout: Duration,
}

impl GrpcPackagePusher {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(
        &self,
        device: &DeviceRecord,
    ) -> Result<AgentServiceClient<tonic::transport::Channel>, PushError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", device.address))
            .map_err(|e| PushError::Unreachable(e.to_string()))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| PushError::Unreachable(e.to_string()))?;

        Ok(AgentServiceClient::new(channel))
    }
}

#[tonic::async_trait]
impl PackagePusher for GrpcPackagePusher {
    async fn push_package(
        &self,
        device: &DeviceRecord,
        package: &PackageSpec,
        force: bool,
    ) -> Result<PushAck, PushError> {
        let mut client = self.connect(device).await?;

        debug!(device = %device.uuid, version = %package.version, "Pushing package");

        let response = client
            .push_package(PushPackageRequest {
                package: Some(package.to_proto(Vec::new())),
                force,
            })
            .await
            .map_err(|e| PushError::Rpc(e.to_string()))?
            .into_inner();

        match PushStatus::try_from(response.status) {
            Ok(PushStatus::Accepted) => Ok(PushAck::Accepted),
            Ok(PushStatus::Busy) => Ok(PushAck::Busy),
            Ok(PushStatus::Rejected) => Ok(PushAck::Rejected(response.detail)),
            _ => Err(PushError::Rpc(format!(
                "Unexpected push status {}",
                response.status
            ))),
        }
    }

    async fn push_command(
        &self,
        device: &DeviceRecord,
        command: &CommandSpec,
    ) -> Result<PushAck, PushError> {
        let mut client = self.connect(device).await?;

        debug!(device = %device.uuid, command = %command.command_id, "Pushing command");

        let response = client
            .push_command(PushCommandRequest {
                command: Some(fleetgate_proto::v1::Command {
                    command_id: command.command_id.clone(),
                    command_type: command.command_type.clone(),
                    target_uuids: vec![device.uuid.clone()],
                    params_json: command.params_json.clone(),
                }),
            })
            .await
            .map_err(|e| PushError::Rpc(e.to_string()))?
            .into_inner();

        if response.accepted {
            Ok(PushAck::Accepted)
        } else {
            Ok(PushAck::Rejected(response.detail))
        }
    }
}
