//! Update distribution: signed package fan-out to eligible devices.

mod coordinator;
mod pusher;

#[cfg(test)]
mod tests;

pub use coordinator::{DistributionReport, RetryPolicy, UpdateCoordinator};
pub use pusher::{GrpcPackagePusher, PackagePusher, PushAck, PushError};

use semver::Version;

/// A verified-parseable update package on the gateway side.
#[derive(Debug, Clone)]
pub struct PackageSpec {
    pub package_id: String,
    pub version: Version,
    pub filename: String,
    pub content: Vec<u8>,
    pub signature: Vec<u8>,
}

impl PackageSpec {
    /// Convert from the wire form, parsing the semantic version.
    pub fn from_proto(pkg: fleetgate_proto::v1::UpdatePackage) -> Result<Self, semver::Error> {
        Ok(Self {
            package_id: pkg.package_id,
            version: Version::parse(&pkg.version)?,
            filename: pkg.filename,
            content: pkg.content,
            signature: pkg.signature,
        })
    }

    pub fn to_proto(&self, targets: Vec<String>) -> fleetgate_proto::v1::UpdatePackage {
        fleetgate_proto::v1::UpdatePackage {
            package_id: self.package_id.clone(),
            version: self.version.to_string(),
            filename: self.filename.clone(),
            content: self.content.clone(),
            signature: self.signature.clone(),
            target_uuids: targets,
        }
    }
}

/// A fire-and-acknowledge command for devices.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command_id: String,
    pub command_type: String,
    pub params_json: String,
}

impl CommandSpec {
    pub fn from_proto(cmd: &fleetgate_proto::v1::Command) -> Self {
        Self {
            command_id: cmd.command_id.clone(),
            command_type: cmd.command_type.clone(),
            params_json: cmd.params_json.clone(),
        }
    }
}

/// Terminal per-device outcome of one distribution round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Rejected(String),
    Failed(String),
}

impl DeliveryOutcome {
    pub fn to_proto(&self, device_uuid: &str) -> fleetgate_proto::v1::DeviceDelivery {
        use fleetgate_proto::v1::DeliveryStatus;
        let (status, detail) = match self {
            Self::Delivered => (DeliveryStatus::Delivered, String::new()),
            Self::Rejected(reason) => (DeliveryStatus::Rejected, reason.clone()),
            Self::Failed(error) => (DeliveryStatus::Failed, error.clone()),
        };
        fleetgate_proto::v1::DeviceDelivery {
            device_uuid: device_uuid.to_string(),
            status: status as i32,
            detail,
        }
    }
}
