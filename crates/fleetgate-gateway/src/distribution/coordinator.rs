//! Update distribution coordinator.
//!
//! Verifies a package signature once, gates targets through registry
//! eligibility, then pushes to each eligible device concurrently with
//! bounded retries. Outcomes are per device; no device's failure aborts
//! the round for the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio::time::sleep;
use tracing::{info, warn};

use fleetgate_crypto::PackageVerifier;

use crate::registry::DeviceRegistry;
use crate::storage::DeviceRecord;

use super::{CommandSpec, DeliveryOutcome, PackageSpec, PackagePusher, PushAck, PushError};

/// Bounded retry policy for device pushes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum push attempts per device per round.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Per-device outcomes of one distribution round.
#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub package_id: String,
    pub version: String,
    pub outcomes: Vec<(String, DeliveryOutcome)>,
}

impl DistributionReport {
    pub fn outcome_for(&self, uuid: &str) -> Option<&DeliveryOutcome> {
        self.outcomes.iter().find(|(u, _)| u == uuid).map(|(_, o)| o)
    }

    pub fn to_proto(&self) -> fleetgate_proto::v1::DistributionResult {
        fleetgate_proto::v1::DistributionResult {
            package_id: self.package_id.clone(),
            version: self.version.clone(),
            deliveries: self
                .outcomes
                .iter()
                .map(|(uuid, outcome)| outcome.to_proto(uuid))
                .collect(),
        }
    }
}

/// Selects targets, verifies signatures, and pushes packages.
pub struct UpdateCoordinator {
    registry: Arc<DeviceRegistry>,
    pusher: Arc<dyn PackagePusher>,
    verifier: PackageVerifier,
    policy: RetryPolicy,
}

impl UpdateCoordinator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        pusher: Arc<dyn PackagePusher>,
        verifier: PackageVerifier,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            pusher,
            verifier,
            policy,
        }
    }

    /// Distribute a package to the given targets.
    ///
    /// `force` permits pushing a version that is not strictly newer than
    /// the device's installed one (rollback-driven redistribution).
    pub async fn distribute(
        &self,
        package: &PackageSpec,
        targets: &[String],
        force: bool,
    ) -> DistributionReport {
        let mut report = DistributionReport {
            package_id: package.package_id.clone(),
            version: package.version.to_string(),
            outcomes: Vec::with_capacity(targets.len()),
        };

        // Signature is checked once per round, before any device work.
        if let Err(e) = self.verifier.verify(&package.content, &package.signature) {
            warn!(package = %package.package_id, error = %e, "Package signature rejected");
            for uuid in targets {
                report
                    .outcomes
                    .push((uuid.clone(), DeliveryOutcome::Rejected("signature verification failed".into())));
            }
            return report;
        }

        let eligible = match self.registry.list_eligible_targets(targets).await {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(error = %e, "Eligibility lookup failed");
                for uuid in targets {
                    report
                        .outcomes
                        .push((uuid.clone(), DeliveryOutcome::Failed(e.to_string())));
                }
                return report;
            }
        };
        let eligible: HashMap<String, DeviceRecord> =
            eligible.into_iter().map(|d| (d.uuid.clone(), d)).collect();

        let package = Arc::new(package.clone());
        let mut handles = Vec::new();

        for uuid in targets {
            let Some(device) = eligible.get(uuid) else {
                report
                    .outcomes
                    .push((uuid.clone(), DeliveryOutcome::Rejected("device not eligible".into())));
                continue;
            };

            // Idempotence: the device already reports this exact version
            // installed, so re-delivery is a no-op success.
            if device.installed_version.as_deref() == Some(report.version.as_str()) {
                report.outcomes.push((uuid.clone(), DeliveryOutcome::Delivered));
                continue;
            }

            // Version gate: never push a stale version unless forced.
            if !force && let Some(installed) = parse_installed(device) {
                if package.version <= installed {
                    report.outcomes.push((
                        uuid.clone(),
                        DeliveryOutcome::Rejected(format!(
                            "version {} not newer than installed {installed}",
                            package.version
                        )),
                    ));
                    continue;
                }
            }

            let device = device.clone();
            let package = Arc::clone(&package);
            let pusher = Arc::clone(&self.pusher);
            let policy = self.policy;
            handles.push(tokio::spawn(async move {
                let outcome = push_with_retry(&*pusher, &device, &package, force, policy).await;
                (device.uuid, outcome)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((uuid, outcome)) => report.outcomes.push((uuid, outcome)),
                Err(e) => warn!(error = %e, "Push task aborted"),
            }
        }

        info!(
            package = %report.package_id,
            version = %report.version,
            targets = targets.len(),
            delivered = report
                .outcomes
                .iter()
                .filter(|(_, o)| *o == DeliveryOutcome::Delivered)
                .count(),
            "Distribution round complete"
        );

        report
    }

    /// Push a command to its targets with the same eligibility gate and
    /// retry bounds as package distribution.
    pub async fn distribute_command(
        &self,
        command: &CommandSpec,
        targets: &[String],
    ) -> Vec<(String, DeliveryOutcome)> {
        let eligible = match self.registry.list_eligible_targets(targets).await {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(error = %e, "Eligibility lookup failed");
                return targets
                    .iter()
                    .map(|uuid| (uuid.clone(), DeliveryOutcome::Failed(e.to_string())))
                    .collect();
            }
        };
        let eligible: HashMap<String, DeviceRecord> =
            eligible.into_iter().map(|d| (d.uuid.clone(), d)).collect();

        let mut handles = Vec::new();
        let mut outcomes = Vec::with_capacity(targets.len());

        for uuid in targets {
            let Some(device) = eligible.get(uuid) else {
                outcomes.push((uuid.clone(), DeliveryOutcome::Rejected("device not eligible".into())));
                continue;
            };

            let device = device.clone();
            let command = command.clone();
            let pusher = Arc::clone(&self.pusher);
            let policy = self.policy;
            handles.push(tokio::spawn(async move {
                let mut last_error = String::new();
                for attempt in 0..policy.max_retries.max(1) {
                    match pusher.push_command(&device, &command).await {
                        Ok(PushAck::Accepted) => {
                            return (device.uuid, DeliveryOutcome::Delivered);
                        }
                        Ok(PushAck::Rejected(reason)) => {
                            return (device.uuid, DeliveryOutcome::Rejected(reason));
                        }
                        Ok(PushAck::Busy) => last_error = "device busy".to_string(),
                        Err(e) => last_error = e.to_string(),
                    }
                    if attempt + 1 < policy.max_retries.max(1) {
                        sleep(policy.retry_delay).await;
                    }
                }
                (device.uuid, DeliveryOutcome::Failed(last_error))
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((uuid, outcome)) => outcomes.push((uuid, outcome)),
                Err(e) => warn!(error = %e, "Command push task aborted"),
            }
        }

        outcomes
    }
}

fn parse_installed(device: &DeviceRecord) -> Option<Version> {
    device
        .installed_version
        .as_deref()
        .and_then(|v| Version::parse(v).ok())
}

/// One device's attempt sequence. Transient failures (transport errors,
/// busy devices) are retried with a fixed delay; a policy rejection from
/// the device is terminal immediately.
async fn push_with_retry(
    pusher: &dyn PackagePusher,
    device: &DeviceRecord,
    package: &PackageSpec,
    force: bool,
    policy: RetryPolicy,
) -> DeliveryOutcome {
    let attempts = policy.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match pusher.push_package(device, package, force).await {
            Ok(PushAck::Accepted) => return DeliveryOutcome::Delivered,
            Ok(PushAck::Rejected(reason)) => return DeliveryOutcome::Rejected(reason),
            Ok(PushAck::Busy) => {
                last_error = "device busy".to_string();
            }
            Err(e @ (PushError::Unreachable(_) | PushError::Rpc(_))) => {
                last_error = e.to_string();
            }
        }
        warn!(
            device = %device.uuid,
            attempt = attempt + 1,
            error = %last_error,
            "Push attempt failed"
        );
        if attempt + 1 < attempts {
            sleep(policy.retry_delay).await;
        }
    }

    DeliveryOutcome::Failed(last_error)
}
