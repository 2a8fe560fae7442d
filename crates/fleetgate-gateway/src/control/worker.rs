//! Control channel worker: the gateway's single persistent connection to
//! the cloud control plane.
//!
//! All cloud-facing traffic goes through one bidirectional stream. The
//! worker reconnects with exponential backoff, announces itself with a
//! hello frame on every fresh channel, and serializes outbound reports
//! through one ordered queue so re-connections never reorder them.
//! Reports sent on a channel that later failed are replayed on the next
//! one: the control plane may see a duplicate after a disconnect, but
//! never a gap. Hello and fleet status frames are per-channel traffic
//! and are not replayed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Streaming};
use tracing::{error, info, warn};

use fleetgate_proto::v1::control_service_client::ControlServiceClient;
use fleetgate_proto::v1::{
    AlertEvent, CloudFrame, CommandResult, DeviceSnapshot, DeviceStatus, DistributionResult,
    FleetStatus, GatewayFrame, GatewayHello, UpdateResultReport, cloud_frame, gateway_frame,
};

use crate::distribution::{CommandSpec, PackageSpec, UpdateCoordinator};
use crate::metrics::MetricsCache;
use crate::registry::DeviceRegistry;
use crate::storage::RegistrationStatus;

use super::config::ControlConfig;
use super::error::ControlError;

/// Frames sent on a live channel are remembered up to this depth so a
/// disconnect can replay what may still have been sitting in buffers.
const IN_FLIGHT_CAP: usize = 256;

/// An outbound report queued for the cloud.
#[derive(Debug, Clone)]
pub enum GatewayReport {
    UpdateOutcome(UpdateResultReport),
    Distribution(DistributionResult),
    Command(CommandResult),
    Alert(AlertEvent),
}

impl GatewayReport {
    fn to_frame(&self) -> GatewayFrame {
        let payload = match self {
            Self::UpdateOutcome(report) => gateway_frame::Payload::UpdateOutcome(report.clone()),
            Self::Distribution(result) => {
                gateway_frame::Payload::DistributionResult(result.clone())
            }
            Self::Command(result) => gateway_frame::Payload::CommandResult(result.clone()),
            Self::Alert(alert) => gateway_frame::Payload::Alert(alert.clone()),
        };
        frame(payload)
    }
}

/// Remember a report sent on the current channel, dropping the oldest
/// entry once the replay set is full.
fn record_in_flight(in_flight: &mut VecDeque<GatewayReport>, report: GatewayReport) {
    if in_flight.len() == IN_FLIGHT_CAP {
        in_flight.pop_front();
    }
    in_flight.push_back(report);
}

/// Move everything sent on a dead channel back to the front of the
/// pending queue, oldest first, ahead of any newer reports.
fn requeue_in_flight(
    pending: &mut VecDeque<GatewayReport>,
    in_flight: &mut VecDeque<GatewayReport>,
) {
    while let Some(report) = in_flight.pop_back() {
        pending.push_front(report);
    }
}

fn frame(payload: gateway_frame::Payload) -> GatewayFrame {
    GatewayFrame {
        timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
        payload: Some(payload),
    }
}

/// Worker that owns the channel to the cloud control plane.
pub struct ControlChannelWorker {
    config: ControlConfig,
    registry: Arc<DeviceRegistry>,
    coordinator: Arc<UpdateCoordinator>,
    metrics: MetricsCache,
    reports: mpsc::Receiver<GatewayReport>,
    /// Sender side of the report queue, handed to frame dispatch tasks
    /// so distribution and command results travel the same ordered path.
    reports_tx: mpsc::Sender<GatewayReport>,
    /// Reports waiting for a live channel.
    pending: VecDeque<GatewayReport>,
    /// Reports sent on the current channel, replayed if it dies.
    in_flight: VecDeque<GatewayReport>,
}

impl ControlChannelWorker {
    pub fn new(
        config: ControlConfig,
        registry: Arc<DeviceRegistry>,
        coordinator: Arc<UpdateCoordinator>,
        metrics: MetricsCache,
        reports: mpsc::Receiver<GatewayReport>,
        reports_tx: mpsc::Sender<GatewayReport>,
    ) -> Self {
        Self {
            config,
            registry,
            coordinator,
            metrics,
            reports,
            reports_tx,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    /// Run the worker with automatic reconnection.
    ///
    /// Connects to the control plane, sends the hello frame, and handles
    /// frames until the channel drops. On disconnect, reconnects with
    /// exponential backoff; the backoff resets after a connection has
    /// stayed up for over a minute.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Control channel worker shutting down");
                return;
            }

            let started = std::time::Instant::now();
            match self.connect_and_run(&mut shutdown).await {
                Ok(()) => {
                    info!("Control channel closed cleanly");
                    return;
                }
                Err(e) => {
                    requeue_in_flight(&mut self.pending, &mut self.in_flight);

                    if started.elapsed() > std::time::Duration::from_secs(60) {
                        attempt = 0;
                    }

                    if !self.config.reconnect.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        return;
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Control channel worker shutting down during reconnect wait");
                            return;
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn connect_and_run(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ControlError> {
        let endpoint = Channel::from_shared(self.config.cloud_url.clone())
            .map_err(|e| ControlError::Connection(e.to_string()))?
            .http2_keep_alive_interval(std::time::Duration::from_secs(30))
            .keep_alive_timeout(std::time::Duration::from_secs(10));

        let channel = endpoint.connect().await.map_err(|e| {
            ControlError::Connection(format!("{e}: {}", error_chain(&e)))
        })?;

        let mut client = ControlServiceClient::new(channel);

        let (outbound_tx, outbound_rx) = mpsc::channel::<GatewayFrame>(128);

        // Hello is always the first frame on a fresh channel.
        outbound_tx
            .send(frame(gateway_frame::Payload::Hello(GatewayHello {
                gateway_id: self.config.gateway_id.clone(),
            })))
            .await
            .map_err(|_| ControlError::Connection("Failed to queue hello frame".into()))?;

        // Re-send reports that were in flight when the last channel dropped,
        // oldest first, before any new traffic.
        while let Some(report) = self.pending.pop_front() {
            let report_frame = report.to_frame();
            record_in_flight(&mut self.in_flight, report);
            if outbound_tx.send(report_frame).await.is_err() {
                return Err(ControlError::Connection("Outbound channel closed".into()));
            }
        }

        let response = client
            .open_channel(Request::new(ReceiverStream::new(outbound_rx)))
            .await
            .map_err(|e| ControlError::Connection(e.to_string()))?;

        info!(gateway_id = %self.config.gateway_id, "Control channel connected");

        self.channel_loop(response.into_inner(), outbound_tx, shutdown)
            .await
    }

    /// Main channel loop: dispatch inbound cloud frames, forward queued
    /// reports, and emit fleet status on a fixed interval.
    async fn channel_loop(
        &mut self,
        mut inbound: Streaming<CloudFrame>,
        outbound_tx: mpsc::Sender<GatewayFrame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ControlError> {
        let mut status_timer = tokio::time::interval(self.config.status_interval);
        status_timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                frame_result = inbound.next() => {
                    match frame_result {
                        Some(Ok(cloud_frame)) => {
                            // Spawn frame handling so a slow distribution
                            // round never starves status frames or reports.
                            dispatch_cloud_frame(
                                cloud_frame,
                                Arc::clone(&self.registry),
                                Arc::clone(&self.coordinator),
                                self.reports_tx.clone(),
                            );
                        }
                        Some(Err(e)) => {
                            return Err(ControlError::Stream(e.to_string()));
                        }
                        None => {
                            return Err(ControlError::Connection(
                                "Stream ended by control plane".into(),
                            ));
                        }
                    }
                }
                _ = status_timer.tick() => {
                    if let Some(status) = fleet_status(&self.registry, &self.metrics).await {
                        if outbound_tx.send(frame(gateway_frame::Payload::FleetStatus(status))).await.is_err() {
                            return Err(ControlError::Connection(
                                "Outbound channel closed during status send".into(),
                            ));
                        }
                    }
                }
                report = self.reports.recv() => {
                    match report {
                        Some(report) => {
                            let report_frame = report.to_frame();
                            record_in_flight(&mut self.in_flight, report);
                            if outbound_tx.send(report_frame).await.is_err() {
                                return Err(ControlError::Connection(
                                    "Outbound channel closed during report send".into(),
                                ));
                            }
                        }
                        None => {
                            info!("Report queue closed, control channel finishing");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Control channel received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle one inbound cloud frame on its own task.
///
/// Decided results go into the persistent report queue rather than the
/// per-channel outbound sender, so a disconnect between decision and
/// send never loses them.
fn dispatch_cloud_frame(
    cloud_frame: CloudFrame,
    registry: Arc<DeviceRegistry>,
    coordinator: Arc<UpdateCoordinator>,
    reports_tx: mpsc::Sender<GatewayReport>,
) {
    let Some(payload) = cloud_frame.payload else {
        warn!("Cloud frame without payload, ignoring");
        return;
    };

    tokio::spawn(async move {
        match payload {
            cloud_frame::Payload::Package(pkg) => {
                let targets = pkg.target_uuids.clone();
                match PackageSpec::from_proto(pkg) {
                    Ok(spec) => {
                        let report = coordinator.distribute(&spec, &targets, false).await;
                        let result = GatewayReport::Distribution(report.to_proto());
                        if reports_tx.send(result).await.is_err() {
                            warn!("Report queue closed, distribution result dropped");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Package with unparseable version, ignoring");
                    }
                }
            }
            cloud_frame::Payload::Command(cmd) => {
                let spec = CommandSpec::from_proto(&cmd);
                let outcomes = coordinator.distribute_command(&spec, &cmd.target_uuids).await;
                let result = GatewayReport::Command(CommandResult {
                    command_id: cmd.command_id,
                    command_type: cmd.command_type,
                    deliveries: outcomes
                        .iter()
                        .map(|(uuid, outcome)| outcome.to_proto(uuid))
                        .collect(),
                });
                if reports_tx.send(result).await.is_err() {
                    warn!("Report queue closed, command result dropped");
                }
            }
            cloud_frame::Payload::LicenseDecision(decision) => {
                let expires_at = decision.expires_at.map_or(0, |t| t.seconds);
                if let Err(e) = registry
                    .apply_license_decision(
                        &decision.device_uuid,
                        decision.approved,
                        &decision.license_token,
                        expires_at,
                    )
                    .await
                {
                    warn!(device = %decision.device_uuid, error = %e, "License decision failed");
                }
            }
        }
    });
}

/// Build a fleet status frame from the registry snapshot and the latest
/// check-in metrics.
async fn fleet_status(registry: &DeviceRegistry, metrics: &MetricsCache) -> Option<FleetStatus> {
    let devices = match registry.snapshot().await {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "Fleet snapshot failed, skipping status frame");
            return None;
        }
    };

    let devices = devices
        .into_iter()
        .map(|d| {
            let status = match d.registration_status() {
                RegistrationStatus::Pending => DeviceStatus::Pending,
                RegistrationStatus::Registered => DeviceStatus::Registered,
                RegistrationStatus::Rejected => DeviceStatus::Rejected,
                RegistrationStatus::Expired => DeviceStatus::Expired,
            };
            DeviceSnapshot {
                device_uuid: d.uuid.clone(),
                address: d.address,
                status: status as i32,
                last_seen: Some(prost_types::Timestamp {
                    seconds: d.last_seen,
                    nanos: 0,
                }),
                license_expires_at: Some(prost_types::Timestamp {
                    seconds: d.license_expires_at,
                    nanos: 0,
                }),
                installed_version: d.installed_version.unwrap_or_default(),
                metrics: metrics.for_device(&d.uuid),
            }
        })
        .collect();

    Some(FleetStatus { devices })
}

/// Walk the `source()` chain of an error and join into a single string.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use fleetgate_core::config::RegistryConfig;
    use fleetgate_core::db::unix_timestamp;
    use fleetgate_proto::v1::{
        CommandResult, DeviceStatus, DistributionResult, UpdateOutcome, gateway_frame,
    };

    use crate::metrics::MetricsCache;
    use crate::registry::{DeviceRegistry, LicenseAuthority, LocalLicenseAuthority};
    use crate::storage::GatewayDatabase;

    use super::{GatewayReport, IN_FLIGHT_CAP, fleet_status, record_in_flight, requeue_in_flight};

    fn outcome_report(device_uuid: &str) -> GatewayReport {
        GatewayReport::UpdateOutcome(fleetgate_proto::v1::UpdateResultReport {
            device_uuid: device_uuid.to_string(),
            version: "2.0.0".to_string(),
            outcome: UpdateOutcome::Confirmed as i32,
            detail: String::new(),
            rolled_back_to: String::new(),
            reported_at: None,
        })
    }

    fn device_of(report: &GatewayReport) -> String {
        match report {
            GatewayReport::UpdateOutcome(r) => r.device_uuid.clone(),
            _ => panic!("expected an update outcome report"),
        }
    }

    async fn test_registry() -> Arc<DeviceRegistry> {
        let db = GatewayDatabase::open_in_memory().await.unwrap();
        let authority = Arc::new(LocalLicenseAuthority::new(3600));
        Arc::new(DeviceRegistry::new(
            db,
            authority as Arc<dyn LicenseAuthority>,
            RegistryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn fleet_status_folds_in_latest_metrics() {
        let registry = test_registry().await;
        registry.request_registration("d1", "10.0.0.5:50061", "pump").await.unwrap();

        let metrics = MetricsCache::new();
        metrics.record("d1", HashMap::from([("uptime_secs".to_string(), 120.0)]));

        let status = fleet_status(&registry, &metrics).await.unwrap();
        assert_eq!(status.devices.len(), 1);

        let snapshot = &status.devices[0];
        assert_eq!(snapshot.device_uuid, "d1");
        assert_eq!(snapshot.status, DeviceStatus::Registered as i32);
        assert_eq!(snapshot.metrics.get("uptime_secs"), Some(&120.0));
        assert!(snapshot.license_expires_at.unwrap().seconds > unix_timestamp());
    }

    #[test]
    fn report_frames_carry_timestamps() {
        let report = GatewayReport::UpdateOutcome(fleetgate_proto::v1::UpdateResultReport {
            device_uuid: "d1".to_string(),
            version: "2.0.0".to_string(),
            outcome: UpdateOutcome::Confirmed as i32,
            detail: String::new(),
            rolled_back_to: String::new(),
            reported_at: None,
        });

        let frame = report.to_frame();
        assert!(frame.timestamp.is_some());
        assert!(matches!(
            frame.payload,
            Some(gateway_frame::Payload::UpdateOutcome(_))
        ));
    }

    #[test]
    fn result_reports_map_to_their_frame_payloads() {
        let distribution = GatewayReport::Distribution(DistributionResult {
            package_id: "pkg-1".to_string(),
            version: "2.0.0".to_string(),
            deliveries: Vec::new(),
        });
        assert!(matches!(
            distribution.to_frame().payload,
            Some(gateway_frame::Payload::DistributionResult(_))
        ));

        let command = GatewayReport::Command(CommandResult {
            command_id: "cmd-1".to_string(),
            command_type: "rollback".to_string(),
            deliveries: Vec::new(),
        });
        assert!(matches!(
            command.to_frame().payload,
            Some(gateway_frame::Payload::CommandResult(_))
        ));
    }

    #[test]
    fn replayed_reports_precede_newer_pending_ones() {
        // d1 and d2 were sent on the channel that just died; d3 arrived
        // while it was down.
        let mut in_flight = VecDeque::from([outcome_report("d1"), outcome_report("d2")]);
        let mut pending = VecDeque::from([outcome_report("d3")]);

        requeue_in_flight(&mut pending, &mut in_flight);

        assert!(in_flight.is_empty());
        let order: Vec<String> = pending.iter().map(device_of).collect();
        assert_eq!(order, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn in_flight_replay_set_is_bounded() {
        let mut in_flight = VecDeque::new();
        for i in 0..IN_FLIGHT_CAP + 10 {
            record_in_flight(&mut in_flight, outcome_report(&format!("d{i}")));
        }

        assert_eq!(in_flight.len(), IN_FLIGHT_CAP);
        // The oldest entries fall off the front.
        assert_eq!(device_of(&in_flight[0]), "d10");
    }
}
