//! Gateway-facing client loops: registration, periodic check-in, license
//! renewal, and exactly-once delivery of session reports.
//!
//! Each terminal session outcome is held until the gateway acknowledges
//! it; delivery failures are retried with a fixed delay rather than
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use fleetgate_proto::v1::gateway_service_client::GatewayServiceClient;
use fleetgate_proto::v1::{CheckInRequest, RegisterRequest, RenewLicenseRequest};

use fleetgate_core::db::unix_timestamp;

use crate::executor::{SessionReport, UpdateExecutor};
use crate::store::VersionStore;

#[derive(Debug, Clone)]
pub struct CheckinConfig {
    /// Gateway URL, e.g. "http://10.0.0.1:50060".
    pub gateway_url: String,
    pub device_uuid: String,
    pub device_name: String,
    /// Address the gateway dials back to reach this agent's server.
    pub advertise_address: String,
    pub checkin_interval: Duration,
    /// Renew once less than this much license validity remains.
    pub renewal_lead: Duration,
    /// Delay between retries of failed gateway calls.
    pub retry_delay: Duration,
}

/// Worker owning all agent-initiated traffic to the gateway.
pub struct CheckinWorker {
    config: CheckinConfig,
    executor: Arc<UpdateExecutor>,
    store: Arc<VersionStore>,
    reports: mpsc::Receiver<SessionReport>,
    started: Instant,
}

impl CheckinWorker {
    pub fn new(
        config: CheckinConfig,
        executor: Arc<UpdateExecutor>,
        store: Arc<VersionStore>,
        reports: mpsc::Receiver<SessionReport>,
    ) -> Self {
        Self {
            config,
            executor,
            store,
            reports,
            started: Instant::now(),
        }
    }

    async fn client(
        &self,
    ) -> Result<GatewayServiceClient<tonic::transport::Channel>, tonic::transport::Error> {
        GatewayServiceClient::connect(self.config.gateway_url.clone()).await
    }

    /// Register with the gateway, retrying until accepted or shut down.
    pub async fn register(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }

            match self.try_register().await {
                Ok(Some(expires_at)) => {
                    self.executor.set_license_valid_until(expires_at);
                    info!(expires_at, "Registered with gateway");
                    return true;
                }
                Ok(None) => {
                    warn!("Registration not accepted, retrying");
                }
                Err(e) => {
                    warn!(error = %e, "Registration attempt failed");
                }
            }

            tokio::select! {
                () = sleep(self.config.retry_delay) => {}
                _ = shutdown.changed() => return false,
            }
        }
    }

    async fn try_register(&self) -> Result<Option<i64>, tonic::Status> {
        let mut client = self
            .client()
            .await
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;

        let resp = client
            .register(RegisterRequest {
                device_uuid: self.config.device_uuid.clone(),
                address: self.config.advertise_address.clone(),
                name: self.config.device_name.clone(),
            })
            .await?
            .into_inner();

        if resp.accepted {
            Ok(Some(resp.license_expires_at.map_or(0, |t| t.seconds)))
        } else {
            warn!(detail = %resp.detail, "Gateway declined registration");
            Ok(None)
        }
    }

    /// Main loop: periodic check-ins, renewal ahead of expiry, and report
    /// delivery.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.register(&mut shutdown).await {
            return;
        }

        let mut checkin_timer = tokio::time::interval(self.config.checkin_interval);
        checkin_timer.tick().await; // Skip first immediate tick
        let mut renewal_timer = tokio::time::interval(Duration::from_secs(60));
        renewal_timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = checkin_timer.tick() => {
                    if let Err(e) = self.check_in().await {
                        warn!(error = %e, "Check-in failed");
                    }
                }
                _ = renewal_timer.tick() => {
                    let expires_at = self.executor.license_valid_until();
                    if renewal_due(expires_at, unix_timestamp(), self.config.renewal_lead) {
                        self.renew().await;
                    }
                }
                report = self.reports.recv() => {
                    match report {
                        Some(report) => self.deliver_report(report, &mut shutdown).await,
                        None => {
                            info!("Report channel closed, check-in worker finishing");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Check-in worker shutting down");
                    return;
                }
            }
        }
    }

    async fn check_in(&self) -> Result<(), tonic::Status> {
        let mut client = self
            .client()
            .await
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;

        let installed_version = self
            .store
            .installed_version()
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default();

        #[allow(clippy::cast_precision_loss)]
        let metrics = HashMap::from([(
            "uptime_secs".to_string(),
            self.started.elapsed().as_secs() as f64,
        )]);

        client
            .check_in(CheckInRequest {
                device_uuid: self.config.device_uuid.clone(),
                address: self.config.advertise_address.clone(),
                installed_version,
                metrics,
            })
            .await?;
        Ok(())
    }

    async fn renew(&self) {
        let resp = async {
            let mut client = self
                .client()
                .await
                .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
            client
                .renew_license(RenewLicenseRequest {
                    device_uuid: self.config.device_uuid.clone(),
                })
                .await
        }
        .await;

        match resp {
            Ok(resp) => {
                let resp = resp.into_inner();
                if resp.accepted {
                    let expires_at = resp.license_expires_at.map_or(0, |t| t.seconds);
                    self.executor.set_license_valid_until(expires_at);
                    info!(expires_at, "License renewed");
                } else {
                    // Backoff and denial pacing live on the gateway; we
                    // just try again next cycle.
                    warn!(detail = %resp.detail, "Renewal declined");
                }
            }
            Err(e) => {
                warn!(error = %e, "Renewal call failed");
            }
        }
    }

    /// Deliver one session report, retrying until the gateway acknowledges
    /// it or shutdown interrupts.
    async fn deliver_report(&self, report: SessionReport, shutdown: &mut watch::Receiver<bool>) {
        let proto = report.to_proto(&self.config.device_uuid);
        loop {
            let attempt = async {
                let mut client = self
                    .client()
                    .await
                    .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
                client.report_update_result(proto.clone()).await
            }
            .await;

            match attempt {
                Ok(_) => {
                    info!(version = %report.version, outcome = ?report.outcome, "Report delivered");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Report delivery failed, retrying");
                }
            }

            tokio::select! {
                () = sleep(self.config.retry_delay) => {}
                _ = shutdown.changed() => {
                    warn!(version = %report.version, "Shutdown before report delivery");
                    return;
                }
            }
        }
    }
}

/// Whether the license is close enough to expiry to renew now.
fn renewal_due(expires_at: i64, now: i64, lead: Duration) -> bool {
    let lead = i64::try_from(lead.as_secs()).unwrap_or(i64::MAX);
    expires_at - now <= lead
}

#[cfg(test)]
mod tests {
    use super::renewal_due;
    use std::time::Duration;

    #[test]
    fn renewal_due_only_inside_the_lead_window() {
        let lead = Duration::from_secs(600);
        assert!(!renewal_due(10_000, 9_000, lead));
        assert!(renewal_due(9_500, 9_000, lead));
        // Already expired still counts as due.
        assert!(renewal_due(8_000, 9_000, lead));
    }
}
