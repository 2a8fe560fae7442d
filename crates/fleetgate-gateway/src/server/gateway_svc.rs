//! `GatewayService` gRPC implementation.
//!
//! Agents on the local device network call this to register, renew their
//! license, check in, and report update session outcomes. Denials are
//! normal responses with `accepted = false`; only infrastructure faults
//! become gRPC status errors.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use fleetgate_proto::v1::gateway_service_server::GatewayService;
use fleetgate_proto::v1::{
    AlertEvent, CheckInRequest, CheckInResponse, RegisterRequest, RegisterResponse,
    RenewLicenseRequest, RenewLicenseResponse, ReportAck, UpdateOutcome, UpdateResultReport,
};

use crate::control::GatewayReport;
use crate::metrics::MetricsCache;
use crate::registry::{DeviceRegistry, LicenseGrant, RegistryError};

pub struct GatewayServiceImpl {
    registry: Arc<DeviceRegistry>,
    metrics: MetricsCache,
    reports: mpsc::Sender<GatewayReport>,
}

impl GatewayServiceImpl {
    pub const fn new(
        registry: Arc<DeviceRegistry>,
        metrics: MetricsCache,
        reports: mpsc::Sender<GatewayReport>,
    ) -> Self {
        Self {
            registry,
            metrics,
            reports,
        }
    }

    fn queue_report(&self, report: GatewayReport) -> Result<(), Status> {
        match self.reports.try_send(report) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Cloud channel backlogged; the agent keeps the report and
                // retries, preserving exactly-once delivery upstream.
                Err(Status::resource_exhausted("report queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // No control channel configured; reports stay local.
                Ok(())
            }
        }
    }
}

fn grant_fields(grant: &LicenseGrant) -> (String, Option<prost_types::Timestamp>) {
    (
        grant.token.clone(),
        Some(prost_types::Timestamp {
            seconds: grant.expires_at,
            nanos: 0,
        }),
    )
}

#[tonic::async_trait]
impl GatewayService for GatewayServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "Register"))]
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();

        match self
            .registry
            .request_registration(&req.device_uuid, &req.address, &req.name)
            .await
        {
            Ok(grant) => {
                let (license_token, license_expires_at) = grant_fields(&grant);
                Ok(Response::new(RegisterResponse {
                    accepted: true,
                    license_token,
                    license_expires_at,
                    detail: String::new(),
                }))
            }
            Err(e @ (RegistryError::RegistrationDenied(_) | RegistryError::AuthorityUnavailable(_))) => {
                Ok(Response::new(RegisterResponse {
                    accepted: false,
                    license_token: String::new(),
                    license_expires_at: None,
                    detail: e.to_string(),
                }))
            }
            Err(e) => Err(Status::internal(format!("Registration failed: {e}"))),
        }
    }

    #[instrument(skip(self, request), fields(rpc = "RenewLicense"))]
    async fn renew_license(
        &self,
        request: Request<RenewLicenseRequest>,
    ) -> Result<Response<RenewLicenseResponse>, Status> {
        let req = request.into_inner();

        match self.registry.request_renewal(&req.device_uuid).await {
            Ok(grant) => {
                let (license_token, license_expires_at) = grant_fields(&grant);
                Ok(Response::new(RenewLicenseResponse {
                    accepted: true,
                    license_token,
                    license_expires_at,
                    detail: String::new(),
                }))
            }
            Err(
                e @ (RegistryError::RenewalBackoff { .. }
                | RegistryError::RenewalDenied(_)
                | RegistryError::AuthorityUnavailable(_)),
            ) => Ok(Response::new(RenewLicenseResponse {
                accepted: false,
                license_token: String::new(),
                license_expires_at: None,
                detail: e.to_string(),
            })),
            Err(e) => Err(Status::internal(format!("Renewal failed: {e}"))),
        }
    }

    #[instrument(skip(self, request), fields(rpc = "CheckIn"))]
    async fn check_in(
        &self,
        request: Request<CheckInRequest>,
    ) -> Result<Response<CheckInResponse>, Status> {
        let req = request.into_inner();

        let installed = if req.installed_version.is_empty() {
            None
        } else {
            Some(req.installed_version.as_str())
        };
        self.registry
            .upsert_checkin(&req.device_uuid, &req.address, installed)
            .await
            .map_err(|e| Status::internal(format!("Check-in failed: {e}")))?;

        if !req.metrics.is_empty() {
            self.metrics.record(&req.device_uuid, req.metrics);
        }

        Ok(Response::new(CheckInResponse { acknowledged: true }))
    }

    #[instrument(skip(self, request), fields(rpc = "ReportUpdateResult"))]
    async fn report_update_result(
        &self,
        request: Request<UpdateResultReport>,
    ) -> Result<Response<ReportAck>, Status> {
        let report = request.into_inner();
        let outcome = UpdateOutcome::try_from(report.outcome)
            .map_err(|_| Status::invalid_argument("Unknown update outcome"))?;

        info!(
            device = %report.device_uuid,
            version = %report.version,
            outcome = ?outcome,
            "Update result reported"
        );

        // Keep the registry's installed-version view in sync with terminal
        // outcomes before the report travels upstream.
        let installed = match outcome {
            UpdateOutcome::Confirmed => Some(report.version.clone()),
            UpdateOutcome::RolledBack if !report.rolled_back_to.is_empty() => {
                Some(report.rolled_back_to.clone())
            }
            _ => None,
        };
        if let Some(version) = installed {
            self.registry
                .record_installed_version(&report.device_uuid, &version)
                .await
                .map_err(|e| Status::internal(format!("Version update failed: {e}")))?;
        }

        if outcome == UpdateOutcome::RollbackFailed {
            warn!(device = %report.device_uuid, "Rollback failed, device needs intervention");
            self.queue_report(GatewayReport::Alert(AlertEvent {
                timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
                level: "ERROR".to_string(),
                message: format!(
                    "Rollback failed on device {} after update to {}",
                    report.device_uuid, report.version
                ),
                exception: report.detail.clone(),
                source: "fleetgate-gateway".to_string(),
            }))?;
        }

        self.queue_report(GatewayReport::UpdateOutcome(report))?;

        Ok(Response::new(ReportAck { acknowledged: true }))
    }
}
