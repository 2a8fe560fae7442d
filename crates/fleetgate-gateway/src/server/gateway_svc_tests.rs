//! Tests for the device-facing gateway service.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::Request;

use fleetgate_core::config::RegistryConfig;
use fleetgate_core::db::unix_timestamp;
use fleetgate_proto::v1::gateway_service_server::GatewayService;
use fleetgate_proto::v1::{
    CheckInRequest, RegisterRequest, RenewLicenseRequest, UpdateOutcome, UpdateResultReport,
};

use crate::control::GatewayReport;
use crate::metrics::MetricsCache;
use crate::registry::{DeviceRegistry, LicenseAuthority, LocalLicenseAuthority};
use crate::storage::{GatewayDatabase, RegistrationStatus};

use super::GatewayServiceImpl;

struct Fixture {
    svc: GatewayServiceImpl,
    registry: Arc<DeviceRegistry>,
    metrics: MetricsCache,
    reports_rx: mpsc::Receiver<GatewayReport>,
}

async fn fixture() -> Fixture {
    let db = GatewayDatabase::open_in_memory().await.unwrap();
    let authority = Arc::new(LocalLicenseAuthority::new(3600));
    let registry = Arc::new(DeviceRegistry::new(
        db,
        authority as Arc<dyn LicenseAuthority>,
        RegistryConfig::default(),
    ));
    let metrics = MetricsCache::new();
    let (reports_tx, reports_rx) = mpsc::channel(16);
    let svc = GatewayServiceImpl::new(Arc::clone(&registry), metrics.clone(), reports_tx);
    Fixture {
        svc,
        registry,
        metrics,
        reports_rx,
    }
}

#[tokio::test]
async fn register_grants_license() {
    let f = fixture().await;

    let resp = f
        .svc
        .register(Request::new(RegisterRequest {
            device_uuid: "d1".to_string(),
            address: "10.0.0.5:50061".to_string(),
            name: "pump-7".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(resp.accepted);
    assert!(!resp.license_token.is_empty());
    assert!(resp.license_expires_at.unwrap().seconds > unix_timestamp());
}

#[tokio::test]
async fn renewal_inside_backoff_is_a_soft_denial() {
    let f = fixture().await;
    f.registry.request_registration("d1", "addr", "n").await.unwrap();

    // Force the backoff gate into the future, then renew.
    f.registry
        .request_renewal("d1")
        .await
        .ok();
    let resp = f
        .svc
        .renew_license(Request::new(RenewLicenseRequest {
            device_uuid: "d1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    // Either the renewal succeeded (no backoff yet) or it was softly
    // denied; never a gRPC error.
    if !resp.accepted {
        assert!(!resp.detail.is_empty());
    }
}

#[tokio::test]
async fn check_in_records_metrics_and_version() {
    let mut f = fixture().await;

    f.svc
        .check_in(Request::new(CheckInRequest {
            device_uuid: "d1".to_string(),
            address: "10.0.0.9:50061".to_string(),
            installed_version: "1.2.0".to_string(),
            metrics: HashMap::from([("uptime_secs".to_string(), 42.0)]),
        }))
        .await
        .unwrap();

    let device = f.registry.get_device("d1").await.unwrap();
    assert_eq!(device.registration_status(), RegistrationStatus::Pending);
    assert_eq!(device.installed_version.as_deref(), Some("1.2.0"));
    assert_eq!(f.metrics.for_device("d1").get("uptime_secs"), Some(&42.0));
    assert!(f.reports_rx.try_recv().is_err());
}

#[tokio::test]
async fn confirmed_result_updates_version_and_forwards_report() {
    let mut f = fixture().await;
    f.registry.request_registration("d1", "addr", "n").await.unwrap();

    f.svc
        .report_update_result(Request::new(UpdateResultReport {
            device_uuid: "d1".to_string(),
            version: "2.0.0".to_string(),
            outcome: UpdateOutcome::Confirmed as i32,
            detail: String::new(),
            rolled_back_to: String::new(),
            reported_at: None,
        }))
        .await
        .unwrap();

    let device = f.registry.get_device("d1").await.unwrap();
    assert_eq!(device.installed_version.as_deref(), Some("2.0.0"));

    let forwarded = f.reports_rx.try_recv().unwrap();
    assert!(matches!(forwarded, GatewayReport::UpdateOutcome(r) if r.version == "2.0.0"));
}

#[tokio::test]
async fn rollback_failure_raises_an_alert_before_the_report() {
    let mut f = fixture().await;
    f.registry.request_registration("d1", "addr", "n").await.unwrap();

    f.svc
        .report_update_result(Request::new(UpdateResultReport {
            device_uuid: "d1".to_string(),
            version: "2.0.0".to_string(),
            outcome: UpdateOutcome::RollbackFailed as i32,
            detail: "reinstall of 1.0.0 failed".to_string(),
            rolled_back_to: String::new(),
            reported_at: None,
        }))
        .await
        .unwrap();

    // Installed version must not move on a failed rollback.
    let device = f.registry.get_device("d1").await.unwrap();
    assert!(device.installed_version.is_none());

    let first = f.reports_rx.try_recv().unwrap();
    assert!(matches!(first, GatewayReport::Alert(a) if a.level == "ERROR"));
    let second = f.reports_rx.try_recv().unwrap();
    assert!(matches!(
        second,
        GatewayReport::UpdateOutcome(r) if r.outcome == UpdateOutcome::RollbackFailed as i32
    ));
}

#[tokio::test]
async fn rolled_back_result_restores_previous_version() {
    let mut f = fixture().await;
    f.registry.request_registration("d1", "addr", "n").await.unwrap();
    f.registry.record_installed_version("d1", "2.0.0").await.unwrap();

    f.svc
        .report_update_result(Request::new(UpdateResultReport {
            device_uuid: "d1".to_string(),
            version: "2.1.0".to_string(),
            outcome: UpdateOutcome::RolledBack as i32,
            detail: "probation failure".to_string(),
            rolled_back_to: "2.0.0".to_string(),
            reported_at: None,
        }))
        .await
        .unwrap();

    let device = f.registry.get_device("d1").await.unwrap();
    assert_eq!(device.installed_version.as_deref(), Some("2.0.0"));
    assert!(f.reports_rx.try_recv().is_ok());
}
