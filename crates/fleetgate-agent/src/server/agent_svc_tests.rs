//! Tests for the gateway-facing agent service.

use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio::sync::{mpsc, watch};
use tonic::Request;

use fleetgate_core::db::unix_timestamp;
use fleetgate_crypto::{PackageVerifier, SigningKeyPair};
use fleetgate_proto::v1::agent_service_server::AgentService;
use fleetgate_proto::v1::{
    Command, PushCommandRequest, PushPackageRequest, PushStatus, UpdatePackage,
};

use crate::installer::{InstallError, Installer};
use crate::monitor::LogHealthMonitor;
use crate::executor::{SessionOutcome, SessionReport, UpdateExecutor};
use crate::store::VersionStore;

use super::AgentServiceImpl;

struct NoopInstaller;

#[tonic::async_trait]
impl Installer for NoopInstaller {
    async fn install(
        &self,
        _version: &Version,
        _package_path: &std::path::Path,
    ) -> Result<(), InstallError> {
        Ok(())
    }
}

struct Fixture {
    svc: AgentServiceImpl,
    signer: SigningKeyPair,
    store: Arc<VersionStore>,
    reports_rx: mpsc::Receiver<SessionReport>,
    _dir: tempfile::TempDir,
    _shutdown_tx: watch::Sender<bool>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(VersionStore::open(&dir.path().join("store")).unwrap());
    let log_path = dir.path().join("device.log");
    std::fs::write(&log_path, "").unwrap();

    let signer = SigningKeyPair::generate();
    let verifier = PackageVerifier::from_public_bytes(&signer.public_bytes()).unwrap();
    let monitor = LogHealthMonitor::new(
        &log_path,
        &["PANIC".to_string()],
        Duration::from_millis(20),
    );

    let (reports_tx, reports_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor = Arc::new(UpdateExecutor::new(
        Arc::clone(&store),
        verifier,
        Arc::new(NoopInstaller),
        monitor,
        Duration::from_millis(100),
        3,
        reports_tx,
        shutdown_rx,
    ));
    executor.set_license_valid_until(unix_timestamp() + 3600);

    Fixture {
        svc: AgentServiceImpl::new(executor),
        signer,
        store,
        reports_rx,
        _dir: dir,
        _shutdown_tx: shutdown_tx,
    }
}

impl Fixture {
    fn package_request(&self, version: &str, force: bool) -> Request<PushPackageRequest> {
        let content = format!("package-{version}").into_bytes();
        let signature = self.signer.sign(&content);
        Request::new(PushPackageRequest {
            package: Some(UpdatePackage {
                package_id: format!("pkg-{version}"),
                version: version.to_string(),
                filename: format!("app-{version}.bin"),
                content,
                signature,
                target_uuids: vec![],
            }),
            force,
        })
    }
}

fn rollback_request(command_id: &str) -> Request<PushCommandRequest> {
    Request::new(PushCommandRequest {
        command: Some(Command {
            command_id: command_id.to_string(),
            command_type: "rollback".to_string(),
            target_uuids: vec![],
            params_json: "{}".to_string(),
        }),
    })
}

#[tokio::test]
async fn valid_package_is_accepted() {
    let mut f = fixture();

    let resp = f
        .svc
        .push_package(f.package_request("1.0.0", false))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(resp.status, PushStatus::Accepted as i32);
    // Session runs to completion in the background.
    let report = tokio::time::timeout(Duration::from_secs(10), f.reports_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, SessionOutcome::Confirmed);
}

#[tokio::test]
async fn tampered_package_is_rejected() {
    let f = fixture();

    let mut request = f.package_request("1.0.0", false).into_inner();
    if let Some(pkg) = request.package.as_mut() {
        pkg.content.push(0xFF);
    }

    let resp = f
        .svc
        .push_package(Request::new(request))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(resp.status, PushStatus::Rejected as i32);
    assert!(resp.detail.contains("signature"));
}

#[tokio::test]
async fn unparseable_version_is_rejected_not_an_error() {
    let f = fixture();

    let mut request = f.package_request("1.0.0", false).into_inner();
    if let Some(pkg) = request.package.as_mut() {
        pkg.version = "not-a-version".to_string();
    }

    let resp = f
        .svc
        .push_package(Request::new(request))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(resp.status, PushStatus::Rejected as i32);
}

#[tokio::test]
async fn rollback_command_is_deduplicated_by_id() {
    let mut f = fixture();
    f.store
        .store(&Version::parse("1.0.0").unwrap(), b"package-1.0.0")
        .await
        .unwrap();
    f.store
        .store(&Version::parse("2.0.0").unwrap(), b"package-2.0.0")
        .await
        .unwrap();
    f.store
        .set_installed(&Version::parse("2.0.0").unwrap())
        .unwrap();

    let resp = f.svc.push_command(rollback_request("c1")).await.unwrap().into_inner();
    assert!(resp.accepted);
    let report = tokio::time::timeout(Duration::from_secs(10), f.reports_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(report.outcome, SessionOutcome::RolledBack { .. }));

    // Same id again: acknowledged, but no second rollback session.
    let resp = f.svc.push_command(rollback_request("c1")).await.unwrap().into_inner();
    assert!(resp.accepted);
    assert_eq!(resp.detail, "duplicate");
    assert!(f.reports_rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_command_type_is_refused() {
    let f = fixture();

    let resp = f
        .svc
        .push_command(Request::new(PushCommandRequest {
            command: Some(Command {
                command_id: "c9".to_string(),
                command_type: "self-destruct".to_string(),
                target_uuids: vec![],
                params_json: "{}".to_string(),
            }),
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(!resp.accepted);
    assert!(resp.detail.contains("unknown command type"));
}

#[tokio::test]
async fn rollback_without_installed_version_is_refused() {
    let f = fixture();

    let resp = f.svc.push_command(rollback_request("c2")).await.unwrap().into_inner();
    assert!(!resp.accepted);
    assert!(resp.detail.contains("no installed version"));
}
