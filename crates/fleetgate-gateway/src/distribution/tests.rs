//! Distribution coordinator tests against a counting mock pusher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use semver::Version;

use fleetgate_core::config::RegistryConfig;
use fleetgate_crypto::{PackageVerifier, SigningKeyPair};

use crate::registry::{DeviceRegistry, LicenseAuthority, LocalLicenseAuthority};
use crate::storage::{DeviceRecord, GatewayDatabase};

use super::{
    CommandSpec, DeliveryOutcome, PackageSpec, PackagePusher, PushAck, PushError, RetryPolicy,
    UpdateCoordinator,
};

/// Per-device scripted behavior for the mock pusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Accept,
    Busy,
    Unreachable,
    Reject,
}

#[derive(Default)]
struct MockPusher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    push_counts: Mutex<HashMap<String, usize>>,
}

impl MockPusher {
    fn set(&self, uuid: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(uuid.to_string(), behavior);
    }

    fn pushes_to(&self, uuid: &str) -> usize {
        self.push_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(uuid)
            .copied()
            .unwrap_or(0)
    }

    fn respond(&self, uuid: &str) -> Result<PushAck, PushError> {
        *self
            .push_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(uuid.to_string())
            .or_insert(0) += 1;

        let behavior = self
            .behaviors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(uuid)
            .copied()
            .unwrap_or(Behavior::Accept);

        match behavior {
            Behavior::Accept => Ok(PushAck::Accepted),
            Behavior::Busy => Ok(PushAck::Busy),
            Behavior::Unreachable => Err(PushError::Unreachable("connection refused".into())),
            Behavior::Reject => Ok(PushAck::Rejected("policy".into())),
        }
    }
}

#[tonic::async_trait]
impl PackagePusher for MockPusher {
    async fn push_package(
        &self,
        device: &DeviceRecord,
        _package: &PackageSpec,
        _force: bool,
    ) -> Result<PushAck, PushError> {
        self.respond(&device.uuid)
    }

    async fn push_command(
        &self,
        device: &DeviceRecord,
        _command: &CommandSpec,
    ) -> Result<PushAck, PushError> {
        self.respond(&device.uuid)
    }
}

struct Fixture {
    coordinator: UpdateCoordinator,
    pusher: Arc<MockPusher>,
    db: GatewayDatabase,
    signer: SigningKeyPair,
    registry: Arc<DeviceRegistry>,
}

async fn fixture() -> Fixture {
    let db = GatewayDatabase::open_in_memory().await.unwrap();
    let authority = Arc::new(LocalLicenseAuthority::new(3600));
    let registry = Arc::new(DeviceRegistry::new(
        db.clone(),
        authority as Arc<dyn LicenseAuthority>,
        RegistryConfig::default(),
    ));
    let pusher = Arc::new(MockPusher::default());
    let signer = SigningKeyPair::generate();
    let verifier = PackageVerifier::from_public_bytes(&signer.public_bytes()).unwrap();
    let coordinator = UpdateCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&pusher) as Arc<dyn PackagePusher>,
        verifier,
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
        },
    );
    Fixture {
        coordinator,
        pusher,
        db,
        signer,
        registry,
    }
}

impl Fixture {
    async fn register(&self, uuid: &str) {
        self.registry
            .request_registration(uuid, &format!("10.0.0.{uuid}:50061"), uuid)
            .await
            .unwrap();
    }

    fn package(&self, version: &str) -> PackageSpec {
        let content = format!("package-{version}").into_bytes();
        let signature = self.signer.sign(&content);
        PackageSpec {
            package_id: format!("pkg-{version}"),
            version: Version::parse(version).unwrap(),
            filename: format!("app-{version}.bin"),
            content,
            signature,
        }
    }
}

#[tokio::test]
async fn bad_signature_rejects_whole_round_without_pushes() {
    let f = fixture().await;
    f.register("d1").await;

    let mut package = f.package("1.0.0");
    package.signature[0] ^= 0xFF;

    let report = f
        .coordinator
        .distribute(&package, &["d1".to_string()], false)
        .await;

    assert!(matches!(
        report.outcome_for("d1"),
        Some(DeliveryOutcome::Rejected(_))
    ));
    assert_eq!(f.pusher.pushes_to("d1"), 0);
}

#[tokio::test]
async fn unreachable_device_fails_without_blocking_others() {
    let f = fixture().await;
    for uuid in ["d1", "d2", "d3"] {
        f.register(uuid).await;
    }
    f.pusher.set("d2", Behavior::Unreachable);

    let targets: Vec<String> = ["d1", "d2", "d3"].iter().map(ToString::to_string).collect();
    let report = f.coordinator.distribute(&f.package("2.0.0"), &targets, false).await;

    assert_eq!(report.outcome_for("d1"), Some(&DeliveryOutcome::Delivered));
    assert!(matches!(
        report.outcome_for("d2"),
        Some(DeliveryOutcome::Failed(_))
    ));
    assert_eq!(report.outcome_for("d3"), Some(&DeliveryOutcome::Delivered));

    // d2 exhausted its retry budget; d1/d3 needed one attempt each.
    assert_eq!(f.pusher.pushes_to("d2"), 3);
    assert_eq!(f.pusher.pushes_to("d1"), 1);
    assert_eq!(f.pusher.pushes_to("d3"), 1);
}

#[tokio::test]
async fn redelivery_of_installed_version_is_a_no_op_success() {
    let f = fixture().await;
    f.register("d1").await;
    f.db.set_installed_version("d1", "2.0.0").await.unwrap();

    let report = f
        .coordinator
        .distribute(&f.package("2.0.0"), &["d1".to_string()], false)
        .await;

    assert_eq!(report.outcome_for("d1"), Some(&DeliveryOutcome::Delivered));
    assert_eq!(f.pusher.pushes_to("d1"), 0);
}

#[tokio::test]
async fn stale_version_skipped_unless_forced() {
    let f = fixture().await;
    f.register("d1").await;
    f.db.set_installed_version("d1", "2.0.0").await.unwrap();

    let report = f
        .coordinator
        .distribute(&f.package("1.5.0"), &["d1".to_string()], false)
        .await;
    assert!(matches!(
        report.outcome_for("d1"),
        Some(DeliveryOutcome::Rejected(_))
    ));
    assert_eq!(f.pusher.pushes_to("d1"), 0);

    // Forced downgrade (rollback path) does push.
    let report = f
        .coordinator
        .distribute(&f.package("1.5.0"), &["d1".to_string()], true)
        .await;
    assert_eq!(report.outcome_for("d1"), Some(&DeliveryOutcome::Delivered));
    assert_eq!(f.pusher.pushes_to("d1"), 1);
}

#[tokio::test]
async fn ineligible_device_never_receives_a_push() {
    let f = fixture().await;
    // Known but only pending: never licensed.
    f.registry.upsert_checkin("d1", "addr", None).await.unwrap();

    let report = f
        .coordinator
        .distribute(&f.package("1.0.0"), &["d1".to_string()], false)
        .await;

    assert!(matches!(
        report.outcome_for("d1"),
        Some(DeliveryOutcome::Rejected(_))
    ));
    assert_eq!(f.pusher.pushes_to("d1"), 0);
}

#[tokio::test]
async fn device_rejection_is_terminal_without_retries() {
    let f = fixture().await;
    f.register("d1").await;
    f.pusher.set("d1", Behavior::Reject);

    let report = f
        .coordinator
        .distribute(&f.package("1.0.0"), &["d1".to_string()], false)
        .await;

    assert!(matches!(
        report.outcome_for("d1"),
        Some(DeliveryOutcome::Rejected(_))
    ));
    assert_eq!(f.pusher.pushes_to("d1"), 1);
}

#[tokio::test]
async fn busy_device_is_retried_then_failed() {
    let f = fixture().await;
    f.register("d1").await;
    f.pusher.set("d1", Behavior::Busy);

    let report = f
        .coordinator
        .distribute(&f.package("1.0.0"), &["d1".to_string()], false)
        .await;

    assert!(matches!(
        report.outcome_for("d1"),
        Some(DeliveryOutcome::Failed(_))
    ));
    assert_eq!(f.pusher.pushes_to("d1"), 3);
}

#[tokio::test]
async fn command_distribution_respects_eligibility() {
    let f = fixture().await;
    f.register("d1").await;
    f.registry.upsert_checkin("d2", "addr", None).await.unwrap();

    let command = CommandSpec {
        command_id: "c1".to_string(),
        command_type: "rollback".to_string(),
        params_json: "{}".to_string(),
    };
    let targets: Vec<String> = ["d1", "d2"].iter().map(ToString::to_string).collect();
    let outcomes = f.coordinator.distribute_command(&command, &targets).await;

    let get = |uuid: &str| {
        outcomes
            .iter()
            .find(|(u, _)| u == uuid)
            .map(|(_, o)| o.clone())
            .unwrap()
    };
    assert_eq!(get("d1"), DeliveryOutcome::Delivered);
    assert!(matches!(get("d2"), DeliveryOutcome::Rejected(_)));
    assert_eq!(f.pusher.pushes_to("d2"), 0);
}
