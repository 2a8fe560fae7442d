//! Device-side update session state machine.
//!
//! `Idle → Verifying → Installing → Probating → {Confirmed | RollingBack} → Idle`,
//! with `Verifying → Rejected → Idle` and `Installing → InstallFailed → Idle`
//! as short-circuit exits. Exactly one session runs at a time; a package
//! arriving while a session is active gets a busy response instead of
//! being queued.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use semver::Version;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use fleetgate_core::db::unix_timestamp;
use fleetgate_crypto::PackageVerifier;
use fleetgate_proto::v1::{UpdateOutcome, UpdateResultReport};

use crate::installer::Installer;
use crate::monitor::{LogHealthMonitor, WatchOutcome};
use crate::store::VersionStore;

/// Current position in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Verifying,
    Installing,
    Probating,
    RollingBack,
}

/// Synchronous answer to an inbound package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    /// Session started; the terminal outcome arrives asynchronously.
    Accepted,
    /// A session is already active.
    Busy,
    /// Policy rejection; the package was discarded, not stored.
    Rejected(String),
}

/// Terminal outcome of an update session, reported upstream exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Confirmed,
    RolledBack { to: Version },
    RollbackFailed,
    InstallFailed,
    MonitorFailed,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub version: Version,
    pub outcome: SessionOutcome,
    pub detail: String,
}

impl SessionReport {
    pub fn to_proto(&self, device_uuid: &str) -> UpdateResultReport {
        let (outcome, rolled_back_to) = match &self.outcome {
            SessionOutcome::Confirmed => (UpdateOutcome::Confirmed, String::new()),
            SessionOutcome::RolledBack { to } => (UpdateOutcome::RolledBack, to.to_string()),
            SessionOutcome::RollbackFailed => (UpdateOutcome::RollbackFailed, String::new()),
            SessionOutcome::InstallFailed => (UpdateOutcome::InstallFailed, String::new()),
            SessionOutcome::MonitorFailed => (UpdateOutcome::MonitorFailed, String::new()),
        };
        UpdateResultReport {
            device_uuid: device_uuid.to_string(),
            version: self.version.to_string(),
            outcome: outcome as i32,
            detail: self.detail.clone(),
            rolled_back_to,
            reported_at: Some(prost_types::Timestamp::from(SystemTime::now())),
        }
    }
}

/// An update package as received from the gateway.
#[derive(Debug, Clone)]
pub struct InboundPackage {
    pub version: Version,
    pub content: Vec<u8>,
    pub signature: Vec<u8>,
}

impl InboundPackage {
    pub fn from_proto(pkg: fleetgate_proto::v1::UpdatePackage) -> Result<Self, semver::Error> {
        Ok(Self {
            version: Version::parse(&pkg.version)?,
            content: pkg.content,
            signature: pkg.signature,
        })
    }
}

pub struct UpdateExecutor {
    store: Arc<VersionStore>,
    verifier: PackageVerifier,
    installer: Arc<dyn Installer>,
    monitor: LogHealthMonitor,
    state: Mutex<SessionState>,
    reports: mpsc::Sender<SessionReport>,
    /// Unix timestamp until which the local license is valid. Updated by
    /// the check-in worker on every grant.
    license_valid_until: AtomicI64,
    probation_window: Duration,
    retention_cap: usize,
    shutdown: watch::Receiver<bool>,
}

impl UpdateExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<VersionStore>,
        verifier: PackageVerifier,
        installer: Arc<dyn Installer>,
        monitor: LogHealthMonitor,
        probation_window: Duration,
        retention_cap: usize,
        reports: mpsc::Sender<SessionReport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            verifier,
            installer,
            monitor,
            state: Mutex::new(SessionState::Idle),
            reports,
            license_valid_until: AtomicI64::new(0),
            probation_window,
            retention_cap,
            shutdown,
        }
    }

    pub fn set_license_valid_until(&self, expires_at: i64) {
        self.license_valid_until.store(expires_at, Ordering::SeqCst);
    }

    pub fn license_valid_until(&self) -> i64 {
        self.license_valid_until.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Offer an inbound package to the executor.
    ///
    /// Verification runs synchronously; an accepted package starts a
    /// detached session whose terminal outcome travels through the
    /// report channel.
    pub fn offer(self: Arc<Self>, package: InboundPackage, force: bool) -> OfferDecision {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Idle {
                return OfferDecision::Busy;
            }
            *state = SessionState::Verifying;
        }

        if let Err(reason) = self.verify(&package, force) {
            warn!(version = %package.version, reason = %reason, "Package rejected");
            self.set_state(SessionState::Idle);
            return OfferDecision::Rejected(reason);
        }

        self.set_state(SessionState::Installing);
        info!(version = %package.version, "Update session started");

        tokio::spawn(async move {
            self.run_session(package).await;
        });

        OfferDecision::Accepted
    }

    fn verify(&self, package: &InboundPackage, force: bool) -> Result<(), String> {
        let now = unix_timestamp();
        if self.license_valid_until.load(Ordering::SeqCst) <= now {
            return Err("license expired".to_string());
        }

        if let Err(e) = self.verifier.verify(&package.content, &package.signature) {
            return Err(format!("signature verification failed: {e}"));
        }

        let installed = self
            .store
            .installed_version()
            .map_err(|e| format!("version store unavailable: {e}"))?;
        if !force {
            if let Some(installed) = installed {
                if package.version <= installed {
                    return Err(format!(
                        "version {} not newer than installed {installed}",
                        package.version
                    ));
                }
            }
        }

        Ok(())
    }

    async fn run_session(self: Arc<Self>, package: InboundPackage) {
        let version = package.version.clone();

        // Installing: persist first so the retained set always contains
        // what we attempted, then invoke the installer.
        let path = match self.store.store(&version, &package.content).await {
            Ok(path) => path,
            Err(e) => {
                self.finish(SessionReport {
                    version,
                    outcome: SessionOutcome::InstallFailed,
                    detail: format!("package copy failed: {e}"),
                })
                .await;
                return;
            }
        };

        // The incoming version is exempt from the prune: on a forced
        // downgrade it can be the oldest retained version.
        if let Err(e) = self.store.prune(self.retention_cap, Some(&version)) {
            warn!(error = %e, "Retention prune failed");
        }

        if let Err(e) = self.installer.install(&version, &path).await {
            self.finish(SessionReport {
                version,
                outcome: SessionOutcome::InstallFailed,
                detail: e.to_string(),
            })
            .await;
            return;
        }

        // Probating: watch our own logs for failure signatures.
        self.set_state(SessionState::Probating);
        info!(version = %version, window = ?self.probation_window, "Probation started");

        match self
            .monitor
            .watch(self.probation_window, self.shutdown.clone())
            .await
        {
            WatchOutcome::Clean => {
                if let Err(e) = self.store.set_installed(&version) {
                    warn!(error = %e, "Could not record installed version");
                }
                self.finish(SessionReport {
                    version,
                    outcome: SessionOutcome::Confirmed,
                    detail: String::new(),
                })
                .await;
            }
            WatchOutcome::Matched { pattern, line } => {
                self.set_state(SessionState::RollingBack);
                let detail = format!("failure signature \"{pattern}\" observed: {line}");
                self.rollback(&version, detail).await;
            }
            WatchOutcome::MonitorFailed(e) => {
                // The new version is running but unobservable; escalate
                // as a monitoring error rather than guessing either way.
                if let Err(err) = self.store.set_installed(&version) {
                    warn!(error = %err, "Could not record installed version");
                }
                self.finish(SessionReport {
                    version,
                    outcome: SessionOutcome::MonitorFailed,
                    detail: format!("log source unreadable for entire window: {e}"),
                })
                .await;
            }
            WatchOutcome::Cancelled => {
                // Process shutdown mid-probation: no terminal outcome.
                info!(version = %version, "Session cancelled during probation");
                self.set_state(SessionState::Idle);
            }
        }
    }

    /// One rollback attempt to the newest retained version strictly older
    /// than `from`. No previous version, or a failed reinstall, is
    /// terminal.
    async fn rollback(&self, from: &Version, detail: String) {
        let previous = match self.store.previous_version(from) {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                self.finish(SessionReport {
                    version: from.clone(),
                    outcome: SessionOutcome::RollbackFailed,
                    detail: format!("{detail}; no previous version retained"),
                })
                .await;
                return;
            }
            Err(e) => {
                self.finish(SessionReport {
                    version: from.clone(),
                    outcome: SessionOutcome::RollbackFailed,
                    detail: format!("{detail}; version store unavailable: {e}"),
                })
                .await;
                return;
            }
        };

        let path = self.store.package_path(&previous);
        match self.installer.install(&previous, &path).await {
            Ok(()) => {
                if let Err(e) = self.store.set_installed(&previous) {
                    warn!(error = %e, "Could not record rolled-back version");
                }
                info!(from = %from, to = %previous, "Rollback complete");
                self.finish(SessionReport {
                    version: from.clone(),
                    outcome: SessionOutcome::RolledBack { to: previous },
                    detail,
                })
                .await;
            }
            Err(e) => {
                self.finish(SessionReport {
                    version: from.clone(),
                    outcome: SessionOutcome::RollbackFailed,
                    detail: format!("{detail}; reinstall of {previous} failed: {e}"),
                })
                .await;
            }
        }
    }

    /// Command-driven rollback outside an update session.
    pub async fn manual_rollback(&self) -> Result<(), String> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Idle {
                return Err("device busy".to_string());
            }
            *state = SessionState::RollingBack;
        }

        let current = match self.store.installed_version() {
            Ok(Some(current)) => current,
            Ok(None) => {
                self.set_state(SessionState::Idle);
                return Err("no installed version recorded".to_string());
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                return Err(format!("version store unavailable: {e}"));
            }
        };

        self.rollback(&current, "operator-requested rollback".to_string())
            .await;
        Ok(())
    }

    async fn finish(&self, report: SessionReport) {
        self.set_state(SessionState::Idle);
        info!(
            version = %report.version,
            outcome = ?report.outcome,
            "Update session finished"
        );
        if self.reports.send(report).await.is_err() {
            warn!("Report channel closed, session outcome dropped");
        }
    }
}
