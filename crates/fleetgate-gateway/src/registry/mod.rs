//! Device registry and license state machine.
//!
//! The registry is the only path to process-wide device state: every
//! reader and writer goes through its API, so the `registered` ⇒
//! license-in-the-future invariant holds under concurrent check-ins and
//! sweeps. One instance is created at startup and passed to every
//! component that needs it.

mod authority;
mod locks;
mod sweep;

pub use authority::{
    AuthorityDecision, AuthorityError, LicenseAuthority, LicenseGrant, LocalLicenseAuthority,
};
pub use locks::DeviceLocks;
pub use sweep::spawn_sweep;

use std::sync::Arc;

use tracing::{info, warn};

use fleetgate_core::config::RegistryConfig;
use fleetgate_core::db::{DatabaseError, unix_timestamp};

use crate::storage::{DeviceRecord, GatewayDatabase, RegistrationStatus};

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] DatabaseError),

    /// Renewal attempted before the backoff gate; the authority was not
    /// contacted.
    #[error("Renewal backed off until {until}")]
    RenewalBackoff { until: i64 },

    #[error("Registration denied: {0}")]
    RegistrationDenied(String),

    #[error("Renewal denied: {0}")]
    RenewalDenied(String),

    #[error("License authority unavailable: {0}")]
    AuthorityUnavailable(String),
}

/// Authoritative record of known devices, their licenses, and reachability.
pub struct DeviceRegistry {
    db: GatewayDatabase,
    authority: Arc<dyn LicenseAuthority>,
    locks: DeviceLocks,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(
        db: GatewayDatabase,
        authority: Arc<dyn LicenseAuthority>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            db,
            authority,
            locks: DeviceLocks::new(),
            config,
        }
    }

    /// Record a device check-in: upsert address/last-seen and the reported
    /// installed version. Last-write-wins.
    pub async fn upsert_checkin(
        &self,
        uuid: &str,
        address: &str,
        installed_version: Option<&str>,
    ) -> Result<(), RegistryError> {
        let lock = self.locks.lock_for(uuid);
        let _guard = lock.lock().await;

        match self.db.touch_device(uuid, address, installed_version).await {
            Ok(()) => Ok(()),
            Err(DatabaseError::NotFound(_)) => {
                // First contact from an unknown device: create it as pending.
                self.db.upsert_device(uuid, address, "").await?;
                if let Some(version) = installed_version {
                    self.db.set_installed_version(uuid, version).await?;
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle a registration request. Approval transitions Pending →
    /// Registered with a fresh license.
    pub async fn request_registration(
        &self,
        uuid: &str,
        address: &str,
        name: &str,
    ) -> Result<LicenseGrant, RegistryError> {
        let lock = self.locks.lock_for(uuid);
        let _guard = lock.lock().await;

        self.db.upsert_device(uuid, address, name).await?;

        match self.authority.decide_registration(uuid).await {
            Ok(AuthorityDecision::Approved(grant)) => {
                self.db.update_license(uuid, &grant.token, grant.expires_at).await?;
                info!(device = %uuid, expires_at = grant.expires_at, "Device registered");
                Ok(grant)
            }
            Ok(AuthorityDecision::Denied(reason)) => {
                self.db.set_status(uuid, RegistrationStatus::Rejected).await?;
                warn!(device = %uuid, reason = %reason, "Registration denied");
                Err(RegistryError::RegistrationDenied(reason))
            }
            Err(AuthorityError::Unavailable(e)) => {
                Err(RegistryError::AuthorityUnavailable(e))
            }
        }
    }

    /// Handle a renewal request.
    ///
    /// Fails fast, without any authority round-trip, while the device is
    /// still inside its renewal backoff window. On denial or authority
    /// failure the gate is pushed forward by the configured backoff, and
    /// the device drops to `expired` if its old license has already lapsed.
    pub async fn request_renewal(&self, uuid: &str) -> Result<LicenseGrant, RegistryError> {
        let lock = self.locks.lock_for(uuid);
        let _guard = lock.lock().await;

        self.request_renewal_locked(uuid).await
    }

    async fn request_renewal_locked(&self, uuid: &str) -> Result<LicenseGrant, RegistryError> {
        let device = self.db.get_device(uuid).await?;
        let now = unix_timestamp();

        if now < device.next_renewal_attempt {
            return Err(RegistryError::RenewalBackoff {
                until: device.next_renewal_attempt,
            });
        }

        match self.authority.decide_renewal(uuid).await {
            Ok(AuthorityDecision::Approved(grant)) => {
                self.db.update_license(uuid, &grant.token, grant.expires_at).await?;
                info!(device = %uuid, expires_at = grant.expires_at, "License renewed");
                Ok(grant)
            }
            Ok(AuthorityDecision::Denied(reason)) => {
                self.apply_renewal_backoff(&device, now).await?;
                warn!(device = %uuid, reason = %reason, "Renewal denied");
                Err(RegistryError::RenewalDenied(reason))
            }
            Err(AuthorityError::Unavailable(e)) => {
                self.apply_renewal_backoff(&device, now).await?;
                warn!(device = %uuid, error = %e, "Renewal failed: authority unavailable");
                Err(RegistryError::AuthorityUnavailable(e))
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn apply_renewal_backoff(
        &self,
        device: &DeviceRecord,
        now: i64,
    ) -> Result<(), RegistryError> {
        self.db
            .set_next_renewal_attempt(&device.uuid, now + self.config.renewal_backoff_secs as i64)
            .await?;
        if device.license_expires_at <= now {
            self.db.set_status(&device.uuid, RegistrationStatus::Expired).await?;
        }
        Ok(())
    }

    /// Apply a license decision pushed by the cloud control plane.
    pub async fn apply_license_decision(
        &self,
        uuid: &str,
        approved: bool,
        token: &str,
        expires_at: i64,
    ) -> Result<(), RegistryError> {
        let lock = self.locks.lock_for(uuid);
        let _guard = lock.lock().await;

        if approved {
            self.db.update_license(uuid, token, expires_at).await?;
            info!(device = %uuid, expires_at, "Cloud license decision applied: approved");
        } else {
            self.db.set_status(uuid, RegistrationStatus::Rejected).await?;
            warn!(device = %uuid, "Cloud license decision applied: rejected");
        }
        Ok(())
    }

    /// Filter candidates down to devices that are `registered` with an
    /// unexpired license. Hard gate for the distribution coordinator.
    pub async fn list_eligible_targets(
        &self,
        candidates: &[String],
    ) -> Result<Vec<DeviceRecord>, RegistryError> {
        let now = unix_timestamp();
        let mut eligible = Vec::new();
        for uuid in candidates {
            match self.db.get_device(uuid).await {
                Ok(device) if device.is_eligible(now) => eligible.push(device),
                Ok(_) | Err(DatabaseError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(eligible)
    }

    /// Look up a single device.
    pub async fn get_device(&self, uuid: &str) -> Result<DeviceRecord, RegistryError> {
        Ok(self.db.get_device(uuid).await?)
    }

    /// Snapshot of the whole fleet, for status reporting.
    pub async fn snapshot(&self) -> Result<Vec<DeviceRecord>, RegistryError> {
        Ok(self.db.list_devices().await?)
    }

    /// Record the version a device reports as installed after a session.
    pub async fn record_installed_version(
        &self,
        uuid: &str,
        version: &str,
    ) -> Result<(), RegistryError> {
        let lock = self.locks.lock_for(uuid);
        let _guard = lock.lock().await;
        Ok(self.db.set_installed_version(uuid, version).await?)
    }

    /// Administrative removal.
    pub async fn remove_device(&self, uuid: &str) -> Result<bool, RegistryError> {
        let lock = self.locks.lock_for(uuid);
        let _guard = lock.lock().await;
        Ok(self.db.remove_device(uuid).await?)
    }

    /// One pass of the background sweep: flip lapsed licenses to `expired`
    /// and trigger renewals for devices past their check interval and past
    /// the backoff gate. One device's failure never blocks the rest.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn sweep_once(&self) {
        let devices = match self.db.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Sweep could not list devices");
                return;
            }
        };

        for device in devices {
            let lock = self.locks.lock_for(&device.uuid);
            let _guard = lock.lock().await;

            let now = unix_timestamp();
            let status = device.registration_status();

            if status == RegistrationStatus::Registered && device.license_expires_at <= now {
                if let Err(e) = self.db.set_status(&device.uuid, RegistrationStatus::Expired).await
                {
                    warn!(device = %device.uuid, error = %e, "Sweep could not expire device");
                    continue;
                }
                info!(device = %device.uuid, "License lapsed, device expired");
            }

            let renewal_due = matches!(
                status,
                RegistrationStatus::Registered | RegistrationStatus::Expired
            ) && device.license_expires_at
                <= now + self.config.license_check_interval_secs as i64;

            if renewal_due && now >= device.next_renewal_attempt {
                match self.request_renewal_locked(&device.uuid).await {
                    Ok(_) | Err(RegistryError::RenewalBackoff { .. }) => {}
                    Err(e) => {
                        warn!(device = %device.uuid, error = %e, "Sweep renewal failed");
                    }
                }
            }
        }
    }
}
