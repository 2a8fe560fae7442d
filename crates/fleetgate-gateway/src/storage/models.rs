//! Data models for gateway storage.

use serde::{Deserialize, Serialize};

/// Registration/licensing state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Pending,
    Registered,
    Rejected,
    Expired,
}

impl RegistrationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Registered => "registered",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Parse the stored string form. Unknown strings map to `Pending` so a
    /// downgraded schema never grants eligibility by accident.
    pub fn parse(s: &str) -> Self {
        match s {
            "registered" => Self::Registered,
            "rejected" => Self::Rejected,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

/// One row of the `devices` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRecord {
    pub uuid: String,
    pub address: String,
    pub name: String,
    pub license_token: Option<String>,
    pub license_expires_at: i64,
    pub last_seen: i64,
    pub status: String,
    pub next_renewal_attempt: i64,
    pub installed_version: Option<String>,
    pub created_at: i64,
}

impl DeviceRecord {
    pub fn registration_status(&self) -> RegistrationStatus {
        RegistrationStatus::parse(&self.status)
    }

    /// Whether this device may receive update pushes right now.
    pub fn is_eligible(&self, now: i64) -> bool {
        self.registration_status() == RegistrationStatus::Registered
            && self.license_token.is_some()
            && self.license_expires_at > now
    }
}
