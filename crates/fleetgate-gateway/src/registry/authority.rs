//! License authority seam.
//!
//! The registry never mints licenses itself; it asks a [`LicenseAuthority`]
//! for a decision. The default implementation issues local tokens with a
//! configured TTL so the fleet keeps working without cloud connectivity;
//! cloud-pushed license decisions are applied through the registry directly.

use fleetgate_core::db::unix_timestamp;
use uuid::Uuid;

/// A granted license: token plus expiration (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseGrant {
    pub token: String,
    pub expires_at: i64,
}

/// Outcome of a registration or renewal request.
#[derive(Debug, Clone)]
pub enum AuthorityDecision {
    Approved(LicenseGrant),
    Denied(String),
}

/// Errors from the authority itself (its upstream being down is not a
/// denial; the caller applies backoff either way).
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("License authority unavailable: {0}")]
    Unavailable(String),
}

/// Decides registration and renewal requests for devices.
#[tonic::async_trait]
pub trait LicenseAuthority: Send + Sync {
    async fn decide_registration(
        &self,
        device_uuid: &str,
    ) -> Result<AuthorityDecision, AuthorityError>;

    async fn decide_renewal(&self, device_uuid: &str)
    -> Result<AuthorityDecision, AuthorityError>;
}

/// Local authority that approves every request with a fresh token.
#[derive(Debug, Clone)]
pub struct LocalLicenseAuthority {
    ttl_secs: u64,
}

impl LocalLicenseAuthority {
    pub const fn new(ttl_secs: u64) -> Self {
        Self { ttl_secs }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn grant(&self) -> LicenseGrant {
        LicenseGrant {
            token: Uuid::new_v4().to_string(),
            expires_at: unix_timestamp() + self.ttl_secs as i64,
        }
    }
}

#[tonic::async_trait]
impl LicenseAuthority for LocalLicenseAuthority {
    async fn decide_registration(
        &self,
        _device_uuid: &str,
    ) -> Result<AuthorityDecision, AuthorityError> {
        Ok(AuthorityDecision::Approved(self.grant()))
    }

    async fn decide_renewal(
        &self,
        _device_uuid: &str,
    ) -> Result<AuthorityDecision, AuthorityError> {
        Ok(AuthorityDecision::Approved(self.grant()))
    }
}
