//! Database queries for the FleetGate gateway.

use fleetgate_core::db::unix_timestamp;

use super::db::{DatabaseError, GatewayDatabase};
use super::models::{DeviceRecord, RegistrationStatus};

impl GatewayDatabase {
    /// Insert a new `pending` device or update address/last-seen of an
    /// existing one. Last-write-wins on conflicting concurrent check-ins.
    pub async fn upsert_device(
        &self,
        uuid: &str,
        address: &str,
        name: &str,
    ) -> Result<DeviceRecord, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (uuid, address, name, last_seen, created_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET address = excluded.address, last_seen = excluded.last_seen",
        )
        .bind(uuid)
        .bind(address)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(uuid).await
    }

    /// Get a device by UUID.
    pub async fn get_device(&self, uuid: &str) -> Result<DeviceRecord, DatabaseError> {
        sqlx::query_as::<_, DeviceRecord>("SELECT * FROM devices WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {uuid}")))
    }

    /// List all known devices.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, DatabaseError> {
        let devices =
            sqlx::query_as::<_, DeviceRecord>("SELECT * FROM devices ORDER BY created_at")
                .fetch_all(self.pool())
                .await?;
        Ok(devices)
    }

    /// Record a check-in: refresh address, last-seen, and the installed
    /// version the device reports.
    pub async fn touch_device(
        &self,
        uuid: &str,
        address: &str,
        installed_version: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let result = if let Some(version) = installed_version {
            sqlx::query(
                "UPDATE devices SET address = ?, last_seen = ?, installed_version = ? WHERE uuid = ?",
            )
            .bind(address)
            .bind(now)
            .bind(version)
            .bind(uuid)
            .execute(self.pool())
            .await?
        } else {
            sqlx::query("UPDATE devices SET address = ?, last_seen = ? WHERE uuid = ?")
                .bind(address)
                .bind(now)
                .bind(uuid)
                .execute(self.pool())
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {uuid}")));
        }
        Ok(())
    }

    /// Replace a device's license and mark it `registered`.
    pub async fn update_license(
        &self,
        uuid: &str,
        token: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE devices SET license_token = ?, license_expires_at = ?, status = 'registered' WHERE uuid = ?",
        )
        .bind(token)
        .bind(expires_at)
        .bind(uuid)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {uuid}")));
        }
        Ok(())
    }

    /// Update a device's registration status.
    pub async fn set_status(
        &self,
        uuid: &str,
        status: RegistrationStatus,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE devices SET status = ? WHERE uuid = ?")
            .bind(status.as_str())
            .bind(uuid)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {uuid}")));
        }
        Ok(())
    }

    /// Push the earliest-next-renewal-attempt timestamp forward.
    pub async fn set_next_renewal_attempt(
        &self,
        uuid: &str,
        at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE devices SET next_renewal_attempt = ? WHERE uuid = ?")
            .bind(at)
            .bind(uuid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record the version a device reports as installed.
    pub async fn set_installed_version(
        &self,
        uuid: &str,
        version: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE devices SET installed_version = ? WHERE uuid = ?")
            .bind(version)
            .bind(uuid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Administrative removal of a device.
    pub async fn remove_device(&self, uuid: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM devices WHERE uuid = ?")
            .bind(uuid)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
