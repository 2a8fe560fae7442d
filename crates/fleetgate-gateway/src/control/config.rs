//! Control channel configuration.

use std::time::Duration;

/// Configuration for the gateway's channel to the cloud control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Control plane URL (e.g., "https://control.fleetgate.io:443").
    pub cloud_url: String,

    /// Identifier this gateway announces in its hello frame.
    pub gateway_id: String,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Interval between fleet status frames.
    pub status_interval: Duration,
}

impl ControlConfig {
    pub fn new(cloud_url: String, gateway_id: String) -> Self {
        Self {
            cloud_url,
            gateway_id,
            reconnect: ReconnectPolicy::default(),
            status_interval: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}
