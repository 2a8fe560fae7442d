//! Configuration resolution for FleetGate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (JSON, path supplied by the binary)
//! 3. Environment variables (highest priority)
//!
//! Both binaries call [`Config::validate`] at startup so a missing public
//! key path or an empty failure-pattern list fails fast instead of
//! surfacing mid-rollout.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete FleetGate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub probation: ProbationConfig,
}

/// Registry and licensing configuration (gateway side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval between background sweeps over the device table (seconds).
    pub scan_interval_secs: u64,
    /// How often a registered device's license is re-checked for renewal
    /// (seconds).
    pub license_check_interval_secs: u64,
    /// Lifetime of a freshly issued license (seconds).
    pub license_ttl_secs: u64,
    /// Minimum delay before a denied/failed renewal is re-attempted
    /// (seconds).
    pub renewal_backoff_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            license_check_interval_secs: 3600,
            license_ttl_secs: 24 * 60 * 60,
            renewal_backoff_secs: 15 * 60,
        }
    }
}

/// Update distribution and storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Maximum push attempts per device per distribution round.
    pub max_retries: u32,
    /// Delay between push attempts (seconds).
    pub retry_delay_secs: u64,
    /// Per-push network timeout (seconds).
    pub push_timeout_secs: u64,
    /// Maximum number of package versions retained on a device.
    pub retention_cap: usize,
    /// Path to the trusted Ed25519 public key for package verification.
    pub public_key_path: Option<PathBuf>,
    /// Command (program + arguments) the agent runs to install a package.
    /// The package file path is appended as the final argument.
    #[serde(default)]
    pub install_command: Vec<String>,
    /// Timeout for one installer invocation (seconds).
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

const fn default_install_timeout() -> u64 {
    120
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
            push_timeout_secs: 30,
            retention_cap: 3,
            public_key_path: None,
            install_command: Vec::new(),
            install_timeout_secs: default_install_timeout(),
        }
    }
}

/// Post-install probation configuration (agent side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbationConfig {
    /// Length of the post-install probation window (seconds).
    pub window_secs: u64,
    /// Log poll interval during probation (seconds).
    pub poll_interval_secs: u64,
    /// Case-insensitive substrings whose appearance in post-install logs
    /// triggers rollback.
    pub failure_patterns: Vec<String>,
    /// Log file watched during probation.
    pub log_path: Option<PathBuf>,
}

impl Default for ProbationConfig {
    fn default() -> Self {
        Self {
            window_secs: 5 * 60,
            poll_interval_secs: 30,
            failure_patterns: Vec::new(),
            log_path: None,
        }
    }
}

impl Config {
    /// Check that externally supplied values a running system cannot do
    /// without are actually present.
    pub fn validate(&self) -> Result<()> {
        self.validate_gateway()?;
        self.validate_agent()
    }

    /// Validation for the gateway binary.
    pub fn validate_gateway(&self) -> Result<()> {
        if self.update.public_key_path.is_none() {
            return Err(Error::Config(
                "update.public_key_path is required".to_string(),
            ));
        }
        if self.registry.scan_interval_secs == 0 {
            return Err(Error::Config(
                "registry.scan_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.update.retention_cap == 0 {
            return Err(Error::Config(
                "update.retention_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Validation for the agent binary, which also runs the probation
    /// monitor.
    pub fn validate_agent(&self) -> Result<()> {
        if self.update.public_key_path.is_none() {
            return Err(Error::Config(
                "update.public_key_path is required".to_string(),
            ));
        }
        if self.probation.failure_patterns.is_empty() {
            return Err(Error::Config(
                "probation.failure_patterns must not be empty".to_string(),
            ));
        }
        if self.update.install_command.is_empty() {
            return Err(Error::Config(
                "update.install_command is required".to_string(),
            ));
        }
        if self.probation.poll_interval_secs == 0 {
            return Err(Error::Config(
                "probation.poll_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.update.retention_cap == 0 {
            return Err(Error::Config(
                "update.retention_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from an optional settings file plus env overrides.
pub fn load_config(settings_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = settings_path {
        if path.exists() {
            config = load_config_file(path)?;
        } else {
            return Err(Error::Config(format!(
                "Settings file not found: {}",
                path.display()
            )));
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("FLEETGATE_SCAN_INTERVAL_SECS") {
        if let Ok(n) = val.parse() {
            config.registry.scan_interval_secs = n;
        }
    }
    if let Ok(val) = std::env::var("FLEETGATE_MAX_RETRIES") {
        if let Ok(n) = val.parse() {
            config.update.max_retries = n;
        }
    }
    if let Ok(val) = std::env::var("FLEETGATE_RETENTION_CAP") {
        if let Ok(n) = val.parse() {
            config.update.retention_cap = n;
        }
    }
    if let Ok(val) = std::env::var("FLEETGATE_PUBLIC_KEY_PATH") {
        config.update.public_key_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("FLEETGATE_INSTALL_COMMAND") {
        let parts: Vec<String> = val.split_whitespace().map(String::from).collect();
        if !parts.is_empty() {
            config.update.install_command = parts;
        }
    }
    if let Ok(val) = std::env::var("FLEETGATE_PROBATION_SECS") {
        if let Ok(n) = val.parse() {
            config.probation.window_secs = n;
        }
    }
    if let Ok(val) = std::env::var("FLEETGATE_FAILURE_PATTERNS") {
        let patterns: Vec<String> = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if !patterns.is_empty() {
            config.probation.failure_patterns = patterns;
        }
    }
}
