//! Package installation seam.
//!
//! The executor drives installation through the [`Installer`] trait so
//! the state machine can be exercised against scripted mocks. The
//! production implementation shells out to the configured install
//! command with a hard timeout.

use std::path::Path;
use std::time::Duration;

use semver::Version;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Installer could not start: {0}")]
    Spawn(String),

    #[error("Installer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Installer timed out after {0:?}")]
    Timeout(Duration),
}

#[tonic::async_trait]
pub trait Installer: Send + Sync {
    /// Install the package at `package_path` as `version`.
    async fn install(&self, version: &Version, package_path: &Path) -> Result<(), InstallError>;
}

/// Runs the configured install command with the package path appended as
/// the final argument.
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandInstaller {
    /// `command` is the program followed by its fixed arguments; must be
    /// non-empty (enforced by config validation).
    pub fn new(command: &[String], timeout: Duration) -> Self {
        let (program, args) = command
            .split_first()
            .map_or((String::new(), Vec::new()), |(p, rest)| {
                (p.clone(), rest.to_vec())
            });
        Self {
            program,
            args,
            timeout,
        }
    }
}

#[tonic::async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, version: &Version, package_path: &Path) -> Result<(), InstallError> {
        info!(version = %version, path = %package_path.display(), "Running installer");

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(package_path)
            .env("FLEETGATE_VERSION", version.to_string())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(InstallError::Spawn(e.to_string())),
            Err(_) => {
                warn!(version = %version, timeout = ?self.timeout, "Installer timed out");
                return Err(InstallError::Timeout(self.timeout));
            }
        };

        if output.status.success() {
            info!(version = %version, "Installer finished");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(InstallError::Failed {
                status: output.status.to_string(),
                stderr,
            })
        }
    }
}
