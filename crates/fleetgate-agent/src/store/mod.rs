//! On-device version store.
//!
//! One file per retained package version (`<version>.pkg`) plus an
//! `installed` marker naming the currently installed version. Writes go
//! through a temp file and an atomic rename so a crash mid-copy never
//! leaves a half-written package behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const PACKAGE_EXT: &str = "pkg";
const INSTALLED_MARKER: &str = "installed";

#[derive(Debug, thiserror::Error)]
pub enum VersionStoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Package copy failed after {attempts} attempts: {last_error}")]
    CopyExhausted { attempts: u32, last_error: String },

    #[error("Version {0} not found in store")]
    NotFound(Version),
}

/// Directory-backed catalog of retained package versions.
pub struct VersionStore {
    dir: PathBuf,
    copy_attempts: u32,
    copy_retry_delay: Duration,
}

impl VersionStore {
    pub fn open(dir: &Path) -> Result<Self, VersionStoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            copy_attempts: 3,
            copy_retry_delay: Duration::from_millis(200),
        })
    }

    #[cfg(test)]
    fn with_copy_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.copy_attempts = attempts;
        self.copy_retry_delay = delay;
        self
    }

    pub fn package_path(&self, version: &Version) -> PathBuf {
        self.dir.join(format!("{version}.{PACKAGE_EXT}"))
    }

    /// Persist package content into the retained set.
    ///
    /// Copies with a bounded number of retries and a fixed delay before
    /// surfacing a hard failure.
    pub async fn store(
        &self,
        version: &Version,
        content: &[u8],
    ) -> Result<PathBuf, VersionStoreError> {
        let final_path = self.package_path(version);
        let tmp_path = self.dir.join(format!(".{version}.{PACKAGE_EXT}.tmp"));

        let mut last_error = String::new();
        for attempt in 0..self.copy_attempts.max(1) {
            match write_and_rename(&tmp_path, &final_path, content) {
                Ok(()) => {
                    debug!(version = %version, path = %final_path.display(), "Package stored");
                    return Ok(final_path);
                }
                Err(e) => {
                    warn!(version = %version, attempt = attempt + 1, error = %e, "Package copy failed");
                    last_error = e.to_string();
                }
            }
            if attempt + 1 < self.copy_attempts.max(1) {
                sleep(self.copy_retry_delay).await;
            }
        }

        std::fs::remove_file(&tmp_path).ok();
        Err(VersionStoreError::CopyExhausted {
            attempts: self.copy_attempts.max(1),
            last_error,
        })
    }

    /// All retained versions, newest first.
    pub fn list(&self) -> Result<Vec<Version>, VersionStoreError> {
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PACKAGE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(version) = Version::parse(stem) {
                    versions.push(version);
                }
            }
        }
        versions.sort_by(|a, b| b.cmp(a));
        Ok(versions)
    }

    /// Delete the oldest-by-version packages beyond the cap. Returns the
    /// removed versions.
    ///
    /// `keep` survives the prune even when it sorts below the cap, so a
    /// forced downgrade can retain the package it is about to install.
    pub fn prune(
        &self,
        max_retained: usize,
        keep: Option<&Version>,
    ) -> Result<Vec<Version>, VersionStoreError> {
        let versions = self.list()?;
        let mut removed = Vec::new();
        for version in versions.into_iter().skip(max_retained.max(1)) {
            if Some(&version) == keep {
                continue;
            }
            std::fs::remove_file(self.package_path(&version))?;
            info!(version = %version, "Pruned package beyond retention cap");
            removed.push(version);
        }
        Ok(removed)
    }

    /// Newest retained version strictly older than `current`.
    pub fn previous_version(
        &self,
        current: &Version,
    ) -> Result<Option<Version>, VersionStoreError> {
        Ok(self.list()?.into_iter().find(|v| v < current))
    }

    /// Content of a retained package.
    pub fn read(&self, version: &Version) -> Result<Vec<u8>, VersionStoreError> {
        let path = self.package_path(version);
        if !path.exists() {
            return Err(VersionStoreError::NotFound(version.clone()));
        }
        Ok(std::fs::read(path)?)
    }

    /// Version currently recorded as installed, if any.
    pub fn installed_version(&self) -> Result<Option<Version>, VersionStoreError> {
        let path = self.dir.join(INSTALLED_MARKER);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Version::parse(content.trim()).ok())
    }

    /// Record a version as the installed one.
    pub fn set_installed(&self, version: &Version) -> Result<(), VersionStoreError> {
        let tmp_path = self.dir.join(format!(".{INSTALLED_MARKER}.tmp"));
        let final_path = self.dir.join(INSTALLED_MARKER);
        write_and_rename(&tmp_path, &final_path, version.to_string().as_bytes())?;
        Ok(())
    }
}

fn write_and_rename(tmp: &Path, dest: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(tmp, content)?;
    std::fs::rename(tmp, dest)
}
