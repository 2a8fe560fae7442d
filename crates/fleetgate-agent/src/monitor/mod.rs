//! Post-install log health monitor.
//!
//! Watches the device's own log file during the probation window and
//! short-circuits on the first line containing a configured failure
//! pattern. Only bytes appended after the window starts are considered,
//! so pre-existing log noise never triggers a rollback.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Terminal outcome of one probation watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Window elapsed without a failure signature.
    Clean,
    /// A failure pattern appeared before the deadline.
    Matched { pattern: String, line: String },
    /// Every poll in the window failed to read the log source.
    MonitorFailed(String),
    /// The watch was cancelled before the deadline.
    Cancelled,
}

pub struct LogHealthMonitor {
    log_path: PathBuf,
    patterns: Vec<String>,
    poll_interval: Duration,
}

impl LogHealthMonitor {
    /// Patterns are matched as case-insensitive substrings.
    pub fn new(log_path: &Path, patterns: &[String], poll_interval: Duration) -> Self {
        Self {
            log_path: log_path.to_path_buf(),
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            poll_interval,
        }
    }

    /// Watch the log for the duration of one probation window.
    ///
    /// Polls at a fixed interval until the deadline. A transient read
    /// error counts as "no match this cycle"; a read failure persisting
    /// for the entire window becomes [`WatchOutcome::MonitorFailed`].
    /// Cancellation is observed within one poll interval.
    pub async fn watch(
        &self,
        window: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> WatchOutcome {
        let deadline = Instant::now() + window;
        // Lines written before the window started are out of scope.
        let mut offset = std::fs::metadata(&self.log_path).map_or(0, |m| m.len());

        let mut any_successful_read = false;
        let mut last_error = String::new();

        let mut timer = tokio::time::interval(self.poll_interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                () = sleep_until(deadline) => {
                    // One final poll so a match just before the deadline
                    // still counts.
                    match self.poll(&mut offset) {
                        Ok(Some(matched)) => return matched,
                        Ok(None) => any_successful_read = true,
                        Err(e) => last_error = e.to_string(),
                    }
                    if any_successful_read {
                        info!(path = %self.log_path.display(), "Probation window clean");
                        return WatchOutcome::Clean;
                    }
                    return WatchOutcome::MonitorFailed(last_error);
                }
                _ = timer.tick() => {
                    match self.poll(&mut offset) {
                        Ok(Some(matched)) => return matched,
                        Ok(None) => any_successful_read = true,
                        Err(e) => {
                            warn!(path = %self.log_path.display(), error = %e, "Log poll failed");
                            last_error = e.to_string();
                        }
                    }
                }
                changed = cancel.changed() => {
                    // A dropped sender means the process is going away.
                    if changed.is_err() || *cancel.borrow() {
                        debug!("Probation watch cancelled");
                        return WatchOutcome::Cancelled;
                    }
                }
            }
        }
    }

    /// Read bytes appended since the last poll and scan them for failure
    /// patterns.
    fn poll(&self, offset: &mut u64) -> std::io::Result<Option<WatchOutcome>> {
        let mut file = std::fs::File::open(&self.log_path)?;
        let len = file.metadata()?.len();

        // Truncated or rotated underneath us: start over from the top.
        if len < *offset {
            *offset = 0;
        }
        if len == *offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(*offset))?;
        let mut buf = Vec::with_capacity(usize::try_from(len - *offset).unwrap_or(0));
        file.read_to_end(&mut buf)?;
        *offset = len;

        let text = String::from_utf8_lossy(&buf);
        for line in text.lines() {
            let lowered = line.to_lowercase();
            for pattern in &self.patterns {
                if lowered.contains(pattern) {
                    info!(pattern = %pattern, "Failure signature observed in log");
                    return Ok(Some(WatchOutcome::Matched {
                        pattern: pattern.clone(),
                        line: line.to_string(),
                    }));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests;
