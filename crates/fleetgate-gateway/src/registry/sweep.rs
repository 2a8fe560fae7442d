//! Background sweep task over the device table.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::DeviceRegistry;

/// Spawn the periodic registry sweep.
///
/// Runs [`DeviceRegistry::sweep_once`] on a fixed interval until the
/// shutdown signal fires.
pub fn spawn_sweep(
    registry: Arc<DeviceRegistry>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    registry.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Registry sweep shutting down");
                    return;
                }
            }
        }
    })
}
