//! FleetGate Gateway
//!
//! Device registry, license enforcement, and update distribution for a
//! fleet of field devices, with an optional persistent channel to the
//! cloud control plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};

use fleetgate_core::config::load_config;
use fleetgate_core::tracing_init::init_tracing;
use fleetgate_crypto::PackageVerifier;
use fleetgate_proto::v1::gateway_service_server::GatewayServiceServer;

use fleetgate_gateway::control::{ControlChannelWorker, ControlConfig, GatewayReport};
use fleetgate_gateway::distribution::{GrpcPackagePusher, RetryPolicy, UpdateCoordinator};
use fleetgate_gateway::metrics::MetricsCache;
use fleetgate_gateway::registry::{
    DeviceRegistry, LicenseAuthority, LocalLicenseAuthority, spawn_sweep,
};
use fleetgate_gateway::server::GatewayServiceImpl;
use fleetgate_gateway::storage::GatewayDatabase;

#[derive(Parser, Debug)]
#[command(name = "fleetgate-gateway")]
#[command(
    version,
    about = "FleetGate gateway - device registry, licensing, and update distribution"
)]
struct Args {
    /// Address to listen on for device connections.
    #[arg(long, default_value = "0.0.0.0:50060")]
    addr: SocketAddr,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Path to JSON settings file.
    #[arg(long, env = "FLEETGATE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Path to the trusted update-signing public key.
    #[arg(long, env = "FLEETGATE_PUBLIC_KEY_PATH")]
    public_key: Option<PathBuf>,

    /// Cloud control plane URL. When unset, the gateway runs standalone
    /// and licensing decisions are made locally.
    #[arg(long, env = "FLEETGATE_CLOUD_URL")]
    cloud_url: Option<String>,

    /// Identifier announced to the control plane.
    #[arg(long, env = "FLEETGATE_GATEWAY_ID")]
    gateway_id: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing("fleetgate_gateway=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting fleetgate-gateway"
    );

    let mut config = load_config(args.settings.as_deref())?;
    if let Some(path) = &args.public_key {
        config.update.public_key_path = Some(path.clone());
    }
    config.validate_gateway()?;

    let db = match &args.db_path {
        Some(path) => {
            info!(path = %path.display(), "Opening gateway database");
            GatewayDatabase::open(path).await?
        }
        None => {
            let default_path = default_db_path()?;
            info!(path = %default_path.display(), "Opening gateway database (default path)");
            GatewayDatabase::open(&default_path).await?
        }
    };

    let public_key_path = config
        .update
        .public_key_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("update.public_key_path is required"))?;
    let verifier = PackageVerifier::load_from_file(&public_key_path)?;
    info!(fingerprint = %verifier.fingerprint(), "Loaded update-signing public key");

    let authority = Arc::new(LocalLicenseAuthority::new(config.registry.license_ttl_secs));
    let registry = Arc::new(DeviceRegistry::new(
        db,
        authority as Arc<dyn LicenseAuthority>,
        config.registry.clone(),
    ));

    let pusher = Arc::new(GrpcPackagePusher::new(Duration::from_secs(
        config.update.push_timeout_secs,
    )));
    let coordinator = Arc::new(UpdateCoordinator::new(
        Arc::clone(&registry),
        pusher,
        verifier,
        RetryPolicy {
            max_retries: config.update.max_retries,
            retry_delay: Duration::from_secs(config.update.retry_delay_secs),
        },
    ));

    let metrics = MetricsCache::new();
    let (reports_tx, reports_rx) = tokio::sync::mpsc::channel::<GatewayReport>(256);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    spawn_sweep(
        Arc::clone(&registry),
        Duration::from_secs(config.registry.scan_interval_secs),
        shutdown_rx.clone(),
    );

    if let Some(cloud_url) = &args.cloud_url {
        let gateway_id = args
            .gateway_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let worker = ControlChannelWorker::new(
            ControlConfig::new(cloud_url.clone(), gateway_id),
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            metrics.clone(),
            reports_rx,
            reports_tx.clone(),
        );
        tokio::spawn(worker.run(shutdown_rx.clone()));
    } else {
        // Standalone mode: drain reports so the queue never fills.
        tokio::spawn(drain_reports(reports_rx));
        info!("No cloud URL configured, running standalone");
    }

    let gateway_svc = GatewayServiceImpl::new(Arc::clone(&registry), metrics, reports_tx);

    let router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(GatewayServiceServer::new(gateway_svc));

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
    info!(addr = %args.addr, "Gateway server started");

    tokio::select! {
        result = router.serve(args.addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Gateway stopped");
    Ok(())
}

/// Log and discard reports when no control channel exists.
async fn drain_reports(mut rx: tokio::sync::mpsc::Receiver<GatewayReport>) {
    while let Some(report) = rx.recv().await {
        match report {
            GatewayReport::UpdateOutcome(r) => {
                info!(device = %r.device_uuid, version = %r.version, outcome = r.outcome, "Update outcome (standalone)");
            }
            GatewayReport::Distribution(r) => {
                info!(version = %r.version, devices = r.deliveries.len(), "Distribution result (standalone)");
            }
            GatewayReport::Command(r) => {
                info!(command = %r.command_id, devices = r.deliveries.len(), "Command result (standalone)");
            }
            GatewayReport::Alert(a) => {
                warn!(level = %a.level, message = %a.message, "Alert (standalone)");
            }
        }
    }
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".fleetgate").join("gateway.db"))
}
