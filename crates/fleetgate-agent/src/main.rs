//! FleetGate Agent
//!
//! Runs on each field device: serves package/command pushes from the
//! gateway, executes update sessions with post-install probation, and
//! keeps registration, licensing, and check-ins current.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use fleetgate_core::config::load_config;
use fleetgate_core::tracing_init::init_tracing;
use fleetgate_crypto::PackageVerifier;
use fleetgate_proto::v1::agent_service_server::AgentServiceServer;

use fleetgate_agent::checkin::{CheckinConfig, CheckinWorker};
use fleetgate_agent::executor::{SessionReport, UpdateExecutor};
use fleetgate_agent::installer::CommandInstaller;
use fleetgate_agent::monitor::LogHealthMonitor;
use fleetgate_agent::server::AgentServiceImpl;
use fleetgate_agent::store::VersionStore;

#[derive(Parser, Debug)]
#[command(name = "fleetgate-agent")]
#[command(version, about = "FleetGate device agent - update execution and check-in")]
struct Args {
    /// Address to serve the agent API on.
    #[arg(long, default_value = "0.0.0.0:50061", env = "FLEETGATE_AGENT_ADDR")]
    addr: SocketAddr,

    /// Address the gateway should dial back, if different from --addr
    /// (e.g. behind NAT).
    #[arg(long, env = "FLEETGATE_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,

    /// Gateway URL, e.g. "http://10.0.0.1:50060".
    #[arg(long, env = "FLEETGATE_GATEWAY_URL")]
    gateway_url: String,

    /// Stable device identifier.
    #[arg(long, env = "FLEETGATE_DEVICE_UUID")]
    device_uuid: String,

    /// Human-readable device name.
    #[arg(long, default_value = "fleetgate-device", env = "FLEETGATE_DEVICE_NAME")]
    device_name: String,

    /// Directory for retained package versions.
    #[arg(long, env = "FLEETGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to JSON settings file.
    #[arg(long, env = "FLEETGATE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Path to the trusted update-signing public key.
    #[arg(long, env = "FLEETGATE_PUBLIC_KEY_PATH")]
    public_key: Option<PathBuf>,

    /// Interval between check-ins with the gateway (seconds).
    #[arg(long, default_value_t = 60, env = "FLEETGATE_CHECKIN_INTERVAL")]
    checkin_interval: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing("fleetgate_agent=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %args.device_uuid,
        "Starting fleetgate-agent"
    );

    let mut config = load_config(args.settings.as_deref())?;
    if let Some(path) = &args.public_key {
        config.update.public_key_path = Some(path.clone());
    }
    config.validate_agent()?;

    let public_key_path = config
        .update
        .public_key_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("update.public_key_path is required"))?;
    let verifier = PackageVerifier::load_from_file(&public_key_path)?;
    info!(fingerprint = %verifier.fingerprint(), "Loaded update-signing public key");

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    let store = Arc::new(VersionStore::open(&data_dir.join("versions"))?);

    let log_path = config
        .probation
        .log_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("probation.log_path is required"))?;
    let monitor = LogHealthMonitor::new(
        &log_path,
        &config.probation.failure_patterns,
        Duration::from_secs(config.probation.poll_interval_secs),
    );

    let installer = Arc::new(CommandInstaller::new(
        &config.update.install_command,
        Duration::from_secs(config.update.install_timeout_secs),
    ));

    let (reports_tx, reports_rx) = tokio::sync::mpsc::channel::<SessionReport>(64);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let executor = Arc::new(UpdateExecutor::new(
        Arc::clone(&store),
        verifier,
        installer,
        monitor,
        Duration::from_secs(config.probation.window_secs),
        config.update.retention_cap,
        reports_tx,
        shutdown_rx.clone(),
    ));

    let checkin = CheckinWorker::new(
        CheckinConfig {
            gateway_url: args.gateway_url.clone(),
            device_uuid: args.device_uuid.clone(),
            device_name: args.device_name.clone(),
            advertise_address: args
                .advertise_addr
                .clone()
                .unwrap_or_else(|| args.addr.to_string()),
            checkin_interval: Duration::from_secs(args.checkin_interval),
            renewal_lead: Duration::from_secs(config.registry.license_check_interval_secs),
            retry_delay: Duration::from_secs(config.update.retry_delay_secs),
        },
        Arc::clone(&executor),
        Arc::clone(&store),
        reports_rx,
    );
    tokio::spawn(checkin.run(shutdown_rx));

    let agent_svc = AgentServiceImpl::new(executor);

    let router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(AgentServiceServer::new(agent_svc));

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
    info!(addr = %args.addr, "Agent server started");

    tokio::select! {
        result = router.serve(args.addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Agent stopped");
    Ok(())
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".fleetgate"))
}
