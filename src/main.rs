//! `psu-bridge`: Modbus TCP to Modbus RTU bridge for XY series power supplies.
//!
//! ```bash
//! psu-bridge --config bridge.toml
//! psu-bridge set-credentials lab-network hunter22
//! psu-bridge clear-credentials
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use psu_bridge::bridge::Bridge;
use psu_bridge::config::AppConfig;
use psu_bridge::credentials::{CredentialStore, Credentials};
use psu_bridge::error::Result;
use psu_bridge::lease::Channel;
use psu_bridge::link::HostLink;
use psu_bridge::modbus_tcp::ModbusTcpServer;
use psu_bridge::serial::{self, SerialTransport};
use psu_bridge::status::StatusPoller;
use psu_bridge::uplink::Supervisor;

#[derive(Parser)]
#[command(name = "psu-bridge")]
#[command(about = "Share a serial Modbus RTU power supply with Modbus TCP clients", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial port of the PSU, overrides the configuration file
    #[arg(long)]
    serial_port: Option<String>,

    #[arg(long)]
    baud_rate: Option<u32>,

    /// Modbus TCP listen address, overrides the configuration file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge (default)
    Run,
    /// Store uplink credentials; takes effect on the next start
    SetCredentials {
        network_name: String,
        secret: String,
    },
    /// Remove stored uplink credentials
    ClearCredentials,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "psu-bridge failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(port) = cli.serial_port {
        config.serial.port = port;
    }
    if let Some(baud_rate) = cli.baud_rate {
        config.serial.baud_rate = baud_rate;
    }
    if let Some(bind) = cli.bind {
        config.modbus_tcp.bind = bind;
    }

    let store = CredentialStore::new(config.uplink.credentials_path.clone());
    match cli.command.unwrap_or(Command::Run) {
        Command::SetCredentials {
            network_name,
            secret,
        } => store.save(&Credentials::new(network_name, secret)),
        Command::ClearCredentials => store.clear(),
        Command::Run => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let link = Arc::new(HostLink::new(config.uplink.probe_address.clone()));
    let supervisor = Supervisor::new(link, config.uplink.clone());

    let (writer, queue) = serial::link();
    let channel = Channel::new(writer, config.bridge.lease_wait);
    let bridge = Bridge::new(channel, supervisor.subscribe(), &config.bridge)?;

    let port = serial::open_port(&config.serial)?;
    let _transport = SerialTransport::new(port, queue, bridge.clone(), &config.serial).spawn()?;

    let state = supervisor.begin().await;
    info!(%state, "uplink started");
    tokio::spawn(supervisor.clone().run());

    let server = ModbusTcpServer::bind(&config.modbus_tcp, bridge.clone()).await?;
    tokio::spawn(server.run());

    let poller = StatusPoller::new(bridge, config.status.clone());
    let mut updates = poller.subscribe();
    tokio::spawn(poller.run());
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(status) => debug!(
                    voltage_mv = status.voltage_out_mv,
                    current_ma = status.current_out_ma,
                    power_mw = status.power_out_mw,
                    output = %status.output,
                    mode = %status.control_mode,
                    "psu status"
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
