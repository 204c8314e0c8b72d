#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use epsile_engine::{EngineConfig, PresenceAccounting};
use epsile_server::ServerConfig;
use epsile_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "epsile", about = "Anonymous one-to-one chat pairing server")]
struct Cli {
    /// TCP port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Outbound frames buffered per client before new ones are dropped.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    max_frame_bytes: usize,

    /// Seconds between pings.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Seconds without a pong before a client is dropped.
    #[arg(long, default_value_t = 90)]
    client_timeout_secs: u64,

    /// Reject `findPartner` from a connection that is still paired.
    #[arg(long, default_value_t = false)]
    require_unpair: bool,

    /// Count only live mutual pairs in the presence figure.
    #[arg(long, default_value_t = false)]
    exact_presence: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            port: self.port,
            max_send_queue: self.max_send_queue,
            max_frame_bytes: self.max_frame_bytes,
            heartbeat_interval_secs: self.heartbeat_secs,
            client_timeout_secs: self.client_timeout_secs,
            engine: EngineConfig {
                require_unpair_before_repair: self.require_unpair,
                presence_accounting: if self.exact_presence {
                    PresenceAccounting::Exact
                } else {
                    PresenceAccounting::Inherited
                },
                ..EngineConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json_logs: cli.json_logs,
        ..TelemetryConfig::default()
    });

    let handle = epsile_server::start(cli.server_config(), telemetry.metrics())
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.bind, cli.port))?;

    tracing::info!(port = handle.port, "Epsile server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    Ok(())
}
