//! # Main — CLI Entry Point
//!
//! `serve` runs the monitoring service; the remaining subcommands are the
//! operator surface (used interactively and from deploy scripts) and talk
//! to a running instance over its HTTP API.
//!
//! ## Global Options
//!
//! - `--server` / `GRIDWATCH_URL`: base URL of the running service.
//! - `--api-key` / `SENSOR_API_KEY`: shared secret for the operator API.
//! - `LOG_FORMAT=json`: structured JSON logs for container deployments.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use gridwatch::config::Config;
use gridwatch::operator_client::OperatorClient;

#[derive(Parser)]
#[command(name = "gridwatch", about = "Residential power-outage monitoring service")]
struct Cli {
    /// Base URL of a running gridwatch instance (operator subcommands)
    #[arg(long, env = "GRIDWATCH_URL", default_value = "http://localhost:8081")]
    server: String,

    /// Shared API secret (operator subcommands; `serve` reads the env)
    #[arg(long, env = "SENSOR_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring service
    Serve {
        /// Listen port (overrides API_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Freeze one sensor for maintenance
    Freeze {
        /// Sensor UUID
        sensor_uuid: String,
        /// Freeze window in minutes (default: DEPLOY_FREEZE_MINUTES)
        #[arg(long)]
        minutes: Option<i64>,
        /// Pin the sensor's section contribution to DOWN instead of UP
        #[arg(long)]
        assume_down: bool,
    },
    /// Lift one sensor's freeze
    Unfreeze {
        /// Sensor UUID
        sensor_uuid: String,
    },
    /// Freeze the whole fleet (prints the frozen_at stamp for unfreeze-stamped)
    FreezeAll {
        /// Freeze window in minutes (default: DEPLOY_FREEZE_MINUTES)
        #[arg(long)]
        minutes: Option<i64>,
        /// Pin contributions to DOWN instead of UP
        #[arg(long)]
        assume_down: bool,
    },
    /// Lift the freezes created by one freeze-all run
    UnfreezeStamped {
        /// The frozen_at stamp printed by freeze-all (RFC 3339)
        frozen_at: String,
    },
    /// List registered sensors with heartbeat and freeze state
    Sensors,
    /// Show current per-section power state
    Status,
    /// Enqueue a broadcast message to all active subscribers
    Broadcast {
        /// Message text
        text: String,
        /// Messenger parse mode (e.g. HTML, MarkdownV2)
        #[arg(long)]
        parse_mode: Option<String>,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for container deployments, human-readable otherwise.
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    if let Commands::Serve { port } = &cli.command {
        let mut config = match Config::from_env() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "fatal: invalid configuration");
                std::process::exit(1);
            }
        };
        if let Some(port) = port {
            config.api_port = *port;
        }
        return match rt.block_on(gridwatch::server::run(config)) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "fatal: service failed to start");
                std::process::exit(1);
            }
        };
    }

    let api_key = cli.api_key.clone().ok_or_else(|| {
        anyhow::anyhow!("an API key is required (set via --api-key or SENSOR_API_KEY)")
    })?;
    let client = OperatorClient::new(&cli.server, &api_key);

    let result = rt.block_on(async {
        match &cli.command {
            Commands::Serve { .. } => unreachable!("handled above"),
            Commands::Freeze {
                sensor_uuid,
                minutes,
                assume_down,
            } => client.freeze(sensor_uuid, *minutes, !assume_down).await,
            Commands::Unfreeze { sensor_uuid } => client.unfreeze(sensor_uuid).await,
            Commands::FreezeAll {
                minutes,
                assume_down,
            } => client.freeze_all(*minutes, !assume_down).await,
            Commands::UnfreezeStamped { frozen_at } => client.unfreeze_stamped(frozen_at).await,
            Commands::Sensors => client.sensors().await,
            Commands::Status => client.status().await,
            Commands::Broadcast { text, parse_mode } => {
                client.broadcast(text, parse_mode.as_deref()).await
            }
        }
    })?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
