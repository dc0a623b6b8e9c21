#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ocpp-bridge
//!
//! OCPP-J WebSocket proxy. Charge points connect to `[proxy] listen` on any
//! path; each connection is paired with a backend connection on the same
//! path, and frames are relayed through the configured rules and workarounds.
//!
//! ## Subcommands
//!
//! - `ocpp-bridge serve` (default): run the proxy
//!
//! ## Dashboard API (when `[dashboard]` is configured)
//!
//! | Method | Path                          | Auth | Description              |
//! |--------|-------------------------------|------|--------------------------|
//! | GET    | `/api/health`                 | No   | Liveness probe           |
//! | GET    | `/api/sessions`               | Yes  | Live sessions            |
//! | GET    | `/api/sessions/{id}`          | Yes  | Status snapshot          |
//! | GET    | `/api/sessions/{id}/frames`   | Yes  | Recent frames (`?since`) |
//! | POST   | `/api/sessions/{id}/commands` | Yes  | Send a command           |
//! | DELETE | `/api/sessions/{id}`          | Yes  | Close a session          |
//! | DELETE | `/api/identity/{id}`          | Yes  | Forget cached identity   |

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use ocpp_bridge::{Config, Server};

/// OCPP-J proxy for non-compliant charge points.
#[derive(Parser)]
#[command(name = "ocpp-bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ocpp-bridge: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("ocpp-bridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        rules = config.rules.iter().filter(|r| r.enabled).count(),
        workarounds = config.workarounds.iter().filter(|w| w.enabled).count(),
        "configuration loaded"
    );

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match server.run(ocpp_bridge::server::shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
