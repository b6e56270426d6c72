//! Edge server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────── EDGE SERVER ────────────────────────┐
//!                    │                                                             │
//!   HTTP :80/:443 ───┼─▶ http::server ──┐                                          │
//!   QUIC :443 ───────┼─▶ http::h3 ──────┤    ┌──────────────┐    ┌─────────────┐   │
//!                    │                  ├───▶│   routing    │───▶│   horizon   │   │
//!   DNS :53 ─────────┼─▶ dns::server ───┤    │ (client addr)│    │  handlers   │   │
//!   DoT :853 ────────┼─▶ dns::server ───┘    └──────────────┘    └─────────────┘   │
//!                    │                                                             │
//!                    │   lifecycle: worker group, signals, hot handoff (net)       │
//!                    └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use clap::{Parser, Subcommand};

use edgy::config::{load_config, EdgeConfig};
use edgy::edge::{router_from_config, EdgeOptions, EdgeServer};
use edgy::observability::{logging::init_tracing, metrics::init_metrics};
use edgy::{Horizon, Match};

#[derive(Parser)]
#[command(name = "edgy", version, about = "Edge server for HTTP and DNS")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Serve {
        #[arg(short, long, default_value = "edgy.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file and print the result.
    Check {
        #[arg(short, long, default_value = "edgy.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { config } => match load_config(&config) {
            Ok(config) => {
                println!("{config:#?}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}: {err}", config.display());
                ExitCode::FAILURE
            }
        },
        Command::Serve { config } => {
            let config = match load_config(&config) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{}: {err}", config.display());
                    return ExitCode::FAILURE;
                }
            };
            match serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(error = %err, "Edge server exited");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn serve(config: EdgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&config.observability)?;
    tracing::info!(name = %config.name, version = env!("CARGO_PKG_VERSION"), "Starting edge server");

    if config.observability.metrics_enabled {
        init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let name = config.name.clone();
    let mut router = router_from_config(&config, |h| h.with_http(greeting(&name)))?;
    if router.is_empty() {
        router.append(Horizon::new("default", Vec::new()).with_http(greeting(&name)))?;
    }

    let server = EdgeServer::new(EdgeOptions::from_config(&config)?);
    server.listen_and_serve(Arc::new(router), None).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Answers with the server name and the matched horizon.
fn greeting(name: &str) -> Router {
    let name = name.to_owned();
    Router::new().route(
        "/",
        get(move |Extension(m): Extension<Match>| {
            let name = name.clone();
            async move { format!("{name}: horizon {} ({} in {})\n", m.horizon, m.remote_addr, m.cidr) }
        }),
    )
}
