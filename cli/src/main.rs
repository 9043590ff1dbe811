// olaf — Neighbourhood relay and client daemon
//
// `olaf server` runs the relay (client/peer WebSocket listeners plus the
// HTTP file store); `olaf client` runs the protocol engine with its local
// HTTP facade. All configuration comes from the environment.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use olaf_core::client::facade;
use olaf_core::{ClientConfig, ClientEngine, Relay, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "olaf")]
#[command(about = "OLAF/Neighbourhood secure messaging", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Server,
    /// Run a client node with its local HTTP facade
    Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server => run_server().await,
        Commands::Client => run_client().await,
    }
}

async fn run_server() -> Result<()> {
    let config = ServerConfig::from_env().context("invalid server configuration")?;
    println!(
        "{} relay on {} (clients :{}, peers :{}, http :{})",
        "Starting".green().bold(),
        config.canonical_address(),
        config.client_ws_port,
        config.server_ws_port,
        config.http_port
    );

    let relay = Relay::new(config).context("failed to initialize relay")?;
    relay.run().await.context("relay terminated")?;
    Ok(())
}

async fn run_client() -> Result<()> {
    let config = ClientConfig::from_env().context("invalid client configuration")?;
    println!(
        "{} client '{}' (home {}, facade :{})",
        "Starting".green().bold(),
        config.client_name,
        config.ws_url(),
        config.facade_port
    );

    let engine = ClientEngine::new(config).context("failed to initialize client")?;
    println!("Fingerprint: {}", engine.fingerprint().cyan());

    tokio::spawn(facade::serve(engine.clone()));
    engine.run().await.context("client terminated")?;
    Ok(())
}
