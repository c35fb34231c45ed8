//! `fleet` binary: loads `fleet.toml`, pre-registers agents and serves the
//! agent gateway until interrupted.

mod config;

use clap::{Parser, Subcommand};
use config::FleetConfig;
use fleet_gateway::{AuthConfig, GatewayServer};
use fleet_orchestrator::Orchestrator;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet", about = "Fleet: task-to-agent dispatch")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator and its agent gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Parse and validate the config file, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await?,
        Commands::CheckConfig => {
            println!(
                "{}: ok ({} agent(s), strategy {}, auth {})",
                cli.config.display(),
                config.agents.len(),
                config.orchestrator.selection_strategy,
                if config.security.api_keys.is_empty() { "off" } else { "on" },
            );
        }
    }

    Ok(())
}

async fn serve(config: FleetConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    let orchestrator = Orchestrator::new(config.orchestrator)?;
    for descriptor in config.agents {
        let id = descriptor.id.clone();
        match orchestrator.register_agent(descriptor).await {
            Ok(agent) => info!(agent_id = %agent.id, transport = %agent.transport, "Agent pre-registered"),
            Err(e) => warn!(agent_id = %id, error = %e, "Skipping agent from config"),
        }
    }
    orchestrator.start();

    let auth_config = AuthConfig::new(config.security.api_keys);
    if auth_config.is_enabled() {
        info!(keys = auth_config.api_keys.len(), "API key auth enabled");
    }
    let app = GatewayServer::build_with_auth(orchestrator.clone(), auth_config);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Fleet gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    orchestrator.destroy();
    Ok(())
}
