//! Backhaul CLI - reverse tunnel broker, agent and local bridge
//!
//! Expose a private TCP service through a public broker without opening any
//! inbound port on the private side.

use anyhow::{Context, Result};
use backhaul_lib::{Agent, AgentConfig, BridgeConfig, Broker, BrokerConfig, LocalBridge};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul - expose private services through a public broker
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backhaul - expose private services through a public broker")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public broker
    #[command(long_about = r#"
Run the public broker. Agents connect to the control and tunnel addresses;
visitors connect to the visitor address and are paired with an idle tunnel.

EXAMPLES:
  backhaul broker --config broker.yaml

  # All settings have defaults, so the file may be omitted
  backhaul broker

ENVIRONMENT VARIABLES:
  BACKHAUL_BROKER_CONFIG  Path to the broker YAML file
    "#)]
    Broker {
        /// Broker configuration file (YAML)
        #[arg(short, long, env = "BACKHAUL_BROKER_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Run an agent next to the private service
    #[command(long_about = r#"
Run an agent beside the private service. The agent keeps a control channel to
the broker and opens tunnels to it on request, reconnecting with exponential
backoff when the control channel drops.

EXAMPLES:
  backhaul agent --config agent.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_AGENT_CONFIG  Path to the agent YAML file
    "#)]
    Agent {
        /// Agent configuration file (YAML)
        #[arg(short, long, env = "BACKHAUL_AGENT_CONFIG")]
        config: PathBuf,
    },

    /// Forward a local port to the broker's visitor address
    Bridge {
        /// Bridge configuration file (YAML)
        #[arg(short, long, env = "BACKHAUL_BRIDGE_CONFIG")]
        config: PathBuf,
    },
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Publish `true` on the returned channel when Ctrl+C arrives.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(err) => error!("Error listening for shutdown signal: {}", err),
        }
        tx.send_replace(true);
    });
    rx
}

async fn run_broker(config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => BrokerConfig::load(&path)
            .with_context(|| format!("Failed to load broker config {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    let broker = Broker::bind(config)
        .await
        .context("Failed to start broker")?;
    let stats = broker.run(shutdown_on_ctrl_c()).await;

    info!(
        "Broker stopped after pairing {} visitors ({} rejected)",
        stats.visitors_paired, stats.visitors_rejected
    );
    Ok(())
}

async fn run_agent(config: PathBuf) -> Result<()> {
    let config = AgentConfig::load(&config)
        .with_context(|| format!("Failed to load agent config {}", config.display()))?;

    info!(
        "Agent exposing {} through {}",
        config.service_addr, config.control_addr
    );

    let agent = Agent::new(config);
    agent
        .run(shutdown_on_ctrl_c())
        .await
        .context("Agent stopped")?;

    info!("Agent stopped after opening {} tunnels", agent.tunnels_opened());
    Ok(())
}

async fn run_bridge(config: PathBuf) -> Result<()> {
    let config = BridgeConfig::load(&config)
        .with_context(|| format!("Failed to load bridge config {}", config.display()))?;

    let bridge = LocalBridge::bind(&config)
        .await
        .context("Failed to start local bridge")?;
    bridge.run(shutdown_on_ctrl_c()).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Broker { config } => run_broker(config).await,
        Commands::Agent { config } => run_agent(config).await,
        Commands::Bridge { config } => run_bridge(config).await,
    }
}
