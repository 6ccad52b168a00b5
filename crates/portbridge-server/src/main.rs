//! Portbridge server - reverse tunnel broker CLI
//!
//! Accepts long-lived control connections from agents, binds the public
//! ports their proxies request, and stitches public clients to agent data
//! channels.

use anyhow::{Context, Result};
use clap::Parser;
use portbridge_server::{Server, ServerConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portbridge reverse-tunnel broker
#[derive(Parser, Debug)]
#[command(name = "portbridge-server")]
#[command(about = "Reverse-tunnel broker: exposes services registered by portbridge agents")]
#[command(version)]
#[command(long_about = r#"
The portbridge server listens for agent control connections on one port and
for agent data channels on another. Agents register named proxies; each
proxy claims a public TCP port that forwards to a service on the agent's
side of the network.

EXAMPLES:
  # Start with defaults (control on :7000, data on :7001, open auth)
  portbridge-server

  # Start from a config file
  portbridge-server --config server.yaml

  # Override the listen addresses
  portbridge-server --control-bind 0.0.0.0:7100 --data-bind 0.0.0.0:7101

ENVIRONMENT VARIABLES:
  PORTBRIDGE_CONTROL_BIND  Control-channel listener address
  PORTBRIDGE_DATA_BIND     Data-channel listener address
"#)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Control-channel listener address (e.g. 0.0.0.0:7000)
    #[arg(long, env = "PORTBRIDGE_CONTROL_BIND")]
    control_bind: Option<String>,

    /// Data-channel listener address (e.g. 0.0.0.0:7001)
    #[arg(long, env = "PORTBRIDGE_DATA_BIND")]
    data_bind: Option<String>,

    /// Accepted login token (repeatable; none = open registration)
    #[arg(long = "token")]
    tokens: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = if let Some(ref path) = args.config {
        info!("Loading configuration from: {}", path.display());
        ServerConfig::load(path)?
    } else {
        ServerConfig::default()
    };

    // CLI flags win over the config file.
    if let Some(ref control_bind) = args.control_bind {
        config.control_bind = control_bind.clone();
    }
    if let Some(ref data_bind) = args.data_bind {
        config.data_bind = data_bind.clone();
    }
    if !args.tokens.is_empty() {
        config.auth.tokens = args.tokens.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = build_config(&args)?;
    let server = Server::bind(&config)
        .await
        .context("Failed to start broker")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await.context("Broker terminated with error")
}
