//! Portbridge agent - reverse tunnel agent CLI
//!
//! Connects to a portbridge broker and exposes local services through
//! public ports on the broker, with no inbound connectivity required here.

use anyhow::{Context, Result};
use clap::Parser;
use portbridge_agent::{Agent, AgentConfig, ProxyConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portbridge reverse-tunnel agent
#[derive(Parser, Debug)]
#[command(name = "portbridge-agent")]
#[command(about = "Portbridge reverse-tunnel agent - exposes local services through a broker")]
#[command(version)]
#[command(long_about = r#"
The portbridge agent dials out to a broker, registers named proxies and
forwards incoming connections to services on this side of the network.

EXAMPLES:
  # Expose a single local service
  portbridge-agent --broker broker.example.com:7000 \
    --data-addr broker.example.com:7001 \
    --token $TOKEN \
    --proxy-name web --local-target 127.0.0.1:8080 --remote-port 6000

  # Start from a config file
  portbridge-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  PORTBRIDGE_BROKER     Broker control-channel address
  PORTBRIDGE_DATA_ADDR  Broker data-channel address
  PORTBRIDGE_TOKEN      Login token
"#)]
struct Args {
    /// Broker control-channel address (e.g. broker.example.com:7000)
    #[arg(long, env = "PORTBRIDGE_BROKER")]
    broker: Option<String>,

    /// Broker data-channel address (e.g. broker.example.com:7001)
    #[arg(long, env = "PORTBRIDGE_DATA_ADDR")]
    data_addr: Option<String>,

    /// Login token
    #[arg(long, env = "PORTBRIDGE_TOKEN")]
    token: Option<String>,

    /// Name for a single proxy registered from the command line
    #[arg(long, requires = "local_target")]
    proxy_name: Option<String>,

    /// Local service address for the command-line proxy
    #[arg(long, requires = "proxy_name")]
    local_target: Option<String>,

    /// Public port for the command-line proxy (0 = broker-allocated)
    #[arg(long, default_value_t = 0)]
    remote_port: u16,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    /// Broker connection settings
    broker: BrokerSection,

    /// Optional run identifier echoed in broker logs
    #[serde(default)]
    run_id: Option<String>,

    /// Proxies to register
    #[serde(default)]
    proxies: Vec<ProxyConfig>,

    #[serde(default)]
    reconnect: portbridge_agent::ReconnectSettings,
}

#[derive(Debug, Serialize, Deserialize)]
struct BrokerSection {
    /// Control-channel address
    control_addr: String,

    /// Data-channel address
    data_addr: String,

    /// Environment variable holding the login token
    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    /// Direct login token (prefer token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
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

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let mut config = if let Some(ref config_path) = args.config {
        info!("Loading configuration from: {}", config_path.display());
        let file = load_config_file(config_path)?;

        let token = if let Some(ref env_var) = file.broker.token_env {
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?
        } else {
            file.broker.token.unwrap_or_default()
        };

        let mut config = AgentConfig::new(file.broker.control_addr, file.broker.data_addr);
        config.token = token;
        config.run_id = file.run_id;
        config.proxies = file.proxies;
        config.reconnect = file.reconnect;
        config
    } else {
        let broker = args
            .broker
            .clone()
            .context("--broker is required without a config file")?;
        let data_addr = args
            .data_addr
            .clone()
            .context("--data-addr is required without a config file")?;
        AgentConfig::new(broker, data_addr)
    };

    if let Some(ref broker) = args.broker {
        config.control_addr = broker.clone();
    }
    if let Some(ref data_addr) = args.data_addr {
        config.data_addr = data_addr.clone();
    }
    if let Some(token) = args.token {
        config.token = token;
    }
    if let (Some(name), Some(local_target)) = (args.proxy_name, args.local_target) {
        config.proxies.push(ProxyConfig {
            name,
            kind: portbridge_proto::ProxyKind::Tcp,
            local_target,
            remote_port: args.remote_port,
        });
    }

    if config.proxies.is_empty() {
        anyhow::bail!("No proxies configured; nothing to expose");
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = build_agent_config(args)?;
    info!(
        broker = %config.control_addr,
        proxies = config.proxies.len(),
        "Starting portbridge agent"
    );

    let agent = Agent::new(config);
    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    agent.run().await.context("Agent terminated with error")
}
