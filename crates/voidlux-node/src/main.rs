//! # VoidLux Node
//!
//! Entry point for running a swarm node.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use voidlux_core::NodeRole;
use voidlux_node::{config::NodeConfig, logging, Node};

/// VoidLux - decentralized coding-agent orchestration
#[derive(Parser, Debug)]
#[command(name = "voidlux-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node role: seneschal, emperor, or worker
    #[arg(long)]
    role: Option<NodeRole>,

    /// P2P listen port
    #[arg(long)]
    p2p_port: Option<u16>,

    /// HTTP control-plane port (advertised)
    #[arg(long)]
    http_port: Option<u16>,

    /// UDP discovery port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed peers, host:port (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Shared mesh secret (closes the mesh)
    #[arg(long)]
    auth_secret: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) if path.exists() => NodeConfig::from_file(path)?,
            _ => NodeConfig::default(),
        };
        config.merge_env()?;

        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(port) = self.p2p_port {
            config.p2p_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if !self.seeds.is_empty() {
            config.seeds = self.seeds;
        }
        if let Some(secret) = self.auth_secret {
            config.auth_secret = Some(secret);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate_config()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;

    logging::init_logging(&config.log_level, config.log_format.to_lowercase() == "json");

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        role = %config.role,
        p2p_port = config.p2p_port,
        "starting VoidLux node"
    );

    let node = Node::start(config).await?;

    tracing::info!(
        node_id = %node.node_id(),
        p2p_addr = %node.p2p_addr(),
        "node running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
