//! Node configuration: defaults, YAML file, environment overlay.
//!
//! Environment variables (`VOIDLUX_*`) override file values, which
//! override defaults:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `VOIDLUX_ROLE` | seneschal / emperor / worker | `worker` |
//! | `VOIDLUX_P2P_PORT` | P2P listen port | `7654` |
//! | `VOIDLUX_HTTP_PORT` | Control-plane port (advertised) | `7655` |
//! | `VOIDLUX_DISCOVERY_PORT` | UDP beacon port | `7656` |
//! | `VOIDLUX_DATA_DIR` | Data directory | `./data` |
//! | `VOIDLUX_SEEDS` | Comma-separated host:port list | *(empty)* |
//! | `VOIDLUX_AUTH_SECRET` | Shared mesh secret | *(open mesh)* |
//! | `VOIDLUX_LOG_LEVEL` | trace/debug/info/warn/error | `info` |
//! | `VOIDLUX_LOG_FORMAT` | json / pretty | `pretty` |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;
use voidlux_consensus::ElectionConfig;
use voidlux_core::NodeRole;

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Environment variable parsing error.
    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse {
        /// The offending variable.
        key: String,
        /// What went wrong.
        message: String,
    },

    /// File loading error.
    #[error("failed to load configuration file: {0}")]
    FileLoad(String),
}

/// Everything a node needs to start.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// The role this node starts in.
    pub role: NodeRole,

    /// Host the P2P listener binds.
    pub listen_host: String,

    /// P2P listen port. Zero binds an ephemeral port (tests).
    pub p2p_port: u16,

    /// HTTP control-plane port, advertised to peers.
    pub http_port: u16,

    /// UDP discovery beacon port.
    pub discovery_port: u16,

    /// Whether the UDP/multicast beacons run at all. Disabled for
    /// single-host test swarms that would fight over the port.
    pub udp_discovery: bool,

    /// Directory holding the per-node databases.
    pub data_dir: PathBuf,

    /// Seed peers dialed at startup, `host:port`.
    pub seeds: Vec<String>,

    /// Shared mesh secret. When set the mesh is closed.
    pub auth_secret: Option<String>,

    /// Initial cluster-size estimate for quorum math. Defaults to
    /// seeds + self; consensus `membership_change` commits update it.
    pub cluster_size: Option<usize>,

    /// Log level.
    pub log_level: String,

    /// Log format (`json` or `pretty`).
    pub log_format: String,

    /// Election timing, overridable for tests.
    #[serde(skip, default)]
    pub election: ElectionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Worker,
            listen_host: "0.0.0.0".to_string(),
            p2p_port: 7654,
            http_port: 7655,
            discovery_port: 7656,
            udp_discovery: true,
            data_dir: PathBuf::from("./data"),
            seeds: Vec::new(),
            auth_secret: None,
            cluster_size: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            election: ElectionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileLoad(e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::FileLoad(e.to_string()))
    }

    /// Applies `VOIDLUX_*` environment overrides.
    pub fn merge_env(&mut self) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.parse().map_err(|e: T::Err| ConfigError::EnvParse {
                key: key.to_string(),
                message: e.to_string(),
            })
        }

        if let Ok(role) = std::env::var("VOIDLUX_ROLE") {
            self.role = parse("VOIDLUX_ROLE", &role)?;
        }
        if let Ok(port) = std::env::var("VOIDLUX_P2P_PORT") {
            self.p2p_port = parse("VOIDLUX_P2P_PORT", &port)?;
        }
        if let Ok(port) = std::env::var("VOIDLUX_HTTP_PORT") {
            self.http_port = parse("VOIDLUX_HTTP_PORT", &port)?;
        }
        if let Ok(port) = std::env::var("VOIDLUX_DISCOVERY_PORT") {
            self.discovery_port = parse("VOIDLUX_DISCOVERY_PORT", &port)?;
        }
        if let Ok(dir) = std::env::var("VOIDLUX_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(seeds) = std::env::var("VOIDLUX_SEEDS") {
            self.seeds = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(secret) = std::env::var("VOIDLUX_AUTH_SECRET") {
            self.auth_secret = Some(secret);
        }
        if let Ok(level) = std::env::var("VOIDLUX_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(format) = std::env::var("VOIDLUX_LOG_FORMAT") {
            self.log_format = format;
        }
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}', expected one of {valid_levels:?}",
                self.log_level
            )));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log format '{}', expected one of {valid_formats:?}",
                self.log_format
            )));
        }

        for seed in &self.seeds {
            let Some((host, port)) = seed.rsplit_once(':') else {
                return Err(ConfigError::Invalid(format!(
                    "seed '{seed}' is not host:port"
                )));
            };
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "seed '{seed}' is not host:port"
                )));
            }
        }

        Ok(())
    }

    /// The initial cluster-size estimate: explicit, else seeds + self.
    #[must_use]
    pub fn initial_cluster_size(&self) -> usize {
        self.cluster_size.unwrap_or(self.seeds.len() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(NodeConfig::default().validate_config().is_ok());
    }

    #[test]
    fn bad_log_level_rejected() {
        let config = NodeConfig {
            log_level: "shouty".into(),
            ..Default::default()
        };
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn bad_seed_rejected() {
        let config = NodeConfig {
            seeds: vec!["no-port-here".into()],
            ..Default::default()
        };
        assert!(config.validate_config().is_err());

        let config = NodeConfig {
            seeds: vec!["10.0.0.1:7654".into()],
            ..Default::default()
        };
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn cluster_size_defaults_to_seeds_plus_self() {
        let config = NodeConfig {
            seeds: vec!["a:1".into(), "b:2".into()],
            ..Default::default()
        };
        assert_eq!(config.initial_cluster_size(), 3);

        let config = NodeConfig {
            cluster_size: Some(7),
            ..Default::default()
        };
        assert_eq!(config.initial_cluster_size(), 7);
    }
}
