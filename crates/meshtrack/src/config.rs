//! Configuration management for meshtrack.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::MAX_PAGE_SIZE;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "meshtrack";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "locations.db";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "MESHTRACK_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `MESHTRACK_`, sections split on `__`,
///    e.g. `MESHTRACK_SYNC__INTERVAL_SECS=5`)
/// 2. TOML config file at `~/.config/meshtrack/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Node identity configuration.
    pub node: NodeConfig,
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Sync engine configuration.
    pub sync: SyncConfig,
    /// Statically known peers and discovery candidates.
    pub peers: PeersConfig,
    /// Mesh-layer discovery configuration.
    pub discovery: DiscoveryConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/meshtrack/locations.db`
    pub database_path: Option<PathBuf>,
}

/// Node identity configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id. When unset, an id is generated on first boot and persisted.
    pub id: Option<String>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the API listens on.
    pub bind_address: String,
}

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run scheduled sync cycles.
    pub enabled: bool,
    /// Seconds between scheduled cycles.
    pub interval_secs: u64,
    /// Seconds to wait after startup before the first cycle.
    pub startup_delay_secs: u64,
    /// Maximum peers synced at the same time.
    pub max_concurrent_peers: usize,
    /// Upper bound on one whole exchange with a peer, in seconds.
    pub peer_timeout_secs: u64,
    /// Upper bound on a single HTTP request, in seconds.
    pub request_timeout_secs: u64,
    /// Reports per pull page.
    pub page_size: usize,
    /// Reports read from the local store per push batch.
    pub push_batch_size: usize,
}

/// Peer list configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Peers known up front, as `peer_node_id -> address`.
    pub known: BTreeMap<String, String>,
    /// Addresses probed for a node id every cycle.
    pub candidates: Vec<String>,
}

/// Mesh-layer discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Import batman-adv originators as discovery candidates.
    pub batctl_enabled: bool,
    /// Command used to list originators.
    pub batctl_command: String,
    /// First two octets of the mesh link-local network.
    pub link_local_prefix: String,
    /// Port peers serve their API on.
    pub peer_port: u16,
    /// Seconds to wait for the originator listing before giving up.
    pub command_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            startup_delay_secs: 2,
            max_concurrent_peers: 4,
            peer_timeout_secs: 30,
            request_timeout_secs: 5,
            page_size: 200,
            push_batch_size: 100,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batctl_enabled: false,
            batctl_command: "batctl".to_string(),
            link_local_prefix: "169.254".to_string(),
            peer_port: 5000,
            command_timeout_secs: 5,
        }
    }
}

impl SyncConfig {
    /// Time between scheduled cycles.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Delay before the first scheduled cycle.
    #[must_use]
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    /// Bound on one exchange with a peer.
    #[must_use]
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    /// Bound on a single HTTP request.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DiscoveryConfig {
    /// Bound on one run of the originator listing command.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `MESHTRACK_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.peer_timeout_secs", self.sync.peer_timeout_secs),
            ("sync.request_timeout_secs", self.sync.request_timeout_secs),
            ("sync.max_concurrent_peers", self.sync.max_concurrent_peers as u64),
            ("sync.page_size", self.sync.page_size as u64),
            ("sync.push_batch_size", self.sync.push_batch_size as u64),
            ("discovery.command_timeout_secs", self.discovery.command_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than 0")));
            }
        }

        if self.sync.page_size > MAX_PAGE_SIZE {
            return Err(invalid(format!(
                "sync.page_size must be at most {MAX_PAGE_SIZE}, the largest page peers serve"
            )));
        }

        self.bind_address()?;

        if self.node.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(invalid("node.id must not be empty when set"));
        }

        let octets: Vec<&str> = self.discovery.link_local_prefix.split('.').collect();
        if octets.len() != 2 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
            return Err(invalid(format!(
                "discovery.link_local_prefix must be two octets like 169.254, got '{}'",
                self.discovery.link_local_prefix
            )));
        }

        for (peer, address) in &self.peers.known {
            if peer.trim().is_empty() || address.trim().is_empty() {
                return Err(invalid("peers.known entries need a node id and an address"));
            }
        }

        Ok(())
    }

    /// Parse the configured bind address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the address is not a socket address.
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.server.bind_address.parse().map_err(|_| {
            invalid(format!(
                "server.bind_address '{}' is not a valid socket address",
                self.server.bind_address
            ))
        })
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
