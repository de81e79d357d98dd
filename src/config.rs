//! Configuration management
//!
//! One TOML file holds both the client (transport, merge ratio, data
//! directory) and the aggregation service settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::transport::TransportConfig;
use crate::weights::MergeRatio;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Client side settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Where sync state, merged weights and the offline queue live.
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// `[local, global]` blend used when merging
    #[serde(default)]
    pub merge_ratio: MergeRatio,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => data_dir(),
        }
    }
}

/// Aggregation service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request body ceiling in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Snapshots averaged into the global model
    #[serde(default = "default_fedavg_window")]
    pub fedavg_window: usize,
    /// Snapshots retained before the oldest is evicted
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,
    /// Requests allowed per client IP per window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    /// Bearer token. When unset only loopback peers are served.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Allowed CORS origins. When empty only localhost origins are allowed.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// JSON file the store is persisted to, in memory when unset
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 3800 }
fn default_max_upload_bytes() -> usize { 5 * 1024 * 1024 }
fn default_fedavg_window() -> usize { 50 }
fn default_snapshot_retention() -> usize { 100 }
fn default_telemetry_capacity() -> usize { 10_000 }
fn default_rate_limit() -> usize { 60 }
fn default_rate_window_secs() -> u64 { 60 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            fedavg_window: default_fedavg_window(),
            snapshot_retention: default_snapshot_retention(),
            telemetry_capacity: default_telemetry_capacity(),
            rate_limit: default_rate_limit(),
            rate_window_secs: default_rate_window_secs(),
            api_token: None,
            cors_origins: Vec::new(),
            persistence_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file, writing the defaults on first use
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "swarm-sync", "swarm-sync")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "swarm-sync", "swarm-sync")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Default configuration as a TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
