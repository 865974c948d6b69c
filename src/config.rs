//! Daemon configuration.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for the mirror daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the local registry mirror serves on
    pub registry_addr: String,
    /// Port peers serve their registry mirror on (fleet-wide)
    pub registry_port: u16,
    /// P2P/peer index listen port (0 = random port)
    pub p2p_port: u16,
    /// Bootstrap peers for the peer index, as multiaddrs with peer ids.
    /// Empty means standalone mode with an in-memory index.
    pub bootstrap_peers: Vec<String>,
    /// Address the readiness probe serves on
    pub probe_addr: String,
    /// Scratch directory cleared on startup
    pub data_dir: std::path::PathBuf,
    /// Retry budget per mirror resolution
    pub resolve_retries: usize,
    /// Per-attempt resolve timeout in milliseconds
    pub resolve_timeout_ms: u64,
    /// Advertise and resolve `latest` tags
    pub resolve_latest_tag: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_addr: "0.0.0.0:5000".to_owned(),
            registry_port: 5000,
            p2p_port: 5001,
            bootstrap_peers: Vec::new(),
            probe_addr: "127.0.0.1:8090".to_owned(),
            data_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("mirrormesh"),
            resolve_retries: 3,
            resolve_timeout_ms: 5000,
            resolve_latest_tag: true,
        }
    }
}

impl Config {
    /// Create a configuration builder with the standard priority stack:
    /// environment variables (MIRRORMESH_* prefix) over an optional config
    /// file over defaults.
    pub fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let config_file = dirs_config_file();
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(config_file) = config_file {
            builder = builder.add_source(config::File::from(config_file).required(false));
        }
        Ok(builder.add_source(
            config::Environment::with_prefix("MIRRORMESH")
                .separator("__")
                .list_separator(","),
        ))
    }

    /// Load configuration with defaults, config file and environment.
    pub fn load() -> Result<Self> {
        let config = Self::builder()?
            .build()
            .map_err(|e| Error::other(format!("Failed to build config: {e}")))?;
        config
            .try_deserialize()
            .map_err(|e| Error::other(format!("Failed to deserialize config: {e}")))
    }

    pub fn resolve_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.resolve_timeout_ms)
    }
}

fn dirs_config_file() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mirrormesh").join("config"))
}
