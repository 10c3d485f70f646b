//! Node configuration, loaded from an optional TOML file.
//!
//! Every field has a default so an empty file (or no file) is valid.
//! Command-line flags override what is loaded here.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    breaker::BreakerConfig,
    download::{default_workers, EngineConfig},
    error::{Result, SwarmError},
    messages::MAX_DATA_FRAME,
    peers::PeerServerConfig,
    splitter::DEFAULT_CHUNK_SIZE,
    tracker::TrackerServerConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerSection,
    pub peer: PeerSection,
    pub transfer: TransferSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// address the tracker binds when running as one
    pub listen: String,
    /// address peers use to reach the tracker
    pub address: String,
    pub max_connections: usize,
    pub discover_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    /// port 0 picks an ephemeral port, which is then advertised
    pub listen: String,
    /// host other peers should dial; combined with the bound port
    pub advertise_host: String,
    pub max_connections: usize,
    pub chunk_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub chunk_size: usize,
    /// defaults to min(16, cores + 2)
    pub workers: Option<usize>,
    pub retry_budget: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub io_timeout_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub output_dir: PathBuf,
    pub cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            address: "127.0.0.1:8000".to_string(),
            max_connections: 256,
            discover_limit: 200,
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            max_connections: 64,
            chunk_dir: PathBuf::from("chunks"),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: None,
            retry_budget: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            io_timeout_secs: 10,
            breaker_threshold: 3,
            breaker_cooldown_secs: 5,
            output_dir: PathBuf::from("."),
            cleanup: false,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SwarmError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| SwarmError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Config::default()), Config::load)
    }

    pub fn validate(&self) -> Result<()> {
        let transfer = &self.transfer;
        if transfer.chunk_size == 0 || transfer.chunk_size as u64 > MAX_DATA_FRAME as u64 {
            return Err(SwarmError::Config(format!(
                "transfer.chunk_size must be between 1 and {MAX_DATA_FRAME}"
            )));
        }
        if transfer.retry_budget == 0 {
            return Err(SwarmError::Config("transfer.retry_budget must be at least 1".into()));
        }
        if transfer.workers == Some(0) {
            return Err(SwarmError::Config("transfer.workers must be at least 1".into()));
        }
        if transfer.io_timeout_secs == 0 {
            return Err(SwarmError::Config("transfer.io_timeout_secs must be at least 1".into()));
        }
        if self.peer.advertise_host.is_empty() {
            return Err(SwarmError::Config("peer.advertise_host is empty".into()));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.io_timeout_secs)
    }

    pub fn tracker_server(&self) -> TrackerServerConfig {
        TrackerServerConfig {
            max_connections: self.tracker.max_connections,
            discover_limit: self.tracker.discover_limit,
            io_timeout: self.io_timeout(),
        }
    }

    pub fn peer_server(&self) -> PeerServerConfig {
        PeerServerConfig {
            max_connections: self.peer.max_connections,
            io_timeout: self.io_timeout(),
        }
    }

    pub fn engine(&self, endpoint: String) -> EngineConfig {
        let transfer = &self.transfer;
        EngineConfig {
            tracker: self.tracker.address.clone(),
            endpoint,
            output_dir: transfer.output_dir.clone(),
            output_name: None,
            workers: transfer.workers.unwrap_or_else(default_workers),
            retry_budget: transfer.retry_budget,
            backoff_base: Duration::from_millis(transfer.backoff_base_ms),
            backoff_max: Duration::from_millis(transfer.backoff_max_ms),
            io_timeout: self.io_timeout(),
            cleanup: transfer.cleanup,
            breaker: BreakerConfig {
                failure_threshold: transfer.breaker_threshold,
                cooldown: Duration::from_secs(transfer.breaker_cooldown_secs),
            },
        }
    }
}
