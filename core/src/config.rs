//! Tunnel manager configuration.
//!
//! Stores configuration in JSON format at `~/.podtunnel/config.json`.
//! Every field has a default, so a partial (or missing) file is valid.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Backoff policy applied while (re)establishing a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Failed attempts allowed before giving up. `0` retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Randomize each delay within `[delay / 2, delay]`.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }
}

/// Runtime settings of the tunnel manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Address local listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Poll interval used when the transport has no push notifications.
    #[serde(default = "default_liveness_poll_interval_ms")]
    pub liveness_poll_interval_ms: u64,

    /// How long a local connection waits for a backing pod while reconnecting.
    #[serde(default = "default_connection_wait_timeout_ms")]
    pub connection_wait_timeout_ms: u64,

    /// Upper bound on the synchronous resolve performed by `start`.
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,

    /// How long `stop`/`stop_all` wait before abandoning a tunnel task.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Capacity of the event broadcast buffer per subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_liveness_poll_interval_ms() -> u64 {
    2_000
}

fn default_connection_wait_timeout_ms() -> u64 {
    10_000
}

fn default_resolve_timeout_ms() -> u64 {
    15_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_event_buffer() -> usize {
    1_024
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            retry: RetryPolicy::default(),
            liveness_poll_interval_ms: default_liveness_poll_interval_ms(),
            connection_wait_timeout_ms: default_connection_wait_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl TunnelConfig {
    pub fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_interval_ms.max(1))
    }

    pub fn connection_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_wait_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Configuration store for the tunnel manager settings.
pub struct ConfigStore {
    /// Path to the configuration file.
    config_path: PathBuf,
}

impl ConfigStore {
    /// Create a new config store with the default path.
    ///
    /// Default path: `~/.podtunnel/config.json`
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

        Ok(Self {
            config_path: home.join(".podtunnel").join("config.json"),
        })
    }

    /// Create a config store with a custom path.
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from disk.
    ///
    /// Returns default config if the file doesn't exist.
    pub async fn load(&self) -> Result<TunnelConfig> {
        if !self.config_path.exists() {
            return Ok(TunnelConfig::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to disk.
    ///
    /// Creates the config directory if it doesn't exist.
    pub async fn save(&self, config: &TunnelConfig) -> Result<()> {
        if let Some(config_dir) = self.config_path.parent() {
            fs::create_dir_all(config_dir)
                .await
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        // Write atomically by writing to temp file then renaming
        let temp_path = self.config_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to create temp config file: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| Error::Config(format!("Failed to sync config: {}", e)))?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to rename config file: {}", e)))?;

        Ok(())
    }
}
