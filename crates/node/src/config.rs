//! Configuration module for a rangekv node
//!
//! Supports YAML configuration files with module-based organization

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Raft configuration
    #[serde(default)]
    pub raft: RaftConfig,
    /// Request routing configuration
    #[serde(default)]
    pub sender: SenderConfig,
    /// Split configuration
    #[serde(default)]
    pub split: SplitConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: Config) {
        self.node.merge(other.node);
        self.raft.merge(other.raft);
        self.sender.merge(other.sender);
        self.split.merge(other.split);
        self.log.merge(other.log);
    }

    /// Config for the i-th host of an in-process fleet (1-based)
    pub fn for_host(&self, i: usize) -> Config {
        let mut config = self.clone();
        config.node = NodeConfig {
            nhid: format!("{}-{}", self.node.nhid, i),
            raft_address: format!("{}-raft-{}", self.node.raft_address, i),
            rpc_address: format!("{}-rpc-{}", self.node.rpc_address, i),
        };
        config
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node host ID
    pub nhid: String,
    /// Address peers use for raft traffic
    pub raft_address: String,
    /// Address peers use for API calls
    pub rpc_address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nhid: "nhid".to_string(),
            raft_address: "127.0.0.1:7100".to_string(),
            rpc_address: "127.0.0.1:7200".to_string(),
        }
    }
}

impl NodeConfig {
    fn merge(&mut self, other: Self) {
        if !other.nhid.is_empty() {
            self.nhid = other.nhid;
        }
        if !other.raft_address.is_empty() {
            self.raft_address = other.raft_address;
        }
        if !other.rpc_address.is_empty() {
            self.rpc_address = other.rpc_address;
        }
    }
}

/// Raft configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Propose timeout in milliseconds
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,
    /// Read index timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Config change timeout in milliseconds
    #[serde(default = "default_config_change_timeout_ms")]
    pub config_change_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            propose_timeout_ms: default_propose_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            config_change_timeout_ms: default_config_change_timeout_ms(),
        }
    }
}

impl RaftConfig {
    fn merge(&mut self, other: Self) {
        if other.propose_timeout_ms > 0 {
            self.propose_timeout_ms = other.propose_timeout_ms;
        }
        if other.read_timeout_ms > 0 {
            self.read_timeout_ms = other.read_timeout_ms;
        }
        if other.config_change_timeout_ms > 0 {
            self.config_change_timeout_ms = other.config_change_timeout_ms;
        }
    }

    /// Get propose timeout as Duration
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// Get read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Get config change timeout as Duration
    pub fn config_change_timeout(&self) -> Duration {
        Duration::from_millis(self.config_change_timeout_ms)
    }
}

/// Sender retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Attempts before giving up with RoutingExhausted
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl SenderConfig {
    fn merge(&mut self, other: Self) {
        if other.max_attempts > 0 {
            self.max_attempts = other.max_attempts;
        }
        if other.initial_backoff_ms > 0 {
            self.initial_backoff_ms = other.initial_backoff_ms;
        }
        if other.max_backoff_ms > 0 {
            self.max_backoff_ms = other.max_backoff_ms;
        }
    }

    /// Backoff before retry number `attempt` (0-based), doubling up to the ceiling
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// How long a range lock token stays valid, in milliseconds
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: default_lease_timeout_ms(),
        }
    }
}

impl SplitConfig {
    fn merge(&mut self, other: Self) {
        if other.lease_timeout_ms > 0 {
            self.lease_timeout_ms = other.lease_timeout_ms;
        }
    }

    /// Get lease timeout as Duration
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_propose_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_read_timeout_ms() -> u64 {
    2000 // 2 seconds
}

fn default_config_change_timeout_ms() -> u64 {
    10000 // 10 seconds
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    500
}

fn default_lease_timeout_ms() -> u64 {
    30000 // 30 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}
