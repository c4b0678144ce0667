//! Configuration Database Configuration
//!
//! This module provides configuration structures for a configuration
//! database node and its inter-node replication engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDbConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Inter-node link configuration
    #[serde(default)]
    pub link: LinkConfig,

    /// Message pool and request/confirm configuration
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Table synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Configuration table sizing
    #[serde(default)]
    pub tables: TableConfig,

    /// Transaction staging limits
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Role a node takes when both nodes are present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredRole {
    Active,
    Passive,
}

impl fmt::Display for PreferredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreferredRole::Active => write!(f, "active"),
            PreferredRole::Passive => write!(f, "passive"),
        }
    }
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (e.g. "spa", "spb")
    pub id: String,

    /// Role to take when the peer is alive at boot
    #[serde(default = "default_preferred_role")]
    pub preferred_role: PreferredRole,

    /// Data directory for persisted configuration
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Inter-node link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Address to listen on for the peer
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Peer address to dial
    #[serde(default)]
    pub peer_address: Option<String>,

    /// Accept the link instead of dialing it
    #[serde(default)]
    pub listen: bool,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Delivery attempts while the receiver's pool is exhausted
    #[serde(default = "default_busy_retry_limit")]
    pub busy_retry_limit: u32,

    /// Delay between busy delivery attempts in milliseconds
    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,
}

/// Message pool and request/confirm configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Number of preallocated messages
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Messages kept free for higher-priority traffic during a table push
    #[serde(default = "default_reserved_headroom")]
    pub reserved_headroom: usize,

    /// Bound on each wait of a synchronous round trip
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Delay between allocation attempts when the pool is empty
    #[serde(default = "default_alloc_retry_ms")]
    pub alloc_retry_ms: u64,

    /// How long shutdown waits for outstanding messages
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

/// Table synchronization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// One message per valid entry
    Entry,
    /// Chunked copies of whole table images
    Bulk,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Entry => write!(f, "entry"),
            SyncMode::Bulk => write!(f, "bulk"),
        }
    }
}

/// Table synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Synchronization strategy used by the active node
    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,

    /// Entries sent between throttle pauses
    #[serde(default = "default_throttle_every")]
    pub throttle_every: usize,

    /// Throttle pause in milliseconds
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,

    /// Poll interval while waiting for pool headroom
    #[serde(default = "default_backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,

    /// Largest chunk of a bulk copy in bytes
    #[serde(default = "default_max_transfer_unit")]
    pub max_transfer_unit: usize,

    /// Poll interval of the passive node's update count check
    #[serde(default = "default_config_poll_interval_ms")]
    pub config_poll_interval_ms: u64,
}

/// Configuration table sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// User table entries
    #[serde(default = "default_user_capacity")]
    pub user_capacity: usize,

    /// Object table entries
    #[serde(default = "default_object_capacity")]
    pub object_capacity: usize,

    /// Edge slots per object
    #[serde(default = "default_edges_per_object")]
    pub edges_per_object: usize,

    /// System spare table entries
    #[serde(default = "default_system_spare_capacity")]
    pub system_spare_capacity: usize,

    /// Size of the key memory region in bytes
    #[serde(default = "default_key_memory_size")]
    pub key_memory_size: usize,
}

/// Transaction staging limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    #[serde(default = "default_max_user_entries")]
    pub max_user_entries: usize,

    #[serde(default = "default_max_object_entries")]
    pub max_object_entries: usize,

    #[serde(default = "default_max_edge_entries")]
    pub max_edge_entries: usize,

    #[serde(default = "default_max_global_info_entries")]
    pub max_global_info_entries: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_preferred_role() -> PreferredRole {
    PreferredRole::Active
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/configdb")
}

fn default_bind_address() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_busy_retry_limit() -> u32 {
    1000
}

fn default_busy_retry_delay_ms() -> u64 {
    1
}

fn default_pool_capacity() -> usize {
    256
}

fn default_reserved_headroom() -> usize {
    50
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_alloc_retry_ms() -> u64 {
    10
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Entry
}

fn default_throttle_every() -> usize {
    10
}

fn default_throttle_delay_ms() -> u64 {
    1
}

fn default_backpressure_poll_ms() -> u64 {
    500
}

fn default_max_transfer_unit() -> usize {
    4096
}

fn default_config_poll_interval_ms() -> u64 {
    100
}

fn default_user_capacity() -> usize {
    512
}

fn default_object_capacity() -> usize {
    1024
}

fn default_edges_per_object() -> usize {
    4
}

fn default_system_spare_capacity() -> usize {
    64
}

fn default_key_memory_size() -> usize {
    8192
}

fn default_max_user_entries() -> usize {
    64
}

fn default_max_object_entries() -> usize {
    64
}

fn default_max_edge_entries() -> usize {
    128
}

fn default_max_global_info_entries() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "spa".to_string(),
            preferred_role: default_preferred_role(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            peer_address: None,
            listen: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            busy_retry_limit: default_busy_retry_limit(),
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            reserved_headroom: default_reserved_headroom(),
            sync_timeout_ms: default_sync_timeout_ms(),
            alloc_retry_ms: default_alloc_retry_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: default_sync_mode(),
            throttle_every: default_throttle_every(),
            throttle_delay_ms: default_throttle_delay_ms(),
            backpressure_poll_ms: default_backpressure_poll_ms(),
            max_transfer_unit: default_max_transfer_unit(),
            config_poll_interval_ms: default_config_poll_interval_ms(),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            user_capacity: default_user_capacity(),
            object_capacity: default_object_capacity(),
            edges_per_object: default_edges_per_object(),
            system_spare_capacity: default_system_spare_capacity(),
            key_memory_size: default_key_memory_size(),
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_user_entries: default_max_user_entries(),
            max_object_entries: default_max_object_entries(),
            max_edge_entries: default_max_edge_entries(),
            max_global_info_entries: default_max_global_info_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ConfigDbConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            link: LinkConfig::default(),
            messaging: MessagingConfig::default(),
            sync: SyncConfig::default(),
            tables: TableConfig::default(),
            transaction: TransactionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConfigDbConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConfigDbConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ConfigDbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.messaging.pool_capacity == 0 {
            return Err(crate::Error::Config("messaging.pool_capacity must be positive".into()));
        }

        if self.messaging.reserved_headroom >= self.messaging.pool_capacity {
            return Err(crate::Error::Config(format!(
                "messaging.reserved_headroom ({}) must be smaller than pool_capacity ({})",
                self.messaging.reserved_headroom, self.messaging.pool_capacity
            )));
        }

        if self.sync.max_transfer_unit == 0 {
            return Err(crate::Error::Config("sync.max_transfer_unit must be positive".into()));
        }

        if self.sync.throttle_every == 0 {
            return Err(crate::Error::Config("sync.throttle_every must be positive".into()));
        }

        if self.tables.user_capacity == 0
            || self.tables.object_capacity == 0
            || self.tables.edges_per_object == 0
        {
            return Err(crate::Error::Config("table capacities must be positive".into()));
        }

        if !self.link.listen && self.link.peer_address.as_deref() == Some("") {
            return Err(crate::Error::Config("link.peer_address cannot be empty".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Outstanding-message count at which a table push pauses
    pub fn backpressure_threshold(&self) -> usize {
        self.messaging.pool_capacity - self.messaging.reserved_headroom
    }

    /// Get the synchronous round trip bound as Duration
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.messaging.sync_timeout_ms)
    }

    /// Get the allocation retry delay as Duration
    pub fn alloc_retry(&self) -> Duration {
        Duration::from_millis(self.messaging.alloc_retry_ms)
    }

    /// Get the pool drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.messaging.drain_timeout_ms)
    }

    /// Get the throttle pause as Duration
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.sync.throttle_delay_ms)
    }

    /// Get the backpressure poll interval as Duration
    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.sync.backpressure_poll_ms)
    }

    /// Get the passive update count poll interval as Duration
    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.config_poll_interval_ms)
    }

    /// Get the reconnect interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.link.reconnect_interval_ms)
    }

    /// Get the busy delivery retry delay as Duration
    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.link.busy_retry_delay_ms)
    }

    /// Number of edge slots in the edge table
    pub fn edge_capacity(&self) -> usize {
        self.tables.object_capacity * self.tables.edges_per_object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "spb"
preferred_role = "passive"
data_dir = "/var/lib/configdb"

[link]
peer_address = "10.0.0.1:7400"

[messaging]
pool_capacity = 50
reserved_headroom = 10

[sync]
mode = "bulk"
max_transfer_unit = 1024
"#;

        let config = ConfigDbConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "spb");
        assert_eq!(config.node.preferred_role, PreferredRole::Passive);
        assert_eq!(config.sync.mode, SyncMode::Bulk);
        assert_eq!(config.backpressure_threshold(), 40);
        assert_eq!(config.sync_timeout(), Duration::from_secs(30));
        assert_eq!(config.sync.throttle_every, 10);
    }

    #[test]
    fn test_headroom_must_leave_room() {
        let toml = r#"
[node]
id = "spa"

[messaging]
pool_capacity = 10
reserved_headroom = 10
"#;
        assert!(ConfigDbConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ConfigDbConfig::default();
        config.validate().unwrap();
        assert_eq!(config.edge_capacity(), 4096);
    }
}
