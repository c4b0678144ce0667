//! Configuration Database Error Types

use thiserror::Error;

/// Result type alias for configuration database operations
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration database error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Messaging errors
    #[error("Message pool exhausted ({capacity} messages outstanding)")]
    PoolExhausted { capacity: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Send of {kind} failed: {status}")]
    SendFailed { kind: &'static str, status: String },

    #[error("Peer busy while sending {0}")]
    PeerBusy(&'static str),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("{kind} payload is {size} bytes, wire limit is {limit}")]
    PayloadTooLarge { kind: &'static str, size: usize, limit: usize },

    #[error("Version mismatch on {structure}: peer declared {declared} bytes, local size is {local}")]
    VersionMismatch { structure: &'static str, declared: usize, local: usize },

    // Replication errors
    #[error("Peer did not answer {kind} within {timeout_ms}ms ({phase})")]
    PeerTimeout { kind: &'static str, phase: &'static str, timeout_ms: u64 },

    #[error("Peer rejected {kind}: {reason}")]
    PeerRejected { kind: &'static str, reason: String },

    #[error("A confirmation is already pending on channel {0}")]
    ConfirmPending(&'static str),

    #[error("Peer has no landing region for {0}")]
    NoPeerRegion(&'static str),

    #[error("Configuration push aborted: {0}")]
    PushAborted(String),

    // Transaction errors
    #[error("Transaction {id} already in progress ({state})")]
    TransactionInProgress { id: u64, state: &'static str },

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction {table} array full ({limit} entries)")]
    TransactionFull { table: &'static str, limit: usize },

    // Table errors
    #[error("Table error: {0}")]
    Table(String),

    #[error("Entry index {index} out of range for {table} table (capacity {capacity})")]
    EntryOutOfRange { table: &'static str, index: usize, capacity: usize },

    // State errors
    #[error("Database not ready: {0}")]
    NotReady(String),

    #[error("Database is in service mode: {0}")]
    ServiceMode(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::PeerBusy(_)
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
        )
    }

    /// Check if this error means the node can no longer trust its peer's
    /// view of the core structures
    pub fn should_enter_service_mode(&self) -> bool {
        matches!(self, Error::VersionMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::PoolExhausted { capacity: 8 }.is_retryable());
        assert!(Error::PeerBusy("GetConfig").is_retryable());
        assert!(!Error::NoActiveTransaction.is_retryable());

        let mismatch = Error::VersionMismatch {
            structure: "system db header",
            declared: 600,
            local: 400,
        };
        assert!(mismatch.should_enter_service_mode());
        assert!(!mismatch.is_retryable());
        assert!(mismatch.to_string().contains("600"));
    }
}
