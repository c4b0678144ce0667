//! configdb - Dual-Node Configuration Database
//!
//! Keeps the configuration tables of two storage controller nodes in sync.
//! One node is active and owns the configuration; the passive node mirrors
//! it and takes over when the active node goes away.
//!
//! # Architecture
//!
//! Every inter-node event lands on one work queue drained by a single
//! worker. Messages come from a bounded pool whose outstanding count drives
//! backpressure. On top of that sit synchronous request/confirm calls,
//! replicated transactions and commands, and the configuration push that
//! brings a booting passive node up to date.
//!
//! # Features
//!
//! - Fixed-capacity message pool with index handles
//! - Entry-by-entry or bulk table synchronization with completion gating
//! - Two-phase transaction replication
//! - Version negotiation for unknown and oversized messages
//! - Active takeover on peer loss, terminal service mode on mismatches
//! - Loopback and TCP transports

pub mod config;
pub mod error;
pub mod database;
pub mod messaging;
pub mod replication;
pub mod orchestrator;
pub mod engine;

pub use config::ConfigDbConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ConfigDbConfig;
    pub use crate::error::{Error, Result};
    pub use crate::database::{ConfigEntry, ConfigTables, DatabaseState, NodeRole};
    pub use crate::engine::{EngineBuilder, ReplicationEngine};
    pub use crate::replication::{Message, TransactionType};
}
