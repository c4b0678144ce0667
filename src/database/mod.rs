//! Database Module
//!
//! Configuration tables, node state and the durable storage boundary.

pub mod tables;
pub mod state;
pub mod storage;

pub use tables::{
    ConfigEntry, ConfigSnapshot, ConfigTable, ConfigTables, EdgeEntry, EntryHeader, EntryState,
    GlobalInfo, GlobalInfoEntry, ObjectEntry, ObjectId, SystemDbHeader, SystemSpareEntry,
    TableEntry, TableType, UserEntry,
};
pub use state::{
    DatabaseState, NodeRole, PeerState, PoolStats, ServiceModeReason, ServiceState,
    StatusSnapshot,
};
pub use storage::{
    persist_tables, DurableStorage, FileStorage, LoggingObjectBuilder, MemoryStorage, NonPagedMetadata,
    ObjectBuilder,
};
