//! Replication Module
//!
//! Inter-node replication of the configuration database: the wire
//! protocol, synchronous request/confirm calls, version negotiation,
//! transaction and command mirroring and the configuration push.

pub mod protocol;
pub mod sync;
pub mod version;
pub mod transaction;
pub mod bulk;
pub mod commands;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{ConfirmError, ConfirmPayload, Message, MessageHeader, MessageKind, Status, TransactionType};
pub use sync::{ConfirmChannel, Messenger, SyncOutcome};
pub use version::{check_unknown_message_handling, software_version, OversizedAction};
pub use transaction::{Transaction, TransactionManager, TransactionState};
pub use bulk::TableSync;
pub use commands::{CommandContext, CommandHandler, CommandRegistry, CommandReplicator, StagingHandler};
