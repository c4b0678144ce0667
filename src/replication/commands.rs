//! Command Replication
//!
//! Configuration commands run their business handler on the initiating
//! node and are then replicated to the peer, whose handler result comes
//! back as the confirmation. Handlers change tables only by staging
//! entries into the current transaction.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::state::ServiceState;
use crate::database::tables::{
    ConfigEntry, ConfigTables, EdgeEntry, EntryHeader, EntryState, GlobalInfoEntry, ObjectEntry, UserEntry,
};
use crate::error::{Error, Result};
use crate::replication::protocol::{
    ConfirmError, ConfirmPayload, EdgePayload, Message, MessageKind, ObjectConfigPayload, Status,
};
use crate::replication::sync::{Messenger, SyncOutcome};
use crate::replication::transaction::TransactionManager;

/// What a command handler may touch
pub struct CommandContext {
    transactions: Arc<TransactionManager>,
    tables: Arc<RwLock<ConfigTables>>,
    state: Arc<ServiceState>,
}

impl CommandContext {
    pub fn new(
        transactions: Arc<TransactionManager>,
        tables: Arc<RwLock<ConfigTables>>,
        state: Arc<ServiceState>,
    ) -> Self {
        Self {
            transactions,
            tables,
            state,
        }
    }

    /// Stage an entry. On the active node it goes into the local
    /// transaction; on the passive node into the mirrored one, or straight
    /// into the tables when no transaction is open.
    pub async fn stage(&self, entry: ConfigEntry) -> Result<()> {
        if self.state.is_active() {
            return self.transactions.stage(entry).await;
        }
        if !self.transactions.stage_mirrored(entry.clone())? {
            self.tables.write().apply(&entry)?;
        }
        Ok(())
    }

    pub fn tables(&self) -> &Arc<RwLock<ConfigTables>> {
        &self.tables
    }
}

/// Business logic of one command kind
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, message: &Message, context: &CommandContext) -> Result<()>;
}

fn is_key_command(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::SetupEncryptionKeys
            | MessageKind::RekeyEncryptionKeys
            | MessageKind::UpdateDriveKeys
            | MessageKind::ConnectDrive
    )
}

/// Handlers by command kind
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<MessageKind, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry mapping every object, edge and global-setting command to a
    /// [`StagingHandler`]. Key commands are left to the caller.
    pub fn with_staging_handlers() -> Self {
        let mut registry = Self::new();
        let handler: Arc<dyn CommandHandler> = Arc::new(StagingHandler);
        for kind in MessageKind::ALL.iter().copied() {
            if kind.is_command() && !is_key_command(kind) {
                registry.handlers.insert(kind, handler.clone());
            }
        }
        registry
    }

    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn CommandHandler>) -> Result<()> {
        if !kind.is_command() {
            return Err(Error::Protocol(format!("{} is not a command", kind)));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: MessageKind) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Turns object, edge and global-setting commands into staged entries
pub struct StagingHandler;

impl StagingHandler {
    fn object_entries(kind: MessageKind, payload: &ObjectConfigPayload) -> Vec<ConfigEntry> {
        let update = matches!(
            kind,
            MessageKind::UpdatePvd | MessageKind::UpdateVd | MessageKind::UpdateRaid | MessageKind::UpdateLun
        );
        let state = if update {
            EntryState::Modify
        } else {
            EntryState::Create
        };
        let mut entries = vec![ConfigEntry::Object(ObjectEntry {
            header: EntryHeader::new(payload.object_id, state),
            class_id: payload.class_id,
            set_config: payload.config,
        })];
        if payload.user_data.iter().any(|word| *word != 0) {
            entries.push(ConfigEntry::User(UserEntry {
                header: EntryHeader::new(payload.object_id, state),
                class_id: payload.class_id,
                user_data: payload.user_data,
            }));
        }
        entries
    }

    fn edge_entry(kind: MessageKind, payload: &EdgePayload) -> ConfigEntry {
        let state = if kind == MessageKind::DestroyEdge {
            EntryState::Destroy
        } else {
            EntryState::Create
        };
        ConfigEntry::Edge(EdgeEntry {
            header: EntryHeader::new(payload.client_id, state),
            client_index: payload.client_index,
            server_id: payload.server_id,
            capacity: payload.capacity,
            offset: payload.offset,
        })
    }
}

#[async_trait]
impl CommandHandler for StagingHandler {
    async fn handle(&self, message: &Message, context: &CommandContext) -> Result<()> {
        let kind = message.kind();
        let entries = match message {
            Message::CreatePvd(p)
            | Message::UpdatePvd(p)
            | Message::CreateVd(p)
            | Message::UpdateVd(p)
            | Message::CreateRaid(p)
            | Message::UpdateRaid(p)
            | Message::CreateLun(p)
            | Message::UpdateLun(p)
            | Message::CloneObject(p)
            | Message::CreateExtentPool(p)
            | Message::CreateExtentPoolLun(p) => Self::object_entries(kind, p),
            Message::DestroyPvd(p)
            | Message::DestroyVd(p)
            | Message::DestroyRaid(p)
            | Message::DestroyLun(p)
            | Message::DestroyExtentPool(p)
            | Message::DestroyExtentPoolLun(p) => vec![ConfigEntry::Object(ObjectEntry {
                header: EntryHeader::new(p.object_id, EntryState::Destroy),
                ..Default::default()
            })],
            Message::CreateEdge(p) | Message::DestroyEdge(p) => vec![Self::edge_entry(kind, p)],
            Message::UpdatePowerSave(p)
            | Message::UpdateEncryptionMode(p)
            | Message::UpdateSpareConfig(p)
            | Message::UpdateTimeThreshold(p)
            | Message::SetBgServiceFlag(p)
            | Message::UpdateGlobalPvdConfig(p)
            | Message::PauseEncryption(p) => {
                let mut entry = GlobalInfoEntry::new(p.info.clone());
                entry.header.state = EntryState::Modify;
                vec![ConfigEntry::GlobalInfo(entry)]
            }
            Message::CommitUpdateTable(p) => {
                tracing::debug!("{} table update committed by transaction {}", p.table, p.transaction_id);
                Vec::new()
            }
            other => {
                return Err(Error::Protocol(format!("{} has no staging rule", other.kind())));
            }
        };
        for entry in entries {
            context.stage(entry).await?;
        }
        Ok(())
    }
}

/// Runs commands locally and on the peer
pub struct CommandReplicator {
    messenger: Arc<Messenger>,
    state: Arc<ServiceState>,
    registry: CommandRegistry,
    context: Arc<CommandContext>,
}

impl CommandReplicator {
    pub fn new(
        messenger: Arc<Messenger>,
        state: Arc<ServiceState>,
        registry: CommandRegistry,
        context: CommandContext,
    ) -> Self {
        Self {
            messenger,
            state,
            registry,
            context: Arc::new(context),
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Replicate a command to the peer and wait for its result
    pub async fn replicate(&self, message: Message) -> Result<SyncOutcome> {
        let kind = message.kind();
        if !kind.is_command() {
            return Err(Error::Protocol(format!("{} is not a command", kind)));
        }
        if !self.messenger.peer_update_allowed() {
            tracing::debug!("{} not replicated, peer updates not allowed", kind);
            return Ok(SyncOutcome::Unilateral);
        }
        self.messenger.call(message).await?.check(kind)
    }

    /// Run a command's local handler, then replicate it
    pub async fn execute(&self, message: Message) -> Result<SyncOutcome> {
        if let Some(handler) = self.registry.get(message.kind()) {
            handler.handle(&message, &self.context).await?;
        }
        self.replicate(message).await
    }

    /// Handle a command received from the peer and confirm it
    pub async fn receive(&self, message: Message) {
        let kind = message.kind();
        if !self.state.is_ready() {
            tracing::debug!("{} acknowledged without applying, database not ready", kind);
            self.messenger.confirm(kind, ConfirmPayload::default());
            return;
        }
        let Some(handler) = self.registry.get(kind) else {
            tracing::warn!("No handler registered for {}", kind);
            self.messenger.confirm(
                kind,
                ConfirmPayload {
                    status: Status::Failed,
                    err: ConfirmError::NoHandler,
                    ..Default::default()
                },
            );
            return;
        };

        if kind.is_destroy() {
            // Destroys may run long; the worker moves on and the confirm
            // follows when the handler finishes
            let messenger = self.messenger.clone();
            let context = self.context.clone();
            tokio::spawn(async move {
                let result = handler.handle(&message, &context).await;
                messenger.confirm(kind, handler_confirm(kind, &result));
            });
            return;
        }

        let result = handler.handle(&message, &self.context).await;
        self.messenger.confirm(kind, handler_confirm(kind, &result));
    }
}

fn handler_confirm(kind: MessageKind, result: &Result<()>) -> ConfirmPayload {
    if let Err(e) = result {
        tracing::warn!("Handler for {} failed: {}", kind, e);
    }
    ConfirmPayload {
        status: Status::from_result(result),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionConfig;
    use crate::database::state::{DatabaseState, NodeRole};
    use crate::database::storage::MemoryStorage;
    use crate::database::tables::{GlobalInfo, TableEntry};
    use crate::replication::protocol::{GlobalInfoPayload, ObjectDestroyPayload, TransactionStartPayload};
    use crate::replication::testing;
    use std::time::Duration;

    struct Fixture {
        replicator: CommandReplicator,
        transactions: Arc<TransactionManager>,
        tables: Arc<RwLock<ConfigTables>>,
        state: Arc<ServiceState>,
        _solo: testing::Solo,
    }

    fn fixture(role: NodeRole) -> Fixture {
        let state = Arc::new(ServiceState::new(role));
        state.set_state(DatabaseState::Ready);
        let solo = testing::solo(state.clone(), 8);
        let tables = Arc::new(RwLock::new(ConfigTables::with_defaults(&testing::small_tables())));
        let transactions = Arc::new(TransactionManager::new(
            solo.messenger.clone(),
            state.clone(),
            tables.clone(),
            MemoryStorage::new().shared(),
            TransactionConfig::default(),
        ));
        let context = CommandContext::new(transactions.clone(), tables.clone(), state.clone());
        let replicator = CommandReplicator::new(
            solo.messenger.clone(),
            state.clone(),
            CommandRegistry::with_staging_handlers(),
            context,
        );
        Fixture {
            replicator,
            transactions,
            tables,
            state,
            _solo: solo,
        }
    }

    fn create_vd(id: u32) -> Message {
        Message::CreateVd(ObjectConfigPayload {
            object_id: id,
            class_id: 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_key_commands_have_no_default_handler() {
        let registry = CommandRegistry::with_staging_handlers();
        assert!(registry.get(MessageKind::CreateLun).is_some());
        assert!(registry.get(MessageKind::UpdatePowerSave).is_some());
        assert!(registry.get(MessageKind::SetupEncryptionKeys).is_none());
        assert!(registry.get(MessageKind::CreateLunConfirm).is_none());

        let mut registry = CommandRegistry::new();
        assert!(registry
            .register(MessageKind::TransactionStart, Arc::new(StagingHandler))
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_stages_locally_and_continues_without_peer() {
        let f = fixture(NodeRole::Active);
        f.transactions.start(Default::default(), 1).await.unwrap();
        let outcome = f.replicator.execute(create_vd(6)).await.unwrap();
        assert!(outcome.is_unilateral());
        let staged = f.transactions.current();
        assert_eq!(staged.object.len(), 1);
        assert_eq!(staged.object[0].class_id, 4);

        let info = Message::UpdatePowerSave(GlobalInfoPayload {
            transaction_id: staged.id,
            info: GlobalInfo::PowerSave {
                enabled: true,
                idle_time_secs: 10,
            },
        });
        f.replicator.execute(info).await.unwrap();
        f.transactions.commit().await.unwrap();
        assert!(f.tables.read().object.get(6).unwrap().is_valid());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_outside_transaction_fails() {
        let f = fixture(NodeRole::Active);
        assert!(matches!(
            f.replicator.execute(create_vd(2)).await,
            Err(Error::NoActiveTransaction)
        ));
        assert!(f
            .replicator
            .replicate(Message::TransactionStart(TransactionStartPayload::default()))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_received_commands_stage_into_mirror() {
        let f = fixture(NodeRole::Passive);
        let start = TransactionStartPayload {
            transaction_id: 5,
            job_number: 2,
            ..Default::default()
        };
        f.transactions.on_start(&start).await;
        f.replicator.receive(create_vd(3)).await;
        assert_eq!(f.transactions.current().object.len(), 1);

        f.replicator
            .receive(Message::DestroyVd(ObjectDestroyPayload {
                transaction_id: 5,
                object_id: 9,
            }))
            .await;
        // The destroy handler runs on its own task
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.transactions.current().object.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_received_commands_apply_without_transaction() {
        let f = fixture(NodeRole::Passive);
        f.replicator.receive(create_vd(4)).await;
        assert!(f.tables.read().object.get(4).unwrap().is_valid());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_booting_node_acknowledges_without_applying() {
        let f = fixture(NodeRole::Passive);
        let booting = Arc::new(ServiceState::new(NodeRole::Passive));
        let replicator = CommandReplicator::new(
            f.replicator.messenger.clone(),
            booting,
            CommandRegistry::with_staging_handlers(),
            CommandContext::new(f.transactions.clone(), f.tables.clone(), f.state.clone()),
        );
        replicator.receive(create_vd(5)).await;
        assert!(!f.tables.read().object.get(5).unwrap().is_valid());
    }
}
