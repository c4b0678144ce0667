//! Replication Engine
//!
//! The context object owning one node's message pool, worker, tables and
//! protocol components. Built once at startup and torn down once.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ConfigDbConfig, PreferredRole};
use crate::database::state::{
    DatabaseState, NodeRole, ServiceModeReason, ServiceState, StatusSnapshot,
};
use crate::database::storage::{DurableStorage, FileStorage, LoggingObjectBuilder, ObjectBuilder};
use crate::database::tables::{ConfigEntry, ConfigTables};
use crate::error::{Error, Result};
use crate::messaging::{
    spawn_worker, ClientId, Dispatch, InboundMessage, MessagePool, Transport, TransportAdapter, WorkQueue,
    WorkerEvents,
};
use crate::orchestrator::Orchestrator;
use crate::replication::bulk::TableSync;
use crate::replication::commands::{CommandContext, CommandRegistry, CommandReplicator};
use crate::replication::protocol::{
    self, ConfirmError, ConfirmPayload, Message, MessageKind, Status, TransactionType,
};
use crate::replication::sync::{Messenger, SyncOutcome};
use crate::replication::transaction::TransactionManager;
use crate::replication::version::{self, OversizedAction};

/// Builder for a [`ReplicationEngine`]
pub struct EngineBuilder {
    config: ConfigDbConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn DurableStorage>>,
    objects: Option<Arc<dyn ObjectBuilder>>,
    registry: CommandRegistry,
    version: Option<u64>,
}

impl EngineBuilder {
    pub fn new(config: ConfigDbConfig) -> Self {
        Self {
            config,
            transport: None,
            storage: None,
            objects: None,
            registry: CommandRegistry::with_staging_handlers(),
            version: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Durable storage; defaults to JSON files under `node.data_dir`
    pub fn storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn object_builder(mut self, objects: Arc<dyn ObjectBuilder>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Replace the command handlers
    pub fn commands(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Report a software version other than this build's
    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn build(self) -> Result<Arc<ReplicationEngine>> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("a transport is required".into()))?;
        let storage: Arc<dyn DurableStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(FileStorage::new(config.data_dir())?),
        };
        let objects = self
            .objects
            .unwrap_or_else(|| Arc::new(LoggingObjectBuilder::new()));
        let version = self.version.unwrap_or_else(version::software_version);

        let initial_role = match config.node.preferred_role {
            PreferredRole::Active => NodeRole::Active,
            PreferredRole::Passive => NodeRole::Passive,
        };
        let state = Arc::new(ServiceState::new(initial_role));
        let pool = Arc::new(MessagePool::new(
            config.messaging.pool_capacity,
            protocol::max_message_size(),
        ));
        let queue = Arc::new(WorkQueue::new());
        let adapter = TransportAdapter::new(ClientId::DATABASE, pool.clone(), queue.clone(), transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let messenger = Arc::new(Messenger::new(
            adapter.clone(),
            state.clone(),
            version,
            config.sync_timeout(),
            config.alloc_retry(),
            shutdown_rx,
        ));

        let tables = Arc::new(RwLock::new(ConfigTables::new(&config.tables)));
        let sync = Arc::new(TableSync::new(
            messenger.clone(),
            state.clone(),
            tables.clone(),
            config.sync.clone(),
            config.backpressure_threshold(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            messenger.clone(),
            state.clone(),
            tables.clone(),
            storage.clone(),
            config.transaction.clone(),
        ));
        let commands = Arc::new(CommandReplicator::new(
            messenger.clone(),
            state.clone(),
            self.registry,
            CommandContext::new(transactions.clone(), tables.clone(), state.clone()),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            state.clone(),
            messenger.clone(),
            tables.clone(),
            storage,
            objects,
            sync.clone(),
            transactions.clone(),
            queue.clone(),
        ));

        Ok(Arc::new(ReplicationEngine {
            config,
            state,
            pool,
            queue,
            adapter,
            messenger,
            tables,
            sync,
            transactions,
            commands,
            orchestrator,
            shutdown_tx,
            worker: Mutex::new(None),
        }))
    }
}

/// One node of the replicated configuration database
pub struct ReplicationEngine {
    config: Arc<ConfigDbConfig>,
    state: Arc<ServiceState>,
    pool: Arc<MessagePool>,
    queue: Arc<WorkQueue>,
    adapter: Arc<TransportAdapter>,
    messenger: Arc<Messenger>,
    tables: Arc<RwLock<ConfigTables>>,
    sync: Arc<TableSync>,
    transactions: Arc<TransactionManager>,
    commands: Arc<CommandReplicator>,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Attach to the transport, start the worker and begin booting
    pub async fn start(self: &Arc<Self>) -> Result<NodeRole> {
        tracing::info!(
            "Starting node {} (version {:#x})",
            self.config.node.id,
            self.messenger.version()
        );
        self.adapter.attach()?;

        let dispatch = Arc::new(EngineDispatch {
            messenger: self.messenger.clone(),
            state: self.state.clone(),
            orchestrator: self.orchestrator.clone(),
            transactions: self.transactions.clone(),
            commands: self.commands.clone(),
        });
        let worker = spawn_worker(
            self.queue.clone(),
            self.pool.clone(),
            dispatch,
            self.shutdown_tx.subscribe(),
        );
        *self.worker.lock() = Some(worker);

        self.orchestrator.start().await
    }

    /// Wait until the node is ready. Service mode and failure end the wait
    /// with an error.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| {
                matches!(s, DatabaseState::Ready | DatabaseState::Failed | DatabaseState::Corrupt)
                    || s.is_service_mode()
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        match state {
            DatabaseState::Ready => Ok(()),
            DatabaseState::ServiceMode(reason) => Err(Error::ServiceMode(reason.to_string())),
            other => Err(Error::NotReady(other.to_string())),
        }
    }

    /// Let outstanding sends settle, then stop the worker and release the
    /// transport
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.config.node.id);
        self.sync.stop();
        self.messenger.unblock_all();
        if !self.pool.drain(self.config.drain_timeout()).await {
            tracing::debug!("Releasing the transport with messages outstanding");
        }

        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.adapter.detach() {
            tracing::warn!("Transport detach failed: {}", e);
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state.state() {
            DatabaseState::Ready => Ok(()),
            DatabaseState::ServiceMode(reason) => Err(Error::ServiceMode(reason.to_string())),
            other => Err(Error::NotReady(other.to_string())),
        }
    }

    // ========== Transactions ==========

    pub async fn start_transaction(&self, transaction_type: TransactionType, job_number: u64) -> Result<u64> {
        self.ensure_ready()?;
        self.transactions.start(transaction_type, job_number).await
    }

    pub async fn stage(&self, entry: ConfigEntry) -> Result<()> {
        self.ensure_ready()?;
        self.transactions.stage(entry).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.ensure_ready()?;
        self.transactions.commit().await
    }

    /// Abort and invalidate only end the transaction a gated
    /// `start_transaction` opened, so they still run after the node left
    /// READY.
    pub async fn abort(&self) -> Result<()> {
        self.transactions.abort().await
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.transactions.invalidate().await
    }

    /// Run a configuration command here and on the peer
    pub async fn execute(&self, command: Message) -> Result<SyncOutcome> {
        self.ensure_ready()?;
        self.commands.execute(command).await
    }

    /// Probe that the peer answers unknown message kinds
    pub async fn check_unknown_message_handling(&self) -> Result<bool> {
        version::check_unknown_message_handling(&self.messenger).await
    }

    // ========== Observation ==========

    pub fn state(&self) -> DatabaseState {
        self.state.state()
    }

    pub fn role(&self) -> NodeRole {
        self.state.role()
    }

    pub fn subscribe(&self) -> watch::Receiver<DatabaseState> {
        self.state.subscribe()
    }

    pub fn service_state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    pub fn tables(&self) -> &Arc<RwLock<ConfigTables>> {
        &self.tables
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn config(&self) -> &ConfigDbConfig {
        &self.config
    }

    pub fn status(&self) -> StatusSnapshot {
        let (valid_entries, generation) = {
            let tables = self.tables.read();
            (tables.valid_count(), tables.generation())
        };
        StatusSnapshot {
            node_id: self.config.node.id.clone(),
            state: self.state.state().to_string(),
            role: self.state.role(),
            peer_state: self.state.peer_state(),
            peer_alive: self.messenger.is_peer_alive(),
            updates_sent_by_active: self.state.updates_sent_by_active(),
            updates_received: self.state.updates_received(),
            updates_sent: self.state.updates_sent(),
            peer_version: self.state.peer_version(),
            ndu_in_progress: self.state.ndu_in_progress(),
            peer_service_mode: self.state.peer_service_mode(),
            valid_entries,
            generation,
            pool: self.pool.stats(),
        }
    }
}

/// Routes worker items to the protocol components
struct EngineDispatch {
    messenger: Arc<Messenger>,
    state: Arc<ServiceState>,
    orchestrator: Arc<Orchestrator>,
    transactions: Arc<TransactionManager>,
    commands: Arc<CommandReplicator>,
}

impl EngineDispatch {
    fn refuse_undecodable(&self, kind: MessageKind) {
        tracing::warn!("Could not decode {} from peer", kind);
        if kind.confirm_for().is_some() {
            self.messenger.confirm(
                kind,
                ConfirmPayload {
                    status: Status::Failed,
                    err: ConfirmError::None,
                    ..Default::default()
                },
            );
        }
    }

    async fn route(&self, message: Message, inbound: &InboundMessage) {
        let kind = message.kind();
        if kind.is_confirm() {
            if let Some(confirm) = message.as_confirm() {
                self.messenger.resolve(kind, confirm);
            }
            return;
        }

        match message {
            Message::GetConfig(p) => self.orchestrator.on_get_config(p),
            Message::UpdateConfig(p) => self.orchestrator.on_update_config(&p),
            Message::UpdateConfigDone(p) => self.orchestrator.on_config_done(&p),
            Message::UpdateConfigPassiveInitDone(p) => self.orchestrator.on_passive_init_done(&p),
            Message::UpdateConfigTable(p) => self.orchestrator.on_table_chunk(&p, inbound.bulk.as_ref()),
            Message::UpdateSystemDbHeader(p) => self.orchestrator.on_system_db_header(&p),
            Message::DbServiceMode(p) => self.orchestrator.on_peer_service_mode(&p),
            Message::UnknownMsgType(p) => version::on_unknown_type(&self.messenger, &p),
            Message::UnknownMsgSize(p) => version::on_unknown_size(&self.messenger, &p),
            Message::UnknownForTest(_) => version::reject_unknown_kind(&self.messenger, &inbound.header),
            Message::TransactionStart(p) => {
                let confirm = self.transactions.on_start(&p).await;
                self.messenger.confirm(kind, confirm);
            }
            Message::TransactionCommit(p) => {
                let confirm = self.transactions.on_commit(&p).await;
                self.messenger.confirm(kind, confirm);
            }
            Message::TransactionAbort(p) | Message::TransactionInvalidate(p) => {
                let confirm = self.transactions.on_end(kind, &p).await;
                self.messenger.confirm(kind, confirm);
            }
            command if kind.is_command() => self.commands.receive(command).await,
            _ => tracing::debug!("{} has no receiver", kind),
        }
    }
}

#[async_trait]
impl Dispatch for EngineDispatch {
    async fn message_received(&self, inbound: InboundMessage) {
        let kind = match inbound.header.known_kind() {
            Some(kind) => kind,
            None => {
                version::reject_unknown_kind(&self.messenger, &inbound.header);
                return;
            }
        };

        if inbound.oversized {
            match version::handle_oversized(&self.messenger, &inbound.header, kind) {
                OversizedAction::Process => {}
                OversizedAction::Rejected => return,
                OversizedAction::ServiceMode => {
                    self.orchestrator
                        .enter_service_mode(ServiceModeReason::VersionMismatch);
                    return;
                }
            }
        }

        let Some(message) = inbound.message.clone() else {
            self.refuse_undecodable(kind);
            return;
        };
        tracing::trace!("Received {} in state {}", kind, self.state.state());
        self.route(message, &inbound).await;
    }

    async fn peer_lost(&self) {
        self.orchestrator.peer_lost().await;
    }

    async fn events(&self, events: WorkerEvents) {
        self.orchestrator.on_events(events).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncMode, TableConfig};
    use crate::database::storage::MemoryStorage;
    use crate::database::tables::{
        ConfigSnapshot, EdgeEntry, EntryHeader, EntryState, ObjectEntry, SystemDbHeader, TableEntry, UserEntry,
    };
    use crate::database::state::PeerState;
    use crate::messaging::{Completion, LinkControl, LoopbackTransport, Side};
    use crate::replication::protocol::SystemDbHeaderPayload;
    use crate::replication::transaction::TransactionState;
    use std::time::Duration;

    struct Pair {
        a: Arc<ReplicationEngine>,
        b: Arc<ReplicationEngine>,
        control: LinkControl,
        b_storage: Arc<MemoryStorage>,
    }

    impl Pair {
        async fn shutdown(self) {
            self.a.shutdown().await;
            self.b.shutdown().await;
        }
    }

    fn tables_config(key_memory_size: usize) -> TableConfig {
        TableConfig {
            user_capacity: 512,
            object_capacity: 512,
            edges_per_object: 1,
            system_spare_capacity: 4,
            key_memory_size,
        }
    }

    fn node_config(id: &str, role: PreferredRole, tables: TableConfig) -> ConfigDbConfig {
        let mut config = ConfigDbConfig::default();
        config.node.id = id.into();
        config.node.preferred_role = role;
        config.link.connect_timeout_ms = 2000;
        config.messaging.sync_timeout_ms = 2000;
        config.messaging.alloc_retry_ms = 1;
        config.messaging.drain_timeout_ms = 100;
        config.sync.config_poll_interval_ms = 5;
        config.sync.backpressure_poll_ms = 10;
        config.tables = tables;
        config
    }

    fn build_pair(a: ConfigDbConfig, b: ConfigDbConfig, snapshot: ConfigSnapshot) -> Pair {
        let (ta, tb, control) = LoopbackTransport::pair(1000, Duration::from_millis(1));
        let b_storage = MemoryStorage::new().shared();
        let a = EngineBuilder::new(a)
            .transport(Arc::new(ta))
            .storage(MemoryStorage::with_snapshot(snapshot).shared())
            .build()
            .unwrap();
        let b = EngineBuilder::new(b)
            .transport(Arc::new(tb))
            .storage(b_storage.clone())
            .build()
            .unwrap();
        Pair { a, b, control, b_storage }
    }

    async fn start(pair: &Pair) {
        let (ra, rb) = tokio::join!(pair.a.start(), pair.b.start());
        assert_eq!(ra.unwrap(), NodeRole::Active);
        assert_eq!(rb.unwrap(), NodeRole::Passive);
    }

    async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    fn snapshot_with(config: &TableConfig, users: u32, objects: u32, edges: u32) -> ConfigSnapshot {
        let mut tables = ConfigTables::new(config);
        for id in 0..users {
            tables
                .apply(&ConfigEntry::User(UserEntry {
                    header: EntryHeader::new(id, EntryState::Valid),
                    class_id: 1,
                    ..Default::default()
                }))
                .unwrap();
        }
        for id in 0..objects {
            tables
                .apply(&ConfigEntry::Object(ObjectEntry {
                    header: EntryHeader::new(id, EntryState::Valid),
                    class_id: 2,
                    ..Default::default()
                }))
                .unwrap();
        }
        for id in 0..edges {
            tables
                .apply(&ConfigEntry::Edge(EdgeEntry {
                    header: EntryHeader::new(id, EntryState::Valid),
                    server_id: id + 1,
                    ..Default::default()
                }))
                .unwrap();
        }
        tables.snapshot()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_configuration_completes_with_zero_updates() {
        let tables = tables_config(0);
        let pair = build_pair(
            node_config("a", PreferredRole::Active, tables.clone()),
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();

        let b = pair.b.status();
        assert_eq!(b.updates_sent_by_active, 0);
        assert_eq!(b.updates_received, 0);
        assert!(eventually(Duration::from_secs(2), || pair.a.service_state().peer_state() == PeerState::Ready).await);
        assert_eq!(pair.a.status().updates_sent, 0);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entry_stream_pauses_at_headroom_and_completes() {
        let tables = tables_config(0);
        let mut a = node_config("a", PreferredRole::Active, tables.clone());
        a.messaging.pool_capacity = 50;
        a.messaging.reserved_headroom = 10;
        a.sync.throttle_every = 20;
        a.sync.throttle_delay_ms = 5;
        let b = node_config("b", PreferredRole::Passive, tables.clone());
        let pair = build_pair(a, b, snapshot_with(&tables, 300, 400, 300));
        start(&pair).await;

        let b_state = pair.b.service_state().clone();
        assert!(eventually(Duration::from_secs(5), || b_state.updates_received() > 0).await);
        pair.control.hold_acks(Side::A, true);

        let pool = pair.a.messenger().pool().clone();
        assert!(eventually(Duration::from_secs(5), || pool.outstanding() >= 40).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.outstanding(), 40);
        assert_eq!(pair.b.state(), DatabaseState::WaitingForConfig);

        pair.control.hold_acks(Side::A, false);
        pair.b.wait_ready().await.unwrap();
        assert_eq!(b_state.updates_received(), 1000);
        assert_eq!(b_state.updates_sent_by_active(), 1000);
        assert!(pool.stats().high_water <= 41);
        assert_eq!(pair.b.tables().read().valid_count(), 1000);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bulk_copy_gates_on_region_count() {
        let tables = tables_config(64);
        let mut a = node_config("a", PreferredRole::Active, tables.clone());
        let mut b = node_config("b", PreferredRole::Passive, tables.clone());
        a.sync.mode = SyncMode::Bulk;
        a.sync.max_transfer_unit = 1024;
        b.sync.mode = SyncMode::Bulk;
        let pair = build_pair(a, b, snapshot_with(&tables, 5, 7, 3));
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();

        let sent = pair.a.status().updates_sent;
        let b_status = pair.b.status();
        assert!(sent > 0);
        assert_eq!(b_status.updates_sent_by_active, sent);
        assert_eq!(b_status.updates_received, sent);
        let b_tables = pair.b.tables().read();
        assert!(b_tables.object.get(6).unwrap().is_valid());
        assert!(b_tables.edge.get(2).unwrap().is_valid());
        assert_eq!(b_tables.user.valid_count(), 5);
        drop(b_tables);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transaction_replicates_to_passive() {
        let tables = tables_config(0);
        let pair = build_pair(
            node_config("a", PreferredRole::Active, tables.clone()),
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();
        let a_state = pair.a.service_state().clone();
        assert!(eventually(Duration::from_secs(2), || a_state.peer_state() == PeerState::Ready).await);

        pair.a.start_transaction(TransactionType::User, 7).await.unwrap();
        pair.a
            .stage(ConfigEntry::Object(ObjectEntry {
                header: EntryHeader::new(5, EntryState::Create),
                class_id: 9,
                ..Default::default()
            }))
            .await
            .unwrap();
        pair.a.commit().await.unwrap();

        let entry = pair.b.tables().read().object.get(5).cloned().unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.class_id, 9);
        let local = pair.a.tables().read().object.get(5).cloned().unwrap();
        assert_eq!(entry.header.entry_id, local.header.entry_id);
        assert!(pair.b_storage.persist_count() >= 2);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_live_peer_fails_the_call() {
        let tables = tables_config(0);
        let mut a = node_config("a", PreferredRole::Active, tables.clone());
        a.messaging.sync_timeout_ms = 200;
        let pair = build_pair(
            a,
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();

        pair.control.set_blackhole(Side::A, true);
        let result = pair.a.start_transaction(TransactionType::User, 1).await;
        assert!(matches!(result, Err(Error::PeerTimeout { .. })));
        assert_eq!(pair.a.state(), DatabaseState::Ready);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_call_continues_when_peer_dies_during_wait() {
        let tables = tables_config(0);
        let mut a = node_config("a", PreferredRole::Active, tables.clone());
        a.messaging.sync_timeout_ms = 500;
        let pair = build_pair(
            a,
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();

        pair.control.set_blackhole(Side::A, true);
        let engine = pair.a.clone();
        let call = tokio::spawn(async move { engine.start_transaction(TransactionType::User, 2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pair.control.set_alive(Side::B, false);

        let id = call.await.unwrap().unwrap();
        assert_eq!(pair.a.transactions().current().id, id);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_header_enters_service_mode() {
        let tables = tables_config(0);
        let pair = build_pair(
            node_config("a", PreferredRole::Active, tables.clone()),
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();

        let messenger = pair.a.messenger().clone();
        let kind = MessageKind::UpdateSystemDbHeader;
        let message = Message::UpdateSystemDbHeader(SystemDbHeaderPayload {
            header_size: SystemDbHeader::local_size() as u32,
            version: messenger.version(),
            header: SystemDbHeader::new(&tables),
        });
        let bytes = protocol::encode_declared(&message, protocol::size_for(kind) + 16).unwrap();
        let handle = messenger.allocate().await.unwrap();
        messenger
            .adapter()
            .transmit_encoded(handle, kind, bytes, None, Completion::Release)
            .unwrap();

        let b_state = pair.b.service_state().clone();
        assert!(eventually(Duration::from_secs(2), || b_state.state().is_service_mode()).await);
        assert_eq!(
            b_state.state(),
            DatabaseState::ServiceMode(ServiceModeReason::VersionMismatch)
        );
        let a_state = pair.a.service_state().clone();
        assert!(eventually(Duration::from_secs(2), || a_state.peer_service_mode()).await);
        assert_eq!(a_state.peer_version(), Some(messenger.version()));
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_request_is_refused_with_receiver_version() {
        let tables = tables_config(0);
        let pair = build_pair(
            node_config("a", PreferredRole::Active, tables.clone()),
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();

        let kind = MessageKind::TransactionStart;
        let message = Message::TransactionStart(protocol::TransactionStartPayload {
            transaction_id: 77,
            job_number: 3,
            transaction_type: TransactionType::default(),
        });
        let outcome = pair
            .a
            .messenger()
            .call_declared(message, protocol::size_for(kind) + 16)
            .await
            .unwrap();
        let SyncOutcome::Confirmed(confirm) = outcome else {
            panic!("expected a confirmation, got {:?}", outcome);
        };
        assert_eq!(confirm.status, Status::Failed);
        assert_eq!(confirm.err, ConfirmError::LargerMsgSize);
        assert_eq!(confirm.version, pair.b.messenger().version());

        // The start handler never ran on the receiver
        let b_transactions = pair.b.transactions();
        assert_eq!(b_transactions.transaction_state(), TransactionState::Inactive);
        assert_ne!(b_transactions.current().id, 77);
        assert_eq!(pair.b.state(), DatabaseState::Ready);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_passive_takes_over_when_active_dies_mid_boot() {
        let tables = tables_config(0);
        let pair = build_pair(
            node_config("a", PreferredRole::Active, tables.clone()),
            node_config("b", PreferredRole::Passive, tables.clone()),
            snapshot_with(&tables, 2, 2, 0),
        );
        // The push never reaches the passive node
        pair.control.set_blackhole(Side::A, true);
        start(&pair).await;
        let b_state = pair.b.service_state().clone();
        assert!(eventually(Duration::from_secs(2), || b_state.state() == DatabaseState::WaitingForConfig).await);

        pair.control.kill(Side::A);
        pair.b.wait_ready().await.unwrap();
        assert_eq!(pair.b.role(), NodeRole::Active);
        assert_eq!(pair.b_storage.clear_count(), 1);
        assert_eq!(b_state.updates_received(), 0);
        assert_eq!(pair.b.tables().read().object.valid_count(), 0);
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_negotiation_probe_is_answered() {
        let tables = tables_config(0);
        let pair = build_pair(
            node_config("a", PreferredRole::Active, tables.clone()),
            node_config("b", PreferredRole::Passive, tables.clone()),
            ConfigSnapshot::empty(&tables),
        );
        start(&pair).await;
        pair.b.wait_ready().await.unwrap();
        assert!(pair.a.check_unknown_message_handling().await.unwrap());
        pair.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_api_refuses_work_before_ready() {
        let (ta, _tb, _control) = LoopbackTransport::pair(1, Duration::from_millis(1));
        let engine = EngineBuilder::new(node_config("a", PreferredRole::Active, tables_config(0)))
            .transport(Arc::new(ta))
            .storage(MemoryStorage::new().shared())
            .build()
            .unwrap();
        assert!(matches!(
            engine.start_transaction(TransactionType::User, 1).await,
            Err(Error::NotReady(_))
        ));
        assert!(matches!(engine.commit().await, Err(Error::NotReady(_))));
    }

    #[test]
    fn test_build_requires_transport() {
        let result = EngineBuilder::new(ConfigDbConfig::default())
            .storage(MemoryStorage::new().shared())
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
