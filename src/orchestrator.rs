//! Bootstrap and Role Orchestration
//!
//! Decides whether this node boots as the active node, which loads the
//! configuration from durable storage and pushes it to its peer, or as the
//! passive node, which asks for that push and waits until every announced
//! update has arrived. Peer loss and peer service mode re-enter the boot
//! path or hand the active role over.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{ConfigDbConfig, PreferredRole};
use crate::database::state::{DatabaseState, NodeRole, PeerState, ServiceModeReason, ServiceState};
use crate::database::storage::{persist_tables, DurableStorage, ObjectBuilder};
use crate::database::tables::ConfigTables;
use crate::error::{Error, Result};
use crate::messaging::{BulkWrite, Completion, SendStatus, WorkQueue, WorkerEvents};
use crate::replication::bulk::TableSync;
use crate::replication::protocol::{
    ConfigDonePayload, ConfirmError, ConfirmPayload, GetConfigPayload, Message, MessageKind,
    PassiveInitDonePayload, ServiceModePayload, Status, SystemDbHeaderPayload, TableChunkPayload, TableEntryPush,
};
use crate::replication::sync::Messenger;
use crate::replication::transaction::TransactionManager;

/// Poll interval while waiting for the peer at boot
const PEER_POLL: Duration = Duration::from_millis(50);

/// Delay before a busy `GetConfig` is sent again
const GET_CONFIG_RETRY: Duration = Duration::from_millis(100);

/// Sequences the boot of one node
pub struct Orchestrator {
    config: Arc<ConfigDbConfig>,
    state: Arc<ServiceState>,
    messenger: Arc<Messenger>,
    tables: Arc<RwLock<ConfigTables>>,
    storage: Arc<dyn DurableStorage>,
    objects: Arc<dyn ObjectBuilder>,
    sync: Arc<TableSync>,
    transactions: Arc<TransactionManager>,
    queue: Arc<WorkQueue>,
    /// Set once the passive boot has been handed to object creation
    config_received: AtomicBool,
    boot_task: Mutex<Option<JoinHandle<()>>>,
    push_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigDbConfig>,
        state: Arc<ServiceState>,
        messenger: Arc<Messenger>,
        tables: Arc<RwLock<ConfigTables>>,
        storage: Arc<dyn DurableStorage>,
        objects: Arc<dyn ObjectBuilder>,
        sync: Arc<TableSync>,
        transactions: Arc<TransactionManager>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            config,
            state,
            messenger,
            tables,
            storage,
            objects,
            sync,
            transactions,
            queue,
            config_received: AtomicBool::new(false),
            boot_task: Mutex::new(None),
            push_task: Mutex::new(None),
        }
    }

    /// Decide the role and start booting
    pub async fn start(self: &Arc<Self>) -> Result<NodeRole> {
        self.state.set_state(DatabaseState::Initializing);
        let timeout = Duration::from_millis(self.config.link.connect_timeout_ms);
        let peer_alive = self.wait_for_peer(timeout).await;

        let role = if !peer_alive {
            tracing::info!("Peer not present after {:?}, booting as active", timeout);
            NodeRole::Active
        } else {
            match self.config.node.preferred_role {
                PreferredRole::Active => NodeRole::Active,
                PreferredRole::Passive => NodeRole::Passive,
            }
        };
        tracing::info!("Node {} takes the {} role", self.config.node.id, role);
        self.state.set_role(role);
        self.spawn_boot(role);
        Ok(role)
    }

    async fn wait_for_peer(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.messenger.is_peer_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PEER_POLL).await;
        }
    }

    fn spawn_boot(self: &Arc<Self>, role: NodeRole) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let result = match role {
                NodeRole::Active => this.boot_active().await,
                NodeRole::Passive => this.boot_passive().await,
            };
            if let Err(e) = result {
                tracing::error!("{} boot failed: {}", role, e);
            }
        });
        if let Some(previous) = self.boot_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn abort_boot(&self) {
        if let Some(task) = self.boot_task.lock().take() {
            task.abort();
        }
    }

    fn abort_push(&self) {
        self.sync.stop();
        if let Some(task) = self.push_task.lock().take() {
            task.abort();
        }
    }

    /// Wait for the boot started by [`start`](Self::start) or a later
    /// takeover to end
    pub async fn wait_boot(&self) {
        let task = self.boot_task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => tracing::error!("Boot task panicked: {}", e),
                Err(_) => tracing::debug!("Boot task was cancelled"),
            }
        }
    }

    // ========== Active Boot ==========

    async fn boot_active(&self) -> Result<()> {
        tracing::info!("Loading configuration from durable storage");
        let loaded = match self.storage.load_system_config().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.enter_service_mode(ServiceModeReason::ConfigLoadFailed);
                return Err(e);
            }
        };

        let fresh = loaded.is_none();
        let tables = match loaded {
            None => {
                tracing::info!("No persisted configuration, starting from factory settings");
                ConfigTables::with_defaults(&self.config.tables)
            }
            Some(snapshot) => match ConfigTables::from_snapshot(&self.config.tables, &snapshot) {
                Ok(tables) => tables,
                Err(e) => {
                    self.enter_service_mode(ServiceModeReason::ConfigLoadFailed);
                    return Err(e);
                }
            },
        };
        tracing::info!(
            "Loaded {} entries, generation {}",
            tables.valid_count(),
            tables.generation()
        );
        *self.tables.write() = tables;
        if fresh {
            persist_tables(self.storage.as_ref(), &self.tables).await?;
        }

        let metadata = self.storage.load_nonpaged_metadata().await?;
        tracing::debug!("Non-paged metadata: {:?}", metadata);

        self.create_objects().await?;
        self.state.set_state(DatabaseState::Ready);
        Ok(())
    }

    async fn create_objects(&self) -> Result<()> {
        let tables = self.tables.read().clone();
        if let Err(e) = self.objects.create_objects(&tables).await {
            tracing::error!("Object creation failed: {}", e);
            self.state.set_state(DatabaseState::Failed);
            return Err(e);
        }
        Ok(())
    }

    // ========== Passive Boot ==========

    async fn boot_passive(&self) -> Result<()> {
        self.state.set_state(DatabaseState::WaitingForConfig);
        self.discard_received_config();
        self.sync.prepare_landing();

        if !self.request_config().await? {
            return Ok(());
        }

        let poll = Duration::from_millis(self.config.sync.config_poll_interval_ms);
        while !self.state.push_complete() {
            if self.state.state() != DatabaseState::WaitingForConfig {
                return Err(Error::Cancelled);
            }
            tokio::time::sleep(poll).await;
        }
        tracing::info!(
            "All {} updates received from the active node",
            self.state.updates_received()
        );
        self.queue.raise(WorkerEvents::CONFIG_DONE);
        Ok(())
    }

    fn discard_received_config(&self) {
        self.tables.write().reset();
        self.state.reset_counters();
        self.config_received.store(false, Ordering::SeqCst);
    }

    /// Ask the active node for its configuration. Returns `false` when the
    /// peer is gone and the peer-lost path takes over.
    async fn request_config(&self) -> Result<bool> {
        loop {
            let payload = GetConfigPayload {
                version: self.messenger.version(),
                region_sizes: self.sync.region_sizes(),
            };
            let handle = self.messenger.allocate().await?;
            let (tx, rx) = oneshot::channel();
            self.messenger
                .send(handle, &Message::GetConfig(payload), Completion::Notify(tx))?;

            match rx.await {
                Ok(SendStatus::Delivered) => {
                    tracing::info!("Configuration requested from the active node");
                    return Ok(true);
                }
                Ok(SendStatus::PeerBusy) => {
                    tracing::debug!("Peer busy, requesting configuration again");
                    tokio::time::sleep(GET_CONFIG_RETRY).await;
                }
                Ok(SendStatus::PeerNotPresent) => {
                    tracing::info!("Peer not present for GetConfig");
                    return Ok(false);
                }
                Ok(status @ SendStatus::Fatal) => {
                    return Err(Error::SendFailed {
                        kind: MessageKind::GetConfig.name(),
                        status: status.to_string(),
                    })
                }
                Err(_) => return Err(Error::Internal("GetConfig completion dropped".into())),
            }
        }
    }

    async fn finish_passive_boot(&self) {
        let result = self.create_objects().await;
        let status = Status::from_result(&result);
        if result.is_ok() {
            if let Err(e) = persist_tables(self.storage.as_ref(), &self.tables).await {
                tracing::warn!("Received configuration not persisted: {}", e);
            }
            self.state.set_state(DatabaseState::Ready);
        }
        let done = PassiveInitDonePayload {
            status,
            version: self.messenger.version(),
        };
        if let Err(e) = self
            .messenger
            .notify(Message::UpdateConfigPassiveInitDone(done))
            .await
        {
            tracing::warn!("Could not report passive boot completion: {}", e);
        }
    }

    // ========== Worker Events ==========

    /// Out-of-band events raised for the worker
    pub async fn on_events(self: &Arc<Self>, events: WorkerEvents) {
        if events.contains(WorkerEvents::CONFIG_DONE) {
            let waiting = self.state.state() == DatabaseState::WaitingForConfig;
            if waiting && self.state.push_complete() && !self.config_received.swap(true, Ordering::SeqCst) {
                let this = self.clone();
                let task = tokio::spawn(async move { this.finish_passive_boot().await });
                if let Some(previous) = self.boot_task.lock().replace(task) {
                    previous.abort();
                }
            }
        }

        if events.contains(WorkerEvents::PEER_SERVICE_MODE) {
            match self.state.role() {
                NodeRole::Passive => {
                    tracing::warn!("Peer entered service mode, taking over as active");
                    self.state.set_role(NodeRole::Active);
                    self.peer_lost().await;
                }
                NodeRole::Active if !self.state.is_ready() => self.peer_lost().await,
                NodeRole::Active => {}
            }
            self.state.set_peer_state(PeerState::ServiceMode);
        }
    }

    /// Contact with the peer was lost
    pub async fn peer_lost(self: &Arc<Self>) {
        tracing::warn!("Peer contact lost (state {}, role {})", self.state.state(), self.state.role());
        self.messenger.unblock_all();
        self.abort_push();
        self.state.set_peer_state(PeerState::Unknown);

        let state = self.state.state();
        if state.is_booting() {
            self.abort_boot();
            self.state.set_role(NodeRole::Active);
            self.discard_received_config();
            self.sync.reset_landing();
            if let Err(e) = self.storage.clear_nonpaged_metadata().await {
                tracing::warn!("Could not clear non-paged metadata: {}", e);
            }
            self.state.set_state(DatabaseState::Initializing);
            tracing::info!("Restarting boot as active node");
            self.spawn_boot(NodeRole::Active);
        } else if state == DatabaseState::Ready {
            if self.state.role() == NodeRole::Passive {
                tracing::info!("Taking over as active node");
                self.state.set_role(NodeRole::Active);
            }
            let transactions = self.transactions.clone();
            tokio::spawn(async move {
                if let Err(e) = transactions.resolve_incomplete_after_peer_death().await {
                    tracing::error!("Could not settle the peer's transaction: {}", e);
                }
            });
        }
    }

    /// Enter the terminal service mode and tell the peer
    pub fn enter_service_mode(&self, reason: ServiceModeReason) {
        if self.state.state().is_service_mode() {
            return;
        }
        tracing::error!("Entering service mode: {}", reason);
        self.state.set_state(DatabaseState::ServiceMode(reason));
        self.sync.stop();
        if self.messenger.is_peer_alive() {
            self.messenger.reply(Message::DbServiceMode(ServiceModePayload {
                reason,
                version: self.messenger.version(),
            }));
        }
    }

    // ========== Received Messages ==========

    /// Passive node asks for the configuration
    pub fn on_get_config(self: &Arc<Self>, request: GetConfigPayload) {
        tracing::info!("Peer (version {:#x}) requested the configuration", request.version);
        self.state.set_peer_state(PeerState::Initializing);
        self.state.set_peer_service_mode(false);
        self.abort_push();

        let this = self.clone();
        let task = tokio::spawn(async move {
            let Err(e) = this.sync.push_configuration(&request).await else {
                return;
            };
            if !this.messenger.is_peer_alive() {
                tracing::info!("Configuration push ended, peer gone: {}", e);
                return;
            }
            let reason = match e {
                Error::PeerTimeout { .. } => ServiceModeReason::PeerUnresponsive,
                // The peer refused our header or a chunk and reports its own state
                Error::PeerRejected { .. } => {
                    tracing::warn!("Configuration push refused by the peer: {}", e);
                    return;
                }
                _ => ServiceModeReason::PushFailed,
            };
            tracing::error!("Configuration push failed: {}", e);
            this.enter_service_mode(reason);
        });
        *self.push_task.lock() = Some(task);
    }

    pub fn on_passive_init_done(&self, payload: &PassiveInitDonePayload) {
        self.messenger.record_peer_version(payload.version);
        if payload.status.is_ok() {
            tracing::info!("Peer finished its passive boot");
            self.state.set_peer_state(PeerState::Ready);
        } else {
            tracing::warn!("Peer failed its passive boot");
            self.state.set_peer_state(PeerState::Unknown);
        }
    }

    /// A table entry from the peer: part of a push while booting, part of
    /// the mirrored transaction once ready
    pub fn on_update_config(&self, push: &TableEntryPush) {
        if let Err(e) = TableSync::check_entry_size(push) {
            tracing::error!("{}", e);
            self.enter_service_mode(ServiceModeReason::VersionMismatch);
            return;
        }

        match self.state.state() {
            DatabaseState::WaitingForConfig => match self.sync.receive_entry(push) {
                Ok(_) => self.check_config_complete(),
                Err(e) => tracing::warn!("Pushed {} entry {} not applied: {}", push.table, push.index, e),
            },
            DatabaseState::Ready => {
                let applied = self.transactions.stage_mirrored(push.entry.clone()).and_then(|staged| {
                    if !staged {
                        self.tables.write().apply(&push.entry)?;
                    }
                    Ok(())
                });
                if let Err(e) = applied {
                    tracing::warn!("Mirrored {} entry {} not applied: {}", push.table, push.index, e);
                }
            }
            other => tracing::debug!("Dropping {} entry while {}", push.table, other),
        }
    }

    pub fn on_config_done(&self, payload: &ConfigDonePayload) {
        if self.state.state() != DatabaseState::WaitingForConfig {
            tracing::debug!("UpdateConfigDone ignored while {}", self.state.state());
            return;
        }
        match self.sync.receive_done(payload) {
            Ok(()) => self.check_config_complete(),
            Err(e) => tracing::error!("Landed tables could not be loaded: {}", e),
        }
    }

    fn check_config_complete(&self) {
        if self.state.push_complete() {
            self.queue.raise(WorkerEvents::CONFIG_DONE);
        }
    }

    pub fn on_table_chunk(&self, payload: &TableChunkPayload, bulk: Option<&BulkWrite>) {
        let confirm = self.sync.receive_chunk(payload, bulk);
        self.messenger.confirm(MessageKind::UpdateConfigTable, confirm);
    }

    pub fn on_system_db_header(&self, payload: &SystemDbHeaderPayload) {
        match self.sync.receive_header(payload) {
            Ok(()) => self
                .messenger
                .confirm(MessageKind::UpdateSystemDbHeader, ConfirmPayload::default()),
            Err(e) => {
                tracing::error!("System DB header refused: {}", e);
                self.messenger.confirm(
                    MessageKind::UpdateSystemDbHeader,
                    ConfirmPayload {
                        status: Status::Failed,
                        err: ConfirmError::None,
                        ..Default::default()
                    },
                );
                if e.should_enter_service_mode() {
                    self.enter_service_mode(ServiceModeReason::VersionMismatch);
                }
            }
        }
    }

    /// Peer announced its service mode
    pub fn on_peer_service_mode(&self, payload: &ServiceModePayload) {
        tracing::warn!("Peer entered service mode: {}", payload.reason);
        self.messenger.record_peer_version(payload.version);
        self.state.set_peer_service_mode(true);
        self.queue.raise(WorkerEvents::PEER_SERVICE_MODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::storage::{LoggingObjectBuilder, MemoryStorage};
    use crate::database::tables::{ConfigEntry, EntryHeader, EntryState, ObjectEntry, TableEntry};
    use crate::replication::testing;

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        state: Arc<ServiceState>,
        tables: Arc<RwLock<ConfigTables>>,
        storage: Arc<MemoryStorage>,
        objects: Arc<LoggingObjectBuilder>,
        _solo: testing::Solo,
    }

    fn fixture(role: NodeRole) -> Fixture {
        let mut config = ConfigDbConfig::default();
        config.tables = testing::small_tables();
        config.link.connect_timeout_ms = 10;
        config.sync.config_poll_interval_ms = 5;
        let config = Arc::new(config);

        let state = Arc::new(ServiceState::new(role));
        let solo = testing::solo(state.clone(), 16);
        let tables = Arc::new(RwLock::new(ConfigTables::new(&config.tables)));
        let storage = MemoryStorage::new().shared();
        let objects = Arc::new(LoggingObjectBuilder::new());
        let sync = Arc::new(TableSync::new(
            solo.messenger.clone(),
            state.clone(),
            tables.clone(),
            config.sync.clone(),
            config.backpressure_threshold(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            solo.messenger.clone(),
            state.clone(),
            tables.clone(),
            storage.clone(),
            config.transaction.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            state.clone(),
            solo.messenger.clone(),
            tables.clone(),
            storage.clone(),
            objects.clone(),
            sync,
            transactions,
            Arc::new(WorkQueue::new()),
        ));
        Fixture {
            orchestrator,
            state,
            tables,
            storage,
            objects,
            _solo: solo,
        }
    }

    fn object(id: u32) -> ConfigEntry {
        ConfigEntry::Object(ObjectEntry {
            header: EntryHeader::new(id, EntryState::Valid),
            ..Default::default()
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lone_node_boots_active_from_defaults() {
        let f = fixture(NodeRole::Passive);
        let role = f.orchestrator.start().await.unwrap();
        assert_eq!(role, NodeRole::Active);
        f.orchestrator.wait_boot().await;

        assert!(f.state.is_ready());
        assert_eq!(f.state.role(), NodeRole::Active);
        assert_eq!(f.tables.read().generation(), 0);
        assert_eq!(f.storage.persist_count(), 1);
        assert_eq!(f.objects.created(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_loss_while_waiting_resets_and_reboots_active() {
        let f = fixture(NodeRole::Passive);
        f.state.set_state(DatabaseState::WaitingForConfig);
        f.tables.write().apply(&object(3)).unwrap();
        f.state.record_update_received();
        f.state.record_config_done(5);

        f.orchestrator.peer_lost().await;
        assert_eq!(f.state.role(), NodeRole::Active);
        assert_eq!(f.state.updates_received(), 0);
        assert_eq!(f.state.updates_sent_by_active(), 0);
        assert!(!f.state.config_done_received());
        assert_eq!(f.storage.clear_count(), 1);

        f.orchestrator.wait_boot().await;
        assert!(f.state.is_ready());
        assert!(!f.tables.read().object.get(3).unwrap().is_valid());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_pushed_entry_enters_service_mode() {
        let f = fixture(NodeRole::Passive);
        f.state.set_state(DatabaseState::WaitingForConfig);
        let mut entry = object(1);
        let oversized = entry.known_size() as u32 + 8;
        entry.header_mut().size = oversized;
        f.orchestrator.on_update_config(&TableEntryPush {
            table: entry.table(),
            index: 1,
            entry,
        });
        assert_eq!(
            f.state.state(),
            DatabaseState::ServiceMode(ServiceModeReason::VersionMismatch)
        );
        assert_eq!(f.state.updates_received(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_config_done_gate_needs_matching_counts() {
        let f = fixture(NodeRole::Passive);
        f.state.set_state(DatabaseState::WaitingForConfig);
        f.orchestrator.on_config_done(&ConfigDonePayload { entries_sent: 1 });
        assert!(!f.state.push_complete());
        f.orchestrator.on_events(WorkerEvents::CONFIG_DONE).await;
        assert_eq!(f.state.state(), DatabaseState::WaitingForConfig);

        let mut entry = object(2);
        entry.stamp_size();
        f.orchestrator.on_update_config(&TableEntryPush {
            table: entry.table(),
            index: 2,
            entry,
        });
        assert!(f.state.push_complete());
        f.orchestrator.on_events(WorkerEvents::CONFIG_DONE).await;
        f.orchestrator.wait_boot().await;
        assert!(f.state.is_ready());
        assert_eq!(f.objects.created(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ready_passive_takes_over_on_peer_loss() {
        let f = fixture(NodeRole::Passive);
        f.state.set_state(DatabaseState::Ready);
        f.tables.write().apply(&object(4)).unwrap();
        f.orchestrator.peer_lost().await;
        assert_eq!(f.state.role(), NodeRole::Active);
        assert!(f.state.is_ready());
        // Tables survive a loss after READY
        assert!(f.tables.read().object.get(4).unwrap().is_valid());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_boot_survives_panicked_boot() {
        let f = fixture(NodeRole::Active);
        let task = tokio::spawn(async { panic!("boot failed") });
        *f.orchestrator.boot_task.lock() = Some(task);

        f.orchestrator.wait_boot().await;
        assert!(f.orchestrator.boot_task.lock().is_none());
        // Nothing left to wait for
        f.orchestrator.wait_boot().await;
    }
}
