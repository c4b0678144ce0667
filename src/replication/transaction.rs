//! Transaction Replication
//!
//! One configuration transaction per node. The initiator mirrors start,
//! commit, abort and invalidate to the peer as synchronous round trips; the
//! peer keeps the mirrored transaction in the same slot. A commit carries
//! only entry ids for the user, object and edge tables, the peer already
//! holds those entries staged, while global info travels in full.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::TransactionConfig;
use crate::database::state::{PeerState, ServiceState};
use crate::database::storage::{persist_tables, DurableStorage};
use crate::database::tables::{
    ConfigEntry, ConfigTables, EdgeEntry, GlobalInfoEntry, ObjectEntry, TableEntry, TableType, UserEntry,
};
use crate::error::{Error, Result};
use crate::replication::protocol::{
    ConfirmError, ConfirmPayload, Message, MessageKind, Status, TableEntryPush, TransactionCommitPayload,
    TransactionEndPayload, TransactionStartPayload, TransactionType, MAX_COMMIT_EDGE_IDS, MAX_COMMIT_GLOBAL_INFO,
    MAX_COMMIT_IDS,
};
use crate::replication::sync::{Messenger, SyncOutcome};

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Inactive,
    Active,
    CommitPending,
    AbortPending,
}

impl TransactionState {
    pub fn name(self) -> &'static str {
        match self {
            TransactionState::Inactive => "INACTIVE",
            TransactionState::Active => "ACTIVE",
            TransactionState::CommitPending => "COMMIT_PENDING",
            TransactionState::AbortPending => "ABORT_PENDING",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A transaction and the entries staged in it
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub id: u64,
    pub transaction_type: TransactionType,
    pub job_number: u64,
    pub state: TransactionState,
    pub user: Vec<UserEntry>,
    pub object: Vec<ObjectEntry>,
    pub edge: Vec<EdgeEntry>,
    pub global_info: Vec<GlobalInfoEntry>,
}

impl Transaction {
    fn begin(id: u64, transaction_type: TransactionType, job_number: u64) -> Self {
        Self {
            id,
            transaction_type,
            job_number,
            state: TransactionState::Active,
            ..Default::default()
        }
    }

    pub fn staged_count(&self) -> usize {
        self.user.len() + self.object.len() + self.edge.len() + self.global_info.len()
    }

    /// Staged entries in commit order
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let mut entries = Vec::with_capacity(self.staged_count());
        entries.extend(self.user.iter().cloned().map(ConfigEntry::User));
        entries.extend(self.object.iter().cloned().map(ConfigEntry::Object));
        entries.extend(self.edge.iter().cloned().map(ConfigEntry::Edge));
        entries.extend(self.global_info.iter().cloned().map(ConfigEntry::GlobalInfo));
        entries
    }

    fn stage(&mut self, entry: ConfigEntry, edges_per_object: usize, limits: &TransactionConfig) -> Result<()> {
        match entry {
            ConfigEntry::User(e) => put(&mut self.user, e, edges_per_object, limits.max_user_entries),
            ConfigEntry::Object(e) => put(&mut self.object, e, edges_per_object, limits.max_object_entries),
            ConfigEntry::Edge(e) => put(&mut self.edge, e, edges_per_object, limits.max_edge_entries),
            ConfigEntry::GlobalInfo(e) => {
                put(&mut self.global_info, e, edges_per_object, limits.max_global_info_entries)
            }
            ConfigEntry::SystemSpare(_) => Err(Error::Table(
                "system spare entries are not staged in transactions".into(),
            )),
        }
    }

    fn assign_entry_ids(&mut self, mut next: u64) {
        let headers = self
            .user
            .iter_mut()
            .map(|e| &mut e.header)
            .chain(self.object.iter_mut().map(|e| &mut e.header))
            .chain(self.edge.iter_mut().map(|e| &mut e.header))
            .chain(self.global_info.iter_mut().map(|e| &mut e.header));
        for header in headers.filter(|h| h.entry_id == 0) {
            header.entry_id = next;
            next += 1;
        }
    }

    fn commit_payload(&self) -> TransactionCommitPayload {
        TransactionCommitPayload {
            transaction_id: self.id,
            job_number: self.job_number,
            user_entry_ids: bounded_ids(&self.user, MAX_COMMIT_IDS, TableType::User),
            object_entry_ids: bounded_ids(&self.object, MAX_COMMIT_IDS, TableType::Object),
            edge_entry_ids: bounded_ids(&self.edge, MAX_COMMIT_EDGE_IDS, TableType::Edge),
            global_info: bounded(self.global_info.clone(), MAX_COMMIT_GLOBAL_INFO, TableType::GlobalInfo),
        }
    }
}

/// Stage an entry, replacing one already staged for the same slot
fn put<E: TableEntry>(list: &mut Vec<E>, entry: E, edges_per_object: usize, limit: usize) -> Result<()> {
    let slot = entry.slot(edges_per_object);
    if let Some(existing) = list.iter_mut().find(|e| e.slot(edges_per_object) == slot) {
        *existing = entry;
        return Ok(());
    }
    if list.len() >= limit {
        return Err(Error::TransactionFull {
            table: E::TABLE.name(),
            limit,
        });
    }
    list.push(entry);
    Ok(())
}

fn bounded<T>(mut items: Vec<T>, limit: usize, table: TableType) -> Vec<T> {
    if items.len() > limit {
        tracing::warn!(
            "Commit carries {} {} entries, truncating to {}",
            items.len(),
            table,
            limit
        );
        items.truncate(limit);
    }
    items
}

fn bounded_ids<E: TableEntry>(entries: &[E], limit: usize, table: TableType) -> Vec<u64> {
    bounded(entries.iter().map(|e| e.header().entry_id).collect(), limit, table)
}

/// Copy committed ids onto the mirrored entries, position by position
fn copy_ids<E: TableEntry>(entries: &mut [E], ids: &[u64], table: TableType) {
    if entries.len() != ids.len() {
        tracing::warn!(
            "Commit names {} {} entries, {} staged locally",
            ids.len(),
            table,
            entries.len()
        );
    }
    for (entry, id) in entries.iter_mut().zip(ids) {
        entry.header_mut().entry_id = *id;
    }
}

fn apply_all(tables: &mut ConfigTables, transaction: &Transaction) -> Result<()> {
    transaction
        .entries()
        .iter()
        .try_for_each(|entry| tables.apply(entry))
}

fn highest_entry_id(tables: &ConfigTables) -> u64 {
    TableType::ENTRY_TABLES
        .iter()
        .flat_map(|table| tables.valid_entries(*table))
        .map(|entry| entry.header().entry_id)
        .max()
        .unwrap_or(0)
}

fn confirm_ok() -> ConfirmPayload {
    ConfirmPayload::default()
}

fn confirm_failed(err: ConfirmError) -> ConfirmPayload {
    ConfirmPayload {
        status: Status::Failed,
        err,
        ..Default::default()
    }
}

/// The node's transaction slot and its replication
pub struct TransactionManager {
    messenger: Arc<Messenger>,
    state: Arc<ServiceState>,
    tables: Arc<RwLock<ConfigTables>>,
    storage: Arc<dyn DurableStorage>,
    limits: TransactionConfig,
    current: Mutex<Transaction>,
    last_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(
        messenger: Arc<Messenger>,
        state: Arc<ServiceState>,
        tables: Arc<RwLock<ConfigTables>>,
        storage: Arc<dyn DurableStorage>,
        limits: TransactionConfig,
    ) -> Self {
        Self {
            messenger,
            state,
            tables,
            storage,
            limits,
            current: Mutex::new(Transaction::default()),
            last_id: AtomicU64::new(0),
        }
    }

    /// Copy of the current transaction
    pub fn current(&self) -> Transaction {
        self.current.lock().clone()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.current.lock().state
    }

    /// Id given to the most recent transaction
    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    /// Start a transaction and mirror it on the peer
    pub async fn start(&self, transaction_type: TransactionType, job_number: u64) -> Result<u64> {
        let id = {
            let mut current = self.current.lock();
            if current.state != TransactionState::Inactive {
                return Err(Error::TransactionInProgress {
                    id: current.id,
                    state: current.state.name(),
                });
            }
            let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
            *current = Transaction::begin(id, transaction_type, job_number);
            id
        };
        tracing::debug!("Transaction {} started for job {}", id, job_number);

        let message = Message::TransactionStart(TransactionStartPayload {
            transaction_id: id,
            job_number,
            transaction_type,
        });
        if let Err(e) = self.replicate(message).await {
            let mut current = self.current.lock();
            if current.id == id {
                *current = Transaction::default();
            }
            let _ = self
                .last_id
                .compare_exchange(id, id - 1, Ordering::SeqCst, Ordering::SeqCst);
            return Err(e);
        }
        Ok(id)
    }

    /// Stage an entry in the active transaction. On the active node the
    /// entry is also pushed to a ready peer, which stages it in its mirror.
    pub async fn stage(&self, mut entry: ConfigEntry) -> Result<()> {
        entry.stamp_size();
        let edges_per_object = self.tables.read().edges_per_object();
        {
            let mut current = self.current.lock();
            if current.state != TransactionState::Active {
                return Err(Error::NoActiveTransaction);
            }
            current.stage(entry.clone(), edges_per_object, &self.limits)?;
        }

        if self.state.is_active()
            && self.state.peer_state() == PeerState::Ready
            && self.messenger.peer_update_allowed()
        {
            let push = TableEntryPush {
                table: entry.table(),
                index: entry.slot(edges_per_object) as u32,
                entry,
            };
            self.messenger.notify(Message::UpdateConfig(push)).await?;
        }
        Ok(())
    }

    /// Stage an entry pushed by the peer into the mirrored transaction.
    /// Returns `false` when no transaction is active.
    pub fn stage_mirrored(&self, entry: ConfigEntry) -> Result<bool> {
        let edges_per_object = self.tables.read().edges_per_object();
        let mut current = self.current.lock();
        if current.state != TransactionState::Active {
            return Ok(false);
        }
        current.stage(entry, edges_per_object, &self.limits)?;
        Ok(true)
    }

    /// Commit locally, persist, then mirror the commit. Local state is
    /// authoritative even when the peer fails to follow.
    pub async fn commit(&self) -> Result<()> {
        let (payload, count) = {
            let mut current = self.current.lock();
            if current.state != TransactionState::Active {
                return Err(Error::NoActiveTransaction);
            }
            current.state = TransactionState::CommitPending;

            let mut tables = self.tables.write();
            if current.staged_count() > 0 {
                let generation = tables.next_generation_entry();
                let edges_per_object = tables.edges_per_object();
                // Generation slot is always staged with room to spare
                let limits = TransactionConfig {
                    max_global_info_entries: usize::MAX,
                    ..self.limits.clone()
                };
                current.stage(ConfigEntry::GlobalInfo(generation), edges_per_object, &limits)?;
            }
            current.assign_entry_ids(highest_entry_id(&tables) + 1);
            if let Err(e) = apply_all(&mut tables, &current) {
                tracing::error!("Transaction {} failed to apply: {}", current.id, e);
                *current = Transaction::default();
                return Err(e);
            }
            (current.commit_payload(), current.staged_count())
        };
        tracing::info!(
            "Transaction {} committed {} entries (job {})",
            payload.transaction_id,
            count,
            payload.job_number
        );

        let persisted = if count > 0 {
            persist_tables(self.storage.as_ref(), &self.tables).await
        } else {
            Ok(())
        };
        let replicated = self.replicate(Message::TransactionCommit(payload)).await;
        *self.current.lock() = Transaction::default();

        if let Err(e) = &persisted {
            tracing::error!("Committed transaction not persisted: {}", e);
        }
        persisted?;
        replicated
    }

    /// Discard the staged entries and end the transaction on both nodes
    pub async fn abort(&self) -> Result<()> {
        let payload = {
            let mut current = self.current.lock();
            if current.state != TransactionState::Active {
                return Err(Error::NoActiveTransaction);
            }
            current.state = TransactionState::AbortPending;
            TransactionEndPayload {
                transaction_id: current.id,
                job_number: current.job_number,
            }
        };
        tracing::info!("Transaction {} aborted", payload.transaction_id);
        let replicated = self.replicate(Message::TransactionAbort(payload)).await;
        *self.current.lock() = Transaction::default();
        replicated
    }

    /// Drop whatever transaction is in the slot, on both nodes
    pub async fn invalidate(&self) -> Result<()> {
        let payload = {
            let mut current = self.current.lock();
            let payload = TransactionEndPayload {
                transaction_id: current.id,
                job_number: current.job_number,
            };
            *current = Transaction::default();
            payload
        };
        tracing::info!("Transaction {} invalidated", payload.transaction_id);
        self.replicate(Message::TransactionInvalidate(payload)).await
    }

    async fn replicate(&self, message: Message) -> Result<()> {
        if !self.messenger.peer_update_allowed() {
            return Ok(());
        }
        let kind = message.kind();
        match self.messenger.call(message).await?.check(kind)? {
            SyncOutcome::Unilateral => {
                tracing::info!("{} completed without the peer", kind);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ========== Peer Side ==========

    pub async fn on_start(&self, payload: &TransactionStartPayload) -> ConfirmPayload {
        if !self.state.is_ready() {
            return confirm_ok();
        }
        let mut current = self.current.lock();
        if current.state != TransactionState::Inactive {
            tracing::warn!(
                "Peer started transaction {} while {} is {}, replacing it",
                payload.transaction_id,
                current.id,
                current.state
            );
        }
        *current = Transaction::begin(payload.transaction_id, payload.transaction_type, payload.job_number);
        self.last_id.fetch_max(payload.transaction_id, Ordering::SeqCst);
        confirm_ok()
    }

    pub async fn on_commit(&self, payload: &TransactionCommitPayload) -> ConfirmPayload {
        if !self.state.is_ready() {
            return confirm_ok();
        }
        let applied = {
            let mut current = self.current.lock();
            if current.state != TransactionState::Active || current.job_number != payload.job_number {
                tracing::warn!(
                    "Commit for job {} does not match transaction {} ({}, job {})",
                    payload.job_number,
                    current.id,
                    current.state,
                    current.job_number
                );
                return confirm_failed(ConfirmError::DismatchTransaction);
            }
            current.state = TransactionState::CommitPending;
            copy_ids(&mut current.user, &payload.user_entry_ids, TableType::User);
            copy_ids(&mut current.object, &payload.object_entry_ids, TableType::Object);
            copy_ids(&mut current.edge, &payload.edge_entry_ids, TableType::Edge);
            current.global_info = payload.global_info.clone();

            let result = apply_all(&mut self.tables.write(), &current);
            *current = Transaction::default();
            result
        };
        if let Err(e) = applied {
            tracing::error!("Mirrored commit {} failed: {}", payload.transaction_id, e);
            return confirm_failed(ConfirmError::None);
        }
        match persist_tables(self.storage.as_ref(), &self.tables).await {
            Ok(()) => confirm_ok(),
            Err(e) => {
                tracing::error!("Mirrored commit {} not persisted: {}", payload.transaction_id, e);
                confirm_failed(ConfirmError::None)
            }
        }
    }

    /// Abort and invalidate from the peer
    pub async fn on_end(&self, kind: MessageKind, payload: &TransactionEndPayload) -> ConfirmPayload {
        if !self.state.is_ready() {
            return confirm_ok();
        }
        let mut current = self.current.lock();
        let invalidate = kind == MessageKind::TransactionInvalidate;
        let idle = current.state == TransactionState::Inactive;
        if current.job_number != payload.job_number && !(invalidate && idle) {
            tracing::warn!(
                "{} for job {} does not match transaction {} (job {})",
                kind,
                payload.job_number,
                current.id,
                current.job_number
            );
            return confirm_failed(ConfirmError::DismatchTransaction);
        }
        *current = Transaction::default();
        confirm_ok()
    }

    /// Settle a mirrored transaction left behind by a peer that died.
    /// Unfinished work rolls back; a commit in flight completes.
    pub async fn resolve_incomplete_after_peer_death(&self) -> Result<()> {
        let committed = {
            let mut current = self.current.lock();
            match current.state {
                TransactionState::Inactive => return Ok(()),
                TransactionState::Active | TransactionState::AbortPending => {
                    tracing::warn!(
                        "Rolling back transaction {} ({}) left by the peer",
                        current.id,
                        current.state
                    );
                    *current = Transaction::default();
                    false
                }
                TransactionState::CommitPending => {
                    tracing::warn!("Completing commit of transaction {} left by the peer", current.id);
                    let result = apply_all(&mut self.tables.write(), &current);
                    *current = Transaction::default();
                    result?;
                    true
                }
            }
        };
        if committed {
            persist_tables(self.storage.as_ref(), &self.tables).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn force_state(&self, state: TransactionState) {
        self.current.lock().state = state;
    }
}
