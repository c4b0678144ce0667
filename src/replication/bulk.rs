//! Bulk Table Synchronization
//!
//! Pushes the active node's whole configuration to a (re)joining passive
//! node, and lands what the passive node receives.
//!
//! Two strategies deliver the tables:
//! - entry by entry, a fire-and-forget stream that pauses while the pool
//!   runs short of headroom;
//! - bulk copy, each table image written in chunks into a fixed landing
//!   region on the peer, one synchronous round trip per chunk.
//!
//! Either way the receiver counts one update per entry or per table, and
//! the push ends with `UpdateConfigDone` carrying the total.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SyncConfig, SyncMode};
use crate::database::state::{DatabaseState, ServiceState};
use crate::database::tables::{ConfigTables, SystemDbHeader, TableType};
use crate::error::{Error, Result};
use crate::messaging::{BulkWrite, Completion};
use crate::replication::protocol::{
    ConfigDonePayload, ConfirmError, ConfirmPayload, GetConfigPayload, Message, MessageKind, Status,
    SystemDbHeaderPayload, TableChunkPayload, TableEntryPush,
};
use crate::replication::sync::{Messenger, SyncOutcome};

/// Index of a table's landing region in `GetConfigPayload::region_sizes`
fn region_index(table: TableType) -> usize {
    table.code() as usize - 1
}

/// Landing regions of a bulk copy
#[derive(Debug, Default)]
struct LandingZone {
    regions: HashMap<TableType, Vec<u8>>,
    /// Regions whose last byte arrived; each is counted once
    filled: HashSet<TableType>,
}

/// Configuration push and its receiving end
pub struct TableSync {
    messenger: Arc<Messenger>,
    state: Arc<ServiceState>,
    tables: Arc<RwLock<ConfigTables>>,
    config: SyncConfig,
    /// Outstanding messages at which the entry stream pauses
    threshold: usize,
    stop: Arc<AtomicBool>,
    landing: Mutex<LandingZone>,
}

impl TableSync {
    pub fn new(
        messenger: Arc<Messenger>,
        state: Arc<ServiceState>,
        tables: Arc<RwLock<ConfigTables>>,
        config: SyncConfig,
        threshold: usize,
    ) -> Self {
        Self {
            messenger,
            state,
            tables,
            config,
            threshold,
            stop: Arc::new(AtomicBool::new(false)),
            landing: Mutex::new(LandingZone::default()),
        }
    }

    /// Abort a push in progress
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn check_stopped(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::PushAborted("push stopped".into()));
        }
        Ok(())
    }

    // ========== Active Side ==========

    /// Push the whole configuration in answer to a `GetConfig`. Returns the
    /// number of updates announced to the peer.
    pub async fn push_configuration(&self, request: &GetConfigPayload) -> Result<u64> {
        self.stop.store(false, Ordering::SeqCst);
        self.messenger.record_peer_version(request.version);
        self.wait_until_ready().await?;

        self.push_header().await?;
        let mut sent = match self.choose_mode(request) {
            SyncMode::Entry => self.push_entries().await?,
            SyncMode::Bulk => self.push_images().await?,
        };
        sent += self.push_key_memory(request).await?;
        self.check_stopped()?;

        self.messenger
            .notify(Message::UpdateConfigDone(ConfigDonePayload { entries_sent: sent }))
            .await?;
        self.state.set_updates_sent(sent);
        tracing::info!("Configuration push complete, {} updates sent", sent);
        Ok(sent)
    }

    /// A push only starts from a node whose own boot finished
    async fn wait_until_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s == DatabaseState::Ready || s.is_service_mode())
            .await
            .map_err(|_| Error::ShuttingDown)?;
        match state {
            DatabaseState::Ready => Ok(()),
            other => Err(Error::ServiceMode(other.to_string())),
        }
    }

    async fn push_header(&self) -> Result<()> {
        let header = self.tables.read().header.clone();
        let payload = SystemDbHeaderPayload {
            header_size: SystemDbHeader::local_size() as u32,
            version: self.messenger.version(),
            header,
        };
        let kind = MessageKind::UpdateSystemDbHeader;
        match self.messenger.call(Message::UpdateSystemDbHeader(payload)).await?.check(kind)? {
            SyncOutcome::Unilateral => Err(Error::PushAborted("peer left during header exchange".into())),
            _ => Ok(()),
        }
    }

    fn choose_mode(&self, request: &GetConfigPayload) -> SyncMode {
        if self.config.mode == SyncMode::Entry {
            return SyncMode::Entry;
        }
        let tables = self.tables.read();
        let mismatch = TableType::ENTRY_TABLES
            .iter()
            .find(|table| request.region_sizes[region_index(**table)] != tables.image_size(**table) as u64);
        match mismatch {
            Some(table) => {
                tracing::warn!(
                    "Peer {} region is {} bytes, local image is {}; pushing entry by entry",
                    table,
                    request.region_sizes[region_index(*table)],
                    tables.image_size(*table)
                );
                SyncMode::Entry
            }
            None => SyncMode::Bulk,
        }
    }

    /// Stream every valid entry, fire-and-forget
    async fn push_entries(&self) -> Result<u64> {
        let edges_per_object = self.tables.read().edges_per_object();
        let throttle_delay = Duration::from_millis(self.config.throttle_delay_ms);
        let mut sent = 0u64;

        for table in TableType::ENTRY_TABLES {
            let entries = self.tables.read().valid_entries(table);
            tracing::debug!("Pushing {} {} entries", entries.len(), table);
            for mut entry in entries {
                self.check_stopped()?;
                self.wait_for_headroom().await?;

                entry.stamp_size();
                let push = TableEntryPush {
                    table,
                    index: entry.slot(edges_per_object) as u32,
                    entry,
                };
                let handle = self.messenger.allocate().await?;
                self.messenger.send(
                    handle,
                    &Message::UpdateConfig(push),
                    Completion::FlagOnFailure(self.stop.clone()),
                )?;
                sent += 1;

                if sent % self.config.throttle_every as u64 == 0 {
                    tokio::time::sleep(throttle_delay).await;
                }
            }
        }
        Ok(sent)
    }

    /// Pause while too few messages are free for other traffic
    async fn wait_for_headroom(&self) -> Result<()> {
        let poll = Duration::from_millis(self.config.backpressure_poll_ms);
        let mut paused = false;
        while self.messenger.pool().outstanding() >= self.threshold {
            self.check_stopped()?;
            if !self.messenger.is_peer_alive() {
                return Err(Error::PushAborted("peer lost while paused".into()));
            }
            if !paused {
                tracing::debug!(
                    "Push paused, {} messages outstanding (threshold {})",
                    self.messenger.pool().outstanding(),
                    self.threshold
                );
                paused = true;
            }
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }

    /// Copy every table image into the peer's landing regions
    async fn push_images(&self) -> Result<u64> {
        let mut sent = 0u64;
        for table in TableType::ENTRY_TABLES {
            let image = self.tables.read().image(table)?;
            if self.copy_region(table, &image).await? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    async fn push_key_memory(&self, request: &GetConfigPayload) -> Result<u64> {
        let advertised = request.region_sizes[region_index(TableType::KeyMemory)];
        if advertised == 0 {
            return Ok(0);
        }
        let image = self.tables.read().image(TableType::KeyMemory)?;
        if advertised != image.len() as u64 {
            tracing::warn!(
                "Peer key memory region is {} bytes, local is {}; not copied",
                advertised,
                image.len()
            );
            return Ok(0);
        }
        Ok(self.copy_region(TableType::KeyMemory, &image).await? as u64)
    }

    /// Write one region in chunks, waiting for each chunk's confirmation
    async fn copy_region(&self, table: TableType, image: &[u8]) -> Result<bool> {
        if image.is_empty() {
            return Ok(false);
        }
        let kind = MessageKind::UpdateConfigTable;
        let mtu = self.config.max_transfer_unit;
        for (index, chunk) in image.chunks(mtu).enumerate() {
            self.check_stopped()?;
            let offset = (index * mtu) as u64;
            let payload = TableChunkPayload {
                table,
                offset,
                length: chunk.len() as u64,
            };
            let bulk = BulkWrite {
                region: table.code(),
                offset,
                data: Bytes::copy_from_slice(chunk),
            };
            let outcome = self
                .messenger
                .call_bulk(Message::UpdateConfigTable(payload), bulk)
                .await?
                .check(kind)?;
            if outcome.is_unilateral() {
                return Err(Error::PushAborted(format!("peer left during {} copy", table)));
            }
        }
        tracing::debug!("Copied {} ({} bytes)", table, image.len());
        Ok(true)
    }

    // ========== Passive Side ==========

    /// Region sizes advertised in `GetConfig`
    pub fn region_sizes(&self) -> [u64; 6] {
        let tables = self.tables.read();
        let mut sizes = [0u64; 6];
        for table in TableType::ENTRY_TABLES.into_iter().chain([TableType::KeyMemory]) {
            sizes[region_index(table)] = tables.image_size(table) as u64;
        }
        sizes
    }

    /// Allocate empty landing regions for a new push
    pub fn prepare_landing(&self) {
        let sizes = self.region_sizes();
        let mut landing = self.landing.lock();
        landing.filled.clear();
        landing.regions = TableType::ENTRY_TABLES
            .into_iter()
            .chain([TableType::KeyMemory])
            .map(|table| (table, vec![0u8; sizes[region_index(table)] as usize]))
            .collect();
    }

    pub fn reset_landing(&self) {
        *self.landing.lock() = LandingZone::default();
    }

    /// Refuse entries written by a newer, larger layout
    pub fn check_entry_size(push: &TableEntryPush) -> Result<()> {
        let declared = push.entry.header().size as usize;
        let local = push.entry.known_size();
        if declared > local {
            return Err(Error::VersionMismatch {
                structure: "table entry",
                declared,
                local,
            });
        }
        Ok(())
    }

    /// Apply one pushed entry and count it
    pub fn receive_entry(&self, push: &TableEntryPush) -> Result<u64> {
        Self::check_entry_size(push)?;
        self.tables.write().apply(&push.entry)?;
        let received = self.state.record_update_received();
        tracing::trace!("Received {} entry {} ({} so far)", push.table, push.index, received);
        Ok(received)
    }

    /// Land one chunk of a bulk copy. A region counts as one update once
    /// its last byte arrives.
    pub fn receive_chunk(&self, payload: &TableChunkPayload, bulk: Option<&BulkWrite>) -> ConfirmPayload {
        match self.land_chunk(payload, bulk) {
            Ok(()) => ConfirmPayload::default(),
            Err(e) => {
                tracing::warn!("Dropping {} chunk at {}: {}", payload.table, payload.offset, e);
                ConfirmPayload {
                    status: Status::Failed,
                    err: ConfirmError::None,
                    ..Default::default()
                }
            }
        }
    }

    fn land_chunk(&self, payload: &TableChunkPayload, bulk: Option<&BulkWrite>) -> Result<()> {
        let bulk = bulk.ok_or_else(|| Error::Protocol("table chunk without data".into()))?;
        if TableType::from_code(bulk.region) != Some(payload.table) {
            return Err(Error::Protocol(format!(
                "chunk for {} written to region {}",
                payload.table, bulk.region
            )));
        }

        let mut landing = self.landing.lock();
        let region = landing
            .regions
            .get_mut(&payload.table)
            .ok_or_else(|| Error::NoPeerRegion(payload.table.name()))?;
        if bulk.offset != payload.offset || bulk.data.len() as u64 != payload.length {
            return Err(Error::Protocol(format!(
                "chunk announced {} bytes at {}, wrote {} at {}",
                payload.length,
                payload.offset,
                bulk.data.len(),
                bulk.offset
            )));
        }
        let range = usize::try_from(payload.offset)
            .ok()
            .and_then(|start| start.checked_add(bulk.data.len()).map(|end| (start, end)))
            .filter(|(_, end)| *end <= region.len());
        let Some((start, end)) = range else {
            return Err(Error::Protocol(format!(
                "chunk of {} bytes at {} does not fit {} byte region",
                payload.length,
                payload.offset,
                region.len()
            )));
        };
        region[start..end].copy_from_slice(&bulk.data);
        let complete = end == region.len();
        if complete && landing.filled.insert(payload.table) {
            let received = self.state.record_update_received();
            tracing::debug!("{} region landed ({} updates so far)", payload.table, received);
        }
        Ok(())
    }

    /// End of a push: decode landed regions, then record the announced total
    pub fn receive_done(&self, payload: &ConfigDonePayload) -> Result<()> {
        let landed: Vec<(TableType, Vec<u8>)> = {
            let mut landing = self.landing.lock();
            let filled = std::mem::take(&mut landing.filled);
            filled
                .into_iter()
                .filter_map(|table| landing.regions.remove(&table).map(|image| (table, image)))
                .collect()
        };
        if !landed.is_empty() {
            let mut tables = self.tables.write();
            for (table, image) in &landed {
                tables.load_image(*table, image)?;
            }
        }
        self.state.record_config_done(payload.entries_sent);
        tracing::info!(
            "Active node announced {} updates, {} received",
            payload.entries_sent,
            self.state.updates_received()
        );
        Ok(())
    }

    /// Check and adopt the active node's system DB header
    pub fn receive_header(&self, payload: &SystemDbHeaderPayload) -> Result<()> {
        self.messenger.record_peer_version(payload.version);
        let local = SystemDbHeader::local_size();
        if payload.header_size as usize > local {
            return Err(Error::VersionMismatch {
                structure: "system db header",
                declared: payload.header_size as usize,
                local,
            });
        }
        if !payload.header.is_valid() {
            return Err(Error::Table("system db header has a bad magic number".into()));
        }

        let mut tables = self.tables.write();
        if payload.header.object_capacity != tables.header.object_capacity
            || payload.header.user_capacity != tables.header.user_capacity
        {
            tracing::warn!(
                "Peer tables hold {} objects and {} users, local {} and {}",
                payload.header.object_capacity,
                payload.header.user_capacity,
                tables.header.object_capacity,
                tables.header.user_capacity
            );
        }
        tables.header.persist_sequence = payload.header.persist_sequence;
        Ok(())
    }
}
