//! Configuration Tables
//!
//! Fixed-capacity tables of configuration entries, one slot per object
//! identity. Every entry type serializes to a bounded size so a table can be
//! shipped either entry by entry or as one contiguous image.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::TableConfig;
use crate::error::{Error, Result};

/// Object identifier
pub type ObjectId = u32;

/// Identifier used for unused slots
pub const INVALID_OBJECT_ID: ObjectId = u32::MAX;

/// Magic number stamped into the system DB header
pub const SYSTEM_DB_MAGIC: u64 = 0x4346_4744_4248_4452;

/// Configuration table types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TableType {
    #[default]
    User,
    Object,
    Edge,
    GlobalInfo,
    SystemSpare,
    KeyMemory,
}

impl TableType {
    /// Tables that hold entries, in push order
    pub const ENTRY_TABLES: [TableType; 5] = [
        TableType::User,
        TableType::Object,
        TableType::Edge,
        TableType::GlobalInfo,
        TableType::SystemSpare,
    ];

    /// Region code used by bulk copies
    pub fn code(self) -> u16 {
        match self {
            TableType::User => 1,
            TableType::Object => 2,
            TableType::Edge => 3,
            TableType::GlobalInfo => 4,
            TableType::SystemSpare => 5,
            TableType::KeyMemory => 6,
        }
    }

    /// Look up a table by region code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(TableType::User),
            2 => Some(TableType::Object),
            3 => Some(TableType::Edge),
            4 => Some(TableType::GlobalInfo),
            5 => Some(TableType::SystemSpare),
            6 => Some(TableType::KeyMemory),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TableType::User => "user",
            TableType::Object => "object",
            TableType::Edge => "edge",
            TableType::GlobalInfo => "global_info",
            TableType::SystemSpare => "system_spare",
            TableType::KeyMemory => "key_memory",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryState {
    #[default]
    Invalid,
    Valid,
    /// Staged in a transaction, becomes Valid on commit
    Create,
    /// Staged in a transaction, becomes Valid on commit
    Modify,
    /// Staged in a transaction, frees the slot on commit
    Destroy,
}

/// Header carried by every table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub object_id: ObjectId,
    /// Assigned when the entry is committed; 0 means unassigned
    pub entry_id: u64,
    pub state: EntryState,
    /// Serialized size of the entry as known by the writer
    pub size: u32,
}

impl Default for EntryHeader {
    fn default() -> Self {
        Self {
            object_id: INVALID_OBJECT_ID,
            entry_id: 0,
            state: EntryState::Invalid,
            size: 0,
        }
    }
}

impl EntryHeader {
    pub fn new(object_id: ObjectId, state: EntryState) -> Self {
        Self {
            object_id,
            state,
            ..Default::default()
        }
    }
}

/// Behaviour shared by all fixed-size table entries
pub trait TableEntry:
    Serialize + DeserializeOwned + Clone + Default + fmt::Debug + Send + Sync + 'static
{
    const TABLE: TableType;

    fn header(&self) -> &EntryHeader;
    fn header_mut(&mut self) -> &mut EntryHeader;

    /// Slot of this entry in its table
    fn slot(&self, _edges_per_object: usize) -> usize {
        self.header().object_id as usize
    }

    /// The instance with the longest serialization
    fn largest() -> Self {
        Self::default()
    }

    fn is_valid(&self) -> bool {
        self.header().state == EntryState::Valid
    }
}

/// Serialized size of the largest instance of an entry type
pub fn entry_size<E: TableEntry>() -> usize {
    bincode::serialized_size(&E::largest()).unwrap_or(0) as usize
}

/// User table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserEntry {
    pub header: EntryHeader,
    pub class_id: u32,
    pub user_data: [u64; 8],
}

/// Object table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectEntry {
    pub header: EntryHeader,
    pub class_id: u32,
    pub set_config: [u64; 16],
}

/// Edge table entry, connecting a client object to a server object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EdgeEntry {
    pub header: EntryHeader,
    pub client_index: u16,
    pub server_id: ObjectId,
    pub capacity: u64,
    pub offset: u64,
}

/// System spare table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemSpareEntry {
    pub header: EntryHeader,
    pub spare_object_id: ObjectId,
    pub drive_type: u32,
    pub capacity: u64,
}

/// Global settings, one slot per kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalInfo {
    SystemGeneration { generation: u64 },
    PowerSave { enabled: bool, idle_time_secs: u64 },
    EncryptionMode { mode: u32, paused: bool },
    SpareConfig { permanent_spare_delay_secs: u64 },
    TimeThreshold { time_threshold_minutes: u64 },
    BackgroundServices { enabled_flags: u32 },
    PvdConfig { drive_flags: u32 },
}

impl GlobalInfo {
    /// Number of global info slots
    pub const SLOTS: usize = 7;

    pub fn slot(&self) -> usize {
        match self {
            GlobalInfo::SystemGeneration { .. } => 0,
            GlobalInfo::PowerSave { .. } => 1,
            GlobalInfo::EncryptionMode { .. } => 2,
            GlobalInfo::SpareConfig { .. } => 3,
            GlobalInfo::TimeThreshold { .. } => 4,
            GlobalInfo::BackgroundServices { .. } => 5,
            GlobalInfo::PvdConfig { .. } => 6,
        }
    }

    /// Factory settings for every slot
    pub fn defaults() -> [GlobalInfo; Self::SLOTS] {
        [
            GlobalInfo::SystemGeneration { generation: 0 },
            GlobalInfo::PowerSave { enabled: false, idle_time_secs: 1800 },
            GlobalInfo::EncryptionMode { mode: 0, paused: false },
            GlobalInfo::SpareConfig { permanent_spare_delay_secs: 300 },
            GlobalInfo::TimeThreshold { time_threshold_minutes: 5 },
            GlobalInfo::BackgroundServices { enabled_flags: u32::MAX },
            GlobalInfo::PvdConfig { drive_flags: 0 },
        ]
    }
}

impl Default for GlobalInfo {
    fn default() -> Self {
        GlobalInfo::SystemGeneration { generation: 0 }
    }
}

/// Global info table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GlobalInfoEntry {
    pub header: EntryHeader,
    pub info: GlobalInfo,
}

impl GlobalInfoEntry {
    pub fn new(info: GlobalInfo) -> Self {
        Self {
            header: EntryHeader::new(info.slot() as ObjectId, EntryState::Valid),
            info,
        }
    }
}

impl TableEntry for UserEntry {
    const TABLE: TableType = TableType::User;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }
}

impl TableEntry for ObjectEntry {
    const TABLE: TableType = TableType::Object;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }
}

impl TableEntry for EdgeEntry {
    const TABLE: TableType = TableType::Edge;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }

    fn slot(&self, edges_per_object: usize) -> usize {
        self.header.object_id as usize * edges_per_object + self.client_index as usize
    }
}

impl TableEntry for GlobalInfoEntry {
    const TABLE: TableType = TableType::GlobalInfo;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }

    fn slot(&self, _edges_per_object: usize) -> usize {
        self.info.slot()
    }

    fn largest() -> Self {
        GlobalInfo::defaults()
            .into_iter()
            .map(GlobalInfoEntry::new)
            .max_by_key(|entry| bincode::serialized_size(entry).unwrap_or(0))
            .unwrap_or_default()
    }
}

impl TableEntry for SystemSpareEntry {
    const TABLE: TableType = TableType::SystemSpare;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }
}

/// One entry of any table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigEntry {
    User(UserEntry),
    Object(ObjectEntry),
    Edge(EdgeEntry),
    GlobalInfo(GlobalInfoEntry),
    SystemSpare(SystemSpareEntry),
}

impl Default for ConfigEntry {
    fn default() -> Self {
        ConfigEntry::User(UserEntry::default())
    }
}

impl ConfigEntry {
    pub fn table(&self) -> TableType {
        match self {
            ConfigEntry::User(_) => TableType::User,
            ConfigEntry::Object(_) => TableType::Object,
            ConfigEntry::Edge(_) => TableType::Edge,
            ConfigEntry::GlobalInfo(_) => TableType::GlobalInfo,
            ConfigEntry::SystemSpare(_) => TableType::SystemSpare,
        }
    }

    pub fn header(&self) -> &EntryHeader {
        match self {
            ConfigEntry::User(e) => e.header(),
            ConfigEntry::Object(e) => e.header(),
            ConfigEntry::Edge(e) => e.header(),
            ConfigEntry::GlobalInfo(e) => e.header(),
            ConfigEntry::SystemSpare(e) => e.header(),
        }
    }

    pub fn header_mut(&mut self) -> &mut EntryHeader {
        match self {
            ConfigEntry::User(e) => e.header_mut(),
            ConfigEntry::Object(e) => e.header_mut(),
            ConfigEntry::Edge(e) => e.header_mut(),
            ConfigEntry::GlobalInfo(e) => e.header_mut(),
            ConfigEntry::SystemSpare(e) => e.header_mut(),
        }
    }

    /// Slot of the entry in its table
    pub fn slot(&self, edges_per_object: usize) -> usize {
        match self {
            ConfigEntry::User(e) => e.slot(edges_per_object),
            ConfigEntry::Object(e) => e.slot(edges_per_object),
            ConfigEntry::Edge(e) => e.slot(edges_per_object),
            ConfigEntry::GlobalInfo(e) => e.slot(edges_per_object),
            ConfigEntry::SystemSpare(e) => e.slot(edges_per_object),
        }
    }

    /// Size this node knows for entries of the same table
    pub fn known_size(&self) -> usize {
        match self {
            ConfigEntry::User(_) => entry_size::<UserEntry>(),
            ConfigEntry::Object(_) => entry_size::<ObjectEntry>(),
            ConfigEntry::Edge(_) => entry_size::<EdgeEntry>(),
            ConfigEntry::GlobalInfo(_) => entry_size::<GlobalInfoEntry>(),
            ConfigEntry::SystemSpare(_) => entry_size::<SystemSpareEntry>(),
        }
    }

    /// Record the local entry size in the header
    pub fn stamp_size(&mut self) {
        let size = self.known_size() as u32;
        self.header_mut().size = size;
    }

    /// Largest entry of any table
    pub fn largest() -> Self {
        [
            ConfigEntry::User(UserEntry::largest()),
            ConfigEntry::Object(ObjectEntry::largest()),
            ConfigEntry::Edge(EdgeEntry::largest()),
            ConfigEntry::GlobalInfo(GlobalInfoEntry::largest()),
            ConfigEntry::SystemSpare(SystemSpareEntry::largest()),
        ]
        .into_iter()
        .max_by_key(|entry| bincode::serialized_size(entry).unwrap_or(0))
        .unwrap_or_default()
    }
}

/// A fixed-capacity table of one entry type
#[derive(Debug, Clone)]
pub struct ConfigTable<E: TableEntry> {
    entries: Vec<E>,
}

impl<E: TableEntry> ConfigTable<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![E::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> Option<&E> {
        self.entries.get(index)
    }

    pub fn set(&mut self, index: usize, entry: E) -> Result<()> {
        let capacity = self.entries.len();
        match self.entries.get_mut(index) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(Error::EntryOutOfRange {
                table: E::TABLE.name(),
                index,
                capacity,
            }),
        }
    }

    pub fn clear_slot(&mut self, index: usize) -> Result<()> {
        self.set(index, E::default())
    }

    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = E::default();
        }
    }

    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, &E)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
    }

    pub fn valid_count(&self) -> usize {
        self.valid_entries().count()
    }

    /// Size of one slot in the table image
    pub fn slot_size() -> usize {
        entry_size::<E>()
    }

    /// Size of the whole table image
    pub fn image_size(&self) -> usize {
        Self::slot_size() * self.entries.len()
    }

    /// Contiguous image of the table, one zero-padded slot per entry
    pub fn image(&self) -> Result<Vec<u8>> {
        let slot = Self::slot_size();
        let mut image = vec![0u8; self.image_size()];
        for (index, entry) in self.entries.iter().enumerate() {
            let bytes = bincode::serialize(entry)?;
            if bytes.len() > slot {
                return Err(Error::Table(format!(
                    "{} entry {} encodes to {} bytes, slot is {}",
                    E::TABLE,
                    index,
                    bytes.len(),
                    slot
                )));
            }
            image[index * slot..index * slot + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(image)
    }

    /// Replace the table contents from an image produced by [`image`](Self::image)
    pub fn load_image(&mut self, image: &[u8]) -> Result<()> {
        let slot = Self::slot_size();
        if image.len() != self.image_size() {
            return Err(Error::Table(format!(
                "{} image is {} bytes, expected {}",
                E::TABLE,
                image.len(),
                self.image_size()
            )));
        }
        for (index, chunk) in image.chunks(slot).enumerate() {
            // Never-written slots arrive as zeros
            self.entries[index] = if chunk.iter().all(|b| *b == 0) {
                E::default()
            } else {
                bincode::deserialize(chunk)?
            };
        }
        Ok(())
    }
}

/// Header describing the persisted system database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDbHeader {
    pub magic: u64,
    /// Serialized size of the header as known by the writer
    pub size: u32,
    pub persist_sequence: u64,
    pub user_capacity: u32,
    pub object_capacity: u32,
    pub edges_per_object: u32,
    pub system_spare_capacity: u32,
}

impl Default for SystemDbHeader {
    fn default() -> Self {
        Self {
            magic: SYSTEM_DB_MAGIC,
            size: 0,
            persist_sequence: 0,
            user_capacity: 0,
            object_capacity: 0,
            edges_per_object: 0,
            system_spare_capacity: 0,
        }
    }
}

impl SystemDbHeader {
    pub fn new(config: &TableConfig) -> Self {
        let mut header = Self {
            user_capacity: config.user_capacity as u32,
            object_capacity: config.object_capacity as u32,
            edges_per_object: config.edges_per_object as u32,
            system_spare_capacity: config.system_spare_capacity as u32,
            ..Default::default()
        };
        header.size = Self::local_size() as u32;
        header
    }

    /// Serialized size of the header this node understands
    pub fn local_size() -> usize {
        bincode::serialized_size(&SystemDbHeader::default()).unwrap_or(0) as usize
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SYSTEM_DB_MAGIC
    }
}

/// Persisted form of the configuration tables
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigSnapshot {
    pub header: SystemDbHeader,
    pub entries: Vec<ConfigEntry>,
    pub key_memory: Vec<u8>,
    pub persisted_at: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    /// A snapshot holding no entries at all
    pub fn empty(config: &TableConfig) -> Self {
        Self {
            header: SystemDbHeader::new(config),
            ..Default::default()
        }
    }
}

/// All configuration tables of a node
#[derive(Debug, Clone)]
pub struct ConfigTables {
    pub user: ConfigTable<UserEntry>,
    pub object: ConfigTable<ObjectEntry>,
    pub edge: ConfigTable<EdgeEntry>,
    pub global_info: ConfigTable<GlobalInfoEntry>,
    pub system_spare: ConfigTable<SystemSpareEntry>,
    pub key_memory: Vec<u8>,
    pub header: SystemDbHeader,
    edges_per_object: usize,
}

impl ConfigTables {
    /// Empty tables sized by the configuration
    pub fn new(config: &TableConfig) -> Self {
        Self {
            user: ConfigTable::new(config.user_capacity),
            object: ConfigTable::new(config.object_capacity),
            edge: ConfigTable::new(config.object_capacity * config.edges_per_object),
            global_info: ConfigTable::new(GlobalInfo::SLOTS),
            system_spare: ConfigTable::new(config.system_spare_capacity),
            key_memory: vec![0u8; config.key_memory_size],
            header: SystemDbHeader::new(config),
            edges_per_object: config.edges_per_object,
        }
    }

    /// Tables of a freshly installed system: factory global settings only
    pub fn with_defaults(config: &TableConfig) -> Self {
        let mut tables = Self::new(config);
        for info in GlobalInfo::defaults() {
            let slot = info.slot();
            let mut entry = GlobalInfoEntry::new(info);
            entry.header.size = entry_size::<GlobalInfoEntry>() as u32;
            // Slots are sized for every kind, so this cannot fail
            let _ = tables.global_info.set(slot, entry);
        }
        tables
    }

    /// Drop every entry, keeping the table shapes
    pub fn reset(&mut self) {
        self.user.reset();
        self.object.reset();
        self.edge.reset();
        self.global_info.reset();
        self.system_spare.reset();
        self.key_memory.iter_mut().for_each(|b| *b = 0);
        self.header.persist_sequence = 0;
    }

    pub fn edges_per_object(&self) -> usize {
        self.edges_per_object
    }

    /// Store an entry in its slot.
    ///
    /// Staged states resolve here: `Create`/`Modify` become `Valid` and
    /// `Destroy` frees the slot.
    pub fn apply(&mut self, entry: &ConfigEntry) -> Result<()> {
        let epo = self.edges_per_object;
        match entry {
            ConfigEntry::User(e) => store(&mut self.user, e.clone(), epo),
            ConfigEntry::Object(e) => store(&mut self.object, e.clone(), epo),
            ConfigEntry::Edge(e) => store(&mut self.edge, e.clone(), epo),
            ConfigEntry::GlobalInfo(e) => store(&mut self.global_info, e.clone(), epo),
            ConfigEntry::SystemSpare(e) => store(&mut self.system_spare, e.clone(), epo),
        }
    }

    /// Snapshot of the valid entries of one table
    pub fn valid_entries(&self, table: TableType) -> Vec<ConfigEntry> {
        match table {
            TableType::User => collect(&self.user, ConfigEntry::User),
            TableType::Object => collect(&self.object, ConfigEntry::Object),
            TableType::Edge => collect(&self.edge, ConfigEntry::Edge),
            TableType::GlobalInfo => collect(&self.global_info, ConfigEntry::GlobalInfo),
            TableType::SystemSpare => collect(&self.system_spare, ConfigEntry::SystemSpare),
            TableType::KeyMemory => Vec::new(),
        }
    }

    /// Number of valid entries across all entry tables
    pub fn valid_count(&self) -> usize {
        self.user.valid_count()
            + self.object.valid_count()
            + self.edge.valid_count()
            + self.global_info.valid_count()
            + self.system_spare.valid_count()
    }

    pub fn image_size(&self, table: TableType) -> usize {
        match table {
            TableType::User => self.user.image_size(),
            TableType::Object => self.object.image_size(),
            TableType::Edge => self.edge.image_size(),
            TableType::GlobalInfo => self.global_info.image_size(),
            TableType::SystemSpare => self.system_spare.image_size(),
            TableType::KeyMemory => self.key_memory.len(),
        }
    }

    pub fn image(&self, table: TableType) -> Result<Vec<u8>> {
        match table {
            TableType::User => self.user.image(),
            TableType::Object => self.object.image(),
            TableType::Edge => self.edge.image(),
            TableType::GlobalInfo => self.global_info.image(),
            TableType::SystemSpare => self.system_spare.image(),
            TableType::KeyMemory => Ok(self.key_memory.clone()),
        }
    }

    pub fn load_image(&mut self, table: TableType, image: &[u8]) -> Result<()> {
        match table {
            TableType::User => self.user.load_image(image),
            TableType::Object => self.object.load_image(image),
            TableType::Edge => self.edge.load_image(image),
            TableType::GlobalInfo => self.global_info.load_image(image),
            TableType::SystemSpare => self.system_spare.load_image(image),
            TableType::KeyMemory => {
                if image.len() != self.key_memory.len() {
                    return Err(Error::Table(format!(
                        "key memory image is {} bytes, expected {}",
                        image.len(),
                        self.key_memory.len()
                    )));
                }
                self.key_memory.copy_from_slice(image);
                Ok(())
            }
        }
    }

    /// Current system generation
    pub fn generation(&self) -> u64 {
        self.global_info
            .get(0)
            .and_then(|entry| match entry.info {
                GlobalInfo::SystemGeneration { generation } if entry.is_valid() => {
                    Some(generation)
                }
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Entry carrying the next system generation
    pub fn next_generation_entry(&self) -> GlobalInfoEntry {
        let mut entry = GlobalInfoEntry::new(GlobalInfo::SystemGeneration {
            generation: self.generation() + 1,
        });
        entry.header.state = EntryState::Modify;
        entry
    }

    /// Persistable form of the tables
    pub fn snapshot(&self) -> ConfigSnapshot {
        let entries = TableType::ENTRY_TABLES
            .iter()
            .flat_map(|table| self.valid_entries(*table))
            .collect();
        ConfigSnapshot {
            header: self.header.clone(),
            entries,
            key_memory: self.key_memory.clone(),
            persisted_at: Some(Utc::now()),
        }
    }

    /// Rebuild tables from a persisted snapshot
    pub fn from_snapshot(config: &TableConfig, snapshot: &ConfigSnapshot) -> Result<Self> {
        let mut tables = Self::new(config);
        if snapshot.header.is_valid() {
            tables.header.persist_sequence = snapshot.header.persist_sequence;
        }
        for entry in &snapshot.entries {
            tables.apply(entry)?;
        }
        let len = snapshot.key_memory.len().min(tables.key_memory.len());
        tables.key_memory[..len].copy_from_slice(&snapshot.key_memory[..len]);
        Ok(tables)
    }
}

fn store<E: TableEntry>(table: &mut ConfigTable<E>, mut entry: E, edges_per_object: usize) -> Result<()> {
    let slot = entry.slot(edges_per_object);
    match entry.header().state {
        EntryState::Destroy | EntryState::Invalid => table.clear_slot(slot),
        EntryState::Create | EntryState::Modify | EntryState::Valid => {
            entry.header_mut().state = EntryState::Valid;
            table.set(slot, entry)
        }
    }
}

fn collect<E: TableEntry>(table: &ConfigTable<E>, wrap: fn(E) -> ConfigEntry) -> Vec<ConfigEntry> {
    table
        .valid_entries()
        .map(|(_, entry)| wrap(entry.clone()))
        .collect()
}
