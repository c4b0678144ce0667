//! Durable Storage Boundary
//!
//! The orchestrator loads and persists the system configuration through
//! [`DurableStorage`]; what runtime objects a configuration produces is left
//! to an [`ObjectBuilder`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::database::tables::{ConfigSnapshot, ConfigTables};
use crate::error::{Error, Result};

const SYSTEM_CONFIG_FILE: &str = "system_config.json";
const NONPAGED_FILE: &str = "nonpaged_metadata.json";

/// Metadata that must be in memory before any object exists
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NonPagedMetadata {
    pub object_count: u64,
    pub generation: u64,
}

/// Durable storage used by the orchestrator
#[async_trait]
pub trait DurableStorage: Send + Sync {
    /// Load the persisted configuration; `None` on a fresh system
    async fn load_system_config(&self) -> Result<Option<ConfigSnapshot>>;

    /// Persist the configuration
    async fn persist_system_config(&self, snapshot: &ConfigSnapshot) -> Result<()>;

    /// Load non-paged metadata into memory
    async fn load_nonpaged_metadata(&self) -> Result<NonPagedMetadata>;

    /// Drop non-paged metadata held in memory
    async fn clear_nonpaged_metadata(&self) -> Result<()>;
}

/// Creates runtime objects from configuration tables
#[async_trait]
pub trait ObjectBuilder: Send + Sync {
    async fn create_objects(&self, tables: &ConfigTables) -> Result<()>;
}

/// Persist the tables under the next persist sequence
pub async fn persist_tables(storage: &dyn DurableStorage, tables: &RwLock<ConfigTables>) -> Result<()> {
    let snapshot = {
        let mut tables = tables.write();
        tables.header.persist_sequence += 1;
        tables.snapshot()
    };
    tracing::debug!(
        "Persisting {} entries, sequence {}",
        snapshot.entries.len(),
        snapshot.header.persist_sequence
    );
    storage.persist_system_config(&snapshot).await
}

/// Builder that only records how many objects a configuration describes
#[derive(Debug, Default)]
pub struct LoggingObjectBuilder {
    created: AtomicUsize,
}

impl LoggingObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects created by the last call
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectBuilder for LoggingObjectBuilder {
    async fn create_objects(&self, tables: &ConfigTables) -> Result<()> {
        let count = tables.object.valid_count();
        tracing::info!(
            "Creating {} objects ({} users, {} edges, generation {})",
            count,
            tables.user.valid_count(),
            tables.edge.valid_count(),
            tables.generation()
        );
        self.created.store(count, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON files under the node's data directory
pub struct FileStorage {
    dir: PathBuf,
    nonpaged: Mutex<Option<NonPagedMetadata>>,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            nonpaged: Mutex::new(None),
        })
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join(SYSTEM_CONFIG_FILE)
    }

    fn nonpaged_path(&self) -> PathBuf {
        self.dir.join(NONPAGED_FILE)
    }

    /// Non-paged metadata currently held in memory
    pub fn cached_nonpaged(&self) -> Option<NonPagedMetadata> {
        self.nonpaged.lock().clone()
    }
}

#[async_trait]
impl DurableStorage for FileStorage {
    async fn load_system_config(&self) -> Result<Option<ConfigSnapshot>> {
        let path = self.config_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: ConfigSnapshot = serde_json::from_slice(&bytes)?;
                if !snapshot.header.is_valid() {
                    return Err(Error::Storage(format!(
                        "{} has an invalid system header",
                        path.display()
                    )));
                }
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_system_config(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.dir.join(format!("{}.tmp", SYSTEM_CONFIG_FILE));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.config_path()).await?;

        let metadata = NonPagedMetadata {
            object_count: snapshot.entries.len() as u64,
            generation: snapshot.header.persist_sequence,
        };
        tokio::fs::write(self.nonpaged_path(), serde_json::to_vec(&metadata)?).await?;
        Ok(())
    }

    async fn load_nonpaged_metadata(&self) -> Result<NonPagedMetadata> {
        let metadata = match tokio::fs::read(self.nonpaged_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NonPagedMetadata::default(),
            Err(e) => return Err(e.into()),
        };
        *self.nonpaged.lock() = Some(metadata.clone());
        Ok(metadata)
    }

    async fn clear_nonpaged_metadata(&self) -> Result<()> {
        self.nonpaged.lock().take();
        Ok(())
    }
}

/// In-memory storage for tests and simulations
#[derive(Default)]
pub struct MemoryStorage {
    snapshot: Mutex<Option<ConfigSnapshot>>,
    nonpaged: Mutex<Option<NonPagedMetadata>>,
    persist_count: AtomicUsize,
    clear_count: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds a configuration
    pub fn with_snapshot(snapshot: ConfigSnapshot) -> Self {
        let storage = Self::default();
        *storage.snapshot.lock() = Some(snapshot);
        storage
    }

    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        self.snapshot.lock().clone()
    }

    pub fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clear_count.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn load_system_config(&self) -> Result<Option<ConfigSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn persist_system_config(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_nonpaged_metadata(&self) -> Result<NonPagedMetadata> {
        let metadata = NonPagedMetadata {
            object_count: self
                .snapshot
                .lock()
                .as_ref()
                .map(|s| s.entries.len() as u64)
                .unwrap_or(0),
            generation: 0,
        };
        *self.nonpaged.lock() = Some(metadata.clone());
        Ok(metadata)
    }

    async fn clear_nonpaged_metadata(&self) -> Result<()> {
        self.nonpaged.lock().take();
        self.clear_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::database::tables::{ConfigEntry, EntryHeader, EntryState, UserEntry};

    #[tokio::test]
    async fn test_file_storage_persists_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(storage.load_system_config().await.unwrap().is_none());

        let config = TableConfig::default();
        let mut tables = ConfigTables::with_defaults(&config);
        tables
            .apply(&ConfigEntry::User(UserEntry {
                header: EntryHeader::new(4, EntryState::Create),
                class_id: 1,
                ..Default::default()
            }))
            .unwrap();
        storage.persist_system_config(&tables.snapshot()).await.unwrap();

        let loaded = storage.load_system_config().await.unwrap().unwrap();
        let restored = ConfigTables::from_snapshot(&config, &loaded).unwrap();
        assert_eq!(restored.valid_count(), tables.valid_count());

        let metadata = storage.load_nonpaged_metadata().await.unwrap();
        assert_eq!(metadata.object_count, loaded.entries.len() as u64);
        assert!(storage.cached_nonpaged().is_some());
        storage.clear_nonpaged_metadata().await.unwrap();
        assert!(storage.cached_nonpaged().is_none());
    }

    #[tokio::test]
    async fn test_memory_storage_counts_calls() {
        let storage = MemoryStorage::new();
        storage
            .persist_system_config(&ConfigSnapshot::empty(&TableConfig::default()))
            .await
            .unwrap();
        storage.clear_nonpaged_metadata().await.unwrap();
        assert_eq!(storage.persist_count(), 1);
        assert_eq!(storage.clear_count(), 1);
        assert!(storage.load_system_config().await.unwrap().is_some());
    }
}
