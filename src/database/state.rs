//! Database Service State
//!
//! Process-wide observable state of one node: database state, role, peer
//! view and the push counters that gate a passive boot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

/// Why a node entered service mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceModeReason {
    #[default]
    Unknown,
    /// Peer sent a core structure larger than this node understands
    VersionMismatch,
    /// Persisted configuration could not be loaded
    ConfigLoadFailed,
    /// Active node could not push its configuration
    PushFailed,
    /// Peer unreachable while still reported alive
    PeerUnresponsive,
}

impl fmt::Display for ServiceModeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceModeReason::Unknown => "UNKNOWN",
            ServiceModeReason::VersionMismatch => "VERSION_MISMATCH",
            ServiceModeReason::ConfigLoadFailed => "CONFIG_LOAD_FAILED",
            ServiceModeReason::PushFailed => "PUSH_FAILED",
            ServiceModeReason::PeerUnresponsive => "PEER_UNRESPONSIVE",
        };
        f.write_str(name)
    }
}

/// Database state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseState {
    Initializing,
    WaitingForConfig,
    Ready,
    Corrupt,
    Failed,
    /// Degraded, terminal until operator action
    ServiceMode(ServiceModeReason),
}

impl DatabaseState {
    pub fn is_service_mode(&self) -> bool {
        matches!(self, DatabaseState::ServiceMode(_))
    }

    /// Whether the state is still part of a boot attempt
    pub fn is_booting(&self) -> bool {
        matches!(self, DatabaseState::Initializing | DatabaseState::WaitingForConfig)
    }
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseState::Initializing => write!(f, "INITIALIZING"),
            DatabaseState::WaitingForConfig => write!(f, "WAITING_FOR_CONFIG"),
            DatabaseState::Ready => write!(f, "READY"),
            DatabaseState::Corrupt => write!(f, "CORRUPT"),
            DatabaseState::Failed => write!(f, "FAILED"),
            DatabaseState::ServiceMode(reason) => write!(f, "SERVICE_MODE({})", reason),
        }
    }
}

/// Role of a node in the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Active,
    Passive,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Active => write!(f, "ACTIVE"),
            NodeRole::Passive => write!(f, "PASSIVE"),
        }
    }
}

/// This node's view of the peer's database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Unknown,
    Initializing,
    Ready,
    ServiceMode,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Unknown => write!(f, "UNKNOWN"),
            PeerState::Initializing => write!(f, "INITIALIZING"),
            PeerState::Ready => write!(f, "READY"),
            PeerState::ServiceMode => write!(f, "SERVICE_MODE"),
        }
    }
}

/// Pool statistics included in a status snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub high_water: usize,
    pub allocation_failures: u64,
}

/// Serializable view of a node for monitoring and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub node_id: String,
    pub state: String,
    pub role: NodeRole,
    pub peer_state: PeerState,
    pub peer_alive: bool,
    pub updates_sent_by_active: u64,
    pub updates_received: u64,
    pub updates_sent: u64,
    pub peer_version: Option<u64>,
    pub ndu_in_progress: bool,
    pub peer_service_mode: bool,
    pub valid_entries: usize,
    pub generation: u64,
    pub pool: PoolStats,
}

/// Shared state of one node
pub struct ServiceState {
    state_tx: watch::Sender<DatabaseState>,
    role: RwLock<NodeRole>,
    peer_state: RwLock<PeerState>,
    /// Total announced by the active node's UpdateConfigDone
    updates_sent_by_active: AtomicU64,
    /// Updates applied from the current push
    updates_received: AtomicU64,
    /// Updates this node sent in its last push
    updates_sent: AtomicU64,
    config_done_received: AtomicBool,
    peer_version: RwLock<Option<u64>>,
    ndu_in_progress: AtomicBool,
    peer_service_mode: AtomicBool,
}

impl ServiceState {
    pub fn new(role: NodeRole) -> Self {
        let (state_tx, _) = watch::channel(DatabaseState::Initializing);
        Self {
            state_tx,
            role: RwLock::new(role),
            peer_state: RwLock::new(PeerState::Unknown),
            updates_sent_by_active: AtomicU64::new(0),
            updates_received: AtomicU64::new(0),
            updates_sent: AtomicU64::new(0),
            config_done_received: AtomicBool::new(false),
            peer_version: RwLock::new(None),
            ndu_in_progress: AtomicBool::new(false),
            peer_service_mode: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DatabaseState {
        *self.state_tx.borrow()
    }

    /// Move to a new state. Service mode is terminal and is never left.
    pub fn set_state(&self, state: DatabaseState) {
        self.state_tx.send_if_modified(|current| {
            if current.is_service_mode() || *current == state {
                return false;
            }
            tracing::info!("Database state {} -> {}", current, state);
            *current = state;
            true
        });
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<DatabaseState> {
        self.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DatabaseState::Ready
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    pub fn set_role(&self, role: NodeRole) {
        let mut current = self.role.write();
        if *current != role {
            tracing::info!("Node role {} -> {}", *current, role);
            *current = role;
        }
    }

    pub fn is_active(&self) -> bool {
        self.role() == NodeRole::Active
    }

    pub fn peer_state(&self) -> PeerState {
        *self.peer_state.read()
    }

    pub fn set_peer_state(&self, state: PeerState) {
        *self.peer_state.write() = state;
    }

    pub fn updates_sent_by_active(&self) -> u64 {
        self.updates_sent_by_active.load(Ordering::SeqCst)
    }

    pub fn updates_received(&self) -> u64 {
        self.updates_received.load(Ordering::SeqCst)
    }

    pub fn updates_sent(&self) -> u64 {
        self.updates_sent.load(Ordering::SeqCst)
    }

    pub fn record_update_received(&self) -> u64 {
        self.updates_received.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_updates_sent(&self, count: u64) {
        self.updates_sent.store(count, Ordering::SeqCst);
    }

    /// Record the total announced at the end of a push
    pub fn record_config_done(&self, entries_sent: u64) {
        self.updates_sent_by_active.store(entries_sent, Ordering::SeqCst);
        self.config_done_received.store(true, Ordering::SeqCst);
    }

    pub fn config_done_received(&self) -> bool {
        self.config_done_received.load(Ordering::SeqCst)
    }

    /// Whether everything the active node announced has arrived
    pub fn push_complete(&self) -> bool {
        self.config_done_received() && self.updates_sent_by_active() == self.updates_received()
    }

    /// Forget everything learned from a push
    pub fn reset_counters(&self) {
        self.updates_sent_by_active.store(0, Ordering::SeqCst);
        self.updates_received.store(0, Ordering::SeqCst);
        self.config_done_received.store(false, Ordering::SeqCst);
    }

    pub fn peer_version(&self) -> Option<u64> {
        *self.peer_version.read()
    }

    /// Record the peer's software version and derive the upgrade flag
    pub fn set_peer_version(&self, version: u64, local_version: u64) {
        *self.peer_version.write() = Some(version);
        let ndu = version != local_version;
        if ndu != self.ndu_in_progress.swap(ndu, Ordering::SeqCst) {
            tracing::info!(
                "Peer version {:#x}, local {:#x}: upgrade in progress = {}",
                version,
                local_version,
                ndu
            );
        }
    }

    pub fn ndu_in_progress(&self) -> bool {
        self.ndu_in_progress.load(Ordering::SeqCst)
    }

    pub fn peer_service_mode(&self) -> bool {
        self.peer_service_mode.load(Ordering::SeqCst)
    }

    pub fn set_peer_service_mode(&self, value: bool) {
        self.peer_service_mode.store(value, Ordering::SeqCst);
        if value {
            self.set_peer_state(PeerState::ServiceMode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_mode_is_terminal() {
        let state = ServiceState::new(NodeRole::Active);
        state.set_state(DatabaseState::Ready);
        state.set_state(DatabaseState::ServiceMode(ServiceModeReason::VersionMismatch));
        state.set_state(DatabaseState::Initializing);
        assert_eq!(
            state.state(),
            DatabaseState::ServiceMode(ServiceModeReason::VersionMismatch)
        );
    }

    #[test]
    fn test_push_complete_needs_done_and_equal_counts() {
        let state = ServiceState::new(NodeRole::Passive);
        assert!(!state.push_complete());
        state.record_update_received();
        state.record_update_received();
        state.record_config_done(3);
        assert!(!state.push_complete());
        state.record_update_received();
        assert!(state.push_complete());

        state.reset_counters();
        assert_eq!(state.updates_received(), 0);
        assert!(!state.push_complete());
    }

    #[test]
    fn test_peer_version_sets_ndu_flag() {
        let state = ServiceState::new(NodeRole::Active);
        state.set_peer_version(2, 2);
        assert!(!state.ndu_in_progress());
        state.set_peer_version(3, 2);
        assert!(state.ndu_in_progress());
        assert_eq!(state.peer_version(), Some(3));
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let state = ServiceState::new(NodeRole::Passive);
        let mut rx = state.subscribe();
        state.set_state(DatabaseState::WaitingForConfig);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), DatabaseState::WaitingForConfig);
    }
}
