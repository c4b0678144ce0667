//! Fixtures shared by the replication tests

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::TableConfig;
use crate::database::state::ServiceState;
use crate::messaging::{ClientId, LoopbackTransport, MessagePool, TransportAdapter, WorkQueue};
use crate::replication::protocol;
use crate::replication::sync::Messenger;

/// A messenger whose peer never registered, so every exchange is local
pub(crate) struct Solo {
    pub messenger: Arc<Messenger>,
    _peer: LoopbackTransport,
    _shutdown: watch::Sender<bool>,
}

pub(crate) fn solo(state: Arc<ServiceState>, pool_capacity: usize) -> Solo {
    let (local, peer, _control) = LoopbackTransport::pair(1, Duration::from_millis(1));
    let pool = Arc::new(MessagePool::new(pool_capacity, protocol::max_message_size()));
    let adapter = TransportAdapter::new(ClientId::DATABASE, pool, Arc::new(WorkQueue::new()), Arc::new(local));
    adapter.attach().expect("attach");
    let (shutdown_tx, shutdown) = watch::channel(false);
    let messenger = Arc::new(Messenger::new(
        adapter,
        state,
        1,
        Duration::from_millis(100),
        Duration::from_millis(1),
        shutdown,
    ));
    Solo {
        messenger,
        _peer: peer,
        _shutdown: shutdown_tx,
    }
}

pub(crate) fn small_tables() -> TableConfig {
    TableConfig {
        user_capacity: 16,
        object_capacity: 16,
        edges_per_object: 2,
        system_spare_capacity: 4,
        key_memory_size: 32,
    }
}
