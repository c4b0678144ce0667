//! Request/Confirm Protocol
//!
//! Gives the asynchronous transport synchronous call semantics. A call
//! waits first for the transport to accept the message, then, for request
//! kinds that have a confirmation, for the peer's confirm. Both waits are
//! bounded. Transport failures and timeouts are hard errors only while the
//! peer is still reported alive; a peer that died concurrently lets the
//! caller continue unilaterally.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use crate::database::state::ServiceState;
use crate::error::{Error, Result};
use crate::messaging::{BulkWrite, Completion, MessageHandle, MessagePool, SendStatus, TransportAdapter};
use crate::replication::protocol::{self, ConfirmPayload, Message, MessageKind};

/// Allocation retries between two warnings
const ALLOC_WARN_EVERY: u64 = 100;

/// Independent confirm waits; at most one call is in flight per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmChannel {
    Transaction,
    /// Replicated commands and the negotiation probe
    ConfigChange,
    SystemDbHeader,
    TableChunk,
}

impl ConfirmChannel {
    pub const ALL: [ConfirmChannel; 4] = [
        ConfirmChannel::Transaction,
        ConfirmChannel::ConfigChange,
        ConfirmChannel::SystemDbHeader,
        ConfirmChannel::TableChunk,
    ];

    /// Channel a request's confirmation arrives on
    pub fn for_request(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::UpdateSystemDbHeader => Some(ConfirmChannel::SystemDbHeader),
            MessageKind::UpdateConfigTable => Some(ConfirmChannel::TableChunk),
            MessageKind::UnknownForTest => Some(ConfirmChannel::ConfigChange),
            kind if kind.is_transaction() && !kind.is_confirm() => Some(ConfirmChannel::Transaction),
            kind if kind.is_command() => Some(ConfirmChannel::ConfigChange),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConfirmChannel::Transaction => "transaction",
            ConfirmChannel::ConfigChange => "config_change",
            ConfirmChannel::SystemDbHeader => "system_db_header",
            ConfirmChannel::TableChunk => "table_chunk",
        }
    }
}

/// Result of a synchronous call that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Accepted by the peer; the kind has no confirmation
    Delivered,
    /// The peer's confirmation
    Confirmed(ConfirmPayload),
    /// The peer went away; continue without it
    Unilateral,
}

impl SyncOutcome {
    pub fn is_unilateral(&self) -> bool {
        matches!(self, SyncOutcome::Unilateral)
    }

    /// Turn a failed confirmation into an error
    pub fn check(self, kind: MessageKind) -> Result<SyncOutcome> {
        match &self {
            SyncOutcome::Confirmed(confirm) if !confirm.status.is_ok() => Err(Error::PeerRejected {
                kind: kind.name(),
                reason: confirm.err.to_string(),
            }),
            _ => Ok(self),
        }
    }
}

/// How a round trip puts its message on the wire
enum Outbound {
    Plain,
    Bulk(BulkWrite),
    #[cfg_attr(not(test), allow(dead_code))]
    Declared(usize),
}

struct Waiter {
    request: MessageKind,
    tx: oneshot::Sender<ConfirmPayload>,
}

/// Pending confirm waits keyed by channel
struct ConfirmRegistry {
    waiters: Mutex<HashMap<ConfirmChannel, Waiter>>,
    gates: HashMap<ConfirmChannel, tokio::sync::Mutex<()>>,
}

impl ConfirmRegistry {
    fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            gates: ConfirmChannel::ALL
                .iter()
                .map(|channel| (*channel, tokio::sync::Mutex::new(())))
                .collect(),
        }
    }

    fn register(&self, channel: ConfirmChannel, request: MessageKind) -> Result<oneshot::Receiver<ConfirmPayload>> {
        let mut waiters = self.waiters.lock();
        if let Some(existing) = waiters.get(&channel) {
            if !existing.tx.is_closed() {
                return Err(Error::ConfirmPending(channel.name()));
            }
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(channel, Waiter { request, tx });
        Ok(rx)
    }

    fn cancel(&self, channel: ConfirmChannel, request: MessageKind) {
        let mut waiters = self.waiters.lock();
        if waiters.get(&channel).map(|w| w.request) == Some(request) {
            waiters.remove(&channel);
        }
    }

    fn resolve(&self, channel: ConfirmChannel, payload: ConfirmPayload) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.get(&channel) {
            Some(waiter) if waiter.request.code() == payload.received_kind => {}
            _ => return false,
        }
        match waiters.remove(&channel) {
            Some(waiter) => waiter.tx.send(payload).is_ok(),
            None => false,
        }
    }

    fn unblock_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        // Dropping the senders wakes every waiter with a closed channel
        waiters.clear();
        count
    }
}

/// Sends messages to the peer on behalf of every replication component
pub struct Messenger {
    pool: Arc<MessagePool>,
    adapter: Arc<TransportAdapter>,
    state: Arc<ServiceState>,
    confirms: ConfirmRegistry,
    version: u64,
    sync_timeout: Duration,
    alloc_retry: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Messenger {
    pub fn new(
        adapter: Arc<TransportAdapter>,
        state: Arc<ServiceState>,
        version: u64,
        sync_timeout: Duration,
        alloc_retry: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool: adapter.pool().clone(),
            adapter,
            state,
            confirms: ConfirmRegistry::new(),
            version,
            sync_timeout,
            alloc_retry,
            shutdown,
        }
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    pub fn adapter(&self) -> &Arc<TransportAdapter> {
        &self.adapter
    }

    /// Software version this node reports to the peer
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_peer_alive(&self) -> bool {
        self.adapter.is_peer_alive()
    }

    pub fn record_peer_version(&self, version: u64) {
        self.state.set_peer_version(version, self.version);
    }

    /// Whether changes should be mirrored to the peer
    pub fn peer_update_allowed(&self) -> bool {
        self.is_peer_alive() && !self.state.peer_service_mode()
    }

    pub fn try_allocate(&self) -> Option<MessageHandle> {
        self.pool.allocate()
    }

    /// Allocate a message, polling while the pool is exhausted
    pub async fn allocate(&self) -> Result<MessageHandle> {
        let mut attempts = 0u64;
        loop {
            if let Some(handle) = self.pool.allocate() {
                return Ok(handle);
            }
            if *self.shutdown.borrow() {
                return Err(Error::ShuttingDown);
            }
            attempts += 1;
            if attempts % ALLOC_WARN_EVERY == 0 {
                tracing::warn!(
                    "Message pool exhausted, {} allocation attempts ({} outstanding)",
                    attempts,
                    self.pool.outstanding()
                );
            }
            tokio::time::sleep(self.alloc_retry).await;
        }
    }

    /// Send an allocated message; `completion` runs on the worker
    pub fn send(&self, handle: MessageHandle, message: &Message, completion: Completion) -> Result<()> {
        self.adapter.transmit(handle, message, completion)
    }

    pub fn send_bulk(
        &self,
        handle: MessageHandle,
        message: &Message,
        bulk: BulkWrite,
        completion: Completion,
    ) -> Result<()> {
        self.adapter.transmit_bulk(handle, message, bulk, completion)
    }

    /// Fire-and-forget send from a caller that may wait for a free message
    pub async fn notify(&self, message: Message) -> Result<()> {
        let handle = self.allocate().await?;
        self.send(handle, &message, Completion::Release)
    }

    /// Fire-and-forget send from the worker. Never waits: when the pool is
    /// empty the send moves to a task of its own, since only the worker can
    /// return messages to the pool.
    pub fn reply(self: &Arc<Self>, message: Message) {
        if let Some(handle) = self.try_allocate() {
            if let Err(e) = self.send(handle, &message, Completion::Release) {
                tracing::warn!("Reply {} not sent: {}", message.kind(), e);
            }
            return;
        }
        let messenger = self.clone();
        tokio::spawn(async move {
            let kind = message.kind();
            if let Err(e) = messenger.notify(message).await {
                tracing::warn!("Reply {} not sent: {}", kind, e);
            }
        });
    }

    /// Reply to a request with its confirmation
    pub fn confirm(self: &Arc<Self>, request: MessageKind, mut payload: ConfirmPayload) {
        let Some(kind) = request.confirm_for() else {
            tracing::debug!("{} has no confirmation", request);
            return;
        };
        payload.received_kind = request.code();
        payload.version = self.version;
        match Message::confirm(kind, payload) {
            Ok(message) => self.reply(message),
            Err(e) => tracing::error!("Could not build {}: {}", kind, e),
        }
    }

    /// Synchronous round trip
    pub async fn call(&self, message: Message) -> Result<SyncOutcome> {
        self.round_trip(message, Outbound::Plain).await
    }

    /// Synchronous round trip carrying a write into a peer region
    pub async fn call_bulk(&self, message: Message, bulk: BulkWrite) -> Result<SyncOutcome> {
        self.round_trip(message, Outbound::Bulk(bulk)).await
    }

    /// Round trip whose header declares `declared_size` body bytes, as a
    /// sender with a larger layout would
    #[cfg(test)]
    pub(crate) async fn call_declared(&self, message: Message, declared_size: usize) -> Result<SyncOutcome> {
        self.round_trip(message, Outbound::Declared(declared_size)).await
    }

    async fn round_trip(&self, message: Message, outbound: Outbound) -> Result<SyncOutcome> {
        let kind = message.kind();
        let channel = ConfirmChannel::for_request(kind);
        let _gate = match channel.and_then(|c| self.confirms.gates.get(&c)) {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        // The confirm can beat the transport ack, so wait on it before sending
        let confirm_rx = match channel {
            Some(channel) => Some(self.confirms.register(channel, kind)?),
            None => None,
        };
        let outcome = self.exchange(&message, outbound, confirm_rx).await;
        if let Some(channel) = channel {
            self.confirms.cancel(channel, kind);
        }
        outcome
    }

    async fn exchange(
        &self,
        message: &Message,
        outbound: Outbound,
        confirm_rx: Option<oneshot::Receiver<ConfirmPayload>>,
    ) -> Result<SyncOutcome> {
        let kind = message.kind();
        let handle = self.allocate().await?;
        let (tx, rx) = oneshot::channel();
        match outbound {
            Outbound::Plain => self.send(handle, message, Completion::Notify(tx))?,
            Outbound::Bulk(bulk) => self.send_bulk(handle, message, bulk, Completion::Notify(tx))?,
            Outbound::Declared(size) => {
                let bytes = match protocol::encode_declared(message, size) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.pool.release(handle);
                        return Err(e);
                    }
                };
                self.adapter
                    .transmit_encoded(handle, kind, bytes, None, Completion::Notify(tx))?
            }
        }

        let status = match tokio::time::timeout(self.sync_timeout, rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => return self.unless_alive(Error::Internal(format!("{} completion dropped", kind))),
            Err(_) => return self.unless_alive(self.timeout_error(kind, "transport")),
        };
        match status {
            SendStatus::Delivered => {}
            SendStatus::PeerNotPresent => {
                tracing::debug!("Peer not present for {}, continuing unilaterally", kind);
                return Ok(SyncOutcome::Unilateral);
            }
            SendStatus::PeerBusy => return self.unless_alive(Error::PeerBusy(kind.name())),
            SendStatus::Fatal => {
                return self.unless_alive(Error::SendFailed {
                    kind: kind.name(),
                    status: status.to_string(),
                })
            }
        }

        let Some(confirm_rx) = confirm_rx else {
            return Ok(SyncOutcome::Delivered);
        };
        match tokio::time::timeout(self.sync_timeout, confirm_rx).await {
            Ok(Ok(confirm)) => {
                self.record_peer_version(confirm.version);
                Ok(SyncOutcome::Confirmed(confirm))
            }
            // Unblocked by a peer loss
            Ok(Err(_)) => Ok(SyncOutcome::Unilateral),
            Err(_) => self.unless_alive(self.timeout_error(kind, "confirm")),
        }
    }

    fn timeout_error(&self, kind: MessageKind, phase: &'static str) -> Error {
        Error::PeerTimeout {
            kind: kind.name(),
            phase,
            timeout_ms: self.sync_timeout.as_millis() as u64,
        }
    }

    /// A failure is only real while the peer is still alive
    fn unless_alive(&self, error: Error) -> Result<SyncOutcome> {
        if self.is_peer_alive() {
            tracing::warn!("{}", error);
            Err(error)
        } else {
            tracing::info!("Peer gone ({}), continuing unilaterally", error);
            Ok(SyncOutcome::Unilateral)
        }
    }

    /// Hand a received confirmation to its waiting caller
    pub fn resolve(&self, kind: MessageKind, payload: ConfirmPayload) {
        let request = MessageKind::from_code(payload.received_kind);
        let channel = request.and_then(ConfirmChannel::for_request);
        match channel {
            Some(channel) if self.confirms.resolve(channel, payload) => {}
            _ => tracing::debug!("{} arrived with no caller waiting", kind),
        }
    }

    /// Resolve the negotiation probe's wait directly
    pub(crate) fn resolve_probe(&self, payload: ConfirmPayload) -> bool {
        self.confirms.resolve(ConfirmChannel::ConfigChange, payload)
    }

    /// Wake every caller waiting for a confirmation; they continue
    /// unilaterally
    pub fn unblock_all(&self) {
        let count = self.confirms.unblock_all();
        if count > 0 {
            tracing::info!("Unblocked {} pending confirmations", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::state::NodeRole;
    use crate::messaging::{ClientId, LinkControl, LoopbackTransport, Side, WorkQueue};
    use crate::replication::protocol::{self, ConfigDonePayload, Status, TransactionStartPayload};

    struct Node {
        messenger: Arc<Messenger>,
        queue: Arc<WorkQueue>,
        _adapter: Arc<TransportAdapter>,
    }

    fn node(transport: LoopbackTransport, timeout: Duration, shutdown: watch::Receiver<bool>) -> Node {
        let pool = Arc::new(MessagePool::new(16, protocol::max_message_size()));
        let queue = Arc::new(WorkQueue::new());
        let adapter = TransportAdapter::new(ClientId::DATABASE, pool, queue.clone(), Arc::new(transport));
        adapter.attach().unwrap();
        let state = Arc::new(ServiceState::new(NodeRole::Active));
        let messenger = Arc::new(Messenger::new(
            adapter.clone(),
            state,
            1,
            timeout,
            Duration::from_millis(1),
            shutdown,
        ));
        Node { messenger, queue, _adapter: adapter }
    }

    /// Minimal worker: runs completions, answers transaction starts
    fn pump(node: &Node, peer: Option<&Node>) {
        while let Some(item) = node.queue.pop() {
            match item {
                crate::messaging::WorkItem::Completed { handle, status } => {
                    let pool = node.messenger.pool();
                    if let Some((_, completion)) = pool.take_completion(&handle) {
                        completion.complete(status);
                    }
                    pool.release(handle);
                }
                crate::messaging::WorkItem::Received { handle, .. } => {
                    let pool = node.messenger.pool();
                    let message = pool
                        .with_inbound(&handle, |h, body| protocol::decode(h.known_kind().unwrap(), body).unwrap())
                        .unwrap();
                    pool.release(handle);
                    match (message.kind(), peer) {
                        (MessageKind::TransactionStart, Some(_)) => node.messenger.confirm(
                            MessageKind::TransactionStart,
                            ConfirmPayload { status: Status::Failed, ..Default::default() },
                        ),
                        (kind, _) if kind.is_confirm() => {
                            node.messenger.resolve(kind, message.as_confirm().unwrap())
                        }
                        _ => {}
                    }
                }
                crate::messaging::WorkItem::PeerLost => node.messenger.unblock_all(),
            }
        }
    }

    fn spawn_pumps(a: Arc<Node>, b: Arc<Node>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                pump(&a, None);
                pump(&b, Some(&a));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }

    fn pair(timeout: Duration) -> (Arc<Node>, Arc<Node>, LinkControl, watch::Sender<bool>) {
        let (ta, tb, control) = LoopbackTransport::pair(10, Duration::from_millis(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let a = Arc::new(node(ta, timeout, shutdown_rx.clone()));
        let b = Arc::new(node(tb, timeout, shutdown_rx));
        (a, b, control, shutdown_tx)
    }

    fn start() -> Message {
        Message::TransactionStart(TransactionStartPayload { transaction_id: 1, job_number: 2, ..Default::default() })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_trip_returns_peer_confirmation() {
        let (a, b, _control, _shutdown) = pair(Duration::from_secs(5));
        let pumps = spawn_pumps(a.clone(), b.clone());

        let outcome = a.messenger.call(start()).await.unwrap();
        match &outcome {
            SyncOutcome::Confirmed(confirm) => {
                assert_eq!(confirm.received_kind, MessageKind::TransactionStart.code());
                assert_eq!(confirm.status, Status::Failed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(outcome.check(MessageKind::TransactionStart).is_err());

        let done = Message::UpdateConfigDone(ConfigDonePayload { entries_sent: 0 });
        assert_eq!(a.messenger.call(done).await.unwrap(), SyncOutcome::Delivered);
        pumps.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_live_peer_is_a_hard_failure() {
        let (a, b, control, _shutdown) = pair(Duration::from_millis(100));
        let pumps = spawn_pumps(a.clone(), b.clone());
        control.set_blackhole(Side::A, true);

        let result = a.messenger.call(start()).await;
        assert!(matches!(result, Err(Error::PeerTimeout { phase: "transport", .. })));
        pumps.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_dying_during_wait_continues_unilaterally() {
        let (a, b, control, _shutdown) = pair(Duration::from_millis(200));
        let pumps = spawn_pumps(a.clone(), b.clone());
        control.set_blackhole(Side::A, true);

        let flip = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            control.set_alive(Side::B, false);
            control
        });
        let outcome = a.messenger.call(start()).await.unwrap();
        assert!(outcome.is_unilateral());
        flip.await.unwrap();
        pumps.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unblock_releases_confirm_wait() {
        let (a, _b, control, _shutdown) = pair(Duration::from_secs(5));
        // Only A's completions are processed; B never confirms
        let pump_a = a.clone();
        let pumps = tokio::spawn(async move {
            loop {
                pump(&pump_a, None);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let caller = a.clone();
        let call = tokio::spawn(async move { caller.messenger.call(start()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.messenger.unblock_all();
        assert!(call.await.unwrap().unwrap().is_unilateral());
        drop(control);
        pumps.abort();
    }

    #[test]
    fn test_channels_by_request_kind() {
        assert_eq!(
            ConfirmChannel::for_request(MessageKind::TransactionAbort),
            Some(ConfirmChannel::Transaction)
        );
        assert_eq!(
            ConfirmChannel::for_request(MessageKind::RekeyEncryptionKeys),
            Some(ConfirmChannel::ConfigChange)
        );
        assert_eq!(
            ConfirmChannel::for_request(MessageKind::UpdateConfigTable),
            Some(ConfirmChannel::TableChunk)
        );
        assert_eq!(ConfirmChannel::for_request(MessageKind::UpdateConfig), None);
        assert_eq!(ConfirmChannel::for_request(MessageKind::TransactionStartConfirm), None);
    }
}
