//! Loopback Transport
//!
//! An in-process pair of transport endpoints. Each direction has its own
//! delivery task, so messages are delivered in send order, and a
//! [`LinkControl`] can kill a side or make the link misbehave.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::messaging::transport::{
    deliver_with_retry, BulkWrite, ClientId, Delivery, EventCallback, Transport, TransportEvent,
};

/// One end of the loopback pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

struct Outbound {
    bytes: Bytes,
    bulk: Option<BulkWrite>,
    correlation: u32,
}

struct Endpoint {
    callback: Mutex<Option<EventCallback>>,
    alive: AtomicBool,
    /// Sends from this endpoint not yet resolved
    pending: Mutex<HashSet<u32>>,
}

/// Misbehaviour of messages leaving one side
struct Direction {
    blackhole: AtomicBool,
    hold_acks: watch::Sender<bool>,
    busy_next: AtomicU32,
}

struct Shared {
    ends: [Endpoint; 2],
    dirs: [Direction; 2],
    busy_retry_limit: u32,
    busy_retry_delay: Duration,
}

impl Shared {
    fn end(&self, side: Side) -> &Endpoint {
        &self.ends[side.index()]
    }

    fn dir(&self, from: Side) -> &Direction {
        &self.dirs[from.index()]
    }

    fn callback(&self, side: Side) -> Option<EventCallback> {
        self.end(side).callback.lock().clone()
    }

    fn is_up(&self, side: Side) -> bool {
        let end = self.end(side);
        end.alive.load(Ordering::SeqCst) && end.callback.lock().is_some()
    }

    /// Claim the right to report the outcome of a send
    fn resolve(&self, from: Side, correlation: u32) -> bool {
        self.end(from).pending.lock().remove(&correlation)
    }

    fn report(&self, to: Side, event: TransportEvent) {
        if let Some(callback) = self.callback(to) {
            callback(event);
        }
    }
}

/// One endpoint of an in-process link
pub struct LoopbackTransport {
    side: Side,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Test and simulation controls for a loopback pair
#[derive(Clone)]
pub struct LinkControl {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Create a connected pair. Must be called inside a Tokio runtime.
    pub fn pair(busy_retry_limit: u32, busy_retry_delay: Duration) -> (Self, Self, LinkControl) {
        let endpoint = || Endpoint {
            callback: Mutex::new(None),
            alive: AtomicBool::new(true),
            pending: Mutex::new(HashSet::new()),
        };
        let direction = || Direction {
            blackhole: AtomicBool::new(false),
            hold_acks: watch::channel(false).0,
            busy_next: AtomicU32::new(0),
        };
        let shared = Arc::new(Shared {
            ends: [endpoint(), endpoint()],
            dirs: [direction(), direction()],
            busy_retry_limit: busy_retry_limit.max(1),
            busy_retry_delay,
        });

        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        tokio::spawn(deliver(shared.clone(), Side::A, rx_a));
        tokio::spawn(deliver(shared.clone(), Side::B, rx_b));

        (
            Self { side: Side::A, shared: shared.clone(), tx: tx_a },
            Self { side: Side::B, shared: shared.clone(), tx: tx_b },
            LinkControl { shared },
        )
    }

    pub fn side(&self) -> Side {
        self.side
    }

    fn queue(&self, outbound: Outbound) -> Result<()> {
        if self.shared.callback(self.side).is_none() {
            return Err(Error::Transport(format!("{:?} side has no registered client", self.side)));
        }
        self.shared
            .end(self.side)
            .pending
            .lock()
            .insert(outbound.correlation);
        self.tx
            .send(outbound)
            .map_err(|_| Error::Transport("loopback delivery task stopped".into()))
    }
}

impl Transport for LoopbackTransport {
    fn register(&self, client: ClientId, callback: EventCallback) -> Result<()> {
        let end = self.shared.end(self.side);
        let mut slot = end.callback.lock();
        if slot.is_some() {
            return Err(Error::Transport(format!("{} already registered", client)));
        }
        *slot = Some(callback);
        end.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, _client: ClientId, bytes: Bytes, correlation: u32) -> Result<()> {
        self.queue(Outbound { bytes, bulk: None, correlation })
    }

    fn send_bulk(&self, _client: ClientId, bytes: Bytes, bulk: BulkWrite, correlation: u32) -> Result<()> {
        self.queue(Outbound { bytes, bulk: Some(bulk), correlation })
    }

    fn is_peer_alive(&self) -> bool {
        self.shared.is_up(self.side.peer())
    }

    fn unregister(&self, _client: ClientId) -> Result<()> {
        self.shared.end(self.side).callback.lock().take();
        Ok(())
    }
}

async fn deliver(shared: Arc<Shared>, from: Side, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let to = from.peer();
    let mut held = shared.dir(from).hold_acks.subscribe();

    while let Some(outbound) = rx.recv().await {
        let correlation = outbound.correlation;
        if !shared.end(from).alive.load(Ordering::SeqCst) {
            shared.resolve(from, correlation);
            continue;
        }

        let target = match shared.callback(to) {
            Some(callback) if shared.end(to).alive.load(Ordering::SeqCst) => callback,
            _ => {
                if shared.resolve(from, correlation) {
                    shared.report(from, TransportEvent::PeerNotPresent { correlation });
                }
                continue;
            }
        };

        let dir = shared.dir(from);
        if dir.blackhole.load(Ordering::SeqCst) {
            // Lost on the wire; only a kill resolves it
            continue;
        }

        if dir
            .busy_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            if shared.resolve(from, correlation) {
                shared.report(from, TransportEvent::PeerBusy { correlation });
            }
            continue;
        }

        let delivery = deliver_with_retry(
            &target,
            &outbound.bytes,
            &outbound.bulk,
            shared.busy_retry_limit,
            shared.busy_retry_delay,
        )
        .await;

        if *held.borrow() {
            let _ = held.wait_for(|hold| !*hold).await;
        }

        if shared.resolve(from, correlation) {
            let event = match delivery {
                Delivery::Accepted => TransportEvent::MessageTransmitted { correlation },
                Delivery::Busy => TransportEvent::PeerBusy { correlation },
            };
            shared.report(from, event);
        }
    }
}

impl LinkControl {
    /// Kill one side: the survivor sees its pending sends fail and then
    /// loses contact
    pub fn kill(&self, side: Side) {
        let shared = &self.shared;
        shared.end(side).alive.store(false, Ordering::SeqCst);
        shared.end(side).callback.lock().take();
        shared.end(side).pending.lock().clear();

        let survivor = side.peer();
        let pending: Vec<u32> = shared.end(survivor).pending.lock().drain().collect();
        for correlation in pending {
            shared.report(survivor, TransportEvent::PeerNotPresent { correlation });
        }
        tracing::info!("Loopback {:?} side killed", side);
        shared.report(survivor, TransportEvent::PeerContactLost);
    }

    /// Change what the other side's `is_peer_alive` reports, without events
    pub fn set_alive(&self, side: Side, alive: bool) {
        self.shared.end(side).alive.store(alive, Ordering::SeqCst);
    }

    /// Drop messages sent by `from` without acknowledging them
    pub fn set_blackhole(&self, from: Side, enabled: bool) {
        self.shared.dir(from).blackhole.store(enabled, Ordering::SeqCst);
    }

    /// Deliver messages sent by `from` but hold back their acknowledgements
    pub fn hold_acks(&self, from: Side, hold: bool) {
        self.shared.dir(from).hold_acks.send_replace(hold);
    }

    /// Answer the next `count` sends from `from` with `PeerBusy`
    pub fn busy_next(&self, from: Side, count: u32) {
        self.shared.dir(from).busy_next.store(count, Ordering::SeqCst);
    }

    /// Sends from `side` still waiting for an outcome
    pub fn pending(&self, side: Side) -> usize {
        self.shared.end(side).pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let callback: EventCallback = Arc::new(move |event| {
            let entry = match event {
                TransportEvent::MessageReceived { bytes, .. } => format!("rx:{}", bytes[0]),
                TransportEvent::MessageTransmitted { correlation } => format!("ok:{}", correlation),
                TransportEvent::PeerNotPresent { correlation } => format!("gone:{}", correlation),
                TransportEvent::PeerBusy { correlation } => format!("busy:{}", correlation),
                TransportEvent::FatalError { correlation } => format!("fatal:{}", correlation),
                TransportEvent::PeerContactLost => "lost".to_string(),
            };
            sink.lock().push(entry);
            Delivery::Accepted
        });
        (callback, log)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delivery_in_order_with_acks() {
        let (a, b, _control) = LoopbackTransport::pair(10, Duration::from_millis(1));
        let (cb_a, log_a) = recorder();
        let (cb_b, log_b) = recorder();
        a.register(ClientId::DATABASE, cb_a).unwrap();
        b.register(ClientId::DATABASE, cb_b).unwrap();
        assert!(a.is_peer_alive());

        for i in 0..5u8 {
            a.send(ClientId::DATABASE, Bytes::from(vec![i]), i as u32).unwrap();
        }
        settle().await;
        assert_eq!(*log_b.lock(), vec!["rx:0", "rx:1", "rx:2", "rx:3", "rx:4"]);
        assert_eq!(*log_a.lock(), vec!["ok:0", "ok:1", "ok:2", "ok:3", "ok:4"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_fails_pending_and_reports_loss() {
        let (a, b, control) = LoopbackTransport::pair(10, Duration::from_millis(1));
        let (cb_a, log_a) = recorder();
        let (cb_b, _log_b) = recorder();
        a.register(ClientId::DATABASE, cb_a).unwrap();
        b.register(ClientId::DATABASE, cb_b).unwrap();

        control.set_blackhole(Side::A, true);
        a.send(ClientId::DATABASE, Bytes::from_static(&[9]), 7).unwrap();
        settle().await;
        assert_eq!(control.pending(Side::A), 1);

        control.kill(Side::B);
        assert!(!a.is_peer_alive());
        assert_eq!(*log_a.lock(), vec!["gone:7", "lost"]);

        control.set_blackhole(Side::A, false);
        a.send(ClientId::DATABASE, Bytes::from_static(&[1]), 8).unwrap();
        settle().await;
        assert_eq!(log_a.lock().last().unwrap(), "gone:8");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_busy_injection_and_held_acks() {
        let (a, b, control) = LoopbackTransport::pair(10, Duration::from_millis(1));
        let (cb_a, log_a) = recorder();
        let (cb_b, log_b) = recorder();
        a.register(ClientId::DATABASE, cb_a).unwrap();
        b.register(ClientId::DATABASE, cb_b).unwrap();

        control.busy_next(Side::A, 1);
        control.hold_acks(Side::A, true);
        a.send(ClientId::DATABASE, Bytes::from_static(&[1]), 1).unwrap();
        a.send(ClientId::DATABASE, Bytes::from_static(&[2]), 2).unwrap();
        settle().await;
        assert_eq!(*log_a.lock(), vec!["busy:1"]);
        assert_eq!(*log_b.lock(), vec!["rx:2"]);

        control.hold_acks(Side::A, false);
        settle().await;
        assert_eq!(*log_a.lock(), vec!["busy:1", "ok:2"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exhausted_receiver_reports_busy() {
        let (a, b, _control) = LoopbackTransport::pair(3, Duration::from_millis(1));
        let (cb_a, log_a) = recorder();
        a.register(ClientId::DATABASE, cb_a).unwrap();
        b.register(ClientId::DATABASE, Arc::new(|_| Delivery::Busy)).unwrap();

        a.send(ClientId::DATABASE, Bytes::from_static(&[1]), 4).unwrap();
        settle().await;
        assert_eq!(*log_a.lock(), vec!["busy:4"]);
    }
}
