//! Worker Loop
//!
//! The only execution context that interprets messages. It drains the work
//! queue to empty on every wake-up, strictly in arrival order, and consumes
//! out-of-band event bits raised by other tasks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::messaging::pool::{MessageHandle, MessagePool};
use crate::messaging::transport::BulkWrite;
use crate::messaging::SendStatus;
use crate::replication::protocol::{self, Message, MessageHeader};

/// Out-of-band wake-up reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerEvents(u32);

impl WorkerEvents {
    /// The passive node received its whole configuration
    pub const CONFIG_DONE: WorkerEvents = WorkerEvents(1 << 0);
    /// The peer announced service mode
    pub const PEER_SERVICE_MODE: WorkerEvents = WorkerEvents(1 << 1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: WorkerEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for WorkerEvents {
    type Output = WorkerEvents;

    fn bitor(self, rhs: Self) -> Self::Output {
        WorkerEvents(self.0 | rhs.0)
    }
}

/// One queued event
#[derive(Debug)]
pub enum WorkItem {
    /// A received message copied into the pool
    Received {
        handle: MessageHandle,
        oversized: bool,
        bulk: Option<BulkWrite>,
    },
    PeerLost,
    /// A send resolved
    Completed {
        handle: MessageHandle,
        status: SendStatus,
    },
}

/// FIFO of work items plus the event bitmask
#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    events: AtomicU32,
    wake: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: WorkItem) {
        self.items.lock().push_back(item);
        self.wake.notify_one();
    }

    pub fn pop(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raise event bits; callable from any task
    pub fn raise(&self, events: WorkerEvents) {
        self.events.fetch_or(events.bits(), Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Consume and clear all raised bits
    pub fn take_events(&self) -> WorkerEvents {
        WorkerEvents(self.events.swap(0, Ordering::SeqCst))
    }
}

/// A received message as handed to the dispatcher
#[derive(Debug)]
pub struct InboundMessage {
    pub header: MessageHeader,
    /// Sender declared more bytes than this node knows for the kind
    pub oversized: bool,
    /// `None` when the kind is unknown or the copy did not decode
    pub message: Option<Message>,
    pub bulk: Option<BulkWrite>,
}

/// Receives the work the worker pulls off the queue
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn message_received(&self, inbound: InboundMessage);

    async fn peer_lost(&self);

    async fn events(&self, events: WorkerEvents);
}

/// Spawn the worker loop
pub fn spawn_worker(
    queue: Arc<WorkQueue>,
    pool: Arc<MessagePool>,
    dispatch: Arc<dyn Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("Worker loop started");
        loop {
            let woken = queue.wake.notified();

            while let Some(item) = queue.pop() {
                process(item, &pool, dispatch.as_ref()).await;
            }

            let events = queue.take_events();
            if !events.is_empty() {
                dispatch.events(events).await;
                continue;
            }

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = woken => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Worker loop stopped");
    })
}

async fn process(item: WorkItem, pool: &MessagePool, dispatch: &dyn Dispatch) {
    match item {
        WorkItem::Received { handle, oversized, bulk } => {
            let decoded = pool.with_inbound(&handle, |header, body| {
                let message = header.known_kind().and_then(|kind| {
                    protocol::decode(kind, body)
                        .map_err(|e| {
                            if !oversized {
                                tracing::warn!("Failed to decode {}: {}", kind, e);
                            }
                        })
                        .ok()
                });
                (*header, message)
            });
            pool.release(handle);
            if let Some((header, message)) = decoded {
                dispatch
                    .message_received(InboundMessage {
                        header,
                        oversized,
                        message,
                        bulk,
                    })
                    .await;
            }
        }
        WorkItem::PeerLost => dispatch.peer_lost().await,
        WorkItem::Completed { handle, status } => {
            match pool.take_completion(&handle) {
                Some((kind, completion)) => {
                    if !status.is_delivered() {
                        tracing::debug!("Send of {} resolved {}", kind, status);
                    }
                    completion.complete(status);
                }
                None => tracing::warn!("Completion for message {} without a sender", handle.index()),
            }
            pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Completion;
    use crate::replication::protocol::{encode, ConfigDonePayload};

    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Dispatch for Recorder {
        async fn message_received(&self, inbound: InboundMessage) {
            let entry = match inbound.message {
                Some(Message::UpdateConfigDone(p)) => format!("rx:{}", p.entries_sent),
                other => format!("rx:{:?}", other.map(|m| m.kind())),
            };
            self.log.lock().push(entry);
        }

        async fn peer_lost(&self) {
            self.log.lock().push("lost".into());
        }

        async fn events(&self, events: WorkerEvents) {
            self.log.lock().push(format!("events:{}", events.bits()));
        }
    }

    fn received(pool: &MessagePool, n: u64) -> WorkItem {
        let handle = pool.allocate().unwrap();
        let bytes = encode(&Message::UpdateConfigDone(ConfigDonePayload { entries_sent: n })).unwrap();
        let header = MessageHeader::from_bytes(&bytes).unwrap();
        pool.store_inbound(&handle, header, &bytes[MessageHeader::SIZE..], header.declared_size as usize);
        WorkItem::Received { handle, oversized: false, bulk: None }
    }

    fn completed(pool: &MessagePool, log: &Arc<Mutex<Vec<String>>>, n: u32) -> WorkItem {
        let handle = pool.allocate().unwrap();
        let log = log.clone();
        pool.prepare_outbound(
            &handle,
            crate::replication::protocol::MessageKind::UpdateConfig,
            Completion::Callback(Box::new(move |status| log.lock().push(format!("done:{}:{}", n, status)))),
        );
        WorkItem::Completed { handle, status: SendStatus::Delivered }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_items_are_dispatched_in_arrival_order() {
        let pool = Arc::new(MessagePool::new(16, protocol::max_message_size()));
        let queue = Arc::new(WorkQueue::new());
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue.push(received(&pool, 1));
        queue.push(completed(&pool, &log, 2));
        queue.push(WorkItem::PeerLost);
        queue.push(received(&pool, 3));
        queue.push(completed(&pool, &log, 4));

        let worker = spawn_worker(queue.clone(), pool.clone(), Arc::new(recorder), shutdown_rx);
        queue.push(received(&pool, 5));

        for _ in 0..200 {
            if log.lock().len() == 6 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            *log.lock(),
            vec!["rx:1", "done:2:DELIVERED", "lost", "rx:3", "done:4:DELIVERED", "rx:5"]
        );
        assert_eq!(pool.outstanding(), 0);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_are_consumed_once() {
        let pool = Arc::new(MessagePool::new(1, 16));
        let queue = Arc::new(WorkQueue::new());
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue.raise(WorkerEvents::CONFIG_DONE);
        queue.raise(WorkerEvents::PEER_SERVICE_MODE);
        let worker = spawn_worker(queue.clone(), pool, Arc::new(recorder), shutdown_rx);

        for _ in 0..200 {
            if !log.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(*log.lock(), vec!["events:3"]);
        assert!(queue.take_events().is_empty());

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
