//! Transport Adapter
//!
//! Registers with the transport and turns its callbacks into work items.
//! The callback copies received bytes into a pool message and queues it;
//! it never interprets anything.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::messaging::pool::{MessageHandle, MessagePool};
use crate::messaging::transport::{BulkWrite, ClientId, Delivery, Transport, TransportEvent};
use crate::messaging::worker::{WorkItem, WorkQueue};
use crate::messaging::{Completion, SendStatus};
use crate::replication::protocol::{self, Message, MessageHeader, MessageKind};

/// Bridge between a transport and the worker queue
pub struct TransportAdapter {
    client: ClientId,
    pool: Arc<MessagePool>,
    queue: Arc<WorkQueue>,
    transport: Arc<dyn Transport>,
    malformed: AtomicU64,
}

impl TransportAdapter {
    pub fn new(
        client: ClientId,
        pool: Arc<MessagePool>,
        queue: Arc<WorkQueue>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            pool,
            queue,
            transport,
            malformed: AtomicU64::new(0),
        })
    }

    /// Register the adapter's callback with the transport
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let adapter = Arc::downgrade(self);
        self.transport.register(
            self.client,
            Arc::new(move |event| match adapter.upgrade() {
                Some(adapter) => adapter.on_event(event),
                None => Delivery::Accepted,
            }),
        )
    }

    pub fn detach(&self) -> Result<()> {
        self.transport.unregister(self.client)
    }

    pub fn is_peer_alive(&self) -> bool {
        self.transport.is_peer_alive()
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Messages dropped because they were too short to carry a header
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Transport callback
    pub(crate) fn on_event(&self, event: TransportEvent) -> Delivery {
        match event {
            TransportEvent::MessageReceived { bytes, bulk } => self.on_received(&bytes, bulk),
            TransportEvent::PeerContactLost => {
                self.queue.push(WorkItem::PeerLost);
                Delivery::Accepted
            }
            TransportEvent::MessageTransmitted { correlation } => {
                self.complete(correlation, SendStatus::Delivered)
            }
            TransportEvent::FatalError { correlation } => self.complete(correlation, SendStatus::Fatal),
            TransportEvent::PeerNotPresent { correlation } => {
                self.complete(correlation, SendStatus::PeerNotPresent)
            }
            TransportEvent::PeerBusy { correlation } => self.complete(correlation, SendStatus::PeerBusy),
        }
    }

    fn on_received(&self, bytes: &[u8], bulk: Option<BulkWrite>) -> Delivery {
        let Some(header) = MessageHeader::from_bytes(bytes) else {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Dropping {} byte message without a header", bytes.len());
            return Delivery::Accepted;
        };
        let local_size = protocol::size_for_code(header.kind);
        let Some(handle) = self.pool.allocate() else {
            return Delivery::Busy;
        };
        self.pool
            .store_inbound(&handle, header, &bytes[MessageHeader::SIZE..], local_size);
        self.queue.push(WorkItem::Received {
            handle,
            oversized: header.declared_size as usize > local_size,
            bulk,
        });
        Delivery::Accepted
    }

    fn complete(&self, correlation: u32, status: SendStatus) -> Delivery {
        self.queue.push(WorkItem::Completed {
            handle: MessageHandle::from_raw(correlation),
            status,
        });
        Delivery::Accepted
    }

    /// Send a message held in an allocated handle. Ownership of the handle
    /// passes to the transport; `completion` runs on the worker once the
    /// send resolves.
    pub fn transmit(&self, handle: MessageHandle, message: &Message, completion: Completion) -> Result<()> {
        match protocol::encode(message) {
            Ok(bytes) => self.transmit_encoded(handle, message.kind(), bytes, None, completion),
            Err(e) => {
                self.pool.release(handle);
                Err(e)
            }
        }
    }

    /// Send a message together with a write into a peer region
    pub fn transmit_bulk(
        &self,
        handle: MessageHandle,
        message: &Message,
        bulk: BulkWrite,
        completion: Completion,
    ) -> Result<()> {
        match protocol::encode(message) {
            Ok(bytes) => self.transmit_encoded(handle, message.kind(), bytes, Some(bulk), completion),
            Err(e) => {
                self.pool.release(handle);
                Err(e)
            }
        }
    }

    /// Send bytes that were already encoded
    pub fn transmit_encoded(
        &self,
        handle: MessageHandle,
        kind: MessageKind,
        bytes: Vec<u8>,
        bulk: Option<BulkWrite>,
        completion: Completion,
    ) -> Result<()> {
        let limit = MessageHeader::SIZE + self.pool.buffer_size();
        if bytes.len() > limit {
            self.pool.release(handle);
            return Err(Error::PayloadTooLarge {
                kind: kind.name(),
                size: bytes.len(),
                limit,
            });
        }

        self.pool.prepare_outbound(&handle, kind, completion);
        let correlation = handle.index();
        let bytes = Bytes::from(bytes);
        let queued = match bulk {
            Some(bulk) => self.transport.send_bulk(self.client, bytes, bulk, correlation),
            None => self.transport.send(self.client, bytes, correlation),
        };
        if let Err(e) = queued {
            tracing::warn!("Transport refused {}: {}", kind, e);
            self.pool.release(MessageHandle::from_raw(correlation));
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::transport::EventCallback;
    use crate::replication::protocol::{size_for, ConfigDonePayload, TableEntryPush, WirePayload};
    use parking_lot::Mutex;

    /// Transport that records sends and lets the test fire callbacks
    #[derive(Default)]
    struct RecordingTransport {
        callback: Mutex<Option<EventCallback>>,
        sent: Mutex<Vec<(Bytes, u32)>>,
    }

    impl RecordingTransport {
        fn fire(&self, event: TransportEvent) -> Delivery {
            let callback = self.callback.lock().clone().unwrap();
            callback(event)
        }
    }

    impl Transport for RecordingTransport {
        fn register(&self, _client: ClientId, callback: EventCallback) -> Result<()> {
            *self.callback.lock() = Some(callback);
            Ok(())
        }

        fn send(&self, _client: ClientId, bytes: Bytes, correlation: u32) -> Result<()> {
            self.sent.lock().push((bytes, correlation));
            Ok(())
        }

        fn send_bulk(&self, client: ClientId, bytes: Bytes, _bulk: BulkWrite, correlation: u32) -> Result<()> {
            self.send(client, bytes, correlation)
        }

        fn is_peer_alive(&self) -> bool {
            true
        }

        fn unregister(&self, _client: ClientId) -> Result<()> {
            self.callback.lock().take();
            Ok(())
        }
    }

    fn setup(capacity: usize) -> (Arc<RecordingTransport>, Arc<MessagePool>, Arc<WorkQueue>, Arc<TransportAdapter>) {
        let transport = Arc::new(RecordingTransport::default());
        let pool = Arc::new(MessagePool::new(capacity, protocol::max_message_size()));
        let queue = Arc::new(WorkQueue::new());
        let adapter = TransportAdapter::new(ClientId::DATABASE, pool.clone(), queue.clone(), transport.clone());
        adapter.attach().unwrap();
        (transport, pool, queue, adapter)
    }

    #[test]
    fn test_oversized_message_copies_only_local_size() {
        let (transport, pool, queue, _adapter) = setup(4);
        let local = size_for(MessageKind::UpdateConfig);
        let message = Message::UpdateConfig(TableEntryPush::largest());
        let mut bytes = protocol::encode_declared(&message, local + 200).unwrap();
        // Newer sender: trailing bytes beyond what this node knows
        let tail = bytes.len() - 200;
        bytes[tail..].iter_mut().for_each(|b| *b = 0xEE);

        let delivery = transport.fire(TransportEvent::MessageReceived {
            bytes: Bytes::from(bytes),
            bulk: None,
        });
        assert_eq!(delivery, Delivery::Accepted);

        let Some(WorkItem::Received { handle, oversized, .. }) = queue.pop() else {
            panic!("expected a received item");
        };
        assert!(oversized);
        pool.with_inbound(&handle, |header, body| {
            assert_eq!(header.declared_size as usize, local + 200);
            assert_eq!(body.len(), local);
            assert!(!body.contains(&0xEE));
        })
        .unwrap();
        pool.release(handle);
    }

    #[test]
    fn test_exhausted_pool_reports_busy() {
        let (transport, pool, queue, _adapter) = setup(1);
        let held = pool.allocate().unwrap();
        let bytes = protocol::encode(&Message::UpdateConfigDone(ConfigDonePayload { entries_sent: 1 })).unwrap();
        let event = TransportEvent::MessageReceived { bytes: Bytes::from(bytes), bulk: None };

        assert_eq!(transport.fire(event.clone()), Delivery::Busy);
        assert!(queue.is_empty());
        pool.release(held);
        assert_eq!(transport.fire(event), Delivery::Accepted);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_transmit_correlates_completion_with_handle() {
        let (transport, pool, queue, adapter) = setup(2);
        let handle = pool.allocate().unwrap();
        let index = handle.index();
        let message = Message::UpdateConfigDone(ConfigDonePayload { entries_sent: 5 });
        adapter.transmit(handle, &message, Completion::Release).unwrap();

        let (bytes, correlation) = transport.sent.lock()[0].clone();
        assert_eq!(correlation, index);
        assert_eq!(bytes.len(), MessageHeader::SIZE + size_for(MessageKind::UpdateConfigDone));

        transport.fire(TransportEvent::PeerBusy { correlation });
        match queue.pop() {
            Some(WorkItem::Completed { handle, status }) => {
                assert_eq!(handle.index(), index);
                assert_eq!(status, SendStatus::PeerBusy);
                assert!(pool.take_completion(&handle).is_some());
                pool.release(handle);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_short_message_is_dropped() {
        let (transport, _pool, queue, adapter) = setup(1);
        let delivery = transport.fire(TransportEvent::MessageReceived {
            bytes: Bytes::from_static(&[1, 2]),
            bulk: None,
        });
        assert_eq!(delivery, Delivery::Accepted);
        assert!(queue.is_empty());
        assert_eq!(adapter.malformed_count(), 1);
    }
}
