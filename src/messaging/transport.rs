//! Transport Boundary
//!
//! The lower-level inter-node channel. Sends are queued immediately and
//! their results arrive later through the registered callback, which may run
//! on a transport task and must not block.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Client of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u16);

impl ClientId {
    /// The configuration database service
    pub const DATABASE: ClientId = ClientId(1);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Bytes written straight into a fixed peer-side region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWrite {
    /// Region code on the peer
    pub region: u16,
    pub offset: u64,
    pub data: Bytes,
}

/// Events delivered to a registered client
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived; bytes are only guaranteed during the callback
    MessageReceived { bytes: Bytes, bulk: Option<BulkWrite> },
    PeerContactLost,
    MessageTransmitted { correlation: u32 },
    FatalError { correlation: u32 },
    PeerNotPresent { correlation: u32 },
    PeerBusy { correlation: u32 },
}

/// Receiver's answer to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// No buffer available; the transport may retry
    Busy,
}

/// Callback registered by a client
pub type EventCallback = Arc<dyn Fn(TransportEvent) -> Delivery + Send + Sync>;

/// Inter-node transport
pub trait Transport: Send + Sync {
    fn register(&self, client: ClientId, callback: EventCallback) -> Result<()>;

    /// Queue a message; the outcome arrives as an event carrying `correlation`
    fn send(&self, client: ClientId, bytes: Bytes, correlation: u32) -> Result<()>;

    /// Queue a message together with a write into a peer region
    fn send_bulk(&self, client: ClientId, bytes: Bytes, bulk: BulkWrite, correlation: u32) -> Result<()>;

    fn is_peer_alive(&self) -> bool;

    fn unregister(&self, client: ClientId) -> Result<()>;
}

/// Hand a received message to a callback, retrying while the receiver
/// reports `Busy`
pub(crate) async fn deliver_with_retry(
    callback: &EventCallback,
    bytes: &Bytes,
    bulk: &Option<BulkWrite>,
    limit: u32,
    delay: Duration,
) -> Delivery {
    let mut attempts = 0u32;
    loop {
        let event = TransportEvent::MessageReceived {
            bytes: bytes.clone(),
            bulk: bulk.clone(),
        };
        match callback(event) {
            Delivery::Accepted => return Delivery::Accepted,
            Delivery::Busy => {
                attempts += 1;
                if attempts >= limit {
                    tracing::warn!("Receiver busy after {} delivery attempts", attempts);
                    return Delivery::Busy;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_delivery_retries_while_busy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let callback: EventCallback = Arc::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Delivery::Busy
            } else {
                Delivery::Accepted
            }
        });

        let bytes = Bytes::from_static(b"m");
        let result = deliver_with_retry(&callback, &bytes, &None, 10, Duration::from_millis(1)).await;
        assert_eq!(result, Delivery::Accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        calls.store(0, Ordering::SeqCst);
        let result = deliver_with_retry(&callback, &bytes, &None, 2, Duration::from_millis(1)).await;
        assert_eq!(result, Delivery::Busy);
    }
}
