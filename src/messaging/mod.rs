//! Messaging Module
//!
//! Inter-node message plumbing: the message pool, the transport boundary
//! and its loopback and TCP implementations, the adapter that turns
//! transport callbacks into work items, and the single worker that
//! interprets them.

pub mod pool;
pub mod transport;
pub mod loopback;
pub mod tcp;
mod adapter;
mod worker;

pub use pool::{MessageHandle, MessagePool};
pub use transport::{BulkWrite, ClientId, Delivery, EventCallback, Transport, TransportEvent};
pub use loopback::{LinkControl, LoopbackTransport, Side};
pub use tcp::TcpTransport;
pub use adapter::TransportAdapter;
pub use worker::{spawn_worker, Dispatch, InboundMessage, WorkItem, WorkQueue, WorkerEvents};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Outcome of a send as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted by the peer's transport
    Delivered,
    PeerNotPresent,
    PeerBusy,
    Fatal,
}

impl SendStatus {
    pub fn is_delivered(self) -> bool {
        self == SendStatus::Delivered
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::Delivered => write!(f, "DELIVERED"),
            SendStatus::PeerNotPresent => write!(f, "PEER_NOT_PRESENT"),
            SendStatus::PeerBusy => write!(f, "PEER_BUSY"),
            SendStatus::Fatal => write!(f, "FATAL"),
        }
    }
}

/// What the worker does when a send resolves. The message is returned to
/// the pool right after.
pub enum Completion {
    /// Nothing beyond returning the message
    Release,
    /// Wake a caller waiting on the send
    Notify(oneshot::Sender<SendStatus>),
    /// Raise a shared flag if the send did not get through
    FlagOnFailure(Arc<AtomicBool>),
    /// Run a closure on the worker
    Callback(Box<dyn FnOnce(SendStatus) + Send + 'static>),
}

impl Completion {
    pub fn complete(self, status: SendStatus) {
        match self {
            Completion::Release => {}
            Completion::Notify(tx) => {
                // The caller may have timed out already
                let _ = tx.send(status);
            }
            Completion::FlagOnFailure(flag) => {
                if !status.is_delivered() {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Completion::Callback(f) => f(status),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Release => write!(f, "Release"),
            Completion::Notify(_) => write!(f, "Notify"),
            Completion::FlagOnFailure(_) => write!(f, "FlagOnFailure"),
            Completion::Callback(_) => write!(f, "Callback"),
        }
    }
}
