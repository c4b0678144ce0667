//! TCP Transport
//!
//! Links two processes over one TCP connection. Frames are bincode-encoded
//! [`LinkFrame`]s behind a length + CRC32 header. One side listens, the
//! other dials and keeps redialing after the link drops.

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::messaging::transport::{
    deliver_with_retry, BulkWrite, ClientId, Delivery, EventCallback, Transport, TransportEvent,
};
use crate::replication::protocol::FrameHeader;

/// Largest frame accepted from the peer
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frames exchanged on the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    Hello { node_id: String },
    Message { correlation: u32, bytes: Vec<u8> },
    Bulk {
        correlation: u32,
        bytes: Vec<u8>,
        region: u16,
        offset: u64,
        data: Vec<u8>,
    },
    /// Receiver accepted the message
    Ack { correlation: u32 },
    /// Receiver had no buffer for the message
    Busy { correlation: u32 },
}

/// Length + checksum framing of [`LinkFrame`]s
#[derive(Debug, Default)]
pub struct LinkCodec;

impl Decoder for LinkCodec {
    type Item = LinkFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LinkFrame>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }
        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&header_bytes);

        let length = header.length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::Network(format!("Frame of {} bytes exceeds limit", length)));
        }
        if src.len() < FrameHeader::SIZE + length {
            src.reserve(FrameHeader::SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let body = src.split_to(length);
        if !header.verify(&body) {
            return Err(Error::Network("Message checksum mismatch".into()));
        }
        Ok(Some(bincode::deserialize(&body)?))
    }
}

impl Encoder<LinkFrame> for LinkCodec {
    type Error = Error;

    fn encode(&mut self, frame: LinkFrame, dst: &mut BytesMut) -> Result<()> {
        let body = bincode::serialize(&frame)?;
        let header = FrameHeader::new(&body);
        dst.reserve(FrameHeader::SIZE + body.len());
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

struct TcpInner {
    node_id: String,
    config: LinkConfig,
    callback: Mutex<Option<EventCallback>>,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<LinkFrame>>>,
    pending: Mutex<HashSet<u32>>,
    shutdown: watch::Sender<bool>,
}

impl TcpInner {
    fn report(&self, event: TransportEvent) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// Transport over a single TCP connection to the peer
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    pub fn new(node_id: impl Into<String>, config: LinkConfig) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                node_id: node_id.into(),
                config,
                callback: Mutex::new(None),
                connected: AtomicBool::new(false),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashSet::new()),
                shutdown: watch::channel(false).0,
            }),
        }
    }

    /// Start accepting or dialing. Returns the bound address in listen mode.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let inner = self.inner.clone();
        if inner.config.listen {
            let listener = TcpListener::bind(&inner.config.bind_address).await.map_err(|e| {
                Error::ConnectionFailed {
                    address: inner.config.bind_address.clone(),
                    reason: e.to_string(),
                }
            })?;
            let address = listener.local_addr()?;
            tracing::info!("Link listening on {}", address);
            tokio::spawn(accept_loop(inner, listener));
            Ok(Some(address))
        } else {
            let peer = inner
                .config
                .peer_address
                .clone()
                .ok_or_else(|| Error::Config("link.peer_address is required to dial".into()))?;
            tokio::spawn(dial_loop(inner, peer));
            Ok(None)
        }
    }

    /// Stop the link tasks
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn queue(&self, frame: LinkFrame, correlation: u32) -> Result<()> {
        let inner = &self.inner;
        let callback = inner
            .callback
            .lock()
            .clone()
            .ok_or_else(|| Error::Transport("no registered client".into()))?;

        let sender = inner.outbound.lock().clone();
        if let Some(sender) = sender {
            inner.pending.lock().insert(correlation);
            if sender.send(frame).is_ok() {
                return Ok(());
            }
            inner.pending.lock().remove(&correlation);
        }

        tokio::spawn(async move {
            callback(TransportEvent::PeerNotPresent { correlation });
        });
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn register(&self, client: ClientId, callback: EventCallback) -> Result<()> {
        let mut slot = self.inner.callback.lock();
        if slot.is_some() {
            return Err(Error::Transport(format!("{} already registered", client)));
        }
        *slot = Some(callback);
        Ok(())
    }

    fn send(&self, _client: ClientId, bytes: Bytes, correlation: u32) -> Result<()> {
        self.queue(
            LinkFrame::Message {
                correlation,
                bytes: bytes.to_vec(),
            },
            correlation,
        )
    }

    fn send_bulk(&self, _client: ClientId, bytes: Bytes, bulk: BulkWrite, correlation: u32) -> Result<()> {
        self.queue(
            LinkFrame::Bulk {
                correlation,
                bytes: bytes.to_vec(),
                region: bulk.region,
                offset: bulk.offset,
                data: bulk.data.to_vec(),
            },
            correlation,
        )
    }

    fn is_peer_alive(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn unregister(&self, _client: ClientId) -> Result<()> {
        self.inner.callback.lock().take();
        Ok(())
    }
}

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    tracing::info!("Peer connected from {}", address);
                    run_connection(&inner, stream).await;
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

async fn dial_loop(inner: Arc<TcpInner>, peer: String) {
    let shutdown = inner.shutdown.subscribe();
    let connect_timeout = Duration::from_millis(inner.config.connect_timeout_ms);
    let reconnect = Duration::from_millis(inner.config.reconnect_interval_ms);

    while !*shutdown.borrow() {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(&peer)).await {
            Ok(Ok(stream)) => {
                tracing::info!("Connected to peer at {}", peer);
                run_connection(&inner, stream).await;
            }
            Ok(Err(e)) => tracing::debug!("Connect to {} failed: {}", peer, e),
            Err(_) => tracing::debug!("Connect to {} timed out", peer),
        }
        let jitter = rand::thread_rng().gen_range(0..=reconnect.as_millis() as u64 / 4);
        tokio::time::sleep(reconnect + Duration::from_millis(jitter)).await;
    }
}

async fn run_connection(inner: &Arc<TcpInner>, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }
    let (mut sink, mut frames) = Framed::new(stream, LinkCodec).split();

    let hello = LinkFrame::Hello { node_id: inner.node_id.clone() };
    if let Err(e) = sink.send(hello).await {
        tracing::warn!("Link handshake failed: {}", e);
        return;
    }
    let timeout = Duration::from_millis(inner.config.connect_timeout_ms);
    let peer_id = match tokio::time::timeout(timeout, frames.next()).await {
        Ok(Some(Ok(LinkFrame::Hello { node_id }))) => node_id,
        other => {
            tracing::warn!("Link handshake failed: {:?}", other.map(|f| f.map(|r| r.is_ok())));
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<LinkFrame>();
    *inner.outbound.lock() = Some(tx.clone());
    inner.connected.store(true, Ordering::SeqCst);
    tracing::info!("Link to {} up", peer_id);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::warn!("Link write failed: {}", e);
                break;
            }
        }
    });

    let mut shutdown = inner.shutdown.subscribe();
    let limit = inner.config.busy_retry_limit.max(1);
    let delay = Duration::from_millis(inner.config.busy_retry_delay_ms);
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = shutdown.changed() => None,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!("Link read failed: {}", e);
                break;
            }
            None => break,
        };

        match frame {
            LinkFrame::Message { correlation, bytes } => {
                let delivery = deliver(inner, Bytes::from(bytes), None, limit, delay).await;
                let _ = tx.send(reply(delivery, correlation));
            }
            LinkFrame::Bulk { correlation, bytes, region, offset, data } => {
                let bulk = BulkWrite { region, offset, data: Bytes::from(data) };
                let delivery = deliver(inner, Bytes::from(bytes), Some(bulk), limit, delay).await;
                let _ = tx.send(reply(delivery, correlation));
            }
            LinkFrame::Ack { correlation } => {
                if inner.pending.lock().remove(&correlation) {
                    inner.report(TransportEvent::MessageTransmitted { correlation });
                }
            }
            LinkFrame::Busy { correlation } => {
                if inner.pending.lock().remove(&correlation) {
                    inner.report(TransportEvent::PeerBusy { correlation });
                }
            }
            LinkFrame::Hello { node_id } => tracing::debug!("Repeated hello from {}", node_id),
        }
    }

    inner.connected.store(false, Ordering::SeqCst);
    inner.outbound.lock().take();
    writer.abort();

    let pending: Vec<u32> = inner.pending.lock().drain().collect();
    for correlation in pending {
        inner.report(TransportEvent::PeerNotPresent { correlation });
    }
    tracing::warn!("Link to {} down", peer_id);
    inner.report(TransportEvent::PeerContactLost);
}

async fn deliver(
    inner: &TcpInner,
    bytes: Bytes,
    bulk: Option<BulkWrite>,
    limit: u32,
    delay: Duration,
) -> Delivery {
    let callback = inner.callback.lock().clone();
    match callback {
        Some(callback) => deliver_with_retry(&callback, &bytes, &bulk, limit, delay).await,
        None => Delivery::Busy,
    }
}

fn reply(delivery: Delivery, correlation: u32) -> LinkFrame {
    match delivery {
        Delivery::Accepted => LinkFrame::Ack { correlation },
        Delivery::Busy => LinkFrame::Busy { correlation },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_frames_and_checks() {
        let mut codec = LinkCodec;
        let mut buf = BytesMut::new();
        let frame = LinkFrame::Message { correlation: 3, bytes: vec![1, 2, 3] };
        codec.encode(frame.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
        assert!(partial.is_empty());

        let mut corrupt = BytesMut::new();
        codec.encode(LinkFrame::Ack { correlation: 1 }, &mut corrupt).unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        assert!(codec.decode(&mut corrupt).is_err());
    }

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let callback: EventCallback = Arc::new(move |event| {
            let entry = match event {
                TransportEvent::MessageReceived { bytes, bulk } => {
                    format!("rx:{}:{}", bytes[0], bulk.map(|b| b.data.len()).unwrap_or(0))
                }
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

    async fn wait_until(f: impl Fn() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_link_delivers_and_reports_loss() {
        let listen_config = LinkConfig {
            bind_address: "127.0.0.1:0".into(),
            listen: true,
            ..Default::default()
        };
        let server = TcpTransport::new("spa", listen_config);
        let (cb_server, log_server) = recorder();
        server.register(ClientId::DATABASE, cb_server).unwrap();
        let address = server.start().await.unwrap().unwrap();

        let dial_config = LinkConfig {
            peer_address: Some(address.to_string()),
            reconnect_interval_ms: 50,
            ..Default::default()
        };
        let client = TcpTransport::new("spb", dial_config);
        let (cb_client, log_client) = recorder();
        client.register(ClientId::DATABASE, cb_client).unwrap();
        client.start().await.unwrap();

        wait_until(|| client.is_peer_alive() && server.is_peer_alive()).await;
        assert!(client.is_peer_alive());

        client.send(ClientId::DATABASE, Bytes::from_static(&[7]), 1).unwrap();
        let bulk = BulkWrite { region: 2, offset: 0, data: Bytes::from(vec![0u8; 32]) };
        client.send_bulk(ClientId::DATABASE, Bytes::from_static(&[8]), bulk, 2).unwrap();
        wait_until(|| log_client.lock().len() == 2).await;
        assert_eq!(*log_server.lock(), vec!["rx:7:0", "rx:8:32"]);
        assert_eq!(*log_client.lock(), vec!["ok:1", "ok:2"]);

        server.shutdown();
        wait_until(|| log_client.lock().contains(&"lost".to_string())).await;
        assert!(!client.is_peer_alive());
        client.shutdown();
    }
}
