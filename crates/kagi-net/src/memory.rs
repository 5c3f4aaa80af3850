//! In-memory transport for tests.
//!
//! Each registered peer is a scriptable endpoint: tests flip it offline
//! (dials fail retryably), sever live connections (reads and writes fail),
//! close gracefully, inject inbound frames, and inspect everything the
//! network delivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::transport::{
    FrameSink, FrameStream, NetworkError, PeerId, Transport, TransportChannel,
};

struct Connection {
    severed: Arc<AtomicBool>,
    sever_notify: Arc<Notify>,
    inbound_tx: mpsc::UnboundedSender<String>,
}

struct PeerEntry {
    online: bool,
    fatal: bool,
    received: Arc<Mutex<Vec<String>>>,
    connections: Vec<Connection>,
    dial_count: u64,
}

#[derive(Default)]
struct HubInner {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    dials: AtomicU64,
}

/// Test transport: a hub of scriptable peers.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<HubInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer (online) and get its control handle.
    pub fn register(&self, peer: &PeerId) -> MemoryPeerControl {
        self.inner.peers.lock().insert(
            peer.clone(),
            PeerEntry {
                online: true,
                fatal: false,
                received: Arc::new(Mutex::new(Vec::new())),
                connections: Vec::new(),
                dial_count: 0,
            },
        );
        MemoryPeerControl {
            inner: Arc::clone(&self.inner),
            peer: peer.clone(),
        }
    }

    pub fn total_dials(&self) -> u64 {
        self.inner.dials.load(Ordering::Relaxed)
    }
}

/// Test-side handle to one peer.
pub struct MemoryPeerControl {
    inner: Arc<HubInner>,
    peer: PeerId,
}

impl MemoryPeerControl {
    /// Offline peers fail dials with a retryable error.
    pub fn set_online(&self, online: bool) {
        if let Some(entry) = self.inner.peers.lock().get_mut(&self.peer) {
            entry.online = online;
        }
    }

    /// Make future dials fail fatally (bad credentials, etc.).
    pub fn set_fatal(&self, fatal: bool) {
        if let Some(entry) = self.inner.peers.lock().get_mut(&self.peer) {
            entry.fatal = fatal;
        }
    }

    /// Abruptly kill every live connection to this peer.
    pub fn sever(&self) {
        if let Some(entry) = self.inner.peers.lock().get_mut(&self.peer) {
            for connection in entry.connections.drain(..) {
                connection.severed.store(true, Ordering::SeqCst);
                connection.sever_notify.notify_waiters();
            }
        }
    }

    /// Cleanly end every live connection (graceful disconnect).
    pub fn close_gracefully(&self) {
        if let Some(entry) = self.inner.peers.lock().get_mut(&self.peer) {
            entry.connections.clear(); // dropping inbound_tx ends the stream
        }
    }

    /// Inject an inbound frame on the most recent connection.
    pub fn inject(&self, frame: &str) -> bool {
        let peers = self.inner.peers.lock();
        peers
            .get(&self.peer)
            .and_then(|entry| entry.connections.last())
            .map(|c| c.inbound_tx.send(frame.to_string()).is_ok())
            .unwrap_or(false)
    }

    /// Frames this peer has received, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.inner
            .peers
            .lock()
            .get(&self.peer)
            .map(|entry| entry.received.lock().clone())
            .unwrap_or_default()
    }

    pub fn dial_count(&self) -> u64 {
        self.inner
            .peers
            .lock()
            .get(&self.peer)
            .map(|entry| entry.dial_count)
            .unwrap_or(0)
    }
}

struct MemorySink {
    severed: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &str) -> Result<(), NetworkError> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(NetworkError::Retryable("connection severed".into()));
        }
        self.received.lock().push(frame.to_string());
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
    severed: Arc<AtomicBool>,
    sever_notify: Arc<Notify>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<String, NetworkError>> {
        if self.severed.load(Ordering::SeqCst) {
            return Some(Err(NetworkError::Retryable("connection severed".into())));
        }
        tokio::select! {
            frame = self.rx.recv() => frame.map(Ok),
            _ = self.sever_notify.notified() => {
                Some(Err(NetworkError::Retryable("connection severed".into())))
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, peer: &PeerId, _hints: &[String]) -> Result<TransportChannel, NetworkError> {
        self.inner.dials.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.inner.peers.lock();
        let entry = peers
            .get_mut(peer)
            .ok_or_else(|| NetworkError::Fatal(format!("unknown peer {peer}")))?;
        entry.dial_count += 1;
        if entry.fatal {
            return Err(NetworkError::Fatal("authentication refused".into()));
        }
        if !entry.online {
            return Err(NetworkError::Retryable("peer unreachable".into()));
        }
        let severed = Arc::new(AtomicBool::new(false));
        let sever_notify = Arc::new(Notify::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        entry.connections.push(Connection {
            severed: Arc::clone(&severed),
            sever_notify: Arc::clone(&sever_notify),
            inbound_tx,
        });
        Ok(TransportChannel {
            sink: Box::new(MemorySink {
                severed: Arc::clone(&severed),
                received: Arc::clone(&entry.received),
            }),
            stream: Box::new(MemoryStream {
                rx: inbound_rx,
                severed,
                sever_notify,
            }),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_send() {
        let hub = MemoryTransport::new();
        let peer = PeerId::new("pX");
        let control = hub.register(&peer);
        let mut channel = hub.dial(&peer, &[]).await.unwrap();
        channel.sink.send("one").await.unwrap();
        channel.sink.send("two").await.unwrap();
        assert_eq!(control.received(), vec!["one", "two"]);
        assert_eq!(control.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_dial_is_retryable() {
        let hub = MemoryTransport::new();
        let peer = PeerId::new("pX");
        let control = hub.register(&peer);
        control.set_online(false);
        assert!(matches!(
            hub.dial(&peer, &[]).await,
            Err(NetworkError::Retryable(_))
        ));
        assert!(matches!(
            hub.dial(&PeerId::new("ghost"), &[]).await,
            Err(NetworkError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_fails_reads_and_writes() {
        let hub = MemoryTransport::new();
        let peer = PeerId::new("pX");
        let control = hub.register(&peer);
        let mut channel = hub.dial(&peer, &[]).await.unwrap();
        control.sever();
        assert!(channel.sink.send("late").await.is_err());
        assert!(matches!(
            channel.stream.next().await,
            Some(Err(NetworkError::Retryable(_)))
        ));
    }

    #[tokio::test]
    async fn test_graceful_close_ends_stream() {
        let hub = MemoryTransport::new();
        let peer = PeerId::new("pX");
        let control = hub.register(&peer);
        let mut channel = hub.dial(&peer, &[]).await.unwrap();
        control.close_gracefully();
        assert!(channel.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_inject_reaches_stream() {
        let hub = MemoryTransport::new();
        let peer = PeerId::new("pX");
        let control = hub.register(&peer);
        let mut channel = hub.dial(&peer, &[]).await.unwrap();
        assert!(control.inject("hello"));
        assert_eq!(channel.stream.next().await.unwrap().unwrap(), "hello");
    }
}
