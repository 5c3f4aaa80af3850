//! The remote network: channel management, queueing, reconnection.
//!
//! One live channel per peer, at most. Frames to a reconnecting peer queue
//! (bounded, drop-newest); a lost channel starts exactly one reconnection
//! loop, which backs off exponentially, re-dials, and flushes the queue in
//! order once the peer is back. `stop()` aborts every delay and dial
//! through one cancellation token.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::MessageQueue;
use crate::reconnect::{BACKOFF_BASE, BACKOFF_CAP, ReconnectionManager, backoff_delay};
use crate::transport::{FrameSink, NetworkError, PeerId, Transport, TransportChannel};
use crate::wire::{self, RemoteMessageHandler};

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// 0 means retry forever.
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 0,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
        }
    }
}

struct PeerChannel {
    sink: Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>,
    reader: JoinHandle<()>,
}

struct Inner {
    local: PeerId,
    transport: Box<dyn Transport>,
    handler: Arc<dyn RemoteMessageHandler>,
    channels: Mutex<HashMap<PeerId, PeerChannel>>,
    queues: Mutex<HashMap<PeerId, MessageQueue>>,
    hints: Mutex<HashMap<PeerId, BTreeSet<String>>>,
    reconnect: ReconnectionManager,
    config: NetworkConfig,
    cancel: CancellationToken,
    next_frame_id: AtomicU64,
}

#[derive(Clone)]
pub struct RemoteNetwork {
    inner: Arc<Inner>,
}

impl RemoteNetwork {
    pub fn new(
        local: PeerId,
        transport: Box<dyn Transport>,
        handler: Arc<dyn RemoteMessageHandler>,
        config: NetworkConfig,
    ) -> Self {
        let reconnect =
            ReconnectionManager::new(config.backoff_base, config.backoff_cap);
        Self {
            inner: Arc::new(Inner {
                local,
                transport,
                handler,
                channels: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                hints: Mutex::new(HashMap::new()),
                reconnect,
                config,
                cancel: CancellationToken::new(),
                next_frame_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    // ── Introspection (tests, status) ───────────────────────────────────

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.channels.lock().contains_key(peer)
    }

    pub fn is_reconnecting(&self, peer: &PeerId) -> bool {
        self.inner.reconnect.is_reconnecting(peer)
    }

    pub fn attempt_count(&self, peer: &PeerId) -> u32 {
        self.inner.reconnect.state(peer).attempt_count
    }

    pub fn queue_len(&self, peer: &PeerId) -> usize {
        self.inner
            .queues
            .lock()
            .get(peer)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Wrap a kernel payload as `remoteDeliver` and send it.
    pub async fn send_delivery(&self, to: &PeerId, payload: &str, hints: &[String]) {
        let id = self.inner.next_frame_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = wire::deliver_frame(id, &self.inner.local, payload);
        self.send_remote_message(to, frame, hints).await;
    }

    /// Send one wire frame, queueing while the peer reconnects.
    pub async fn send_remote_message(&self, to: &PeerId, frame: String, hints: &[String]) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        if !hints.is_empty() {
            inner
                .hints
                .lock()
                .entry(to.clone())
                .or_default()
                .extend(hints.iter().cloned());
        }
        if inner.reconnect.is_reconnecting(to) {
            self.enqueue_frame(to, frame, hints);
            return;
        }
        let sink = {
            let channels = inner.channels.lock();
            channels.get(to).map(|c| Arc::clone(&c.sink))
        };
        let sink = match sink {
            Some(sink) => sink,
            None => match self.dial_idempotent(to, hints).await {
                Ok(()) => {
                    let channels = inner.channels.lock();
                    match channels.get(to) {
                        Some(c) => Arc::clone(&c.sink),
                        None => {
                            drop(channels);
                            self.enqueue_frame(to, frame, hints);
                            self.start_reconnection(to);
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %to, error = %e, "dial failed, queueing");
                    self.enqueue_frame(to, frame, hints);
                    if e.is_retryable() {
                        self.start_reconnection(to);
                    }
                    return;
                }
            },
        };
        match sink.lock().await.send(&frame).await {
            Ok(()) => {
                inner.reconnect.reset_backoff(to);
            }
            Err(e) => {
                warn!(peer = %to, error = %e, "write failed, queueing");
                self.enqueue_frame(to, frame, hints);
                self.handle_connection_loss(to);
            }
        }
    }

    fn enqueue_frame(&self, to: &PeerId, frame: String, hints: &[String]) {
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(to.clone()).or_default();
        queue.enqueue(frame, hints.iter().cloned().collect());
    }

    // ── Dialing ─────────────────────────────────────────────────────────

    /// Reuse the existing channel, or dial and install one.
    pub async fn dial_idempotent(
        &self,
        peer: &PeerId,
        hints: &[String],
    ) -> Result<(), NetworkError> {
        if self.inner.cancel.is_cancelled() {
            return Err(NetworkError::Aborted);
        }
        if self.is_connected(peer) {
            return Ok(());
        }
        let merged: Vec<String> = {
            let mut known = self
                .inner
                .hints
                .lock()
                .get(peer)
                .cloned()
                .unwrap_or_default();
            known.extend(hints.iter().cloned());
            known.into_iter().collect()
        };
        let channel = tokio::select! {
            result = self.inner.transport.dial(peer, &merged) => result?,
            _ = self.inner.cancel.cancelled() => return Err(NetworkError::Aborted),
        };
        self.install_channel(peer.clone(), channel);
        Ok(())
    }

    /// Install a connected channel (dialed here or accepted by a listener)
    /// and start its reader loop.
    pub fn install_channel(&self, peer: PeerId, channel: TransportChannel) {
        let sink = Arc::new(tokio::sync::Mutex::new(channel.sink));
        let reader = tokio::spawn(Self::reader_loop(
            self.clone(),
            peer.clone(),
            channel.stream,
        ));
        let previous = self.inner.channels.lock().insert(
            peer.clone(),
            PeerChannel {
                sink,
                reader,
            },
        );
        if let Some(previous) = previous {
            previous.reader.abort();
        }
        info!(peer = %peer, "channel installed");
    }

    async fn reader_loop(
        network: RemoteNetwork,
        peer: PeerId,
        mut stream: Box<dyn crate::transport::FrameStream>,
    ) {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = network.inner.cancel.cancelled() => return,
            };
            match next {
                Some(Ok(line)) => {
                    let reply = wire::dispatch_frame(
                        network.inner.handler.as_ref(),
                        &peer,
                        &line,
                    )
                    .await;
                    if let Some(reply) = reply {
                        network.send_remote_message(&peer, reply, &[]).await;
                    }
                }
                Some(Err(NetworkError::GracefulDisconnect)) | None => {
                    info!(peer = %peer, "peer disconnected gracefully");
                    network.remove_channel(&peer, false);
                    return;
                }
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "read failed");
                    network.handle_connection_loss_from_reader(&peer);
                    return;
                }
            }
        }
    }

    // ── Connection loss & reconnection ──────────────────────────────────

    fn remove_channel(&self, peer: &PeerId, abort_reader: bool) {
        if let Some(channel) = self.inner.channels.lock().remove(peer) {
            if abort_reader {
                channel.reader.abort();
            }
        }
    }

    /// Loss observed on the send path (the reader is on a dead stream too).
    pub fn handle_connection_loss(&self, peer: &PeerId) {
        self.remove_channel(peer, true);
        self.start_reconnection(peer);
    }

    /// Loss observed by the reader itself; it exits on its own.
    fn handle_connection_loss_from_reader(&self, peer: &PeerId) {
        self.remove_channel(peer, false);
        self.start_reconnection(peer);
    }

    /// At most one reconnection loop per peer.
    fn start_reconnection(&self, peer: &PeerId) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if !self.inner.reconnect.try_start_reconnecting(peer) {
            return; // a loop is already dialing
        }
        info!(peer = %peer, "reconnection started");
        tokio::spawn(Self::reconnection_loop(self.clone(), peer.clone()));
    }

    async fn reconnection_loop(network: RemoteNetwork, peer: PeerId) {
        let inner = &network.inner;
        let max = inner.config.max_reconnect_attempts;
        loop {
            if inner.cancel.is_cancelled() {
                inner.reconnect.stop_reconnecting(&peer);
                return;
            }
            if !inner.reconnect.should_retry(&peer, max) {
                warn!(peer = %peer, "giving up on peer, dropping its queue");
                inner.reconnect.stop_reconnecting(&peer);
                inner.queues.lock().remove(&peer);
                return;
            }
            let attempt = inner.reconnect.increment_attempt(&peer);
            let delay = backoff_delay(
                inner.config.backoff_base,
                inner.config.backoff_cap,
                attempt,
            );
            debug!(peer = %peer, attempt, ?delay, "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.cancel.cancelled() => {
                    inner.reconnect.stop_reconnecting(&peer);
                    return;
                }
            }

            let hints: Vec<String> = {
                let mut merged = inner.hints.lock().get(&peer).cloned().unwrap_or_default();
                if let Some(queue) = inner.queues.lock().get(&peer) {
                    merged.extend(queue.all_hints());
                }
                merged.into_iter().collect()
            };
            let dialed = tokio::select! {
                result = inner.transport.dial(&peer, &hints) => result,
                _ = inner.cancel.cancelled() => {
                    inner.reconnect.stop_reconnecting(&peer);
                    return;
                }
            };
            match dialed {
                Ok(channel) => {
                    network.install_channel(peer.clone(), channel);
                    // attempts are spent; queued frames go out in order.
                    // is_reconnecting stays true so concurrent sends keep
                    // queueing behind the flush instead of racing it.
                    inner.reconnect.reset_backoff(&peer);
                    match network.flush_queued_messages(&peer).await {
                        Ok(()) => {
                            inner.reconnect.stop_reconnecting(&peer);
                            info!(peer = %peer, "reconnected and flushed");
                            return;
                        }
                        Err(e) => {
                            // flush failure re-asserts the outage; continue
                            // this loop rather than spawning a second dialer
                            warn!(peer = %peer, error = %e, "flush failed, still down");
                            network.remove_channel(&peer, true);
                            continue;
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(peer = %peer, error = %e, "redial failed");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "fatal redial error, dropping queue");
                    inner.reconnect.stop_reconnecting(&peer);
                    inner.queues.lock().remove(&peer);
                    return;
                }
            }
        }
    }

    /// Write queued frames in order; on failure the unsent frame goes back
    /// to the front so order survives the next attempt.
    async fn flush_queued_messages(&self, peer: &PeerId) -> Result<(), NetworkError> {
        loop {
            let next = {
                let mut queues = self.inner.queues.lock();
                match queues.get_mut(peer) {
                    Some(queue) => queue.dequeue(),
                    None => None,
                }
            };
            let Some(message) = next else {
                return Ok(());
            };
            let sink = {
                let channels = self.inner.channels.lock();
                channels.get(peer).map(|c| Arc::clone(&c.sink))
            };
            let Some(sink) = sink else {
                self.requeue_one(peer, message);
                return Err(NetworkError::Retryable("channel lost during flush".into()));
            };
            if let Err(e) = sink.lock().await.send(&message.message).await {
                self.requeue_one(peer, message);
                return Err(e);
            }
        }
    }

    fn requeue_one(&self, peer: &PeerId, message: crate::queue::QueuedMessage) {
        let mut queues = self.inner.queues.lock();
        queues
            .entry(peer.clone())
            .or_default()
            .requeue_front(vec![message]);
    }

    // ── Wake detection & shutdown ───────────────────────────────────────

    /// Watch the wall clock; a jump larger than `threshold` beyond the
    /// check interval means the host slept, so every in-flight backoff
    /// restarts at the minimum delay.
    pub fn start_wake_detector(&self, interval: Duration, threshold: Duration) -> JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            let mut last = SystemTime::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = network.inner.cancel.cancelled() => return,
                }
                let now = SystemTime::now();
                if let Ok(elapsed) = now.duration_since(last) {
                    if elapsed > interval + threshold {
                        info!(?elapsed, "wake from sleep detected, resetting backoffs");
                        network.inner.reconnect.reset_all_backoffs();
                    }
                }
                last = now;
            }
        })
    }

    /// Abort all delays and dials, drop all channels and queues.
    pub fn stop(&self) {
        info!("remote network stopping");
        self.inner.cancel.cancel();
        let mut channels = self.inner.channels.lock();
        for (_, channel) in channels.drain() {
            channel.reader.abort();
        }
        self.inner.queues.lock().clear();
    }

    /// Announce we are dropping all state about `peer`, then do it.
    pub async fn give_up(&self, peer: &PeerId) {
        let frame = wire::give_up_frame(&self.inner.local);
        self.send_remote_message(peer, frame, &[]).await;
        self.remove_channel(peer, true);
        self.inner.reconnect.forget(peer);
        self.inner.queues.lock().remove(peer);
        self.inner.hints.lock().remove(peer);
    }
}
