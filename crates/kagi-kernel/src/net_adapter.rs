//! Wiring between the kernel and the remote network.
//!
//! The kernel speaks in `RemoteId`s, the network in `PeerId`s; the shared
//! registry binds the two. Outbound deliveries are fired into the network
//! as `remoteDeliver` payloads; inbound wire methods become kernel
//! commands through the handle. Unknown peers are registered on first
//! contact.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use kagi_net::{PeerId, RemoteMessageHandler, RemoteNetwork};
use kagi_types::RemoteId;

use crate::kernel::KernelHandle;
use crate::remote::RemoteSender;

/// Bidirectional RemoteId ↔ PeerId binding.
#[derive(Default)]
pub struct RemoteRegistry {
    by_remote: Mutex<HashMap<RemoteId, PeerId>>,
    by_peer: Mutex<HashMap<PeerId, RemoteId>>,
}

pub type SharedRemoteRegistry = Arc<RemoteRegistry>;

impl RemoteRegistry {
    pub fn shared() -> SharedRemoteRegistry {
        Arc::new(Self::default())
    }

    pub fn bind(&self, remote: RemoteId, peer: PeerId) {
        self.by_remote.lock().insert(remote, peer.clone());
        self.by_peer.lock().insert(peer, remote);
    }

    pub fn peer_of(&self, remote: RemoteId) -> Option<PeerId> {
        self.by_remote.lock().get(&remote).cloned()
    }

    pub fn remote_of(&self, peer: &PeerId) -> Option<RemoteId> {
        self.by_peer.lock().get(peer).copied()
    }

    pub fn unbind(&self, peer: &PeerId) {
        if let Some(remote) = self.by_peer.lock().remove(peer) {
            self.by_remote.lock().remove(&remote);
        }
    }
}

/// Kernel-side sender: resolves the peer and ships the payload.
pub struct NetworkRemoteSender {
    network: RemoteNetwork,
    registry: SharedRemoteRegistry,
}

impl NetworkRemoteSender {
    pub fn new(network: RemoteNetwork, registry: SharedRemoteRegistry) -> Self {
        Self { network, registry }
    }
}

impl RemoteSender for NetworkRemoteSender {
    fn send_frame(&self, remote: RemoteId, frame: String) {
        let Some(peer) = self.registry.peer_of(remote) else {
            warn!(%remote, "no peer bound, dropping outbound frame");
            return;
        };
        let network = self.network.clone();
        tokio::spawn(async move {
            network.send_delivery(&peer, &frame, &[]).await;
        });
    }

    fn stop(&self) {
        self.network.stop();
    }
}

/// Network-side handler: maps peers to remotes (registering on first
/// contact) and forwards the wire methods to the kernel.
pub struct KernelMessageHandler {
    handle: KernelHandle,
    registry: SharedRemoteRegistry,
}

impl KernelMessageHandler {
    pub fn new(handle: KernelHandle, registry: SharedRemoteRegistry) -> Self {
        Self { handle, registry }
    }

    async fn remote_for(&self, peer: &PeerId) -> Option<RemoteId> {
        if let Some(remote) = self.registry.remote_of(peer) {
            return Some(remote);
        }
        match self.handle.register_remote().await {
            Ok(remote) => {
                debug!(%peer, %remote, "peer registered");
                self.registry.bind(remote, peer.clone());
                Some(remote)
            }
            Err(e) => {
                warn!(%peer, error = %e, "cannot register peer");
                None
            }
        }
    }
}

#[async_trait]
impl RemoteMessageHandler for KernelMessageHandler {
    async fn remote_deliver(&self, from: PeerId, message: String) -> Option<String> {
        let remote = self.remote_for(&from).await?;
        match self.handle.remote_message(remote, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%from, error = %e, "remote delivery rejected");
                None
            }
        }
    }

    async fn remote_give_up(&self, peer: PeerId) {
        if let Some(remote) = self.registry.remote_of(&peer) {
            if let Err(e) = self.handle.remote_give_up(remote).await {
                warn!(%peer, error = %e, "give-up handling failed");
            }
            self.registry.unbind(&peer);
        }
    }

    async fn remote_incarnation_change(&self, peer: PeerId, old: u64, new: u64) {
        let _ = old;
        if let Some(remote) = self.registry.remote_of(&peer) {
            if let Err(e) = self
                .handle
                .remote_incarnation_change(remote, new)
                .await
            {
                warn!(%peer, error = %e, "incarnation change rejected");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
