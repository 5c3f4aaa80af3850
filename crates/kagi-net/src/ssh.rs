//! SSH transport: authenticated, encrypted frame channels over russh.
//!
//! SSH supplies auth and encryption; this module supplies dialing and
//! accepting. Each logical link opens one SSH session channel per purpose
//! (`capTp` for kernel traffic, `command` for control), identified by a
//! one-line JSON preamble. Peer identity is the SHA-256 fingerprint of the
//! authenticated public key, never the preamble's say-so.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use russh::client::{self, Handle};
use russh::keys::{Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelStream};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::network::RemoteNetwork;
use crate::transport::{
    FrameSink, FrameStream, NetworkError, PeerId, Transport, TransportChannel,
};

/// Channel purposes; one SSH channel each.
pub const PURPOSE_CAPTP: &str = "capTp";
pub const PURPOSE_COMMAND: &str = "command";

/// First line on every channel, before any wire frame.
#[derive(Debug, Serialize, Deserialize)]
struct ChannelPreamble {
    purpose: String,
}

/// Peer id derived from an authenticated public key.
pub fn peer_id_of_key(key: &PublicKey) -> PeerId {
    PeerId::new(key.fingerprint(HashAlg::Sha256).to_string())
}

fn classify_russh_error(e: &russh::Error) -> NetworkError {
    match e {
        russh::Error::NotAuthenticated => NetworkError::Fatal(e.to_string()),
        russh::Error::Disconnect => NetworkError::GracefulDisconnect,
        _ => NetworkError::Retryable(e.to_string()),
    }
}

// ── Frame halves over an SSH channel stream ─────────────────────────────────

struct SshSink<S> {
    writer: FramedWrite<WriteHalf<S>, LinesCodec>,
}

#[async_trait]
impl<S: tokio::io::AsyncWrite + tokio::io::AsyncRead + Send + Unpin + 'static> FrameSink
    for SshSink<S>
{
    async fn send(&mut self, frame: &str) -> Result<(), NetworkError> {
        self.writer
            .send(frame.to_string())
            .await
            .map_err(|e| NetworkError::Retryable(format!("ssh write: {e}")))
    }
}

struct SshStream<S> {
    reader: FramedRead<ReadHalf<S>, LinesCodec>,
}

#[async_trait]
impl<S: tokio::io::AsyncWrite + tokio::io::AsyncRead + Send + Unpin + 'static> FrameStream
    for SshStream<S>
{
    async fn next(&mut self) -> Option<Result<String, NetworkError>> {
        match self.reader.next().await {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(e)) => Some(Err(NetworkError::Retryable(format!("ssh read: {e}")))),
            None => None, // clean channel close
        }
    }
}

fn channel_to_transport<S>(stream: S) -> (SshSink<S>, SshStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        SshSink {
            writer: FramedWrite::new(writer, LinesCodec::new()),
        },
        SshStream {
            reader: FramedRead::new(reader, LinesCodec::new()),
        },
    )
}

// ── Client side ─────────────────────────────────────────────────────────────

/// Client handler: records the server key.
///
/// TODO: verify the server key against a known-hosts store instead of
/// accepting whatever is offered.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "accepting server key without verification"
        );
        Ok(true)
    }
}

/// SSH dialer. Addresses come from hints of the form `ssh://host:port`.
pub struct SshTransport {
    username: String,
    key: Arc<PrivateKey>,
    purpose: &'static str,
}

impl SshTransport {
    pub fn new(username: impl Into<String>, key: Arc<PrivateKey>, purpose: &'static str) -> Self {
        Self {
            username: username.into(),
            key,
            purpose,
        }
    }

    /// An ephemeral Ed25519 identity (tests, throwaway nodes).
    pub fn ephemeral(username: impl Into<String>) -> Self {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .expect("ed25519 keygen cannot fail");
        Self::new(username, Arc::new(key), PURPOSE_CAPTP)
    }

    /// The fingerprint-derived peer id other nodes will see.
    pub fn local_peer_id(&self) -> PeerId {
        peer_id_of_key(self.key.public_key())
    }

    fn addr_from_hints(hints: &[String]) -> Option<String> {
        hints
            .iter()
            .find_map(|hint| hint.strip_prefix("ssh://").map(str::to_string))
    }

    async fn open_session(&self, addr: &str) -> Result<Handle<ClientHandler>, NetworkError> {
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, ClientHandler)
            .await
            .map_err(|e| classify_russh_error(&e))?;
        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::clone(&self.key), None);
        let auth = session
            .authenticate_publickey(&self.username, key_with_hash)
            .await
            .map_err(|e| classify_russh_error(&e))?;
        if !auth.success() {
            return Err(NetworkError::Fatal("public key rejected".into()));
        }
        debug!(addr, user = %self.username, "ssh session authenticated");
        Ok(session)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn dial(&self, peer: &PeerId, hints: &[String]) -> Result<TransportChannel, NetworkError> {
        let addr = Self::addr_from_hints(hints).ok_or_else(|| {
            NetworkError::Retryable(format!("no ssh address hint for {peer}"))
        })?;
        let session = self.open_session(&addr).await?;
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| classify_russh_error(&e))?;
        let stream = channel.into_stream();
        let (mut sink, stream) = channel_to_transport(stream);
        let preamble = serde_json::to_string(&ChannelPreamble {
            purpose: self.purpose.to_string(),
        })
        .expect("preamble encodes");
        sink.send(&preamble).await?;
        info!(%peer, addr, purpose = self.purpose, "ssh channel open");
        Ok(TransportChannel {
            sink: Box::new(sink),
            stream: Box::new(stream),
        })
    }
}

// ── Server side ─────────────────────────────────────────────────────────────

/// Accepts SSH connections and installs their channels into a
/// [`RemoteNetwork`], keyed by the client key's fingerprint.
pub struct SshListener {
    bind_addr: SocketAddr,
    host_key: PrivateKey,
    network: RemoteNetwork,
}

impl SshListener {
    pub fn new(bind_addr: SocketAddr, host_key: PrivateKey, network: RemoteNetwork) -> Self {
        Self {
            bind_addr,
            host_key,
            network,
        }
    }

    /// A listener with a throwaway host key (tests).
    pub fn ephemeral(port: u16, network: RemoteNetwork) -> Self {
        let host_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .expect("ed25519 keygen cannot fail");
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)), host_key, network)
    }

    pub async fn run(self) -> std::io::Result<()> {
        let config = Arc::new(server::Config {
            keys: vec![self.host_key.clone()],
            ..Default::default()
        });
        info!(addr = %self.bind_addr, "ssh listener starting");
        let socket = TcpListener::bind(self.bind_addr).await?;
        let mut factory = ListenerFactory {
            network: self.network,
        };
        factory
            .run_on_socket(config, &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

struct ListenerFactory {
    network: RemoteNetwork,
}

impl server::Server for ListenerFactory {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(?peer_addr, "inbound ssh connection");
        ConnectionHandler {
            network: self.network.clone(),
            peer: None,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!(error = %error, "ssh session error");
    }
}

struct ConnectionHandler {
    network: RemoteNetwork,
    peer: Option<PeerId>,
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let peer = peer_id_of_key(public_key);
        info!(user, %peer, "peer authenticated");
        self.peer = Some(peer);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(peer) = self.peer.clone() else {
            warn!("channel before authentication refused");
            return Ok(false);
        };
        let network = self.network.clone();
        tokio::spawn(accept_channel(network, peer, channel.into_stream()));
        Ok(true)
    }
}

async fn accept_channel(network: RemoteNetwork, peer: PeerId, stream: ChannelStream<Msg>) {
    let (sink, mut frames) = channel_to_transport(stream);
    // the first line names the channel's purpose
    let preamble = match frames.next().await {
        Some(Ok(line)) => serde_json::from_str::<ChannelPreamble>(&line).ok(),
        _ => None,
    };
    let Some(preamble) = preamble else {
        warn!(%peer, "channel without preamble dropped");
        return;
    };
    debug!(%peer, purpose = %preamble.purpose, "inbound channel adopted");
    network.install_channel(
        peer,
        TransportChannel {
            sink: Box::new(sink),
            stream: Box::new(frames),
        },
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_from_hints() {
        let hints = vec![
            "/ip4/10.0.0.1".to_string(),
            "ssh://127.0.0.1:2222".to_string(),
        ];
        assert_eq!(
            SshTransport::addr_from_hints(&hints).as_deref(),
            Some("127.0.0.1:2222")
        );
        assert_eq!(SshTransport::addr_from_hints(&[]), None);
    }

    #[test]
    fn test_local_peer_id_is_stable() {
        let transport = SshTransport::ephemeral("kagi");
        assert_eq!(transport.local_peer_id(), transport.local_peer_id());
    }

    #[test]
    fn test_preamble_roundtrip() {
        let preamble = ChannelPreamble {
            purpose: PURPOSE_CAPTP.to_string(),
        };
        let line = serde_json::to_string(&preamble).unwrap();
        let back: ChannelPreamble = serde_json::from_str(&line).unwrap();
        assert_eq!(back.purpose, "capTp");
    }
}
