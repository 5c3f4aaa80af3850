//! The byte-stream contract under the remote network.
//!
//! A transport produces authenticated, encrypted frame channels; the
//! network layer above it owns queueing, reconnection, and the wire
//! protocol. Errors are classified at this boundary: retryable failures
//! feed the backoff loop, fatal ones make it give up and drop the peer's
//! queue.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Stable identity of a remote peer (public-key derived in production).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Network failures, classified for the reconnection loop.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Worth retrying with backoff (dial timeouts, transient I/O).
    #[error("retryable network error: {0}")]
    Retryable(String),
    /// Authentication, crypto, or protocol damage; give up on the peer.
    #[error("fatal network error: {0}")]
    Fatal(String),
    /// The peer closed the connection on purpose.
    #[error("peer disconnected gracefully")]
    GracefulDisconnect,
    /// The global cancellation signal fired.
    #[error("network stopped")]
    Aborted,
}

impl NetworkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetworkError::Retryable(_))
    }
}

/// Write half of a connected channel.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &str) -> Result<(), NetworkError>;
}

/// Read half of a connected channel. `None` means the stream ended
/// gracefully; errors classify the failure.
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Option<Result<String, NetworkError>>;
}

/// One live connection to a peer.
pub struct TransportChannel {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Dials peers over some authenticated medium.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `peer`, consulting `hints` (extra addresses) as needed.
    async fn dial(&self, peer: &PeerId, hints: &[String]) -> Result<TransportChannel, NetworkError>;
}

// ============================================================================
// Tests
// ============================================================================
