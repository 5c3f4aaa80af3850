//! # kagi-net
//!
//! Remote-peer plumbing for the Kagi kernel: a [`Transport`] abstraction
//! over authenticated byte-streams, per-peer frame channels with bounded
//! queues, an exponential-backoff reconnection manager with a
//! wake-from-sleep reset, and the three-method peer wire protocol
//! (`remoteDeliver`, `remoteGiveUp`, `remoteIncarnationChange`).
//!
//! The SSH transport (russh) is the production medium; the in-memory
//! transport backs tests.

pub mod memory;
pub mod network;
pub mod queue;
pub mod reconnect;
pub mod ssh;
pub mod transport;
pub mod wire;

pub use memory::{MemoryPeerControl, MemoryTransport};
pub use network::{NetworkConfig, RemoteNetwork};
pub use queue::{MAX_QUEUE, MessageQueue};
pub use reconnect::{BACKOFF_BASE, BACKOFF_CAP, ReconnectionManager, backoff_delay};
pub use ssh::{PURPOSE_CAPTP, PURPOSE_COMMAND, SshListener, SshTransport};
pub use transport::{FrameSink, FrameStream, NetworkError, PeerId, Transport, TransportChannel};
pub use wire::RemoteMessageHandler;
