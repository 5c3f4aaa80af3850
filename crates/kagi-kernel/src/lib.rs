//! # kagi-kernel
//!
//! The Kagi object kernel. A single task owns all durable state and runs
//! the crank loop: dequeue one item, deliver it to the owning vat, remote
//! peer, or kernel facet, buffer its effects, and commit, or roll the
//! whole crank back. Around that core sit the c-list translator, the
//! garbage collector for cross-endpoint references, the promise
//! subscription machinery, and vat/subcluster lifecycle.
//!
//! Hosting is pluggable: [`PlatformServices`] spawns vat workers (the
//! subprocess platform for production, the loopback platform for tests),
//! and [`RemoteSender`] bridges to the peer network in `kagi-net`.

mod deliver;
pub mod gc;
pub mod kernel;
mod lifecycle;
pub mod net_adapter;
pub mod platform;
pub mod queue;
pub mod remote;
pub mod syscalls;
pub mod test_utils;
pub mod translator;
pub mod vat;

pub use kernel::{Kernel, KernelHandle};
pub use platform::{PlatformServices, ProcessPlatform, WorkerStream};
pub use queue::{KernelQueue, ResolutionOutcome};
pub use remote::{NullRemoteSender, RemoteSender};
pub use vat::{SyscallSink, VatHandle};
