//! # kagi-types
//!
//! Shared vocabulary of the Kagi object kernel: typed identifiers, kernel
//! and endpoint reference handles, marshalled capability data, run-queue
//! items, cluster configuration, the vat-worker protocol, and the JSON-RPC
//! envelope both external protocols ride on.
//!
//! This crate is deliberately leaf-level: no I/O, no async, no persistence.
//! Every other Kagi crate builds on these types.

pub mod capdata;
pub mod cluster;
pub mod error;
pub mod ids;
pub mod refs;
pub mod rpc;
pub mod run;
pub mod syscall;

pub use capdata::{CapData, Message, VatCapData, VatMessage};
pub use cluster::{
    ClusterConfig, KernelStatus, SubclusterResult, SubclusterStatus, VatConfig, VatState,
    VatStatus,
};
pub use error::{IdParseError, KernelError};
pub use ids::{EndpointId, RemoteId, SubclusterId, VatId};
pub use refs::{ERef, KRef, Polarity, RefKind};
pub use rpc::{RpcError, RpcMessage, RpcRequest, RpcResponse, error_code};
pub use run::{GCAction, GCActionKind, RunQueueItem};
pub use syscall::{
    CrankResults, ReapResults, SYSCALL_METHOD, TerminationRequest, VatDelivery, VatOneResolution,
    VatSyscall, worker_method,
};
