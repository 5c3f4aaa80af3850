//! The peer wire protocol: JSON-RPC frames on each channel.
//!
//! Three methods cross the wire: `remoteDeliver` carries an opaque kernel
//! payload (and may return a reply string), `remoteGiveUp` announces the
//! sender dropped all state about a peer, and `remoteIncarnationChange`
//! invalidates bindings minted under an old incarnation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use kagi_types::{RpcMessage, RpcRequest, RpcResponse, error_code};

use crate::transport::PeerId;

pub const REMOTE_DELIVER: &str = "remoteDeliver";
pub const REMOTE_GIVE_UP: &str = "remoteGiveUp";
pub const REMOTE_INCARNATION_CHANGE: &str = "remoteIncarnationChange";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteDeliverParams {
    pub from: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGiveUpParams {
    pub peer_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIncarnationChangeParams {
    pub peer_id: String,
    pub old_incarnation: u64,
    pub new_incarnation: u64,
}

/// Wrap a kernel payload for the wire.
pub fn deliver_frame(id: u64, from: &PeerId, message: &str) -> String {
    RpcMessage::from(RpcRequest::new(
        id,
        REMOTE_DELIVER,
        json!(RemoteDeliverParams {
            from: from.to_string(),
            message: message.to_string(),
        }),
    ))
    .to_frame()
}

pub fn give_up_frame(from: &PeerId) -> String {
    RpcMessage::from(RpcRequest::notification(
        REMOTE_GIVE_UP,
        json!(RemoteGiveUpParams {
            peer_id: from.to_string(),
        }),
    ))
    .to_frame()
}

pub fn incarnation_change_frame(from: &PeerId, old: u64, new: u64) -> String {
    RpcMessage::from(RpcRequest::notification(
        REMOTE_INCARNATION_CHANGE,
        json!(RemoteIncarnationChangeParams {
            peer_id: from.to_string(),
            old_incarnation: old,
            new_incarnation: new,
        }),
    ))
    .to_frame()
}

/// What the network layer calls back into when frames arrive. Implemented
/// over the kernel handle; tests use recording stubs.
#[async_trait]
pub trait RemoteMessageHandler: Send + Sync {
    /// `remoteDeliver`; `Some` is a reply payload to post back to `from`.
    async fn remote_deliver(&self, from: PeerId, message: String) -> Option<String>;

    async fn remote_give_up(&self, peer: PeerId);

    async fn remote_incarnation_change(&self, peer: PeerId, old: u64, new: u64);
}

/// Dispatch one inbound frame; returns an optional response frame to write
/// back on the same channel.
pub async fn dispatch_frame(
    handler: &dyn RemoteMessageHandler,
    channel_peer: &PeerId,
    line: &str,
) -> Option<String> {
    let message = match RpcMessage::parse(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(peer = %channel_peer, error = %e, "unparseable wire frame");
            return None;
        }
    };
    let request = match message {
        RpcMessage::Request(request) => request,
        RpcMessage::Response(_) => return None, // replies are fire-and-forget
    };
    match request.method.as_str() {
        REMOTE_DELIVER => {
            let params: RemoteDeliverParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => {
                    warn!(peer = %channel_peer, error = %e, "bad remoteDeliver params");
                    return None;
                }
            };
            let reply = handler
                .remote_deliver(PeerId::new(params.from), params.message)
                .await;
            request.id.map(|id| {
                let result = match reply {
                    Some(reply) => serde_json::Value::String(reply),
                    None => serde_json::Value::Null,
                };
                RpcMessage::from(RpcResponse::success(id, result)).to_frame()
            })
        }
        REMOTE_GIVE_UP => {
            if let Ok(params) = serde_json::from_value::<RemoteGiveUpParams>(request.params) {
                handler.remote_give_up(PeerId::new(params.peer_id)).await;
            }
            request
                .id
                .map(|id| RpcMessage::from(RpcResponse::success(id, serde_json::Value::Null)).to_frame())
        }
        REMOTE_INCARNATION_CHANGE => {
            if let Ok(params) =
                serde_json::from_value::<RemoteIncarnationChangeParams>(request.params)
            {
                handler
                    .remote_incarnation_change(
                        PeerId::new(params.peer_id),
                        params.old_incarnation,
                        params.new_incarnation,
                    )
                    .await;
            }
            request
                .id
                .map(|id| RpcMessage::from(RpcResponse::success(id, serde_json::Value::Null)).to_frame())
        }
        other => {
            warn!(peer = %channel_peer, method = other, "unknown wire method");
            request.id.map(|id| {
                RpcMessage::from(RpcResponse::failure(
                    id,
                    kagi_types::RpcError::new(error_code::METHOD_NOT_FOUND, "unknown method"),
                ))
                .to_frame()
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
