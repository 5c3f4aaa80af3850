//! JSON-RPC 2.0 envelope shared by the worker streams and the peer wire.
//!
//! Frames are newline-delimited JSON. Both sides of a stream may originate
//! requests, so the codec layer parses into [`RpcMessage`] and dispatches on
//! shape. Ids are numeric and scoped to one direction of one stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Application error codes, alongside the standard JSON-RPC ones.
pub mod error_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Taxonomy kinds carried as structured data on control-plane errors.
    pub const NOT_FOUND: i64 = -31001;
    pub const CONFLICT: i64 = -31002;
    pub const PROTOCOL: i64 = -31003;
    pub const ABORTED: i64 = -31004;
}

/// A request or notification (`id: None`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// A request that expects no reply.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// A response to a request by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Flatten into the usual Result shape.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Any frame read off a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl RpcMessage {
    /// Parse one newline-delimited frame.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Serialize to a single-line frame (no trailing newline).
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("rpc message serialization cannot fail")
    }
}

impl From<RpcRequest> for RpcMessage {
    fn from(request: RpcRequest) -> Self {
        RpcMessage::Request(request)
    }
}

impl From<RpcResponse> for RpcMessage {
    fn from(response: RpcResponse) -> Self {
        RpcMessage::Response(response)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let request = RpcRequest::new(7, "deliver", json!({"item": 1}));
        let frame = RpcMessage::from(request.clone()).to_frame();
        match RpcMessage::parse(&frame).unwrap() {
            RpcMessage::Request(back) => assert_eq!(back, request),
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn test_notification_has_no_id() {
        let frame = RpcMessage::from(RpcRequest::notification("ping", Value::Null)).to_frame();
        assert!(!frame.contains("\"id\""));
        assert!(!frame.contains("params"));
    }

    #[test]
    fn test_response_parses_as_response() {
        let frame = RpcMessage::from(RpcResponse::success(3, json!("ok"))).to_frame();
        match RpcMessage::parse(&frame).unwrap() {
            RpcMessage::Response(back) => {
                assert_eq!(back.into_result().unwrap(), json!("ok"));
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn test_error_response_flattens_to_err() {
        let response = RpcResponse::failure(
            1,
            RpcError::with_data(error_code::NOT_FOUND, "vat not found", json!({"vat": "v9"})),
        );
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, error_code::NOT_FOUND);
        assert_eq!(err.data.unwrap()["vat"], "v9");
    }

    #[test]
    fn test_null_result_response() {
        let response = RpcResponse::success(2, Value::Null);
        let frame = RpcMessage::from(response).to_frame();
        let back = match RpcMessage::parse(&frame).unwrap() {
            RpcMessage::Response(r) => r,
            other => panic!("parsed as {:?}", other),
        };
        assert_eq!(back.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_rejects_non_rpc_json() {
        assert!(RpcMessage::parse("[1,2,3]").is_err());
        assert!(RpcMessage::parse("not json").is_err());
    }
}
