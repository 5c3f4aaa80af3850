//! The kernel error taxonomy.
//!
//! One enum covers the control-plane and crank-time failures; the network
//! layer has its own enum (retryable vs fatal matters there) and converts at
//! the boundary. Control-plane errors serialize to a JSON-RPC error with a
//! structured data payload, never a stack string.

use serde_json::json;
use thiserror::Error;

use crate::ids::{EndpointId, RemoteId, SubclusterId, VatId};
use crate::refs::{ERef, KRef};
use crate::rpc::{RpcError, error_code};

/// Failure to parse a sigil-string identifier.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid {expected}: {input:?}")]
pub struct IdParseError {
    expected: &'static str,
    input: String,
}

impl IdParseError {
    pub fn new(expected: &'static str, input: &str) -> Self {
        Self {
            expected,
            input: input.to_string(),
        }
    }
}

/// Everything the kernel core can fail with.
#[derive(Debug, Error)]
pub enum KernelError {
    // ── NotFound ────────────────────────────────────────────────────────
    #[error("vat not found: {0}")]
    VatNotFound(VatId),
    #[error("remote not found: {0}")]
    RemoteNotFound(RemoteId),
    #[error("subcluster not found: {0}")]
    SubclusterNotFound(SubclusterId),
    #[error("unknown kernel ref: {0}")]
    UnknownKref(KRef),
    #[error("unknown eref {eref} for endpoint {endpoint}")]
    UnknownEref { endpoint: EndpointId, eref: ERef },

    // ── Conflict ────────────────────────────────────────────────────────
    #[error("vat already exists: {0}")]
    VatAlreadyExists(VatId),
    #[error("c-list entry already exists for {endpoint}: {detail}")]
    ClistCollision {
        endpoint: EndpointId,
        detail: String,
    },

    // ── Protocol ────────────────────────────────────────────────────────
    #[error("protocol violation: {0}")]
    Protocol(String),

    // ── Stream I/O ──────────────────────────────────────────────────────
    #[error("stream read failed: {0}")]
    StreamRead(String),
    #[error("stream write failed: {0}")]
    StreamWrite(String),

    // ── Lifecycle ───────────────────────────────────────────────────────
    #[error("vat {vat} is {state}, cannot deliver")]
    VatNotRunning { vat: VatId, state: String },
    #[error("operation aborted")]
    Aborted,

    // ── Invariants ──────────────────────────────────────────────────────
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    // ── Storage ─────────────────────────────────────────────────────────
    #[error("storage failure: {0}")]
    Store(String),

    #[error("id parse: {0}")]
    IdParse(#[from] IdParseError),
}

impl KernelError {
    /// The taxonomy kind, for logs and structured payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::VatNotFound(_)
            | KernelError::RemoteNotFound(_)
            | KernelError::SubclusterNotFound(_)
            | KernelError::UnknownKref(_)
            | KernelError::UnknownEref { .. } => "notFound",
            KernelError::VatAlreadyExists(_) | KernelError::ClistCollision { .. } => "conflict",
            KernelError::Protocol(_) | KernelError::IdParse(_) => "protocol",
            KernelError::StreamRead(_) => "streamRead",
            KernelError::StreamWrite(_) => "streamWrite",
            KernelError::VatNotRunning { .. } => "vatNotRunning",
            KernelError::Aborted => "aborted",
            KernelError::InvariantViolation(_) => "invariantViolation",
            KernelError::Store(_) => "storage",
        }
    }

    /// Control-plane serialization: taxonomy kind plus structured data.
    pub fn to_rpc_error(&self) -> RpcError {
        let code = match self {
            KernelError::VatNotFound(_)
            | KernelError::RemoteNotFound(_)
            | KernelError::SubclusterNotFound(_)
            | KernelError::UnknownKref(_)
            | KernelError::UnknownEref { .. } => error_code::NOT_FOUND,
            KernelError::VatAlreadyExists(_) | KernelError::ClistCollision { .. } => {
                error_code::CONFLICT
            }
            KernelError::Protocol(_) | KernelError::IdParse(_) => error_code::PROTOCOL,
            KernelError::Aborted => error_code::ABORTED,
            _ => error_code::INTERNAL_ERROR,
        };
        RpcError::with_data(code, self.to_string(), json!({ "kind": self.kind() }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(KernelError::VatNotFound(VatId::new(1)).kind(), "notFound");
        assert_eq!(
            KernelError::VatAlreadyExists(VatId::new(1)).kind(),
            "conflict"
        );
        assert_eq!(KernelError::Protocol("x".into()).kind(), "protocol");
        assert_eq!(KernelError::Aborted.kind(), "aborted");
    }

    #[test]
    fn test_rpc_error_has_structured_kind() {
        let err = KernelError::UnknownKref(KRef::object(3)).to_rpc_error();
        assert_eq!(err.code, error_code::NOT_FOUND);
        assert_eq!(err.data.unwrap()["kind"], "notFound");
    }

    #[test]
    fn test_display_names_the_entity() {
        let err = KernelError::VatNotFound(VatId::new(9));
        assert_eq!(err.to_string(), "vat not found: v9");
    }
}
