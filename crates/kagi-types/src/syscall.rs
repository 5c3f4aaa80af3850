//! The vat-worker message protocol: deliveries, syscalls, crank results.
//!
//! The kernel and each worker share one bidirectional JSON-RPC stream. The
//! kernel sends `deliver` requests carrying a [`VatDelivery`]; while the vat
//! processes one it issues [`VatSyscall`] requests back over the same stream,
//! then answers the delivery with [`CrankResults`]. All references crossing
//! this boundary are erefs; translation happens kernel-side.

use serde::{Deserialize, Serialize};

use crate::capdata::{CapData, VatCapData, VatMessage};
use crate::ids::VatId;
use crate::refs::ERef;

/// One resolution as it crosses the vat boundary: `[kpid, rejected, data]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatOneResolution(pub ERef, pub bool, pub VatCapData);

/// A delivery from the kernel into a vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    /// Method invocation on one of this vat's objects (or a promise it
    /// decides, when pipelining reaches it).
    Message { target: ERef, message: VatMessage },
    /// Promises this vat subscribed to have settled.
    Notify { resolutions: Vec<VatOneResolution> },
    /// The kernel no longer holds these exports strongly.
    DropExports { refs: Vec<ERef> },
    /// These exports may be deleted outright.
    RetireExports { refs: Vec<ERef> },
    /// Imports this vat recognized have been deleted by their exporter.
    RetireImports { refs: Vec<ERef> },
}

/// A syscall from a vat to the kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    /// Queue a message to `target`.
    Send {
        target: ERef,
        methargs: VatCapData,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ERef>,
    },
    /// Ask to be notified when a promise settles.
    Subscribe {
        #[serde(rename = "ref")]
        target: ERef,
    },
    /// Settle promises this vat decides.
    Resolve { resolutions: Vec<VatOneResolution> },
    /// Release strong holds on imports.
    DropImports { refs: Vec<ERef> },
    /// Stop recognizing imports (must already be dropped).
    RetireImports { refs: Vec<ERef> },
    /// Abandon exports (kernel retires them at importers).
    RetireExports { refs: Vec<ERef> },
    /// Self-terminate after this crank commits.
    Exit { is_failure: bool, info: VatCapData },
    /// Per-vat private store.
    VatstoreGet { key: String },
    VatstoreSet { key: String, value: String },
    VatstoreDelete { key: String },
}

impl VatSyscall {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
        }
    }
}

/// A vat's request to terminate itself (from the `exit` syscall), recorded
/// kernel-side with its info already translated to krefs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationRequest {
    pub vat: VatId,
    pub failure: bool,
    pub info: CapData,
}

/// What a delivery produced.
///
/// `abort` asks the kernel to roll the crank back; `terminate` is filled in
/// kernel-side when the vat issued `exit` during the crank (it never crosses
/// the wire).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrankResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<String>,
    #[serde(skip)]
    pub terminate: Option<TerminationRequest>,
}

impl CrankResults {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            abort: Some(reason.into()),
            terminate: None,
        }
    }
}

/// Reply to a `bringOutYourDead` reap request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapResults {
    /// Erefs the vat thinks may no longer be referenced locally.
    #[serde(default)]
    pub possibly_dead_set: Vec<ERef>,
}

/// Worker-protocol method names, kernel → worker.
pub mod worker_method {
    pub const INIT_SUPERVISOR: &str = "initSupervisor";
    pub const DELIVER: &str = "deliver";
    pub const BRING_OUT_YOUR_DEAD: &str = "bringOutYourDead";
    pub const TERMINATE: &str = "terminate";
}

/// Worker-protocol method name, worker → kernel.
pub const SYSCALL_METHOD: &str = "syscall";

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::Polarity;

    fn eref(s: &str) -> ERef {
        s.parse().unwrap()
    }

    #[test]
    fn test_resolution_serializes_as_triple() {
        let res = VatOneResolution(eref("p-3"), true, CapData::plain("\"boom\""));
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json[0], "p-3");
        assert_eq!(json[1], true);
        assert_eq!(json[2]["body"], "\"boom\"");
    }

    #[test]
    fn test_syscall_send_wire_shape() {
        let syscall = VatSyscall::Send {
            target: eref("o-1"),
            methargs: CapData::plain("[\"hello\",[]]"),
            result: Some(ERef::promise(Polarity::Plus, 5)),
        };
        let json = serde_json::to_value(&syscall).unwrap();
        assert_eq!(json["type"], "send");
        assert_eq!(json["target"], "o-1");
        assert_eq!(json["result"], "p+5");
    }

    #[test]
    fn test_syscall_subscribe_uses_ref_key() {
        let syscall = VatSyscall::Subscribe {
            target: eref("p-0"),
        };
        let json = serde_json::to_value(&syscall).unwrap();
        assert_eq!(json["ref"], "p-0");
        let back: VatSyscall = serde_json::from_value(json).unwrap();
        assert_eq!(back, syscall);
    }

    #[test]
    fn test_delivery_roundtrip() {
        let deliveries = vec![
            VatDelivery::Message {
                target: eref("o+0"),
                message: VatMessage::new(CapData::plain("[\"poke\",[]]"), None),
            },
            VatDelivery::Notify {
                resolutions: vec![VatOneResolution(
                    eref("p+1"),
                    false,
                    CapData::plain("\"fine\""),
                )],
            },
            VatDelivery::DropExports {
                refs: vec![eref("o+2")],
            },
            VatDelivery::RetireImports {
                refs: vec![eref("o-4")],
            },
        ];
        for delivery in deliveries {
            let json = serde_json::to_string(&delivery).unwrap();
            let back: VatDelivery = serde_json::from_str(&json).unwrap();
            assert_eq!(back, delivery, "roundtrip failed for {}", json);
        }
    }

    #[test]
    fn test_crank_results_terminate_never_serializes() {
        let results = CrankResults {
            abort: None,
            terminate: Some(TerminationRequest {
                vat: VatId::new(1),
                failure: true,
                info: CapData::plain("\"why\""),
            }),
        };
        let json = serde_json::to_string(&results).unwrap();
        assert_eq!(json, "{}");
        let back: CrankResults = serde_json::from_str(&json).unwrap();
        assert!(back.terminate.is_none());
    }

    #[test]
    fn test_syscall_kind_tags() {
        let syscall = VatSyscall::VatstoreSet {
            key: "k".into(),
            value: "v".into(),
        };
        assert_eq!(syscall.kind(), "vatstoreSet");
    }

    #[test]
    fn test_reap_results_default_empty() {
        let back: ReapResults = serde_json::from_str("{}").unwrap();
        assert!(back.possibly_dead_set.is_empty());
    }
}
