//! Persisted record shapes for kernel objects and promises.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use kagi_types::{CapData, EndpointId};

/// One entry in the kernel object table (`ko.<n>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelObject {
    /// The exporting endpoint.
    pub owner: EndpointId,
    /// Strong holders anywhere in the kernel: queues, importer c-list
    /// entries, promise data slots, pins.
    pub ref_count: u64,
    /// False once the owner has been told to drop the export.
    pub reachable: bool,
    /// Endpoints that could still recognize this object (have a c-list
    /// entry for it) even after dropping reachability.
    pub recognizable: u64,
}

impl KernelObject {
    pub fn new(owner: EndpointId) -> Self {
        Self {
            owner,
            ref_count: 0,
            reachable: true,
            recognizable: 0,
        }
    }
}

/// Promise settlement state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

/// One entry in the kernel promise table (`kp.<n>`).
///
/// While unresolved there is exactly one decider. Pipelined messages queue
/// under `kp.<n>.q.<i>` between `queue_head` and `queue_tail`. The record
/// survives resolution until its refcount drains so late pipelined
/// references stay valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelPromise {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decider: Option<EndpointId>,
    pub state: PromiseState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<CapData>,
    pub subscribers: BTreeSet<EndpointId>,
    pub queue_head: u64,
    pub queue_tail: u64,
    pub ref_count: u64,
}

impl KernelPromise {
    pub fn new(decider: Option<EndpointId>) -> Self {
        Self {
            decider,
            state: PromiseState::Unresolved,
            value: None,
            subscribers: BTreeSet::new(),
            queue_head: 0,
            queue_tail: 0,
            ref_count: 0,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.state == PromiseState::Unresolved
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kagi_types::VatId;

    #[test]
    fn test_object_record_roundtrip() {
        let record = KernelObject {
            owner: EndpointId::Vat(VatId::new(3)),
            ref_count: 2,
            reachable: true,
            recognizable: 1,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"owner\":\"v3\""));
        let back: KernelObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_promise_record_roundtrip() {
        let mut record = KernelPromise::new(Some(EndpointId::Kernel));
        record.subscribers.insert(EndpointId::Vat(VatId::new(1)));
        record.ref_count = 3;
        let json = serde_json::to_string(&record).unwrap();
        let back: KernelPromise = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(back.is_unresolved());
    }

    #[test]
    fn test_promise_value_omitted_until_resolved() {
        let record = KernelPromise::new(None);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("value"));
        assert!(!json.contains("decider"));
    }
}
