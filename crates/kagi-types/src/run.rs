//! Run-queue items and garbage-collection actions.
//!
//! Everything the kernel schedules is one of four item shapes, matched in a
//! single place by the run loop. Items are persisted in the durable run
//! queue, so they serialize as tagged JSON.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::capdata::Message;
use crate::ids::{EndpointId, VatId};
use crate::refs::KRef;

/// The kind of a cross-endpoint GC signal.
///
/// Ordering matters: for the same kref, drops are delivered before retires,
/// and exporter-side signals before importer-side ones. The enum order is the
/// service priority.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Display,
    EnumString,
)]
pub enum GCActionKind {
    #[serde(rename = "dropExports")]
    #[strum(serialize = "dropExports")]
    DropExports,
    #[serde(rename = "retireExports")]
    #[strum(serialize = "retireExports")]
    RetireExports,
    #[serde(rename = "retireImports")]
    #[strum(serialize = "retireImports")]
    RetireImports,
}

/// A batched GC signal addressed to one endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCAction {
    pub kind: GCActionKind,
    pub endpoint: EndpointId,
    pub krefs: Vec<KRef>,
}

/// One schedulable unit of kernel work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueItem {
    /// Deliver a message to the owner of `target` (or queue it on the
    /// promise if `target` is unresolved).
    Send { target: KRef, message: Message },
    /// Tell `endpoint` that promise `kpid` settled.
    Notify { endpoint: EndpointId, kpid: KRef },
    /// Deliver a batched drop/retire signal.
    #[serde(rename = "gcAction")]
    GCAction(GCAction),
    /// Schedule a vat's own local GC sweep.
    Reap { vat: VatId },
}

impl RunQueueItem {
    /// Krefs this item holds alive while it sits on the queue, with the
    /// refcount tag each hold was taken under.
    pub fn queue_holds(&self) -> Vec<(KRef, &'static str)> {
        match self {
            RunQueueItem::Send { target, message } => {
                let mut holds = vec![(*target, "queue|target")];
                holds.extend(message.methargs.slots.iter().map(|s| (*s, "queue|slot")));
                if let Some(result) = message.result {
                    holds.push((result, "queue|result"));
                }
                holds
            }
            RunQueueItem::Notify { kpid, .. } => vec![(*kpid, "notify")],
            // GC actions and reaps hold nothing: the krefs they carry are
            // exactly the ones whose counts already fell.
            RunQueueItem::GCAction(_) | RunQueueItem::Reap { .. } => Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capdata::CapData;

    #[test]
    fn test_gc_kind_tokens() {
        assert_eq!(GCActionKind::DropExports.to_string(), "dropExports");
        assert_eq!(
            "retireImports".parse::<GCActionKind>().unwrap(),
            GCActionKind::RetireImports
        );
    }

    #[test]
    fn test_gc_kind_priority_order() {
        assert!(GCActionKind::DropExports < GCActionKind::RetireExports);
        assert!(GCActionKind::RetireExports < GCActionKind::RetireImports);
    }

    #[test]
    fn test_run_item_serde_roundtrip() {
        let items = vec![
            RunQueueItem::Send {
                target: KRef::object(1),
                message: Message::new(
                    CapData::new("[\"poke\",[]]", vec![KRef::promise(4)]),
                    Some(KRef::promise(5)),
                ),
            },
            RunQueueItem::Notify {
                endpoint: EndpointId::Vat(VatId::new(2)),
                kpid: KRef::promise(4),
            },
            RunQueueItem::GCAction(GCAction {
                kind: GCActionKind::DropExports,
                endpoint: EndpointId::Kernel,
                krefs: vec![KRef::object(9)],
            }),
            RunQueueItem::Reap {
                vat: VatId::new(3),
            },
        ];
        for item in items {
            let json = serde_json::to_string(&item).unwrap();
            let back: RunQueueItem = serde_json::from_str(&json).unwrap();
            assert_eq!(back, item, "roundtrip failed for {}", json);
        }
    }

    #[test]
    fn test_send_queue_holds() {
        let item = RunQueueItem::Send {
            target: KRef::promise(1),
            message: Message::new(
                CapData::new("\"@0\"", vec![KRef::object(2)]),
                Some(KRef::promise(3)),
            ),
        };
        assert_eq!(
            item.queue_holds(),
            vec![
                (KRef::promise(1), "queue|target"),
                (KRef::object(2), "queue|slot"),
                (KRef::promise(3), "queue|result"),
            ]
        );
    }

    #[test]
    fn test_notify_queue_holds() {
        let item = RunQueueItem::Notify {
            endpoint: EndpointId::Kernel,
            kpid: KRef::promise(8),
        };
        assert_eq!(item.queue_holds(), vec![(KRef::promise(8), "notify")]);
    }

    #[test]
    fn test_gc_action_holds_nothing() {
        let item = RunQueueItem::Reap {
            vat: VatId::new(0),
        };
        assert!(item.queue_holds().is_empty());
    }
}
