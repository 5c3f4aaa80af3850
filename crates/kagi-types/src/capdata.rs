//! Serialized capability-carrying values.
//!
//! `CapData` is the marshalled form every payload takes while it crosses the
//! kernel: a JSON `body` plus the list of references the body cites. The body
//! encodes slot citations positionally (`"@0"`, `"@1"`, …) so the kernel can
//! retranslate the slots without parsing the body itself.
//!
//! `CapData` is generic over the slot type: inside the kernel slots are
//! [`KRef`]s, at an endpoint boundary they are [`ERef`]s. Translation between
//! the two is the c-list's job and happens slot-by-slot, leaving the body
//! untouched.

use serde::{Deserialize, Serialize};

use crate::refs::{ERef, KRef};

/// A marshalled value plus the references it cites.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<R = KRef> {
    /// Marshalled JSON encoding of the value.
    pub body: String,
    /// References cited by the body, in citation order.
    #[serde(default = "Vec::new")]
    pub slots: Vec<R>,
}

/// `CapData` as an endpoint sees it (slots are endpoint-local).
pub type VatCapData = CapData<ERef>;

impl<R> CapData<R> {
    pub fn new(body: impl Into<String>, slots: Vec<R>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// A body with no slot citations.
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            slots: Vec::new(),
        }
    }

    /// Replace the slots with their translations, keeping the body.
    pub fn map_slots<T>(self, f: impl FnMut(R) -> T) -> CapData<T> {
        CapData {
            body: self.body,
            slots: self.slots.into_iter().map(f).collect(),
        }
    }

    /// Fallible slot translation; the body is kept on success.
    pub fn try_map_slots<T, E>(self, f: impl FnMut(R) -> Result<T, E>) -> Result<CapData<T>, E> {
        let slots = self.slots.into_iter().map(f).collect::<Result<_, _>>()?;
        Ok(CapData {
            body: self.body,
            slots,
        })
    }
}

impl CapData<KRef> {
    /// Marshal a plain JSON value (no capability citations).
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self::plain(value.to_string())
    }

    /// A single-slot body citing one reference.
    pub fn single(kref: KRef) -> Self {
        Self::new("\"@0\"", vec![kref])
    }
}

/// A queued or in-flight message: arguments plus an optional result promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<R = KRef> {
    /// Method name and arguments, marshalled together.
    pub methargs: CapData<R>,
    /// The promise to resolve with the return value, if the sender wants one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
}

/// A message as an endpoint sees it.
pub type VatMessage = Message<ERef>;

impl<R> Message<R> {
    pub fn new(methargs: CapData<R>, result: Option<R>) -> Self {
        Self { methargs, result }
    }
}

impl Message<KRef> {
    /// Build a `methargs` body for `method(args…)` in the standard encoding:
    /// a two-element array of method name and argument list.
    pub fn call(method: &str, args: Vec<serde_json::Value>, result: Option<KRef>) -> Self {
        let body = serde_json::json!([method, args]).to_string();
        Self {
            methargs: CapData::plain(body),
            result,
        }
    }

    /// Every kref this message holds alive while queued: each slot plus the
    /// result promise.
    pub fn krefs(&self) -> impl Iterator<Item = KRef> + '_ {
        self.methargs.slots.iter().copied().chain(self.result)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::Polarity;

    #[test]
    fn test_capdata_serde_roundtrip() {
        let data = CapData::new("[\"hello\",[\"@0\"]]", vec![KRef::object(3)]);
        let json = serde_json::to_string(&data).unwrap();
        let back: CapData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_capdata_default_slots() {
        let back: CapData = serde_json::from_str("{\"body\":\"null\"}").unwrap();
        assert!(back.slots.is_empty());
    }

    #[test]
    fn test_map_slots_keeps_body() {
        let data = CapData::new("\"@0\"", vec![KRef::promise(1)]);
        let vat: VatCapData = data.map_slots(|_| ERef::promise(Polarity::Minus, 0));
        assert_eq!(vat.body, "\"@0\"");
        assert_eq!(vat.slots, vec![ERef::promise(Polarity::Minus, 0)]);
    }

    #[test]
    fn test_try_map_slots_propagates_error() {
        let data = CapData::new("\"@0\"", vec![KRef::promise(1)]);
        let out: Result<CapData<ERef>, &str> = data.try_map_slots(|_| Err("nope"));
        assert_eq!(out.unwrap_err(), "nope");
    }

    #[test]
    fn test_message_call_encoding() {
        let msg = Message::call(
            "hello",
            vec![serde_json::json!("Alice")],
            Some(KRef::promise(9)),
        );
        assert_eq!(msg.methargs.body, "[\"hello\",[\"Alice\"]]");
        assert_eq!(msg.result, Some(KRef::promise(9)));
    }

    #[test]
    fn test_message_krefs_includes_result() {
        let msg = Message::new(
            CapData::new("\"@0\"", vec![KRef::object(1)]),
            Some(KRef::promise(2)),
        );
        let krefs: Vec<KRef> = msg.krefs().collect();
        assert_eq!(krefs, vec![KRef::object(1), KRef::promise(2)]);
    }

    #[test]
    fn test_message_result_omitted_when_none() {
        let msg: Message = Message::new(CapData::plain("null"), None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("result"));
    }
}
