//! Kernel-global and endpoint-local reference handles.
//!
//! A `KRef` names an entry in the kernel's object or promise table: `ko<n>`
//! for objects, `kp<n>` for promises. An `ERef` is what an endpoint sees in
//! its own c-list: `o+<n>` / `o-<n>` for objects, `p+<n>` / `p-<n>` for
//! promises. Polarity is relative to the endpoint: `+` means the endpoint
//! allocated the index (exported objects, promises it decides), `-` means the
//! kernel minted the index into that endpoint's namespace (imports).
//!
//! Both are plain value types; the c-list is the only place they are ever
//! associated with each other.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdParseError;

/// What a reference designates.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum RefKind {
    Object,
    Promise,
}

/// Which side of an endpoint's namespace an eref index was allocated on.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Polarity {
    /// Allocated by the endpoint itself (`+`).
    Plus,
    /// Minted by the kernel into the endpoint's namespace (`-`).
    Minus,
}

// ── KRef ────────────────────────────────────────────────────────────────────

/// A kernel-global reference: `ko<n>` (object) or `kp<n>` (promise).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct KRef {
    kind: RefKind,
    index: u64,
}

impl KRef {
    pub const fn object(index: u64) -> Self {
        Self {
            kind: RefKind::Object,
            index,
        }
    }

    pub const fn promise(index: u64) -> Self {
        Self {
            kind: RefKind::Promise,
            index,
        }
    }

    pub const fn kind(&self) -> RefKind {
        self.kind
    }

    pub const fn index(&self) -> u64 {
        self.index
    }

    pub const fn is_promise(&self) -> bool {
        matches!(self.kind, RefKind::Promise)
    }

    pub const fn is_object(&self) -> bool {
        matches!(self.kind, RefKind::Object)
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sigil = match self.kind {
            RefKind::Object => "ko",
            RefKind::Promise => "kp",
        };
        write!(f, "{}{}", sigil, self.index)
    }
}

impl fmt::Debug for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KRef({})", self)
    }
}

impl FromStr for KRef {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, digits) = if let Some(rest) = s.strip_prefix("ko") {
            (RefKind::Object, rest)
        } else if let Some(rest) = s.strip_prefix("kp") {
            (RefKind::Promise, rest)
        } else {
            return Err(IdParseError::new("KRef", s));
        };
        let index = digits
            .parse::<u64>()
            .map_err(|_| IdParseError::new("KRef", s))?;
        Ok(Self { kind, index })
    }
}

impl Serialize for KRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── ERef ────────────────────────────────────────────────────────────────────

/// An endpoint-local reference: `o+<n>`, `o-<n>`, `p+<n>`, or `p-<n>`.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ERef {
    kind: RefKind,
    polarity: Polarity,
    index: u64,
}

impl ERef {
    pub const fn new(kind: RefKind, polarity: Polarity, index: u64) -> Self {
        Self {
            kind,
            polarity,
            index,
        }
    }

    pub const fn object(polarity: Polarity, index: u64) -> Self {
        Self::new(RefKind::Object, polarity, index)
    }

    pub const fn promise(polarity: Polarity, index: u64) -> Self {
        Self::new(RefKind::Promise, polarity, index)
    }

    pub const fn kind(&self) -> RefKind {
        self.kind
    }

    pub const fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub const fn index(&self) -> u64 {
        self.index
    }

    pub const fn is_promise(&self) -> bool {
        matches!(self.kind, RefKind::Promise)
    }

    /// Allocated by the endpoint that uses it (`+` polarity).
    pub const fn is_local_allocation(&self) -> bool {
        matches!(self.polarity, Polarity::Plus)
    }
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        };
        let sign = match self.polarity {
            Polarity::Plus => '+',
            Polarity::Minus => '-',
        };
        write!(f, "{}{}{}", kind, sign, self.index)
    }
}

impl fmt::Debug for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERef({})", self)
    }
}

impl FromStr for ERef {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = match chars.next() {
            Some('o') => RefKind::Object,
            Some('p') => RefKind::Promise,
            _ => return Err(IdParseError::new("ERef", s)),
        };
        let polarity = match chars.next() {
            Some('+') => Polarity::Plus,
            Some('-') => Polarity::Minus,
            _ => return Err(IdParseError::new("ERef", s)),
        };
        let index = chars
            .as_str()
            .parse::<u64>()
            .map_err(|_| IdParseError::new("ERef", s))?;
        Ok(Self {
            kind,
            polarity,
            index,
        })
    }
}

impl Serialize for ERef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ERef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kref_display_roundtrip() {
        let ko = KRef::object(42);
        let kp = KRef::promise(7);
        assert_eq!(ko.to_string(), "ko42");
        assert_eq!(kp.to_string(), "kp7");
        assert_eq!("ko42".parse::<KRef>().unwrap(), ko);
        assert_eq!("kp7".parse::<KRef>().unwrap(), kp);
    }

    #[test]
    fn test_kref_parse_rejects_garbage() {
        for s in ["k42", "ko", "kp-1", "kq3", "ko3x", ""] {
            assert!(s.parse::<KRef>().is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn test_kref_kind_predicates() {
        assert!(KRef::promise(0).is_promise());
        assert!(!KRef::promise(0).is_object());
        assert!(KRef::object(0).is_object());
    }

    #[test]
    fn test_eref_display_roundtrip() {
        let cases = [
            (ERef::object(Polarity::Plus, 1), "o+1"),
            (ERef::object(Polarity::Minus, 9), "o-9"),
            (ERef::promise(Polarity::Plus, 0), "p+0"),
            (ERef::promise(Polarity::Minus, 33), "p-33"),
        ];
        for (eref, s) in cases {
            assert_eq!(eref.to_string(), s);
            assert_eq!(s.parse::<ERef>().unwrap(), eref);
        }
    }

    #[test]
    fn test_eref_parse_rejects_garbage() {
        for s in ["o1", "p*3", "x+1", "o+", "o+1.5", ""] {
            assert!(s.parse::<ERef>().is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn test_serde_as_strings() {
        let kref = KRef::promise(5);
        assert_eq!(serde_json::to_string(&kref).unwrap(), "\"kp5\"");
        let eref: ERef = serde_json::from_str("\"o-2\"").unwrap();
        assert_eq!(eref, ERef::object(Polarity::Minus, 2));
    }

    #[test]
    fn test_polarity_accessor() {
        assert!(ERef::object(Polarity::Plus, 3).is_local_allocation());
        assert!(!ERef::object(Polarity::Minus, 3).is_local_allocation());
    }
}
