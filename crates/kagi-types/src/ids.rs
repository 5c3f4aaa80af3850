//! Typed identifiers for vats, remotes, and endpoints.
//!
//! Vat and remote ids are monotone counters rendered as short sigil strings
//! (`v3`, `r1`). They are allocated by the kernel store, never minted at
//! random, so equal strings always mean the same entity. `EndpointId` is the
//! union of everything a message can be addressed to: a vat, a remote peer,
//! or the kernel itself (the distinguished `"kernel"` endpoint, which decides
//! kernel-created promises and holds pinned objects).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdParseError;

/// A vat identifier: `v<n>`.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct VatId(u64);

/// A remote-peer identifier: `r<n>`.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RemoteId(u64);

/// A subcluster identifier: `s<n>`.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubclusterId(u64);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_counter_id {
    ($T:ident, $sigil:literal, $name:literal) => {
        impl $T {
            /// Wrap a counter value handed out by the store.
            pub const fn new(index: u64) -> Self {
                Self(index)
            }

            /// The raw counter value.
            pub const fn index(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $sigil, self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}{})", $name, $sigil, self.0)
            }
        }

        impl FromStr for $T {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s
                    .strip_prefix($sigil)
                    .ok_or_else(|| IdParseError::new($name, s))?;
                let index = digits
                    .parse::<u64>()
                    .map_err(|_| IdParseError::new($name, s))?;
                Ok(Self(index))
            }
        }

        impl Serialize for $T {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_counter_id!(VatId, "v", "VatId");
impl_counter_id!(RemoteId, "r", "RemoteId");
impl_counter_id!(SubclusterId, "s", "SubclusterId");

// ── EndpointId ──────────────────────────────────────────────────────────────

/// Anything a message or reference can be scoped to.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum EndpointId {
    /// A local vat.
    Vat(VatId),
    /// A remote peer.
    Remote(RemoteId),
    /// The kernel itself (decider of kernel-created promises).
    Kernel,
}

impl EndpointId {
    /// The vat id, if this endpoint is a vat.
    pub fn as_vat(&self) -> Option<VatId> {
        match self {
            EndpointId::Vat(v) => Some(*v),
            _ => None,
        }
    }

    /// The remote id, if this endpoint is a remote peer.
    pub fn as_remote(&self) -> Option<RemoteId> {
        match self {
            EndpointId::Remote(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self, EndpointId::Kernel)
    }
}

impl From<VatId> for EndpointId {
    fn from(v: VatId) -> Self {
        EndpointId::Vat(v)
    }
}

impl From<RemoteId> for EndpointId {
    fn from(r: RemoteId) -> Self {
        EndpointId::Remote(r)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(v) => v.fmt(f),
            EndpointId::Remote(r) => r.fmt(f),
            EndpointId::Kernel => f.write_str("kernel"),
        }
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self)
    }
}

impl FromStr for EndpointId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "kernel" {
            return Ok(EndpointId::Kernel);
        }
        if s.starts_with('v') {
            return s.parse::<VatId>().map(EndpointId::Vat);
        }
        if s.starts_with('r') {
            return s.parse::<RemoteId>().map(EndpointId::Remote);
        }
        Err(IdParseError::new("EndpointId", s))
    }
}

impl Serialize for EndpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================
