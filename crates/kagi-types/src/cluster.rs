//! Cluster configuration and status reporting.
//!
//! A subcluster is a co-launched group of vats sharing a lifecycle. Its
//! config names the vats, their bundles, and which one is the bootstrap vat
//! (the one handed references to every other vat's root).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::capdata::CapData;
use crate::error::KernelError;
use crate::ids::{SubclusterId, VatId};

/// Configuration for one vat within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatConfig {
    /// Where the vat's user code comes from (URL or path form).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_spec: Option<String>,
    /// A named bundle resolved by the platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,
    /// Opaque parameters handed to the vat at init.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
    /// Deliveries between scheduled reaps; `None` uses the kernel default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<u64>,
}

impl VatConfig {
    /// A config sourcing code from a bundle spec string.
    pub fn from_spec(spec: impl Into<String>) -> Self {
        Self {
            bundle_spec: Some(spec.into()),
            bundle_name: None,
            parameters: serde_json::Value::Null,
            reap_interval: None,
        }
    }

    /// A config sourcing code from a platform-named bundle.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            bundle_spec: None,
            bundle_name: Some(name.into()),
            parameters: serde_json::Value::Null,
            reap_interval: None,
        }
    }

    /// Exactly one bundle source must be present.
    pub fn validate(&self) -> Result<(), KernelError> {
        match (&self.bundle_spec, &self.bundle_name) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(KernelError::Protocol(
                "vat config needs exactly one of bundleSpec or bundleName".into(),
            )),
        }
    }
}

/// Configuration for a subcluster launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name (key into `vats`) of the bootstrap vat.
    pub bootstrap: String,
    /// Vat name → config. Ordered so launch order is deterministic.
    pub vats: BTreeMap<String, VatConfig>,
}

impl ClusterConfig {
    /// The bootstrap name must refer to a configured vat, and every vat
    /// config must be well formed.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !self.vats.contains_key(&self.bootstrap) {
            return Err(KernelError::Protocol(format!(
                "bootstrap vat {:?} is not in the cluster",
                self.bootstrap
            )));
        }
        for config in self.vats.values() {
            config.validate()?;
        }
        Ok(())
    }
}

/// Vat lifecycle. Only `Running` vats receive deliveries.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VatState {
    #[default]
    Launching,
    Running,
    Terminating,
    Terminated,
}

impl VatState {
    pub fn is_live(&self) -> bool {
        matches!(self, VatState::Launching | VatState::Running)
    }
}

/// What `launchSubcluster` hands back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubclusterResult {
    /// The bootstrap call's return value, durably bound to the subcluster.
    pub bootstrap: CapData,
    /// Vat name → allocated id.
    pub vats: BTreeMap<String, VatId>,
}

/// Per-vat line in `getStatus`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VatStatus {
    pub id: VatId,
    pub state: VatState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcluster: Option<SubclusterId>,
}

/// Per-subcluster line in `getStatus`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubclusterStatus {
    pub id: SubclusterId,
    pub bootstrap: String,
    pub vats: BTreeMap<String, VatId>,
}

/// Snapshot of kernel state for the external control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelStatus {
    pub subclusters: Vec<SubclusterStatus>,
    pub vats: Vec<VatStatus>,
    pub run_queue_length: u64,
    pub gc_action_count: u64,
}

// ============================================================================
// Tests
// ============================================================================
