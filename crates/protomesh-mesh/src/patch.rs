//! Generated configuration patches
//!
//! A patch targets one proxy construct (the default network filter of a
//! listener) and either replaces it or inserts filters ahead of it. Patches
//! are identified by namespace and name and compared structurally.

use std::collections::BTreeMap;
use std::fmt;

use protomesh_common::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use serde::{Deserialize, Serialize};

/// Traffic direction a patch applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "SIDECAR_INBOUND")]
    Inbound,
    #[serde(rename = "SIDECAR_OUTBOUND")]
    Outbound,
    #[serde(rename = "GATEWAY")]
    Gateway,
}

impl Direction {
    /// Direction component of a cluster name
    ///
    /// Gateways forward to services the same way an outbound sidecar does.
    pub fn cluster_direction(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound | Direction::Gateway => "outbound",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Gateway => "gateway",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a patch does to the default proxy filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchKind {
    /// Replace the default proxy filter
    Replace,
    /// Insert filters before the default proxy filter
    InsertBefore,
}

/// Selects the listener and filter a patch applies to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerMatch {
    /// Listener name, e.g. `240.240.0.1_20880`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Listener port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_number: Option<u32>,
    /// Filter the patch is anchored on
    pub filter_name: String,
}

/// One patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub context: Direction,
    pub operation: PatchKind,
    pub listener: ListenerMatch,
    /// Filter configuration to apply
    pub value: serde_json::Value,
}

/// Body of a generated object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchPayload {
    /// Workloads the patch is restricted to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<BTreeMap<String, String>>,
    pub config_patches: Vec<ConfigPatch>,
}

/// Patch produced by a generator, not yet bound to a namespace
#[derive(Debug, Clone, PartialEq)]
pub struct NamedPatch {
    pub name: String,
    pub payload: PatchPayload,
}

impl NamedPatch {
    pub fn new(name: impl Into<String>, payload: PatchPayload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Bind the patch to a namespace, labelling it as owned by this control plane
    pub fn bind(&self, namespace: &str) -> GeneratedPatch {
        GeneratedPatch {
            name: self.name.clone(),
            namespace: namespace.to_string(),
            labels: managed_labels(),
            payload: self.payload.clone(),
        }
    }
}

/// Desired object in the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPatch {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub payload: PatchPayload,
}

impl GeneratedPatch {
    pub fn key(&self) -> PatchKey {
        PatchKey::new(&self.namespace, &self.name)
    }
}

/// Object as stored in the backing store
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPatch {
    pub patch: GeneratedPatch,
    /// Opaque token for optimistic concurrency
    pub resource_version: String,
}

/// Identity of a generated object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchKey {
    pub namespace: String,
    pub name: String,
}

impl PatchKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Label selector matching every object this control plane owns
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}
