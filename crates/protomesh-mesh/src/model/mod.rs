//! Mesh resource model
//!
//! Resources the engine observes through the config store. They are created
//! and mutated by operators; the engine only reads them, with the single
//! exception of VIP write-back through an [`crate::vip::AddressWriter`].

pub mod destination_rule;
pub mod gateway;
pub mod protocol;
pub mod route_policy;
pub mod service;

use std::collections::BTreeMap;
use std::fmt;

use protomesh_common::{MeshError, Result};
use serde::{Deserialize, Serialize};

pub use destination_rule::{ConsistentHash, DestinationRuleSpec, LoadBalancerSettings, Subset, TrafficPolicy};
pub use gateway::{GatewayServer, GatewaySpec};
pub use protocol::ApplicationProtocolSpec;
pub use route_policy::{
    Destination, GlobalRateLimit, KeyValue, LocalRateLimit, Percent, PortSelector,
    RateLimitCondition, RateLimitDescriptor, RouteDestination, RouteMatchSpec, RoutePolicySpec,
    RouteRule, StringMatch, TokenBucket,
};
pub use service::{ServiceEntrySpec, ServicePort, WorkloadSelector};

/// Kinds of resources held by the config store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigKind {
    /// Service descriptor
    ServiceEntry,
    /// Routing rules bound to one service host
    RoutePolicy,
    /// Load-balancing policy for one host
    DestinationRule,
    /// Gateway listener binding
    Gateway,
    /// Application protocol to codec mapping
    ApplicationProtocol,
}

impl ConfigKind {
    /// All kinds, in a stable order
    pub const ALL: [ConfigKind; 5] = [
        ConfigKind::ServiceEntry,
        ConfigKind::RoutePolicy,
        ConfigKind::DestinationRule,
        ConfigKind::Gateway,
        ConfigKind::ApplicationProtocol,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::ServiceEntry => "ServiceEntry",
            ConfigKind::RoutePolicy => "RoutePolicy",
            ConfigKind::DestinationRule => "DestinationRule",
            ConfigKind::Gateway => "Gateway",
            ConfigKind::ApplicationProtocol => "ApplicationProtocol",
        }
    }

    /// Parse a kind from its resource name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource metadata (Kubernetes-style)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceMetadata {
    /// Resource name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Resource version
    pub resource_version: String,
    /// Creation time in milliseconds since the epoch
    pub creation_timestamp: i64,
}

impl ResourceMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            creation_timestamp: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// `namespace/name` key identifying the resource within its kind
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A typed resource: metadata plus a kind-specific spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource<T> {
    pub metadata: ResourceMetadata,
    pub spec: T,
}

impl<T> Resource<T> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: T) -> Self {
        Self {
            metadata: ResourceMetadata::new(namespace, name),
            spec,
        }
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

pub type ServiceEntry = Resource<ServiceEntrySpec>;
pub type RoutePolicy = Resource<RoutePolicySpec>;
pub type DestinationRule = Resource<DestinationRuleSpec>;
pub type Gateway = Resource<GatewaySpec>;
pub type ApplicationProtocol = Resource<ApplicationProtocolSpec>;

/// Kind-tagged spec of a stored resource
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSpec {
    ServiceEntry(ServiceEntrySpec),
    RoutePolicy(RoutePolicySpec),
    DestinationRule(DestinationRuleSpec),
    Gateway(GatewaySpec),
    ApplicationProtocol(ApplicationProtocolSpec),
}

impl ConfigSpec {
    pub fn kind(&self) -> ConfigKind {
        match self {
            ConfigSpec::ServiceEntry(_) => ConfigKind::ServiceEntry,
            ConfigSpec::RoutePolicy(_) => ConfigKind::RoutePolicy,
            ConfigSpec::DestinationRule(_) => ConfigKind::DestinationRule,
            ConfigSpec::Gateway(_) => ConfigKind::Gateway,
            ConfigSpec::ApplicationProtocol(_) => ConfigKind::ApplicationProtocol,
        }
    }

    /// Decode a spec of the given kind from a loosely typed document
    pub fn from_value(kind: ConfigKind, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            ConfigKind::ServiceEntry => ConfigSpec::ServiceEntry(serde_json::from_value(value)?),
            ConfigKind::RoutePolicy => ConfigSpec::RoutePolicy(serde_json::from_value(value)?),
            ConfigKind::DestinationRule => {
                ConfigSpec::DestinationRule(serde_json::from_value(value)?)
            }
            ConfigKind::Gateway => ConfigSpec::Gateway(serde_json::from_value(value)?),
            ConfigKind::ApplicationProtocol => {
                ConfigSpec::ApplicationProtocol(serde_json::from_value(value)?)
            }
        })
    }
}

/// A resource as held by the config store
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub metadata: ResourceMetadata,
    pub spec: ConfigSpec,
}

impl Config {
    pub fn new(metadata: ResourceMetadata, spec: ConfigSpec) -> Self {
        Self { metadata, spec }
    }

    /// Build a stored resource from a `{kind, metadata, spec}` document
    pub fn from_document(
        kind: &str,
        metadata: ResourceMetadata,
        spec: serde_json::Value,
    ) -> Result<Self> {
        let key = metadata.key();
        let kind = ConfigKind::from_name(kind)
            .ok_or_else(|| MeshError::invalid(&key, format!("unknown kind '{}'", kind)))?;
        let spec = ConfigSpec::from_value(kind, spec)
            .map_err(|e| MeshError::invalid(&key, format!("malformed {} spec: {}", kind, e)))?;
        Ok(Self { metadata, spec })
    }

    pub fn kind(&self) -> ConfigKind {
        self.spec.kind()
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// View this resource as a typed resource of kind `T`
    ///
    /// A mismatch means the store handed back a resource of the wrong kind,
    /// which is reported as an invariant violation.
    pub fn typed<T: TypedSpec>(&self) -> Result<Resource<T>> {
        T::from_config_spec(&self.spec)
            .map(|spec| Resource {
                metadata: self.metadata.clone(),
                spec: spec.clone(),
            })
            .ok_or_else(|| {
                MeshError::InvariantViolation(format!(
                    "{} stored as {} but requested as {}",
                    self.key(),
                    self.kind(),
                    T::KIND
                ))
            })
    }
}

impl<T: TypedSpec> From<Resource<T>> for Config {
    fn from(resource: Resource<T>) -> Self {
        Config {
            metadata: resource.metadata,
            spec: resource.spec.into_config_spec(),
        }
    }
}

/// A spec type with a fixed [`ConfigKind`]
pub trait TypedSpec: Clone {
    const KIND: ConfigKind;

    fn from_config_spec(spec: &ConfigSpec) -> Option<&Self>;

    fn into_config_spec(self) -> ConfigSpec;
}

macro_rules! typed_spec {
    ($spec:ty, $variant:ident) => {
        impl TypedSpec for $spec {
            const KIND: ConfigKind = ConfigKind::$variant;

            fn from_config_spec(spec: &ConfigSpec) -> Option<&Self> {
                match spec {
                    ConfigSpec::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_config_spec(self) -> ConfigSpec {
                ConfigSpec::$variant(self)
            }
        }
    };
}

typed_spec!(ServiceEntrySpec, ServiceEntry);
typed_spec!(RoutePolicySpec, RoutePolicy);
typed_spec!(DestinationRuleSpec, DestinationRule);
typed_spec!(GatewaySpec, Gateway);
typed_spec!(ApplicationProtocolSpec, ApplicationProtocol);

/// Resolve an export scope into concrete namespaces
///
/// `*` maps to the root namespace, `.` to the declaring namespace and an
/// empty scope to the default namespace. The result is sorted and deduplicated.
pub fn resolve_export_namespaces(
    export_to: &[String],
    declaring_namespace: &str,
    root_namespace: &str,
    default_namespace: &str,
) -> Vec<String> {
    if export_to.is_empty() {
        return vec![default_namespace.to_string()];
    }

    let mut namespaces: Vec<String> = export_to
        .iter()
        .map(|scope| match scope.as_str() {
            protomesh_common::EXPORT_ALL => root_namespace.to_string(),
            protomesh_common::EXPORT_SAME_NAMESPACE => declaring_namespace.to_string(),
            other => other.to_string(),
        })
        .collect();
    namespaces.sort();
    namespaces.dedup();
    namespaces
}
