//! Protocol generators
//!
//! A generator turns one service port (or one gateway server exposing a
//! service) into named configuration patches for the sidecars. Generators are
//! selected by the protocol tag in the port name and form a closed set; tags
//! without a registered generator are ignored.
//!
//! Each generator only decides what replaces the default proxy filter. The
//! listener selection, workload scoping and patch naming are shared.

mod dubbo;
mod metaprotocol;
mod protocol;
mod thrift;

use std::collections::HashMap;

use protomesh_common::{sanitize_name, MeshError, Result, DEFAULT_ROOT_NAMESPACE};
use serde::Serialize;

use crate::model::{
    DestinationRule, Gateway, GatewayServer, RoutePolicy, ServiceEntry, ServicePort,
};
use crate::patch::{ConfigPatch, Direction, ListenerMatch, NamedPatch, PatchKind, PatchPayload};
use crate::route::{self, RouteInput};
use crate::xds::{filter_names, RouteConfiguration};

pub use dubbo::DubboGenerator;
pub use metaprotocol::MetaProtocolGenerator;
pub use protocol::{PortProtocol, ProtocolRegistry, BUILTIN_PROTOCOLS, CODEC_PREFIX};
pub use thrift::ThriftGenerator;

/// Listener sidecars accept inbound traffic on
pub const INBOUND_LISTENER: &str = "virtualInbound";

/// Mesh-wide defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSettings {
    /// Namespace `*` exports resolve to
    pub root_namespace: String,
    /// Namespace used when nothing is exported
    pub default_namespace: String,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            root_namespace: DEFAULT_ROOT_NAMESPACE.to_string(),
            default_namespace: DEFAULT_ROOT_NAMESPACE.to_string(),
        }
    }
}

/// Gateway server a service is exposed through
#[derive(Debug, Clone, Copy)]
pub struct GatewayBinding<'a> {
    pub gateway: &'a Gateway,
    pub server: &'a GatewayServer,
}

/// Everything a generator may read
#[derive(Debug, Clone, Copy)]
pub struct GeneratorContext<'a> {
    pub service: &'a ServiceEntry,
    /// Port in scope, for gateways the service port behind the server
    pub port: &'a ServicePort,
    pub protocol: &'a PortProtocol,
    pub route_policy: Option<&'a RoutePolicy>,
    pub destination_rule: Option<&'a DestinationRule>,
    pub mesh: &'a MeshSettings,
    pub protocols: &'a ProtocolRegistry,
    /// Set when generating for a gateway instead of sidecars
    pub gateway: Option<GatewayBinding<'a>>,
    /// Filters compiled elsewhere and inserted ahead of the inbound proxy
    pub inbound_filters: &'a [serde_json::Value],
}

impl<'a> GeneratorContext<'a> {
    pub fn host(&self) -> Result<&'a str> {
        self.service
            .spec
            .primary_host()
            .ok_or_else(|| MeshError::invalid(self.service.key(), "service has no hosts"))
    }

    /// Route table for traffic in `direction`
    ///
    /// Inbound traffic always goes to the local workload, so the route
    /// policy only shapes outbound and gateway tables.
    pub fn route_config(&self, direction: Direction) -> Result<RouteConfiguration> {
        let mut input = RouteInput::new(self.service, self.port, direction);
        if direction != Direction::Inbound {
            input = input
                .with_route_policy(self.route_policy)
                .with_destination_rule(self.destination_rule);
        }
        Ok(route::synthesize(&input)?.config)
    }

    /// Stat prefix of the proxy filter, the cluster the direction maps to
    pub fn stat_prefix(&self, direction: Direction) -> Result<String> {
        Ok(route::cluster_name(
            direction,
            self.port.number,
            None,
            self.host()?,
        ))
    }
}

/// Registered protocol generators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    MetaProtocol(MetaProtocolGenerator),
    Dubbo(DubboGenerator),
    Thrift(ThriftGenerator),
}

impl Generator {
    pub fn name(&self) -> &'static str {
        match self {
            Generator::MetaProtocol(_) => MetaProtocolGenerator::TAG,
            Generator::Dubbo(_) => DubboGenerator::TAG,
            Generator::Thrift(_) => ThriftGenerator::TAG,
        }
    }

    /// Generate the patches for one service port or gateway server
    ///
    /// Deterministic and side-effect free.
    pub fn generate(&self, ctx: &GeneratorContext<'_>) -> Result<Vec<NamedPatch>> {
        let host = ctx.host()?;

        if let Some(binding) = ctx.gateway {
            return Ok(vec![self.gateway_patch(ctx, host, binding)?]);
        }

        let mut patches = vec![self.outbound_patch(ctx, host)?];
        if let Some(inbound) = self.inbound_patch(ctx, host)? {
            patches.push(inbound);
        }
        Ok(patches)
    }

    fn proxy_filter(&self, ctx: &GeneratorContext<'_>, direction: Direction) -> Result<serde_json::Value> {
        match self {
            Generator::MetaProtocol(g) => g.proxy_filter(ctx, direction),
            Generator::Dubbo(g) => g.proxy_filter(ctx, direction),
            Generator::Thrift(g) => g.proxy_filter(ctx, direction),
        }
    }

    fn outbound_patch(&self, ctx: &GeneratorContext<'_>, host: &str) -> Result<NamedPatch> {
        let address = ctx.service.spec.primary_address().ok_or_else(|| {
            MeshError::invalid(ctx.service.key(), "service has no address to bind an outbound listener")
        })?;

        let patch = ConfigPatch {
            context: Direction::Outbound,
            operation: PatchKind::Replace,
            listener: ListenerMatch {
                name: Some(format!("{}_{}", address, ctx.port.number)),
                port_number: None,
                filter_name: filter_names::TCP_PROXY.to_string(),
            },
            value: self.proxy_filter(ctx, Direction::Outbound)?,
        };

        Ok(NamedPatch::new(
            patch_name(&["outbound", host, &ctx.port.number.to_string()]),
            PatchPayload {
                workload_selector: None,
                config_patches: vec![patch],
            },
        ))
    }

    /// Inbound patches are scoped to the service's workloads, so a service
    /// without a workload selector gets none.
    fn inbound_patch(&self, ctx: &GeneratorContext<'_>, host: &str) -> Result<Option<NamedPatch>> {
        let Some(selector) = ctx
            .service
            .spec
            .workload_selector
            .as_ref()
            .filter(|s| !s.labels.is_empty())
        else {
            tracing::debug!(service = %ctx.service.key(), port = ctx.port.number, "No workload selector, inbound patch skipped");
            return Ok(None);
        };

        let listener = ListenerMatch {
            name: Some(INBOUND_LISTENER.to_string()),
            port_number: Some(ctx.port.target_port.unwrap_or(ctx.port.number)),
            filter_name: filter_names::TCP_PROXY.to_string(),
        };

        // Insertions are anchored on the default proxy and must precede its replacement.
        let mut config_patches: Vec<ConfigPatch> = ctx
            .inbound_filters
            .iter()
            .map(|filter| ConfigPatch {
                context: Direction::Inbound,
                operation: PatchKind::InsertBefore,
                listener: listener.clone(),
                value: filter.clone(),
            })
            .collect();
        config_patches.push(ConfigPatch {
            context: Direction::Inbound,
            operation: PatchKind::Replace,
            listener,
            value: self.proxy_filter(ctx, Direction::Inbound)?,
        });

        Ok(Some(NamedPatch::new(
            patch_name(&["inbound", host, &ctx.port.number.to_string()]),
            PatchPayload {
                workload_selector: Some(selector.labels.clone()),
                config_patches,
            },
        )))
    }

    fn gateway_patch(
        &self,
        ctx: &GeneratorContext<'_>,
        host: &str,
        binding: GatewayBinding<'_>,
    ) -> Result<NamedPatch> {
        let patch = ConfigPatch {
            context: Direction::Gateway,
            operation: PatchKind::Replace,
            listener: ListenerMatch {
                name: Some(format!("0.0.0.0_{}", binding.server.port.number)),
                port_number: None,
                filter_name: filter_names::TCP_PROXY.to_string(),
            },
            value: self.proxy_filter(ctx, Direction::Gateway)?,
        };

        let selector = &binding.gateway.spec.selector;
        Ok(NamedPatch::new(
            patch_name(&[
                "gateway",
                binding.gateway.name(),
                host,
                &binding.server.port.number.to_string(),
            ]),
            PatchPayload {
                workload_selector: (!selector.is_empty()).then(|| selector.clone()),
                config_patches: vec![patch],
            },
        ))
    }
}

/// Protocol tag to generator map, built once at startup
#[derive(Debug, Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Generator>,
}

impl GeneratorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in generator under its own tag
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for generator in [
            Generator::MetaProtocol(MetaProtocolGenerator),
            Generator::Dubbo(DubboGenerator),
            Generator::Thrift(ThriftGenerator),
        ] {
            registry.register(generator.name(), generator);
        }
        registry
    }

    pub fn register(&mut self, tag: &str, generator: Generator) {
        self.generators.insert(tag.to_ascii_lowercase(), generator);
    }

    pub fn get(&self, tag: &str) -> Option<&Generator> {
        self.generators.get(tag)
    }

    /// Generator for a port name, with the parsed tag
    pub fn for_port(&self, port_name: &str) -> Option<(PortProtocol, &Generator)> {
        let protocol = PortProtocol::parse(port_name)?;
        let generator = self.generators.get(&protocol.protocol)?;
        Some((protocol, generator))
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

fn patch_name(parts: &[&str]) -> String {
    sanitize_name(&format!("protomesh-{}", parts.join("-")))
}

/// Serialize a typed structure into a patch value
pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| MeshError::InvariantViolation(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{GatewaySpec, Resource, ServiceEntrySpec, WorkloadSelector};

    pub(crate) fn dubbo_service() -> ServiceEntry {
        Resource::new(
            "dubbo",
            "demo",
            ServiceEntrySpec {
                hosts: vec!["org.apache.dubbo.demo".to_string()],
                addresses: vec!["240.240.0.1".to_string()],
                ports: vec![ServicePort::new(20880, "tcp-dubbo")],
                workload_selector: Some(WorkloadSelector {
                    labels: BTreeMap::from([("app".to_string(), "demo".to_string())]),
                }),
                ..Default::default()
            },
        )
    }

    pub(crate) fn context<'a>(
        service: &'a ServiceEntry,
        protocol: &'a PortProtocol,
        mesh: &'a MeshSettings,
        protocols: &'a ProtocolRegistry,
    ) -> GeneratorContext<'a> {
        GeneratorContext {
            service,
            port: &service.spec.ports[0],
            protocol,
            route_policy: None,
            destination_rule: None,
            mesh,
            protocols,
            gateway: None,
            inbound_filters: &[],
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = GeneratorRegistry::with_defaults();
        assert_eq!(registry.len(), 3);

        let (tag, generator) = registry.for_port("tcp-dubbo").unwrap();
        assert_eq!(tag.protocol, "dubbo");
        assert_eq!(generator.name(), "dubbo");

        assert!(registry.for_port("tcp-redis").is_none());
        assert!(registry.for_port("http").is_none());
        assert!(GeneratorRegistry::new().for_port("tcp-dubbo").is_none());
    }

    #[test]
    fn test_outbound_and_inbound_patches() {
        let service = dubbo_service();
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let ctx = context(&service, &tag, &mesh, &protocols);

        let patches = Generator::Dubbo(DubboGenerator).generate(&ctx).unwrap();
        assert_eq!(patches.len(), 2);

        let outbound = &patches[0];
        assert_eq!(outbound.name, "protomesh-outbound-org.apache.dubbo.demo-20880");
        assert!(outbound.payload.workload_selector.is_none());
        let patch = &outbound.payload.config_patches[0];
        assert_eq!(patch.operation, PatchKind::Replace);
        assert_eq!(patch.listener.name.as_deref(), Some("240.240.0.1_20880"));

        let inbound = &patches[1];
        assert_eq!(inbound.name, "protomesh-inbound-org.apache.dubbo.demo-20880");
        assert_eq!(
            inbound.payload.workload_selector.as_ref().and_then(|s| s.get("app")).map(String::as_str),
            Some("demo")
        );
        assert_eq!(inbound.payload.config_patches.len(), 1);
        assert_eq!(inbound.payload.config_patches[0].context, Direction::Inbound);
    }

    #[test]
    fn test_context_debug_lists_codecs() {
        let service = dubbo_service();
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let ctx = context(&service, &tag, &mesh, &protocols);

        let rendered = format!("{:?}", ctx);
        assert!(rendered.contains("aeraki.meta_protocol.codec.dubbo"));
    }

    #[test]
    fn test_inbound_filters_inserted_before_proxy() {
        let service = dubbo_service();
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let filters = vec![serde_json::json!({"name": "envoy.filters.network.rbac"})];
        let mut ctx = context(&service, &tag, &mesh, &protocols);
        ctx.inbound_filters = &filters;

        let patches = Generator::Dubbo(DubboGenerator).generate(&ctx).unwrap();
        let inbound = &patches[1].payload.config_patches;

        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].operation, PatchKind::InsertBefore);
        assert_eq!(inbound[0].value, filters[0]);
        assert_eq!(inbound[1].operation, PatchKind::Replace);
    }

    #[test]
    fn test_no_selector_no_inbound() {
        let mut service = dubbo_service();
        service.spec.workload_selector = None;
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let ctx = context(&service, &tag, &mesh, &protocols);

        let patches = Generator::Thrift(ThriftGenerator).generate(&ctx).unwrap();
        assert_eq!(patches.len(), 1);
    }

    #[test]
    fn test_missing_address_is_input_error() {
        let mut service = dubbo_service();
        service.spec.addresses.clear();
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let ctx = context(&service, &tag, &mesh, &protocols);

        let err = Generator::Dubbo(DubboGenerator).generate(&ctx).unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_gateway_patch() {
        let service = dubbo_service();
        let gateway = Resource::new(
            "istio-system",
            "ingress",
            GatewaySpec {
                selector: BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]),
                servers: vec![GatewayServer {
                    port: ServicePort::new(20880, "tcp-dubbo"),
                    hosts: vec!["dubbo/org.apache.dubbo.demo".to_string()],
                }],
            },
        );
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let mut ctx = context(&service, &tag, &mesh, &protocols);
        ctx.gateway = Some(GatewayBinding {
            gateway: &gateway,
            server: &gateway.spec.servers[0],
        });

        let patches = Generator::Dubbo(DubboGenerator).generate(&ctx).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].name, "protomesh-gateway-ingress-org.apache.dubbo.demo-20880");
        let patch = &patches[0].payload.config_patches[0];
        assert_eq!(patch.context, Direction::Gateway);
        assert_eq!(patch.listener.name.as_deref(), Some("0.0.0.0_20880"));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let service = dubbo_service();
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let ctx = context(&service, &tag, &mesh, &protocols);

        let generator = Generator::Dubbo(DubboGenerator);
        assert_eq!(generator.generate(&ctx).unwrap(), generator.generate(&ctx).unwrap());
    }
}
