//! Dubbo generator
//!
//! Replaces the default TCP proxy with the Dubbo proxy. Route tables are
//! inlined in the filter for every direction.

use protomesh_common::Result;
use serde::Serialize;

use crate::patch::Direction;
use crate::xds::{filter_names, type_urls, Route};

use super::{to_value, GeneratorContext};

const DUBBO_ROUTER: &str = "envoy.filters.dubbo.router";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DubboGenerator;

impl DubboGenerator {
    pub const TAG: &'static str = "dubbo";

    pub(super) fn proxy_filter(&self, ctx: &GeneratorContext<'_>, direction: Direction) -> Result<serde_json::Value> {
        let routes = ctx.route_config(direction)?;

        to_value(&ProxyFilter {
            name: filter_names::DUBBO_PROXY,
            typed_config: DubboProxy {
                type_url: type_urls::DUBBO_PROXY,
                stat_prefix: ctx.stat_prefix(direction)?,
                protocol_type: "Dubbo",
                serialization_type: "Hessian2",
                route_config: vec![DubboRouteConfig {
                    name: routes.name,
                    interface: ctx.host()?.to_string(),
                    routes: routes.routes,
                }],
                dubbo_filters: vec![DubboFilter { name: DUBBO_ROUTER }],
            },
        })
    }
}

#[derive(Serialize)]
struct ProxyFilter {
    name: &'static str,
    typed_config: DubboProxy,
}

#[derive(Serialize)]
struct DubboProxy {
    #[serde(rename = "@type")]
    type_url: &'static str,
    stat_prefix: String,
    protocol_type: &'static str,
    serialization_type: &'static str,
    route_config: Vec<DubboRouteConfig>,
    dubbo_filters: Vec<DubboFilter>,
}

/// Routes of one Dubbo interface
#[derive(Serialize)]
struct DubboRouteConfig {
    name: String,
    interface: String,
    routes: Vec<Route>,
}

#[derive(Serialize)]
struct DubboFilter {
    name: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::tests::{context, dubbo_service};
    use crate::generator::{MeshSettings, PortProtocol, ProtocolRegistry};
    use crate::model::{Destination, Resource, RouteDestination, RoutePolicySpec, RouteRule};

    #[test]
    fn test_inline_routes_follow_policy() {
        let service = dubbo_service();
        let policy = Resource::new(
            "dubbo",
            "demo",
            RoutePolicySpec {
                hosts: vec!["org.apache.dubbo.demo".to_string()],
                routes: vec![Some(RouteRule {
                    route: vec![
                        RouteDestination {
                            destination: Destination::new("org.apache.dubbo.demo").with_subset("v1"),
                            weight: Some(30),
                        },
                        RouteDestination {
                            destination: Destination::new("org.apache.dubbo.demo").with_subset("v2"),
                            weight: Some(70),
                        },
                    ],
                    ..Default::default()
                })],
                ..Default::default()
            },
        );
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let mut ctx = context(&service, &tag, &mesh, &protocols);
        ctx.route_policy = Some(&policy);

        let value = DubboGenerator.proxy_filter(&ctx, Direction::Outbound).unwrap();
        let config = &value["typed_config"];
        assert_eq!(config["@type"], type_urls::DUBBO_PROXY);
        assert_eq!(config["route_config"][0]["interface"], "org.apache.dubbo.demo");

        let clusters = &config["route_config"][0]["routes"][0]["route"]["weighted_clusters"]["clusters"];
        assert_eq!(clusters[0]["name"], "outbound|20880|v1|org.apache.dubbo.demo");
        assert_eq!(clusters[0]["weight"], 30);
        assert_eq!(clusters[1]["weight"], 70);
        assert_eq!(config["dubbo_filters"][0]["name"], DUBBO_ROUTER);
    }

    #[test]
    fn test_inbound_ignores_policy() {
        let service = dubbo_service();
        let (mesh, protocols) = (MeshSettings::default(), ProtocolRegistry::with_defaults());
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        let ctx = context(&service, &tag, &mesh, &protocols);

        let value = DubboGenerator.proxy_filter(&ctx, Direction::Inbound).unwrap();
        assert_eq!(
            value["typed_config"]["route_config"][0]["routes"][0]["route"]["cluster"],
            "inbound|20880||org.apache.dubbo.demo"
        );
    }
}
