//! Meta protocol generator
//!
//! Replaces the default TCP proxy with the meta protocol proxy. Outbound and
//! gateway proxies fetch their route table from the distribution server;
//! inbound proxies carry a static table routing to the local workload, plus
//! any rate limit filters.

use protomesh_common::{MeshError, Result};
use serde::Serialize;

use crate::patch::Direction;
use crate::ratelimit;
use crate::route::route_config_name;
use crate::xds::{filter_names, type_urls, MetaProtocolFilter, RouteConfiguration};

use super::{to_value, GeneratorContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaProtocolGenerator;

impl MetaProtocolGenerator {
    pub const TAG: &'static str = "metaprotocol";

    pub(super) fn proxy_filter(&self, ctx: &GeneratorContext<'_>, direction: Direction) -> Result<serde_json::Value> {
        let application_protocol = ctx.protocol.suffix.as_deref().ok_or_else(|| {
            MeshError::invalid(
                ctx.service.key(),
                format!("port {} names no application protocol", ctx.port.name),
            )
        })?;
        let codec = ctx.protocols.codec(application_protocol).ok_or_else(|| {
            MeshError::invalid(
                ctx.service.key(),
                format!("unknown application protocol {}", application_protocol),
            )
        })?;

        let stat_prefix = ctx.stat_prefix(direction)?;
        let (route_specifier, filters) = match direction {
            Direction::Inbound => (
                RouteSpecifier::RouteConfig(ctx.route_config(Direction::Inbound)?),
                ratelimit::filter_chain(ctx.route_policy, &stat_prefix)?,
            ),
            Direction::Outbound | Direction::Gateway => (
                RouteSpecifier::Rds(Rds {
                    route_config_name: route_config_name(ctx.host()?, ctx.port.number),
                    config_source: ConfigSource::default(),
                }),
                vec![MetaProtocolFilter::router()],
            ),
        };

        to_value(&ProxyFilter {
            name: filter_names::META_PROTOCOL_PROXY,
            typed_config: MetaProtocolProxy {
                type_url: type_urls::META_PROTOCOL_PROXY,
                stat_prefix,
                application_protocol: application_protocol.to_string(),
                codec: Codec { name: codec },
                route_specifier,
                meta_protocol_filters: filters,
            },
        })
    }
}

#[derive(Serialize)]
struct ProxyFilter {
    name: &'static str,
    typed_config: MetaProtocolProxy,
}

#[derive(Serialize)]
struct MetaProtocolProxy {
    #[serde(rename = "@type")]
    type_url: &'static str,
    stat_prefix: String,
    application_protocol: String,
    codec: Codec,
    #[serde(flatten)]
    route_specifier: RouteSpecifier,
    meta_protocol_filters: Vec<MetaProtocolFilter>,
}

#[derive(Serialize)]
struct Codec {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum RouteSpecifier {
    Rds(Rds),
    RouteConfig(RouteConfiguration),
}

#[derive(Serialize)]
struct Rds {
    route_config_name: String,
    config_source: ConfigSource,
}

/// Fetch over the aggregated discovery stream
#[derive(Serialize, Default)]
struct ConfigSource {
    ads: serde_json::Map<String, serde_json::Value>,
}
