//! Thrift generator

use protomesh_common::Result;
use serde::Serialize;

use crate::patch::Direction;
use crate::xds::{filter_names, type_urls, RouteConfiguration};

use super::{to_value, GeneratorContext};

const THRIFT_ROUTER: &str = "envoy.filters.thrift.router";

/// Replaces the default TCP proxy with the Thrift proxy, routes inlined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThriftGenerator;

impl ThriftGenerator {
    pub const TAG: &'static str = "thrift";

    pub(super) fn proxy_filter(&self, ctx: &GeneratorContext<'_>, direction: Direction) -> Result<serde_json::Value> {
        to_value(&ProxyFilter {
            name: filter_names::THRIFT_PROXY,
            typed_config: ThriftProxy {
                type_url: type_urls::THRIFT_PROXY,
                stat_prefix: ctx.stat_prefix(direction)?,
                transport: "AUTO_TRANSPORT",
                protocol: "AUTO_PROTOCOL",
                route_config: ctx.route_config(direction)?,
                thrift_filters: vec![ThriftFilter { name: THRIFT_ROUTER }],
            },
        })
    }
}

#[derive(Serialize)]
struct ProxyFilter {
    name: &'static str,
    typed_config: ThriftProxy,
}

#[derive(Serialize)]
struct ThriftProxy {
    #[serde(rename = "@type")]
    type_url: &'static str,
    stat_prefix: String,
    transport: &'static str,
    protocol: &'static str,
    route_config: RouteConfiguration,
    thrift_filters: Vec<ThriftFilter>,
}

#[derive(Serialize)]
struct ThriftFilter {
    name: &'static str,
}
