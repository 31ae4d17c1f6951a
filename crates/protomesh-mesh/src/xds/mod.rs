//! Proxy-facing configuration types
//!
//! Native Rust types for the structures the sidecars consume: route tables,
//! meta protocol filters and the names and type URLs they are published under.

pub mod types;

pub use types::*;

/// Type URLs of resources served over the discovery stream
pub mod type_urls {
    /// Meta protocol route configuration, served by the distribution server
    pub const ROUTE_CONFIGURATION: &str =
        "type.googleapis.com/aeraki.meta_protocol_proxy.config.route.v1alpha.RouteConfiguration";
    /// Meta protocol proxy network filter
    pub const META_PROTOCOL_PROXY: &str =
        "type.googleapis.com/aeraki.meta_protocol_proxy.v1alpha.MetaProtocolProxy";
    /// Dubbo proxy network filter
    pub const DUBBO_PROXY: &str =
        "type.googleapis.com/envoy.extensions.filters.network.dubbo_proxy.v3.DubboProxy";
    /// Thrift proxy network filter
    pub const THRIFT_PROXY: &str =
        "type.googleapis.com/envoy.extensions.filters.network.thrift_proxy.v3.ThriftProxy";
}

/// Well-known filter names
pub mod filter_names {
    /// Default network filter the generated proxies replace
    pub const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
    pub const META_PROTOCOL_PROXY: &str = "aeraki.meta_protocol_proxy";
    pub const DUBBO_PROXY: &str = "envoy.filters.network.dubbo_proxy";
    pub const THRIFT_PROXY: &str = "envoy.filters.network.thrift_proxy";
    /// Terminal meta protocol filter
    pub const ROUTER: &str = "aeraki.meta_protocol.filters.router";
    pub const LOCAL_RATE_LIMIT: &str = "aeraki.meta_protocol.filters.local_ratelimit";
    pub const GLOBAL_RATE_LIMIT: &str = "aeraki.meta_protocol.filters.ratelimit";
}

/// Cluster the sidecars reach the control plane through
pub const XDS_CLUSTER: &str = "xds-grpc";
