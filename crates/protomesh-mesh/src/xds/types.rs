//! xDS Resource Types
//!
//! Protocol-agnostic route tables and meta protocol filters. Everything here
//! serializes to the JSON shape the sidecars expect inside a patch or a
//! discovery response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Node metadata key carrying the proxy's namespace
pub const NODE_NAMESPACE_KEY: &str = "NAMESPACE";

/// Parts-per-million denominator used for fractional percentages
pub const PPM: u32 = 1_000_000;

/// Node identifier for xDS clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier
    pub id: String,
    /// Cluster the node belongs to
    pub cluster: String,
    /// Metadata for the node
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Namespace the proxy runs in
    ///
    /// Taken from the `NAMESPACE` metadata entry, falling back to the
    /// sidecar id format `type~ip~pod.namespace~domain`.
    pub fn namespace(&self) -> Option<&str> {
        if let Some(ns) = self.metadata.get(NODE_NAMESPACE_KEY)
            && !ns.is_empty()
        {
            return Some(ns.as_str());
        }

        let mut parts = self.id.split('~');
        let pod = parts.nth(2)?;
        pod.split_once('.')
            .map(|(_, ns)| ns)
            .filter(|ns| !ns.is_empty())
    }
}

// =============================================================================
// Route Types
// =============================================================================

/// Route configuration for one service port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    /// Route configuration name
    pub name: String,
    /// Routes, evaluated in order
    pub routes: Vec<Route>,
}

impl RouteConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }
}

/// Route definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Route name
    pub name: String,
    /// Match criteria
    #[serde(rename = "match")]
    pub match_config: RouteMatch,
    /// Route action
    #[serde(rename = "route")]
    pub action: RouteAction,
    /// Key/value pairs added to requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_mutation: Vec<KeyValueMutation>,
    /// Key/value pairs added to responses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_mutation: Vec<KeyValueMutation>,
}

impl Route {
    pub fn new(name: impl Into<String>, match_config: RouteMatch, action: RouteAction) -> Self {
        Self {
            name: name.into(),
            match_config,
            action,
            ..Default::default()
        }
    }
}

/// Route match criteria over request metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatch {
    /// All matchers must accept for the route to match
    #[serde(default)]
    pub metadata: Vec<KeyMatcher>,
}

impl RouteMatch {
    /// Match every request
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_matcher(mut self, name: impl Into<String>, matcher: StringMatcher) -> Self {
        self.metadata.push(KeyMatcher {
            name: name.into(),
            string_match: matcher,
        });
        self
    }

    /// Whether the match accepts every request
    pub fn is_match_all(&self) -> bool {
        self.metadata
            .iter()
            .all(|m| matches!(&m.string_match, StringMatcher::SafeRegex(r) if r == ".*"))
    }
}

/// Matcher on one metadata key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMatcher {
    /// Metadata key
    pub name: String,
    /// Value predicate
    pub string_match: StringMatcher,
}

/// String match type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatcher {
    /// Exact value match
    Exact(String),
    /// Prefix match
    Prefix(String),
    /// Regex match
    SafeRegex(String),
}

/// Route action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAction {
    /// Target cluster(s)
    #[serde(flatten)]
    pub cluster_specifier: ClusterSpecifier,
    /// Request headers hashed for consistent-hash load balancing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_policy: Vec<String>,
    /// Mirror policies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_mirror_policies: Vec<MirrorPolicy>,
}

impl RouteAction {
    /// Route to a single cluster
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            cluster_specifier: ClusterSpecifier::Cluster(name.into()),
            ..Default::default()
        }
    }

    /// Split traffic across clusters; weights are kept verbatim
    pub fn weighted(clusters: Vec<WeightedCluster>) -> Self {
        let total_weight = clusters.iter().map(|c| c.weight).sum();
        Self {
            cluster_specifier: ClusterSpecifier::WeightedClusters(WeightedClusters {
                clusters,
                total_weight,
            }),
            ..Default::default()
        }
    }

    /// Names of every cluster the action can send traffic to
    pub fn cluster_names(&self) -> Vec<&str> {
        match &self.cluster_specifier {
            ClusterSpecifier::Cluster(name) => vec![name.as_str()],
            ClusterSpecifier::WeightedClusters(weighted) => {
                weighted.clusters.iter().map(|c| c.name.as_str()).collect()
            }
        }
    }

    /// Sum of branch weights; a single cluster carries all traffic
    pub fn total_weight(&self) -> u32 {
        match &self.cluster_specifier {
            ClusterSpecifier::Cluster(_) => 100,
            ClusterSpecifier::WeightedClusters(weighted) => weighted.total_weight,
        }
    }
}

/// How a route selects its cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSpecifier {
    /// Single cluster
    Cluster(String),
    /// Weighted clusters
    WeightedClusters(WeightedClusters),
}

impl Default for ClusterSpecifier {
    fn default() -> Self {
        ClusterSpecifier::Cluster(String::new())
    }
}

/// Weighted cluster set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedClusters {
    pub clusters: Vec<WeightedCluster>,
    pub total_weight: u32,
}

/// Weighted cluster for traffic splitting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedCluster {
    /// Cluster name
    pub name: String,
    /// Weight
    pub weight: u32,
}

impl WeightedCluster {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Request mirror policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPolicy {
    /// Cluster receiving the mirrored traffic
    pub cluster: String,
    /// Share of requests mirrored
    pub runtime_fraction: FractionalPercent,
}

/// Fraction expressed in parts per million
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionalPercent {
    pub numerator: u32,
    pub denominator: FractionDenominator,
}

impl FractionalPercent {
    /// Convert a percentage in `[0, 100]` to parts per million
    pub fn from_percent(percent: f64) -> Self {
        let ppm = (percent.clamp(0.0, 100.0) * f64::from(PPM / 100)).round() as u32;
        Self {
            numerator: ppm.min(PPM),
            denominator: FractionDenominator::Million,
        }
    }

    /// The whole population
    pub fn full() -> Self {
        Self {
            numerator: PPM,
            denominator: FractionDenominator::Million,
        }
    }
}

impl Default for FractionalPercent {
    fn default() -> Self {
        Self::full()
    }
}

/// Fraction denominator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FractionDenominator {
    Hundred,
    TenThousand,
    Million,
}

/// Key/value mutation applied to a request or response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueMutation {
    pub key: String,
    pub value: String,
}

// =============================================================================
// Meta Protocol Filter Types
// =============================================================================

/// Filter in a meta protocol filter chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaProtocolFilter {
    /// Filter name
    pub name: String,
    /// Filter configuration
    pub typed_config: FilterConfig,
}

impl MetaProtocolFilter {
    /// Terminal filter dispatching to the routed cluster
    pub fn router() -> Self {
        Self {
            name: super::filter_names::ROUTER.to_string(),
            typed_config: FilterConfig::Router,
        }
    }

    pub fn is_router(&self) -> bool {
        matches!(self.typed_config, FilterConfig::Router)
    }
}

/// Filter configuration, tagged by type URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum FilterConfig {
    #[serde(
        rename = "type.googleapis.com/aeraki.meta_protocol_proxy.filters.local_ratelimit.v1alpha.LocalRateLimit"
    )]
    LocalRateLimit(LocalRateLimitConfig),
    #[serde(
        rename = "type.googleapis.com/aeraki.meta_protocol_proxy.filters.ratelimit.v1alpha.RateLimit"
    )]
    GlobalRateLimit(GlobalRateLimitConfig),
    #[serde(rename = "type.googleapis.com/aeraki.meta_protocol_proxy.filters.router.v1alpha.Router")]
    Router,
}

/// Local token-bucket rate limit filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRateLimitConfig {
    pub stat_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucketConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<LocalRateLimitCondition>,
}

/// Token bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval_ms: u64,
}

/// Token bucket applied to matching requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRateLimitCondition {
    #[serde(rename = "match")]
    pub match_config: RouteMatch,
    pub token_bucket: TokenBucketConfig,
}

/// Global rate limit filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRateLimitConfig {
    pub domain: String,
    pub stat_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "match")]
    pub match_config: Option<RouteMatch>,
    pub descriptors: Vec<RateLimitDescriptorConfig>,
    pub timeout_ms: u64,
    pub failure_mode_deny: bool,
    pub rate_limit_service: GrpcServiceConfig,
}

/// Descriptor entry built from a request property
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDescriptorConfig {
    pub property: String,
    pub descriptor_key: String,
}

/// gRPC service reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcServiceConfig {
    pub cluster_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_namespace() {
        let mut node = Node::new("sidecar~10.1.1.1~provider-v1-7d9f.ns1~ns1.svc.cluster.local");
        assert_eq!(node.namespace(), Some("ns1"));

        node.metadata
            .insert(NODE_NAMESPACE_KEY.to_string(), "ns2".to_string());
        assert_eq!(node.namespace(), Some("ns2"));

        assert_eq!(Node::new("plain-node").namespace(), None);
    }

    #[test]
    fn test_weighted_total() {
        let action = RouteAction::weighted(vec![
            WeightedCluster::new("outbound|8080|v1|svc.ns", 20),
            WeightedCluster::new("outbound|8080|v2|svc.ns", 80),
        ]);
        assert_eq!(action.total_weight(), 100);
        assert_eq!(
            action.cluster_names(),
            vec!["outbound|8080|v1|svc.ns", "outbound|8080|v2|svc.ns"]
        );
    }

    #[test]
    fn test_fractional_percent() {
        assert_eq!(FractionalPercent::from_percent(100.0).numerator, PPM);
        assert_eq!(FractionalPercent::from_percent(0.0001).numerator, 1);
        assert_eq!(FractionalPercent::from_percent(33.3333).numerator, 333_333);
        assert_eq!(FractionalPercent::default(), FractionalPercent::full());
    }

    #[test]
    fn test_route_json_shape() {
        let route = Route::new(
            "v1",
            RouteMatch::any().with_matcher("method", StringMatcher::Exact("sayHello".to_string())),
            RouteAction::cluster("outbound|20880|v1|svc.ns"),
        );

        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["match"]["metadata"][0]["name"], "method");
        assert_eq!(json["match"]["metadata"][0]["string_match"]["exact"], "sayHello");
        assert_eq!(json["route"]["cluster"], "outbound|20880|v1|svc.ns");
    }

    #[test]
    fn test_filter_tagged_by_type_url() {
        let json = serde_json::to_value(MetaProtocolFilter::router()).unwrap();
        assert_eq!(json["name"], "aeraki.meta_protocol.filters.router");
        assert_eq!(
            json["typed_config"]["@type"],
            "type.googleapis.com/aeraki.meta_protocol_proxy.filters.router.v1alpha.Router"
        );
    }
}
