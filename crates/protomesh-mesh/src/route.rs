//! Route synthesis
//!
//! Translates a service port, its optional route policy and its optional
//! load-balancing policy into a protocol-agnostic route table. The
//! translation is a pure function: the same inputs always yield the same
//! table and the same warnings.

use std::fmt;

use protomesh_common::{MeshError, Result};
use tracing::warn;

use crate::model::{
    Destination, DestinationRule, KeyValue, RouteDestination, RouteMatchSpec, RoutePolicy,
    RouteRule, ServiceEntry, ServicePort, StringMatch,
};
use crate::patch::Direction;
use crate::xds::{
    FractionalPercent, KeyValueMutation, MirrorPolicy, Route, RouteAction, RouteConfiguration,
    RouteMatch, StringMatcher, WeightedCluster,
};

/// Name of the route emitted when no policy rule applies
pub const DEFAULT_ROUTE_NAME: &str = "default";

/// Cluster name for traffic in `direction` to `host:port`, optionally a subset
///
/// # Examples
///
/// ```
/// use protomesh_mesh::patch::Direction;
/// use protomesh_mesh::route::cluster_name;
///
/// assert_eq!(
///     cluster_name(Direction::Outbound, 8080, Some("v1"), "svc.ns"),
///     "outbound|8080|v1|svc.ns"
/// );
/// assert_eq!(cluster_name(Direction::Inbound, 8080, None, "svc.ns"), "inbound|8080||svc.ns");
/// ```
pub fn cluster_name(direction: Direction, port: u32, subset: Option<&str>, host: &str) -> String {
    format!(
        "{}|{}|{}|{}",
        direction.cluster_direction(),
        port,
        subset.unwrap_or_default(),
        host
    )
}

/// Name under which the route table of `host:port` is published
pub fn route_config_name(host: &str, port: u32) -> String {
    format!("{}_{}", host, port)
}

/// Non-fatal findings raised while synthesizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteWarning {
    /// Only the first host of the service is routed
    MultipleHosts { used: String, ignored: Vec<String> },
    /// A `null` entry in the route list was skipped
    NullRoute { index: usize },
    /// An earlier rule matches everything, so this one never applies
    Unreachable {
        index: usize,
        route: String,
        shadowed_by: String,
    },
}

impl fmt::Display for RouteWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteWarning::MultipleHosts { used, ignored } => {
                write!(f, "service declares several hosts, using {} and ignoring {:?}", used, ignored)
            }
            RouteWarning::NullRoute { index } => write!(f, "route #{} is null, skipped", index),
            RouteWarning::Unreachable {
                index,
                route,
                shadowed_by,
            } => write!(
                f,
                "route {} (#{}) is unreachable, {} matches every request",
                route, index, shadowed_by
            ),
        }
    }
}

/// Everything the synthesizer reads
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub service: &'a ServiceEntry,
    pub port: &'a ServicePort,
    pub direction: Direction,
    pub route_policy: Option<&'a RoutePolicy>,
    pub destination_rule: Option<&'a DestinationRule>,
}

impl<'a> RouteInput<'a> {
    pub fn new(service: &'a ServiceEntry, port: &'a ServicePort, direction: Direction) -> Self {
        Self {
            service,
            port,
            direction,
            route_policy: None,
            destination_rule: None,
        }
    }

    pub fn with_route_policy(mut self, policy: Option<&'a RoutePolicy>) -> Self {
        self.route_policy = policy;
        self
    }

    pub fn with_destination_rule(mut self, rule: Option<&'a DestinationRule>) -> Self {
        self.destination_rule = rule;
        self
    }
}

/// Synthesized route table and the warnings raised building it
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedRoutes {
    pub config: RouteConfiguration,
    pub warnings: Vec<RouteWarning>,
}

/// Build the route table for one service port
///
/// Fails with an input error when the service has no host or the route
/// policy violates its weight, mirror or rate-limit constraints.
pub fn synthesize(input: &RouteInput<'_>) -> Result<SynthesizedRoutes> {
    let service_key = input.service.key();
    let hosts = &input.service.spec.hosts;
    let host = hosts
        .first()
        .ok_or_else(|| MeshError::invalid(&service_key, "service has no hosts"))?;

    let mut warnings = Vec::new();
    if hosts.len() > 1 {
        warnings.push(RouteWarning::MultipleHosts {
            used: host.clone(),
            ignored: hosts[1..].to_vec(),
        });
    }

    if let Some(policy) = input.route_policy {
        policy.spec.validate(&policy.key())?;
        warnings.extend(
            policy
                .spec
                .routes
                .iter()
                .enumerate()
                .filter(|(_, rule)| rule.is_none())
                .map(|(index, _)| RouteWarning::NullRoute { index }),
        );
    }

    let rules: Vec<(usize, &RouteRule)> = input
        .route_policy
        .map(|policy| policy.spec.rules().collect())
        .unwrap_or_default();

    let mut config = RouteConfiguration::new(route_config_name(host, input.port.number));
    if rules.is_empty() {
        config.routes.push(default_route(input, host));
    } else {
        let mut catch_all: Option<String> = None;
        for (index, rule) in rules {
            let name = route_name(rule, index);
            if let Some(shadowed_by) = &catch_all {
                warnings.push(RouteWarning::Unreachable {
                    index,
                    route: name.clone(),
                    shadowed_by: shadowed_by.clone(),
                });
            } else if rule.is_unconditional() {
                catch_all = Some(name.clone());
            }
            config.routes.push(build_route(input, host, rule, name));
        }
    }

    for warning in &warnings {
        warn!(service = %service_key, port = input.port.number, "{}", warning);
    }

    Ok(SynthesizedRoutes { config, warnings })
}

fn route_name(rule: &RouteRule, index: usize) -> String {
    if rule.name.is_empty() {
        format!("route-{}", index)
    } else {
        rule.name.clone()
    }
}

fn default_route(input: &RouteInput<'_>, host: &str) -> Route {
    let mut action = RouteAction::cluster(cluster_name(
        input.direction,
        input.port.number,
        None,
        host,
    ));
    if let Some(header) = input
        .destination_rule
        .and_then(|rule| rule.spec.hash_header(None))
    {
        action.hash_policy.push(header.to_string());
    }

    Route::new(DEFAULT_ROUTE_NAME, RouteMatch::any(), action)
}

fn build_route(input: &RouteInput<'_>, host: &str, rule: &RouteRule, name: String) -> Route {
    let mut action = match rule.route.as_slice() {
        [single] => RouteAction::cluster(destination_cluster(input, host, &single.destination)),
        destinations => RouteAction::weighted(
            destinations
                .iter()
                .map(|d| {
                    WeightedCluster::new(
                        destination_cluster(input, host, &d.destination),
                        d.weight.unwrap_or(0),
                    )
                })
                .collect(),
        ),
    };

    action.hash_policy = hash_policy(input, host, &rule.route);

    if let Some(mirror) = &rule.mirror {
        let runtime_fraction = rule
            .mirror_percentage
            .as_ref()
            .map(|p| FractionalPercent::from_percent(p.value))
            .unwrap_or_else(FractionalPercent::full);
        action.request_mirror_policies.push(MirrorPolicy {
            cluster: destination_cluster(input, host, mirror),
            runtime_fraction,
        });
    }

    Route {
        name,
        match_config: build_match(rule.route_match.as_ref()),
        action,
        request_mutation: mutations(&rule.request_mutation),
        response_mutation: mutations(&rule.response_mutation),
    }
}

pub(crate) fn build_match(spec: Option<&RouteMatchSpec>) -> RouteMatch {
    let Some(spec) = spec else {
        return RouteMatch::any();
    };

    spec.attributes
        .iter()
        .fold(RouteMatch::any(), |route_match, (attribute, predicate)| {
            let matcher = match predicate {
                StringMatch::Exact(value) => StringMatcher::Exact(value.clone()),
                StringMatch::Prefix(value) => StringMatcher::Prefix(value.clone()),
                StringMatch::Regex(value) if value == "*" => StringMatcher::SafeRegex(".*".to_string()),
                StringMatch::Regex(value) => StringMatcher::SafeRegex(value.clone()),
            };
            route_match.with_matcher(attribute.clone(), matcher)
        })
}

fn destination_cluster(input: &RouteInput<'_>, host: &str, destination: &Destination) -> String {
    let port = destination
        .port
        .as_ref()
        .map_or(input.port.number, |p| p.number);
    let target = if destination.host.is_empty() {
        host
    } else {
        destination.host.as_str()
    };
    cluster_name(input.direction, port, destination.subset.as_deref(), target)
}

/// Hash headers, one per branch whose subset has one configured
fn hash_policy(input: &RouteInput<'_>, host: &str, destinations: &[RouteDestination]) -> Vec<String> {
    let Some(rule) = input.destination_rule else {
        return Vec::new();
    };

    destinations
        .iter()
        .filter(|d| d.destination.host.is_empty() || d.destination.host == rule.spec.host || d.destination.host == host)
        .filter_map(|d| rule.spec.hash_header(d.destination.subset.as_deref()))
        .map(str::to_string)
        .collect()
}

fn mutations(pairs: &[KeyValue]) -> Vec<KeyValueMutation> {
    pairs
        .iter()
        .map(|kv| KeyValueMutation {
            key: kv.key.clone(),
            value: kv.value.clone(),
        })
        .collect()
}
