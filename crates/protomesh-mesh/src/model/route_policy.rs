//! Route policy: ordered routing rules and rate limits for one service host

use std::collections::BTreeMap;

use protomesh_common::{MeshError, Result};
use serde::{Deserialize, Serialize};

/// RoutePolicy specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutePolicySpec {
    /// Service hosts this policy binds to
    pub hosts: Vec<String>,
    /// Routing rules, evaluated in order; `null` entries are skipped
    pub routes: Vec<Option<RouteRule>>,
    /// Namespaces the generated configuration is exported to
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,
    /// Local token-bucket rate limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_rate_limit: Option<LocalRateLimit>,
    /// Global rate limit backed by a rate limit service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_rate_limit: Option<GlobalRateLimit>,
}

impl RoutePolicySpec {
    /// Rules that are present, with their position in the declared list
    pub fn rules(&self) -> impl Iterator<Item = (usize, &RouteRule)> {
        self.routes
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| rule.as_ref().map(|r| (index, r)))
    }

    /// Check the structural constraints a policy must meet to be used
    pub fn validate(&self, key: &str) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(MeshError::invalid(key, "route policy has no hosts"));
        }

        for (index, rule) in self.rules() {
            rule.validate().map_err(|reason| {
                MeshError::invalid(key, format!("route {}: {}", rule.display_name(index), reason))
            })?;
        }

        if let Some(local) = &self.local_rate_limit {
            local
                .validate()
                .map_err(|reason| MeshError::invalid(key, reason))?;
        }
        if let Some(global) = &self.global_rate_limit {
            global
                .validate()
                .map_err(|reason| MeshError::invalid(key, reason))?;
        }

        Ok(())
    }
}

/// One routing rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteRule {
    /// Route name
    pub name: String,
    /// Match conditions; absent means match everything
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub route_match: Option<RouteMatchSpec>,
    /// Weighted destinations
    pub route: Vec<RouteDestination>,
    /// Mirror destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<Destination>,
    /// Share of traffic mirrored, in percent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_percentage: Option<Percent>,
    /// Key/value pairs added to requests
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_mutation: Vec<KeyValue>,
    /// Key/value pairs added to responses
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_mutation: Vec<KeyValue>,
}

impl RouteRule {
    /// Name used in logs; falls back to the rule position
    pub fn display_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("#{}", index)
        } else {
            self.name.clone()
        }
    }

    /// Whether this rule matches every request
    pub fn is_unconditional(&self) -> bool {
        self.route_match
            .as_ref()
            .is_none_or(|m| m.attributes.values().all(StringMatch::is_match_all))
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.route.is_empty() {
            return Err("no destinations".to_string());
        }

        if self.route.len() > 1 {
            let total: u64 = self
                .route
                .iter()
                .map(|d| u64::from(d.weight.unwrap_or(0)))
                .sum();
            if total != 100 {
                return Err(format!("destination weights sum to {}, expected 100", total));
            }
        }

        if let Some(percentage) = &self.mirror_percentage
            && !(percentage.value > 0.0 && percentage.value <= 100.0)
        {
            return Err(format!(
                "mirror percentage {} outside (0, 100]",
                percentage.value
            ));
        }

        Ok(())
    }
}

/// Per-attribute match predicates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatchSpec {
    /// Attribute name to predicate
    #[serde(default)]
    pub attributes: BTreeMap<String, StringMatch>,
}

/// String match predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

impl StringMatch {
    /// Whether the predicate accepts any value
    pub fn is_match_all(&self) -> bool {
        matches!(self, StringMatch::Regex(r) if r == "*" || r == ".*")
    }
}

/// Weighted destination of a rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDestination {
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Traffic destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Destination host
    pub host: String,
    /// Subset name from the destination rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    /// Destination port; defaults to the port being routed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
}

impl Destination {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_subset(mut self, subset: impl Into<String>) -> Self {
        self.subset = Some(subset.into());
        self
    }
}

/// Port selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSelector {
    pub number: u32,
}

/// Percentage value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Percent {
    pub value: f64,
}

/// Key/value pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Token bucket parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucket {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval_ms: u64,
}

/// Local token-bucket rate limit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalRateLimit {
    /// Bucket applied to all requests not covered by a condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucket>,
    /// Buckets applied to matching requests
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RateLimitCondition>,
}

impl LocalRateLimit {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.token_bucket.is_none() && self.conditions.is_empty() {
            return Err("local rate limit needs a token bucket or at least one condition".to_string());
        }
        Ok(())
    }
}

/// Token bucket applied to requests matching a predicate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitCondition {
    #[serde(rename = "match")]
    pub condition_match: RouteMatchSpec,
    pub token_bucket: TokenBucket,
}

/// Global rate limit delegated to a rate limit service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalRateLimit {
    /// Rate limit domain
    pub domain: String,
    /// Cluster of the rate limit service
    pub rate_limit_service: String,
    /// Request properties sent as descriptors
    pub descriptors: Vec<RateLimitDescriptor>,
    /// Only requests matching this predicate are limited
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub limit_match: Option<RouteMatchSpec>,
    /// Timeout of the rate limit service call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Reject requests when the rate limit service is unavailable
    pub deny_on_fail: bool,
}

impl GlobalRateLimit {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.descriptors.is_empty() {
            return Err("global rate limit needs at least one descriptor".to_string());
        }
        Ok(())
    }
}

/// Descriptor built from a request property
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptor {
    pub property: String,
    pub descriptor_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(subset: &str, weight: u32) -> RouteDestination {
        RouteDestination {
            destination: Destination::new("svc.ns").with_subset(subset),
            weight: Some(weight),
        }
    }

    fn policy(rule: RouteRule) -> RoutePolicySpec {
        RoutePolicySpec {
            hosts: vec!["svc.ns".to_string()],
            routes: vec![Some(rule)],
            ..Default::default()
        }
    }

    #[test]
    fn test_deserialize_route_policy() {
        let value = serde_json::json!({
            "hosts": ["svc.ns"],
            "routes": [
                {
                    "name": "v1",
                    "match": {"attributes": {"method": {"exact": "sayHello"}}},
                    "route": [{"destination": {"host": "svc.ns", "subset": "v1"}}],
                    "requestMutation": [{"key": "foo", "value": "bar"}]
                },
                null
            ],
            "exportTo": ["."]
        });

        let spec: RoutePolicySpec = serde_json::from_value(value).unwrap();
        assert_eq!(spec.routes.len(), 2);
        assert_eq!(spec.rules().count(), 1);

        let (_, rule) = spec.rules().next().unwrap();
        assert_eq!(
            rule.route_match.as_ref().unwrap().attributes.get("method"),
            Some(&StringMatch::Exact("sayHello".to_string()))
        );
        assert!(!rule.is_unconditional());
        assert!(spec.validate("ns/p").is_ok());
    }

    #[test]
    fn test_validate_weights() {
        let ok = RouteRule {
            route: vec![weighted("v1", 20), weighted("v2", 80)],
            ..Default::default()
        };
        assert!(policy(ok).validate("ns/p").is_ok());

        let bad = RouteRule {
            route: vec![weighted("v1", 20), weighted("v2", 70)],
            ..Default::default()
        };
        let err = policy(bad).validate("ns/p").unwrap_err();
        assert!(err.is_input_error());
        assert!(err.to_string().contains("sum to 90"));

        let empty = RouteRule::default();
        assert!(policy(empty).validate("ns/p").is_err());
    }

    #[test]
    fn test_validate_mirror_percentage() {
        for (value, valid) in [(0.0, false), (0.5, true), (100.0, true), (100.1, false)] {
            let rule = RouteRule {
                route: vec![RouteDestination {
                    destination: Destination::new("svc.ns"),
                    weight: None,
                }],
                mirror: Some(Destination::new("mirror.ns")),
                mirror_percentage: Some(Percent { value }),
                ..Default::default()
            };
            assert_eq!(policy(rule).validate("ns/p").is_ok(), valid, "value {}", value);
        }
    }

    #[test]
    fn test_validate_rate_limits() {
        let mut spec = RoutePolicySpec {
            hosts: vec!["svc.ns".to_string()],
            local_rate_limit: Some(LocalRateLimit::default()),
            ..Default::default()
        };
        assert!(spec.validate("ns/p").is_err());

        spec.local_rate_limit = Some(LocalRateLimit {
            token_bucket: Some(TokenBucket {
                max_tokens: 10,
                tokens_per_fill: 10,
                fill_interval_ms: 1000,
            }),
            conditions: vec![],
        });
        assert!(spec.validate("ns/p").is_ok());

        spec.global_rate_limit = Some(GlobalRateLimit {
            domain: "production".to_string(),
            ..Default::default()
        });
        assert!(spec.validate("ns/p").is_err());
    }

    #[test]
    fn test_unconditional_rules() {
        let mut rule = RouteRule::default();
        assert!(rule.is_unconditional());

        rule.route_match = Some(RouteMatchSpec {
            attributes: BTreeMap::from([(
                "method".to_string(),
                StringMatch::Regex("*".to_string()),
            )]),
        });
        assert!(rule.is_unconditional());

        rule.route_match = Some(RouteMatchSpec {
            attributes: BTreeMap::from([(
                "method".to_string(),
                StringMatch::Prefix("say".to_string()),
            )]),
        });
        assert!(!rule.is_unconditional());
    }
}
