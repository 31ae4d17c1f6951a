//! Load-balancing policy

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// DestinationRule specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationRuleSpec {
    /// Service host
    pub host: String,
    /// Policy applied to all subsets unless overridden
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<TrafficPolicy>,
    /// Named subsets of the service
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<Subset>,
    /// Export configuration
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,
}

impl DestinationRuleSpec {
    /// Header used for consistent-hash routing to `subset`
    ///
    /// A subset-level header overrides the policy-level one.
    pub fn hash_header(&self, subset: Option<&str>) -> Option<&str> {
        let subset_header = subset
            .and_then(|name| self.subsets.iter().find(|s| s.name == name))
            .and_then(|s| s.traffic_policy.as_ref())
            .and_then(TrafficPolicy::hash_header);

        subset_header.or_else(|| self.traffic_policy.as_ref().and_then(TrafficPolicy::hash_header))
    }
}

/// Traffic policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerSettings>,
}

impl TrafficPolicy {
    fn hash_header(&self) -> Option<&str> {
        self.load_balancer
            .as_ref()
            .and_then(|lb| lb.consistent_hash.as_ref())
            .and_then(|hash| hash.http_header_name.as_deref())
            .filter(|header| !header.is_empty())
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerSettings {
    /// Consistent hash load balancing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistent_hash: Option<ConsistentHash>,
}

/// Consistent hash settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsistentHash {
    /// Hash on this request header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_header_name: Option<String>,
}

/// Subset definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subset {
    /// Subset name
    pub name: String,
    /// Labels selecting the subset endpoints
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Traffic policy overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<TrafficPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashing(header: &str) -> Option<TrafficPolicy> {
        Some(TrafficPolicy {
            load_balancer: Some(LoadBalancerSettings {
                consistent_hash: Some(ConsistentHash {
                    http_header_name: Some(header.to_string()),
                }),
            }),
        })
    }

    #[test]
    fn test_hash_header_precedence() {
        let rule = DestinationRuleSpec {
            host: "svc.ns".to_string(),
            traffic_policy: hashing("x-user"),
            subsets: vec![
                Subset {
                    name: "v1".to_string(),
                    labels: BTreeMap::from([("version".to_string(), "v1".to_string())]),
                    traffic_policy: hashing("x-session"),
                },
                Subset {
                    name: "v2".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(rule.hash_header(None), Some("x-user"));
        assert_eq!(rule.hash_header(Some("v1")), Some("x-session"));
        assert_eq!(rule.hash_header(Some("v2")), Some("x-user"));
        assert_eq!(rule.hash_header(Some("missing")), Some("x-user"));
    }

    #[test]
    fn test_hash_header_absent() {
        let rule: DestinationRuleSpec = serde_json::from_value(serde_json::json!({
            "host": "svc.ns",
            "trafficPolicy": {"loadBalancer": {"consistentHash": {"httpHeaderName": ""}}}
        }))
        .unwrap();
        assert_eq!(rule.hash_header(None), None);
    }
}
