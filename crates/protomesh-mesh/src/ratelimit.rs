//! Rate limit filters
//!
//! Rate limiting is not part of the route table. It is layered as extra meta
//! protocol filters placed ahead of the terminal router filter.

use protomesh_common::{MeshError, Result};

use crate::model::{GlobalRateLimit, LocalRateLimit, RoutePolicy, TokenBucket};
use crate::route::build_match;
use crate::xds::{
    filter_names, FilterConfig, GlobalRateLimitConfig, GrpcServiceConfig, LocalRateLimitCondition,
    LocalRateLimitConfig, MetaProtocolFilter, RateLimitDescriptorConfig, TokenBucketConfig,
};

/// Timeout of a rate limit service call when the policy sets none
pub const DEFAULT_RATE_LIMIT_TIMEOUT_MS: u64 = 20;

/// Build the filter chain for a port: rate limit filters, then the router
///
/// The local filter comes before the global one so locally rejected requests
/// never reach the rate limit service.
pub fn filter_chain(policy: Option<&RoutePolicy>, stat_prefix: &str) -> Result<Vec<MetaProtocolFilter>> {
    let mut filters = Vec::new();

    if let Some(policy) = policy {
        let key = policy.key();
        if let Some(local) = &policy.spec.local_rate_limit {
            let filter = local_filter(local, stat_prefix).map_err(|r| MeshError::invalid(&key, r))?;
            filters.push(filter);
        }
        if let Some(global) = &policy.spec.global_rate_limit {
            let filter = global_filter(global, stat_prefix).map_err(|r| MeshError::invalid(&key, r))?;
            filters.push(filter);
        }
    }

    filters.push(MetaProtocolFilter::router());
    Ok(filters)
}

fn local_filter(limit: &LocalRateLimit, stat_prefix: &str) -> std::result::Result<MetaProtocolFilter, String> {
    limit.validate()?;

    let config = LocalRateLimitConfig {
        stat_prefix: stat_prefix.to_string(),
        token_bucket: limit.token_bucket.as_ref().map(token_bucket),
        conditions: limit
            .conditions
            .iter()
            .map(|condition| LocalRateLimitCondition {
                match_config: build_match(Some(&condition.condition_match)),
                token_bucket: token_bucket(&condition.token_bucket),
            })
            .collect(),
    };

    Ok(MetaProtocolFilter {
        name: filter_names::LOCAL_RATE_LIMIT.to_string(),
        typed_config: FilterConfig::LocalRateLimit(config),
    })
}

fn global_filter(limit: &GlobalRateLimit, stat_prefix: &str) -> std::result::Result<MetaProtocolFilter, String> {
    limit.validate()?;

    let config = GlobalRateLimitConfig {
        domain: limit.domain.clone(),
        stat_prefix: stat_prefix.to_string(),
        match_config: limit.limit_match.as_ref().map(|m| build_match(Some(m))),
        descriptors: limit
            .descriptors
            .iter()
            .map(|d| RateLimitDescriptorConfig {
                property: d.property.clone(),
                descriptor_key: d.descriptor_key.clone(),
            })
            .collect(),
        timeout_ms: limit
            .request_timeout_ms
            .unwrap_or(DEFAULT_RATE_LIMIT_TIMEOUT_MS),
        failure_mode_deny: limit.deny_on_fail,
        rate_limit_service: GrpcServiceConfig {
            cluster_name: limit.rate_limit_service.clone(),
        },
    };

    Ok(MetaProtocolFilter {
        name: filter_names::GLOBAL_RATE_LIMIT.to_string(),
        typed_config: FilterConfig::GlobalRateLimit(config),
    })
}

fn token_bucket(bucket: &TokenBucket) -> TokenBucketConfig {
    TokenBucketConfig {
        max_tokens: bucket.max_tokens,
        tokens_per_fill: bucket.tokens_per_fill,
        fill_interval_ms: bucket.fill_interval_ms,
    }
}
