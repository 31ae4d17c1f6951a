//! Point-in-time view of the mesh resources generation reads
//!
//! Built once per cycle from the config store. Route policies and
//! destination rules are indexed by host; invalid route policies are skipped
//! for the cycle and, when several resources claim the same host, the oldest
//! one wins.

use std::collections::HashMap;

use protomesh_common::Result;
use tracing::warn;

use crate::generator::MeshSettings;
use crate::model::{
    resolve_export_namespaces, DestinationRule, DestinationRuleSpec, Gateway, GatewaySpec,
    Resource, RoutePolicy, RoutePolicySpec, ServiceEntry, ServiceEntrySpec,
};
use crate::store::{list_typed, ConfigStore};

/// Resources visible to one generation cycle
#[derive(Debug, Clone, Default)]
pub struct MeshIndex {
    /// Services, ordered by namespace and name
    pub services: Vec<ServiceEntry>,
    /// Gateways, ordered by namespace and name
    pub gateways: Vec<Gateway>,
    route_policies: HashMap<String, RoutePolicy>,
    destination_rules: HashMap<String, DestinationRule>,
}

impl MeshIndex {
    /// Snapshot the store
    pub fn load(store: &dyn ConfigStore) -> Self {
        let services = list_typed::<ServiceEntrySpec>(store, None);
        let gateways = list_typed::<GatewaySpec>(store, None);

        let mut route_policies: HashMap<String, RoutePolicy> = HashMap::new();
        for policy in list_typed::<RoutePolicySpec>(store, None) {
            if let Err(e) = policy.spec.validate(&policy.key()) {
                warn!(policy = %policy.key(), error = %e, "Skipping invalid route policy");
                continue;
            }
            let host = policy.spec.hosts[0].clone();
            if policy.spec.hosts.len() > 1 {
                warn!(policy = %policy.key(), host = %host, "Route policy names several hosts, only the first is bound");
            }
            insert_oldest(&mut route_policies, host, policy, "route policy");
        }

        let mut destination_rules: HashMap<String, DestinationRule> = HashMap::new();
        for rule in list_typed::<DestinationRuleSpec>(store, None) {
            if rule.spec.host.is_empty() {
                warn!(rule = %rule.key(), "Skipping destination rule without host");
                continue;
            }
            let host = rule.spec.host.clone();
            insert_oldest(&mut destination_rules, host, rule, "destination rule");
        }

        Self {
            services,
            gateways,
            route_policies,
            destination_rules,
        }
    }

    pub fn route_policy(&self, host: &str) -> Option<&RoutePolicy> {
        self.route_policies.get(host)
    }

    pub fn destination_rule(&self, host: &str) -> Option<&DestinationRule> {
        self.destination_rules.get(host)
    }

    /// Service whose primary host is `host`
    pub fn service_by_host(&self, host: &str) -> Option<&ServiceEntry> {
        self.services
            .iter()
            .find(|svc| svc.spec.primary_host() == Some(host))
    }

    /// Namespaces the configuration of `service` is exported to
    ///
    /// The route policy bound to the service carries the export scope; a
    /// service without one uses its own.
    pub fn export_namespaces(&self, service: &ServiceEntry, mesh: &MeshSettings) -> Vec<String> {
        let policy = service
            .spec
            .primary_host()
            .and_then(|host| self.route_policy(host));
        let (export_to, declaring_namespace) = match policy {
            Some(policy) => (&policy.spec.export_to, policy.namespace()),
            None => (&service.spec.export_to, service.namespace()),
        };
        resolve_export_namespaces(
            export_to,
            declaring_namespace,
            &mesh.root_namespace,
            &mesh.default_namespace,
        )
    }

    /// Fail if any service has no host
    ///
    /// A service without hosts cannot be keyed or routed, so it invalidates
    /// the whole enumeration rather than a single resource.
    pub fn check_services(&self) -> Result<()> {
        match self.services.iter().find(|svc| svc.spec.hosts.is_empty()) {
            Some(svc) => Err(protomesh_common::MeshError::invalid(
                svc.key(),
                "service has no hosts",
            )),
            None => Ok(()),
        }
    }
}

fn insert_oldest<T>(
    index: &mut HashMap<String, Resource<T>>,
    host: String,
    candidate: Resource<T>,
    what: &str,
) {
    match index.get(&host) {
        Some(current) if is_older(current, &candidate) => {
            warn!(host = %host, kept = %current.key(), ignored = %candidate.key(), "Several {}s bind the same host", what);
        }
        Some(current) => {
            warn!(host = %host, kept = %candidate.key(), ignored = %current.key(), "Several {}s bind the same host", what);
            index.insert(host, candidate);
        }
        None => {
            index.insert(host, candidate);
        }
    }
}

fn is_older<T>(a: &Resource<T>, b: &Resource<T>) -> bool {
    (a.metadata.creation_timestamp, a.key()) <= (b.metadata.creation_timestamp, b.key())
}
