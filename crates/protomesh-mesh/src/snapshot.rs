//! Route snapshot management
//!
//! A snapshot is the full set of route tables one proxy node should hold at a
//! given version. Snapshots are immutable once built and replaced wholesale;
//! the cache hands out shared references.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::xds::RouteConfiguration;

/// Route table published under one name, with the namespaces it is exported to
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedRoute {
    pub config: RouteConfiguration,
    pub namespaces: Vec<String>,
}

/// Route tables computed from the config store, keyed by name
pub type RouteTable = BTreeMap<String, ExportedRoute>;

/// Route tables held by one node at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSnapshot {
    /// Snapshot version
    pub version: String,
    /// Route tables keyed by name
    pub routes: BTreeMap<String, RouteConfiguration>,
    /// Creation timestamp
    pub created_at: i64,
}

impl RouteSnapshot {
    pub fn new(version: impl Into<String>, routes: impl IntoIterator<Item = RouteConfiguration>) -> Self {
        Self {
            version: version.into(),
            routes: routes
                .into_iter()
                .map(|route| (route.name.clone(), route))
                .collect(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Snapshot holding every table
    pub fn from_table(version: impl Into<String>, table: &RouteTable) -> Self {
        Self::new(version, table.values().map(|exported| exported.config.clone()))
    }

    /// Snapshot holding the tables visible from `namespace`
    ///
    /// Tables exported to the root namespace are visible everywhere.
    pub fn for_namespace(
        version: impl Into<String>,
        table: &RouteTable,
        namespace: Option<&str>,
        root_namespace: &str,
    ) -> Self {
        Self::new(
            version,
            table
                .values()
                .filter(|exported| {
                    exported
                        .namespaces
                        .iter()
                        .any(|ns| ns == root_namespace || Some(ns.as_str()) == namespace)
                })
                .map(|exported| exported.config.clone()),
        )
    }

    pub fn get_route(&self, name: &str) -> Option<&RouteConfiguration> {
        self.routes.get(name)
    }

    pub fn route_names(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Snapshot cache keyed by node id
///
/// Holds exactly one snapshot per node. Nodes sharing a scope share the same
/// snapshot allocation.
#[derive(Default)]
pub struct SnapshotCache {
    snapshots: DashMap<String, Arc<RouteSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot of a node
    pub fn set_snapshot(&self, node_id: &str, snapshot: Arc<RouteSnapshot>) {
        debug!(
            node_id = %node_id,
            version = %snapshot.version,
            routes = snapshot.routes.len(),
            "Setting route snapshot for node"
        );
        self.snapshots.insert(node_id.to_string(), snapshot);
    }

    pub fn get_snapshot(&self, node_id: &str) -> Option<Arc<RouteSnapshot>> {
        self.snapshots.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn remove_snapshot(&self, node_id: &str) -> Option<Arc<RouteSnapshot>> {
        self.snapshots.remove(node_id).map(|(_, snapshot)| snapshot)
    }

    pub fn has_snapshot(&self, node_id: &str) -> bool {
        self.snapshots.contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.snapshots.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&self) {
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exported(name: &str, namespaces: &[&str]) -> (String, ExportedRoute) {
        (
            name.to_string(),
            ExportedRoute {
                config: RouteConfiguration::new(name),
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    #[test]
    fn test_namespace_view() {
        let table: RouteTable = [
            exported("a_1", &["ns1"]),
            exported("b_1", &["ns2"]),
            exported("c_1", &["istio-system"]),
        ]
        .into_iter()
        .collect();

        let all = RouteSnapshot::from_table("3", &table);
        assert_eq!(all.route_names(), vec!["a_1", "b_1", "c_1"]);

        let ns1 = RouteSnapshot::for_namespace("3", &table, Some("ns1"), "istio-system");
        assert_eq!(ns1.route_names(), vec!["a_1", "c_1"]);
        assert_eq!(ns1.version, "3");

        let unknown = RouteSnapshot::for_namespace("3", &table, None, "istio-system");
        assert_eq!(unknown.route_names(), vec!["c_1"]);
    }

    #[test]
    fn test_cache_replaces_wholesale() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("node-1", Arc::new(RouteSnapshot::new("1", vec![RouteConfiguration::new("a_1")])));
        cache.set_snapshot("node-1", Arc::new(RouteSnapshot::new("2", vec![RouteConfiguration::new("b_1")])));

        let snapshot = cache.get_snapshot("node-1").unwrap();
        assert_eq!(snapshot.version, "2");
        assert!(snapshot.get_route("a_1").is_none());
        assert_eq!(cache.len(), 1);

        assert!(cache.remove_snapshot("node-1").is_some());
        assert!(!cache.has_snapshot("node-1"));
        assert!(cache.is_empty());
    }
}
