//! Config store
//!
//! Read-mostly cache of mesh resources with list-by-kind and change
//! notification. Components never hold a store lock across an await: handlers
//! run after the write lock is released and only push into bounded queues.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::model::{Config, ConfigKind, Resource, TypedSpec};

/// Capacity of the event queues fed by store handlers
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Kind of change observed on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

/// Change notification delivered to handlers
#[derive(Debug, Clone)]
pub struct ConfigEvent {
    pub kind: ConfigKind,
    pub event: EventKind,
    pub prev: Option<Arc<Config>>,
    pub curr: Option<Arc<Config>>,
}

impl ConfigEvent {
    /// The resource the event is about, current state preferred
    pub fn config(&self) -> Option<&Arc<Config>> {
        self.curr.as_ref().or(self.prev.as_ref())
    }
}

/// Change handler
pub type ChangeHandler = Arc<dyn Fn(&ConfigEvent) + Send + Sync>;

/// Store of mesh resources
pub trait ConfigStore: Send + Sync {
    /// List resources of `kind`, optionally restricted to one namespace
    fn list(&self, kind: ConfigKind, namespace: Option<&str>) -> Vec<Arc<Config>>;

    /// Get one resource
    fn get(&self, kind: ConfigKind, namespace: &str, name: &str) -> Option<Arc<Config>>;

    /// Register a handler for changes to resources of `kind`
    fn on_change(&self, kind: ConfigKind, handler: ChangeHandler);
}

/// List resources of spec type `T`
///
/// Resources stored under the right kind but holding another spec are
/// invariant violations: they are logged and skipped.
pub fn list_typed<T: TypedSpec>(store: &dyn ConfigStore, namespace: Option<&str>) -> Vec<Resource<T>> {
    store
        .list(T::KIND, namespace)
        .iter()
        .filter_map(|config| match config.typed::<T>() {
            Ok(resource) => Some(resource),
            Err(e) => {
                error!(kind = %T::KIND, key = %config.key(), error = %e, "Skipping stored resource");
                None
            }
        })
        .collect()
}

type StoreKey = (ConfigKind, String, String);

/// In-memory config store
///
/// Stands in for the subscription to the mesh configuration plane. Writes
/// assign a new resource version; writes that change nothing are dropped
/// without notifying handlers.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: RwLock<BTreeMap<StoreKey, Arc<Config>>>,
    handlers: RwLock<HashMap<ConfigKind, Vec<ChangeHandler>>>,
    revision: AtomicU64,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a resource
    ///
    /// Returns the kind of change made, or `None` when the stored resource
    /// already had the same labels and spec.
    pub fn apply(&self, mut config: Config) -> Option<EventKind> {
        let kind = config.kind();
        let key = (
            kind,
            config.metadata.namespace.clone(),
            config.metadata.name.clone(),
        );

        let (event, prev, curr) = {
            let mut configs = self.configs.write();
            let prev = configs.get(&key).cloned();

            if let Some(prev) = &prev {
                if prev.spec == config.spec && prev.metadata.labels == config.metadata.labels {
                    return None;
                }
                config.metadata.creation_timestamp = prev.metadata.creation_timestamp;
            }
            config.metadata.resource_version =
                (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string();

            let curr = Arc::new(config);
            configs.insert(key, curr.clone());
            let event = if prev.is_some() {
                EventKind::Update
            } else {
                EventKind::Add
            };
            (event, prev, curr)
        };

        debug!(kind = %kind, key = %curr.key(), event = ?event, "Config stored");
        self.notify(&ConfigEvent {
            kind,
            event,
            prev,
            curr: Some(curr),
        });
        Some(event)
    }

    /// Delete a resource, returning it if it existed
    pub fn delete(&self, kind: ConfigKind, namespace: &str, name: &str) -> Option<Arc<Config>> {
        let removed = self
            .configs
            .write()
            .remove(&(kind, namespace.to_string(), name.to_string()))?;

        debug!(kind = %kind, key = %removed.key(), "Config deleted");
        self.notify(&ConfigEvent {
            kind,
            event: EventKind::Delete,
            prev: Some(removed.clone()),
            curr: None,
        });
        Some(removed)
    }

    /// Number of stored resources
    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }

    fn notify(&self, event: &ConfigEvent) {
        let handlers = self
            .handlers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn list(&self, kind: ConfigKind, namespace: Option<&str>) -> Vec<Arc<Config>> {
        self.configs
            .read()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|n| n == ns))
            .map(|(_, config)| config.clone())
            .collect()
    }

    fn get(&self, kind: ConfigKind, namespace: &str, name: &str) -> Option<Arc<Config>> {
        self.configs
            .read()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn on_change(&self, kind: ConfigKind, handler: ChangeHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }
}
