//! Backing store for generated objects
//!
//! The reconciler writes generated patches through [`PatchStore`]. Updates
//! carry the resource version last read so concurrent writers are detected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use protomesh_common::{MeshError, Result};

use crate::patch::{AppliedPatch, GeneratedPatch, PatchKey};

/// Store the reconciler applies generated objects to
#[async_trait]
pub trait PatchStore: Send + Sync {
    /// List objects carrying every label in `selector`
    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<AppliedPatch>>;

    /// Create an object; fails if it already exists
    async fn create(&self, patch: &GeneratedPatch) -> Result<AppliedPatch>;

    /// Replace an object, provided it is still at `resource_version`
    async fn update(&self, patch: &GeneratedPatch, resource_version: &str) -> Result<AppliedPatch>;

    /// Delete an object
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Counters of calls issued against a [`MemoryPatchStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: u64,
    pub create: u64,
    pub update: u64,
    pub delete: u64,
}

impl CallCounts {
    /// Calls that change stored state
    pub fn writes(&self) -> u64 {
        self.create + self.update + self.delete
    }
}

/// In-memory patch store
#[derive(Default)]
pub struct MemoryPatchStore {
    objects: DashMap<PatchKey, AppliedPatch>,
    version: AtomicU64,
    list_calls: AtomicU64,
    create_calls: AtomicU64,
    update_calls: AtomicU64,
    delete_calls: AtomicU64,
    failures: AtomicUsize,
}

impl MemoryPatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a backend error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<AppliedPatch> {
        self.objects
            .get(&PatchKey::new(namespace, name))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            list: self.list_calls.load(Ordering::SeqCst),
            create: self.create_calls.load(Ordering::SeqCst),
            update: self.update_calls.load(Ordering::SeqCst),
            delete: self.delete_calls.load(Ordering::SeqCst),
        }
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MeshError::Backend("injected failure".to_string()));
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl PatchStore for MemoryPatchStore {
    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<AppliedPatch>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let mut objects: Vec<AppliedPatch> = self
            .objects
            .iter()
            .filter(|entry| {
                selector
                    .iter()
                    .all(|(k, v)| entry.value().patch.labels.get(k) == Some(v))
            })
            .map(|entry| entry.value().clone())
            .collect();
        objects.sort_by_key(|object| object.patch.key());
        Ok(objects)
    }

    async fn create(&self, patch: &GeneratedPatch) -> Result<AppliedPatch> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let key = patch.key();
        if self.objects.contains_key(&key) {
            return Err(MeshError::Backend(format!("{} already exists", key)));
        }

        let applied = AppliedPatch {
            patch: patch.clone(),
            resource_version: self.next_version(),
        };
        self.objects.insert(key, applied.clone());
        Ok(applied)
    }

    async fn update(&self, patch: &GeneratedPatch, resource_version: &str) -> Result<AppliedPatch> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let key = patch.key();
        let mut entry = self.objects.get_mut(&key).ok_or_else(|| MeshError::NotFound {
            kind: "patch".to_string(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        })?;

        if entry.resource_version != resource_version {
            return Err(MeshError::Conflict {
                namespace: key.namespace,
                name: key.name,
                expected: resource_version.to_string(),
                found: entry.resource_version.clone(),
            });
        }

        *entry = AppliedPatch {
            patch: patch.clone(),
            resource_version: self.next_version(),
        };
        Ok(entry.clone())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        self.objects.remove(&PatchKey::new(namespace, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{NamedPatch, PatchPayload, managed_labels};

    fn patch(namespace: &str, name: &str) -> GeneratedPatch {
        NamedPatch::new(name, PatchPayload::default()).bind(namespace)
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = MemoryPatchStore::new();

        let created = store.create(&patch("ns1", "a")).await.unwrap();
        assert!(store.create(&patch("ns1", "a")).await.is_err());

        let updated = store
            .update(&patch("ns1", "a"), &created.resource_version)
            .await
            .unwrap();
        assert_ne!(updated.resource_version, created.resource_version);

        store.delete("ns1", "a").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.call_counts().writes(), 4);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = MemoryPatchStore::new();
        let created = store.create(&patch("ns1", "a")).await.unwrap();
        store
            .update(&patch("ns1", "a"), &created.resource_version)
            .await
            .unwrap();

        let err = store
            .update(&patch("ns1", "a"), &created.resource_version)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let store = MemoryPatchStore::new();
        store.create(&patch("ns2", "b")).await.unwrap();
        store.create(&patch("ns1", "a")).await.unwrap();

        let mut foreign = patch("ns1", "foreign");
        foreign.labels.clear();
        store.create(&foreign).await.unwrap();

        let listed = store.list(&managed_labels()).await.unwrap();
        let keys: Vec<String> = listed.iter().map(|p| p.patch.key().to_string()).collect();
        assert_eq!(keys, vec!["ns1/a", "ns2/b"]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryPatchStore::new();
        store.fail_next(1);

        let err = store.list(&managed_labels()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.list(&managed_labels()).await.is_ok());
    }
}
