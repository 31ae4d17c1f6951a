//! Virtual IP allocation
//!
//! Services without an address get a synthetic one out of `240.240.0.0/16`
//! so protocol-aware listeners have something to match on. The allocator
//! walks a monotonic cursor over the range; the controller feeds it service
//! events and writes the chosen address back to the service.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use protomesh_common::{MeshError, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::{ConfigKind, ServiceEntry, ServiceEntrySpec};
use crate::store::{list_typed, ConfigEvent, ConfigStore, MemoryConfigStore, EVENT_QUEUE_CAPACITY};

const VIP_FIRST_OCTET: u8 = 240;
const VIP_SECOND_OCTET: u8 = 240;

/// Cursor positions in the range; position `c` maps to `240.240.{c/255}.{c%255}`
const MAX_CURSOR: u32 = 255 * 255;

/// Whether `addr` lies in the synthetic range
pub fn is_vip(addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    a == VIP_FIRST_OCTET && b == VIP_SECOND_OCTET
}

fn address_at(cursor: u32) -> Ipv4Addr {
    Ipv4Addr::new(
        VIP_FIRST_OCTET,
        VIP_SECOND_OCTET,
        (cursor / 255) as u8,
        (cursor % 255) as u8,
    )
}

/// What happens once the cursor has walked the whole range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Restart at zero; when every address is held by a live owner, the next
    /// candidate is handed out anyway
    #[default]
    Wrap,
    /// Restart at zero but never hand out a live address; fail instead
    Fail,
}

impl FromStr for ExhaustionPolicy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wrap" => Ok(ExhaustionPolicy::Wrap),
            "fail" => Ok(ExhaustionPolicy::Fail),
            other => Err(MeshError::ConfigError(format!("unknown exhaustion policy '{}'", other))),
        }
    }
}

/// Tells whether the owner of an address still exists
pub trait OwnerLiveness: Send + Sync {
    fn is_live(&self, owner: &str) -> bool;
}

impl<F> OwnerLiveness for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_live(&self, owner: &str) -> bool {
        self(owner)
    }
}

/// Liveness backed by the service entries of a config store
pub struct StoreLiveness {
    store: Arc<dyn ConfigStore>,
}

impl StoreLiveness {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }
}

impl OwnerLiveness for StoreLiveness {
    fn is_live(&self, owner: &str) -> bool {
        owner.split_once('/').is_some_and(|(namespace, name)| {
            self.store
                .get(ConfigKind::ServiceEntry, namespace, name)
                .is_some()
        })
    }
}

/// Result of recording an address observed on a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Outside the synthetic range, not managed
    External,
    /// The key holds the address
    Owned,
    /// The address belonged to a key that no longer exists and now belongs to this one
    Transferred { previous: String },
    /// The address belongs to another live key
    Conflict { owner: String },
}

#[derive(Default)]
struct AllocationTable {
    owners: HashMap<Ipv4Addr, String>,
    addresses: HashMap<String, Ipv4Addr>,
    cursor: u32,
}

impl AllocationTable {
    fn assign(&mut self, key: &str, addr: Ipv4Addr) -> Option<String> {
        if let Some(old) = self.addresses.insert(key.to_string(), addr)
            && old != addr
        {
            self.owners.remove(&old);
        }
        let previous = self.owners.insert(addr, key.to_string());
        if let Some(previous) = &previous
            && previous != key
        {
            self.addresses.remove(previous);
        }
        previous.filter(|previous| previous != key)
    }
}

/// Allocator of synthetic service addresses
pub struct VipAllocator {
    policy: ExhaustionPolicy,
    liveness: Arc<dyn OwnerLiveness>,
    limit: u32,
    table: Mutex<AllocationTable>,
}

impl VipAllocator {
    pub fn new(policy: ExhaustionPolicy, liveness: Arc<dyn OwnerLiveness>) -> Self {
        Self {
            policy,
            liveness,
            limit: MAX_CURSOR,
            table: Mutex::new(AllocationTable::default()),
        }
    }

    /// Shrink the range to cursor positions below `limit`
    pub fn with_cursor_limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(2, MAX_CURSOR);
        self
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    /// Address for `key`
    ///
    /// Returns the key's address when it already holds one. Otherwise the
    /// cursor advances to the next candidate not held by a live owner;
    /// addresses of owners that are gone are reclaimed on the way.
    pub fn allocate(&self, key: &str) -> Result<Ipv4Addr> {
        let mut table = self.table.lock();
        if let Some(addr) = table.addresses.get(key) {
            return Ok(*addr);
        }

        // Each position at most once, plus the wrap back to the start
        let mut fallback = None;
        for _ in 0..=self.limit {
            table.cursor += 1;
            if table.cursor >= self.limit {
                warn!(
                    allocated = table.owners.len(),
                    "Virtual IP range exhausted, cursor restarts at zero"
                );
                table.cursor = 0;
                continue;
            }
            if table.cursor % 255 == 0 {
                continue;
            }

            let candidate = address_at(table.cursor);
            match table.owners.get(&candidate).cloned() {
                None => {}
                Some(owner) if self.liveness.is_live(&owner) => {
                    fallback.get_or_insert(candidate);
                    continue;
                }
                Some(owner) => {
                    debug!(address = %candidate, previous = %owner, "Reclaiming address of a removed owner");
                }
            }

            table.assign(key, candidate);
            counter!("protomesh_vip_allocations_total").increment(1);
            debug!(key = %key, address = %candidate, "Allocated virtual IP");
            return Ok(candidate);
        }

        match (self.policy, fallback) {
            (ExhaustionPolicy::Wrap, Some(candidate)) => {
                let previous = table.assign(key, candidate);
                error!(
                    key = %key,
                    address = %candidate,
                    previous = ?previous,
                    "Every virtual IP is in use, reassigning a live address"
                );
                counter!("protomesh_vip_allocations_total").increment(1);
                Ok(candidate)
            }
            _ => Err(MeshError::Exhausted(format!(
                "no free virtual IP for {}",
                key
            ))),
        }
    }

    /// Record an address already present on the resource named `key`
    pub fn record(&self, key: &str, addr: Ipv4Addr) -> RecordOutcome {
        if !is_vip(addr) {
            return RecordOutcome::External;
        }

        let mut table = self.table.lock();
        match table.owners.get(&addr).cloned() {
            None => {
                table.assign(key, addr);
                RecordOutcome::Owned
            }
            Some(owner) if owner == key => RecordOutcome::Owned,
            Some(owner) if self.liveness.is_live(&owner) => RecordOutcome::Conflict { owner },
            Some(owner) => {
                table.assign(key, addr);
                info!(key = %key, address = %addr, previous = %owner, "Virtual IP ownership transferred");
                RecordOutcome::Transferred { previous: owner }
            }
        }
    }

    /// Give `addr` to `key`, returning the previous owner
    pub fn take_over(&self, key: &str, addr: Ipv4Addr) -> Option<String> {
        self.table.lock().assign(key, addr)
    }

    /// Release the address held by `key`
    pub fn release(&self, key: &str) -> Option<Ipv4Addr> {
        let mut table = self.table.lock();
        let addr = table.addresses.remove(key)?;
        table.owners.remove(&addr);
        debug!(key = %key, address = %addr, "Released virtual IP");
        Some(addr)
    }

    pub fn address_of(&self, key: &str) -> Option<Ipv4Addr> {
        self.table.lock().addresses.get(key).copied()
    }

    pub fn owner_of(&self, addr: Ipv4Addr) -> Option<String> {
        self.table.lock().owners.get(&addr).cloned()
    }

    /// Keys currently holding an address
    pub fn owners(&self) -> Vec<String> {
        self.table.lock().addresses.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().addresses.is_empty()
    }
}

impl fmt::Debug for VipAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VipAllocator")
            .field("policy", &self.policy)
            .field("limit", &self.limit)
            .field("allocated", &self.len())
            .finish()
    }
}

/// Writes an allocated address back to its service
#[async_trait]
pub trait AddressWriter: Send + Sync {
    async fn set_address(&self, namespace: &str, name: &str, addr: Ipv4Addr) -> Result<()>;
}

#[async_trait]
impl AddressWriter for MemoryConfigStore {
    async fn set_address(&self, namespace: &str, name: &str, addr: Ipv4Addr) -> Result<()> {
        let config = self
            .get(ConfigKind::ServiceEntry, namespace, name)
            .ok_or_else(|| MeshError::NotFound {
                kind: ConfigKind::ServiceEntry.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let mut service = config.typed::<ServiceEntrySpec>()?;
        service.spec.addresses = vec![addr.to_string()];
        self.apply(service.into());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceKey {
    namespace: String,
    name: String,
}

impl ServiceKey {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Keeps every service entry addressable
pub struct VipController {
    allocator: Arc<VipAllocator>,
    store: Arc<dyn ConfigStore>,
    writer: Arc<dyn AddressWriter>,
    tx: mpsc::Sender<ServiceKey>,
    rx: Mutex<Option<mpsc::Receiver<ServiceKey>>>,
    resync: Arc<AtomicBool>,
}

impl VipController {
    pub fn new(allocator: Arc<VipAllocator>, store: Arc<dyn ConfigStore>, writer: Arc<dyn AddressWriter>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            allocator,
            store,
            writer,
            tx,
            rx: Mutex::new(Some(rx)),
            resync: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn allocator(&self) -> &Arc<VipAllocator> {
        &self.allocator
    }

    /// Queue service entry events; a full queue falls back to a full resync
    pub fn watch_store(&self) {
        let tx = self.tx.clone();
        let resync = self.resync.clone();
        self.store.on_change(
            ConfigKind::ServiceEntry,
            Arc::new(move |event: &ConfigEvent| {
                let Some(config) = event.config() else {
                    return;
                };
                let key = ServiceKey {
                    namespace: config.metadata.namespace.clone(),
                    name: config.metadata.name.clone(),
                };
                if tx.try_send(key).is_err() {
                    resync.store(true, Ordering::SeqCst);
                }
            }),
        );
    }

    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| MeshError::InvariantViolation("vip controller already started".to_string()))?;

        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.resync_all().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("VIP controller shutting down");
                        break;
                    }
                    key = rx.recv() => {
                        let Some(key) = key else {
                            break;
                        };
                        if let Err(e) = this.sync_service(&key.namespace, &key.name).await {
                            warn!(service = %key.key(), error = %e, "Failed to sync service address");
                        }
                        if this.resync.swap(false, Ordering::SeqCst) {
                            this.resync_all().await;
                        }
                    }
                }
            }
        }))
    }

    /// Sync every service, oldest first, and drop owners that are gone
    pub async fn resync_all(&self) {
        let mut services = list_typed::<ServiceEntrySpec>(self.store.as_ref(), None);
        services.sort_by(|a, b| {
            (a.metadata.creation_timestamp, a.key()).cmp(&(b.metadata.creation_timestamp, b.key()))
        });
        debug!(services = services.len(), "Resyncing virtual IPs");

        for owner in self.allocator.owners() {
            let known = owner
                .split_once('/')
                .is_some_and(|(ns, name)| self.store.get(ConfigKind::ServiceEntry, ns, name).is_some());
            if !known {
                self.allocator.release(&owner);
            }
        }

        for service in services {
            if let Err(e) = self.sync(&service).await {
                warn!(service = %service.key(), error = %e, "Failed to sync service address");
            }
        }
    }

    /// Bring one service's address in line with the allocation table
    pub async fn sync_service(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(config) = self.store.get(ConfigKind::ServiceEntry, namespace, name) else {
            let key = format!("{}/{}", namespace, name);
            if let Some(addr) = self.allocator.release(&key) {
                info!(service = %key, address = %addr, "Service removed, virtual IP released");
            }
            return Ok(());
        };
        let service = config.typed::<ServiceEntrySpec>()?;
        self.sync(&service).await
    }

    async fn sync(&self, service: &ServiceEntry) -> Result<()> {
        let key = service.key();
        let Some(current) = service.spec.primary_address() else {
            let addr = self.allocator.allocate(&key)?;
            info!(service = %key, address = %addr, "Assigning virtual IP");
            return self.write(service.namespace(), service.name(), addr).await;
        };

        let Ok(addr) = current.parse::<Ipv4Addr>() else {
            debug!(service = %key, address = %current, "Address not managed");
            return Ok(());
        };

        match self.allocator.record(&key, addr) {
            RecordOutcome::External | RecordOutcome::Owned | RecordOutcome::Transferred { .. } => Ok(()),
            RecordOutcome::Conflict { owner } => self.resolve_conflict(service, addr, owner).await,
        }
    }

    /// The newer of the two services moves to a fresh address
    async fn resolve_conflict(&self, service: &ServiceEntry, addr: Ipv4Addr, owner: String) -> Result<()> {
        let key = service.key();
        let owner_service = owner.split_once('/').and_then(|(ns, name)| {
            self.store
                .get(ConfigKind::ServiceEntry, ns, name)
                .and_then(|config| config.typed::<ServiceEntrySpec>().ok())
        });

        let service_is_newer = owner_service.as_ref().is_none_or(|other| {
            (service.metadata.creation_timestamp, &key) > (other.metadata.creation_timestamp, &owner)
        });

        if service_is_newer {
            let fresh = self.allocator.allocate(&key)?;
            warn!(service = %key, owner = %owner, address = %addr, fresh = %fresh, "Virtual IP conflict, moving service");
            return self.write(service.namespace(), service.name(), fresh).await;
        }

        // The owner is the newer one: it moves and this service keeps the address.
        self.allocator.take_over(&key, addr);
        let Some(other) = owner_service else {
            return Ok(());
        };
        let fresh = self.allocator.allocate(&owner)?;
        warn!(service = %owner, owner = %key, address = %addr, fresh = %fresh, "Virtual IP conflict, moving service");
        self.write(other.namespace(), other.name(), fresh).await
    }

    async fn write(&self, namespace: &str, name: &str, addr: Ipv4Addr) -> Result<()> {
        self.writer.set_address(namespace, name, addr).await.inspect_err(|e| {
            error!(namespace = %namespace, name = %name, address = %addr, error = %e, "Failed to write virtual IP");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::model::{Resource, ServicePort};

    fn always_live() -> Arc<dyn OwnerLiveness> {
        Arc::new(|_: &str| true)
    }

    fn allocator(policy: ExhaustionPolicy) -> VipAllocator {
        VipAllocator::new(policy, always_live())
    }

    #[test]
    fn test_sequence_skips_boundary() {
        let allocator = allocator(ExhaustionPolicy::Wrap);
        assert_eq!(allocator.allocate("ns/a0").unwrap(), Ipv4Addr::new(240, 240, 0, 1));

        let addrs: Vec<_> = (1..255)
            .map(|i| allocator.allocate(&format!("ns/a{}", i)).unwrap())
            .collect();
        assert_eq!(addrs[252], Ipv4Addr::new(240, 240, 0, 254));
        assert_eq!(addrs[253], Ipv4Addr::new(240, 240, 1, 1));
    }

    #[test]
    fn test_allocate_is_stable_per_key() {
        let allocator = allocator(ExhaustionPolicy::Wrap);
        let first = allocator.allocate("ns/a").unwrap();
        allocator.allocate("ns/b").unwrap();
        assert_eq!(allocator.allocate("ns/a").unwrap(), first);
        assert_eq!(allocator.len(), 2);
    }

    #[test]
    fn test_reclaims_address_of_removed_owner() {
        let gone: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let view = gone.clone();
        let allocator = VipAllocator::new(
            ExhaustionPolicy::Fail,
            Arc::new(move |owner: &str| !view.lock().contains(owner)),
        )
        .with_cursor_limit(5);

        let first = allocator.allocate("ns/k1").unwrap();
        for i in 2..=4 {
            allocator.allocate(&format!("ns/k{}", i)).unwrap();
        }
        assert!(allocator.allocate("ns/k5").unwrap_err().to_string().contains("no free virtual IP"));

        gone.lock().insert("ns/k1".to_string());
        assert_eq!(allocator.allocate("ns/k5").unwrap(), first);
        assert_eq!(allocator.owner_of(first).as_deref(), Some("ns/k5"));
        assert_eq!(allocator.address_of("ns/k1"), None);
    }

    #[test]
    fn test_released_address_reused_after_wrap() {
        let allocator = allocator(ExhaustionPolicy::Wrap).with_cursor_limit(4);
        let first = allocator.allocate("ns/a").unwrap();
        allocator.allocate("ns/b").unwrap();
        allocator.allocate("ns/c").unwrap();

        assert_eq!(allocator.release("ns/a"), Some(first));
        assert_eq!(allocator.allocate("ns/d").unwrap(), first);
    }

    #[test]
    fn test_wrap_policy_reuses_live_address_when_full() {
        let allocator = allocator(ExhaustionPolicy::Wrap).with_cursor_limit(3);
        allocator.allocate("ns/a").unwrap();
        allocator.allocate("ns/b").unwrap();

        let addr = allocator.allocate("ns/c").unwrap();
        assert_eq!(allocator.owner_of(addr).as_deref(), Some("ns/c"));
        assert_eq!(allocator.len(), 2);
    }

    #[test]
    fn test_record_outcomes() {
        let gone: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let view = gone.clone();
        let allocator = VipAllocator::new(
            ExhaustionPolicy::Wrap,
            Arc::new(move |owner: &str| !view.lock().contains(owner)),
        );
        let addr = Ipv4Addr::new(240, 240, 3, 7);

        assert_eq!(allocator.record("ns/a", Ipv4Addr::new(10, 0, 0, 1)), RecordOutcome::External);
        assert_eq!(allocator.record("ns/a", addr), RecordOutcome::Owned);
        assert_eq!(allocator.record("ns/a", addr), RecordOutcome::Owned);
        assert_eq!(
            allocator.record("ns/b", addr),
            RecordOutcome::Conflict {
                owner: "ns/a".to_string()
            }
        );

        gone.lock().insert("ns/a".to_string());
        assert_eq!(
            allocator.record("ns/b", addr),
            RecordOutcome::Transferred {
                previous: "ns/a".to_string()
            }
        );
        assert_eq!(allocator.address_of("ns/b"), Some(addr));
        assert_eq!(allocator.address_of("ns/a"), None);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("wrap".parse::<ExhaustionPolicy>().unwrap(), ExhaustionPolicy::Wrap);
        assert_eq!("FAIL".parse::<ExhaustionPolicy>().unwrap(), ExhaustionPolicy::Fail);
        assert!("retry".parse::<ExhaustionPolicy>().is_err());
    }

    proptest! {
        #[test]
        fn prop_allocations_unique(n in 1usize..1500) {
            let allocator = allocator(ExhaustionPolicy::Fail);
            let mut seen = HashSet::new();
            for i in 0..n {
                let addr = allocator.allocate(&format!("ns/svc-{}", i)).unwrap();
                let [a, b, _, d] = addr.octets();
                prop_assert_eq!((a, b), (240, 240));
                prop_assert!(d % 255 != 0);
                prop_assert!(seen.insert(addr));
            }
        }
    }

    fn service(name: &str, addresses: &[&str], created: i64) -> crate::model::Config {
        let mut service = Resource::new(
            "ns1",
            name,
            ServiceEntrySpec {
                hosts: vec![format!("{}.ns1", name)],
                addresses: addresses.iter().map(|s| s.to_string()).collect(),
                ports: vec![ServicePort::new(8000, "tcp-metaprotocol-videopacket")],
                ..Default::default()
            },
        );
        service.metadata.creation_timestamp = created;
        service.into()
    }

    fn controller(store: &Arc<MemoryConfigStore>) -> Arc<VipController> {
        let allocator = Arc::new(VipAllocator::new(
            ExhaustionPolicy::Wrap,
            Arc::new(StoreLiveness::new(store.clone())),
        ));
        Arc::new(VipController::new(allocator, store.clone(), store.clone()))
    }

    fn address(store: &MemoryConfigStore, name: &str) -> Option<String> {
        store
            .get(ConfigKind::ServiceEntry, "ns1", name)
            .and_then(|c| c.typed::<ServiceEntrySpec>().ok())
            .and_then(|s| s.spec.addresses.first().cloned())
    }

    #[tokio::test]
    async fn test_address_written_back() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("a", &[], 1));
        let controller = controller(&store);

        controller.sync_service("ns1", "a").await.unwrap();
        assert_eq!(address(&store, "a").as_deref(), Some("240.240.0.1"));

        // The write-back is recorded, not reallocated
        controller.sync_service("ns1", "a").await.unwrap();
        assert_eq!(controller.allocator().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_moves_newer_service() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("new", &["240.240.0.9"], 20));
        store.apply(service("old", &["240.240.0.9"], 10));
        let controller = controller(&store);

        // The newer service is seen first and holds the address
        controller.sync_service("ns1", "new").await.unwrap();
        controller.sync_service("ns1", "old").await.unwrap();

        assert_eq!(address(&store, "old").as_deref(), Some("240.240.0.9"));
        let moved = address(&store, "new").unwrap();
        assert_ne!(moved, "240.240.0.9");
        assert_eq!(
            controller.allocator().owner_of(moved.parse().unwrap()).as_deref(),
            Some("ns1/new")
        );
    }

    #[tokio::test]
    async fn test_deletion_releases_address() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("a", &[], 1));
        let controller = controller(&store);
        controller.sync_service("ns1", "a").await.unwrap();
        let addr: Ipv4Addr = address(&store, "a").unwrap().parse().unwrap();

        store.delete(ConfigKind::ServiceEntry, "ns1", "a");
        controller.sync_service("ns1", "a").await.unwrap();
        assert_eq!(controller.allocator().owner_of(addr), None);
    }

    #[tokio::test]
    async fn test_external_address_untouched() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("a", &["10.1.2.3"], 1));
        let controller = controller(&store);

        controller.sync_service("ns1", "a").await.unwrap();
        assert_eq!(address(&store, "a").as_deref(), Some("10.1.2.3"));
        assert!(controller.allocator().is_empty());
    }

    #[tokio::test]
    async fn test_controller_loop_follows_store() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("a", &[], 1));
        let controller = controller(&store);
        controller.watch_store();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = controller.start(shutdown_rx).unwrap();

        store.apply(service("b", &[], 2));
        for _ in 0..100 {
            if address(&store, "a").is_some() && address(&store, "b").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(address(&store, "a").as_deref(), Some("240.240.0.1"));
        assert_eq!(address(&store, "b").as_deref(), Some("240.240.0.2"));
        assert!(controller.start(broadcast::channel(1).1).is_err());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
