//! Patch reconciler
//!
//! Converges the generated patches in the backing store with the config
//! store. Store changes are debounced into cycles; each cycle regenerates the
//! full desired set, diffs it against what is applied and issues only the
//! writes needed. Failed cycles re-enqueue a retry event up to a cap.
//!
//! Cycles only run while the leader gate reports leadership.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use protomesh_common::{MeshError, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::PatchStore;
use crate::debounce::{DebounceConfig, Debouncer};
use crate::generator::{
    GatewayBinding, GeneratorContext, GeneratorRegistry, MeshSettings, PortProtocol,
    ProtocolRegistry,
};
use crate::index::MeshIndex;
use crate::model::{ConfigKind, Gateway, GatewayServer, ServiceEntry};
use crate::patch::{managed_labels, AppliedPatch, GeneratedPatch, NamedPatch, PatchKey};
use crate::store::{ConfigEvent, ConfigStore, EVENT_QUEUE_CAPACITY};

/// Kinds whose changes trigger a cycle
pub const WATCHED_KINDS: [ConfigKind; 5] = ConfigKind::ALL;

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub debounce: DebounceConfig,
    /// Retry events enqueued after a failed cycle before giving up
    pub max_retries: u32,
    pub mesh: MeshSettings,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            max_retries: 3,
            mesh: MeshSettings::default(),
        }
    }
}

/// Why a cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// A watched resource changed
    Config(ConfigKind),
    /// A previous cycle failed
    Retry { attempt: u32 },
    /// This instance became leader
    LeaderElected,
}

/// Writes issued by one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ApplyStats {
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Desired versus applied state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchDiff {
    pub create: Vec<GeneratedPatch>,
    /// Changed patches with the resource version they were read at
    pub update: Vec<(GeneratedPatch, String)>,
    pub delete: Vec<PatchKey>,
    pub unchanged: usize,
}

/// Producer of inbound filters compiled from authorization rules
pub trait InboundPolicySource: Send + Sync {
    /// Filters inserted ahead of the inbound proxy of `service`
    fn inbound_filters(&self, service: &ServiceEntry) -> Vec<serde_json::Value>;
}

/// Source producing no inbound filters
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInboundPolicies;

impl InboundPolicySource for NoInboundPolicies {
    fn inbound_filters(&self, _service: &ServiceEntry) -> Vec<serde_json::Value> {
        Vec::new()
    }
}

/// Partition applied objects against the desired set
///
/// Applied objects missing from `desired` are stale, those whose labels or
/// payload differ are changed; desired objects not applied yet are created.
pub fn diff(desired: &BTreeMap<PatchKey, GeneratedPatch>, applied: Vec<AppliedPatch>) -> PatchDiff {
    let mut result = PatchDiff::default();
    let mut seen = std::collections::BTreeSet::new();

    for object in applied {
        let key = object.patch.key();
        seen.insert(key.clone());
        match desired.get(&key) {
            None => result.delete.push(key),
            Some(patch) if *patch == object.patch => result.unchanged += 1,
            Some(patch) => result.update.push((patch.clone(), object.resource_version)),
        }
    }

    result.create = desired
        .iter()
        .filter(|(key, _)| !seen.contains(*key))
        .map(|(_, patch)| patch.clone())
        .collect();
    result
}

/// Debounced reconcile loop
pub struct Reconciler {
    config: ReconcilerConfig,
    store: Arc<dyn ConfigStore>,
    patches: Arc<dyn PatchStore>,
    generators: Arc<GeneratorRegistry>,
    protocols: Arc<ProtocolRegistry>,
    inbound: Arc<dyn InboundPolicySource>,
    event_tx: mpsc::Sender<ReconcileEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ReconcileEvent>>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn ConfigStore>,
        patches: Arc<dyn PatchStore>,
        generators: Arc<GeneratorRegistry>,
        protocols: Arc<ProtocolRegistry>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            config,
            store,
            patches,
            generators,
            protocols,
            inbound: Arc::new(NoInboundPolicies),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn with_inbound_policies(mut self, source: Arc<dyn InboundPolicySource>) -> Self {
        self.inbound = source;
        self
    }

    /// Sender for requesting a cycle
    pub fn event_sender(&self) -> mpsc::Sender<ReconcileEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to changes of every watched kind
    ///
    /// A full queue already holds a pending cycle, so events that do not fit
    /// are dropped.
    pub fn watch_store(&self) {
        for kind in WATCHED_KINDS {
            let tx = self.event_tx.clone();
            self.store.on_change(
                kind,
                Arc::new(move |event: &ConfigEvent| {
                    if tx.try_send(ReconcileEvent::Config(event.kind)).is_err() {
                        debug!(kind = %event.kind, "Reconcile queue full, change coalesced");
                    }
                }),
            );
        }
    }

    /// Start the loop
    ///
    /// Runs until `shutdown` fires. Fails if the loop was already started.
    pub fn start(
        self: &Arc<Self>,
        leader: watch::Receiver<bool>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let event_rx = self
            .event_rx
            .lock()
            .take()
            .ok_or_else(|| MeshError::InvariantViolation("reconciler already started".to_string()))?;

        info!(
            quiet_period_ms = self.config.debounce.quiet_period.as_millis() as u64,
            max_wait_ms = self.config.debounce.max_wait.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Starting reconciler"
        );

        let leader_watch = self.spawn_leader_watch(leader.clone());
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let debouncer = Debouncer::new(this.config.debounce, event_rx);
            let worker = this.clone();
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Reconciler shutting down");
                }
                _ = debouncer.run(move |batch| {
                    let worker = worker.clone();
                    let leader = leader.clone();
                    async move { worker.handle_batch(batch, &leader).await }
                }) => {
                    info!("Reconciler event queue closed");
                }
            }
            leader_watch.abort();
        }))
    }

    fn spawn_leader_watch(&self, mut leader: watch::Receiver<bool>) -> JoinHandle<()> {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut elected = *leader.borrow_and_update();
            if elected {
                let _ = tx.send(ReconcileEvent::LeaderElected).await;
            }
            while leader.changed().await.is_ok() {
                let now = *leader.borrow_and_update();
                if now && !elected {
                    info!("Leadership acquired, scheduling reconcile");
                    let _ = tx.send(ReconcileEvent::LeaderElected).await;
                } else if !now && elected {
                    info!("Leadership lost, reconcile paused");
                }
                elected = now;
            }
        })
    }

    async fn handle_batch(&self, batch: Vec<ReconcileEvent>, leader: &watch::Receiver<bool>) {
        // Only a batch made of retries continues the retry count.
        let attempt = batch
            .iter()
            .map(|event| match event {
                ReconcileEvent::Retry { attempt } => Some(*attempt),
                _ => None,
            })
            .collect::<Option<Vec<u32>>>()
            .and_then(|attempts| attempts.into_iter().max())
            .unwrap_or(0);

        if !*leader.borrow() {
            debug!(events = batch.len(), "Not leader, skipping reconcile");
            return;
        }

        match self.reconcile().await {
            Ok(stats) => {
                counter!("protomesh_reconcile_cycles_total", "result" => "success").increment(1);
                info!(
                    created = stats.created,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    unchanged = stats.unchanged,
                    events = batch.len(),
                    "Reconcile cycle completed"
                );
            }
            Err(e) => {
                counter!("protomesh_reconcile_cycles_total", "result" => "failure").increment(1);
                if attempt < self.config.max_retries {
                    counter!("protomesh_reconcile_retries_total").increment(1);
                    warn!(error = %e, attempt = attempt + 1, "Reconcile cycle failed, retrying");
                    if self
                        .event_tx
                        .try_send(ReconcileEvent::Retry { attempt: attempt + 1 })
                        .is_err()
                    {
                        debug!("Reconcile queue full, retry coalesced");
                    }
                } else {
                    error!(error = %e, attempts = attempt + 1, "Reconcile cycle failed, giving up until the next change");
                }
            }
        }
    }

    /// Run one cycle: generate, diff and apply
    pub async fn reconcile(&self) -> Result<ApplyStats> {
        let desired = self.generate()?;
        let applied = self.patches.list(&managed_labels()).await?;
        let diff = diff(&desired, applied);
        debug!(
            desired = desired.len(),
            create = diff.create.len(),
            update = diff.update.len(),
            delete = diff.delete.len(),
            "Patch diff computed"
        );
        self.apply(diff).await
    }

    /// Apply a diff
    ///
    /// Every operation is attempted; the first failure is returned after
    /// the rest have run.
    async fn apply(&self, diff: PatchDiff) -> Result<ApplyStats> {
        let mut stats = ApplyStats {
            unchanged: diff.unchanged,
            ..Default::default()
        };
        let mut first_error: Option<MeshError> = None;

        for key in diff.delete {
            match self.patches.delete(&key.namespace, &key.name).await {
                Ok(()) => {
                    stats.deleted += 1;
                    counter!("protomesh_patch_apply_total", "op" => "delete").increment(1);
                    debug!(patch = %key, "Deleted stale patch");
                }
                Err(e) => {
                    error!(patch = %key, error = %e, "Failed to delete patch");
                    first_error.get_or_insert(e);
                }
            }
        }

        for (patch, resource_version) in diff.update {
            match self.patches.update(&patch, &resource_version).await {
                Ok(_) => {
                    stats.updated += 1;
                    counter!("protomesh_patch_apply_total", "op" => "update").increment(1);
                    debug!(patch = %patch.key(), "Updated patch");
                }
                Err(e) => {
                    error!(patch = %patch.key(), error = %e, "Failed to update patch");
                    first_error.get_or_insert(e);
                }
            }
        }

        for patch in diff.create {
            match self.patches.create(&patch).await {
                Ok(_) => {
                    stats.created += 1;
                    counter!("protomesh_patch_apply_total", "op" => "create").increment(1);
                    debug!(patch = %patch.key(), "Created patch");
                }
                Err(e) => {
                    error!(patch = %patch.key(), error = %e, "Failed to create patch");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Desired patches for the current store content
    ///
    /// Pure function of the store. A hostless service aborts generation;
    /// input errors skip the offending service port or gateway server.
    pub fn generate(&self) -> Result<BTreeMap<PatchKey, GeneratedPatch>> {
        let index = MeshIndex::load(self.store.as_ref());
        index.check_services()?;

        let mut desired = BTreeMap::new();
        for service in &index.services {
            self.generate_service(&index, service, &mut desired)?;
        }
        for gateway in &index.gateways {
            for server in &gateway.spec.servers {
                self.generate_gateway(&index, gateway, server, &mut desired)?;
            }
        }
        Ok(desired)
    }

    fn generate_service(
        &self,
        index: &MeshIndex,
        service: &ServiceEntry,
        desired: &mut BTreeMap<PatchKey, GeneratedPatch>,
    ) -> Result<()> {
        let Some(host) = service.spec.primary_host() else {
            return Ok(());
        };
        let route_policy = index.route_policy(host);
        let destination_rule = index.destination_rule(host);

        let namespaces = index.export_namespaces(service, &self.config.mesh);
        let inbound_filters = self.inbound.inbound_filters(service);

        for port in &service.spec.ports {
            let Some((protocol, generator)) = self.generators.for_port(&port.name) else {
                continue;
            };
            let ctx = GeneratorContext {
                service,
                port,
                protocol: &protocol,
                route_policy,
                destination_rule,
                mesh: &self.config.mesh,
                protocols: &self.protocols,
                gateway: None,
                inbound_filters: &inbound_filters,
            };
            if let Some(patches) = skip_input_errors(generator.generate(&ctx), &service.key(), &port.name)? {
                insert_all(desired, &patches, &namespaces);
            }
        }
        Ok(())
    }

    fn generate_gateway(
        &self,
        index: &MeshIndex,
        gateway: &Gateway,
        server: &GatewayServer,
        desired: &mut BTreeMap<PatchKey, GeneratedPatch>,
    ) -> Result<()> {
        let Some((protocol, generator)) = self.generators.for_port(&server.port.name) else {
            return Ok(());
        };
        let namespaces = vec![gateway.namespace().to_string()];

        for host in server.service_hosts() {
            let Some(service) = index.service_by_host(host) else {
                warn!(gateway = %gateway.key(), host = %host, "Gateway exposes an unknown service");
                continue;
            };
            let Some(port) = service_port_for(service, server, &protocol) else {
                warn!(gateway = %gateway.key(), host = %host, port = %server.port.name, "Service has no port matching the gateway server");
                continue;
            };
            let ctx = GeneratorContext {
                service,
                port,
                protocol: &protocol,
                route_policy: index.route_policy(host),
                destination_rule: index.destination_rule(host),
                mesh: &self.config.mesh,
                protocols: &self.protocols,
                gateway: Some(GatewayBinding { gateway, server }),
                inbound_filters: &[],
            };
            if let Some(patches) = skip_input_errors(generator.generate(&ctx), &gateway.key(), &server.port.name)? {
                insert_all(desired, &patches, &namespaces);
            }
        }
        Ok(())
    }
}

/// Service port behind a gateway server: same number, else the first port
/// carrying the same protocol
fn service_port_for<'a>(
    service: &'a ServiceEntry,
    server: &GatewayServer,
    protocol: &PortProtocol,
) -> Option<&'a crate::model::ServicePort> {
    service.spec.port(server.port.number).or_else(|| {
        service.spec.ports.iter().find(|port| {
            PortProtocol::parse(&port.name).is_some_and(|tag| tag.protocol == protocol.protocol)
        })
    })
}

fn skip_input_errors(
    result: Result<Vec<NamedPatch>>,
    resource: &str,
    port: &str,
) -> Result<Option<Vec<NamedPatch>>> {
    match result {
        Ok(patches) => Ok(Some(patches)),
        Err(e) if e.is_input_error() => {
            warn!(resource = %resource, port = %port, error = %e, "Skipping resource for this cycle");
            Ok(None)
        }
        Err(MeshError::InvariantViolation(reason)) => {
            error!(resource = %resource, port = %port, reason = %reason, "Generation failed");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn insert_all(
    desired: &mut BTreeMap<PatchKey, GeneratedPatch>,
    patches: &[NamedPatch],
    namespaces: &[String],
) {
    for namespace in namespaces {
        for patch in patches {
            let bound = patch.bind(namespace);
            desired.insert(bound.key(), bound);
        }
    }
}
