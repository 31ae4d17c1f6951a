//! Route distribution server
//!
//! Serves synthesized route tables to proxies over the aggregated discovery
//! stream. Every connected node holds exactly one snapshot in the cache;
//! config store changes trigger a debounced recomputation that replaces the
//! snapshots and pushes them to nodes whose version moved.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use protomesh_common::{MeshError, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::debounce::{DebounceConfig, Debouncer};
use crate::generator::{MeshSettings, MetaProtocolGenerator, PortProtocol};
use crate::index::MeshIndex;
use crate::model::ConfigKind;
use crate::patch::Direction;
use crate::route::{self, RouteInput};
use crate::snapshot::{ExportedRoute, RouteSnapshot, RouteTable, SnapshotCache};
use crate::store::{ConfigEvent, ConfigStore, EVENT_QUEUE_CAPACITY};
use crate::xds::{type_urls, Node, RouteConfiguration};

/// Capacity of each stream's push queue
pub const STREAM_QUEUE_CAPACITY: usize = 100;

/// Kinds route tables are computed from
const ROUTE_KINDS: [ConfigKind; 3] = [
    ConfigKind::ServiceEntry,
    ConfigKind::RoutePolicy,
    ConfigKind::DestinationRule,
];

/// Which route tables a node receives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotScope {
    /// Every node receives every table
    #[default]
    Shared,
    /// A node receives the tables exported to its namespace
    Namespace,
}

impl FromStr for SnapshotScope {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(SnapshotScope::Shared),
            "namespace" => Ok(SnapshotScope::Namespace),
            other => Err(MeshError::ConfigError(format!("unknown snapshot scope '{}'", other))),
        }
    }
}

/// Distribution server configuration
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Server identifier reported to proxies
    pub server_id: String,
    pub scope: SnapshotScope,
    pub debounce: DebounceConfig,
    pub mesh: MeshSettings,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            server_id: "protomesh".to_string(),
            scope: SnapshotScope::default(),
            debounce: DebounceConfig::default(),
            mesh: MeshSettings::default(),
        }
    }
}

/// Lifecycle of a connected node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never seen, or its stream is gone
    Unknown,
    /// Connected, waiting for a snapshot or its acknowledgement
    Initializing,
    /// Acknowledged the current snapshot
    Synced,
    /// Stream is being torn down
    Closed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unknown => "unknown",
            NodeState::Initializing => "initializing",
            NodeState::Synced => "synced",
            NodeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Discovery request as seen by the server
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    /// Version of the last response applied (empty on first request)
    pub version_info: String,
    pub node: Option<Node>,
    /// Requested table names (empty means all)
    pub resource_names: Vec<String>,
    pub type_url: String,
    pub response_nonce: String,
    /// Set when the proxy rejected the last response
    pub error_detail: Option<String>,
}

/// Discovery response produced by the server
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<RouteConfiguration>,
    pub type_url: String,
    pub nonce: String,
    pub control_plane_id: String,
}

type StreamSender = mpsc::Sender<DiscoveryResponse>;

struct NodeStream {
    stream_id: u64,
    node: Node,
    state: NodeState,
    sender: StreamSender,
    /// Last version sent on this stream
    sent_version: Option<String>,
    /// Last push found the queue full
    lagging: bool,
}

/// Counters describing the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connected_nodes: usize,
    pub synced_nodes: usize,
    pub snapshots: usize,
    pub version: Option<String>,
}

/// Current route tables and the version they were published under
#[derive(Default)]
struct Published {
    version: Option<String>,
    table: Arc<RouteTable>,
    /// Snapshot handed to every node under the shared scope
    shared: Option<Arc<RouteSnapshot>>,
}

/// Route distribution server
pub struct DistributionServer {
    config: DistributionConfig,
    store: Arc<dyn ConfigStore>,
    cache: SnapshotCache,
    streams: DashMap<String, NodeStream>,
    next_stream_id: AtomicU64,
    version: AtomicU64,
    published: RwLock<Published>,
    recompute_tx: mpsc::Sender<()>,
    recompute_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DistributionServer {
    pub fn new(config: DistributionConfig, store: Arc<dyn ConfigStore>) -> Self {
        info!(
            server_id = %config.server_id,
            scope = ?config.scope,
            "Creating route distribution server"
        );
        let (recompute_tx, recompute_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            config,
            store,
            cache: SnapshotCache::new(),
            streams: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
            version: AtomicU64::new(0),
            published: RwLock::new(Published::default()),
            recompute_tx,
            recompute_rx: Mutex::new(Some(recompute_rx)),
        }
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    pub fn snapshot_cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Recompute on every change to a kind route tables depend on
    pub fn watch_store(&self) {
        for kind in ROUTE_KINDS {
            let tx = self.recompute_tx.clone();
            self.store.on_change(
                kind,
                Arc::new(move |event: &ConfigEvent| {
                    if tx.try_send(()).is_err() {
                        debug!(kind = %event.kind, "Recompute already pending");
                    }
                }),
            );
        }
    }

    /// Start the debounced recompute task
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        let rx = self
            .recompute_rx
            .lock()
            .take()
            .ok_or_else(|| MeshError::InvariantViolation("distribution server already started".to_string()))?;

        let debouncer = Debouncer::new(self.config.debounce, rx);
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let worker = this.clone();
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Distribution server shutting down");
                }
                _ = debouncer.run(move |batch: Vec<()>| {
                    let worker = worker.clone();
                    async move {
                        debug!(events = batch.len(), "Recomputing route snapshots");
                        worker.recompute().await;
                    }
                }) => {}
            }
            this.close_all();
        }))
    }

    /// Register a stream for `node`
    ///
    /// Replaces any older stream of the same node; the older stream's push
    /// queue is closed. Returns the stream id and the push queue.
    pub fn register_stream(&self, node: Node) -> (u64, mpsc::Receiver<DiscoveryResponse>) {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (sender, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        let node_id = node.id.clone();

        let replaced = self.streams.insert(
            node_id.clone(),
            NodeStream {
                stream_id,
                node,
                state: NodeState::Initializing,
                sender,
                sent_version: None,
                lagging: false,
            },
        );
        if let Some(old) = replaced {
            info!(node_id = %node_id, old_stream = old.stream_id, stream_id, "Node reconnected, replacing stream");
        } else {
            info!(node_id = %node_id, stream_id, "Node connected");
        }
        self.record_connected();

        // Serve what is already published, then refresh.
        if let Some(snapshot) = self.snapshot_for(&node_id) {
            self.cache.set_snapshot(&node_id, snapshot);
        }
        if self.recompute_tx.try_send(()).is_err() {
            debug!(node_id = %node_id, "Recompute already pending");
        }

        (stream_id, rx)
    }

    /// Drop a stream and evict its node's snapshot
    ///
    /// Ignored when the node has since registered a newer stream.
    pub fn unregister_stream(&self, node_id: &str, stream_id: u64) {
        let removed = self
            .streams
            .remove_if(node_id, |_, stream| stream.stream_id == stream_id);
        if let Some((_, mut stream)) = removed {
            stream.state = NodeState::Closed;
            self.cache.remove_snapshot(node_id);
            info!(node_id = %node_id, stream_id, state = %stream.state, "Node disconnected, snapshot evicted");
            self.record_connected();
        }
    }

    pub fn node_state(&self, node_id: &str) -> NodeState {
        self.streams
            .get(node_id)
            .map_or(NodeState::Unknown, |stream| stream.state)
    }

    pub fn connected_nodes(&self) -> usize {
        self.streams.len()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connected_nodes: self.streams.len(),
            synced_nodes: self
                .streams
                .iter()
                .filter(|s| s.state == NodeState::Synced)
                .count(),
            snapshots: self.cache.len(),
            version: self.published.read().version.clone(),
        }
    }

    /// Handle a request received on a registered stream
    ///
    /// Returns the response to send, if any. A request carrying the current
    /// version acknowledges it; a request carrying an error detail rejects
    /// the last response and leaves the node on its current snapshot.
    pub fn handle_request(&self, node_id: &str, request: &DiscoveryRequest) -> Option<DiscoveryResponse> {
        if !request.type_url.is_empty() && request.type_url != type_urls::ROUTE_CONFIGURATION {
            debug!(node_id = %node_id, type_url = %request.type_url, "Ignoring request for unserved type");
            return None;
        }

        if let Some(error) = &request.error_detail {
            warn!(
                node_id = %node_id,
                version = %request.version_info,
                nonce = %request.response_nonce,
                error = %error,
                "Proxy rejected route snapshot"
            );
            return None;
        }

        let snapshot = self.cache.get_snapshot(node_id)?;
        let mut stream = self.streams.get_mut(node_id)?;

        if request.version_info == snapshot.version {
            if stream.state != NodeState::Synced {
                debug!(node_id = %node_id, version = %snapshot.version, "Node acknowledged snapshot");
            }
            stream.state = NodeState::Synced;
            return None;
        }

        // Already sent and awaiting acknowledgement
        if stream.sent_version.as_deref() == Some(snapshot.version.as_str())
            && !request.response_nonce.is_empty()
        {
            return None;
        }

        stream.sent_version = Some(snapshot.version.clone());
        stream.state = NodeState::Initializing;
        Some(self.build_response(&snapshot, &request.resource_names))
    }

    /// Rebuild route tables and push changed snapshots
    ///
    /// Skipped while no node is connected. The version only advances when
    /// the tables changed, and a node only moves to it when its visible
    /// tables changed. Pushes never wait: a node with a full queue is left
    /// behind and caught up on a later pass, a closed stream is dropped.
    pub async fn recompute(&self) {
        if self.streams.is_empty() {
            debug!("No connected nodes, skipping recompute");
            return;
        }

        let table = self.compute_table();
        {
            let mut published = self.published.write();
            if published.version.is_none() || *published.table != table {
                let version = (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                info!(version = %version, routes = table.len(), "Publishing route tables");
                published.shared = Some(Arc::new(RouteSnapshot::from_table(version.clone(), &table)));
                published.version = Some(version);
                published.table = Arc::new(table);
            }
        }

        let mut stalled = 0usize;
        let mut closed = Vec::new();
        for mut stream in self.streams.iter_mut() {
            let node_id = stream.key().clone();
            let Some(mut snapshot) = self.snapshot_for_node(&stream.node) else {
                continue;
            };
            // A node whose visible tables did not change keeps its version
            if let Some(current) = self.cache.get_snapshot(&node_id)
                && current.routes == snapshot.routes
            {
                snapshot = current;
            } else {
                self.cache.set_snapshot(&node_id, snapshot.clone());
            }
            if stream.sent_version.as_deref() == Some(snapshot.version.as_str()) {
                continue;
            }

            match stream.sender.try_send(self.build_response(&snapshot, &[])) {
                Ok(()) => {
                    stream.sent_version = Some(snapshot.version.clone());
                    stream.state = NodeState::Initializing;
                    stream.lagging = false;
                }
                Err(TrySendError::Full(_)) => {
                    // sent_version stays behind so a later pass delivers the latest
                    stalled += 1;
                    if !stream.lagging {
                        warn!(node_id = %node_id, version = %snapshot.version, "Push queue full, node lagging");
                    }
                    stream.lagging = true;
                }
                Err(TrySendError::Closed(_)) => {
                    closed.push((node_id, stream.stream_id));
                }
            }
        }

        for (node_id, stream_id) in closed {
            debug!(node_id = %node_id, "Stream gone before push");
            self.unregister_stream(&node_id, stream_id);
        }
        if stalled > 0 && self.recompute_tx.try_send(()).is_err() {
            debug!(stalled, "Recompute already pending");
        }
    }

    /// Route tables for every service port served through the discovery stream
    pub fn compute_table(&self) -> RouteTable {
        let index = MeshIndex::load(self.store.as_ref());
        let mut table = RouteTable::new();

        for service in &index.services {
            let Some(host) = service.spec.primary_host() else {
                warn!(service = %service.key(), "Service has no hosts, no routes served");
                continue;
            };
            let namespaces = index.export_namespaces(service, &self.config.mesh);

            for port in &service.spec.ports {
                let served = PortProtocol::parse(&port.name)
                    .is_some_and(|tag| tag.protocol == MetaProtocolGenerator::TAG);
                if !served {
                    continue;
                }

                let input = RouteInput::new(service, port, Direction::Outbound)
                    .with_route_policy(index.route_policy(host))
                    .with_destination_rule(index.destination_rule(host));
                match route::synthesize(&input) {
                    Ok(synthesized) => {
                        table.insert(
                            synthesized.config.name.clone(),
                            ExportedRoute {
                                config: synthesized.config,
                                namespaces: namespaces.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        warn!(service = %service.key(), port = port.number, error = %e, "Skipping route table");
                    }
                }
            }
        }
        table
    }

    fn snapshot_for(&self, node_id: &str) -> Option<Arc<RouteSnapshot>> {
        let node = self.streams.get(node_id)?.node.clone();
        self.snapshot_for_node(&node)
    }

    fn snapshot_for_node(&self, node: &Node) -> Option<Arc<RouteSnapshot>> {
        let published = self.published.read();
        match self.config.scope {
            SnapshotScope::Shared => published.shared.clone(),
            SnapshotScope::Namespace => {
                let version = published.version.clone()?;
                Some(Arc::new(RouteSnapshot::for_namespace(
                    version,
                    &published.table,
                    node.namespace(),
                    &self.config.mesh.root_namespace,
                )))
            }
        }
    }

    fn build_response(&self, snapshot: &RouteSnapshot, names: &[String]) -> DiscoveryResponse {
        let resources = if names.is_empty() {
            snapshot.routes.values().cloned().collect()
        } else {
            names
                .iter()
                .filter_map(|name| snapshot.get_route(name).cloned())
                .collect()
        };

        DiscoveryResponse {
            version_info: snapshot.version.clone(),
            resources,
            type_url: type_urls::ROUTE_CONFIGURATION.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
            control_plane_id: self.config.server_id.clone(),
        }
    }

    fn close_all(&self) {
        self.streams.clear();
        self.cache.clear();
        self.record_connected();
    }

    fn record_connected(&self) {
        gauge!("protomesh_xds_connected_nodes").set(self.streams.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, ServiceEntrySpec, ServicePort};
    use crate::store::MemoryConfigStore;
    use crate::xds::NODE_NAMESPACE_KEY;

    fn service(namespace: &str, name: &str, export_to: &[&str]) -> crate::model::Config {
        Resource::new(
            namespace,
            name,
            ServiceEntrySpec {
                hosts: vec![format!("{}.{}", name, namespace)],
                ports: vec![
                    ServicePort::new(8000, "tcp-metaprotocol-videopacket"),
                    ServicePort::new(20880, "tcp-dubbo"),
                ],
                export_to: export_to.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
        .into()
    }

    fn node(id: &str, namespace: &str) -> Node {
        let mut node = Node::new(id);
        node.metadata = std::collections::HashMap::from([(
            NODE_NAMESPACE_KEY.to_string(),
            namespace.to_string(),
        )]);
        node
    }

    fn server(store: Arc<MemoryConfigStore>, scope: SnapshotScope) -> DistributionServer {
        DistributionServer::new(
            DistributionConfig {
                scope,
                ..Default::default()
            },
            store,
        )
    }

    fn request(version: &str, nonce: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: version.to_string(),
            type_url: type_urls::ROUTE_CONFIGURATION.to_string(),
            response_nonce: nonce.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_scope_from_str() {
        assert_eq!("Shared".parse::<SnapshotScope>().unwrap(), SnapshotScope::Shared);
        assert_eq!("namespace".parse::<SnapshotScope>().unwrap(), SnapshotScope::Namespace);
        assert!("cluster".parse::<SnapshotScope>().is_err());
    }

    #[test]
    fn test_table_serves_metaprotocol_ports_only() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &[]));
        let server = server(store, SnapshotScope::Shared);

        let table = server.compute_table();
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["a.ns1_8000"]);
    }

    #[tokio::test]
    async fn test_recompute_skipped_without_nodes() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &[]));
        let server = server(store, SnapshotScope::Shared);

        server.recompute().await;
        assert_eq!(server.stats().version, None);
    }

    #[tokio::test]
    async fn test_push_ack_and_unchanged_version() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &[]));
        let server = server(store.clone(), SnapshotScope::Shared);

        let (stream_id, mut rx) = server.register_stream(node("node-1", "ns1"));
        assert_eq!(server.node_state("node-1"), NodeState::Initializing);
        assert!(server.handle_request("node-1", &request("", "")).is_none());

        server.recompute().await;
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.version_info, "1");
        assert_eq!(pushed.resources.len(), 1);

        assert!(server.handle_request("node-1", &request("1", &pushed.nonce)).is_none());
        assert_eq!(server.node_state("node-1"), NodeState::Synced);

        // Same content keeps the version and pushes nothing
        server.recompute().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(server.stats().version.as_deref(), Some("1"));

        store.apply(service("ns1", "b", &[]));
        server.recompute().await;
        assert_eq!(rx.recv().await.unwrap().version_info, "2");

        server.unregister_stream("node-1", stream_id);
        assert_eq!(server.node_state("node-1"), NodeState::Unknown);
        assert!(!server.snapshot_cache().has_snapshot("node-1"));
    }

    #[tokio::test]
    async fn test_nack_keeps_snapshot() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &[]));
        let server = server(store, SnapshotScope::Shared);

        let (_, mut rx) = server.register_stream(node("node-1", "ns1"));
        server.recompute().await;
        let pushed = rx.recv().await.unwrap();

        let mut nack = request("", &pushed.nonce);
        nack.error_detail = Some("bad route".to_string());
        assert!(server.handle_request("node-1", &nack).is_none());

        let snapshot = server.snapshot_cache().get_snapshot("node-1").unwrap();
        assert_eq!(snapshot.version, pushed.version_info);
        assert_eq!(server.node_state("node-1"), NodeState::Initializing);
    }

    #[tokio::test]
    async fn test_reconnect_does_not_evict_new_stream() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &[]));
        let server = server(store, SnapshotScope::Shared);

        let (old_id, mut old_rx) = server.register_stream(node("node-1", "ns1"));
        server.recompute().await;
        old_rx.recv().await.unwrap();

        let (new_id, _new_rx) = server.register_stream(node("node-1", "ns1"));
        assert!(old_rx.recv().await.is_none());
        // the published snapshot is served to the new stream right away
        assert!(server.snapshot_cache().has_snapshot("node-1"));

        server.unregister_stream("node-1", old_id);
        assert_eq!(server.connected_nodes(), 1);
        assert!(server.snapshot_cache().has_snapshot("node-1"));

        let response = server.handle_request("node-1", &request("", "")).unwrap();
        assert_eq!(response.version_info, "1");

        server.unregister_stream("node-1", new_id);
        assert_eq!(server.connected_nodes(), 0);
    }

    #[tokio::test]
    async fn test_namespace_scope() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &["."]));
        store.apply(service("ns2", "b", &["."]));
        store.apply(service("ns3", "c", &["*"]));
        let server = server(store, SnapshotScope::Namespace);

        let (_, mut rx1) = server.register_stream(node("node-1", "ns1"));
        let (_, mut rx2) = server.register_stream(node("node-2", "ns2"));
        server.recompute().await;

        let names = |response: DiscoveryResponse| -> Vec<String> {
            response.resources.into_iter().map(|r| r.name).collect()
        };
        assert_eq!(names(rx1.recv().await.unwrap()), vec!["a.ns1_8000", "c.ns3_8000"]);
        assert_eq!(names(rx2.recv().await.unwrap()), vec!["b.ns2_8000", "c.ns3_8000"]);

        let stats = server.stats();
        assert_eq!(stats.connected_nodes, 2);
        assert_eq!(stats.snapshots, 2);
    }

    #[tokio::test]
    async fn test_stalled_node_does_not_block_others() {
        let store = Arc::new(MemoryConfigStore::new());
        let server = server(store.clone(), SnapshotScope::Shared);
        let (_, mut stuck_rx) = server.register_stream(node("node-stuck", "ns1"));
        let (_, mut ok_rx) = server.register_stream(node("node-ok", "ns1"));

        for i in 0..(STREAM_QUEUE_CAPACITY + 20) {
            store.apply(service("ns1", &format!("svc-{}", i), &[]));
            tokio::time::timeout(std::time::Duration::from_secs(2), server.recompute())
                .await
                .unwrap_or_else(|_| panic!("recompute blocked at change {}", i));

            let mut latest = None;
            while let Ok(response) = ok_rx.try_recv() {
                latest = Some(response.version_info);
            }
            assert_eq!(latest, server.stats().version);
        }

        // Once the lagging node drains its queue it catches up to the latest
        while stuck_rx.try_recv().is_ok() {}
        server.recompute().await;
        let caught_up = stuck_rx.try_recv().unwrap();
        assert_eq!(Some(caught_up.version_info), server.stats().version);
        assert_eq!(server.connected_nodes(), 2);
    }

    #[tokio::test]
    async fn test_closed_stream_dropped_on_push() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &[]));
        let server = server(store, SnapshotScope::Shared);

        let (_, rx) = server.register_stream(node("node-1", "ns1"));
        drop(rx);
        server.recompute().await;

        assert_eq!(server.connected_nodes(), 0);
        assert!(!server.snapshot_cache().has_snapshot("node-1"));
    }

    #[tokio::test]
    async fn test_namespace_scope_pushes_only_affected_nodes() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &["."]));
        store.apply(service("ns2", "b", &["."]));
        let server = server(store.clone(), SnapshotScope::Namespace);

        let (_, mut rx1) = server.register_stream(node("node-1", "ns1"));
        let (_, mut rx2) = server.register_stream(node("node-2", "ns2"));
        server.recompute().await;
        for (id, rx) in [("node-1", &mut rx1), ("node-2", &mut rx2)] {
            let pushed = rx.recv().await.unwrap();
            assert!(server.handle_request(id, &request(&pushed.version_info, &pushed.nonce)).is_none());
        }

        store.apply(service("ns1", "c", &["."]));
        server.recompute().await;

        assert_eq!(rx1.recv().await.unwrap().version_info, "2");
        assert!(rx2.try_recv().is_err());
        assert_eq!(server.node_state("node-2"), NodeState::Synced);
        assert_eq!(server.snapshot_cache().get_snapshot("node-2").unwrap().version, "1");
    }

    #[tokio::test]
    async fn test_shared_scope_shares_allocation() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply(service("ns1", "a", &["."]));
        let server = server(store, SnapshotScope::Shared);

        let (_, _rx1) = server.register_stream(node("node-1", "ns1"));
        let (_, _rx2) = server.register_stream(node("node-2", "ns2"));
        server.recompute().await;

        let one = server.snapshot_cache().get_snapshot("node-1").unwrap();
        let two = server.snapshot_cache().get_snapshot("node-2").unwrap();
        assert!(Arc::ptr_eq(&one, &two));
        assert_eq!(two.route_names(), vec!["a.ns1_8000"]);
    }
}
