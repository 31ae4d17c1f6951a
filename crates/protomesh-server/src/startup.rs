//! Wiring of the engine components around one config store

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use protomesh_mesh::backend::MemoryPatchStore;
use protomesh_mesh::generator::{GeneratorRegistry, ProtocolRegistry};
use protomesh_mesh::grpc;
use protomesh_mesh::reconciler::Reconciler;
use protomesh_mesh::server::DistributionServer;
use protomesh_mesh::store::MemoryConfigStore;
use protomesh_mesh::vip::{StoreLiveness, VipAllocator, VipController};

use crate::config::Configuration;
use crate::shutdown::{ShutdownSignal, drain};

/// Running engine
pub struct Mesh {
    pub store: Arc<MemoryConfigStore>,
    pub patches: Arc<MemoryPatchStore>,
    pub reconciler: Arc<Reconciler>,
    pub vip: Arc<VipController>,
    pub distribution: Arc<DistributionServer>,
    // A standalone instance is always the leader
    _leader: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Mesh {
    /// Wait for every task to observe the shutdown signal
    pub async fn stopped(self, timeout: Duration) {
        drain(self.handles, timeout).await;
        info!("Mesh engine stopped");
    }
}

/// Start the VIP controller, the reconciler, the distribution server and its
/// gRPC endpoint, all stopping on `shutdown`
pub fn start_mesh(
    configuration: &Configuration,
    store: Arc<MemoryConfigStore>,
    shutdown: &ShutdownSignal,
) -> anyhow::Result<Mesh> {
    let protocols = Arc::new(ProtocolRegistry::with_defaults());
    protocols.watch(store.as_ref());
    let generators = Arc::new(GeneratorRegistry::with_defaults());
    let patches = Arc::new(MemoryPatchStore::new());
    let mut handles = Vec::new();

    let allocator = VipAllocator::new(
        configuration.exhaustion_policy()?,
        Arc::new(StoreLiveness::new(store.clone())),
    );
    let vip = Arc::new(VipController::new(
        Arc::new(allocator),
        store.clone(),
        store.clone(),
    ));
    vip.watch_store();
    handles.push(vip.start(shutdown.subscribe())?);

    let reconciler = Arc::new(Reconciler::new(
        configuration.reconciler_config(),
        store.clone(),
        patches.clone(),
        generators,
        protocols,
    ));
    reconciler.watch_store();
    let (leader, leader_rx) = watch::channel(true);
    handles.push(reconciler.start(leader_rx, shutdown.subscribe())?);

    let distribution = Arc::new(DistributionServer::new(
        configuration.distribution_config()?,
        store.clone(),
    ));
    distribution.watch_store();
    handles.push(distribution.start(shutdown.subscribe())?);

    let addr = configuration.xds_address()?;
    let server = distribution.clone();
    let grpc_shutdown = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        if let Err(e) = grpc::serve(server, addr, grpc_shutdown).await {
            error!(addr = %addr, error = %e, "Discovery gRPC server failed");
        }
    }));

    info!(
        xds_addr = %addr,
        root_namespace = %configuration.root_namespace(),
        "Mesh engine started"
    );

    Ok(Mesh {
        store,
        patches,
        reconciler,
        vip,
        distribution,
        _leader: leader,
        handles,
    })
}
