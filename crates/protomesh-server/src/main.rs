use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use protomesh_mesh::store::MemoryConfigStore;
use protomesh_server::bootstrap::load_resources;
use protomesh_server::logging::init_logging;
use protomesh_server::metrics::{init_metrics, install_prometheus_exporter};
use protomesh_server::shutdown::shutdown_on_signals;
use protomesh_server::{Cli, Configuration, ShutdownSignal, start_mesh};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = Configuration::new(&cli)?;

    let _logging_guard = init_logging(&configuration.logging_config())?;

    init_metrics();
    if let Some(port) = configuration.metrics_port() {
        install_prometheus_exporter(port)?;
    }

    let store = Arc::new(MemoryConfigStore::new());
    match configuration.resources_file() {
        Some(path) => {
            load_resources(&path, &store)?;
        }
        None => warn!("No resource file configured, starting with an empty config store"),
    }

    let shutdown = ShutdownSignal::new();
    let mut stop = shutdown.subscribe();
    shutdown_on_signals(&shutdown);

    let mesh = start_mesh(&configuration, store, &shutdown)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Protomesh server started");

    let _ = stop.recv().await;
    mesh.stopped(configuration.shutdown_timeout()).await;

    info!("Protomesh server stopped");
    Ok(())
}
