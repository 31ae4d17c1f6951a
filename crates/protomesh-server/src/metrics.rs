// Metric descriptions and the Prometheus exporter

use std::net::{Ipv4Addr, SocketAddr};

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Describe every metric the engine records
/// Should be called once at application startup
pub fn init_metrics() {
    // Reconciler
    describe_counter!(
        "protomesh_reconcile_cycles_total",
        "Reconcile cycles by result"
    );
    describe_counter!(
        "protomesh_reconcile_retries_total",
        "Reconcile cycles re-queued after a failure"
    );
    describe_counter!(
        "protomesh_patch_apply_total",
        "Patch store writes by operation"
    );

    // Distribution
    describe_gauge!(
        "protomesh_xds_connected_nodes",
        "Proxies with an open discovery stream"
    );

    // Virtual IPs
    describe_counter!(
        "protomesh_vip_allocations_total",
        "Virtual IPs handed out"
    );
}

/// Serve `/metrics` on `port`
pub fn install_prometheus_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}
