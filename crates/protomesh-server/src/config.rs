//! Configuration management for the protomesh server
//!
//! Values are layered: `conf/application.yml`, then `PROTOMESH__`-prefixed
//! environment variables (`PROTOMESH__XDS__PORT=15012`), then command line flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment};

use protomesh_common::{DEFAULT_ROOT_NAMESPACE, local_ip};
use protomesh_mesh::debounce::DebounceConfig;
use protomesh_mesh::generator::MeshSettings;
use protomesh_mesh::reconciler::ReconcilerConfig;
use protomesh_mesh::server::{DistributionConfig, SnapshotScope};
use protomesh_mesh::vip::ExhaustionPolicy;

use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";
pub const DEFAULT_XDS_PORT: u16 = 15010;

const XDS_PORT_PROPERTY: &str = "protomesh.xds.port";
const RESOURCES_PROPERTY: &str = "protomesh.resources";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "protomesh-server", version, about)]
pub struct Cli {
    /// Application config file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Multi-document YAML file with the initial mesh resources
    #[arg(short = 'r', long = "resources", env = "PROTOMESH_RESOURCES")]
    pub resources: Option<PathBuf>,
    /// Port of the aggregated discovery gRPC server
    #[arg(long = "xds-port")]
    pub xds_port: Option<u16>,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(config::File::from(cli.config.as_path()).required(false))
            .add_source(
                Environment::with_prefix("PROTOMESH")
                    .separator("__")
                    .keep_prefix(true)
                    .try_parsing(true),
            );

        if let Some(port) = cli.xds_port {
            builder = builder.set_override(XDS_PORT_PROPERTY, i64::from(port))?;
        }
        if let Some(path) = &cli.resources {
            builder = builder.set_override(RESOURCES_PROPERTY, path.display().to_string())?;
        }

        let config = builder
            .build()
            .with_context(|| format!("failed to load {}", cli.config.display()))?;
        Ok(Configuration { config })
    }

    // ========================================================================
    // Mesh
    // ========================================================================

    pub fn root_namespace(&self) -> String {
        self.config
            .get_string("protomesh.mesh.root_namespace")
            .unwrap_or(DEFAULT_ROOT_NAMESPACE.to_string())
    }

    pub fn default_namespace(&self) -> String {
        self.config
            .get_string("protomesh.mesh.default_namespace")
            .unwrap_or(self.root_namespace())
    }

    pub fn mesh_settings(&self) -> MeshSettings {
        MeshSettings {
            root_namespace: self.root_namespace(),
            default_namespace: self.default_namespace(),
        }
    }

    pub fn resources_file(&self) -> Option<PathBuf> {
        self.config.get_string(RESOURCES_PROPERTY).ok().map(PathBuf::from)
    }

    // ========================================================================
    // Reconciler
    // ========================================================================

    pub fn debounce(&self) -> DebounceConfig {
        let quiet_period = self
            .config
            .get_int("protomesh.reconcile.debounce_ms")
            .unwrap_or(1000)
            .max(0) as u64;
        let max_wait = self
            .config
            .get_int("protomesh.reconcile.max_wait_ms")
            .unwrap_or(10_000)
            .max(0) as u64;
        DebounceConfig::new(
            Duration::from_millis(quiet_period),
            Duration::from_millis(max_wait),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.config
            .get_int("protomesh.reconcile.max_retries")
            .unwrap_or(3)
            .clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            debounce: self.debounce(),
            max_retries: self.max_retries(),
            mesh: self.mesh_settings(),
        }
    }

    // ========================================================================
    // Distribution
    // ========================================================================

    pub fn xds_port(&self) -> u16 {
        self.config
            .get_int(XDS_PORT_PROPERTY)
            .ok()
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_XDS_PORT)
    }

    pub fn xds_address(&self) -> anyhow::Result<SocketAddr> {
        let ip = match self.config.get_string("protomesh.xds.address") {
            Ok(ip) => ip
                .parse::<IpAddr>()
                .with_context(|| format!("invalid protomesh.xds.address '{}'", ip))?,
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(ip, self.xds_port()))
    }

    pub fn snapshot_scope(&self) -> anyhow::Result<SnapshotScope> {
        match self.config.get_string("protomesh.xds.snapshot_scope") {
            Ok(scope) => Ok(scope.parse()?),
            Err(_) => Ok(SnapshotScope::default()),
        }
    }

    /// Identifier reported to proxies, `protomesh-<local ip>` unless set
    pub fn server_id(&self) -> String {
        self.config
            .get_string("protomesh.xds.server_id")
            .unwrap_or_else(|_| format!("protomesh-{}", local_ip()))
    }

    pub fn distribution_config(&self) -> anyhow::Result<DistributionConfig> {
        Ok(DistributionConfig {
            server_id: self.server_id(),
            scope: self.snapshot_scope()?,
            debounce: self.debounce(),
            mesh: self.mesh_settings(),
        })
    }

    // ========================================================================
    // Virtual IPs
    // ========================================================================

    pub fn exhaustion_policy(&self) -> anyhow::Result<ExhaustionPolicy> {
        match self.config.get_string("protomesh.vip.exhaustion_policy") {
            Ok(policy) => Ok(policy.parse()?),
            Err(_) => Ok(ExhaustionPolicy::default()),
        }
    }

    // ========================================================================
    // Observability and lifecycle
    // ========================================================================

    /// Prometheus scrape port, `None` disables the exporter
    pub fn metrics_port(&self) -> Option<u16> {
        self.config
            .get_int("protomesh.metrics.port")
            .ok()
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(
            self.config
                .get_int("protomesh.shutdown.timeout_ms")
                .unwrap_or(5000)
                .max(0) as u64,
        )
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("protomesh.logs.path").ok(),
            self.config.get_bool("protomesh.logs.console").unwrap_or(true),
            self.config.get_bool("protomesh.logs.file").unwrap_or(true),
            self.config
                .get_string("protomesh.logs.level")
                .unwrap_or("info".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn load(yaml: &str) -> Configuration {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let cli = Cli {
            config: file.path().to_path_buf(),
            ..Default::default()
        };
        Configuration::new(&cli).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let cli = Cli {
            config: PathBuf::from("/nonexistent/application.yml"),
            ..Default::default()
        };
        let configuration = Configuration::new(&cli).unwrap();

        assert_eq!(configuration.root_namespace(), "istio-system");
        assert_eq!(configuration.default_namespace(), "istio-system");
        assert_eq!(configuration.xds_port(), DEFAULT_XDS_PORT);
        assert_eq!(configuration.max_retries(), 3);
        assert_eq!(configuration.debounce(), DebounceConfig::default());
        assert_eq!(configuration.snapshot_scope().unwrap(), SnapshotScope::Shared);
        assert_eq!(configuration.exhaustion_policy().unwrap(), ExhaustionPolicy::Wrap);
        assert_eq!(configuration.metrics_port(), None);
        assert!(configuration.resources_file().is_none());
        assert!(configuration.server_id().starts_with("protomesh-"));
    }

    #[test]
    fn test_file_values() {
        let configuration = load(
            r#"
protomesh:
  mesh:
    root_namespace: mesh-root
  reconcile:
    debounce_ms: 200
    max_wait_ms: 100
    max_retries: 5
  xds:
    port: 16010
    server_id: cp-1
    snapshot_scope: namespace
  vip:
    exhaustion_policy: fail
  metrics:
    port: 9102
"#,
        );

        assert_eq!(configuration.root_namespace(), "mesh-root");
        assert_eq!(configuration.default_namespace(), "mesh-root");
        // max_wait never undercuts the quiet period
        assert_eq!(
            configuration.debounce(),
            DebounceConfig::new(Duration::from_millis(200), Duration::from_millis(200))
        );
        assert_eq!(configuration.reconciler_config().max_retries, 5);
        assert_eq!(
            configuration.xds_address().unwrap(),
            "0.0.0.0:16010".parse::<SocketAddr>().unwrap()
        );

        let distribution = configuration.distribution_config().unwrap();
        assert_eq!(distribution.server_id, "cp-1");
        assert_eq!(distribution.scope, SnapshotScope::Namespace);
        assert_eq!(configuration.exhaustion_policy().unwrap(), ExhaustionPolicy::Fail);
        assert_eq!(configuration.metrics_port(), Some(9102));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(b"protomesh:\n  xds:\n    port: 16010\n").unwrap();
        let cli = Cli {
            config: file.path().to_path_buf(),
            resources: Some(PathBuf::from("conf/resources.yml")),
            xds_port: Some(17010),
        };
        let configuration = Configuration::new(&cli).unwrap();

        assert_eq!(configuration.xds_port(), 17010);
        assert_eq!(
            configuration.resources_file(),
            Some(PathBuf::from("conf/resources.yml"))
        );
    }

    #[test]
    fn test_invalid_enum_values_rejected() {
        let configuration = load(
            "protomesh:\n  xds:\n    snapshot_scope: global\n  vip:\n    exhaustion_policy: never\n",
        );
        assert!(configuration.snapshot_scope().is_err());
        assert!(configuration.exhaustion_policy().is_err());
    }
}
