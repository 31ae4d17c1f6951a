//! Gateway binding

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ServicePort;

/// Gateway specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySpec {
    /// Labels selecting the gateway workloads
    pub selector: BTreeMap<String, String>,
    /// Listeners exposed by the gateway
    pub servers: Vec<GatewayServer>,
}

/// Gateway server (listener) definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayServer {
    /// Port the gateway listens on; its name carries the protocol tag
    pub port: ServicePort,
    /// Service hosts exposed through this server, optionally `namespace/host`
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl GatewayServer {
    /// Exposed hosts with any namespace qualifier stripped
    pub fn service_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .map(|host| host.rsplit_once('/').map_or(host.as_str(), |(_, h)| h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_hosts_strip_namespace() {
        let server = GatewayServer {
            port: ServicePort::new(20880, "tcp-dubbo"),
            hosts: vec!["ns1/svc.ns1".to_string(), "other.ns2".to_string()],
        };

        let hosts: Vec<&str> = server.service_hosts().collect();
        assert_eq!(hosts, vec!["svc.ns1", "other.ns2"]);
    }
}
