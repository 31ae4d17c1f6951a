//! Service descriptor

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// ServiceEntry specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceEntrySpec {
    /// Hosts associated with the service; only the first is used
    pub hosts: Vec<String>,
    /// Addresses (virtual IPs) for the service
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    /// Ports exposed by the service
    pub ports: Vec<ServicePort>,
    /// Workloads backing the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<WorkloadSelector>,
    /// Export configuration
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,
}

impl ServiceEntrySpec {
    /// The host routing is built for
    pub fn primary_host(&self) -> Option<&str> {
        self.hosts.first().map(String::as_str)
    }

    /// First address, used as the outbound listener address
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .map(String::as_str)
            .find(|addr| !addr.is_empty())
    }

    pub fn port(&self, number: u32) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.number == number)
    }
}

/// Service port definition
///
/// The port name encodes the protocol tag: `<transport>-<protocol>[-<suffix>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port number
    pub number: u32,
    /// Port name
    pub name: String,
    /// Target port on the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u32>,
}

impl ServicePort {
    pub fn new(number: u32, name: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            target_port: None,
        }
    }
}

/// Label selector for the workloads of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSelector {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
