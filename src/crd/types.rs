//! Shared types for the CassandraAccessPolicy CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How Cassandra nodes are exposed to clients outside the Kubernetes cluster
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum AccessMode {
    /// Pod IPs are routable from outside; routes pass the pod address through
    #[default]
    DirectRoute,
    /// Cassandra pods run with hostNetwork, one node per worker host
    HostNetwork,
    /// Cassandra pods bind a hostPort, one node per worker host
    HostPort,
    /// One LoadBalancer Service per node
    LoadBalancer,
    /// A shared ingress endpoint routing by TLS SNI to each node
    #[serde(rename = "IngressTLS")]
    IngressTls,
}

impl AccessMode {
    /// Stable lowercase slug used in route ids and resource names
    pub fn slug(&self) -> &'static str {
        match self {
            AccessMode::DirectRoute => "direct",
            AccessMode::HostNetwork => "hostnet",
            AccessMode::HostPort => "hostport",
            AccessMode::LoadBalancer => "lb",
            AccessMode::IngressTls => "sni",
        }
    }

    /// Modes that bind a port on the worker host and therefore allow one node per host
    pub fn is_host_level(&self) -> bool {
        matches!(self, AccessMode::HostNetwork | AccessMode::HostPort)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessMode::DirectRoute => "DirectRoute",
            AccessMode::HostNetwork => "HostNetwork",
            AccessMode::HostPort => "HostPort",
            AccessMode::LoadBalancer => "LoadBalancer",
            AccessMode::IngressTls => "IngressTLS",
        };
        write!(f, "{s}")
    }
}

/// Shared ingress endpoint configuration for IngressTLS mode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTlsConfig {
    /// Externally resolvable host name of the ingress controller
    pub host: String,

    /// Port the ingress controller listens on for CQL over TLS (default: 9142)
    #[serde(default = "default_ingress_port")]
    pub port: i32,

    /// DNS suffix used to build per-node SNI host names
    pub sni_domain: String,

    /// Traefik entry point name the TCP routes attach to
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Secret holding `tls.crt` / `ca.crt` for the ingress certificate
    pub tls_secret_name: String,

    /// Per-datacenter overrides of `tlsSecretName`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datacenter_secrets: BTreeMap<String, String>,
}

impl IngressTlsConfig {
    /// Secret that backs the TLS binding of the given datacenter
    pub fn secret_for(&self, datacenter: &str) -> &str {
        self.datacenter_secrets
            .get(datacenter)
            .map(String::as_str)
            .unwrap_or(&self.tls_secret_name)
    }
}

fn default_ingress_port() -> i32 {
    9142
}

fn default_entry_point() -> String {
    "cassandra".to_string()
}

/// Condition for status reporting, following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Per-route status entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub id: String,
    #[serde(default)]
    pub mode: AccessMode,
    pub host_id: String,
    pub datacenter: String,
    /// `host:port` clients connect to
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni_hostname: Option<String>,
    /// Lifecycle phase (Pending, Applying, Active, Superseded, Removing, Gone, Failed)
    pub phase: String,
}

/// TLS binding status per datacenter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsBindingStatus {
    pub datacenter: String,
    pub secret_name: String,
    pub ca_fingerprint: String,
    /// RFC3339 expiry of the serving certificate
    pub cert_expiry: String,
}
