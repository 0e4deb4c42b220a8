//! Route objects: one concrete external-access binding per node

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crd::AccessMode;
use crate::tls::TlsMaterialRef;

/// Address clients connect to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalEndpoint {
    pub host: String,
    pub port: i32,
}

impl std::fmt::Display for ExternalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A desired or applied route for one Cassandra node
///
/// `target_host_id` is a lookup key into the topology snapshot, not an owning
/// reference. Routes with equal ids describe the same logical binding; two
/// routes with the same target host but different ids are a replacement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteObject {
    pub id: String,
    pub mode: AccessMode,
    pub target_host_id: Uuid,
    pub target_pod: String,
    pub datacenter: String,
    pub external_endpoint: ExternalEndpoint,
    /// Port the Cassandra pod listens on
    pub backend_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_binding: Option<TlsMaterialRef>,
    pub tls_required: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Route id for a node under a mode; keyed by host ID, never by IP
pub fn route_id(mode: AccessMode, host_id: &Uuid) -> String {
    format!("{}-{}", mode.slug(), host_id.as_hyphenated())
}

/// SNI host name the ingress matches for a node
pub fn sni_hostname(host_id: &Uuid, sni_domain: &str) -> String {
    format!(
        "{}.{}",
        host_id.as_hyphenated(),
        sni_domain.trim_start_matches('.').trim_end_matches('.')
    )
}
