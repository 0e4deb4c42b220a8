//! Response bodies

use serde::{Deserialize, Serialize};

use crate::crd::{AccessMode, CassandraAccessPolicy, CassandraAccessPolicyStatus};
use kube::ResourceExt;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica currently holds the leader lease
    pub leader: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub mode: AccessMode,
    pub phase: String,
    pub active_routes: i32,
    pub topology_degraded: bool,
}

impl From<&CassandraAccessPolicy> for PolicySummary {
    fn from(p: &CassandraAccessPolicy) -> Self {
        let status = p.status.as_ref();
        Self {
            name: p.name_any(),
            namespace: p.namespace().unwrap_or_default(),
            cluster_name: p.spec.cluster_name.clone(),
            mode: p.spec.mode,
            phase: status
                .map(|s| s.phase.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            active_routes: status.map(|s| s.active_routes).unwrap_or(0),
            topology_degraded: status.map(|s| s.topology_degraded).unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyListResponse {
    pub items: Vec<PolicySummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDetailResponse {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub mode: AccessMode,
    pub datacenter: Option<String>,
    pub status: CassandraAccessPolicyStatus,
    /// Deletion requested and routes still being removed
    pub cleanup_pending: bool,
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub name: String,
    pub namespace: String,
    pub requested_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
