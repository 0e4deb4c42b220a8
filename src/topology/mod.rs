//! Topology snapshot reading
//!
//! A snapshot is the ordered set of Cassandra node identities observed at one
//! instant. Snapshots are immutable once read; a reconciliation pass never
//! re-reads topology mid-pass.

mod kube_source;
mod snapshot;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use kube_source::{
    KubeTopologySource, CLUSTER_LABEL, DATACENTER_LABEL, NODE_STATE_LABEL, RACK_LABEL,
};
pub use snapshot::{SnapshotReader, SnapshotReaderConfig};

/// Readiness of a Cassandra node as reported by the orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadyState {
    Starting,
    Ready,
    Decommissioning,
    Down,
}

/// Identity and placement of one Cassandra node
///
/// `host_id` is the stable key; the pod IP changes across rescheduling.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub host_id: Uuid,
    pub pod_name: String,
    pub pod_ip: String,
    /// Address of the worker host the pod runs on
    pub host_address: Option<String>,
    pub rack: String,
    pub datacenter: String,
    pub ready_state: ReadyState,
}

impl NodeIdentity {
    pub fn is_ready(&self) -> bool {
        self.ready_state == ReadyState::Ready
    }
}

/// A point-in-time view of cluster topology
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeIdentity>,
    pub observed_at: DateTime<Utc>,
    /// Served from the last-known-good copy after repeated read failures
    pub degraded: bool,
}

impl TopologySnapshot {
    pub fn new(mut nodes: Vec<NodeIdentity>, observed_at: DateTime<Utc>) -> Self {
        sort_nodes(&mut nodes);
        Self {
            nodes,
            observed_at,
            degraded: false,
        }
    }

    pub fn contains(&self, host_id: &Uuid) -> bool {
        self.nodes.iter().any(|n| &n.host_id == host_id)
    }

    pub fn node(&self, host_id: &Uuid) -> Option<&NodeIdentity> {
        self.nodes.iter().find(|n| &n.host_id == host_id)
    }

    pub fn ready_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_ready()).count()
    }
}

/// Canonical snapshot order: datacenter, rack, host id
pub fn sort_nodes(nodes: &mut [NodeIdentity]) {
    nodes.sort_by(|a, b| {
        (&a.datacenter, &a.rack, a.host_id).cmp(&(&b.datacenter, &b.rack, b.host_id))
    });
}

/// Read-only access to the orchestrator's view of cluster nodes
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Return every known node of the cluster, in any order
    async fn read(&self) -> Result<Vec<NodeIdentity>>;
}

/// Read a source once, bounded by `timeout`
pub async fn read_with_timeout(
    source: &dyn TopologySource,
    timeout: Duration,
) -> Result<TopologySnapshot> {
    match tokio::time::timeout(timeout, source.read()).await {
        Ok(Ok(nodes)) => Ok(TopologySnapshot::new(nodes, Utc::now())),
        Ok(Err(e)) => Err(crate::Error::SourceUnavailable {
            reason: e.to_string(),
        }),
        Err(_) => Err(crate::Error::SourceUnavailable {
            reason: format!("no response within {timeout:?}"),
        }),
    }
}
