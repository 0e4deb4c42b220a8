//! Topology source backed by the Kubernetes API
//!
//! Node placement comes from the labels cass-operator puts on Cassandra pods;
//! host IDs come from the `CassandraDatacenter` status, which is where
//! cass-operator records them once a node has joined the ring.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams},
    Client, ResourceExt,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{NodeIdentity, ReadyState, TopologySource};
use crate::error::Result;

pub const CLUSTER_LABEL: &str = "cassandra.datastax.com/cluster";
pub const DATACENTER_LABEL: &str = "cassandra.datastax.com/datacenter";
pub const RACK_LABEL: &str = "cassandra.datastax.com/rack";
pub const NODE_STATE_LABEL: &str = "cassandra.datastax.com/node-state";

/// Reads Cassandra pods and datacenter status for one cluster
pub struct KubeTopologySource {
    client: Client,
    namespace: String,
    cluster_name: String,
    datacenter: Option<String>,
}

impl KubeTopologySource {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        cluster_name: impl Into<String>,
        datacenter: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            cluster_name: cluster_name.into(),
            datacenter,
        }
    }

    fn label_selector(&self) -> String {
        let mut selector = format!("{}={}", CLUSTER_LABEL, self.cluster_name);
        if let Some(dc) = &self.datacenter {
            selector.push_str(&format!(",{}={}", DATACENTER_LABEL, dc));
        }
        selector
    }

    /// Map of pod name to host ID across all datacenters of the cluster
    async fn host_ids(&self) -> Result<BTreeMap<String, Uuid>> {
        let gvk = GroupVersionKind::gvk("cassandra.datastax.com", "v1beta1", "CassandraDatacenter");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);

        let dcs = api.list(&ListParams::default()).await?;
        let mut ids = BTreeMap::new();
        for dc in dcs.items {
            let cluster = dc
                .data
                .pointer("/spec/clusterName")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if cluster != self.cluster_name {
                continue;
            }
            ids.extend(host_ids_from_status(&dc.data));
        }
        Ok(ids)
    }
}

#[async_trait]
impl TopologySource for KubeTopologySource {
    #[instrument(skip(self), fields(cluster = %self.cluster_name, namespace = %self.namespace))]
    async fn read(&self) -> Result<Vec<NodeIdentity>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&self.label_selector()))
            .await?;
        let host_ids = self.host_ids().await?;

        let nodes: Vec<NodeIdentity> = list
            .items
            .iter()
            .filter_map(|pod| node_from_pod(pod, &host_ids))
            .collect();

        debug!(
            "Read {} Cassandra nodes ({} pods) for cluster {}",
            nodes.len(),
            list.items.len(),
            self.cluster_name
        );
        Ok(nodes)
    }
}

/// Extract `status.nodeStatuses.<pod>.hostID` entries
pub(crate) fn host_ids_from_status(data: &serde_json::Value) -> BTreeMap<String, Uuid> {
    let mut ids = BTreeMap::new();
    let Some(statuses) = data
        .pointer("/status/nodeStatuses")
        .and_then(|v| v.as_object())
    else {
        return ids;
    };

    for (pod_name, status) in statuses {
        let Some(raw) = status.get("hostID").and_then(|v| v.as_str()) else {
            continue;
        };
        match Uuid::parse_str(raw) {
            Ok(id) => {
                ids.insert(pod_name.clone(), id);
            }
            Err(e) => warn!("Ignoring malformed host ID {:?} for pod {}: {}", raw, pod_name, e),
        }
    }
    ids
}

/// Build a node identity from a pod, or None when the pod has not joined yet
pub(crate) fn node_from_pod(pod: &Pod, host_ids: &BTreeMap<String, Uuid>) -> Option<NodeIdentity> {
    let name = pod.name_any();
    let host_id = *host_ids.get(&name)?;
    let labels = pod.labels();
    let status = pod.status.as_ref();

    Some(NodeIdentity {
        host_id,
        pod_name: name,
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        host_address: status.and_then(|s| s.host_ip.clone()),
        rack: labels.get(RACK_LABEL).cloned().unwrap_or_default(),
        datacenter: labels.get(DATACENTER_LABEL).cloned().unwrap_or_default(),
        ready_state: classify_pod(pod),
    })
}

/// Derive readiness from cass-operator's node-state label and the pod Ready condition
pub(crate) fn classify_pod(pod: &Pod) -> ReadyState {
    if pod.metadata.deletion_timestamp.is_some() {
        return ReadyState::Down;
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");
    if matches!(phase, "Failed" | "Unknown" | "Succeeded") {
        return ReadyState::Down;
    }

    let pod_ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    match pod.labels().get(NODE_STATE_LABEL).map(String::as_str) {
        Some("Decommissioning") => ReadyState::Decommissioning,
        Some("Start-Failed") => ReadyState::Down,
        Some("Started") if pod_ready => ReadyState::Ready,
        Some("Started") => ReadyState::Down,
        _ => ReadyState::Starting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    const HOST_ID: &str = "b8f2960c-1b2f-4d6e-9a3c-5e7f1d2c3b4a";

    fn cassandra_pod(name: &str, node_state: Option<&str>, ready: bool) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), "demo".to_string());
        labels.insert(DATACENTER_LABEL.to_string(), "dc1".to_string());
        labels.insert(RACK_LABEL.to_string(), "r1".to_string());
        if let Some(state) = node_state {
            labels.insert(NODE_STATE_LABEL.to_string(), state.to_string());
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("cass".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.42.0.29".to_string()),
                host_ip: Some("192.168.1.10".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_started_and_ready_pod_is_ready() {
        let pod = cassandra_pod("demo-dc1-r1-sts-0", Some("Started"), true);
        assert_eq!(classify_pod(&pod), ReadyState::Ready);
    }

    #[test]
    fn test_started_but_not_ready_pod_is_down() {
        let pod = cassandra_pod("demo-dc1-r1-sts-0", Some("Started"), false);
        assert_eq!(classify_pod(&pod), ReadyState::Down);
    }

    #[test]
    fn test_node_state_labels() {
        let pod = cassandra_pod("p", Some("Decommissioning"), true);
        assert_eq!(classify_pod(&pod), ReadyState::Decommissioning);

        let pod = cassandra_pod("p", Some("Ready-to-Start"), false);
        assert_eq!(classify_pod(&pod), ReadyState::Starting);

        let pod = cassandra_pod("p", None, true);
        assert_eq!(classify_pod(&pod), ReadyState::Starting);

        let pod = cassandra_pod("p", Some("Start-Failed"), false);
        assert_eq!(classify_pod(&pod), ReadyState::Down);
    }

    #[test]
    fn test_terminating_pod_is_down() {
        let mut pod = cassandra_pod("p", Some("Started"), true);
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(classify_pod(&pod), ReadyState::Down);
    }

    #[test]
    fn test_pod_without_host_id_is_skipped() {
        let pod = cassandra_pod("demo-dc1-r1-sts-0", Some("Starting"), false);
        assert!(node_from_pod(&pod, &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_node_from_pod() {
        let pod = cassandra_pod("demo-dc1-r1-sts-0", Some("Started"), true);
        let mut ids = BTreeMap::new();
        ids.insert(
            "demo-dc1-r1-sts-0".to_string(),
            Uuid::parse_str(HOST_ID).unwrap(),
        );

        let node = node_from_pod(&pod, &ids).unwrap();
        assert_eq!(node.host_id.to_string(), HOST_ID);
        assert_eq!(node.pod_ip, "10.42.0.29");
        assert_eq!(node.host_address.as_deref(), Some("192.168.1.10"));
        assert_eq!(node.rack, "r1");
        assert_eq!(node.datacenter, "dc1");
        assert!(node.is_ready());
    }

    #[test]
    fn test_host_ids_from_status() {
        let data = serde_json::json!({
            "spec": { "clusterName": "demo" },
            "status": {
                "nodeStatuses": {
                    "demo-dc1-r1-sts-0": { "hostID": HOST_ID },
                    "demo-dc1-r2-sts-0": { "hostID": "not-a-uuid" },
                    "demo-dc1-r3-sts-0": {}
                }
            }
        });

        let ids = host_ids_from_status(&data);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids["demo-dc1-r1-sts-0"].to_string(), HOST_ID);
    }

    #[test]
    fn test_host_ids_from_status_without_status() {
        let data = serde_json::json!({ "spec": { "clusterName": "demo" } });
        assert!(host_ids_from_status(&data).is_empty());
    }
}
