//! Kubernetes realization of route objects
//!
//! Every route owns one Service named after the policy and the route id:
//!
//! - DirectRoute: headless Service selecting the target pod
//! - HostNetwork/HostPort: Service with the node address as external IP
//! - LoadBalancer: Service of type LoadBalancer selecting the target pod
//! - IngressTLS: ClusterIP backend Service plus a Traefik IngressRouteTCP
//!   matching the node's SNI name, and a per-datacenter TLSOption when
//!   client certificates are required
//!
//! The serialized route is stored in an annotation on the Service, which is
//! how the applied set is recovered.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta,
        Patch, PatchParams,
    },
    Client, Resource, ResourceExt,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::applier::RouteSink;
use crate::crd::{AccessMode, CassandraAccessPolicy};
use crate::error::{Error, Result};
use crate::translator::{RouteObject, ENTRY_POINT_ANNOTATION};

pub const FIELD_MANAGER: &str = "cass-access-operator";

/// Serialized RouteObject as last applied
pub const ROUTE_ANNOTATION: &str = "access.cassandra.io/route";
pub const POLICY_LABEL: &str = "access.cassandra.io/policy";
pub const ROUTE_ID_LABEL: &str = "access.cassandra.io/route-id";
pub const DATACENTER_LABEL: &str = "access.cassandra.io/datacenter";

/// Label the StatefulSet controller puts on every pod
const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

const MAX_NAME_LEN: usize = 63;
const DIGEST_LEN: usize = 8;

fn ingress_route_tcp() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "traefik.io",
        "v1alpha1",
        "IngressRouteTCP",
    ))
}

fn tls_option() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("traefik.io", "v1alpha1", "TLSOption"))
}

/// Kubernetes object name for a route of a policy
///
/// Names that would exceed a DNS label keep a truncated policy prefix plus a
/// short digest of the full policy name, so distinct policies never share an
/// object.
pub fn object_name(policy: &str, route_id: &str) -> String {
    let full = format!("{policy}-{route_id}");
    if full.len() <= MAX_NAME_LEN && !policy.is_empty() {
        return full;
    }

    let digest = hex::encode(Sha256::digest(policy.as_bytes()));
    let digest = &digest[..DIGEST_LEN];
    let budget = MAX_NAME_LEN.saturating_sub(route_id.len() + DIGEST_LEN + 2);
    let prefix: String = policy.chars().take(budget).collect();
    let prefix = prefix.trim_end_matches('-');
    let name = if prefix.is_empty() {
        format!("{digest}-{route_id}")
    } else {
        format!("{prefix}-{digest}-{route_id}")
    };
    name.chars().take(MAX_NAME_LEN).collect()
}

/// Per-datacenter TLSOption name
pub fn tls_option_name(policy: &str, datacenter: &str) -> String {
    object_name(policy, &format!("{datacenter}-mtls"))
}

/// Owner reference pointing at the policy, for garbage collection
pub fn owner_reference(policy: &CassandraAccessPolicy) -> OwnerReference {
    OwnerReference {
        api_version: CassandraAccessPolicy::api_version(&()).to_string(),
        kind: CassandraAccessPolicy::kind(&()).to_string(),
        name: policy.name_any(),
        uid: policy.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Applies routes of one policy as Kubernetes objects
pub struct KubeRouteSink {
    client: Client,
    namespace: String,
    policy: String,
    owner: Option<OwnerReference>,
}

impl KubeRouteSink {
    pub fn new(client: Client, policy: &CassandraAccessPolicy) -> Self {
        let owner = policy.metadata.uid.as_ref().map(|_| owner_reference(policy));
        Self {
            client,
            namespace: policy.namespace().unwrap_or_else(|| "default".to_string()),
            policy: policy.name_any(),
            owner,
        }
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn dynamic(&self, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, resource)
    }

    fn labels(&self, route: &RouteObject) -> BTreeMap<String, String> {
        route_labels(&self.policy, route)
    }

    fn meta(&self, name: &str, route: &RouteObject) -> Result<ObjectMeta> {
        let mut annotations = route.annotations.clone();
        annotations.insert(ROUTE_ANNOTATION.to_string(), serde_json::to_string(route)?);
        Ok(ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels(route)),
            annotations: Some(annotations),
            owner_references: self.owner.clone().map(|o| vec![o]),
            ..Default::default()
        })
    }

    async fn apply_ingress(&self, name: &str, route: &RouteObject) -> Result<()> {
        let binding = route.tls_binding.as_ref().ok_or_else(|| {
            Error::ValidationError(format!("IngressTLS route {} has no TLS binding", route.id))
        })?;
        let sni = route.sni_hostname.as_deref().ok_or_else(|| {
            Error::ValidationError(format!("IngressTLS route {} has no SNI hostname", route.id))
        })?;
        let entry_point = route
            .annotations
            .get(ENTRY_POINT_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| "cassandra".to_string());

        let mut tls = json!({ "secretName": binding.secret_name });
        if binding.mutual_required {
            let option = tls_option_name(&self.policy, &route.datacenter);
            self.apply_tls_option(&option, route, &binding.secret_name)
                .await?;
            tls["options"] = json!({ "name": option, "namespace": self.namespace });
        }

        let resource = ingress_route_tcp();
        let mut obj = DynamicObject::new(name, &resource)
            .within(&self.namespace)
            .data(json!({
                "spec": {
                    "entryPoints": [entry_point],
                    "routes": [{
                        "match": format!("HostSNI(`{sni}`)"),
                        "services": [{ "name": name, "port": route.backend_port }]
                    }],
                    "tls": tls
                }
            }));
        obj.metadata = self.meta(name, route)?;

        self.dynamic(&resource)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;
        Ok(())
    }

    async fn apply_tls_option(&self, name: &str, route: &RouteObject, secret: &str) -> Result<()> {
        let resource = tls_option();
        let mut obj = DynamicObject::new(name, &resource)
            .within(&self.namespace)
            .data(json!({
                "spec": {
                    "minVersion": "VersionTLS12",
                    "clientAuth": {
                        "secretNames": [secret],
                        "clientAuthType": "RequireAndVerifyClientCert"
                    }
                }
            }));
        let mut labels = BTreeMap::new();
        labels.insert(POLICY_LABEL.to_string(), self.policy.clone());
        labels.insert(DATACENTER_LABEL.to_string(), route.datacenter.clone());
        obj.metadata.labels = Some(labels);
        obj.metadata.owner_references = self.owner.clone().map(|o| vec![o]);

        self.dynamic(&resource)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;
        debug!("Ensured TLSOption {}/{}", self.namespace, name);
        Ok(())
    }

    async fn delete_ignoring_missing(&self, api: &Api<DynamicObject>, kind: &str, name: &str) -> Result<()> {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted {} {}/{}", kind, self.namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("{} {} already gone", kind, name);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

pub fn route_labels(policy: &str, route: &RouteObject) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels.insert(POLICY_LABEL.to_string(), policy.to_string());
    labels.insert(ROUTE_ID_LABEL.to_string(), route.id.clone());
    labels.insert(DATACENTER_LABEL.to_string(), route.datacenter.clone());
    labels
}

/// Service realizing a route; for IngressTLS this is the ingress backend
pub fn build_service(route: &RouteObject, meta: ObjectMeta) -> Service {
    let mut selector = BTreeMap::new();
    selector.insert(POD_NAME_LABEL.to_string(), route.target_pod.clone());

    let (port, cluster_ip, type_, external_ips) = match route.mode {
        AccessMode::DirectRoute => (route.backend_port, Some("None".to_string()), None, None),
        AccessMode::HostNetwork | AccessMode::HostPort => (
            route.external_endpoint.port,
            None,
            None,
            Some(vec![route.external_endpoint.host.clone()]),
        ),
        AccessMode::LoadBalancer => (
            route.external_endpoint.port,
            None,
            Some("LoadBalancer".to_string()),
            None,
        ),
        AccessMode::IngressTls => (route.backend_port, None, None, None),
    };

    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            type_,
            cluster_ip,
            external_ips,
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("cql".to_string()),
                port,
                target_port: Some(IntOrString::Int(route.backend_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Route stored on a Service, if any
pub fn route_from_service(service: &Service) -> Option<RouteObject> {
    let raw = service.annotations().get(ROUTE_ANNOTATION)?;
    match serde_json::from_str(raw) {
        Ok(route) => Some(route),
        Err(e) => {
            warn!(
                "Ignoring unreadable route annotation on Service {}: {}",
                service.name_any(),
                e
            );
            None
        }
    }
}

/// Whether a Service is serving its route
pub fn service_is_serving(service: &Service, mode: AccessMode) -> bool {
    match mode {
        AccessMode::LoadBalancer => service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| !ingress.is_empty())
            .unwrap_or(false),
        _ => service.metadata.deletion_timestamp.is_none(),
    }
}

#[async_trait]
impl RouteSink for KubeRouteSink {
    async fn apply(&self, route: &RouteObject) -> Result<()> {
        let name = object_name(&self.policy, &route.id);
        let service = build_service(route, self.meta(&name, route)?);

        self.services()
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&service),
            )
            .await?;

        if route.mode == AccessMode::IngressTls {
            self.apply_ingress(&name, route).await?;
        }

        debug!("Applied route {} as {}/{}", route.id, self.namespace, name);
        Ok(())
    }

    async fn confirm(&self, id: &str) -> Result<bool> {
        let name = object_name(&self.policy, id);
        let Some(service) = self.services().get_opt(&name).await? else {
            return Ok(false);
        };
        let Some(route) = route_from_service(&service) else {
            return Ok(false);
        };
        if !service_is_serving(&service, route.mode) {
            return Ok(false);
        }
        if route.mode == AccessMode::IngressTls {
            return Ok(self
                .dynamic(&ingress_route_tcp())
                .get_opt(&name)
                .await?
                .is_some());
        }
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let name = object_name(&self.policy, id);
        if id.starts_with(AccessMode::IngressTls.slug()) {
            self.delete_ignoring_missing(&self.dynamic(&ingress_route_tcp()), "IngressRouteTCP", &name)
                .await?;
        }
        match self.services().delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted Service {}/{}", self.namespace, name),
            Err(kube::Error::Api(e)) if e.code == 404 => debug!("Service {} already gone", name),
            Err(e) => return Err(Error::KubeError(e)),
        }
        Ok(())
    }

    async fn list_applied(&self) -> Result<Vec<RouteObject>> {
        let selector = format!("{}={}", POLICY_LABEL, self.policy);
        let services = self
            .services()
            .list(&ListParams::default().labels(&selector))
            .await?;

        let mut routes: Vec<RouteObject> = services
            .items
            .iter()
            .filter(|s| s.metadata.deletion_timestamp.is_none())
            .filter_map(route_from_service)
            .collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::{route_id, ExternalEndpoint};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
    use uuid::Uuid;

    fn route(mode: AccessMode) -> RouteObject {
        let host_id = Uuid::parse_str("b8f2960c-1b2f-4d6e-9a3c-5e7f1d2c3b4a").unwrap();
        RouteObject {
            id: route_id(mode, &host_id),
            mode,
            target_host_id: host_id,
            target_pod: "demo-dc1-r1-sts-0".to_string(),
            datacenter: "dc1".to_string(),
            external_endpoint: ExternalEndpoint {
                host: "192.168.1.10".to_string(),
                port: 30001,
            },
            backend_port: 9042,
            sni_hostname: None,
            tls_binding: None,
            tls_required: false,
            annotations: BTreeMap::new(),
        }
    }

    fn meta_with_route(route: &RouteObject) -> ObjectMeta {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ROUTE_ANNOTATION.to_string(),
            serde_json::to_string(route).unwrap(),
        );
        ObjectMeta {
            name: Some(object_name("demo-external", &route.id)),
            annotations: Some(annotations),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_name_fits_dns_label() {
        let id = route_id(AccessMode::HostPort, &Uuid::from_u128(7));
        let name = object_name("a-very-long-policy-name-that-goes-on-and-on", &id);
        assert!(name.len() <= 63);
        assert!(name.ends_with(&id));
        assert!(!name.contains("--"));

        assert_eq!(
            object_name("demo", "direct-x"),
            "demo-direct-x".to_string()
        );
    }

    #[test]
    fn test_truncated_names_stay_distinct_per_policy() {
        let id = route_id(AccessMode::HostPort, &Uuid::from_u128(7));
        let east = object_name("cassandra-external-east", &id);
        let west = object_name("cassandra-external-west", &id);

        assert_ne!(east, west);
        for name in [&east, &west] {
            assert!(name.len() <= 63);
            assert!(name.ends_with(&id));
            assert!(name.starts_with("cassandr"));
        }
        // stable across calls
        assert_eq!(object_name("cassandra-external-east", &id), east);
    }

    #[test]
    fn test_host_port_service_uses_external_ip() {
        let r = route(AccessMode::HostPort);
        let svc = build_service(&r, meta_with_route(&r));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.external_ips, Some(vec!["192.168.1.10".to_string()]));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 30001);
        assert_eq!(port.target_port, Some(IntOrString::Int(9042)));
        assert_eq!(
            spec.selector.unwrap().get(POD_NAME_LABEL).map(String::as_str),
            Some("demo-dc1-r1-sts-0")
        );
    }

    #[test]
    fn test_direct_route_service_is_headless() {
        let r = route(AccessMode::DirectRoute);
        let spec = build_service(&r, meta_with_route(&r)).spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert!(spec.external_ips.is_none());
    }

    #[test]
    fn test_route_recovered_from_annotation() {
        let r = route(AccessMode::LoadBalancer);
        let svc = build_service(&r, meta_with_route(&r));
        assert_eq!(route_from_service(&svc), Some(r));

        let bare = Service::default();
        assert!(route_from_service(&bare).is_none());
    }

    #[test]
    fn test_load_balancer_serves_once_address_assigned() {
        let r = route(AccessMode::LoadBalancer);
        let mut svc = build_service(&r, meta_with_route(&r));
        assert!(!service_is_serving(&svc, AccessMode::LoadBalancer));

        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.7".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert!(service_is_serving(&svc, AccessMode::LoadBalancer));
    }

    #[test]
    fn test_labels_select_policy() {
        let r = route(AccessMode::DirectRoute);
        let labels = route_labels("demo-external", &r);
        assert_eq!(labels[POLICY_LABEL], "demo-external");
        assert_eq!(labels[ROUTE_ID_LABEL], r.id);
        assert_eq!(labels[DATACENTER_LABEL], "dc1");
    }
}
