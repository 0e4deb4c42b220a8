//! Route spec translation
//!
//! `translate` is a pure function of the policy, the topology and the TLS
//! bindings: the same inputs always produce the same route set, sorted by id.
//! The reconciler's diff relies on this.

mod route;


use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;
use uuid::Uuid;

use crate::crd::{AccessMode, CassandraAccessPolicySpec};
use crate::error::{Error, Result};
use crate::tls::TlsMaterialRef;
use crate::topology::NodeIdentity;

pub use route::{route_id, sni_hostname, ExternalEndpoint, RouteObject};

/// The access policy a pass translates against
pub type AccessPolicy = CassandraAccessPolicySpec;

/// One TLS binding per datacenter
pub type TlsBindings = BTreeMap<String, TlsMaterialRef>;

/// Annotation carrying translator warnings onto applied objects
pub const WARNING_ANNOTATION: &str = "access.cassandra.io/warning";

/// Annotation naming the ingress entry point an IngressTLS route attaches to
pub const ENTRY_POINT_ANNOTATION: &str = "access.cassandra.io/entry-point";

pub const TOKEN_AWARE_WARNING: &str =
    "token-aware routing must be disabled in clients: the load balancer hides node identity";

/// Compute the desired route set
pub fn translate(
    policy: &AccessPolicy,
    nodes: &[NodeIdentity],
    tls: &TlsBindings,
) -> Result<Vec<RouteObject>> {
    let eligible: Vec<&NodeIdentity> = nodes
        .iter()
        .filter(|n| n.is_ready())
        .filter(|n| {
            policy
                .datacenter
                .as_ref()
                .map(|dc| &n.datacenter == dc)
                .unwrap_or(true)
        })
        .collect();

    let mut routes = match policy.mode {
        AccessMode::DirectRoute => eligible
            .iter()
            .map(|n| direct_route(policy, n))
            .collect::<Result<Vec<_>>>()?,
        AccessMode::HostNetwork | AccessMode::HostPort => host_routes(policy, nodes, &eligible)?,
        AccessMode::LoadBalancer => {
            if policy.tls_required {
                warn!("tlsRequired is ignored for LoadBalancer mode; recording tlsRequired=false");
            }
            eligible
                .iter()
                .map(|n| load_balancer_route(policy, n))
                .collect()
        }
        AccessMode::IngressTls => eligible
            .iter()
            .map(|n| ingress_route(policy, n, tls))
            .collect::<Result<Vec<_>>>()?,
    };

    routes.sort_by(|a, b| a.id.cmp(&b.id));
    verify_shared_material(&routes)?;
    Ok(routes)
}

fn base_route(policy: &AccessPolicy, node: &NodeIdentity, endpoint: ExternalEndpoint) -> RouteObject {
    RouteObject {
        id: route_id(policy.mode, &node.host_id),
        mode: policy.mode,
        target_host_id: node.host_id,
        target_pod: node.pod_name.clone(),
        datacenter: node.datacenter.clone(),
        external_endpoint: endpoint,
        backend_port: policy.native_port,
        sni_hostname: None,
        tls_binding: None,
        tls_required: policy.tls_required,
        annotations: BTreeMap::new(),
    }
}

fn direct_route(policy: &AccessPolicy, node: &NodeIdentity) -> Result<RouteObject> {
    if node.pod_ip.is_empty() {
        return Err(unsupported(
            policy.mode,
            format!("node {} ({}) has no pod IP", node.host_id, node.pod_name),
        ));
    }
    Ok(base_route(
        policy,
        node,
        ExternalEndpoint {
            host: node.pod_ip.clone(),
            port: policy.native_port,
        },
    ))
}

/// HostNetwork/HostPort: one node per host, port offset by rack ordinal
fn host_routes(
    policy: &AccessPolicy,
    all_nodes: &[NodeIdentity],
    eligible: &[&NodeIdentity],
) -> Result<Vec<RouteObject>> {
    let mut by_host: BTreeMap<&str, &NodeIdentity> = BTreeMap::new();
    for node in eligible.iter().copied() {
        let Some(host) = node.host_address.as_deref().filter(|h| !h.is_empty()) else {
            return Err(unsupported(
                policy.mode,
                format!("node {} ({}) has no host address", node.host_id, node.pod_name),
            ));
        };
        if let Some(other) = by_host.insert(host, node) {
            return Err(unsupported(
                policy.mode,
                format!(
                    "nodes {} and {} both run on host {}",
                    other.host_id, node.host_id, host
                ),
            ));
        }
    }

    let ordinals = rack_ordinals(all_nodes);
    eligible
        .iter()
        .map(|node| {
            let ordinal = ordinals
                .get(&(node.datacenter.as_str(), node.rack.as_str()))
                .copied()
                .unwrap_or(0);
            let port = policy.external_port_base + ordinal as i32;
            if port > 65535 {
                return Err(unsupported(
                    policy.mode,
                    format!("external port {} for rack {} exceeds 65535", port, node.rack),
                ));
            }
            let host = node.host_address.clone().unwrap_or_default();
            Ok(base_route(policy, node, ExternalEndpoint { host, port }))
        })
        .collect()
}

/// Index of each rack among the sorted distinct racks of its datacenter
///
/// Computed over every known node so that a rack going down does not shift
/// the ports of the others.
pub fn rack_ordinals(nodes: &[NodeIdentity]) -> BTreeMap<(&str, &str), usize> {
    let mut racks: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for node in nodes {
        racks
            .entry(node.datacenter.as_str())
            .or_default()
            .insert(node.rack.as_str());
    }

    let mut ordinals = BTreeMap::new();
    for (dc, dc_racks) in racks {
        for (i, rack) in dc_racks.into_iter().enumerate() {
            ordinals.insert((dc, rack), i);
        }
    }
    ordinals
}

fn load_balancer_route(policy: &AccessPolicy, node: &NodeIdentity) -> RouteObject {
    // Address is assigned by the load balancer provider after apply
    let mut route = base_route(
        policy,
        node,
        ExternalEndpoint {
            host: String::new(),
            port: policy.native_port,
        },
    );
    route.tls_required = false;
    route
        .annotations
        .insert(WARNING_ANNOTATION.to_string(), TOKEN_AWARE_WARNING.to_string());
    route
}

fn ingress_route(
    policy: &AccessPolicy,
    node: &NodeIdentity,
    tls: &TlsBindings,
) -> Result<RouteObject> {
    if !policy.tls_required {
        return Err(unsupported(
            policy.mode,
            "SNI routing requires tlsRequired=true".to_string(),
        ));
    }
    let ingress = policy.ingress.as_ref().ok_or_else(|| {
        unsupported(policy.mode, "spec.ingress is required".to_string())
    })?;
    let binding = tls.get(&node.datacenter).ok_or_else(|| {
        unsupported(
            policy.mode,
            format!("no TLS binding for datacenter {}", node.datacenter),
        )
    })?;
    if binding.mutual_required != policy.mutual_tls {
        return Err(unsupported(
            policy.mode,
            format!(
                "TLS binding for datacenter {} has mutualRequired={} but policy mutualTls={}",
                node.datacenter, binding.mutual_required, policy.mutual_tls
            ),
        ));
    }

    let mut route = base_route(
        policy,
        node,
        ExternalEndpoint {
            host: ingress.host.clone(),
            port: ingress.port,
        },
    );
    route.sni_hostname = Some(sni_hostname(&node.host_id, &ingress.sni_domain));
    route.tls_binding = Some(binding.clone());
    route
        .annotations
        .insert(ENTRY_POINT_ANNOTATION.to_string(), ingress.entry_point.clone());
    Ok(route)
}

/// All IngressTLS routes of a datacenter must bind the same material
pub fn verify_shared_material(routes: &[RouteObject]) -> Result<()> {
    let mut per_dc: BTreeMap<&str, &str> = BTreeMap::new();
    for route in routes {
        let Some(binding) = &route.tls_binding else {
            continue;
        };
        match per_dc.insert(route.datacenter.as_str(), binding.ca_fingerprint.as_str()) {
            Some(previous) if previous != binding.ca_fingerprint => {
                return Err(unsupported(
                    route.mode,
                    format!(
                        "datacenter {} mixes CAs {} and {}",
                        route.datacenter, previous, binding.ca_fingerprint
                    ),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Host ports already claimed by another active policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortClaim {
    pub policy: String,
    pub host: String,
    pub port: i32,
}

/// Reject host-level routes whose (host, port) another active policy holds
pub fn check_port_collisions(routes: &[RouteObject], claims: &[PortClaim]) -> Result<()> {
    for route in routes.iter().filter(|r| r.mode.is_host_level()) {
        if let Some(claim) = claims.iter().find(|c| {
            c.host == route.external_endpoint.host && c.port == route.external_endpoint.port
        }) {
            return Err(unsupported(
                route.mode,
                format!(
                    "port {} on host {} is already used by policy {}",
                    claim.port, claim.host, claim.policy
                ),
            ));
        }
    }
    Ok(())
}

/// Ready nodes without a route; LoadBalancer mode requires none
pub fn uncovered_nodes<'a>(
    policy: &AccessPolicy,
    nodes: &'a [NodeIdentity],
    routes: &[RouteObject],
) -> Vec<&'a Uuid> {
    nodes
        .iter()
        .filter(|n| n.is_ready())
        .filter(|n| {
            policy
                .datacenter
                .as_ref()
                .map(|dc| &n.datacenter == dc)
                .unwrap_or(true)
        })
        .filter(|n| {
            routes
                .iter()
                .filter(|r| r.target_host_id == n.host_id)
                .count()
                != 1
        })
        .map(|n| &n.host_id)
        .collect()
}

/// Drop routes whose target is not in the snapshot
pub fn prune_stale(routes: Vec<RouteObject>, nodes: &[NodeIdentity]) -> Vec<RouteObject> {
    routes
        .into_iter()
        .filter(|r| nodes.iter().any(|n| n.host_id == r.target_host_id))
        .collect()
}

fn unsupported(mode: AccessMode, reason: String) -> Error {
    Error::UnsupportedModeCombination { mode, reason }
}
