//! One reconciliation pass over a policy
//!
//! Fresh snapshot, TLS bindings ensured valid, translate, diff against the
//! applied set, apply. Kubernetes status and events are written by the
//! caller from the returned report.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::applier::{ApplyOutcome, RouteApplier};
use super::diff::{self, ApplyPlan};
use super::lifecycle::RoutePhase;
use crate::crd::{AccessMode, RouteStatus, TlsBindingStatus};
use crate::error::{Error, Result, RouteFailure};
use crate::tls::{TlsMaterialManager, TlsMaterialRef};
use crate::topology::{SnapshotReader, TopologySnapshot};
use crate::translator::{self, AccessPolicy, PortClaim, RouteObject, TlsBindings};

/// Inputs of one pass
pub struct Pass<'a> {
    pub policy: &'a AccessPolicy,
    pub reader: &'a SnapshotReader,
    pub tls: &'a TlsMaterialManager,
    pub applier: &'a RouteApplier,
    /// Host ports held by other active policies
    pub claims: &'a [PortClaim],
    /// Lock scope for datacenter serialization
    pub scope: &'a str,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct PassReport {
    pub degraded: bool,
    pub desired: Vec<RouteObject>,
    pub plan: ApplyPlan,
    pub outcome: ApplyOutcome,
    /// Status entries for every route still present after the pass
    pub routes: Vec<RouteStatus>,
    pub tls_bindings: Vec<TlsBindingStatus>,
    /// Secrets for which rotation produced new material
    pub rotated: Vec<String>,
    /// Retiring material released this pass
    pub released: Vec<TlsMaterialRef>,
    /// Set when the pass did not fully converge
    pub error: Option<Error>,
}

impl PassReport {
    pub fn active_routes(&self) -> usize {
        self.routes
            .iter()
            .filter(|r| r.phase == RoutePhase::Active.as_str())
            .count()
    }

    pub fn converged(&self) -> bool {
        self.error.is_none() && self.active_routes() == self.routes.len()
    }
}

/// Run a pass
///
/// Returns `Err` when nothing was applied: the topology could not be read,
/// the applied set could not be listed, or the policy cannot be realized.
/// Partial failures after application started are reported in
/// `PassReport::error`.
#[instrument(skip_all, fields(mode = %pass.policy.mode, scope = pass.scope))]
pub async fn run_pass(pass: Pass<'_>) -> Result<PassReport> {
    let policy = pass.policy;
    let snapshot = pass.reader.snapshot().await?;
    let mut report = PassReport {
        degraded: snapshot.degraded,
        ..Default::default()
    };

    let bindings = if policy.mode == AccessMode::IngressTls {
        ensure_bindings(&pass, &snapshot, &mut report).await?
    } else {
        BindingSet::default()
    };

    let applied = pass.applier.sink().list_applied().await?;

    // Nodes of datacenters whose material expired get no new routes; what is
    // already applied there keeps serving.
    let nodes: Vec<_> = snapshot
        .nodes
        .iter()
        .filter(|n| !bindings.expired.contains(&n.datacenter))
        .cloned()
        .collect();
    let mut desired = translator::translate(policy, &nodes, &bindings.valid)?;
    desired.extend(
        applied
            .iter()
            .filter(|r| bindings.expired.contains(&r.datacenter))
            .filter(|r| snapshot.contains(&r.target_host_id))
            .cloned(),
    );
    desired.sort_by(|a, b| a.id.cmp(&b.id));
    let desired = translator::prune_stale(desired, &snapshot.nodes);
    translator::check_port_collisions(&desired, pass.claims)?;

    let route_diff = diff::reconcile(&desired, &applied);
    info!(
        created = route_diff.created.len(),
        updated = route_diff.updated.len(),
        deleted = route_diff.deleted.len(),
        "Computed route diff"
    );
    let plan = diff::plan(route_diff);
    report.plan = plan.clone();

    if pass.dry_run {
        for route in &plan.upserts {
            info!("[dry-run] would apply route {} -> {}", route.id, route.external_endpoint);
        }
        for removal in &plan.removals {
            info!("[dry-run] would remove route {}", removal.route.id);
        }
        report.routes = desired
            .iter()
            .map(|r| route_status(r, RoutePhase::Pending))
            .collect();
        report.desired = desired;
        return Ok(report);
    }

    report.outcome = pass.applier.execute(pass.scope, plan).await;

    // Routes untouched this pass are confirmed once so status reflects reality
    let mut phases = report.outcome.phases.clone();
    for route in &desired {
        if !phases.contains_key(&route.id) {
            let phase = match pass.applier.sink().confirm(&route.id).await {
                Ok(true) => RoutePhase::Active,
                Ok(false) => RoutePhase::Applying,
                Err(e) => {
                    debug!("Checking route {} failed: {}", route.id, e);
                    RoutePhase::Applying
                }
            };
            phases.insert(route.id.clone(), phase);
        }
    }

    let mut routes: Vec<RouteStatus> = desired
        .iter()
        .map(|r| route_status(r, phases.get(&r.id).copied().unwrap_or(RoutePhase::Pending)))
        .collect();
    // superseded routes kept serving, and removals that failed
    for route in &applied {
        if desired.iter().any(|d| d.id == route.id) {
            continue;
        }
        match phases.get(&route.id) {
            Some(RoutePhase::Gone) | None => {}
            Some(phase) => routes.push(route_status(route, *phase)),
        }
    }
    routes.sort_by(|a, b| a.id.cmp(&b.id));
    report.routes = routes;

    let serving: Vec<RouteObject> = desired
        .iter()
        .filter(|r| phases.get(&r.id) == Some(&RoutePhase::Active))
        .cloned()
        .collect();
    let active_refs: Vec<TlsMaterialRef> = serving
        .iter()
        .chain(applied.iter().filter(|r| still_bound(r, &desired, &phases)))
        .filter_map(|r| r.tls_binding.clone())
        .collect();
    report.released = pass.tls.release_unreferenced(&active_refs);
    for released in &report.released {
        info!(
            "Released retiring TLS material {} ({})",
            released.secret_name, released.ca_fingerprint
        );
    }

    report.error = report
        .outcome
        .error()
        .or_else(|| exposure_error(policy, &snapshot, &desired, &serving))
        .or(bindings.error);
    report.desired = desired;
    Ok(report)
}

#[derive(Default)]
struct BindingSet {
    valid: TlsBindings,
    expired: BTreeSet<String>,
    error: Option<Error>,
}

/// Load and validate one TLS binding per datacenter
async fn ensure_bindings(
    pass: &Pass<'_>,
    snapshot: &TopologySnapshot,
    report: &mut PassReport,
) -> Result<BindingSet> {
    let policy = pass.policy;
    let Some(ingress) = &policy.ingress else {
        return Err(Error::UnsupportedModeCombination {
            mode: policy.mode,
            reason: "spec.ingress is required".to_string(),
        });
    };

    let datacenters: BTreeSet<&str> = snapshot
        .nodes
        .iter()
        .filter(|n| n.is_ready())
        .map(|n| n.datacenter.as_str())
        .filter(|dc| policy.datacenter.as_deref().map(|p| p == *dc).unwrap_or(true))
        .collect();

    let now = Utc::now();
    let mut set = BindingSet::default();
    let mut loaded: BTreeMap<&str, TlsMaterialRef> = BTreeMap::new();

    for dc in datacenters {
        let secret = ingress.secret_for(dc);
        let current = match loaded.get(secret) {
            Some(r) => r.clone(),
            None => pass.tls.load_ref(secret, policy.mutual_tls).await?,
        };

        match pass.tls.ensure_valid(&current, now).await {
            Ok(valid) => {
                if valid != current && !report.rotated.iter().any(|s| s == secret) {
                    report.rotated.push(secret.to_string());
                }
                report.tls_bindings.push(TlsBindingStatus {
                    datacenter: dc.to_string(),
                    secret_name: valid.secret_name.clone(),
                    ca_fingerprint: valid.ca_fingerprint.clone(),
                    cert_expiry: valid.cert_expiry.to_rfc3339(),
                });
                loaded.insert(secret, valid.clone());
                set.valid.insert(dc.to_string(), valid);
            }
            Err(e @ Error::MaterialExpired { .. }) => {
                warn!("Datacenter {} has expired TLS material: {}", dc, e);
                set.expired.insert(dc.to_string());
                set.error.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(set)
}

/// Whether the routing system may still serve `applied` as last written:
/// it was not removed, and no update of it reached Active.
fn still_bound(
    applied: &RouteObject,
    desired: &[RouteObject],
    phases: &BTreeMap<String, RoutePhase>,
) -> bool {
    match phases.get(&applied.id) {
        Some(RoutePhase::Gone) => false,
        Some(RoutePhase::Active) => !desired.iter().any(|d| d.id == applied.id),
        _ => true,
    }
}

/// LoadBalancer mode must expose every reachable node
fn exposure_error(
    policy: &AccessPolicy,
    snapshot: &TopologySnapshot,
    desired: &[RouteObject],
    serving: &[RouteObject],
) -> Option<Error> {
    if policy.mode != AccessMode::LoadBalancer {
        return None;
    }
    let uncovered = translator::uncovered_nodes(policy, &snapshot.nodes, serving);
    if uncovered.is_empty() {
        return None;
    }
    let now = Utc::now();
    let failed = uncovered
        .iter()
        .map(|host_id| RouteFailure {
            route_id: desired
                .iter()
                .find(|r| &r.target_host_id == *host_id)
                .map(|r| r.id.clone())
                .unwrap_or_else(|| translator::route_id(policy.mode, host_id)),
            mode: policy.mode,
            operation: "expose".to_string(),
            message: format!("node {host_id} has no serving load balancer"),
            at: now,
        })
        .collect();
    Some(Error::PartialApplyFailure {
        succeeded: serving.iter().map(|r| r.id.clone()).collect(),
        failed,
    })
}

pub fn route_status(route: &RouteObject, phase: RoutePhase) -> RouteStatus {
    RouteStatus {
        id: route.id.clone(),
        mode: route.mode,
        host_id: route.target_host_id.to_string(),
        datacenter: route.datacenter.clone(),
        endpoint: route.external_endpoint.to_string(),
        sni_hostname: route.sni_hostname.clone(),
        phase: phase.as_str().to_string(),
    }
}
