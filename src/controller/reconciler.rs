//! Main reconciler for CassandraAccessPolicy resources
//!
//! Implements the controller pattern using kube-rs runtime. Policy changes
//! arrive through the CRD watch; topology changes through a Pod watch that is
//! mapped back to the policies of the pod's cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::applier::{ApplierConfig, DatacenterLocks, RouteApplier, RouteSink};
use super::conditions;
use super::diff;
use super::finalizers::{is_being_deleted, ACCESS_POLICY_FINALIZER};
#[cfg(feature = "metrics")]
use super::metrics;
use super::pass::{run_pass, Pass, PassReport};
use super::routes::{KubeRouteSink, FIELD_MANAGER, POLICY_LABEL};
use crate::crd::{CassandraAccessPolicy, CassandraAccessPolicyStatus};
use crate::error::{Error, Result};
use crate::tls::{KubeSecretStore, TlsMaterialManager};
use crate::topology::{KubeTopologySource, SnapshotReader, SnapshotReaderConfig, CLUSTER_LABEL};
use crate::translator::PortClaim;

/// Annotation the REST API stamps to request a pass
pub const RECONCILE_REQUESTED_ANNOTATION: &str = "access.cassandra.io/reconcile-requested";

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
const CONTROLLER_NAME: &str = "cassandraaccesspolicy";
const STALE_PASS_REQUEUE: Duration = Duration::from_millis(100);
const CONVERGED_REQUEUE: Duration = Duration::from_secs(300);
const PROGRESSING_REQUEUE: Duration = Duration::from_secs(15);

/// Operator-wide settings
#[derive(Clone, Debug, Default)]
pub struct OperatorConfig {
    /// Compute and log plans without touching the routing system
    pub dry_run: bool,
    pub applier: ApplierConfig,
    pub snapshot: SnapshotReaderConfig,
}

/// Topology generation per cluster, bumped on every pod event
#[derive(Default)]
pub struct TopologyEpochs {
    epochs: Mutex<HashMap<String, u64>>,
}

impl TopologyEpochs {
    pub fn bump(&self, key: &str) -> u64 {
        let mut epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = epochs.entry(key.to_string()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    pub fn current(&self, key: &str) -> u64 {
        let epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
        epochs.get(key).copied().unwrap_or(0)
    }
}

pub fn cluster_key(namespace: &str, cluster: &str) -> String {
    format!("{namespace}/{cluster}")
}

/// Long-lived per-policy state: the last-known-good snapshot and retiring TLS material
struct PolicyRuntime {
    cluster: String,
    datacenter: Option<String>,
    threshold_days: i64,
    reader: SnapshotReader,
    tls: TlsMaterialManager,
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub is_leader: Arc<AtomicBool>,
    pub locks: Arc<DatacenterLocks>,
    pub epochs: TopologyEpochs,
    runtimes: Mutex<HashMap<String, Arc<PolicyRuntime>>>,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            client,
            config,
            is_leader,
            locks: Arc::new(DatacenterLocks::new()),
            epochs: TopologyEpochs::default(),
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    fn runtime_for(&self, policy: &CassandraAccessPolicy) -> Arc<PolicyRuntime> {
        let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
        let key = format!("{}/{}", namespace, policy.name_any());
        let spec = &policy.spec;

        let mut runtimes = self.runtimes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = runtimes.get(&key) {
            if existing.cluster == spec.cluster_name
                && existing.datacenter == spec.datacenter
                && existing.threshold_days == spec.rotation_threshold_days
            {
                return existing.clone();
            }
        }

        let source = KubeTopologySource::new(
            self.client.clone(),
            namespace.clone(),
            spec.cluster_name.clone(),
            spec.datacenter.clone(),
        );
        let store = KubeSecretStore::new(self.client.clone(), namespace);
        let runtime = Arc::new(PolicyRuntime {
            cluster: spec.cluster_name.clone(),
            datacenter: spec.datacenter.clone(),
            threshold_days: spec.rotation_threshold_days,
            reader: SnapshotReader::new(Arc::new(source), self.config.snapshot.clone()),
            tls: TlsMaterialManager::new(
                Arc::new(store),
                chrono::Duration::days(spec.rotation_threshold_days),
            ),
        });
        runtimes.insert(key, runtime.clone());
        runtime
    }

    fn forget(&self, policy: &CassandraAccessPolicy) {
        let key = format!(
            "{}/{}",
            policy.namespace().unwrap_or_else(|| "default".to_string()),
            policy.name_any()
        );
        let mut runtimes = self.runtimes.lock().unwrap_or_else(|e| e.into_inner());
        runtimes.remove(&key);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let policies: Api<CassandraAccessPolicy> = Api::all(client.clone());

    info!("Starting CassandraAccessPolicy controller");

    match policies.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("CassandraAccessPolicy CRD is available"),
        Err(e) => {
            error!(
                "CassandraAccessPolicy CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "CassandraAccessPolicy CRD not installed".to_string(),
            ));
        }
    }

    let controller = Controller::new(policies, Config::default());
    let store = controller.store();
    let mapper_state = state.clone();
    let pods: Api<Pod> = Api::all(client.clone());

    controller
        // Route Services carry an owner reference to their policy
        .owns::<Service>(Api::all(client.clone()), Config::default().labels(POLICY_LABEL))
        .watches(pods, Config::default().labels(CLUSTER_LABEL), move |pod| {
            let namespace = pod.namespace().unwrap_or_default();
            let cluster = pod.labels().get(CLUSTER_LABEL).cloned().unwrap_or_default();
            mapper_state.epochs.bump(&cluster_key(&namespace, &cluster));

            store
                .state()
                .into_iter()
                .filter(|p| {
                    p.namespace().as_deref() == Some(namespace.as_str())
                        && p.spec.cluster_name == cluster
                })
                .map(|p| ObjectRef::from_obj(p.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}", obj),
                Err(e) => warn!("Reconcile error: {}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    policy: &CassandraAccessPolicy,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", policy.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: policy.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        reporting_component: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    events.create(&PostParams::default(), &event).await?;
    Ok(())
}

/// Events are best effort; a failed write never fails a pass
async fn emit_event_logged(
    client: &Client,
    policy: &CassandraAccessPolicy,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    if let Err(e) = emit_event(client, policy, event_type, reason, message).await {
        warn!("Failed to emit {} event: {}", reason, e);
    }
}

/// The main reconciliation function
///
/// Called when a CassandraAccessPolicy changes, when one of its route
/// Services changes, when a pod of its cluster changes, or on requeue.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<CassandraAccessPolicy>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader() {
        debug!("Not the leader, skipping {}", obj.name_any());
        return Ok(Action::requeue(PROGRESSING_REQUEUE));
    }

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let result = if ctx.config.dry_run {
        // dry-run never writes finalizers or status
        if is_being_deleted(&obj) {
            Ok(Action::await_change())
        } else {
            apply_policy(&ctx, &obj).await
        }
    } else {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CassandraAccessPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
        finalizer(&api, ACCESS_POLICY_FINALIZER, obj, |event| async {
            match event {
                FinalizerEvent::Apply(policy) => apply_policy(&ctx, &policy).await,
                FinalizerEvent::Cleanup(policy) => cleanup_policy(&ctx, &policy).await,
            }
        })
        .await
        .map_err(Error::from)
    };

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER_NAME, start.elapsed().as_secs_f64());

    result
}

/// Converge the routes of a policy
#[instrument(skip(ctx, policy), fields(name = %policy.name_any(), namespace = policy.namespace()))]
async fn apply_policy(ctx: &ControllerState, policy: &CassandraAccessPolicy) -> Result<Action> {
    let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
    let name = policy.name_any();

    info!(
        "Reconciling CassandraAccessPolicy {}/{} (cluster: {}, mode: {})",
        namespace, name, policy.spec.cluster_name, policy.spec.mode
    );

    if let Err(errors) = policy.spec.validate() {
        let err = Error::ValidationError(errors.join("; "));
        warn!("Validation failed for {}/{}: {}", namespace, name, err);
        record_failure(ctx, policy, &err).await;
        return Err(err);
    }

    let key = cluster_key(&namespace, &policy.spec.cluster_name);
    let runtime = ctx.runtime_for(policy);
    let sink: Arc<dyn RouteSink> = Arc::new(KubeRouteSink::new(ctx.client.clone(), policy));
    let applier = RouteApplier::new(sink, ctx.locks.clone(), ctx.config.applier.clone());
    let claims = port_claims(&ctx.client, policy).await?;

    let pass = Pass {
        policy: &policy.spec,
        reader: &runtime.reader,
        tls: &runtime.tls,
        applier: &applier,
        claims: &claims,
        scope: &key,
        dry_run: ctx.config.dry_run,
    };
    let Some(result) = run_current_pass(&ctx.epochs, &key, pass).await else {
        return Ok(Action::requeue(STALE_PASS_REQUEUE));
    };

    let mut report = match result {
        Ok(report) => report,
        Err(e) => {
            warn!("Pass for {}/{} failed: {}", namespace, name, e);
            record_failure(ctx, policy, &e).await;
            return Err(e);
        }
    };

    if ctx.config.dry_run {
        info!(
            "[dry-run] {}/{}: {} upsert(s), {} removal(s) planned",
            namespace,
            name,
            report.plan.upserts.len(),
            report.plan.removals.len()
        );
        return Ok(Action::requeue(CONVERGED_REQUEUE));
    }

    publish(ctx, policy, &report).await?;

    match report.error.take() {
        Some(e) => Err(e),
        None if report.converged() => Ok(Action::requeue(CONVERGED_REQUEUE)),
        None => Ok(Action::requeue(PROGRESSING_REQUEUE)),
    }
}

/// Run a pass, discarding its result if the cluster topology changed while
/// it ran. Submitted work always completes; `None` means the caller must
/// requeue without writing status.
pub(crate) async fn run_current_pass(
    epochs: &TopologyEpochs,
    key: &str,
    pass: Pass<'_>,
) -> Option<Result<PassReport>> {
    let epoch = epochs.current(key);
    let result = run_pass(pass).await;
    if epochs.current(key) != epoch {
        info!(
            "Topology of {} changed during the pass; discarding its status and requeueing",
            key
        );
        return None;
    }
    Some(result)
}

/// Remove every route of a deleted policy
#[instrument(skip(ctx, policy), fields(name = %policy.name_any(), namespace = policy.namespace()))]
async fn cleanup_policy(ctx: &ControllerState, policy: &CassandraAccessPolicy) -> Result<Action> {
    let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
    let name = policy.name_any();
    info!("Cleaning up CassandraAccessPolicy: {}/{}", namespace, name);

    let sink: Arc<dyn RouteSink> = Arc::new(KubeRouteSink::new(ctx.client.clone(), policy));
    let applied = sink.list_applied().await?;
    let applier = RouteApplier::new(sink, ctx.locks.clone(), ctx.config.applier.clone());
    let key = cluster_key(&namespace, &policy.spec.cluster_name);

    let outcome = applier
        .execute(&key, diff::plan(diff::reconcile(&[], &applied)))
        .await;
    if let Some(e) = outcome.error() {
        warn!("Cleanup of {}/{} incomplete: {}", namespace, name, e);
        return Err(e);
    }

    ctx.forget(policy);
    #[cfg(feature = "metrics")]
    metrics::forget_policy(&namespace, &name, &policy.spec.mode.to_string());

    info!(
        "Cleanup complete for CassandraAccessPolicy {}/{}: {} route(s) removed",
        namespace,
        name,
        applied.len()
    );
    Ok(Action::await_change())
}

/// Host ports held by other policies, read from their status
async fn port_claims(client: &Client, policy: &CassandraAccessPolicy) -> Result<Vec<PortClaim>> {
    if !policy.spec.mode.is_host_level() {
        return Ok(Vec::new());
    }
    let all: Api<CassandraAccessPolicy> = Api::all(client.clone());
    let others = all.list(&ListParams::default()).await?;
    Ok(claims_from_policies(&others.items, policy))
}

pub(crate) fn claims_from_policies(
    policies: &[CassandraAccessPolicy],
    current: &CassandraAccessPolicy,
) -> Vec<PortClaim> {
    policies
        .iter()
        .filter(|p| {
            !(p.namespace() == current.namespace() && p.name_any() == current.name_any())
        })
        .filter(|p| !is_being_deleted(p))
        .flat_map(|p| {
            let owner = format!(
                "{}/{}",
                p.namespace().unwrap_or_else(|| "default".to_string()),
                p.name_any()
            );
            p.status
                .iter()
                .flat_map(|s| s.routes.iter())
                .filter(|r| r.mode.is_host_level() && r.phase != "Gone")
                .filter_map(move |r| {
                    let (host, port) = r.endpoint.rsplit_once(':')?;
                    Some(PortClaim {
                        policy: owner.clone(),
                        host: host.to_string(),
                        port: port.parse().ok()?,
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Status for a completed pass
pub(crate) fn build_status(
    policy: &CassandraAccessPolicy,
    report: &PassReport,
) -> CassandraAccessPolicyStatus {
    let generation = policy.metadata.generation;
    let mut conds = policy
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    conditions::mark_degraded(&mut conds, report.degraded, generation);

    let active = report.active_routes();
    let (phase, message) = match &report.error {
        Some(e) => {
            conditions::mark_failed(&mut conds, e, generation);
            let phase = if e.is_retriable() { "Progressing" } else { "Failed" };
            (phase, e.to_string())
        }
        None if report.converged() => {
            conditions::mark_converged(&mut conds, active, generation);
            let phase = if report.degraded { "Degraded" } else { "Ready" };
            (phase, format!("{active} route(s) active"))
        }
        None => {
            let waiting = report.routes.len().saturating_sub(active);
            conditions::set_condition(
                &mut conds,
                conditions::CONDITION_TYPE_READY,
                conditions::CONDITION_STATUS_FALSE,
                "AwaitingConfirmation",
                &format!("{waiting} route(s) not yet serving"),
                generation,
            );
            conditions::set_condition(
                &mut conds,
                conditions::CONDITION_TYPE_PROGRESSING,
                conditions::CONDITION_STATUS_TRUE,
                "AwaitingConfirmation",
                &format!("{waiting} route(s) not yet serving"),
                generation,
            );
            ("Progressing", format!("{active} of {} route(s) active", report.routes.len()))
        }
    };

    if report.rotated.is_empty() {
        conditions::remove_condition(&mut conds, conditions::CONDITION_TYPE_TLS_ROTATING);
    } else {
        conditions::set_condition(
            &mut conds,
            conditions::CONDITION_TYPE_TLS_ROTATING,
            conditions::CONDITION_STATUS_TRUE,
            "MaterialRotated",
            &format!("Rotated: {}", report.rotated.join(", ")),
            generation,
        );
    }

    CassandraAccessPolicyStatus {
        phase: phase.to_string(),
        message: Some(message),
        observed_generation: generation,
        active_routes: active as i32,
        routes: report.routes.clone(),
        tls_bindings: report.tls_bindings.clone(),
        topology_degraded: report.degraded,
        conditions: conds,
    }
}

/// Write status, events and metrics for a completed pass
async fn publish(ctx: &ControllerState, policy: &CassandraAccessPolicy, report: &PassReport) -> Result<()> {
    let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
    let name = policy.name_any();
    let status = build_status(policy, report);

    let api: Api<CassandraAccessPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    if !report.plan.is_empty() {
        emit_event_logged(
            &ctx.client,
            policy,
            "Normal",
            "RoutesApplied",
            &format!(
                "{} route(s) applied, {} removed, {} kept pending replacement",
                report.plan.upserts.len(),
                report
                    .plan
                    .removals
                    .len()
                    .saturating_sub(report.outcome.kept.len()),
                report.outcome.kept.len()
            ),
        )
        .await;
    }
    for secret in &report.rotated {
        emit_event_logged(
            &ctx.client,
            policy,
            "Normal",
            "TLSMaterialRotated",
            &format!("Bound routes to re-issued material from Secret {secret}"),
        )
        .await;
    }
    if let Some(e) = &report.error {
        emit_event_logged(&ctx.client, policy, "Warning", e.kind(), &e.to_string()).await;
    }
    if report.degraded {
        emit_event_logged(
            &ctx.client,
            policy,
            "Warning",
            "StaleTopology",
            "Routes computed from the last-known-good topology snapshot",
        )
        .await;
    }

    #[cfg(feature = "metrics")]
    {
        metrics::set_active_routes(
            &namespace,
            &name,
            &policy.spec.mode.to_string(),
            status.active_routes as i64,
        );
        metrics::set_topology_degraded(&namespace, &name, report.degraded);
        for secret in &report.rotated {
            metrics::inc_tls_rotation(&namespace, secret);
        }
    }

    info!(
        "CassandraAccessPolicy {}/{} status updated to: {} - {}",
        namespace,
        name,
        status.phase,
        status.message.as_deref().unwrap_or_default()
    );
    Ok(())
}

/// Record a pass that applied nothing
async fn record_failure(ctx: &ControllerState, policy: &CassandraAccessPolicy, err: &Error) {
    if ctx.config.dry_run {
        return;
    }
    let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
    let name = policy.name_any();

    let mut status = policy.status.clone().unwrap_or_default();
    conditions::mark_failed(&mut status.conditions, err, policy.metadata.generation);
    status.phase = if err.is_retriable() { "Progressing" } else { "Failed" }.to_string();
    status.message = Some(err.to_string());
    status.observed_generation = policy.metadata.generation;

    let api: Api<CassandraAccessPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    if let Err(e) = api
        .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        warn!("Failed to record failure status for {}/{}: {}", namespace, name, e);
    }

    emit_event_logged(&ctx.client, policy, "Warning", err.kind(), &err.to_string()).await;
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(
    policy: Arc<CassandraAccessPolicy>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    error!(
        "Reconciliation error for {}: {} ({})",
        policy.name_any(),
        error,
        error.kind()
    );

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
