//! Route application against the routing system
//!
//! Upserts are submitted per datacenter under a single-writer lock, then
//! confirmed concurrently; confirmations are matched by route id in
//! whatever order they arrive. A route that is not confirmed in time goes
//! back to Pending and is re-applied until the attempt ceiling, then Failed.
//! Removals run last. A removal that replaces a
//! route for the same host only proceeds once the replacement is Active.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::diff::ApplyPlan;
use super::lifecycle::{RoutePhase, RouteTracker};
use crate::error::{Error, Result, RouteFailure};
use crate::retry::RetryConfig;
use crate::translator::RouteObject;

/// The routing system routes are applied to
#[async_trait]
pub trait RouteSink: Send + Sync {
    /// Create or update the objects realizing `route`
    async fn apply(&self, route: &RouteObject) -> Result<()>;

    /// Whether the routing system reports the route as serving
    async fn confirm(&self, id: &str) -> Result<bool>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Routes currently applied, as last written
    async fn list_applied(&self) -> Result<Vec<RouteObject>>;
}

/// One async mutex per datacenter, shared by all passes
#[derive(Default)]
pub struct DatacenterLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DatacenterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[derive(Clone, Debug)]
pub struct ApplierConfig {
    /// Bound on a single apply/remove/confirm call
    pub op_timeout: Duration,
    /// Bound on waiting for a route to be confirmed serving
    pub confirm_timeout: Duration,
    pub confirm_interval: Duration,
    /// Attempts per apply/remove, and apply-then-confirm rounds, before
    /// the route is Failed
    pub retry: RetryConfig,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(15),
            confirm_timeout: Duration::from_secs(120),
            confirm_interval: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }
}

/// Result of executing one plan
#[derive(Clone, Debug, Default)]
pub struct ApplyOutcome {
    pub phases: BTreeMap<String, RoutePhase>,
    /// Route ids whose operation completed (Active or Gone)
    pub succeeded: Vec<String>,
    pub failed: Vec<RouteFailure>,
    /// Superseded routes kept serving because their replacement failed
    pub kept: Vec<String>,
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// `PartialApplyFailure` when any operation failed
    pub fn error(&self) -> Option<Error> {
        if self.failed.is_empty() {
            return None;
        }
        Some(Error::PartialApplyFailure {
            succeeded: self.succeeded.clone(),
            failed: self.failed.clone(),
        })
    }
}

pub struct RouteApplier {
    sink: Arc<dyn RouteSink>,
    locks: Arc<DatacenterLocks>,
    config: ApplierConfig,
}

impl RouteApplier {
    pub fn new(sink: Arc<dyn RouteSink>, locks: Arc<DatacenterLocks>, config: ApplierConfig) -> Self {
        Self {
            sink,
            locks,
            config,
        }
    }

    pub fn sink(&self) -> &Arc<dyn RouteSink> {
        &self.sink
    }

    /// Execute a plan; `scope` namespaces the datacenter locks (the cluster)
    #[instrument(skip(self, plan), fields(upserts = plan.upserts.len(), removals = plan.removals.len()))]
    pub async fn execute(&self, scope: &str, plan: ApplyPlan) -> ApplyOutcome {
        let mut tracker = RouteTracker::new();
        let mut outcome = ApplyOutcome::default();

        for route in &plan.upserts {
            tracker.track(&route.id, RoutePhase::Pending);
        }
        for removal in &plan.removals {
            tracker.track(&removal.route.id, RoutePhase::Active);
        }

        let rounds = self.config.retry.max_attempts.max(1);
        let mut to_submit: Vec<&RouteObject> = plan.upserts.iter().collect();
        for round in 1..=rounds {
            if to_submit.is_empty() {
                break;
            }
            let submitted = self
                .submit_upserts(scope, &to_submit, &mut tracker, &mut outcome)
                .await;
            let unconfirmed = self
                .confirm_upserts(&submitted, &mut tracker, &mut outcome)
                .await;

            to_submit = Vec::new();
            for (route, err) in unconfirmed {
                if round < rounds {
                    info!(
                        "Route {} not confirmed ({}), re-applying ({}/{})",
                        route.id,
                        err,
                        round + 1,
                        rounds
                    );
                    tracker.advance(&route.id, RoutePhase::Pending);
                    to_submit.push(route);
                } else {
                    tracker.advance(&route.id, RoutePhase::Failed);
                    outcome.failed.push(failure(route, "confirm", &err));
                }
            }
        }

        let mut to_remove = Vec::new();
        for removal in &plan.removals {
            let id = removal.route.id.as_str();
            if let Some(replacement) = &removal.replaced_by {
                tracker.advance(id, RoutePhase::Superseded);
                if tracker.phase(replacement) != Some(RoutePhase::Active) {
                    warn!(
                        "Keeping route {} serving: replacement {} is not active",
                        id, replacement
                    );
                    tracker.advance(id, RoutePhase::Active);
                    outcome.kept.push(id.to_string());
                    continue;
                }
            }
            to_remove.push(&removal.route);
        }
        self.remove_routes(scope, &to_remove, &mut tracker, &mut outcome)
            .await;

        outcome.phases = tracker.phases().clone();
        outcome
    }

    async fn submit_upserts<'a>(
        &self,
        scope: &str,
        routes: &[&'a RouteObject],
        tracker: &mut RouteTracker,
        outcome: &mut ApplyOutcome,
    ) -> Vec<&'a RouteObject> {
        let mut submitted = Vec::new();
        for (datacenter, dc_routes) in by_datacenter(routes.iter().copied()) {
            let lock = self.locks.lock_for(&format!("{scope}/{datacenter}"));
            let _guard = lock.lock().await;
            debug!("Submitting {} route(s) in {}", dc_routes.len(), datacenter);

            for route in dc_routes {
                tracker.advance(&route.id, RoutePhase::Applying);
                match self
                    .with_retry("apply", &route.id, || self.sink.apply(route))
                    .await
                {
                    Ok(()) => submitted.push(route),
                    Err(e) => {
                        tracker.advance(&route.id, RoutePhase::Failed);
                        outcome.failed.push(failure(route, "apply", &e));
                    }
                }
            }
        }
        submitted
    }

    /// Confirm submitted routes concurrently; returns those not confirmed
    async fn confirm_upserts<'a>(
        &self,
        submitted: &[&'a RouteObject],
        tracker: &mut RouteTracker,
        outcome: &mut ApplyOutcome,
    ) -> Vec<(&'a RouteObject, Error)> {
        let mut pending: FuturesUnordered<_> = submitted
            .iter()
            .map(|route| {
                let route = *route;
                async move {
                    let result = self.await_confirmation(&route.id).await;
                    (route, result)
                }
            })
            .collect();

        let mut unconfirmed = Vec::new();
        while let Some((route, result)) = pending.next().await {
            match result {
                Ok(()) => {
                    tracker.advance(&route.id, RoutePhase::Active);
                    outcome.succeeded.push(route.id.clone());
                }
                Err(e) => unconfirmed.push((route, e)),
            }
        }
        unconfirmed
    }

    async fn remove_routes(
        &self,
        scope: &str,
        routes: &[&RouteObject],
        tracker: &mut RouteTracker,
        outcome: &mut ApplyOutcome,
    ) {
        for (datacenter, dc_routes) in by_datacenter(routes.iter().copied()) {
            let lock = self.locks.lock_for(&format!("{scope}/{datacenter}"));
            let _guard = lock.lock().await;

            for route in dc_routes {
                tracker.advance(&route.id, RoutePhase::Removing);
                match self
                    .with_retry("remove", &route.id, || self.sink.remove(&route.id))
                    .await
                {
                    Ok(()) => {
                        tracker.advance(&route.id, RoutePhase::Gone);
                        info!("Removed route {}", route.id);
                        outcome.succeeded.push(route.id.clone());
                    }
                    Err(e) => {
                        tracker.advance(&route.id, RoutePhase::Failed);
                        outcome.failed.push(failure(route, "remove", &e));
                    }
                }
            }
        }
    }

    /// Poll `confirm` until the route serves or the confirmation bound passes
    async fn await_confirmation(&self, id: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.confirm_timeout;
        loop {
            match tokio::time::timeout(self.config.op_timeout, self.sink.confirm(id)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => debug!("Route {} not serving yet", id),
                Ok(Err(e)) => debug!("Confirming route {} failed: {}", id, e),
                Err(_) => debug!("Confirming route {} timed out", id),
            }
            if Instant::now() + self.config.confirm_interval > deadline {
                return Err(Error::Timeout {
                    operation: "confirm".to_string(),
                    route_id: id.to_string(),
                });
            }
            tokio::time::sleep(self.config.confirm_interval).await;
        }
    }

    /// Run `op` with a per-attempt timeout, retrying up to the ceiling
    async fn with_retry<F, Fut>(&self, operation: &str, route_id: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.config.retry.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            let err = match tokio::time::timeout(self.config.op_timeout, op()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => Error::Timeout {
                    operation: operation.to_string(),
                    route_id: route_id.to_string(),
                },
            };
            warn!(
                route = route_id,
                attempt = attempt + 1,
                error = %err,
                "{} failed",
                operation
            );
            let retriable = err.is_retriable();
            last_err = Some(err);
            if !retriable {
                break;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.retry.jittered_delay_for(attempt)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Timeout {
            operation: operation.to_string(),
            route_id: route_id.to_string(),
        }))
    }
}

fn by_datacenter<'a>(
    routes: impl Iterator<Item = &'a RouteObject>,
) -> BTreeMap<&'a str, Vec<&'a RouteObject>> {
    let mut grouped: BTreeMap<&str, Vec<&RouteObject>> = BTreeMap::new();
    for route in routes {
        grouped.entry(route.datacenter.as_str()).or_default().push(route);
    }
    grouped
}

fn failure(route: &RouteObject, operation: &str, error: &Error) -> RouteFailure {
    RouteFailure {
        route_id: route.id.clone(),
        mode: route.mode,
        operation: operation.to_string(),
        message: error.to_string(),
        at: Utc::now(),
    }
}
