//! Controller for CassandraAccessPolicy reconciliation
//!
//! A pass reads a topology snapshot, translates it into desired routes,
//! diffs them against the routing system and applies the difference
//! make-before-break. The kube-rs controller loop in `reconciler` drives
//! passes and writes status.

pub mod applier;
pub mod conditions;
pub mod diff;
mod finalizers;
pub mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pass;
mod reconciler;
pub mod routes;

#[cfg(test)]
mod test_support;

pub use applier::{ApplierConfig, ApplyOutcome, DatacenterLocks, RouteApplier, RouteSink};
pub use finalizers::{has_finalizer, is_being_deleted, ACCESS_POLICY_FINALIZER};
pub use lifecycle::RoutePhase;
pub use pass::{run_pass, Pass, PassReport};
pub use reconciler::{
    run_controller, ControllerState, OperatorConfig, RECONCILE_REQUESTED_ANNOTATION,
};
pub use routes::KubeRouteSink;
