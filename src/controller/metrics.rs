//! Prometheus metrics for the access operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `cass_access_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `cass_access_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `cass_access_active_routes` (gauge): Active routes labeled by namespace/policy/mode.
//! - `cass_access_topology_degraded` (gauge): 1 while a policy is served from a stale snapshot.
//! - `cass_access_tls_rotations_total` (counter): rotation requests labeled by namespace/secret.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "cassandraaccesspolicy"
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    pub namespace: String,
    pub policy: String,
    pub mode: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DegradedLabels {
    pub namespace: String,
    pub policy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SecretLabels {
    pub namespace: String,
    pub secret: String,
}

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static ACTIVE_ROUTES: Lazy<Family<PolicyLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static TOPOLOGY_DEGRADED: Lazy<Family<DegradedLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static TLS_ROTATIONS_TOTAL: Lazy<Family<SecretLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "cass_access_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "cass_access_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "cass_access_active_routes",
        "Routes in the Active phase per policy",
        ACTIVE_ROUTES.clone(),
    );
    registry.register(
        "cass_access_topology_degraded",
        "1 while a policy is reconciled against a last-known-good snapshot",
        TOPOLOGY_DEGRADED.clone(),
    );
    registry.register(
        "cass_access_tls_rotations_total",
        "TLS rotation requests issued to the secret store",
        TLS_ROTATIONS_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_active_routes(namespace: &str, policy: &str, mode: &str, count: i64) {
    let labels = PolicyLabels {
        namespace: namespace.to_string(),
        policy: policy.to_string(),
        mode: mode.to_string(),
    };
    ACTIVE_ROUTES.get_or_create(&labels).set(count);
}

pub fn set_topology_degraded(namespace: &str, policy: &str, degraded: bool) {
    let labels = DegradedLabels {
        namespace: namespace.to_string(),
        policy: policy.to_string(),
    };
    TOPOLOGY_DEGRADED
        .get_or_create(&labels)
        .set(i64::from(degraded));
}

pub fn inc_tls_rotation(namespace: &str, secret: &str) {
    let labels = SecretLabels {
        namespace: namespace.to_string(),
        secret: secret.to_string(),
    };
    TLS_ROTATIONS_TOTAL.get_or_create(&labels).inc();
}

/// Drop per-policy series once a policy is deleted
pub fn forget_policy(namespace: &str, policy: &str, mode: &str) {
    ACTIVE_ROUTES.remove(&PolicyLabels {
        namespace: namespace.to_string(),
        policy: policy.to_string(),
        mode: mode.to_string(),
    });
    TOPOLOGY_DEGRADED.remove(&DegradedLabels {
        namespace: namespace.to_string(),
        policy: policy.to_string(),
    });
}
