//! CassandraAccessPolicy Custom Resource Definition
//!
//! A CassandraAccessPolicy declares how the nodes of one cass-operator
//! managed cluster are exposed to clients outside Kubernetes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AccessMode, Condition, IngressTlsConfig, RouteStatus, TlsBindingStatus};

/// Default CQL native transport port
pub const DEFAULT_NATIVE_PORT: i32 = 9042;

/// Default TLS rotation threshold
pub const DEFAULT_ROTATION_THRESHOLD_DAYS: i64 = 14;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "access.cassandra.io",
    version = "v1alpha1",
    kind = "CassandraAccessPolicy",
    namespaced,
    status = "CassandraAccessPolicyStatus",
    shortname = "cap",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Routes","type":"integer","jsonPath":".status.activeRoutes"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraAccessPolicySpec {
    /// Name of the cass-operator cluster (`cassandra.datastax.com/cluster` label)
    pub cluster_name: String,

    /// Restrict the policy to one datacenter; all datacenters when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    pub mode: AccessMode,

    /// First external port for HostNetwork/HostPort modes
    #[serde(default = "default_native_port")]
    pub external_port_base: i32,

    #[serde(default)]
    pub tls_required: bool,

    #[serde(default)]
    pub mutual_tls: bool,

    /// Port Cassandra listens on inside the pod
    #[serde(default = "default_native_port")]
    pub native_port: i32,

    /// Shared ingress endpoint; required for IngressTLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressTlsConfig>,

    /// Rotate TLS material when fewer than this many days of validity remain
    #[serde(default = "default_rotation_threshold_days")]
    pub rotation_threshold_days: i64,
}

fn default_native_port() -> i32 {
    DEFAULT_NATIVE_PORT
}

fn default_rotation_threshold_days() -> i64 {
    DEFAULT_ROTATION_THRESHOLD_DAYS
}

impl CassandraAccessPolicySpec {
    /// Validate the spec independently of topology
    ///
    /// Returns every problem found so the operator sees them all at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cluster_name.trim().is_empty() {
            errors.push("spec.clusterName must not be empty".to_string());
        }
        if !(1..=65535).contains(&self.native_port) {
            errors.push(format!(
                "spec.nativePort {} is outside 1-65535",
                self.native_port
            ));
        }
        if self.mode.is_host_level() && !(1..=65535).contains(&self.external_port_base) {
            errors.push(format!(
                "spec.externalPortBase {} is outside 1-65535",
                self.external_port_base
            ));
        }
        if self.rotation_threshold_days < 0 {
            errors.push("spec.rotationThresholdDays must not be negative".to_string());
        }
        if self.mutual_tls && !self.tls_required {
            errors.push("spec.mutualTls requires spec.tlsRequired".to_string());
        }

        if self.mode == AccessMode::IngressTls {
            match &self.ingress {
                None => errors.push("spec.ingress is required for IngressTLS mode".to_string()),
                Some(ingress) => {
                    if ingress.host.is_empty() {
                        errors.push("spec.ingress.host must not be empty".to_string());
                    }
                    if ingress.sni_domain.is_empty() {
                        errors.push("spec.ingress.sniDomain must not be empty".to_string());
                    }
                    if ingress.tls_secret_name.is_empty() {
                        errors.push("spec.ingress.tlsSecretName must not be empty".to_string());
                    }
                    if !(1..=65535).contains(&ingress.port) {
                        errors.push(format!(
                            "spec.ingress.port {} is outside 1-65535",
                            ingress.port
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Status subresource of a CassandraAccessPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraAccessPolicyStatus {
    /// Ready, Progressing, Degraded or Failed
    #[serde(default)]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub active_routes: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls_bindings: Vec<TlsBindingStatus>,

    /// True while serving from a last-known-good topology snapshot
    #[serde(default)]
    pub topology_degraded: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
