//! Finalizer handling for CassandraAccessPolicy cleanup
//!
//! The finalizer keeps a policy around until every route object it applied
//! has been removed from the routing system.

use crate::crd::CassandraAccessPolicy;
use kube::ResourceExt;

/// Finalizer guarding applied routes of a policy
pub const ACCESS_POLICY_FINALIZER: &str = "cassandraaccesspolicy.access.cassandra.io/finalizer";

/// Deletion has been requested but cleanup has not finished
pub fn is_being_deleted(policy: &CassandraAccessPolicy) -> bool {
    policy.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(policy: &CassandraAccessPolicy) -> bool {
    policy
        .finalizers()
        .iter()
        .any(|f| f == ACCESS_POLICY_FINALIZER)
}
