//! Custom Resource Definitions for the access operator

mod access_policy;
pub mod types;


pub use access_policy::{
    CassandraAccessPolicy, CassandraAccessPolicySpec, CassandraAccessPolicyStatus,
    DEFAULT_NATIVE_PORT, DEFAULT_ROTATION_THRESHOLD_DAYS,
};
pub use types::*;
