//! cass-access-operator: external client access to Cassandra clusters on Kubernetes
//!
//! Reconciles `CassandraAccessPolicy` resources into per-node routes (direct
//! pod routes, host networking, load balancers or an SNI-routed TLS ingress)
//! that follow the live cluster topology.

pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod tls;
pub mod topology;
pub mod translator;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
