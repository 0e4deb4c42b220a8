//! Error types for the access operator

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crd::AccessMode;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid operator or policy configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Policy spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer handling failed
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// The orchestrator state store could not be read in time
    #[error("Topology source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    /// The policy cannot be realized against the current topology
    #[error("Unsupported combination for mode {mode}: {reason}")]
    UnsupportedModeCombination { mode: AccessMode, reason: String },

    /// Some route operations succeeded and some failed
    #[error(
        "Partial apply failure: {} succeeded, {} failed ({})",
        .succeeded.len(),
        .failed.len(),
        join_failures(.failed)
    )]
    PartialApplyFailure {
        succeeded: Vec<String>,
        failed: Vec<RouteFailure>,
    },

    /// TLS material is past validity and could not be rotated
    #[error("TLS material in secret {secret_name} expired at {expired_at}")]
    MaterialExpired {
        secret_name: String,
        expired_at: DateTime<Utc>,
    },

    /// TLS material could not be parsed
    #[error("Invalid TLS material: {0}")]
    MaterialInvalid(String),

    /// An external operation did not complete within its bound
    #[error("Operation {operation} timed out for route {route_id}")]
    Timeout { operation: String, route_id: String },
}

/// A single failed route operation, kept for operator diagnosis
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteFailure {
    pub route_id: String,
    pub mode: AccessMode,
    pub operation: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}) at {}: {}",
            self.operation,
            self.route_id,
            self.mode,
            self.at.to_rfc3339(),
            self.message
        )
    }
}

fn join_failures(failed: &[RouteFailure]) -> String {
    failed
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the controller should retry soon
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::SourceUnavailable { .. }
                | Error::PartialApplyFailure { .. }
                | Error::Timeout { .. }
                | Error::FinalizerError(_)
        )
    }

    /// Short machine-readable kind, used for metrics labels and condition reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::SerializationError(_) => "serialization",
            Error::FinalizerError(_) => "finalizer",
            Error::SourceUnavailable { .. } => "SourceUnavailable",
            Error::UnsupportedModeCombination { .. } => "UnsupportedModeCombination",
            Error::PartialApplyFailure { .. } => "PartialApplyFailure",
            Error::MaterialExpired { .. } => "MaterialExpired",
            Error::MaterialInvalid(_) => "MaterialInvalid",
            Error::Timeout { .. } => "timeout",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    /// Unwrap reconcile errors so their kind survives the finalizer helper
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match e {
            FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}
