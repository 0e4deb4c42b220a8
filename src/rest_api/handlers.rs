//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use tracing::{error, info, instrument};

use crate::controller::{
    has_finalizer, is_being_deleted, ControllerState, RECONCILE_REQUESTED_ANNOTATION,
};
use crate::crd::CassandraAccessPolicy;

use super::dto::{
    ErrorResponse, HealthResponse, PolicyDetailResponse, PolicyListResponse, PolicySummary,
    ReconcileResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(namespace: &str, name: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "not_found",
            &format!("CassandraAccessPolicy {}/{} not found", namespace, name),
        )),
    )
}

fn internal(error: &str, e: &kube::Error) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(error, &e.to_string())),
    )
}

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader(),
    })
}

/// List all CassandraAccessPolicies
#[instrument(skip(state))]
pub async fn list_policies(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<PolicyListResponse>, ApiError> {
    let api: Api<CassandraAccessPolicy> = Api::all(state.client.clone());

    match api.list(&Default::default()).await {
        Ok(policies) => {
            let items: Vec<PolicySummary> = policies.items.iter().map(PolicySummary::from).collect();
            let total = items.len();
            Ok(Json(PolicyListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list policies: {:?}", e);
            Err(internal("list_failed", &e))
        }
    }
}

/// Get a specific CassandraAccessPolicy with its route status
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_policy(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<PolicyDetailResponse>, ApiError> {
    let api: Api<CassandraAccessPolicy> = Api::namespaced(state.client.clone(), &namespace);

    match api.get(&name).await {
        Ok(policy) => Ok(Json(PolicyDetailResponse {
            name: policy.name_any(),
            namespace: policy.namespace().unwrap_or_default(),
            cluster_name: policy.spec.cluster_name.clone(),
            mode: policy.spec.mode,
            datacenter: policy.spec.datacenter.clone(),
            cleanup_pending: is_being_deleted(&policy) && has_finalizer(&policy),
            status: policy.status.clone().unwrap_or_default(),
            created_at: policy
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
        })),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(not_found(&namespace, &name)),
        Err(e) => {
            error!("Failed to get policy {}/{}: {:?}", namespace, name, e);
            Err(internal("get_failed", &e))
        }
    }
}

/// Request an immediate pass by stamping the policy
///
/// The metadata change wakes the controller's watch; the pass itself runs
/// on the leader.
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn trigger_reconcile(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ReconcileResponse>), ApiError> {
    let api: Api<CassandraAccessPolicy> = Api::namespaced(state.client.clone(), &namespace);
    let requested_at = chrono::Utc::now().to_rfc3339();
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { RECONCILE_REQUESTED_ANNOTATION: requested_at }
        }
    });

    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            info!("Reconciliation requested for {}/{}", namespace, name);
            Ok((
                StatusCode::ACCEPTED,
                Json(ReconcileResponse {
                    name,
                    namespace,
                    requested_at,
                }),
            ))
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Err(not_found(&namespace, &name)),
        Err(e) => {
            error!("Failed to request reconcile of {}/{}: {:?}", namespace, name, e);
            Err(internal("reconcile_failed", &e))
        }
    }
}
