//! HTTP request handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, MethodRouter};
use axum::Json;
use k8s_openapi::api::autoscaling::v1::Scale;
use kubelive_core::{ResourceKind, ResourceSnapshot};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: i32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub subscribers: usize,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        subscribers: state.hub().subscriber_count(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Fresh list of one kind.
pub async fn list_objects(state: Arc<AppState>, kind: ResourceKind) -> ServerResult<Json<Vec<ResourceSnapshot>>> {
    Ok(Json(state.api().list(kind).await?))
}

/// GET route serving the list of `kind`.
pub fn list_route(kind: ResourceKind) -> MethodRouter<Arc<AppState>> {
    get(move |State(state): State<Arc<AppState>>| list_objects(state, kind))
}

/// POST /deployment/scale/{name}
pub async fn scale_deployment(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Result<Json<ScaleRequest>, JsonRejection>,
) -> ServerResult<Json<Scale>> {
    let Json(req) = body.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    Ok(Json(state.api().scale_deployment(&name, req.replicas).await?))
}

/// DELETE /pod/{name}
pub async fn delete_pod(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ServerResult<StatusCode> {
    state.api().delete_pod(&name).await?;
    Ok(StatusCode::OK)
}
