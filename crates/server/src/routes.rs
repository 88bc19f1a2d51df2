//! Route table.

use std::sync::Arc;

use axum::routing::{delete, get, post, Router};
use kubelive_core::ResourceKind;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{delete_pod, health_check, list_route, scale_deployment};
use crate::state::AppState;
use crate::websocket::ws_upgrade;

/// Path serving the list of `kind`. Daemonsets keep their historical misspelling.
pub fn list_path(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Pods => "/pods",
        ResourceKind::Deployments => "/deployments",
        ResourceKind::Services => "/services",
        ResourceKind::ConfigMaps => "/configmaps",
        ResourceKind::Secrets => "/secrets",
        ResourceKind::ReplicaSets => "/replicasets",
        ResourceKind::DaemonSets => "/deamonsets",
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/deployment/scale/{name}", post(scale_deployment))
        .route("/pod/{name}", delete(delete_pod))
        .route("/ws", get(ws_upgrade));
    for kind in ResourceKind::ALL {
        router = router.route(list_path(kind), list_route(kind));
    }

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    router.with_state(state).layer(cors).layer(TraceLayer::new_for_http())
}
