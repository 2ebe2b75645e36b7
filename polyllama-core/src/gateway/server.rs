//! HTTP server built on axum.

use super::AppState;
use super::api::{
    instances_handler, list_pulls_handler, mappings_handler, ps_handler, pull_status_handler,
    reconcile_handler, search_handler, start_pull_handler, status_handler, tags_handler,
};
use super::proxy::proxy_handler;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::{get, post},
};
use std::future::Future;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the axum Router: router endpoints, merged listings, and the
/// forwarding fallback.
pub fn router(state: AppState) -> Router {
    let max_body = state.router.config().server.max_body_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/tags", get(tags_handler))
        .route("/api/ps", get(ps_handler))
        .route("/api/router/pull", post(start_pull_handler))
        .route("/api/router/pull/{id}", get(pull_status_handler))
        .route("/api/router/pulls", get(list_pulls_handler))
        .route("/api/router/search", get(search_handler))
        .route("/api/router/mappings", get(mappings_handler))
        .route("/api/router/reconcile", post(reconcile_handler))
        .route("/api/router/status", get(status_handler))
        .route("/api/router/instances", post(instances_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "instances": state.router.topology().count(),
        "uptime_secs": state.router.metrics().uptime_secs(),
    }))
}

/// Serve on the configured address until `shutdown` resolves.
pub async fn run<F>(state: AppState, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = {
        let server = &state.router.config().server;
        format!("{}:{}", server.host, server.port)
    };
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Router listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::RouterConfig;
    use crate::error::CatalogError;
    use crate::router::ModelRouter;
    use crate::search::{CatalogModel, ModelCatalog};
    use crate::store::MemoryStore;
    use crate::topology::Topology;
    use async_trait::async_trait;
    use axum::body::Body;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NoCatalog;

    #[async_trait]
    impl ModelCatalog for NoCatalog {
        async fn search(&self, _query: &str) -> Result<Vec<CatalogModel>, CatalogError> {
            Ok(Vec::new())
        }
    }

    fn make_state(instances: usize) -> AppState {
        let router = ModelRouter::new(
            RouterConfig::default(),
            Topology::with_count(instances),
            Arc::new(MemoryStore::new()),
            Arc::new(MockBackend::new()),
            Arc::new(NoCatalog),
        );
        AppState::new(Arc::new(router))
    }

    #[test]
    fn test_router_builds() {
        let _app = router(make_state(1));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(make_state(3));

        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["instances"], 3);
    }

    #[tokio::test]
    async fn test_unknown_target_instance_rejected() {
        let app = router(make_state(2));
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/generate")
            .header("x-target-instance", "polyllama9")
            .body(Body::from(r#"{"model":"llama3"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 400);
    }
}
