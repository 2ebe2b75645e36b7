//! Integration tests for the router's own HTTP endpoints.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use polyllama_core::error::CatalogError;
use polyllama_core::search::CatalogModel;
use polyllama_core::{
    AppState, MemoryStore, MockBackend, ModelCatalog, ModelRouter, RouterConfig, Topology,
    gateway_router,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct StubCatalog;

#[async_trait]
impl ModelCatalog for StubCatalog {
    async fn search(&self, query: &str) -> Result<Vec<CatalogModel>, CatalogError> {
        let all = [
            ("llama3", "Meta Llama 3"),
            ("llama3.1", "Meta Llama 3.1"),
            ("mistral", "Mistral 7B"),
        ];
        Ok(all
            .iter()
            .filter(|(name, _)| name.contains(query))
            .map(|(name, description)| CatalogModel {
                name: name.to_string(),
                description: description.to_string(),
                tags: vec!["latest".to_string()],
                pulls: None,
            })
            .collect())
    }
}

struct Harness {
    backend: Arc<MockBackend>,
    router: Arc<ModelRouter>,
}

impl Harness {
    fn new(instances: usize) -> Self {
        let backend = Arc::new(MockBackend::new());
        let router = Arc::new(ModelRouter::new(
            RouterConfig::default(),
            Topology::with_count(instances),
            Arc::new(MemoryStore::new()),
            backend.clone(),
            Arc::new(StubCatalog),
        ));
        Self { backend, router }
    }

    async fn send(&self, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let app = gateway_router(AppState::new(self.router.clone()));
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, request)
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            axum::http::Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
    }
}

// --- /api/tags and /api/ps ---

#[tokio::test]
async fn test_tags_merges_instances() {
    let h = Harness::new(2);
    h.backend.set_available("polyllama1", &["llama3:latest"]);
    h.backend
        .set_available("polyllama2", &["llama3:latest", "mistral:latest"]);

    let (status, json) = h.get("/api/tags").await;
    assert_eq!(status, StatusCode::OK);
    let models = json["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0]["name"], "llama3:latest");
    assert_eq!(models[0]["instances"], json!(["polyllama1", "polyllama2"]));
    assert_eq!(models[1]["name"], "mistral:latest");
    assert_eq!(models[1]["instances"], json!(["polyllama2"]));
}

#[tokio::test]
async fn test_tags_skips_unreachable_instance() {
    let h = Harness::new(2);
    h.backend.set_available("polyllama1", &["llama3:latest"]);
    h.backend.set_available("polyllama2", &["mistral:latest"]);
    h.backend.set_unreachable("polyllama2", true);

    let (status, json) = h.get("/api/tags").await;
    assert_eq!(status, StatusCode::OK);
    let models = json["models"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"], "llama3:latest");
}

#[tokio::test]
async fn test_ps_lists_running_models() {
    let h = Harness::new(2);
    h.backend.set_running("polyllama2", &["mistral:latest"]);

    let (status, json) = h.get("/api/ps").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["models"][0]["name"], "mistral:latest");
    assert_eq!(json["models"][0]["instances"], json!(["polyllama2"]));
}

// --- pulls ---

#[tokio::test]
async fn test_pull_completes() {
    let h = Harness::new(2);
    let (status, json) = h
        .post("/api/router/pull", json!({"model": "llama3"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["model"], "llama3:latest");
    assert_eq!(json["instance"], "polyllama1");
    let id = json["id"].as_str().unwrap().to_string();

    let mut last = Value::Null;
    for _ in 0..100 {
        let (status, json) = h.get(&format!("/api/router/pull/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        last = json;
        if last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["status"], "completed");
    assert_eq!(last["progress"], 100);

    let (_, mappings) = h.get("/api/router/mappings").await;
    assert_eq!(
        mappings["mappings"],
        json!([{"model": "llama3:latest", "instance": "polyllama1", "running": true}])
    );
    assert_eq!(mappings["locks"], json!([]));
}

#[tokio::test]
async fn test_pull_of_running_model_conflicts() {
    let h = Harness::new(2);
    h.backend.set_running("polyllama2", &["llama3:latest"]);

    let (status, json) = h
        .post("/api/router/pull", json!({"model": "llama3"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["status"], "already_running");
    assert_eq!(json["instance"], "polyllama2");
}

#[tokio::test]
async fn test_second_pull_while_loading_conflicts() {
    let h = Harness::new(2);
    h.backend.set_pull_stream_open(true);

    let (status, _) = h
        .post(
            "/api/router/pull",
            json!({"model": "llama3", "tag": "8b", "instance": "polyllama2"}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = h
        .post("/api/router/pull", json!({"model": "llama3:8b"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["status"], "already_loading");
    assert_eq!(json["instance"], "polyllama2");
}

#[tokio::test]
async fn test_pull_rejects_bad_input() {
    let h = Harness::new(2);
    let (status, json) = h.post("/api/router/pull", json!({"model": "  "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, _) = h
        .post(
            "/api/router/pull",
            json!({"model": "llama3", "instance": "polyllama7"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pull_initiation_failure_is_reported() {
    let h = Harness::new(1);
    h.backend.set_pull_initiation_error(Some("disk full"));

    let (status, json) = h
        .post("/api/router/pull", json!({"model": "llama3"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "failed");
    assert!(json["error"].as_str().unwrap().contains("disk full"));

    let (_, mappings) = h.get("/api/router/mappings").await;
    assert_eq!(mappings["mappings"], json!([]));

    // The lock was released, so a retry can start.
    h.backend.set_pull_initiation_error(None);
    let (status, _) = h
        .post("/api/router/pull", json!({"model": "llama3"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_unknown_pull_is_404() {
    let h = Harness::new(1);
    let (status, json) = h.get("/api/router/pull/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("does-not-exist"));
}

#[tokio::test]
async fn test_list_pulls_newest_first() {
    let h = Harness::new(2);
    h.backend.set_pull_stream_open(true);
    let (_, first) = h
        .post("/api/router/pull", json!({"model": "llama3"}))
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (_, second) = h
        .post("/api/router/pull", json!({"model": "mistral"}))
        .await;

    let (status, json) = h.get("/api/router/pulls").await;
    assert_eq!(status, StatusCode::OK);
    let pulls = json["pulls"].as_array().unwrap();
    assert_eq!(pulls.len(), 2);
    assert_eq!(pulls[0]["id"], second["id"]);
    assert_eq!(pulls[1]["id"], first["id"]);
}

// --- search ---

#[tokio::test]
async fn test_search_marks_installed_models() {
    let h = Harness::new(2);
    h.backend.set_available("polyllama2", &["llama3:latest"]);

    let (status, json) = h.get("/api/router/search?q=llama3").await;
    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["name"], "llama3");
    assert_eq!(results[0]["installed_on"], json!(["polyllama2"]));
    assert_eq!(results[1]["name"], "llama3.1");
    assert_eq!(results[1]["installed_on"], json!([]));
}

#[tokio::test]
async fn test_search_limit_and_missing_query() {
    let h = Harness::new(1);
    let (status, json) = h.get("/api/router/search?q=llama&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"].as_array().unwrap().len(), 1);

    let (status, _) = h.get("/api/router/search").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// --- maintenance and status ---

#[tokio::test]
async fn test_reconcile_records_running_models() {
    let h = Harness::new(2);
    h.backend.set_running("polyllama2", &["mistral:latest"]);

    let (status, json) = h.post("/api/router/reconcile", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["fixed"], 1);
    assert_eq!(json["duplicates"], json!([]));

    let (_, mappings) = h.get("/api/router/mappings").await;
    assert_eq!(mappings["mappings"][0]["model"], "mistral:latest");
    assert_eq!(mappings["mappings"][0]["instance"], "polyllama2");
}

#[tokio::test]
async fn test_reconcile_reports_duplicates() {
    let h = Harness::new(2);
    h.backend.set_running("polyllama1", &["llama3:latest"]);
    h.backend.set_running("polyllama2", &["llama3:latest"]);

    let (_, json) = h.post("/api/router/reconcile", json!({})).await;
    assert_eq!(json["duplicates"][0]["model"], "llama3:latest");
    assert_eq!(
        json["duplicates"][0]["instances"],
        json!(["polyllama1", "polyllama2"])
    );
}

#[tokio::test]
async fn test_status_reports_pool() {
    let h = Harness::new(3);
    h.router
        .mappings()
        .set_mapping("llama3", "polyllama2", true)
        .await
        .unwrap();

    let (status, json) = h.get("/api/router/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["instance_count"], 3);
    assert_eq!(
        json["instances"],
        json!(["polyllama1", "polyllama2", "polyllama3"])
    );
    assert_eq!(json["mappings"], 1);
    assert_eq!(json["locks"], 0);
    assert!(json["routing"]["uptime_secs"].is_u64());
}

#[tokio::test]
async fn test_instance_count_change() {
    let h = Harness::new(2);
    let (status, json) = h
        .post("/api/router/instances", json!({"count": 4}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["instance_count"], 4);
    assert_eq!(json["instances"].as_array().unwrap().len(), 4);

    let (_, health) = h.get("/health").await;
    assert_eq!(health["instances"], 4);

    let (status, _) = h
        .post("/api/router/instances", json!({"count": 0}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.router.topology().count(), 4);
}
