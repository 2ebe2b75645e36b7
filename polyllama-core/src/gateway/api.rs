//! Router endpoints and error mapping.

use super::AppState;
use crate::error::{BackendError, PullError, RouterError};
use crate::pull::PullStart;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// An error answered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        let status = match &err {
            RouterError::Pull(PullError::NotFound { .. }) => StatusCode::NOT_FOUND,
            RouterError::Pull(PullError::InvalidModel { .. })
            | RouterError::UnknownInstance { .. } => StatusCode::BAD_REQUEST,
            RouterError::Backend(_) | RouterError::Catalog(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        RouterError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

pub(super) async fn tags_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "models": state.router.available_models().await }))
}

pub(super) async fn ps_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "models": state.router.running_models().await }))
}

#[derive(Debug, Deserialize)]
pub(super) struct PullRequest {
    model: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    instance: Option<String>,
}

pub(super) async fn start_pull_handler(
    State(state): State<AppState>,
    Json(request): Json<PullRequest>,
) -> ApiResult {
    let start = state
        .router
        .pulls()
        .start(
            &request.model,
            request.tag.as_deref(),
            request.instance.as_deref(),
        )
        .await?;
    Ok(match start {
        PullStart::Started(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        PullStart::AlreadyRunning { instance } => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running", "instance": instance })),
        )
            .into_response(),
        PullStart::AlreadyLoading { owner } => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_loading", "instance": owner })),
        )
            .into_response(),
    })
}

pub(super) async fn pull_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let status = state.router.pulls().poll(&id).await?;
    Ok(Json(status).into_response())
}

pub(super) async fn list_pulls_handler(State(state): State<AppState>) -> ApiResult {
    let pulls = state.router.pulls().list().await?;
    Ok(Json(json!({ "pulls": pulls })).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub(super) async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult {
    if params.q.trim().is_empty() {
        return Err(ApiError::bad_request("Query parameter 'q' is required"));
    }
    let results = state
        .router
        .search()
        .search(&params.q, params.limit)
        .await
        .map_err(RouterError::from)?;
    Ok(Json(json!({ "results": results })).into_response())
}

pub(super) async fn mappings_handler(State(state): State<AppState>) -> ApiResult {
    let mappings = state
        .router
        .mappings()
        .all_mappings()
        .await
        .map_err(RouterError::from)?;
    let locks = state.router.locks().locks().await?;
    Ok(Json(json!({ "mappings": mappings, "locks": locks })).into_response())
}

pub(super) async fn reconcile_handler(State(state): State<AppState>) -> ApiResult {
    let report = state.router.reconcile().await?;
    Ok(Json(report).into_response())
}

pub(super) async fn status_handler(State(state): State<AppState>) -> ApiResult {
    let status = state.router.status().await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct InstanceCountRequest {
    count: usize,
}

pub(super) async fn instances_handler(
    State(state): State<AppState>,
    Json(request): Json<InstanceCountRequest>,
) -> ApiResult {
    if request.count == 0 {
        return Err(ApiError::bad_request("count must be at least 1"));
    }
    state.router.set_instance_count(request.count);
    let topology = state.router.topology();
    Ok(Json(json!({
        "instance_count": topology.count(),
        "instances": topology.instances(),
    }))
    .into_response())
}
