//! Forwarding of routed requests to backend instances.

use super::AppState;
use super::api::ApiError;
use crate::error::{BackendError, RouterError};
use crate::extract::{InboundRequest, extract_model};
use crate::router::{ModelRouter, RouteDecision};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, Method, Uri, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Header forcing a request onto one instance, bypassing routing.
pub const TARGET_INSTANCE_HEADER: &str = "x-target-instance";

/// Headers that describe one hop and are never copied across.
fn is_hop_header(name: &HeaderName) -> bool {
    *name == header::HOST
        || *name == header::CONTENT_LENGTH
        || *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_header(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Relays requests to a backend and streams the answer back.
#[derive(Debug, Clone)]
pub struct Forwarder {
    http: reqwest::Client,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        // No overall timeout: generations stream for as long as they need.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Send the request to `base_url` and relay status, headers and body.
    pub async fn forward(
        &self,
        instance: &str,
        base_url: &str,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, BackendError> {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = format!("{base_url}{path_and_query}");
        debug!(instance, url = %url, %method, "Forwarding request");

        let mut outbound = HeaderMap::new();
        copy_headers(headers, &mut outbound);
        outbound.remove(TARGET_INSTANCE_HEADER);

        let upstream = self
            .http
            .request(method.clone(), &url)
            .headers(outbound)
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::Request {
                instance: instance.to_string(),
                message: e.to_string(),
            })?;

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        copy_headers(upstream.headers(), &mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// A forward that triggers a model load and owns its loading lock.
struct LoadForward {
    router: Arc<ModelRouter>,
    forwarder: Forwarder,
    model: String,
    instance: String,
    base_url: String,
}

impl LoadForward {
    /// Forward on a detached task that releases the lock once the backend
    /// answers, whether or not the client is still waiting.
    async fn run(self, parts: &Parts, body: Bytes) -> Result<Response, BackendError> {
        let instance = self.instance.clone();
        let (method, uri, headers) = (parts.method.clone(), parts.uri.clone(), parts.headers.clone());
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = self
                .forwarder
                .forward(
                    &self.instance,
                    &self.base_url,
                    &method,
                    &uri,
                    &headers,
                    body,
                )
                .await;
            if let Err(e) = self.router.finish_load(&self.model).await {
                warn!(model = %self.model, error = %e, "Could not release loading lock");
            }
            if tx.send(result).is_err() {
                debug!(model = %self.model, "Client left before the load finished");
            }
        });
        rx.await.unwrap_or_else(|_| {
            Err(BackendError::Request {
                instance,
                message: "forwarding task ended without an answer".to_string(),
            })
        })
    }
}

/// Everything not answered by the router itself: extract the model, route,
/// forward.
pub(super) async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let router = &state.router;
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, router.config().server.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            return ApiError::bad_request(format!("Unreadable request body: {e}")).into_response();
        }
    };
    let json: Option<Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(&body).ok()
    };
    let inbound = InboundRequest {
        method: &parts.method,
        path: parts.uri.path(),
        query: parts.uri.query(),
        headers: &parts.headers,
        body: json.as_ref(),
    };

    let forced = parts
        .headers
        .get(TARGET_INSTANCE_HEADER)
        .map(|v| v.to_str().unwrap_or_default().trim().to_string());

    let mut model = None;
    let decision = if let Some(name) = forced {
        if !router.topology().contains(&name) {
            return ApiError::from(RouterError::UnknownInstance { name }).into_response();
        }
        debug!(instance = %name, "Explicit target instance");
        RouteDecision::Serve { instance: name }
    } else if let Some(extraction) = extract_model(&inbound) {
        let decision = match router.route(&extraction.model).await {
            Ok(decision) => decision,
            Err(e) => return ApiError::from(e).into_response(),
        };
        model = Some(extraction.model);
        decision
    } else {
        router.metrics().record_extraction_miss();
        match router.topology().instances().into_iter().next() {
            Some(instance) => RouteDecision::Serve { instance },
            None => return ApiError::from(RouterError::NoInstances).into_response(),
        }
    };

    let instance = decision.instance().to_string();
    let base_url = router.topology().base_url(&instance);
    let result = match model.filter(|_| decision.holds_lock()) {
        Some(model) => {
            let load = LoadForward {
                router: router.clone(),
                forwarder: state.forwarder.clone(),
                model,
                instance: instance.clone(),
                base_url,
            };
            load.run(&parts, body).await
        }
        None => {
            state
                .forwarder
                .forward(
                    &instance,
                    &base_url,
                    &parts.method,
                    &parts.uri,
                    &parts.headers,
                    body,
                )
                .await
        }
    };

    match result {
        Ok(response) => {
            router.metrics().record_routed();
            response
        }
        Err(e) => {
            router.metrics().record_forwarding_failure();
            warn!(instance = %instance, path = %parts.uri.path(), error = %e, "Forwarding failed");
            ApiError::from(e).into_response()
        }
    }
}
