//! Model name extraction from inbound requests.
//!
//! Clients name the model in many places: the JSON body, nested body fields,
//! the URL path, the query string, or a header. Each place is one
//! `ExtractionStrategy`; strategies run in a fixed order and the first match wins.

use axum::http::{HeaderMap, Method};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

/// Endpoint whose body may carry the model under the legacy `name` field.
pub const GENERATE_PATH: &str = "/api/generate";

static PATH_TEMPLATES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:^|/)chat/([^/]+)/?$",
        r"(?:^|/)embeddings/([^/]+)/?$",
        r"^/v1/models/([^/]+)/?$",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// What the extractor sees of a request.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a Value>,
}

/// Where a model name can be found, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// `{"model": ...}`
    BodyModel,
    /// `{"name": ...}` on the generate endpoint.
    BodyLegacyName,
    /// `messages[0].model` or `parameters.model`.
    BodyNested,
    /// `/chat/X`, `/embeddings/X`, `/v1/models/X`.
    PathTemplate,
    /// `?model=X`
    QueryParameter,
    /// `ollama-model` or `x-model`.
    Header,
}

impl ExtractionStrategy {
    pub const ORDER: [ExtractionStrategy; 6] = [
        ExtractionStrategy::BodyModel,
        ExtractionStrategy::BodyLegacyName,
        ExtractionStrategy::BodyNested,
        ExtractionStrategy::PathTemplate,
        ExtractionStrategy::QueryParameter,
        ExtractionStrategy::Header,
    ];

    /// Run this strategy alone.
    pub fn apply(self, req: &InboundRequest<'_>) -> Option<String> {
        let found = match self {
            ExtractionStrategy::BodyModel => req.body.and_then(|b| str_at(b, &["model"])),
            ExtractionStrategy::BodyLegacyName => {
                if req.path.trim_end_matches('/') == GENERATE_PATH {
                    req.body.and_then(|b| str_at(b, &["name"]))
                } else {
                    None
                }
            }
            ExtractionStrategy::BodyNested => req.body.and_then(|b| {
                b.get("messages")
                    .and_then(|m| m.get(0))
                    .and_then(|first| str_at(first, &["model"]))
                    .or_else(|| str_at(b, &["parameters", "model"]))
            }),
            ExtractionStrategy::PathTemplate => PATH_TEMPLATES.iter().find_map(|re| {
                let segment = re.captures(req.path)?.get(1)?.as_str();
                // `/v1/chat/completions` is an endpoint, not a model.
                if segment == "completions" {
                    return None;
                }
                urlencoding::decode(segment).ok().map(|s| s.into_owned())
            }),
            ExtractionStrategy::QueryParameter => query_param(req.query, "model"),
            ExtractionStrategy::Header => ["ollama-model", "x-model"].iter().find_map(|name| {
                req.headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_string())
            }),
        };
        found.filter(|name| !name.is_empty())
    }
}

/// A model name and the strategy that found it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extraction {
    pub model: String,
    pub strategy: ExtractionStrategy,
}

/// Determine the target model of a request. `None` is not an error: listing
/// endpoints, for instance, never name a model.
pub fn extract_model(req: &InboundRequest<'_>) -> Option<Extraction> {
    log_context_size(req);

    let extraction = ExtractionStrategy::ORDER.iter().find_map(|strategy| {
        strategy.apply(req).map(|model| Extraction {
            model,
            strategy: *strategy,
        })
    });

    match &extraction {
        Some(found) => debug!(
            method = %req.method,
            path = req.path,
            model = %found.model,
            strategy = ?found.strategy,
            "Extracted model"
        ),
        None => debug!(method = %req.method, path = req.path, "No model in request"),
    }
    extraction
}

/// Where `num_ctx` was given, if anywhere.
pub fn context_size(req: &InboundRequest<'_>) -> Option<(u64, &'static str)> {
    if let Some(body) = req.body {
        let candidates: [(&[&str], &'static str); 3] = [
            (&["options", "num_ctx"], "body.options"),
            (&["num_ctx"], "body"),
            (&["parameters", "num_ctx"], "body.parameters"),
        ];
        for (path, source) in candidates {
            if let Some(n) = value_at(body, path).and_then(as_u64_lenient) {
                return Some((n, source));
            }
        }
    }
    query_param(req.query, "num_ctx")
        .and_then(|v| v.parse().ok())
        .map(|n| (n, "query"))
}

fn log_context_size(req: &InboundRequest<'_>) {
    match context_size(req) {
        Some((num_ctx, source)) => debug!(num_ctx, source, path = req.path, "num_ctx present"),
        None => debug!(path = req.path, "num_ctx absent"),
    }
}

fn value_at<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    value_at(value, path)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

fn as_u64_lenient(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
}
