//! Ollama HTTP implementation of `BackendClient`.

use super::{BackendClient, BackendModel, PullEvent, PullEventStream, parse_models_response};
use crate::config::BackendsConfig;
use crate::error::BackendError;
use crate::topology::Topology;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Talks to Ollama instances addressed through the `Topology`.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    topology: Topology,
    status_timeout: Duration,
    load_timeout: Duration,
    pull_initiation_timeout: Duration,
}

impl OllamaClient {
    pub fn new(topology: Topology, config: &BackendsConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_default();
        Self {
            http,
            topology,
            status_timeout: config.status_timeout(),
            load_timeout: config.load_timeout(),
            pull_initiation_timeout: config.pull_initiation_timeout(),
        }
    }

    fn url(&self, instance: &str, path: &str) -> String {
        format!("{}{}", self.topology.base_url(instance), path)
    }

    fn map_send_error(instance: &str, timeout: Duration, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout {
                instance: instance.to_string(),
                timeout_secs: timeout.as_secs(),
            }
        } else {
            BackendError::Request {
                instance: instance.to_string(),
                message: e.to_string(),
            }
        }
    }

    async fn ensure_success(
        instance: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            instance: instance.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn get_models(&self, instance: &str, path: &str) -> Result<Vec<BackendModel>, BackendError> {
        let url = self.url(instance, path);
        debug!(instance, url = %url, "Listing backend models");

        let response = self
            .http
            .get(&url)
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(instance, self.status_timeout, e))?;
        let response = Self::ensure_success(instance, response).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::ResponseParse {
                instance: instance.to_string(),
                message: e.to_string(),
            })?;
        parse_models_response(instance, &body)
    }

    async fn post_generate(
        &self,
        instance: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url(instance, "/api/generate"))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(instance, timeout, e))?;
        let response = Self::ensure_success(instance, response).await?;
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(message) = body.get("error").and_then(|e| e.as_str()) {
            return Err(BackendError::Remote {
                instance: instance.to_string(),
                message: message.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for OllamaClient {
    async fn list_running(&self, instance: &str) -> Result<Vec<BackendModel>, BackendError> {
        self.get_models(instance, "/api/ps").await
    }

    async fn list_available(&self, instance: &str) -> Result<Vec<BackendModel>, BackendError> {
        self.get_models(instance, "/api/tags").await
    }

    async fn pull(&self, instance: &str, model: &str) -> Result<PullEventStream, BackendError> {
        debug!(instance, model, "Starting backend pull");
        // Only the initiation is bounded; the download itself can take far longer.
        let send = self
            .http
            .post(self.url(instance, "/api/pull"))
            .json(&json!({ "model": model, "stream": true }))
            .send();
        let response = tokio::time::timeout(self.pull_initiation_timeout, send)
            .await
            .map_err(|_| BackendError::Timeout {
                instance: instance.to_string(),
                timeout_secs: self.pull_initiation_timeout.as_secs(),
            })?
            .map_err(|e| Self::map_send_error(instance, self.pull_initiation_timeout, e))?;
        let response = Self::ensure_success(instance, response).await?;
        Ok(ndjson_pull_events(instance.to_string(), response.bytes_stream()))
    }

    async fn load(&self, instance: &str, model: &str) -> Result<(), BackendError> {
        debug!(instance, model, "Loading model");
        self.post_generate(
            instance,
            json!({ "model": model, "prompt": "", "stream": false }),
            self.load_timeout,
        )
        .await
    }
}

struct NdjsonState<S> {
    chunks: Pin<Box<S>>,
    buf: Vec<u8>,
    done: bool,
    instance: String,
}

/// Split a byte stream into newline-delimited pull events.
///
/// A transport error ends the stream after being yielded once.
pub(crate) fn ndjson_pull_events<S, B, E>(instance: String, chunks: S) -> PullEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = NdjsonState {
        chunks: Box::pin(chunks),
        buf: Vec::new(),
        done: false,
        instance,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buf.drain(..=pos).collect();
                match parse_pull_line(&state.instance, &line) {
                    Some(event) => return Some((event, state)),
                    None => continue,
                }
            }
            if state.done {
                let rest = std::mem::take(&mut state.buf);
                return parse_pull_line(&state.instance, &rest).map(|event| (event, state));
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    state.buf.clear();
                    let err = BackendError::Request {
                        instance: state.instance.clone(),
                        message: format!("pull stream interrupted: {e}"),
                    };
                    return Some((Err(err), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

fn parse_pull_line(instance: &str, line: &[u8]) -> Option<Result<PullEvent, BackendError>> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Some(Err(BackendError::ResponseParse {
                instance: instance.to_string(),
                message: format!("bad pull event: {e}"),
            }));
        }
    };
    if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
        return Some(Err(BackendError::Remote {
            instance: instance.to_string(),
            message: message.to_string(),
        }));
    }
    Some(
        serde_json::from_value::<PullEvent>(value).map_err(|e| BackendError::ResponseParse {
            instance: instance.to_string(),
            message: e.to_string(),
        }),
    )
}
