//! Backend client: the only I/O boundary to the inference instances.
//!
//! Defines the `BackendClient` trait for instance-agnostic calls ("list loaded
//! models", "list available models", "pull", "load"), the Ollama HTTP
//! implementation, and a mock used by tests.

mod mock;
mod ollama;

pub use mock::MockBackend;
pub use ollama::OllamaClient;

use crate::error::BackendError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A model as reported by a backend. Fields other than the name are kept
/// verbatim so merged listings expose everything the backend said.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendModel {
    pub name: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl BackendModel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: Map::new(),
        }
    }
}

/// One progress event of a streamed pull.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullEvent {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl PullEvent {
    pub fn stage(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn download(completed: u64, total: u64) -> Self {
        Self {
            status: "downloading".to_string(),
            digest: None,
            total: Some(total),
            completed: Some(completed),
        }
    }

    /// Download percentage carried by this event, if any.
    pub fn percent(&self) -> Option<u8> {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => {
                Some((completed.min(total) * 100 / total) as u8)
            }
            _ => None,
        }
    }

    /// Whether this is the terminal success event.
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Stream of pull progress events; ends after the backend closes the response.
pub type PullEventStream = BoxStream<'static, Result<PullEvent, BackendError>>;

/// Calls a backend instance can answer. Every method is bounded by a timeout.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Models currently loaded in memory on `instance`.
    async fn list_running(&self, instance: &str) -> Result<Vec<BackendModel>, BackendError>;

    /// Models present on disk on `instance`.
    async fn list_available(&self, instance: &str) -> Result<Vec<BackendModel>, BackendError>;

    /// Start downloading `model`. Returns once the backend has accepted the
    /// pull; progress is delivered through the stream.
    async fn pull(&self, instance: &str, model: &str) -> Result<PullEventStream, BackendError>;

    /// Load `model` into memory without generating anything.
    async fn load(&self, instance: &str, model: &str) -> Result<(), BackendError>;
}

/// Whether a requested model name refers to a name reported by a backend.
///
/// An untagged request name matches the `:latest` tag.
pub fn same_model(requested: &str, reported: &str) -> bool {
    if requested == reported {
        return true;
    }
    if !requested.contains(':') {
        return reported
            .strip_suffix(":latest")
            .is_some_and(|base| base == requested);
    }
    if !reported.contains(':') {
        return requested
            .strip_suffix(":latest")
            .is_some_and(|base| base == reported);
    }
    false
}

/// Fully tagged form of a model name: an untagged name gets `:latest`.
pub fn canonical_model(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

/// Parse an Ollama `{"models": [...]}` listing (`/api/ps`, `/api/tags`).
///
/// Entries without a `name` (or `model`) string are skipped.
pub fn parse_models_response(instance: &str, body: &Value) -> Result<Vec<BackendModel>, BackendError> {
    let models = body
        .get("models")
        .and_then(|m| m.as_array())
        .ok_or_else(|| BackendError::ResponseParse {
            instance: instance.to_string(),
            message: "Missing 'models' array".to_string(),
        })?;

    Ok(models
        .iter()
        .filter_map(|m| {
            let object = m.as_object()?;
            let name = object
                .get("name")
                .or_else(|| object.get("model"))?
                .as_str()?
                .to_string();
            let mut details = object.clone();
            details.remove("name");
            Some(BackendModel { name, details })
        })
        .collect())
}
