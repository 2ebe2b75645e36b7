//! Model discovery against an external catalog.

use crate::backend::BackendClient;
use crate::config::SearchConfig;
use crate::error::CatalogError;
use crate::inventory::{PooledModel, available_models};
use crate::topology::Topology;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulls: Option<u64>,
}

/// A catalog entry annotated with local availability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub model: CatalogModel,
    pub installed_on: Vec<String>,
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<CatalogModel>, CatalogError>;
}

/// Accepts `{"models": [...]}` or a bare array.
pub fn parse_catalog_response(body: &Value) -> Result<Vec<CatalogModel>, CatalogError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(object) => object
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| CatalogError::ResponseParse {
                message: "Missing 'models' array".to_string(),
            })?,
        _ => {
            return Err(CatalogError::ResponseParse {
                message: "Expected an object or array".to_string(),
            });
        }
    };
    Ok(entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<CatalogModel>(entry.clone()).ok())
        .collect())
}

/// Catalog reached over HTTP: `GET {url}?q=<query>`.
pub struct HttpCatalog {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.catalog_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl ModelCatalog for HttpCatalog {
    async fn search(&self, query: &str) -> Result<Vec<CatalogModel>, CatalogError> {
        debug!(url = %self.url, query, "Searching model catalog");
        let response = self
            .http
            .get(&self.url)
            .query(&[("q", query)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CatalogError::Request {
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(CatalogError::Status {
                status: response.status().as_u16(),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| CatalogError::ResponseParse {
                message: e.to_string(),
            })?;
        parse_catalog_response(&body)
    }
}

/// Whether the catalog name `name` covers the local model `local`.
fn covers(name: &str, local: &str) -> bool {
    local == name
        || local
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with(':'))
}

fn installed_on(name: &str, available: &[PooledModel]) -> Vec<String> {
    let mut instances: Vec<String> = Vec::new();
    for model in available.iter().filter(|m| covers(name, &m.model.name)) {
        for instance in &model.instances {
            if !instances.contains(instance) {
                instances.push(instance.clone());
            }
        }
    }
    instances
}

pub struct ModelSearch {
    catalog: Arc<dyn ModelCatalog>,
    backend: Arc<dyn BackendClient>,
    topology: Topology,
    default_limit: usize,
}

impl ModelSearch {
    pub fn new(
        catalog: Arc<dyn ModelCatalog>,
        backend: Arc<dyn BackendClient>,
        topology: Topology,
        default_limit: usize,
    ) -> Self {
        Self {
            catalog,
            backend,
            topology,
            default_limit,
        }
    }

    /// Search the catalog and mark which results are already on disk.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResult>, CatalogError> {
        let limit = limit.unwrap_or(self.default_limit);
        let mut found = self.catalog.search(query.trim()).await?;
        found.truncate(limit);

        let available = available_models(self.backend.as_ref(), &self.topology).await;
        let mut results: Vec<SearchResult> = found
            .into_iter()
            .map(|model| {
                let mut installed_on = installed_on(&model.name, &available);
                self.topology.sort_instances(&mut installed_on);
                SearchResult {
                    model,
                    installed_on,
                }
            })
            .collect();
        results.dedup_by(|a, b| a.model.name == b.model.name);
        Ok(results)
    }
}
