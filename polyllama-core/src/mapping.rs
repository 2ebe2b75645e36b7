//! Model → instance assignments kept in the shared store.

use crate::cache::RunningModelCache;
use crate::error::StoreError;
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key prefix of mapping records.
pub const MAPPING_PREFIX: &str = "mapping:";

/// The instance responsible for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub model: String,
    pub instance: String,
    /// Whether the model was last seen loaded on `instance`.
    pub running: bool,
}

/// Stored form of a mapping; the model is the key.
#[derive(Debug, Serialize, Deserialize)]
struct MappingRecord {
    instance: String,
    #[serde(default)]
    running: bool,
}

pub fn mapping_key(model: &str) -> String {
    format!("{MAPPING_PREFIX}{model}")
}

/// Encode a mapping value.
pub fn encode_mapping(instance: &str, running: bool) -> String {
    serde_json::json!({ "instance": instance, "running": running }).to_string()
}

/// Decode a mapping value. A bare instance name reads as `running = false`.
pub fn decode_mapping(model: &str, raw: &str) -> Result<ModelMapping, StoreError> {
    let raw = raw.trim();
    let corrupted = |message: String| StoreError::Corrupted {
        key: mapping_key(model),
        message,
    };

    let record = if raw.starts_with('{') {
        serde_json::from_str::<MappingRecord>(raw).map_err(|e| corrupted(e.to_string()))?
    } else {
        MappingRecord {
            instance: raw.to_string(),
            running: false,
        }
    };
    if record.instance.is_empty() {
        return Err(corrupted("empty instance".to_string()));
    }

    Ok(ModelMapping {
        model: model.to_string(),
        instance: record.instance,
        running: record.running,
    })
}

/// Accessors over the mapping records.
///
/// Every write that changes a record invalidates the running-model cache;
/// writing the record it already holds is a no-op.
pub struct MappingStore {
    store: Arc<dyn StateStore>,
    cache: Arc<RunningModelCache>,
}

impl MappingStore {
    pub fn new(store: Arc<dyn StateStore>, cache: Arc<RunningModelCache>) -> Self {
        Self { store, cache }
    }

    /// Full record for `model`. Unreadable records count as missing.
    pub async fn get_mapping_info(&self, model: &str) -> Result<Option<ModelMapping>, StoreError> {
        let Some(raw) = self.store.get(&mapping_key(model)).await? else {
            return Ok(None);
        };
        match decode_mapping(model, &raw) {
            Ok(mapping) => Ok(Some(mapping)),
            Err(e) => {
                warn!(model, error = %e, "Ignoring unreadable mapping");
                Ok(None)
            }
        }
    }

    pub async fn get_instance(&self, model: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_mapping_info(model).await?.map(|m| m.instance))
    }

    /// Record `model → instance`. Returns whether anything was written.
    pub async fn set_mapping(
        &self,
        model: &str,
        instance: &str,
        running: bool,
    ) -> Result<bool, StoreError> {
        if let Some(current) = self.get_mapping_info(model).await?
            && current.instance == instance
            && current.running == running
        {
            return Ok(false);
        }

        self.store
            .set(&mapping_key(model), &encode_mapping(instance, running), None)
            .await?;
        self.cache.invalidate();
        debug!(model, instance, running, "Mapping updated");
        Ok(true)
    }

    /// Remove the mapping of `model`. Returns whether one existed.
    pub async fn delete_mapping(&self, model: &str) -> Result<bool, StoreError> {
        let key = mapping_key(model);
        if self.store.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(&key).await?;
        self.cache.invalidate();
        debug!(model, "Mapping deleted");
        Ok(true)
    }

    /// Every readable mapping, sorted by model name.
    pub async fn all_mappings(&self) -> Result<Vec<ModelMapping>, StoreError> {
        let mut mappings = Vec::new();
        for key in self.store.keys(MAPPING_PREFIX).await? {
            let model = &key[MAPPING_PREFIX.len()..];
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match decode_mapping(model, &raw) {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => warn!(model, error = %e, "Skipping unreadable mapping"),
            }
        }
        Ok(mappings)
    }
}
