//! Reconciles mappings against what the backends actually have loaded.

use crate::cache::{RunningModelCache, RunningSnapshot};
use crate::error::StoreError;
use crate::mapping::MappingStore;
use crate::topology::Topology;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// A model loaded on more than one instance at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateModel {
    pub model: String,
    pub instances: Vec<String>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub fixed: usize,
    pub duplicates: Vec<DuplicateModel>,
}

pub struct ConsistencyChecker {
    cache: Arc<RunningModelCache>,
    mappings: Arc<MappingStore>,
    topology: Topology,
}

impl ConsistencyChecker {
    pub fn new(cache: Arc<RunningModelCache>, mappings: Arc<MappingStore>, topology: Topology) -> Self {
        Self {
            cache,
            mappings,
            topology,
        }
    }

    /// Point every running model's mapping at an instance that has it.
    ///
    /// Returns how many mappings were missing or wrong. A correct mapping
    /// that is merely flagged not running is upgraded without counting.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let snapshot = self.cache.snapshot(true).await;

        // Mapped aliases (`llama3` for `llama3:latest`) are checked too.
        let mut models: BTreeSet<String> = snapshot.models.keys().cloned().collect();
        models.extend(self.mappings.all_mappings().await?.into_iter().map(|m| m.model));

        let mut fixed = 0;
        for model in models {
            let mut running = snapshot.instances_for(&model);
            if running.is_empty() {
                continue;
            }
            self.topology.sort_instances(&mut running);

            match self.mappings.get_mapping_info(&model).await? {
                Some(mapping) if running.contains(&mapping.instance) => {
                    if !mapping.running {
                        self.mappings
                            .set_mapping(&model, &mapping.instance, true)
                            .await?;
                    }
                }
                current => {
                    let target = &running[0];
                    info!(
                        model = %model,
                        from = current.as_ref().map(|m| m.instance.as_str()).unwrap_or("-"),
                        to = %target,
                        "Reconciled mapping"
                    );
                    self.mappings.set_mapping(&model, target, true).await?;
                    fixed += 1;
                }
            }
        }
        Ok(fixed)
    }

    /// Models loaded on more than one instance. Reported only, never fixed.
    pub async fn detect_duplicates(&self) -> Vec<DuplicateModel> {
        let snapshot = self.cache.snapshot(false).await;
        duplicates_in(&snapshot, &self.topology)
    }

    /// `reconcile` followed by `detect_duplicates`.
    pub async fn check(&self) -> Result<ReconcileReport, StoreError> {
        let fixed = self.reconcile().await?;
        let duplicates = self.detect_duplicates().await;
        for duplicate in &duplicates {
            warn!(
                model = %duplicate.model,
                instances = ?duplicate.instances,
                "Model loaded on several instances"
            );
        }
        Ok(ReconcileReport { fixed, duplicates })
    }
}

fn duplicates_in(snapshot: &RunningSnapshot, topology: &Topology) -> Vec<DuplicateModel> {
    snapshot
        .models
        .iter()
        .filter(|(_, instances)| instances.len() > 1)
        .map(|(model, instances)| {
            let mut instances = instances.clone();
            topology.sort_instances(&mut instances);
            DuplicateModel {
                model: model.clone(),
                instances,
            }
        })
        .collect()
}
