//! Merged listings across the pool.

use crate::backend::{BackendClient, BackendModel};
use crate::cache::RunningSnapshot;
use crate::topology::Topology;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// A model with the instances that hold it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PooledModel {
    #[serde(flatten)]
    pub model: BackendModel,
    pub instances: Vec<String>,
}

/// Merge per-instance listings into one entry per name, sorted by name.
///
/// The first instance's record supplies the details; instances keep the order
/// of `listings`.
pub fn merge_listings<'a, I>(listings: I) -> Vec<PooledModel>
where
    I: IntoIterator<Item = (&'a str, &'a [BackendModel])>,
{
    let mut merged: BTreeMap<String, PooledModel> = BTreeMap::new();
    for (instance, models) in listings {
        for model in models {
            let entry = merged
                .entry(model.name.clone())
                .or_insert_with(|| PooledModel {
                    model: model.clone(),
                    instances: Vec::new(),
                });
            if !entry.instances.iter().any(|i| i == instance) {
                entry.instances.push(instance.to_string());
            }
        }
    }
    merged.into_values().collect()
}

/// Models on disk anywhere in the pool. Unreachable instances contribute
/// nothing.
pub async fn available_models(backend: &dyn BackendClient, topology: &Topology) -> Vec<PooledModel> {
    let instances = topology.instances();
    let listings = futures::future::join_all(instances.iter().map(|instance| async move {
        match backend.list_available(instance).await {
            Ok(models) => models,
            Err(e) => {
                warn!(instance = %instance, error = %e, "Instance left out of model listing");
                Vec::new()
            }
        }
    }))
    .await;

    merge_listings(
        instances
            .iter()
            .map(String::as_str)
            .zip(listings.iter().map(Vec::as_slice)),
    )
}

/// Models loaded anywhere in the pool, from a running-model snapshot.
pub fn running_models(snapshot: &RunningSnapshot) -> Vec<PooledModel> {
    merge_listings(
        snapshot
            .per_instance
            .iter()
            .map(|(instance, models)| (instance.as_str(), models.as_slice())),
    )
}
