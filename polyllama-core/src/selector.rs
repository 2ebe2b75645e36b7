//! Least-loaded placement for models with no mapping yet.

use crate::error::{RouterError, StoreError};
use crate::mapping::MappingStore;
use crate::topology::Topology;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Pick the instance with the fewest mapped models.
///
/// `loads` must be in pool order; ties go to the earliest entry.
pub fn least_loaded_of(loads: &[(String, usize)]) -> Option<&str> {
    let mut best: Option<&(String, usize)> = None;
    for entry in loads {
        if best.is_none_or(|b| entry.1 < b.1) {
            best = Some(entry);
        }
    }
    best.map(|(instance, _)| instance.as_str())
}

pub struct InstanceSelector {
    mappings: Arc<MappingStore>,
    topology: Topology,
}

impl InstanceSelector {
    pub fn new(mappings: Arc<MappingStore>, topology: Topology) -> Self {
        Self { mappings, topology }
    }

    /// Mapped-model count per configured instance, in pool order.
    ///
    /// Mappings to instances outside the pool are not counted.
    pub async fn load_counts(&self) -> Result<Vec<(String, usize)>, StoreError> {
        let mut tally: HashMap<String, usize> = HashMap::new();
        for mapping in self.mappings.all_mappings().await? {
            if self.topology.contains(&mapping.instance) {
                *tally.entry(mapping.instance).or_default() += 1;
            }
        }
        Ok(self
            .topology
            .instances()
            .into_iter()
            .map(|instance| {
                let count = tally.get(&instance).copied().unwrap_or(0);
                (instance, count)
            })
            .collect())
    }

    /// Instance that should receive a newly placed model.
    pub async fn least_loaded(&self) -> Result<String, RouterError> {
        let loads = self.load_counts().await?;
        let instance = least_loaded_of(&loads)
            .ok_or(RouterError::NoInstances)?
            .to_string();
        debug!(instance = %instance, ?loads, "Selected least-loaded instance");
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::cache::RunningModelCache;
    use crate::store::{MemoryStore, StateStore};
    use std::time::Duration;

    fn setup(instances: usize) -> (Arc<MemoryStore>, Arc<MappingStore>, InstanceSelector) {
        let topology = Topology::with_count(instances);
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RunningModelCache::new(
            Arc::new(MockBackend::new()),
            topology.clone(),
            Duration::from_secs(30),
        ));
        let mappings = Arc::new(MappingStore::new(store.clone(), cache));
        let selector = InstanceSelector::new(mappings.clone(), topology);
        (store, mappings, selector)
    }

    #[test]
    fn test_least_loaded_of() {
        let loads = |counts: &[usize]| -> Vec<(String, usize)> {
            counts
                .iter()
                .enumerate()
                .map(|(i, c)| (format!("polyllama{}", i + 1), *c))
                .collect()
        };
        assert_eq!(least_loaded_of(&loads(&[2, 0, 1])), Some("polyllama2"));
        assert_eq!(least_loaded_of(&loads(&[0, 0, 1])), Some("polyllama1"));
        assert_eq!(least_loaded_of(&loads(&[3, 1, 1])), Some("polyllama2"));
        assert_eq!(least_loaded_of(&[]), None);
    }

    #[tokio::test]
    async fn test_picks_emptiest_instance() {
        let (_, mappings, selector) = setup(3);
        mappings.set_mapping("a", "polyllama1", true).await.unwrap();
        mappings.set_mapping("b", "polyllama1", false).await.unwrap();
        mappings.set_mapping("c", "polyllama3", true).await.unwrap();
        assert_eq!(selector.least_loaded().await.unwrap(), "polyllama2");
    }

    #[tokio::test]
    async fn test_tie_goes_to_lowest_index() {
        let (_, mappings, selector) = setup(3);
        mappings.set_mapping("c", "polyllama3", true).await.unwrap();
        for _ in 0..3 {
            assert_eq!(selector.least_loaded().await.unwrap(), "polyllama1");
        }
    }

    #[tokio::test]
    async fn test_locks_and_foreign_instances_ignored() {
        let (store, mappings, selector) = setup(2);
        store.set("loading:x", "polyllama1", None).await.unwrap();
        store.set("loading:y", "polyllama1", None).await.unwrap();
        mappings.set_mapping("z", "polyllama2", true).await.unwrap();
        mappings.set_mapping("old", "polyllama7", true).await.unwrap();

        assert_eq!(
            selector.load_counts().await.unwrap(),
            vec![("polyllama1".to_string(), 0), ("polyllama2".to_string(), 1)]
        );
        assert_eq!(selector.least_loaded().await.unwrap(), "polyllama1");
    }

    #[tokio::test]
    async fn test_no_instances() {
        let (_, _, selector) = setup(0);
        assert!(matches!(
            selector.least_loaded().await,
            Err(RouterError::NoInstances)
        ));
    }
}
