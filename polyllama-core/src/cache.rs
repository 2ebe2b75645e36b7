//! Running-model cache: which models are loaded where.
//!
//! A snapshot is rebuilt by polling every instance's "list loaded models"
//! endpoint concurrently. It is never merged incrementally: a refresh replaces
//! it entirely. A snapshot is stale after its TTL or once invalidated.

use crate::backend::{BackendClient, BackendModel, same_model};
use crate::topology::Topology;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Model name -> instances holding it, instances in pool order.
pub type RunningModels = BTreeMap<String, Vec<String>>;

/// One full poll of the pool.
#[derive(Debug, Clone)]
pub struct RunningSnapshot {
    pub models: RunningModels,
    /// What each reachable instance reported, in pool order.
    pub per_instance: Vec<(String, Vec<BackendModel>)>,
    /// Instances that failed to answer.
    pub unreachable: Vec<String>,
    pub taken_at: DateTime<Utc>,
    refreshed: Instant,
}

impl RunningSnapshot {
    fn age(&self) -> Duration {
        self.refreshed.elapsed()
    }

    /// Instances on which `model` is loaded.
    pub fn instances_for(&self, model: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for (name, instances) in &self.models {
            if same_model(model, name) {
                for instance in instances {
                    if !found.contains(instance) {
                        found.push(instance.clone());
                    }
                }
            }
        }
        found
    }
}

/// Cache counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub refreshes: u64,
    pub invalidations: u64,
    pub ttl_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
    pub models: usize,
}

/// TTL cache over the backends' loaded models.
pub struct RunningModelCache {
    backend: Arc<dyn BackendClient>,
    topology: Topology,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<RunningSnapshot>>>,
    refreshes: AtomicU64,
    invalidations: AtomicU64,
}

impl RunningModelCache {
    pub fn new(backend: Arc<dyn BackendClient>, topology: Topology, ttl: Duration) -> Self {
        Self {
            backend,
            topology,
            ttl,
            snapshot: RwLock::new(None),
            refreshes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Option<Arc<RunningSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current snapshot, refreshed if stale or if `force_refresh`.
    pub async fn snapshot(&self, force_refresh: bool) -> Arc<RunningSnapshot> {
        if !force_refresh
            && let Some(snapshot) = self.current()
            && snapshot.age() < self.ttl
        {
            return snapshot;
        }
        self.refresh().await
    }

    /// Model -> instances map.
    pub async fn get(&self, force_refresh: bool) -> RunningModels {
        self.snapshot(force_refresh).await.models.clone()
    }

    /// Poll every instance and replace the snapshot.
    pub async fn refresh(&self) -> Arc<RunningSnapshot> {
        let instances = self.topology.instances();
        let polls = instances.iter().map(|instance| {
            let backend = self.backend.clone();
            async move { (instance.clone(), backend.list_running(instance).await) }
        });
        let results = futures::future::join_all(polls).await;

        let mut models = RunningModels::new();
        let mut per_instance = Vec::with_capacity(results.len());
        let mut unreachable = Vec::new();
        for (instance, result) in results {
            match result {
                Ok(loaded) => {
                    for model in &loaded {
                        let holders = models.entry(model.name.clone()).or_default();
                        if !holders.contains(&instance) {
                            holders.push(instance.clone());
                        }
                    }
                    per_instance.push((instance, loaded));
                }
                Err(e) => {
                    warn!(instance = %instance, error = %e, "Instance left out of running-model refresh");
                    unreachable.push(instance);
                }
            }
        }

        let snapshot = Arc::new(RunningSnapshot {
            models,
            per_instance,
            unreachable,
            taken_at: Utc::now(),
            refreshed: Instant::now(),
        });
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(
            models = snapshot.models.len(),
            unreachable = snapshot.unreachable.len(),
            "Running-model cache refreshed"
        );
        snapshot
    }

    /// Drop the snapshot so the next read polls the backends.
    pub fn invalidate(&self) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Instances on which `model` is loaded, in pool order.
    ///
    /// If the model is absent and `force_refresh` was false, one forced
    /// refresh is made before concluding absence.
    pub async fn running_instances(&self, model: &str, force_refresh: bool) -> Vec<String> {
        let mut found = self.snapshot(force_refresh).await.instances_for(model);
        if found.is_empty() && !force_refresh {
            found = self.snapshot(true).await.instances_for(model);
        }
        self.topology.sort_instances(&mut found);
        found
    }

    pub async fn is_model_running_on_any_instance(&self, model: &str, force_refresh: bool) -> bool {
        !self.running_instances(model, force_refresh).await.is_empty()
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        let current = self.current();
        CacheStats {
            refreshes: self.refreshes(),
            invalidations: self.invalidations(),
            ttl_secs: self.ttl.as_secs(),
            age_secs: current.as_ref().map(|s| s.age().as_secs()),
            models: current.map(|s| s.models.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn cache_with(mock: Arc<MockBackend>, instances: usize, ttl: Duration) -> RunningModelCache {
        RunningModelCache::new(mock, Topology::with_count(instances), ttl)
    }

    #[tokio::test]
    async fn test_aggregates_across_instances() {
        let mock = Arc::new(MockBackend::new());
        mock.set_running("polyllama1", &["llama3:latest"]);
        mock.set_running("polyllama2", &["llama3:latest", "phi3:latest"]);
        let cache = cache_with(mock, 2, Duration::from_secs(30));

        let models = cache.get(false).await;
        assert_eq!(models["llama3:latest"], vec!["polyllama1", "polyllama2"]);
        assert_eq!(models["phi3:latest"], vec!["polyllama2"]);
    }

    #[tokio::test]
    async fn test_failed_instance_does_not_abort_aggregation() {
        let mock = Arc::new(MockBackend::new());
        mock.set_running("polyllama1", &["llama3:latest"]);
        mock.set_running("polyllama2", &["phi3:latest"]);
        mock.set_unreachable("polyllama1", true);
        let cache = cache_with(mock, 2, Duration::from_secs(30));

        let snapshot = cache.snapshot(false).await;
        assert!(!snapshot.models.contains_key("llama3:latest"));
        assert_eq!(snapshot.models["phi3:latest"], vec!["polyllama2"]);
        assert_eq!(snapshot.unreachable, vec!["polyllama1"]);
    }

    #[tokio::test]
    async fn test_ttl_serves_cached_snapshot() {
        let mock = Arc::new(MockBackend::new());
        let cache = cache_with(mock.clone(), 2, Duration::from_secs(30));

        cache.get(false).await;
        cache.get(false).await;
        assert_eq!(mock.list_running_calls(), 2);
        assert_eq!(cache.refreshes(), 1);

        cache.get(true).await;
        assert_eq!(mock.list_running_calls(), 4);
    }

    #[tokio::test]
    async fn test_stale_after_ttl() {
        let mock = Arc::new(MockBackend::new());
        let cache = cache_with(mock.clone(), 1, Duration::from_millis(10));
        cache.get(false).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        cache.get(false).await;
        assert_eq!(cache.refreshes(), 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let mock = Arc::new(MockBackend::new());
        mock.set_running("polyllama1", &["llama3:latest"]);
        let cache = cache_with(mock.clone(), 1, Duration::from_secs(30));
        assert!(cache.get(false).await.contains_key("llama3:latest"));

        mock.set_running("polyllama1", &["phi3:latest"]);
        let models = cache.get(true).await;
        assert!(!models.contains_key("llama3:latest"));
        assert!(models.contains_key("phi3:latest"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_poll() {
        let mock = Arc::new(MockBackend::new());
        let cache = cache_with(mock.clone(), 1, Duration::from_secs(30));
        cache.get(false).await;
        cache.invalidate();
        cache.get(false).await;
        assert_eq!(cache.refreshes(), 2);
        assert_eq!(cache.invalidations(), 1);
    }

    #[tokio::test]
    async fn test_single_forced_retry_when_absent() {
        let mock = Arc::new(MockBackend::new());
        let cache = cache_with(mock.clone(), 1, Duration::from_secs(30));
        cache.get(false).await;

        // Loaded after the snapshot was taken.
        mock.set_running("polyllama1", &["llama3:latest"]);
        assert!(cache.is_model_running_on_any_instance("llama3", false).await);
        assert_eq!(cache.refreshes(), 2);

        // Absent even after the retry: exactly one extra refresh.
        assert!(!cache.is_model_running_on_any_instance("mistral", false).await);
        assert_eq!(cache.refreshes(), 3);

        // Already forced: no retry.
        assert!(!cache.is_model_running_on_any_instance("mistral", true).await);
        assert_eq!(cache.refreshes(), 4);
    }

    #[tokio::test]
    async fn test_running_instances_tag_matching() {
        let mock = Arc::new(MockBackend::new());
        mock.set_running("polyllama2", &["llama3:latest"]);
        mock.set_running("polyllama1", &["llama3"]);
        let cache = cache_with(mock, 2, Duration::from_secs(30));
        assert_eq!(
            cache.running_instances("llama3", true).await,
            vec!["polyllama1", "polyllama2"]
        );
    }

    #[tokio::test]
    async fn test_running_instances_in_pool_order() {
        let mock = Arc::new(MockBackend::new());
        mock.set_running("polyllama10", &["llama3:latest"]);
        mock.set_running("polyllama2", &["llama3"]);
        mock.set_running("polyllama9", &["llama3:latest"]);
        let cache = cache_with(mock, 10, Duration::from_secs(30));
        assert_eq!(
            cache.running_instances("llama3:latest", false).await,
            vec!["polyllama2", "polyllama9", "polyllama10"]
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let mock = Arc::new(MockBackend::new());
        mock.set_running("polyllama1", &["a", "b"]);
        let cache = cache_with(mock, 1, Duration::from_secs(30));
        assert_eq!(cache.stats().models, 0);
        assert!(cache.stats().age_secs.is_none());
        cache.get(false).await;
        let stats = cache.stats();
        assert_eq!(stats.models, 2);
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.ttl_secs, 30);
    }
}
