//! Routing decisions: which instance serves a request for a model.
//!
//! `ModelRouter` owns every routing component and is what the HTTP layer
//! holds on to.

use crate::backend::{BackendClient, OllamaClient};
use crate::cache::{CacheStats, RunningModelCache};
use crate::config::RouterConfig;
use crate::consistency::{ConsistencyChecker, ReconcileReport};
use crate::error::Result;
use crate::inventory::{self, PooledModel};
use crate::lock::{LockManager, LockOutcome};
use crate::mapping::MappingStore;
use crate::metrics::{MetricsSnapshot, RouterMetrics};
use crate::pull::PullManager;
use crate::search::{HttpCatalog, ModelCatalog, ModelSearch};
use crate::selector::InstanceSelector;
use crate::store::{MemoryStore, StateStore};
use crate::topology::Topology;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a request for a model should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RouteDecision {
    /// The instance has the model.
    Serve { instance: String },
    /// The caller holds the loading lock; the request makes `instance` load
    /// the model. The lock must be released once the backend answers.
    Load { instance: String },
    /// Another request is loading the model on `owner`.
    Wait { owner: String },
}

impl RouteDecision {
    pub fn instance(&self) -> &str {
        match self {
            RouteDecision::Serve { instance } | RouteDecision::Load { instance } => instance,
            RouteDecision::Wait { owner } => owner,
        }
    }

    pub fn holds_lock(&self) -> bool {
        matches!(self, RouteDecision::Load { .. })
    }
}

/// Snapshot for `GET /api/router/status`.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub instance_count: usize,
    pub instances: Vec<String>,
    pub mappings: usize,
    pub locks: usize,
    pub pulls: usize,
    pub cache: CacheStats,
    pub routing: MetricsSnapshot,
}

pub struct ModelRouter {
    config: RouterConfig,
    topology: Topology,
    store: Arc<dyn StateStore>,
    backend: Arc<dyn BackendClient>,
    cache: Arc<RunningModelCache>,
    mappings: Arc<MappingStore>,
    locks: Arc<LockManager>,
    selector: Arc<InstanceSelector>,
    checker: ConsistencyChecker,
    pulls: PullManager,
    search: ModelSearch,
    metrics: RouterMetrics,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("instances", &self.topology.count())
            .field("cache", &self.cache.stats())
            .finish()
    }
}

impl ModelRouter {
    /// Wire up a router over the given collaborators.
    pub fn new(
        config: RouterConfig,
        topology: Topology,
        store: Arc<dyn StateStore>,
        backend: Arc<dyn BackendClient>,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Self {
        let cache = Arc::new(RunningModelCache::new(
            backend.clone(),
            topology.clone(),
            config.routing.running_cache_ttl(),
        ));
        let mappings = Arc::new(MappingStore::new(store.clone(), cache.clone()));
        let locks = Arc::new(LockManager::new(
            store.clone(),
            cache.clone(),
            config.routing.lock_ttl(),
        ));
        let selector = Arc::new(InstanceSelector::new(mappings.clone(), topology.clone()));
        let checker = ConsistencyChecker::new(cache.clone(), mappings.clone(), topology.clone());
        let pulls = PullManager::new(
            store.clone(),
            backend.clone(),
            cache.clone(),
            mappings.clone(),
            locks.clone(),
            selector.clone(),
            topology.clone(),
            Duration::from_secs(config.pull.timeout_secs),
            Duration::from_secs(config.pull.retention_secs),
        );
        let search = ModelSearch::new(
            catalog,
            backend.clone(),
            topology.clone(),
            config.search.default_limit,
        );

        Self {
            config,
            topology,
            store,
            backend,
            cache,
            mappings,
            locks,
            selector,
            checker,
            pulls,
            search,
            metrics: RouterMetrics::new(),
        }
    }

    /// Production wiring: in-memory store, Ollama backends, HTTP catalog.
    pub fn from_config(config: RouterConfig) -> Self {
        let topology = Topology::new(&config.backends);
        let backend = Arc::new(OllamaClient::new(topology.clone(), &config.backends));
        let catalog = Arc::new(HttpCatalog::new(&config.search));
        Self::new(
            config,
            topology,
            Arc::new(MemoryStore::new()),
            backend,
            catalog,
        )
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    pub fn cache(&self) -> &RunningModelCache {
        &self.cache
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn selector(&self) -> &InstanceSelector {
        &self.selector
    }

    pub fn checker(&self) -> &ConsistencyChecker {
        &self.checker
    }

    pub fn pulls(&self) -> &PullManager {
        &self.pulls
    }

    pub fn search(&self) -> &ModelSearch {
        &self.search
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// The instance already serving `model`, if any. Never places a model.
    ///
    /// A mapping flagged running is trusted; any other mapping must be
    /// confirmed by the running-model cache. Failing that, a model found
    /// running anywhere gets its mapping recorded.
    pub async fn get_instance_for_model(&self, model: &str) -> Result<Option<String>> {
        if let Some(mapping) = self.mappings.get_mapping_info(model).await?
            && self.topology.contains(&mapping.instance)
        {
            if mapping.running {
                return Ok(Some(mapping.instance));
            }
            let snapshot = self.cache.snapshot(false).await;
            if snapshot.instances_for(model).contains(&mapping.instance) {
                self.mappings
                    .set_mapping(model, &mapping.instance, true)
                    .await?;
                return Ok(Some(mapping.instance));
            }
        }

        let mut running = self.cache.running_instances(model, false).await;
        self.topology.sort_instances(&mut running);
        match running.into_iter().next() {
            Some(instance) => {
                self.mappings.set_mapping(model, &instance, true).await?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// Decide where a request for `model` goes, placing the model if needed.
    pub async fn route(&self, model: &str) -> Result<RouteDecision> {
        if let Some(instance) = self.get_instance_for_model(model).await? {
            self.metrics.record_served_from_mapping();
            return Ok(RouteDecision::Serve { instance });
        }

        let target = match self.mappings.get_instance(model).await? {
            Some(instance) if self.topology.contains(&instance) => instance,
            _ => self.selector.least_loaded().await?,
        };

        match self.locks.acquire(model, &target).await? {
            LockOutcome::Acquired => {
                self.mappings.set_mapping(model, &target, false).await?;
                self.metrics.record_load_triggered();
                info!(model, instance = %target, "Placing model");
                Ok(RouteDecision::Load { instance: target })
            }
            LockOutcome::AlreadyRunning { instance } => {
                self.mappings.set_mapping(model, &instance, true).await?;
                self.metrics.record_served_from_mapping();
                Ok(RouteDecision::Serve { instance })
            }
            LockOutcome::Held { owner } => {
                self.metrics.record_lock_wait();
                debug!(model, owner = %owner, "Model is being loaded, joining owner");
                Ok(RouteDecision::Wait { owner })
            }
        }
    }

    /// Release the lock taken by a `Load` decision once the backend answered.
    pub async fn finish_load(&self, model: &str) -> Result<()> {
        self.locks.release(model).await
    }

    /// Models on disk across the pool.
    pub async fn available_models(&self) -> Vec<PooledModel> {
        inventory::available_models(self.backend.as_ref(), &self.topology).await
    }

    /// Models loaded across the pool.
    pub async fn running_models(&self) -> Vec<PooledModel> {
        inventory::running_models(&*self.cache.snapshot(false).await)
    }

    /// Change the live instance count.
    pub fn set_instance_count(&self, count: usize) {
        let previous = self.topology.count();
        self.topology.set_count(count);
        self.cache.invalidate();
        info!(previous, count, "Instance count changed");
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        Ok(self.checker.check().await?)
    }

    pub async fn status(&self) -> Result<RouterStatus> {
        Ok(RouterStatus {
            instance_count: self.topology.count(),
            instances: self.topology.instances(),
            mappings: self.mappings.all_mappings().await?.len(),
            locks: self.locks.locks().await?.len(),
            pulls: self.pulls.list().await?.len(),
            cache: self.cache.stats(),
            routing: self.metrics.snapshot(),
        })
    }

    /// Start the periodic reconcile and store sweep. Both stop when
    /// `shutdown` flips to true.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let reconcile_every = self.config.routing.reconcile_interval_secs;
        if reconcile_every > 0 {
            let router = self.clone();
            handles.push(tokio::spawn(every(
                Duration::from_secs(reconcile_every),
                shutdown.clone(),
                move || {
                    let router = router.clone();
                    async move {
                        match router.reconcile().await {
                            Ok(report) if report.fixed > 0 => {
                                info!(fixed = report.fixed, "Background reconcile fixed mappings")
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Background reconcile failed"),
                        }
                    }
                },
            )));
        }

        let sweep_every = self.config.routing.store_sweep_interval_secs;
        if sweep_every > 0 {
            let store = self.store.clone();
            handles.push(tokio::spawn(every(
                Duration::from_secs(sweep_every),
                shutdown,
                move || {
                    let store = store.clone();
                    async move {
                        if let Err(e) = store.sweep().await {
                            warn!(error = %e, "Store sweep failed");
                        }
                    }
                },
            )));
        }

        handles
    }
}

/// Run `tick` every `period` until `shutdown` is set. The first tick is
/// one period in.
async fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
