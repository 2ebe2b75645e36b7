//! Asynchronous download-and-load jobs.
//!
//! A job is a `PullStatus` record in the shared store moving forward through
//! `starting → in_progress → completed | failed | timeout`. The backend has no
//! completion callback: a detached task follows the pull's progress stream and
//! triggers the load, and `poll` settles the job by looking at the
//! running-model cache.

use crate::backend::{BackendClient, PullEvent, PullEventStream};
use crate::cache::RunningModelCache;
use crate::error::{PullError, RouterError};
use crate::lock::{LockManager, LockOutcome};
use crate::mapping::MappingStore;
use crate::selector::InstanceSelector;
use crate::store::StateStore;
use crate::topology::Topology;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key prefix of pull status records.
pub const PULL_PREFIX: &str = "pull:";

pub fn pull_key(id: &str) -> String {
    format!("{PULL_PREFIX}{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullState {
    Starting,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl PullState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PullState::Completed | PullState::Failed | PullState::Timeout
        )
    }

    fn rank(&self) -> u8 {
        match self {
            PullState::Starting => 0,
            PullState::InProgress => 1,
            PullState::Completed | PullState::Failed | PullState::Timeout => 2,
        }
    }

    /// States only move forward; terminal states never change.
    pub fn can_transition_to(&self, next: PullState) -> bool {
        next.rank() > self.rank()
    }
}

/// The tracked state of one pull job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullStatus {
    pub id: String,
    pub model: String,
    pub instance: String,
    pub status: PullState,
    pub progress: u8,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullStatus {
    fn new(model: &str, instance: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.to_string(),
            instance: instance.to_string(),
            status: PullState::Starting,
            progress: 0,
            stage: "starting".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    fn finish(&mut self, state: PullState, error: Option<String>) {
        self.status = state;
        self.completed_at = Some(Utc::now());
        self.stage = match state {
            PullState::Completed => "completed",
            PullState::Timeout => "timeout",
            _ => "failed",
        }
        .to_string();
        if state == PullState::Completed {
            self.progress = 100;
        }
        self.error = error;
    }
}

/// Result of `PullManager::start`.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStart {
    /// A job was created. It may already be `failed` if the backend refused.
    Started(PullStatus),
    /// The model is loaded already; no job was created.
    AlreadyRunning { instance: String },
    /// Someone else holds the model's loading lock.
    AlreadyLoading { owner: String },
}

/// Full `model:tag` reference. A model that already carries a tag is kept.
pub fn model_reference(model: &str, tag: Option<&str>) -> Result<String, PullError> {
    let model = model.trim();
    if model.is_empty() {
        return Err(PullError::InvalidModel {
            reason: "model name is empty".to_string(),
        });
    }
    if model.chars().any(char::is_whitespace) {
        return Err(PullError::InvalidModel {
            reason: format!("'{model}' contains whitespace"),
        });
    }
    if model.contains(':') {
        return Ok(model.to_string());
    }
    let tag = tag.map(str::trim).filter(|t| !t.is_empty()).unwrap_or("latest");
    Ok(format!("{model}:{tag}"))
}

#[derive(Clone)]
pub struct PullManager {
    store: Arc<dyn StateStore>,
    backend: Arc<dyn BackendClient>,
    cache: Arc<RunningModelCache>,
    mappings: Arc<MappingStore>,
    locks: Arc<LockManager>,
    selector: Arc<InstanceSelector>,
    topology: Topology,
    timeout: Duration,
    retention: Duration,
    // Serializes read-modify-write of status records between poll and tracker.
    updates: Arc<Mutex<()>>,
}

impl PullManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: Arc<dyn BackendClient>,
        cache: Arc<RunningModelCache>,
        mappings: Arc<MappingStore>,
        locks: Arc<LockManager>,
        selector: Arc<InstanceSelector>,
        topology: Topology,
        timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            cache,
            mappings,
            locks,
            selector,
            topology,
            timeout,
            retention,
            updates: Arc::new(Mutex::new(())),
        }
    }

    /// Start pulling `model:tag` onto `instance`, or the least-loaded one.
    pub async fn start(
        &self,
        model: &str,
        tag: Option<&str>,
        instance: Option<&str>,
    ) -> Result<PullStart, RouterError> {
        let model = model_reference(model, tag)?;
        let instance = match instance {
            Some(name) if self.topology.contains(name) => name.to_string(),
            Some(name) => {
                return Err(RouterError::UnknownInstance {
                    name: name.to_string(),
                });
            }
            None => self.selector.least_loaded().await?,
        };

        match self.locks.acquire(&model, &instance).await? {
            LockOutcome::Acquired => {}
            LockOutcome::AlreadyRunning { instance } => {
                self.mappings.set_mapping(&model, &instance, true).await?;
                return Ok(PullStart::AlreadyRunning { instance });
            }
            LockOutcome::Held { owner } => return Ok(PullStart::AlreadyLoading { owner }),
        }

        let mut status = PullStatus::new(&model, &instance);
        self.save(&status).await?;
        info!(id = %status.id, model = %model, instance = %instance, "Pull started");

        match self.backend.pull(&instance, &model).await {
            Ok(events) => {
                self.mappings.set_mapping(&model, &instance, false).await?;
                status.status = PullState::InProgress;
                status.stage = "pulling".to_string();
                self.save(&status).await?;
                let tracker = self.clone();
                let id = status.id.clone();
                tokio::spawn(async move { tracker.track(id, events).await });
            }
            Err(e) => {
                warn!(id = %status.id, model = %model, error = %e, "Pull initiation failed");
                status.finish(PullState::Failed, Some(e.to_string()));
                self.save(&status).await?;
                self.locks.release(&model).await?;
            }
        }
        Ok(PullStart::Started(status))
    }

    /// Current status of job `id`, settling it if it has finished.
    pub async fn poll(&self, id: &str) -> Result<PullStatus, RouterError> {
        let status = self.load(id).await?.ok_or_else(|| PullError::NotFound {
            id: id.to_string(),
        })?;
        if status.status != PullState::InProgress {
            return Ok(status);
        }

        let running = self.cache.running_instances(&status.model, false).await;
        if !running.is_empty() {
            let instance = if running.contains(&status.instance) {
                status.instance.clone()
            } else {
                running[0].clone()
            };
            let updated = self
                .update(id, |s| s.finish(PullState::Completed, None))
                .await?
                .unwrap_or(status);
            if updated.status == PullState::Completed {
                self.locks.release(&updated.model).await?;
                self.mappings.set_mapping(&updated.model, &instance, true).await?;
                info!(id, model = %updated.model, instance = %instance, "Pull completed");
            }
            return Ok(updated);
        }

        let elapsed = (Utc::now() - status.started_at).to_std().unwrap_or_default();
        if elapsed >= self.timeout {
            let message = format!("not running after {}s", self.timeout.as_secs());
            let updated = self
                .update(id, |s| s.finish(PullState::Timeout, Some(message)))
                .await?
                .unwrap_or(status);
            if updated.status == PullState::Timeout {
                self.locks.release(&updated.model).await?;
                warn!(id, model = %updated.model, "Pull timed out");
            }
            return Ok(updated);
        }
        Ok(status)
    }

    /// Every retained job, newest first.
    pub async fn list(&self) -> Result<Vec<PullStatus>, RouterError> {
        let mut statuses = Vec::new();
        for key in self.store.keys(PULL_PREFIX).await? {
            if let Some(status) = self.load(&key[PULL_PREFIX.len()..]).await? {
                statuses.push(status);
            }
        }
        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(statuses)
    }

    async fn load(&self, id: &str) -> Result<Option<PullStatus>, RouterError> {
        match self.store.get(&pull_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, status: &PullStatus) -> Result<(), RouterError> {
        let raw = serde_json::to_string(status)?;
        self.store
            .set(&pull_key(&status.id), &raw, Some(self.retention))
            .await?;
        Ok(())
    }

    /// Apply `change` to a non-terminal record. Backward moves are dropped.
    async fn update<F>(&self, id: &str, change: F) -> Result<Option<PullStatus>, RouterError>
    where
        F: FnOnce(&mut PullStatus),
    {
        let _guard = self.updates.lock().await;
        let Some(current) = self.load(id).await? else {
            return Ok(None);
        };
        if current.status.is_terminal() {
            return Ok(Some(current));
        }

        let mut next = current.clone();
        change(&mut next);
        if next.status != current.status && !current.status.can_transition_to(next.status) {
            return Ok(Some(current));
        }
        if next != current {
            self.save(&next).await?;
        }
        Ok(Some(next))
    }

    /// Follow a pull's progress stream, then load the model.
    async fn track(self, id: String, mut events: PullEventStream) {
        let Some((model, instance)) = self.describe(&id).await else {
            return;
        };

        let mut succeeded = false;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    succeeded |= event.is_success();
                    if !self.record_progress(&id, &event).await {
                        debug!(id = %id, "Pull settled elsewhere, tracker stopping");
                        return;
                    }
                }
                Err(e) => {
                    self.fail(&id, &model, e.to_string()).await;
                    return;
                }
            }
        }
        if !succeeded {
            self.fail(&id, &model, "pull ended without success".to_string())
                .await;
            return;
        }

        let loading = self
            .update(&id, |s| {
                s.stage = "loading".to_string();
                s.progress = 100;
            })
            .await;
        if let Err(e) = loading {
            warn!(id = %id, error = %e, "Could not record pull stage");
        }

        match self.backend.load(&instance, &model).await {
            Ok(()) => {
                self.cache.invalidate();
                if let Err(e) = self.poll(&id).await {
                    warn!(id = %id, error = %e, "Could not settle pull after load");
                }
            }
            Err(e) => self.fail(&id, &model, e.to_string()).await,
        }
    }

    async fn describe(&self, id: &str) -> Option<(String, String)> {
        match self.load(id).await {
            Ok(Some(status)) => Some((status.model, status.instance)),
            Ok(None) => None,
            Err(e) => {
                warn!(id, error = %e, "Could not read pull status");
                None
            }
        }
    }

    /// Returns false once the job is terminal.
    async fn record_progress(&self, id: &str, event: &PullEvent) -> bool {
        let result = self
            .update(id, |s| {
                s.stage = event.status.clone();
                if let Some(percent) = event.percent() {
                    s.progress = s.progress.max(percent);
                }
            })
            .await;
        match result {
            Ok(Some(status)) => !status.status.is_terminal(),
            Ok(None) => false,
            Err(e) => {
                warn!(id, error = %e, "Could not record pull progress");
                true
            }
        }
    }

    async fn fail(&self, id: &str, model: &str, message: String) {
        warn!(id, model, error = %message, "Pull failed");
        match self
            .update(id, |s| s.finish(PullState::Failed, Some(message)))
            .await
        {
            Ok(Some(status)) if status.status == PullState::Failed => {
                if let Err(e) = self.locks.release(model).await {
                    warn!(id, model, error = %e, "Could not release loading lock");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(id, error = %e, "Could not record pull failure"),
        }
    }
}
