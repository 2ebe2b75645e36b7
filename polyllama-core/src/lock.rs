//! Per-model loading locks.
//!
//! A lock is a store key `loading:<model>` holding the owning instance, written
//! with atomic add-if-absent and a lease TTL. The TTL only recovers from a
//! crashed loader; correctness comes from the add being atomic.

use crate::backend::canonical_model;
use crate::cache::RunningModelCache;
use crate::error::{LockError, RouterError};
use crate::store::StateStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key prefix of loading locks.
pub const LOCK_PREFIX: &str = "loading:";

/// Store key of the lock for `model`. `llama3` and `llama3:latest` share one.
pub fn lock_key(model: &str) -> String {
    format!("{LOCK_PREFIX}{}", canonical_model(model))
}

/// Result of trying to take a loading lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockOutcome {
    /// The caller holds the lock and should load the model.
    Acquired,
    /// The model is already loaded; nothing to load.
    AlreadyRunning { instance: String },
    /// Another caller is loading the model.
    Held { owner: String },
}

impl LockOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }

    /// The instance that has or is getting the model, when not the caller.
    pub fn owner(&self) -> Option<&str> {
        match self {
            LockOutcome::Acquired => None,
            LockOutcome::AlreadyRunning { instance } => Some(instance),
            LockOutcome::Held { owner } => Some(owner),
        }
    }
}

/// A live lock, as listed for the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadingLock {
    pub model: String,
    pub owner: String,
}

pub struct LockManager {
    store: Arc<dyn StateStore>,
    cache: Arc<RunningModelCache>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, cache: Arc<RunningModelCache>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    /// Try to become the loader of `model` on `instance`.
    ///
    /// A model already loaded anywhere (forced refresh) is never locked. A lock
    /// without a readable owner is deleted and the add retried once.
    pub async fn acquire(&self, model: &str, instance: &str) -> Result<LockOutcome, RouterError> {
        if let Some(running) = self
            .cache
            .running_instances(model, true)
            .await
            .into_iter()
            .next()
        {
            debug!(model, instance = %running, "Lock refused: model already running");
            return Ok(LockOutcome::AlreadyRunning { instance: running });
        }

        let key = lock_key(model);
        for attempt in 0..2 {
            if self.store.add(&key, instance, Some(self.ttl)).await? {
                info!(model, instance, "Loading lock acquired");
                return Ok(LockOutcome::Acquired);
            }
            match self.store.get(&key).await? {
                Some(owner) if !owner.trim().is_empty() => {
                    debug!(model, owner = %owner, "Loading lock held elsewhere");
                    return Ok(LockOutcome::Held {
                        owner: owner.trim().to_string(),
                    });
                }
                Some(_) => {
                    warn!(model, attempt, "Loading lock has no owner, deleting");
                    self.store.delete(&key).await?;
                }
                // Released or expired between the add and the read.
                None => {}
            }
        }

        Err(LockError::Corrupted {
            model: model.to_string(),
        }
        .into())
    }

    /// Drop the lock of `model`. Releasing a free lock is fine.
    pub async fn release(&self, model: &str) -> Result<(), RouterError> {
        self.store.delete(&lock_key(model)).await?;
        self.cache.invalidate();
        debug!(model, "Loading lock released");
        Ok(())
    }

    /// Extend the lease if `instance` is the current owner.
    pub async fn refresh(&self, model: &str, instance: &str) -> Result<bool, RouterError> {
        let key = lock_key(model);
        match self.store.get(&key).await? {
            Some(owner) if owner.trim() == instance => {
                self.store.set(&key, instance, Some(self.ttl)).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Current holder of the lock of `model`.
    pub async fn owner(&self, model: &str) -> Result<Option<String>, RouterError> {
        Ok(self
            .store
            .get(&lock_key(model))
            .await?
            .map(|owner| owner.trim().to_string())
            .filter(|owner| !owner.is_empty()))
    }

    /// Live locks sorted by model.
    pub async fn locks(&self) -> Result<Vec<LoadingLock>, RouterError> {
        let mut locks = Vec::new();
        for key in self.store.keys(LOCK_PREFIX).await? {
            if let Some(owner) = self.store.get(&key).await? {
                locks.push(LoadingLock {
                    model: key[LOCK_PREFIX.len()..].to_string(),
                    owner,
                });
            }
        }
        Ok(locks)
    }
}
