//! In-memory stand-in for a pool of backends.

use super::{BackendClient, BackendModel, PullEvent, PullEventStream};
use crate::error::BackendError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A scriptable backend pool for tests and local demos.
///
/// Loading a model marks it running on that instance unless
/// `set_load_marks_running(false)` was called. A pull that completes with
/// `success` marks the model available.
pub struct MockBackend {
    running: Mutex<HashMap<String, Vec<String>>>,
    available: Mutex<HashMap<String, Vec<String>>>,
    unreachable: Mutex<HashSet<String>>,
    pull_events: Mutex<Vec<PullEvent>>,
    pull_stream_error: Mutex<Option<String>>,
    pull_initiation_error: Mutex<Option<String>>,
    pull_stream_open: Mutex<bool>,
    load_error: Mutex<Option<String>>,
    load_marks_running: Mutex<bool>,
    loads: Mutex<Vec<(String, String)>>,
    list_running_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            available: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            pull_events: Mutex::new(vec![
                PullEvent::stage("pulling manifest"),
                PullEvent::download(50, 100),
                PullEvent::download(100, 100),
                PullEvent::stage("success"),
            ]),
            pull_stream_error: Mutex::new(None),
            pull_initiation_error: Mutex::new(None),
            pull_stream_open: Mutex::new(false),
            load_error: Mutex::new(None),
            load_marks_running: Mutex::new(true),
            loads: Mutex::new(Vec::new()),
            list_running_calls: AtomicUsize::new(0),
        }
    }

    /// Replace the loaded models of `instance`.
    pub fn set_running(&self, instance: &str, models: &[&str]) {
        self.running.lock().unwrap().insert(
            instance.to_string(),
            models.iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Replace the on-disk models of `instance`.
    pub fn set_available(&self, instance: &str, models: &[&str]) {
        self.available.lock().unwrap().insert(
            instance.to_string(),
            models.iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Make every call to `instance` fail.
    pub fn set_unreachable(&self, instance: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(instance.to_string());
        } else {
            set.remove(instance);
        }
    }

    /// Events the next pulls will stream.
    pub fn set_pull_events(&self, events: Vec<PullEvent>) {
        *self.pull_events.lock().unwrap() = events;
    }

    /// Append an error to the pull stream after the scripted events.
    pub fn set_pull_stream_error(&self, message: Option<&str>) {
        *self.pull_stream_error.lock().unwrap() = message.map(str::to_string);
    }

    /// Make the pull call itself fail.
    pub fn set_pull_initiation_error(&self, message: Option<&str>) {
        *self.pull_initiation_error.lock().unwrap() = message.map(str::to_string);
    }

    /// Keep pull streams open after the scripted events, like a download
    /// that is still going.
    pub fn set_pull_stream_open(&self, open: bool) {
        *self.pull_stream_open.lock().unwrap() = open;
    }

    /// Make load calls fail.
    pub fn set_load_error(&self, message: Option<&str>) {
        *self.load_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn set_load_marks_running(&self, marks: bool) {
        *self.load_marks_running.lock().unwrap() = marks;
    }

    /// `(instance, model)` pairs passed to `load`, in call order.
    pub fn loads(&self) -> Vec<(String, String)> {
        self.loads.lock().unwrap().clone()
    }

    /// How many times `list_running` was called.
    pub fn list_running_calls(&self) -> usize {
        self.list_running_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, instance: &str) -> Result<(), BackendError> {
        if self.unreachable.lock().unwrap().contains(instance) {
            return Err(BackendError::Request {
                instance: instance.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn models_of(map: &Mutex<HashMap<String, Vec<String>>>, instance: &str) -> Vec<BackendModel> {
        map.lock()
            .unwrap()
            .get(instance)
            .map(|models| models.iter().map(BackendModel::named).collect())
            .unwrap_or_default()
    }

    fn add_to(map: &Mutex<HashMap<String, Vec<String>>>, instance: &str, model: &str) {
        let mut map = map.lock().unwrap();
        let models = map.entry(instance.to_string()).or_default();
        if !models.iter().any(|m| m == model) {
            models.push(model.to_string());
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn list_running(&self, instance: &str) -> Result<Vec<BackendModel>, BackendError> {
        self.list_running_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(instance)?;
        Ok(Self::models_of(&self.running, instance))
    }

    async fn list_available(&self, instance: &str) -> Result<Vec<BackendModel>, BackendError> {
        self.check_reachable(instance)?;
        Ok(Self::models_of(&self.available, instance))
    }

    async fn pull(&self, instance: &str, model: &str) -> Result<PullEventStream, BackendError> {
        self.check_reachable(instance)?;
        if let Some(message) = self.pull_initiation_error.lock().unwrap().clone() {
            return Err(BackendError::Status {
                instance: instance.to_string(),
                status: 500,
                body: message,
            });
        }

        let events = self.pull_events.lock().unwrap().clone();
        let succeeded = events.iter().any(PullEvent::is_success);
        let stream_error = self.pull_stream_error.lock().unwrap().clone();
        if succeeded && stream_error.is_none() {
            Self::add_to(&self.available, instance, model);
        }

        let mut items: Vec<Result<PullEvent, BackendError>> = events.into_iter().map(Ok).collect();
        if let Some(message) = stream_error {
            items.push(Err(BackendError::Remote {
                instance: instance.to_string(),
                message,
            }));
        }
        let stream = futures::stream::iter(items);
        if *self.pull_stream_open.lock().unwrap() {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream.boxed())
        }
    }

    async fn load(&self, instance: &str, model: &str) -> Result<(), BackendError> {
        self.check_reachable(instance)?;
        self.loads
            .lock()
            .unwrap()
            .push((instance.to_string(), model.to_string()));
        if let Some(message) = self.load_error.lock().unwrap().clone() {
            return Err(BackendError::Remote {
                instance: instance.to_string(),
                message,
            });
        }
        if *self.load_marks_running.lock().unwrap() {
            Self::add_to(&self.running, instance, model);
        }
        Ok(())
    }
}
