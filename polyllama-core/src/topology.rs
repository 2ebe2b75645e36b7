//! Backend instance naming and addressing.
//!
//! Instances are 1-based and named `<prefix><n>` (`polyllama1`, `polyllama2`, ...).
//! The count is live: it is read on every operation and can be changed at
//! runtime, so no component holds on to an instance list longer than one call.

use crate::config::BackendsConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide view of the backend pool.
#[derive(Debug, Clone)]
pub struct Topology {
    count: Arc<AtomicUsize>,
    prefix: String,
    port: u16,
    url_template: Option<String>,
}

impl Topology {
    pub fn new(config: &BackendsConfig) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(config.instance_count)),
            prefix: config.instance_prefix.clone(),
            port: config.port,
            url_template: config.url_template.clone(),
        }
    }

    /// A topology with `count` default-named instances.
    pub fn with_count(count: usize) -> Self {
        Self::new(&BackendsConfig {
            instance_count: count,
            ..BackendsConfig::default()
        })
    }

    /// Current number of instances.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Change the number of instances. Takes effect on the next operation.
    pub fn set_count(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
    }

    /// Name of the instance at 1-based index `n`.
    pub fn name(&self, n: usize) -> String {
        format!("{}{}", self.prefix, n)
    }

    /// All instance names in index order.
    pub fn instances(&self) -> Vec<String> {
        (1..=self.count()).map(|n| self.name(n)).collect()
    }

    /// 1-based index of `name`, if it belongs to the current pool.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let n: usize = name.strip_prefix(&self.prefix)?.parse().ok()?;
        (n >= 1 && n <= self.count() && self.name(n) == name).then_some(n)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Base URL of an instance, without a trailing slash.
    pub fn base_url(&self, name: &str) -> String {
        match &self.url_template {
            Some(template) => {
                let n = self
                    .index_of(name)
                    .map(|n| n.to_string())
                    .unwrap_or_default();
                template
                    .replace("{name}", name)
                    .replace("{n}", &n)
                    .trim_end_matches('/')
                    .to_string()
            }
            None => format!("http://{}:{}", name, self.port),
        }
    }

    /// Sort instance names by pool index; names outside the pool go last.
    pub fn sort_instances(&self, names: &mut [String]) {
        names.sort_by_key(|name| (self.index_of(name).unwrap_or(usize::MAX), name.clone()));
    }
}
