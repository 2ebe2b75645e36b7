//! Configuration system for the Polyllama router.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> CLI overrides. The legacy
//! `OLLAMA_INSTANCE_COUNT` variable set by the generated compose file is honored
//! on top of the `POLYLLAMA_` prefixed environment.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Where the router listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on. Defaults to Ollama's port so clients need no changes.
    pub port: u16,
    /// Largest request body buffered for model extraction.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11434,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// The pool of backend instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendsConfig {
    /// Number of instances, named `<instance_prefix>1..=N`.
    pub instance_count: usize,
    /// Hostname prefix of every instance.
    pub instance_prefix: String,
    /// Port every instance listens on.
    pub port: u16,
    /// Overrides instance addressing. `{name}` and `{n}` are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
    /// Timeout for list/status calls.
    pub status_timeout_secs: u64,
    /// Timeout for the call that loads a model after a pull.
    pub load_timeout_secs: u64,
    /// Timeout for the pull call to start answering.
    pub pull_initiation_timeout_secs: u64,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            instance_count: 1,
            instance_prefix: "polyllama".to_string(),
            port: 11434,
            url_template: None,
            status_timeout_secs: 5,
            load_timeout_secs: 600,
            pull_initiation_timeout_secs: 300,
        }
    }
}

impl BackendsConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn pull_initiation_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_initiation_timeout_secs)
    }
}

/// Routing state lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Seconds before the running-model cache is considered stale.
    pub running_cache_ttl_secs: u64,
    /// Expiry of a loading lock (deadlock recovery).
    pub lock_ttl_secs: u64,
    /// Interval of the background consistency check (0 = disabled).
    pub reconcile_interval_secs: u64,
    /// Interval of the expired-entry sweep of the in-memory store (0 = disabled).
    pub store_sweep_interval_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            running_cache_ttl_secs: 30,
            lock_ttl_secs: 3600,
            reconcile_interval_secs: 60,
            store_sweep_interval_secs: 60,
        }
    }
}

impl RoutingConfig {
    pub fn running_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.running_cache_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Pull job limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullConfig {
    /// A job not observed running after this long times out.
    pub timeout_secs: u64,
    /// How long status records are kept in the store.
    pub retention_secs: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            retention_secs: 24 * 60 * 60,
        }
    }
}

/// External model catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    pub catalog_url: String,
    pub timeout_secs: u64,
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            catalog_url: "https://ollama.com/api/search".to_string(),
            timeout_secs: 10,
            default_limit: 20,
        }
    }
}

impl RouterConfig {
    /// Validate the configuration, returning human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.backends.instance_count == 0 {
            problems.push("backends.instance_count is 0; every request will fail".to_string());
        }
        match &self.backends.url_template {
            Some(template) => {
                if self.backends.instance_count > 1
                    && !template.contains("{name}")
                    && !template.contains("{n}")
                {
                    problems.push(
                        "backends.url_template has no {name} or {n} placeholder; all instances share one address"
                            .to_string(),
                    );
                }
            }
            None => {
                if self.backends.instance_prefix.trim().is_empty() {
                    problems.push("backends.instance_prefix is empty".to_string());
                }
                if self.backends.port == 0 {
                    problems.push("backends.port is 0".to_string());
                }
            }
        }
        if self.backends.status_timeout_secs == 0 {
            problems.push("backends.status_timeout_secs must be positive".to_string());
        }
        if self.routing.lock_ttl_secs == 0 {
            problems.push(
                "routing.lock_ttl_secs is 0; loading locks would expire immediately".to_string(),
            );
        }
        if self.pull.retention_secs < self.pull.timeout_secs {
            problems.push(format!(
                "pull.retention_secs ({}) is shorter than pull.timeout_secs ({}); running jobs may vanish",
                self.pull.retention_secs, self.pull.timeout_secs
            ));
        }
        problems
    }
}

/// Path of the user-level config file (`~/.config/polyllama/router.toml`).
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "polyllama", "polyllama")
        .map(|dirs| dirs.config_dir().join("router.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. `OLLAMA_INSTANCE_COUNT`
/// 3. Environment variables (prefixed with `POLYLLAMA_`, `__` separates sections)
/// 4. Explicit config file
/// 5. User config (`~/.config/polyllama/router.toml`)
/// 6. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&RouterConfig>,
) -> Result<RouterConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RouterConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // POLYLLAMA_BACKENDS__INSTANCE_COUNT, POLYLLAMA_ROUTING__LOCK_TTL_SECS, ...
    figment = figment.merge(Env::prefixed("POLYLLAMA_").split("__"));

    figment = figment.merge(
        Env::raw()
            .only(&["OLLAMA_INSTANCE_COUNT"])
            .map(|_| "backends.instance_count".into()),
    );

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
