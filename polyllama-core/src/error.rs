//! Error types for the Polyllama routing core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering the shared store, backend calls, loading locks, pull jobs, the model
//! catalog, and configuration.

use std::path::PathBuf;

/// Top-level error type for the routing core.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Pull error: {0}")]
    Pull(#[from] PullError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No backend instances configured")]
    NoInstances,

    #[error("Unknown backend instance: {name}")]
    UnknownInstance { name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the shared state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Corrupted record at '{key}': {message}")]
    Corrupted { key: String, message: String },
}

/// Errors from calls to a backend instance.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Request to {instance} failed: {message}")]
    Request { instance: String, message: String },

    #[error("Request to {instance} timed out after {timeout_secs}s")]
    Timeout { instance: String, timeout_secs: u64 },

    #[error("{instance} answered HTTP {status}: {body}")]
    Status {
        instance: String,
        status: u16,
        body: String,
    },

    #[error("Unparseable response from {instance}: {message}")]
    ResponseParse { instance: String, message: String },

    #[error("{instance} reported: {message}")]
    Remote { instance: String, message: String },
}

/// Errors from the loading lock manager.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Loading lock for '{model}' is unreadable and could not be recovered")]
    Corrupted { model: String },
}

/// Errors from the pull manager.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("Pull job not found: {id}")]
    NotFound { id: String },

    #[error("Invalid model reference: {reason}")]
    InvalidModel { reason: String },
}

/// Errors from the external model catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog request failed: {message}")]
    Request { message: String },

    #[error("Catalog answered HTTP {status}")]
    Status { status: u16 },

    #[error("Catalog response parse error: {message}")]
    ResponseParse { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `RouterError`.
pub type Result<T> = std::result::Result<T, RouterError>;
