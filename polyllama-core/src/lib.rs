//! # Polyllama Core
//!
//! Routing core for a pool of Ollama instances presented as one endpoint.
//! Provides model name extraction, the model → instance mapping store, the
//! running-model cache, per-model loading locks, least-loaded placement,
//! reconciliation, pull jobs, catalog search, and the HTTP gateway.

pub mod backend;
pub mod cache;
pub mod config;
pub mod consistency;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod inventory;
pub mod lock;
pub mod mapping;
pub mod metrics;
pub mod pull;
pub mod router;
pub mod search;
pub mod selector;
pub mod store;
pub mod topology;

// Re-export commonly used types at the crate root.
pub use backend::{BackendClient, BackendModel, MockBackend, OllamaClient, PullEvent};
pub use cache::{RunningModelCache, RunningModels};
pub use config::{RouterConfig, load_config};
pub use consistency::{ConsistencyChecker, DuplicateModel, ReconcileReport};
pub use error::{Result, RouterError};
pub use extract::{Extraction, ExtractionStrategy, InboundRequest, extract_model};
pub use gateway::{AppState, gateway_router, run_gateway};
pub use lock::{LockManager, LockOutcome};
pub use mapping::{MappingStore, ModelMapping};
pub use metrics::RouterMetrics;
pub use pull::{PullManager, PullStart, PullState, PullStatus};
pub use router::{ModelRouter, RouteDecision};
pub use search::{HttpCatalog, ModelCatalog, ModelSearch};
pub use selector::InstanceSelector;
pub use store::{MemoryStore, StateStore};
pub use topology::Topology;
