//! # HTTP Gateway
//!
//! The single endpoint clients talk to. Router endpoints (`/api/router/*`) and
//! the merged listings (`/api/tags`, `/api/ps`) are answered here; every other
//! request is routed by model and forwarded to a backend instance.

mod api;
mod proxy;
mod server;

pub use api::ApiError;
pub use proxy::{Forwarder, TARGET_INSTANCE_HEADER};
pub use server::{router as gateway_router, run as run_gateway};

use crate::router::ModelRouter;
use std::sync::Arc;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self {
            router,
            forwarder: Forwarder::new(),
        }
    }
}
