//! HTTP API handlers and routing.

pub mod error;
mod health;
mod nodes;

use std::sync::Arc;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::registry::NodeRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: NodeRegistry,
    client_base_url: String,
    data_source: String,
}

impl AppState {
    pub fn new(registry: NodeRegistry, client_base_url: String, data_source: String) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                client_base_url,
                data_source,
            }),
        }
    }

    /// Get a reference to the node registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// Base URL clients open broker sessions under.
    pub fn client_base_url(&self) -> &str {
        &self.inner.client_base_url
    }

    /// Broker data source name, needed for client URL derivation.
    pub fn data_source(&self) -> &str {
        &self.inner.data_source
    }
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // The lab frontend is served from a different origin.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .merge(nodes::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
