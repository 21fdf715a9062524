//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use akesod::store::ObjectStore;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    /// Deliveries for any other bucket are acknowledged and dropped.
    pub bucket: Arc<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self {
            store,
            bucket: Arc::new(bucket),
        }
    }
}
