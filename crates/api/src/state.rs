//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::store::Store;
use herald_scheduler::NotificationScheduler;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<NotificationScheduler>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<NotificationScheduler>) -> Self {
        Self { store, scheduler }
    }
}
