//! Application state shared across handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::relay::RelayHub;

#[derive(Clone)]
pub struct AppState {
    /// Live session relays.
    pub hub: Arc<RelayHub>,
    /// Used by the health check.
    pub db: Database,
    /// Origins allowed by CORS. Empty means local development origins.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(hub: Arc<RelayHub>, db: Database, allowed_origins: Vec<String>) -> Self {
        Self {
            hub,
            db,
            allowed_origins,
        }
    }
}
