//! HTTP status and control surface for the courier pipeline.
//!
//! Exposes the read-only aggregation endpoints (`/status`, `/queue-stats`,
//! `/retry-stats`, `/dead-letters`), the `/restart` control, and
//! conventional health probes, plus the layered service configuration.

#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use courier_delivery::{Engine, StatusService};

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Engine handle, used by `/restart` and health.
    pub engine: Arc<Engine>,
    /// Read-only status aggregation.
    pub status: StatusService,
}

impl AppState {
    /// Builds the handler state from an engine handle.
    pub fn new(engine: Arc<Engine>) -> Self {
        let status = engine.status_service();
        Self { engine, status }
    }
}
