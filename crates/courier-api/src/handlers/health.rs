//! Health probes for orchestration systems.
//!
//! The health endpoint reports broker connectivity; liveness only confirms
//! the process is serving requests. Both are cheap enough to poll every
//! few seconds.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health.
    pub status: HealthStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Individual component checks.
    pub checks: HealthChecks,
    /// Service version.
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Critical systems failing.
    Unhealthy,
}

/// Per-component health.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Broker connectivity.
    pub broker: ComponentHealth,
}

/// One component's health.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Up or down.
    pub status: ComponentStatus,
    /// Error detail when down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Component-level status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy.
    Up,
    /// Component is experiencing issues.
    Down,
}

/// Primary health check endpoint.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let connection = app_state.engine.manager().status();

    let broker = if connection.connected {
        ComponentHealth { status: ComponentStatus::Up, message: None }
    } else {
        ComponentHealth { status: ComponentStatus::Down, message: connection.last_error }
    };

    let (status, code) = if connection.connected {
        (HealthStatus::Healthy, StatusCode::OK)
    } else {
        (HealthStatus::Unhealthy, StatusCode::SERVICE_UNAVAILABLE)
    };

    debug!(connected = connection.connected, "health check completed");

    let response = HealthResponse {
        status,
        timestamp: Utc::now(),
        checks: HealthChecks { broker },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (code, Json(response)).into_response()
}

/// Liveness probe: confirms the process serves requests, nothing more.
#[instrument(name = "liveness_check", skip(_app_state))]
pub async fn liveness_check(State(_app_state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": Utc::now(),
        "service": "courier-api",
    });

    (StatusCode::OK, Json(response)).into_response()
}
