//! Status, queue-stats, retry-stats, restart, and dead-letter handlers.
//!
//! All read endpoints are stateless snapshots over the status service;
//! dashboards polling every few seconds never perturb worker throughput.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{error, info, instrument};

use crate::AppState;

/// `GET /status` — pipeline lifecycle and processor liveness.
#[instrument(name = "status", skip(app_state))]
pub async fn status(State(app_state): State<AppState>) -> Response {
    Json(app_state.status.status()).into_response()
}

/// `GET /queue-stats` — point-in-time depth and consumer count per queue.
#[instrument(name = "queue_stats", skip(app_state))]
pub async fn queue_stats(State(app_state): State<AppState>) -> Response {
    match app_state.status.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "queue stats unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        },
    }
}

/// `GET /retry-stats` — aggregated retry counters since process start.
#[instrument(name = "retry_stats", skip(app_state))]
pub async fn retry_stats(State(app_state): State<AppState>) -> Response {
    Json(app_state.status.retry_stats()).into_response()
}

/// Query parameters for the dead-letter listing.
#[derive(Debug, Deserialize)]
pub struct DeadLetterParams {
    /// Maximum entries to return.
    #[serde(default = "default_dead_letter_limit")]
    pub limit: usize,
}

fn default_dead_letter_limit() -> usize {
    50
}

/// `GET /dead-letters` — non-destructive view of dead-letter content.
#[instrument(name = "dead_letters", skip(app_state))]
pub async fn dead_letters(
    State(app_state): State<AppState>,
    Query(params): Query<DeadLetterParams>,
) -> Response {
    match app_state.status.dead_letters(params.limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            error!(error = %e, "dead letter listing unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        },
    }
}

/// `POST /restart` — stops then starts the engine and returns the updated
/// status.
#[instrument(name = "restart", skip(app_state))]
pub async fn restart(State(app_state): State<AppState>) -> Response {
    info!("restart requested");

    match app_state.engine.restart().await {
        Ok(()) => Json(app_state.status.status()).into_response(),
        Err(e) => {
            error!(error = %e, "restart failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": e.to_string(),
                    "status": app_state.status.status(),
                })),
            )
                .into_response()
        },
    }
}
