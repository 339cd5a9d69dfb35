//! Downstream event application seam.
//!
//! Inbound webhook events are applied to downstream state (ticket and
//! message records) owned by an external collaborator. The pipeline only
//! guarantees at-least-once delivery of each event to this call; the
//! collaborator is idempotent keyed by the event id.

use async_trait::async_trait;
use courier_core::WebhookEvent;

/// Failure applying an event downstream. The collaborator tags
/// retryability; the worker routes accordingly.
#[derive(Debug, Clone)]
pub struct ApplyError {
    /// Whether the failure is worth retrying.
    pub retryable: bool,
    /// Description of the failure.
    pub reason: String,
}

impl ApplyError {
    /// A transient failure the pipeline should retry.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self { retryable: true, reason: reason.into() }
    }

    /// A permanent failure that goes straight to the dead-letter queue.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self { retryable: false, reason: reason.into() }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ApplyError {}

/// Idempotent downstream application of webhook events.
#[async_trait]
pub trait EventApplier: Send + Sync + 'static {
    /// Applies one event. Must be idempotent keyed by `event.id`.
    async fn apply_event(&self, event: &WebhookEvent) -> Result<(), ApplyError>;
}
