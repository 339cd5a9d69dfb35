//! Producer-facing enqueue API.
//!
//! External collaborators (API routes, webhook receivers) hand work to the
//! pipeline through this surface. Publishes are synchronous: broker
//! unavailability at publish time surfaces to the caller as a typed error
//! and is never retried internally.

use std::sync::Arc;

use bytes::Bytes;
use courier_core::{Clock, OutboundMessageJob, QueuedAck, WebhookEvent};
use thiserror::Error;
use tracing::debug;

use crate::{
    broker::{OUTBOUND_QUEUE, WEBHOOK_QUEUE},
    connection::ConnectionManager,
};

/// Producer-facing enqueue failure.
#[derive(Debug, Clone, Error)]
pub enum EnqueueError {
    /// The broker rejected or could not receive the publish.
    #[error("broker unavailable: {message}")]
    BrokerUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// The job could not be serialized.
    #[error("failed to encode payload: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },
}

/// Synchronous enqueue surface over the managed broker connection.
#[derive(Clone)]
pub struct Producer {
    manager: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl Producer {
    /// Creates a producer publishing through the given manager.
    pub fn new(manager: Arc<ConnectionManager>, clock: Arc<dyn Clock>) -> Self {
        Self { manager, clock }
    }

    /// Enqueues an outbound message job.
    pub async fn enqueue_outbound(
        &self,
        job: &OutboundMessageJob,
    ) -> Result<QueuedAck, EnqueueError> {
        let payload = serde_json::to_vec(job)
            .map_err(|e| EnqueueError::Serialization { message: e.to_string() })?;

        self.manager
            .publish(OUTBOUND_QUEUE, Bytes::from(payload))
            .await
            .map_err(|e| EnqueueError::BrokerUnavailable { message: e.to_string() })?;

        debug!(job_id = %job.id, "outbound job enqueued");
        Ok(QueuedAck {
            id: job.id.to_string(),
            queue: OUTBOUND_QUEUE.to_string(),
            enqueued_at: self.clock.now(),
        })
    }

    /// Enqueues an inbound webhook event.
    pub async fn enqueue_webhook_event(
        &self,
        event: &WebhookEvent,
    ) -> Result<QueuedAck, EnqueueError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| EnqueueError::Serialization { message: e.to_string() })?;

        self.manager
            .publish(WEBHOOK_QUEUE, Bytes::from(payload))
            .await
            .map_err(|e| EnqueueError::BrokerUnavailable { message: e.to_string() })?;

        debug!(event_id = %event.id, event_type = %event.event_type, "webhook event enqueued");
        Ok(QueuedAck {
            id: event.id.to_string(),
            queue: WEBHOOK_QUEUE.to_string(),
            enqueued_at: self.clock.now(),
        })
    }
}
