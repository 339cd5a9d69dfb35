//! Webhook ingestion worker.
//!
//! Drains the inbound webhook-event queue and applies each event to
//! downstream state through the `EventApplier` collaborator. The decision
//! tree mirrors the outbound worker, with two differences: the success
//! action is an idempotent apply call, and events with an unrecognized
//! type are dead-lettered rather than retried.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, WebhookEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    apply::EventApplier,
    broker::{Delivery, WEBHOOK_QUEUE},
    connection::ConnectionManager,
    error::{DeliveryError, Result},
    idempotency::IdempotencyGuard,
    retry::{RetryCoordinator, RetryDisposition},
};

/// One webhook-event consumer loop.
pub struct IngestWorker {
    id: usize,
    manager: Arc<ConnectionManager>,
    applier: Arc<dyn EventApplier>,
    coordinator: Arc<RetryCoordinator>,
    guard: Arc<IdempotencyGuard>,
    clock: Arc<dyn Clock>,
    prefetch: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl IngestWorker {
    /// Creates a worker bound to the shared pipeline services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        manager: Arc<ConnectionManager>,
        applier: Arc<dyn EventApplier>,
        coordinator: Arc<RetryCoordinator>,
        guard: Arc<IdempotencyGuard>,
        clock: Arc<dyn Clock>,
        prefetch: usize,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, manager, applier, coordinator, guard, clock, prefetch, poll_interval, cancel }
    }

    /// Main consumer loop: claims and processes batches until cancelled.
    pub async fn run(self) {
        if let Err(e) = self.manager.register_consumer(WEBHOOK_QUEUE).await {
            warn!(worker_id = self.id, error = %e, "consumer registration deferred");
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(processed) if processed > 0 => continue,
                Ok(_) => {},
                Err(e) => {
                    debug!(worker_id = self.id, error = %e, "webhook batch failed");
                },
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.clock.sleep(self.poll_interval) => {},
            }
        }
    }

    async fn process_batch(&self) -> Result<usize> {
        let deliveries = self.manager.consume(WEBHOOK_QUEUE, self.prefetch).await?;
        let claimed = deliveries.len();

        for delivery in deliveries {
            if let Err(e) = self.process_delivery(delivery).await {
                error!(worker_id = self.id, error = %e, "webhook event processing failed");
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        Ok(claimed)
    }

    async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let mut event: WebhookEvent = match serde_json::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                self.coordinator
                    .dead_letter_raw(
                        WEBHOOK_QUEUE,
                        &delivery.payload,
                        format!("malformed webhook event: {e}"),
                    )
                    .await?;
                return self.manager.ack(&delivery.tag).await.map_err(Into::into);
            },
        };

        let event_id = event.id.to_string();
        if self.guard.is_completed(&event_id) {
            debug!(worker_id = self.id, event_id = %event_id, "duplicate event skipped");
            return self.manager.ack(&delivery.tag).await.map_err(Into::into);
        }

        if !event.event_type.is_recognized() {
            // Redelivery cannot make an unknown type known.
            let error = DeliveryError::unknown_event_type(event.event_type.as_str());
            self.coordinator.dead_letter_job(WEBHOOK_QUEUE, &mut event, &error).await?;
            self.guard.record(event_id);
            self.manager.ack(&delivery.tag).await?;

            error!(
                worker_id = self.id,
                event_id = %event.id,
                event_type = %event.event_type,
                "unknown event type dead-lettered"
            );
            return Ok(());
        }

        event.begin_attempt();

        match self.applier.apply_event(&event).await {
            Ok(()) => {
                event.mark_processed();
                self.guard.record(event_id);
                self.coordinator.record_delivered(event.attempt);
                self.manager.ack(&delivery.tag).await?;

                info!(
                    worker_id = self.id,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt = event.attempt,
                    "event applied"
                );
            },
            Err(apply_error) => {
                let error = DeliveryError::ApplyFailed {
                    reason: apply_error.reason.clone(),
                    retryable: apply_error.retryable,
                };

                if error.is_retryable() {
                    match self.coordinator.schedule_retry(WEBHOOK_QUEUE, &mut event, &error).await? {
                        RetryDisposition::Scheduled { next_retry_at } => {
                            warn!(
                                worker_id = self.id,
                                event_id = %event.id,
                                attempt = event.attempt,
                                next_retry_at = %next_retry_at,
                                error = %error,
                                "apply failed, retry scheduled"
                            );
                        },
                        RetryDisposition::DeadLettered => {
                            self.guard.record(event_id);
                            error!(
                                worker_id = self.id,
                                event_id = %event.id,
                                attempt = event.attempt,
                                error = %error,
                                "apply retries exhausted, dead-lettered"
                            );
                        },
                    }
                } else {
                    self.coordinator.dead_letter_job(WEBHOOK_QUEUE, &mut event, &error).await?;
                    self.guard.record(event_id);
                    error!(
                        worker_id = self.id,
                        event_id = %event.id,
                        attempt = event.attempt,
                        error = %error,
                        "permanent apply failure, dead-lettered"
                    );
                }
                self.manager.ack(&delivery.tag).await?;
            },
        }

        Ok(())
    }
}
