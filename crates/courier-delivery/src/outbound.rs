//! Outbound delivery worker.
//!
//! Drains the outbound queue and attempts delivery through the send
//! gateway. Per message: decode, duplicate check, bounded send, classify.
//! The source message is acknowledged only after its disposition (success,
//! scheduled retry, or dead letter) is durably recorded, so a crash at any
//! point redelivers rather than loses.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, OutboundMessageJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::{Delivery, OUTBOUND_QUEUE},
    connection::ConnectionManager,
    error::Result,
    gateway::SendGateway,
    idempotency::IdempotencyGuard,
    retry::{RetryCoordinator, RetryDisposition},
};

/// One outbound consumer loop. The engine spawns `worker_count` of these;
/// each holds its own claimed deliveries and never shares a delivery tag.
pub struct OutboundWorker {
    id: usize,
    manager: Arc<ConnectionManager>,
    gateway: Arc<dyn SendGateway>,
    coordinator: Arc<RetryCoordinator>,
    guard: Arc<IdempotencyGuard>,
    clock: Arc<dyn Clock>,
    prefetch: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl OutboundWorker {
    /// Creates a worker bound to the shared pipeline services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        manager: Arc<ConnectionManager>,
        gateway: Arc<dyn SendGateway>,
        coordinator: Arc<RetryCoordinator>,
        guard: Arc<IdempotencyGuard>,
        clock: Arc<dyn Clock>,
        prefetch: usize,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, manager, gateway, coordinator, guard, clock, prefetch, poll_interval, cancel }
    }

    /// Main consumer loop: claims and processes batches until cancelled.
    /// In-flight messages are finished before the loop exits.
    pub async fn run(self) {
        if let Err(e) = self.manager.register_consumer(OUTBOUND_QUEUE).await {
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
                    // Connection errors land here; the manager's reconnect
                    // loop owns recovery, we just back off.
                    debug!(worker_id = self.id, error = %e, "outbound batch failed");
                },
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.clock.sleep(self.poll_interval) => {},
            }
        }
    }

    /// Claims and processes one batch. Returns the number of messages
    /// claimed.
    async fn process_batch(&self) -> Result<usize> {
        let deliveries = self.manager.consume(OUTBOUND_QUEUE, self.prefetch).await?;
        let claimed = deliveries.len();

        for delivery in deliveries {
            if let Err(e) = self.process_delivery(delivery).await {
                error!(worker_id = self.id, error = %e, "outbound message processing failed");
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        Ok(claimed)
    }

    async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let mut job: OutboundMessageJob = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                // A parse failure will never succeed on retry.
                self.coordinator
                    .dead_letter_raw(
                        OUTBOUND_QUEUE,
                        &delivery.payload,
                        format!("malformed outbound job: {e}"),
                    )
                    .await?;
                return self.manager.ack(&delivery.tag).await.map_err(Into::into);
            },
        };

        let job_id = job.id.to_string();
        if self.guard.is_completed(&job_id) {
            debug!(worker_id = self.id, job_id = %job_id, "duplicate delivery skipped");
            return self.manager.ack(&delivery.tag).await.map_err(Into::into);
        }

        job.begin_attempt(self.clock.now());

        match self.gateway.send_message(&job).await {
            Ok(ack) => {
                job.mark_delivered();
                self.guard.record(job_id);
                self.coordinator.record_delivered(job.attempt);
                self.manager.ack(&delivery.tag).await?;

                info!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt = job.attempt,
                    status = ack.status_code,
                    provider_message_id = ack.provider_message_id.as_deref().unwrap_or(""),
                    "message delivered"
                );
            },
            Err(e) if e.is_retryable() => {
                // The coordinator owns re-publication; acknowledging the
                // original afterwards avoids a broker-level requeue racing
                // the scheduled retry.
                match self.coordinator.schedule_retry(OUTBOUND_QUEUE, &mut job, &e).await? {
                    RetryDisposition::Scheduled { next_retry_at } => {
                        warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            attempt = job.attempt,
                            next_retry_at = %next_retry_at,
                            error = %e,
                            "delivery failed, retry scheduled"
                        );
                    },
                    RetryDisposition::DeadLettered => {
                        self.guard.record(job_id);
                        error!(
                            worker_id = self.id,
                            job_id = %job.id,
                            attempt = job.attempt,
                            error = %e,
                            "delivery retries exhausted, dead-lettered"
                        );
                    },
                }
                self.manager.ack(&delivery.tag).await?;
            },
            Err(e) => {
                self.coordinator.dead_letter_job(OUTBOUND_QUEUE, &mut job, &e).await?;
                self.guard.record(job_id);
                self.manager.ack(&delivery.tag).await?;

                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %e,
                    "permanent delivery failure, dead-lettered"
                );
            },
        }

        Ok(())
    }
}
