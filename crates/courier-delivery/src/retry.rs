//! Retry scheduling and dead-letter promotion.
//!
//! Central policy for both worker types: failed attempts come here, and the
//! coordinator either durably publishes a delayed retry envelope or promotes
//! the job to the dead-letter queue. Workers acknowledge the original
//! message only after this module confirms the replacement publish, so a
//! crash between the two can duplicate but never lose a job.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{Clock, JobError, OutboundMessageJob, WebhookEvent};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    broker::{DEAD_LETTER_QUEUE, RETRY_QUEUE},
    connection::ConnectionManager,
    error::{DeliveryError, Result},
};

/// Retry policy configuration.
///
/// Applies to both outbound deliveries and webhook applications. Delays grow
/// geometrically with jitter so synchronized failures do not retry in
/// lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per job, including the initial one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor applied per subsequent retry.
    pub backoff_multiplier: f64,

    /// Delay cap.
    pub max_delay: Duration,

    /// Fraction (0.0 to 1.0) of random spread applied to each delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failure number `attempt` (1-based),
    /// before jitter: `base * multiplier^(attempt - 1)`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(32)).unwrap_or(32);
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay for failure number `attempt`, still capped at
    /// `max_delay`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let capped = self.delay_for_attempt(attempt);
        apply_jitter(capped, self.jitter_fraction).min(self.max_delay)
    }
}

/// Spreads a delay by ±`fraction`. A 10s delay with fraction 0.25 lands
/// anywhere in 7.5s to 12.5s.
pub fn apply_jitter(duration: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return duration;
    }

    let clamped = fraction.clamp(0.0, 1.0);
    let spread = duration.as_secs_f64() * clamped;
    if spread <= 0.0 {
        return duration;
    }

    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

/// Aggregated retry counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    /// Retries durably scheduled.
    pub total_retries: u64,
    /// Jobs that reached a successful disposition after at least one retry.
    pub successful_retries: u64,
    /// Failed attempts that were rescheduled.
    pub failed_retries: u64,
    /// Dead-letter promotions, all paths included.
    pub dead_letter_count: u64,
}

/// Disposition of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// A retry was durably scheduled.
    Scheduled {
        /// When the job becomes due again.
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts were exhausted and the job was promoted to the DLQ.
    DeadLettered,
}

/// Wrapper stored on the delay queue: records which queue a job returns to
/// once its delay elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEnvelope {
    /// Queue the job is routed back to when due.
    pub target_queue: String,
    /// The serialized job.
    pub job: serde_json::Value,
}

/// Jobs the coordinator can reschedule. Implemented by both queue payload
/// types so the scheduling path is written once.
pub trait RetryableJob: Serialize {
    /// Identifier used for dead-letter records and logging.
    fn id_string(&self) -> String;
    /// Attempts made so far (the failure being handled included).
    fn attempts(&self) -> u32;
    /// Failure history accumulated so far.
    fn error_history(&self) -> Vec<JobError>;
    /// Records a failed attempt.
    fn record_failure(&mut self, error: JobError);
    /// Marks a retry as durably scheduled.
    fn mark_retry_scheduled(&mut self, next_retry_at: DateTime<Utc>);
    /// Marks the job dead-lettered.
    fn mark_dead_lettered(&mut self);
}

impl RetryableJob for OutboundMessageJob {
    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }

    fn error_history(&self) -> Vec<JobError> {
        self.error_history.clone()
    }

    fn record_failure(&mut self, error: JobError) {
        OutboundMessageJob::record_failure(self, error);
    }

    fn mark_retry_scheduled(&mut self, next_retry_at: DateTime<Utc>) {
        OutboundMessageJob::mark_retry_scheduled(self, next_retry_at);
    }

    fn mark_dead_lettered(&mut self) {
        OutboundMessageJob::mark_dead_lettered(self);
    }
}

impl RetryableJob for WebhookEvent {
    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }

    fn error_history(&self) -> Vec<JobError> {
        self.error_history.clone()
    }

    fn record_failure(&mut self, error: JobError) {
        WebhookEvent::record_failure(self, error);
    }

    fn mark_retry_scheduled(&mut self, _next_retry_at: DateTime<Utc>) {
        // Events carry no retry timestamp of their own; the envelope's
        // delayed visibility is the schedule.
    }

    fn mark_dead_lettered(&mut self) {}
}

/// Central retry scheduler and dead-letter gatekeeper.
pub struct RetryCoordinator {
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    dead_letter_count: AtomicU64,
}

impl RetryCoordinator {
    /// Creates a coordinator publishing through the given manager.
    pub fn new(manager: Arc<ConnectionManager>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            manager,
            policy,
            clock,
            total_retries: AtomicU64::new(0),
            successful_retries: AtomicU64::new(0),
            failed_retries: AtomicU64::new(0),
            dead_letter_count: AtomicU64::new(0),
        }
    }

    /// The policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a failed attempt: schedules a delayed retry, or promotes to
    /// the dead-letter queue once attempts are exhausted. Returns only
    /// after the replacement message is durably published — callers
    /// acknowledge the original afterwards, never before.
    pub async fn schedule_retry<J: RetryableJob>(
        &self,
        source_queue: &str,
        job: &mut J,
        error: &DeliveryError,
    ) -> Result<RetryDisposition> {
        let now = self.clock.now();
        job.record_failure(JobError::new(error.to_string(), error.is_retryable(), now));

        if job.attempts() >= self.policy.max_attempts {
            self.promote(source_queue, job, format!("retries exhausted: {error}")).await?;
            return Ok(RetryDisposition::DeadLettered);
        }

        // A rate-limited gateway names its own delay; otherwise backoff.
        let delay = match error.retry_after_seconds() {
            Some(seconds) => Duration::from_secs(seconds).min(self.policy.max_delay),
            None => self.policy.jittered_delay(job.attempts()),
        };
        let next_retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        job.mark_retry_scheduled(next_retry_at);

        let envelope = RetryEnvelope {
            target_queue: source_queue.to_string(),
            job: serde_json::to_value(&*job)
                .map_err(|e| DeliveryError::internal(format!("encode retry envelope: {e}")))?,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| DeliveryError::internal(format!("encode retry envelope: {e}")))?;

        self.manager.publish_delayed(RETRY_QUEUE, Bytes::from(payload), delay).await?;

        self.total_retries.fetch_add(1, Ordering::AcqRel);
        self.failed_retries.fetch_add(1, Ordering::AcqRel);

        debug!(
            job_id = %job.id_string(),
            attempt = job.attempts(),
            delay_ms = delay.as_millis(),
            "retry scheduled"
        );
        Ok(RetryDisposition::Scheduled { next_retry_at })
    }

    /// Promotes a job to the dead-letter queue with a reason, bypassing the
    /// retry budget. Used for permanent rejections and unknown event types.
    pub async fn dead_letter_job<J: RetryableJob>(
        &self,
        source_queue: &str,
        job: &mut J,
        error: &DeliveryError,
    ) -> Result<()> {
        job.record_failure(JobError::new(error.to_string(), error.is_retryable(), self.clock.now()));
        self.promote(source_queue, job, error.to_string()).await
    }

    /// Dead-letters a payload that could not be parsed into a job at all.
    pub async fn dead_letter_raw(
        &self,
        source_queue: &str,
        payload: &[u8],
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        let entry = courier_core::DeadLetterEntry {
            source_queue: source_queue.to_string(),
            job_id: None,
            reason: reason.clone(),
            attempts: 0,
            payload: serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
            error_history: Vec::new(),
            dead_lettered_at: self.clock.now(),
        };
        self.publish_dead_letter(&entry).await?;
        warn!(source_queue, reason = %reason, "malformed payload dead-lettered");
        Ok(())
    }

    /// Records a delivery that reached its terminal success. Deliveries
    /// that needed more than one attempt count as successful retries.
    pub fn record_delivered(&self, attempts: u32) {
        if attempts > 1 {
            self.successful_retries.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Counter snapshot since process start.
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_retries: self.total_retries.load(Ordering::Acquire),
            successful_retries: self.successful_retries.load(Ordering::Acquire),
            failed_retries: self.failed_retries.load(Ordering::Acquire),
            dead_letter_count: self.dead_letter_count.load(Ordering::Acquire),
        }
    }

    async fn promote<J: RetryableJob>(
        &self,
        source_queue: &str,
        job: &mut J,
        reason: String,
    ) -> Result<()> {
        job.mark_dead_lettered();
        let entry = courier_core::DeadLetterEntry {
            source_queue: source_queue.to_string(),
            job_id: Some(job.id_string()),
            reason: reason.clone(),
            attempts: job.attempts(),
            payload: serde_json::to_value(&*job)
                .map_err(|e| DeliveryError::internal(format!("encode dead letter: {e}")))?,
            error_history: job.error_history(),
            dead_lettered_at: self.clock.now(),
        };
        self.publish_dead_letter(&entry).await?;

        error!(
            job_id = %job.id_string(),
            attempts = job.attempts(),
            reason = %reason,
            "job dead-lettered"
        );
        Ok(())
    }

    async fn publish_dead_letter(&self, entry: &courier_core::DeadLetterEntry) -> Result<()> {
        let payload = serde_json::to_vec(entry)
            .map_err(|e| DeliveryError::internal(format!("encode dead letter: {e}")))?;
        self.manager.publish(DEAD_LETTER_QUEUE, Bytes::from(payload)).await?;
        self.dead_letter_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Redelivery pump: a timer-driven loop that consumes due envelopes
    /// from the delay queue and routes each job back onto its original
    /// queue. Runs as its own supervised task, decoupled from the worker
    /// loops that schedule retries.
    pub async fn run_pump(
        self: Arc<Self>,
        cancel: CancellationToken,
        poll_interval: Duration,
        batch_size: usize,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.pump_once(batch_size).await {
                Ok(moved) if moved > 0 => continue,
                Ok(_) => {},
                Err(e) => debug!(error = %e, "retry pump pass failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.clock.sleep(poll_interval) => {},
            }
        }
    }

    /// Routes one batch of due envelopes back to their original queues.
    pub async fn pump_once(&self, batch_size: usize) -> Result<usize> {
        let deliveries = self.manager.consume(RETRY_QUEUE, batch_size).await?;
        let moved = deliveries.len();

        for delivery in deliveries {
            match serde_json::from_slice::<RetryEnvelope>(&delivery.payload) {
                Ok(envelope) => {
                    let body = serde_json::to_vec(&envelope.job).map_err(|e| {
                        DeliveryError::internal(format!("encode redelivered job: {e}"))
                    })?;
                    self.manager.publish(&envelope.target_queue, Bytes::from(body)).await?;
                    self.manager.ack(&delivery.tag).await?;
                },
                Err(e) => {
                    // A poisoned envelope would otherwise loop forever.
                    self.dead_letter_raw(
                        RETRY_QUEUE,
                        &delivery.payload,
                        format!("malformed retry envelope: {e}"),
                    )
                    .await?;
                    self.manager.ack(&delivery.tag).await?;
                },
            }
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = no_jitter_policy();

        let delays: Vec<Duration> =
            (1..=4).map(|attempt| policy.delay_for_attempt(attempt)).collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
    }

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let policy = no_jitter_policy();

        for attempt in 1..=64 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(30));
        }
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn fractional_multiplier_supported() {
        let policy = RetryPolicy {
            backoff_multiplier: 1.5,
            jitter_fraction: 0.0,
            ..no_jitter_policy()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs_f64(1.5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs_f64(2.25));
    }

    #[test]
    fn jitter_stays_within_bounds_and_varies() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..50 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(15), "too large: {jittered:?}");
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn zero_jitter_is_identity() {
        let base = Duration::from_secs(7);
        assert_eq!(apply_jitter(base, 0.0), base);
        assert_eq!(apply_jitter(Duration::ZERO, 0.5), Duration::ZERO);
    }

    #[test]
    fn jittered_delay_respects_cap() {
        let policy = RetryPolicy { jitter_fraction: 1.0, ..no_jitter_policy() };

        for attempt in 1..=20 {
            assert!(policy.jittered_delay(attempt) <= Duration::from_secs(30));
        }
    }
}
