//! Domain models and strongly-typed identifiers.
//!
//! Defines outbound message jobs, inbound webhook events, newtype ID
//! wrappers, and the derived snapshot types exposed to observers. State
//! transition logic lives with the models so workers cannot produce
//! inconsistent jobs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly-typed outbound job identifier.
///
/// Producer-assigned and used as the idempotency key for the delivery
/// pipeline: a job id that already reached a terminal state is never
/// delivered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Strongly-typed webhook event identifier.
///
/// Derived from the provider's event id when available, otherwise assigned
/// by the producer. Downstream application is idempotent keyed by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Wraps a provider-assigned event id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Outbound message content. Opaque to the pipeline: media payloads carry a
/// storage reference, never the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Plain text message body.
    Text {
        /// The message text.
        body: String,
    },
    /// Media message referencing externally stored content.
    Media {
        /// Storage reference for the media object.
        reference: String,
        /// Optional caption accompanying the media.
        caption: Option<String>,
    },
}

impl MessagePayload {
    /// Convenience constructor for a text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }
}

/// Job lifecycle status.
///
/// Jobs progress through these states during processing:
///
/// ```text
/// Queued -> InFlight -> Delivered
///                    -> RetryScheduled -> Queued (redelivery)
///                    -> DeadLettered
/// ```
///
/// `Delivered` and `DeadLettered` are terminal. A job only reaches
/// `DeadLettered` from `Queued` directly when its payload is malformed;
/// every other promotion passes through exhausted attempts or a permanent
/// rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on a queue for a worker.
    Queued,
    /// A worker holds the delivery tag and is attempting the side effect.
    InFlight,
    /// The side effect completed; terminal.
    Delivered,
    /// A retry has been durably scheduled on the delay queue.
    RetryScheduled,
    /// Promoted to the dead-letter queue; terminal.
    DeadLettered,
}

impl JobStatus {
    /// Returns true for states that end the job's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }
}

/// Structured record of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Human-readable failure description.
    pub reason: String,
    /// Whether the failure was classified as retryable.
    pub retryable: bool,
    /// When the failure occurred.
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    /// Creates a failure record.
    pub fn new(reason: impl Into<String>, retryable: bool, occurred_at: DateTime<Utc>) -> Self {
        Self { reason: reason.into(), retryable, occurred_at }
    }
}

/// An outbound chat message awaiting delivery to the external gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessageJob {
    /// Producer-assigned unique identifier; the idempotency key.
    pub id: JobId,

    /// Logical channel the message belongs to.
    pub instance_name: String,

    /// Destination address at the gateway.
    pub recipient: String,

    /// Message content, opaque to the pipeline.
    pub payload: MessagePayload,

    /// Number of send attempts made so far. Only ever increases.
    pub attempt: u32,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// When the producer created the job.
    pub created_at: DateTime<Utc>,

    /// When the most recent attempt was made.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the next attempt becomes due, if a retry is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Most recent failure, if any.
    pub last_error: Option<JobError>,

    /// Every failure recorded so far, oldest first. Carried so dead-letter
    /// promotion retains the full history.
    #[serde(default)]
    pub error_history: Vec<JobError>,
}

impl OutboundMessageJob {
    /// Creates a freshly queued job.
    pub fn new(
        id: JobId,
        instance_name: impl Into<String>,
        recipient: impl Into<String>,
        payload: MessagePayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            instance_name: instance_name.into(),
            recipient: recipient.into(),
            payload,
            attempt: 0,
            status: JobStatus::Queued,
            created_at,
            last_attempt_at: None,
            next_retry_at: None,
            last_error: None,
            error_history: Vec::new(),
        }
    }

    /// Stamps the start of a delivery attempt. `attempt` equals the number
    /// of gateway calls made once this returns.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt += 1;
        self.last_attempt_at = Some(now);
        self.status = JobStatus::InFlight;
    }

    /// Records a failed attempt without deciding its disposition.
    pub fn record_failure(&mut self, error: JobError) {
        self.error_history.push(error.clone());
        self.last_error = Some(error);
    }

    /// Marks the job delivered; terminal.
    pub fn mark_delivered(&mut self) {
        self.status = JobStatus::Delivered;
        self.next_retry_at = None;
    }

    /// Marks a retry as durably scheduled for `next_retry_at`.
    pub fn mark_retry_scheduled(&mut self, next_retry_at: DateTime<Utc>) {
        self.status = JobStatus::RetryScheduled;
        self.next_retry_at = Some(next_retry_at);
    }

    /// Marks the job dead-lettered; terminal.
    pub fn mark_dead_lettered(&mut self) {
        self.status = JobStatus::DeadLettered;
        self.next_retry_at = None;
    }
}

/// Type of an inbound webhook event.
///
/// Recognized types map to downstream application logic; anything else is
/// preserved verbatim and dead-lettered rather than retried, since an
/// unknown type will never become known on redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Channel connection state changed at the provider.
    ConnectionStateChange,
    /// Delivery receipt for a previously sent message.
    DeliveryReceipt,
    /// Inbound message from a customer.
    InboundMessage,
    /// Unrecognized event type, preserved verbatim.
    Unknown(String),
}

impl EventType {
    /// Canonical wire name for this event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionStateChange => "connection-state-change",
            Self::DeliveryReceipt => "delivery-receipt",
            Self::InboundMessage => "inbound-message",
            Self::Unknown(other) => other,
        }
    }

    /// Returns true when the pipeline knows how to apply this event type.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connection-state-change" => Self::ConnectionStateChange,
            "delivery-receipt" => Self::DeliveryReceipt,
            "inbound-message" => Self::InboundMessage,
            _ => Self::Unknown(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An inbound webhook event awaiting idempotent application downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Idempotency key, derived from the provider event id when available.
    pub id: EventId,

    /// Logical channel the event belongs to.
    pub instance_name: String,

    /// Provider event type.
    pub event_type: EventType,

    /// Raw event payload, opaque to the pipeline.
    pub payload: serde_json::Value,

    /// When the webhook receiver accepted the event.
    pub received_at: DateTime<Utc>,

    /// Whether the event has been applied downstream.
    pub processed: bool,

    /// Number of apply attempts made so far.
    pub attempt: u32,

    /// Most recent failure, if any.
    pub last_error: Option<JobError>,

    /// Every failure recorded so far, oldest first.
    #[serde(default)]
    pub error_history: Vec<JobError>,
}

impl WebhookEvent {
    /// Creates a freshly received event.
    pub fn new(
        id: EventId,
        instance_name: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            instance_name: instance_name.into(),
            event_type,
            payload,
            received_at,
            processed: false,
            attempt: 0,
            last_error: None,
            error_history: Vec::new(),
        }
    }

    /// Stamps the start of an apply attempt.
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Records a failed attempt without deciding its disposition.
    pub fn record_failure(&mut self, error: JobError) {
        self.error_history.push(error.clone());
        self.last_error = Some(error);
    }

    /// Marks the event as applied downstream; terminal.
    pub fn mark_processed(&mut self) {
        self.processed = true;
    }
}

/// What lands on the dead-letter queue.
///
/// Retained for manual inspection and operator-driven replay; the pipeline
/// never consumes these automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Queue the message was consumed from.
    pub source_queue: String,

    /// Job or event id, when the payload could be parsed.
    pub job_id: Option<String>,

    /// Why the message was promoted.
    pub reason: String,

    /// Attempts made before promotion.
    pub attempts: u32,

    /// The full job, or the raw payload when it could not be parsed.
    pub payload: serde_json::Value,

    /// Failure history carried over from the job.
    #[serde(default)]
    pub error_history: Vec<JobError>,

    /// When the promotion happened.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Producer-facing receipt for a successful enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAck {
    /// Identifier of the enqueued job or event.
    pub id: String,
    /// Queue the message was published to.
    pub queue: String,
    /// When the broker accepted the publish.
    pub enqueued_at: DateTime<Utc>,
}

/// Point-in-time view of one queue, fetched from broker management state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Queue name.
    pub queue: String,
    /// Messages currently ready or delayed on the queue.
    pub message_count: u64,
    /// Consumers currently registered on the queue.
    pub consumer_count: u64,
    /// Age in seconds of the oldest ready message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_message_age_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> OutboundMessageJob {
        OutboundMessageJob::new(
            JobId::new(),
            "support-line",
            "+15550100",
            MessagePayload::text("hello"),
            Utc::now(),
        )
    }

    #[test]
    fn new_job_starts_queued_with_zero_attempts() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert!(job.last_error.is_none());
        assert!(job.error_history.is_empty());
    }

    #[test]
    fn begin_attempt_increments_and_stamps() {
        let mut job = sample_job();
        let now = Utc::now();

        job.begin_attempt(now);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.status, JobStatus::InFlight);
        assert_eq!(job.last_attempt_at, Some(now));

        job.begin_attempt(now);
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn failures_accumulate_in_history() {
        let mut job = sample_job();
        let now = Utc::now();

        job.record_failure(JobError::new("timeout", true, now));
        job.record_failure(JobError::new("503", true, now));

        assert_eq!(job.error_history.len(), 2);
        assert_eq!(job.last_error.as_ref().map(|e| e.reason.as_str()), Some("503"));
    }

    #[test]
    fn terminal_states_identified() {
        assert!(JobStatus::Delivered.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InFlight.is_terminal());
        assert!(!JobStatus::RetryScheduled.is_terminal());
    }

    #[test]
    fn job_round_trips_through_json() {
        let mut job = sample_job();
        job.begin_attempt(Utc::now());
        job.record_failure(JobError::new("gateway 502", true, Utc::now()));
        job.mark_retry_scheduled(Utc::now() + chrono::Duration::seconds(4));

        let bytes = serde_json::to_vec(&job).expect("serialize");
        let decoded: OutboundMessageJob = serde_json::from_slice(&bytes).expect("deserialize");

        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.attempt, 1);
        assert_eq!(decoded.status, JobStatus::RetryScheduled);
        assert_eq!(decoded.error_history.len(), 1);
    }

    #[test]
    fn event_type_maps_known_names() {
        assert_eq!(
            EventType::from("connection-state-change".to_string()),
            EventType::ConnectionStateChange
        );
        assert_eq!(EventType::from("inbound-message".to_string()), EventType::InboundMessage);
        assert_eq!(EventType::from("delivery-receipt".to_string()), EventType::DeliveryReceipt);

        let unknown = EventType::from("presence-update".to_string());
        assert_eq!(unknown, EventType::Unknown("presence-update".to_string()));
        assert!(!unknown.is_recognized());
        assert_eq!(unknown.as_str(), "presence-update");
    }

    #[test]
    fn event_type_round_trips_unknown_through_serde() {
        let event = WebhookEvent::new(
            EventId::new("evt-991"),
            "support-line",
            EventType::Unknown("presence-update".to_string()),
            serde_json::json!({"state": "composing"}),
            Utc::now(),
        );

        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"presence-update\""));

        let decoded: WebhookEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded.event_type, EventType::Unknown("presence-update".to_string()));
    }

    #[test]
    fn queue_snapshot_serializes_camel_case() {
        let snapshot = QueueSnapshot {
            queue: "courier.outbound".to_string(),
            message_count: 7,
            consumer_count: 2,
            oldest_message_age_seconds: None,
        };

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["messageCount"], 7);
        assert_eq!(json["consumerCount"], 2);
        assert!(json.get("oldestMessageAgeSeconds").is_none());
    }
}
