//! Test harness for courier integration and unit tests.
//!
//! Provides an in-memory broker, a scripted send gateway, a recording
//! event applier, and an engine factory with tight intervals so pipeline
//! tests settle in milliseconds of wall time.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
    Clock, EventId, EventType, JobId, MessagePayload, OutboundMessageJob, RealClock, WebhookEvent,
};
use courier_delivery::{
    broker::memory::MemoryBroker, ApplyError, ConnectionConfig, DeliveryError, Engine,
    EngineConfig, EventApplier, RetryPolicy, SendAck, SendGateway,
};
use tracing_subscriber::EnvFilter;

/// One recorded call into the scripted gateway.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    /// Job id of the attempted message.
    pub job_id: JobId,
    /// Destination address.
    pub recipient: String,
    /// Message payload as attempted.
    pub payload: MessagePayload,
    /// Attempt number at call time (1-based).
    pub attempt: u32,
}

/// Scripted send gateway.
///
/// Outcomes are consumed in FIFO order; once the script runs dry every
/// call succeeds. All calls are recorded for verification.
#[derive(Debug, Default)]
pub struct MockGateway {
    outcomes: Mutex<VecDeque<Result<SendAck, DeliveryError>>>,
    calls: Mutex<Vec<RecordedSend>>,
}

impl MockGateway {
    /// Creates a gateway that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one scripted outcome.
    pub fn push_outcome(&self, outcome: Result<SendAck, DeliveryError>) {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).push_back(outcome);
    }

    /// Queues `n` consecutive failures with the given error.
    pub fn fail_times(&self, n: usize, error: DeliveryError) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..n {
            outcomes.push_back(Err(error.clone()));
        }
    }

    /// Every send attempt recorded so far.
    pub fn calls(&self) -> Vec<RecordedSend> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of send attempts recorded so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl SendGateway for MockGateway {
    async fn send_message(&self, job: &OutboundMessageJob) -> Result<SendAck, DeliveryError> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(RecordedSend {
            job_id: job.id,
            recipient: job.recipient.clone(),
            payload: job.payload.clone(),
            attempt: job.attempt,
        });

        let scripted = self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        scripted.unwrap_or(Ok(SendAck { provider_message_id: None, status_code: 200 }))
    }
}

/// Recording event applier with scriptable outcomes.
#[derive(Debug, Default)]
pub struct RecordingApplier {
    outcomes: Mutex<VecDeque<Result<(), ApplyError>>>,
    applied: Mutex<Vec<WebhookEvent>>,
}

impl RecordingApplier {
    /// Creates an applier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one scripted outcome.
    pub fn push_outcome(&self, outcome: Result<(), ApplyError>) {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).push_back(outcome);
    }

    /// Every event passed to `apply_event` so far.
    pub fn applied(&self) -> Vec<WebhookEvent> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of apply calls recorded so far.
    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl EventApplier for RecordingApplier {
    async fn apply_event(&self, event: &WebhookEvent) -> Result<(), ApplyError> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        let scripted = self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        scripted.unwrap_or(Ok(()))
    }
}

/// Shared test infrastructure for pipeline tests.
pub struct TestEnv {
    /// In-memory broker with fault injection.
    pub broker: Arc<MemoryBroker>,
    /// Clock shared by the broker and the engine.
    pub clock: Arc<dyn Clock>,
    /// Scripted gateway.
    pub gateway: Arc<MockGateway>,
    /// Recording applier.
    pub applier: Arc<RecordingApplier>,
}

impl TestEnv {
    /// Creates the harness: real clock, tight intervals, tracing wired to
    /// the test writer.
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,courier=debug")),
            )
            .with_test_writer()
            .try_init();

        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        Self {
            broker: Arc::new(MemoryBroker::new(clock.clone())),
            clock,
            gateway: Arc::new(MockGateway::new()),
            applier: Arc::new(RecordingApplier::new()),
        }
    }

    /// Engine configuration with millisecond-scale intervals and jitter
    /// disabled, so retry assertions are exact.
    pub fn fast_config() -> EngineConfig {
        EngineConfig {
            outbound_workers: 2,
            webhook_workers: 2,
            prefetch: 10,
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(3),
            idempotency_capacity: 256,
            retry_policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(40),
                backoff_multiplier: 2.0,
                max_delay: Duration::from_millis(400),
                jitter_fraction: 0.0,
            },
            connection: ConnectionConfig {
                immediate_attempts: 2,
                immediate_retry_delay: Duration::from_millis(10),
                health_interval: Duration::from_millis(40),
                initial_backoff: Duration::from_millis(40),
                max_backoff: Duration::from_millis(200),
            },
        }
    }

    /// Builds an engine over the harness infrastructure.
    pub fn engine(&self) -> Engine {
        self.engine_with_config(Self::fast_config())
    }

    /// Builds an engine with a custom configuration.
    pub fn engine_with_config(&self, config: EngineConfig) -> Engine {
        Engine::new(
            self.broker.clone(),
            self.gateway.clone(),
            self.applier.clone(),
            self.clock.clone(),
            config,
        )
    }

    /// A queued outbound job addressed to the given recipient.
    pub fn outbound_job(&self, recipient: &str, body: &str) -> OutboundMessageJob {
        OutboundMessageJob::new(
            JobId::new(),
            "support-line",
            recipient,
            MessagePayload::text(body),
            Utc::now(),
        )
    }

    /// A freshly received webhook event of the given type.
    pub fn webhook_event(&self, id: &str, event_type: EventType) -> WebhookEvent {
        WebhookEvent::new(
            EventId::new(id),
            "support-line",
            event_type,
            serde_json::json!({"example": true}),
            Utc::now(),
        )
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls an async condition until it holds or the wall-clock deadline
/// passes. Returns whether the condition was met.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
