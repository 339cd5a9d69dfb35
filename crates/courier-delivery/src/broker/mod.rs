//! Broker abstraction for durable queues.
//!
//! The pipeline never speaks a broker wire protocol directly; it depends on
//! this trait for the delivery/retry/DLQ contract any broker-backed
//! implementation must satisfy: named queues, delayed visibility,
//! consumer-held delivery tags, and explicit acknowledgement.
//!
//! Two implementations ship: [`MemoryBroker`](memory::MemoryBroker) for
//! tests and embedded deployments, and [`PgBroker`](postgres::PgBroker) for
//! durable PostgreSQL-backed queues.

pub mod memory;
pub mod postgres;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{QueueSnapshot, Result};
use uuid::Uuid;

/// Queue holding outbound message jobs.
pub const OUTBOUND_QUEUE: &str = "courier.outbound";

/// Queue holding inbound webhook events.
pub const WEBHOOK_QUEUE: &str = "courier.webhook";

/// Delay queue holding retry envelopes until they become due.
pub const RETRY_QUEUE: &str = "courier.retry";

/// Terminal queue for jobs that exhausted retries or were permanently
/// invalid. Retained for manual inspection; never consumed automatically.
pub const DEAD_LETTER_QUEUE: &str = "courier.dead-letter";

/// Declaration parameters for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Visibility window an unacked delivery is held for before the broker
    /// redelivers it to another consumer.
    pub lease: Duration,
}

impl QueueSpec {
    /// Creates a queue spec with the default 30s lease.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), lease: Duration::from_secs(30) }
    }
}

/// The four queues the pipeline declares at startup.
pub fn standard_queues() -> Vec<QueueSpec> {
    vec![
        QueueSpec::new(OUTBOUND_QUEUE),
        QueueSpec::new(WEBHOOK_QUEUE),
        QueueSpec::new(RETRY_QUEUE),
        QueueSpec::new(DEAD_LETTER_QUEUE),
    ]
}

/// Broker-issued handle identifying one in-flight delivery of one message
/// to one consumer. Required for acknowledgement; held by exactly one
/// worker at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Message identity within the broker.
    pub message_id: Uuid,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.message_id)
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The tag to acknowledge with.
    pub tag: DeliveryTag,
    /// Raw message payload.
    pub payload: Bytes,
    /// True when a previous delivery of this message went unacknowledged
    /// (consumer crash or lease expiry).
    pub redelivered: bool,
}

/// Registration of a live consumer on a queue.
///
/// Backs the broker's `consumer_count` management state; dropping the
/// handle deregisters the consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    counter: Arc<AtomicU64>,
}

impl ConsumerHandle {
    pub(crate) fn register(queue: impl Into<String>, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { queue: queue.into(), counter }
    }

    /// Queue this consumer is registered on.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Durable queue backend contract.
///
/// All operations are point-in-time and may fail with connectivity errors;
/// the connection manager owns reconnect policy, implementations only
/// report.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Verifies the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Declares a queue with declare-if-not-exists semantics. Safe to call
    /// repeatedly and concurrently.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Publishes a message visible immediately.
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<()>;

    /// Publishes a message that becomes visible after `delay`.
    async fn publish_delayed(&self, queue: &str, payload: Bytes, delay: Duration) -> Result<()>;

    /// Claims up to `max` visible messages, leasing them to the caller.
    /// Expired leases are reclaimed and redelivered with
    /// `redelivered = true`.
    async fn consume(&self, queue: &str, max: usize) -> Result<Vec<Delivery>>;

    /// Acknowledges a delivery, removing the message permanently. Fails if
    /// the lease already expired and the message was redelivered elsewhere.
    async fn ack(&self, tag: &DeliveryTag) -> Result<()>;

    /// Reads up to `max` visible messages without consuming them. Used for
    /// dead-letter inspection.
    async fn peek(&self, queue: &str, max: usize) -> Result<Vec<Bytes>>;

    /// Registers a consumer on a queue for management-state accounting.
    async fn subscribe(&self, queue: &str) -> Result<ConsumerHandle>;

    /// Point-in-time queue depth and consumer count.
    async fn queue_stats(&self, queue: &str) -> Result<QueueSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_queues_cover_all_four_roles() {
        let names: Vec<String> = standard_queues().into_iter().map(|q| q.name).collect();
        assert_eq!(
            names,
            vec![OUTBOUND_QUEUE, WEBHOOK_QUEUE, RETRY_QUEUE, DEAD_LETTER_QUEUE]
        );
    }

    #[test]
    fn consumer_handle_tracks_registration() {
        let counter = Arc::new(AtomicU64::new(0));

        let first = ConsumerHandle::register(OUTBOUND_QUEUE, counter.clone());
        let second = ConsumerHandle::register(OUTBOUND_QUEUE, counter.clone());
        assert_eq!(counter.load(Ordering::Acquire), 2);
        assert_eq!(first.queue(), OUTBOUND_QUEUE);

        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(second);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
