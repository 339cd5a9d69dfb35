//! In-process broker implementation.
//!
//! Backs the test harness and embedded deployments. Semantics match the
//! durable contract where it matters for correctness testing: delayed
//! visibility is gated on the injected clock, unacknowledged deliveries are
//! leased and redelivered on expiry, and every operation can be made to
//! fail to drive reconnect scenarios.

use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{BrokerError, Clock, QueueSnapshot, Result};
use uuid::Uuid;

use super::{Broker, ConsumerHandle, Delivery, DeliveryTag, QueueSpec};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    payload: Bytes,
    enqueued_at: DateTime<Utc>,
    redelivered: bool,
}

#[derive(Debug)]
struct DelayedMessage {
    available_at: DateTime<Utc>,
    seq: u64,
    message: StoredMessage,
}

impl PartialEq for DelayedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.available_at == other.available_at && self.seq == other.seq
    }
}

impl Eq for DelayedMessage {}

impl PartialOrd for DelayedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedMessage {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.available_at.cmp(&other.available_at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
struct LeasedMessage {
    payload: Bytes,
    enqueued_at: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct QueueState {
    lease: Duration,
    ready: VecDeque<StoredMessage>,
    delayed: BinaryHeap<Reverse<DelayedMessage>>,
    leased: HashMap<Uuid, LeasedMessage>,
}

impl QueueState {
    fn new(lease: Duration) -> Self {
        Self { lease, ready: VecDeque::new(), delayed: BinaryHeap::new(), leased: HashMap::new() }
    }

    /// Moves due delayed messages and expired leases back onto the ready
    /// queue. Reclaimed leases are flagged as redelivered.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.available_at > now {
                break;
            }
            let Some(Reverse(due)) = self.delayed.pop() else { break };
            self.ready.push_back(due.message);
        }

        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, leased)| leased.lease_expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(leased) = self.leased.remove(&id) {
                self.ready.push_back(StoredMessage {
                    id,
                    payload: leased.payload,
                    enqueued_at: leased.enqueued_at,
                    redelivered: true,
                });
            }
        }
    }
}

/// In-memory broker with clock-gated delayed visibility, consumer leases,
/// and fault injection.
#[derive(Debug)]
pub struct MemoryBroker {
    clock: Arc<dyn Clock>,
    queues: Mutex<HashMap<String, QueueState>>,
    consumers: Mutex<HashMap<String, Arc<AtomicU64>>>,
    unreachable: AtomicBool,
    seq: AtomicU64,
}

impl MemoryBroker {
    /// Creates an empty broker reading time from the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queues: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    /// Simulates broker outage: while unreachable, every operation fails
    /// with a connection error. Queue contents survive the outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(BrokerError::connection("broker unreachable"));
        }
        Ok(())
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> Result<R> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let state = queues.get_mut(queue).ok_or_else(|| BrokerError::queue_not_found(queue))?;
        Ok(f(state))
    }

    fn store(&self, queue: &str, payload: Bytes, delay: Duration) -> Result<()> {
        self.check_reachable()?;
        let now = self.clock.now();
        let message = StoredMessage {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: now,
            redelivered: false,
        };
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);

        self.with_queue(queue, |state| {
            if delay.is_zero() {
                state.ready.push_back(message);
            } else {
                let available_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
                state.delayed.push(Reverse(DelayedMessage { available_at, seq, message }));
            }
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.check_reachable()?;
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.entry(spec.name.clone()).or_insert_with(|| QueueState::new(spec.lease));
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.store(queue, payload, Duration::ZERO)
    }

    async fn publish_delayed(&self, queue: &str, payload: Bytes, delay: Duration) -> Result<()> {
        self.store(queue, payload, delay)
    }

    async fn consume(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        self.check_reachable()?;
        let now = self.clock.now();

        self.with_queue(queue, |state| {
            state.promote_due(now);

            let lease = chrono::Duration::from_std(state.lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            let mut deliveries = Vec::new();
            while deliveries.len() < max {
                let Some(message) = state.ready.pop_front() else { break };
                state.leased.insert(
                    message.id,
                    LeasedMessage {
                        payload: message.payload.clone(),
                        enqueued_at: message.enqueued_at,
                        lease_expires_at: now + lease,
                    },
                );
                deliveries.push(Delivery {
                    tag: DeliveryTag { queue: queue.to_string(), message_id: message.id },
                    payload: message.payload,
                    redelivered: message.redelivered,
                });
            }
            deliveries
        })
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        self.check_reachable()?;
        self.with_queue(&tag.queue, |state| {
            state.leased.remove(&tag.message_id).map(|_| ()).ok_or_else(|| {
                BrokerError::ack(tag.to_string(), "lease expired or delivery unknown")
            })
        })?
    }

    async fn peek(&self, queue: &str, max: usize) -> Result<Vec<Bytes>> {
        self.check_reachable()?;
        let now = self.clock.now();
        self.with_queue(queue, |state| {
            state.promote_due(now);
            state.ready.iter().take(max).map(|m| m.payload.clone()).collect()
        })
    }

    async fn subscribe(&self, queue: &str) -> Result<ConsumerHandle> {
        self.check_reachable()?;
        {
            let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            if !queues.contains_key(queue) {
                return Err(BrokerError::queue_not_found(queue));
            }
        }
        let counter = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.entry(queue.to_string()).or_default().clone()
        };
        Ok(ConsumerHandle::register(queue, counter))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueSnapshot> {
        self.check_reachable()?;
        let now = self.clock.now();
        let consumer_count = {
            let consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.get(queue).map_or(0, |c| c.load(Ordering::Acquire))
        };

        self.with_queue(queue, |state| {
            state.promote_due(now);
            let oldest = state
                .ready
                .iter()
                .map(|m| m.enqueued_at)
                .min()
                .map(|t| u64::try_from((now - t).num_seconds().max(0)).unwrap_or(0));
            QueueSnapshot {
                queue: queue.to_string(),
                message_count: (state.ready.len() + state.delayed.len()) as u64,
                consumer_count,
                oldest_message_age_seconds: oldest,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;
    use crate::broker::{standard_queues, OUTBOUND_QUEUE};

    async fn broker_with_queues(clock: Arc<TestClock>) -> MemoryBroker {
        let broker = MemoryBroker::new(clock);
        for spec in standard_queues() {
            broker.declare_queue(&spec).await.expect("declare");
        }
        broker
    }

    #[tokio::test]
    async fn publish_consume_ack_round_trip() {
        let clock = Arc::new(TestClock::new());
        let broker = broker_with_queues(clock).await;

        broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"job-1")).await.expect("publish");

        let deliveries = broker.consume(OUTBOUND_QUEUE, 10).await.expect("consume");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload.as_ref(), b"job-1");
        assert!(!deliveries[0].redelivered);

        broker.ack(&deliveries[0].tag).await.expect("ack");

        // Acked messages are gone for good.
        let stats = broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats");
        assert_eq!(stats.message_count, 0);
        assert!(broker.consume(OUTBOUND_QUEUE, 10).await.expect("consume").is_empty());
    }

    #[tokio::test]
    async fn consuming_undeclared_queue_fails() {
        let broker = MemoryBroker::new(Arc::new(TestClock::new()));
        let err = broker.consume("courier.missing", 1).await.expect_err("should fail");
        assert!(matches!(err, BrokerError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn delayed_messages_invisible_until_due() {
        let clock = Arc::new(TestClock::new());
        let broker = broker_with_queues(clock.clone()).await;

        broker
            .publish_delayed(OUTBOUND_QUEUE, Bytes::from_static(b"later"), Duration::from_secs(5))
            .await
            .expect("publish delayed");

        assert!(broker.consume(OUTBOUND_QUEUE, 10).await.expect("consume").is_empty());
        // Still counted as queue depth while delayed.
        assert_eq!(broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats").message_count, 1);

        clock.advance(Duration::from_secs(5));

        let deliveries = broker.consume(OUTBOUND_QUEUE, 10).await.expect("consume");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload.as_ref(), b"later");
    }

    #[tokio::test]
    async fn expired_lease_redelivers_with_flag() {
        let clock = Arc::new(TestClock::new());
        let broker = MemoryBroker::new(clock.clone());
        broker
            .declare_queue(&QueueSpec {
                name: OUTBOUND_QUEUE.to_string(),
                lease: Duration::from_secs(10),
            })
            .await
            .expect("declare");

        broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"crashy")).await.expect("publish");

        let first = broker.consume(OUTBOUND_QUEUE, 1).await.expect("consume");
        assert_eq!(first.len(), 1);

        // Lease still held: no redelivery yet.
        assert!(broker.consume(OUTBOUND_QUEUE, 1).await.expect("consume").is_empty());

        clock.advance(Duration::from_secs(11));

        let second = broker.consume(OUTBOUND_QUEUE, 1).await.expect("consume");
        assert_eq!(second.len(), 1);
        assert!(second[0].redelivered);

        // The original tag no longer acks.
        let err = broker.ack(&first[0].tag).await.expect_err("stale ack should fail");
        assert!(matches!(err, BrokerError::Ack { .. }));

        broker.ack(&second[0].tag).await.expect("fresh ack");
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let clock = Arc::new(TestClock::new());
        let broker = broker_with_queues(clock).await;

        broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"a")).await.expect("publish");
        broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"b")).await.expect("publish");

        let peeked = broker.peek(OUTBOUND_QUEUE, 10).await.expect("peek");
        assert_eq!(peeked.len(), 2);

        let stats = broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats");
        assert_eq!(stats.message_count, 2);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_every_operation() {
        let clock = Arc::new(TestClock::new());
        let broker = broker_with_queues(clock).await;
        broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"x")).await.expect("publish");

        broker.set_unreachable(true);

        assert!(broker.ping().await.is_err());
        assert!(broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"y")).await.is_err());
        assert!(broker.consume(OUTBOUND_QUEUE, 1).await.is_err());

        broker.set_unreachable(false);

        // Contents survived the outage.
        let deliveries = broker.consume(OUTBOUND_QUEUE, 10).await.expect("consume");
        assert_eq!(deliveries.len(), 1);
    }

    #[tokio::test]
    async fn declare_queue_is_idempotent() {
        let clock = Arc::new(TestClock::new());
        let broker = broker_with_queues(clock).await;

        broker.publish(OUTBOUND_QUEUE, Bytes::from_static(b"keep")).await.expect("publish");
        broker.declare_queue(&QueueSpec::new(OUTBOUND_QUEUE)).await.expect("redeclare");

        assert_eq!(broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats").message_count, 1);
    }

    #[tokio::test]
    async fn subscriptions_reflected_in_consumer_count() {
        let clock = Arc::new(TestClock::new());
        let broker = broker_with_queues(clock).await;

        let a = broker.subscribe(OUTBOUND_QUEUE).await.expect("subscribe");
        let b = broker.subscribe(OUTBOUND_QUEUE).await.expect("subscribe");
        assert_eq!(broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats").consumer_count, 2);

        drop(a);
        drop(b);
        assert_eq!(broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats").consumer_count, 0);
    }
}
