//! PostgreSQL-backed durable broker.
//!
//! Stores every queue in a single `courier_messages` table. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never contend on the
//! same rows, delayed visibility is an `available_at` timestamp, and an
//! acknowledgement deletes the row. Unacked claims carry a `leased_until`
//! stamp; once it passes, the message is claimable again and the next
//! delivery is flagged as redelivered.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{BrokerError, QueueSnapshot, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Broker, ConsumerHandle, Delivery, DeliveryTag, QueueSpec};

fn connection_err(e: sqlx::Error) -> BrokerError {
    BrokerError::connection(e.to_string())
}

/// Durable broker on a PostgreSQL pool.
#[derive(Debug)]
pub struct PgBroker {
    pool: PgPool,
    consumers: Mutex<HashMap<String, Arc<AtomicU64>>>,
    leases: Mutex<HashMap<String, Duration>>,
    schema_ready: AtomicBool,
}

impl PgBroker {
    /// Creates a broker over an established pool. The schema is created on
    /// first queue declaration.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            consumers: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            schema_ready: AtomicBool::new(false),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS courier_messages (
                id UUID PRIMARY KEY,
                queue TEXT NOT NULL,
                payload BYTEA NOT NULL,
                available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                leased_until TIMESTAMPTZ,
                redelivered BOOLEAN NOT NULL DEFAULT FALSE
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(connection_err)?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_courier_messages_claim
            ON courier_messages (queue, available_at, enqueued_at)
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(connection_err)?;

        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn lease_seconds(&self, queue: &str) -> f64 {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.get(queue).copied().unwrap_or(Duration::from_secs(30)).as_secs_f64()
    }

    async fn insert(&self, queue: &str, payload: Bytes, delay: Duration) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO courier_messages (id, queue, payload, available_at, enqueued_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4), NOW())
            ",
        )
        .bind(Uuid::new_v4())
        .bind(queue)
        .bind(payload.as_ref())
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::publish(queue, e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map_err(connection_err)?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_schema().await?;
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.insert(spec.name.clone(), spec.lease);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.insert(queue, payload, Duration::ZERO).await
    }

    async fn publish_delayed(&self, queue: &str, payload: Bytes, delay: Duration) -> Result<()> {
        self.insert(queue, payload, delay).await
    }

    async fn consume(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            r"
            UPDATE courier_messages
            SET leased_until = NOW() + make_interval(secs => $3),
                redelivered = (leased_until IS NOT NULL)
            WHERE id IN (
                SELECT id FROM courier_messages
                WHERE queue = $1
                  AND available_at <= NOW()
                  AND (leased_until IS NULL OR leased_until <= NOW())
                ORDER BY enqueued_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, redelivered
            ",
        )
        .bind(queue)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(self.lease_seconds(queue))
        .fetch_all(&self.pool)
        .await
        .map_err(connection_err)?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id").map_err(connection_err)?;
            let payload: Vec<u8> = row.try_get("payload").map_err(connection_err)?;
            let redelivered: bool = row.try_get("redelivered").map_err(connection_err)?;
            deliveries.push(Delivery {
                tag: DeliveryTag { queue: queue.to_string(), message_id: id },
                payload: Bytes::from(payload),
                redelivered,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        let result = sqlx::query("DELETE FROM courier_messages WHERE id = $1 AND queue = $2")
            .bind(tag.message_id)
            .bind(&tag.queue)
            .execute(&self.pool)
            .await
            .map_err(connection_err)?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::ack(tag.to_string(), "delivery unknown or already acked"));
        }
        Ok(())
    }

    async fn peek(&self, queue: &str, max: usize) -> Result<Vec<Bytes>> {
        let rows = sqlx::query(
            r"
            SELECT payload FROM courier_messages
            WHERE queue = $1
              AND available_at <= NOW()
              AND (leased_until IS NULL OR leased_until <= NOW())
            ORDER BY enqueued_at ASC
            LIMIT $2
            ",
        )
        .bind(queue)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(connection_err)?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<Vec<u8>, _>("payload").map(Bytes::from).map_err(connection_err)
            })
            .collect()
    }

    async fn subscribe(&self, queue: &str) -> Result<ConsumerHandle> {
        let counter = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.entry(queue.to_string()).or_default().clone()
        };
        Ok(ConsumerHandle::register(queue, counter))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueSnapshot> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS message_count,
                   MIN(enqueued_at) FILTER (
                       WHERE available_at <= NOW()
                         AND (leased_until IS NULL OR leased_until <= NOW())
                   ) AS oldest_ready
            FROM courier_messages
            WHERE queue = $1
              AND (leased_until IS NULL OR leased_until <= NOW())
            ",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(connection_err)?;

        let message_count: i64 = row.try_get("message_count").map_err(connection_err)?;
        let oldest_ready: Option<DateTime<Utc>> =
            row.try_get("oldest_ready").map_err(connection_err)?;

        let consumer_count = {
            let consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.get(queue).map_or(0, |c| c.load(Ordering::Acquire))
        };

        Ok(QueueSnapshot {
            queue: queue.to_string(),
            message_count: u64::try_from(message_count).unwrap_or(0),
            consumer_count,
            oldest_message_age_seconds: oldest_ready
                .map(|t| u64::try_from((Utc::now() - t).num_seconds().max(0)).unwrap_or(0)),
        })
    }
}
