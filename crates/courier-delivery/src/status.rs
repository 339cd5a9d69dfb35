//! Read-only status and metrics aggregation.
//!
//! External observers (dashboards, health checks) poll this surface
//! frequently; every method is side-effect-free and returns point-in-time
//! snapshots without touching worker throughput.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use courier_core::{DeadLetterEntry, QueueSnapshot};
use serde::Serialize;

use crate::{
    broker::DEAD_LETTER_QUEUE,
    connection::ConnectionManager,
    error::Result,
    retry::{RetryCoordinator, RetryStats},
};

/// Engine lifecycle flags shared with the status surface.
#[derive(Debug, Default)]
pub struct Lifecycle {
    /// The engine has been constructed and wired.
    pub initialized: AtomicBool,
    /// `start()` completed and `stop()` has not run since.
    pub started: AtomicBool,
}

/// Per-worker-group liveness.
///
/// A group reports running only while at least one of its consumer loops is
/// live AND the broker connection is up — a stale started flag without an
/// active consumer reports false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorsRunning {
    /// Outbound delivery consumer loops.
    pub outbound: bool,
    /// Webhook ingestion consumer loops.
    pub webhook: bool,
    /// Retry redelivery pump.
    pub retry_manager: bool,
}

/// Top-level pipeline status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// The engine has been constructed and wired.
    pub initialized: bool,
    /// `start()` completed and `stop()` has not run since.
    pub started: bool,
    /// Whether the broker connection is currently live.
    pub broker_connected: bool,
    /// Liveness per worker group.
    pub processors_running: ProcessorsRunning,
}

/// Read-only aggregation over the connection manager, worker gauges, and
/// retry counters.
#[derive(Clone)]
pub struct StatusService {
    manager: Arc<ConnectionManager>,
    coordinator: Arc<RetryCoordinator>,
    lifecycle: Arc<Lifecycle>,
    outbound_live: Arc<AtomicUsize>,
    webhook_live: Arc<AtomicUsize>,
    retry_live: Arc<AtomicUsize>,
}

impl StatusService {
    /// Wires the service over shared pipeline state.
    pub fn new(
        manager: Arc<ConnectionManager>,
        coordinator: Arc<RetryCoordinator>,
        lifecycle: Arc<Lifecycle>,
        outbound_live: Arc<AtomicUsize>,
        webhook_live: Arc<AtomicUsize>,
        retry_live: Arc<AtomicUsize>,
    ) -> Self {
        Self { manager, coordinator, lifecycle, outbound_live, webhook_live, retry_live }
    }

    /// Current pipeline status snapshot.
    pub fn status(&self) -> StatusReport {
        let connected = self.manager.is_connected();
        StatusReport {
            initialized: self.lifecycle.initialized.load(Ordering::Acquire),
            started: self.lifecycle.started.load(Ordering::Acquire),
            broker_connected: connected,
            processors_running: ProcessorsRunning {
                outbound: connected && self.outbound_live.load(Ordering::Acquire) > 0,
                webhook: connected && self.webhook_live.load(Ordering::Acquire) > 0,
                retry_manager: connected && self.retry_live.load(Ordering::Acquire) > 0,
            },
        }
    }

    /// Per-queue depth and consumer counts, fetched from the broker at
    /// call time. Callers must tolerate this being a point-in-time
    /// snapshot.
    pub async fn queue_stats(&self) -> Result<BTreeMap<String, QueueSnapshot>> {
        let mut stats = BTreeMap::new();
        for queue in self.manager.queue_names() {
            let snapshot = self.manager.queue_stats(&queue).await?;
            stats.insert(queue, snapshot);
        }
        Ok(stats)
    }

    /// Retry counters, delegated to the retry coordinator.
    pub fn retry_stats(&self) -> RetryStats {
        self.coordinator.stats()
    }

    /// Non-destructive view of up to `limit` dead-letter entries.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let payloads = self.manager.peek(DEAD_LETTER_QUEUE, limit).await?;
        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_slice::<DeadLetterEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                // Entries are written by this process; tolerate foreign
                // bytes rather than failing the whole listing.
                Err(_) => continue,
            }
        }
        Ok(entries)
    }
}
