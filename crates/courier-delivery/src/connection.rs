//! Broker connection lifecycle management.
//!
//! The connection manager owns the process's single broker handle and is
//! the only channel issuer: workers, the retry coordinator, and the
//! producer all publish and consume through it. Connection-level failures
//! are absorbed here (reconnect loop with capped exponential backoff) and
//! never surface to job-processing logic as job failures.

use std::{
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use bytes::Bytes;
use courier_core::{BrokerError, Clock, QueueSnapshot, Result};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, ConsumerHandle, Delivery, DeliveryTag, QueueSpec};

/// Configuration for connection establishment and supervision.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded number of immediate connect attempts before `start()` fails
    /// fast with a connection error.
    pub immediate_attempts: u32,

    /// Delay between immediate connect attempts.
    pub immediate_retry_delay: Duration,

    /// How often the monitor pings a healthy connection.
    pub health_interval: Duration,

    /// First reconnect delay after a detected outage.
    pub initial_backoff: Duration,

    /// Reconnect delay cap.
    pub max_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            immediate_attempts: 3,
            immediate_retry_delay: Duration::from_millis(500),
            health_interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Immutable snapshot of connection state. Safe to take from any task
/// concurrently with reconnect attempts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Whether the broker is currently reachable.
    pub connected: bool,
    /// Most recent connection error, if any.
    pub last_error: Option<String>,
    /// Reconnect attempts made since process start.
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
struct StateInner {
    connected: bool,
    last_error: Option<String>,
    reconnect_attempts: u64,
}

#[derive(Default)]
struct MonitorState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the lifecycle of the broker connection: bounded initial connect,
/// idempotent queue declaration, background reconnect with exponential
/// backoff, and consumer re-registration on recovery.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: ConnectionConfig,
    queues: Vec<QueueSpec>,
    state: RwLock<StateInner>,
    subscriptions: Mutex<Vec<String>>,
    handles: Mutex<Vec<ConsumerHandle>>,
    connectivity: watch::Sender<bool>,
    monitor: tokio::sync::Mutex<MonitorState>,
    self_ref: Weak<Self>,
}

impl ConnectionManager {
    /// Creates a manager for the given broker and queue topology. Nothing
    /// connects until `start()`.
    pub fn new(
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        config: ConnectionConfig,
        queues: Vec<QueueSpec>,
    ) -> Arc<Self> {
        let (connectivity, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            broker,
            clock,
            config,
            queues,
            state: RwLock::new(StateInner::default()),
            subscriptions: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            connectivity,
            monitor: tokio::sync::Mutex::new(MonitorState::default()),
            self_ref: weak.clone(),
        })
    }

    /// Establishes the connection and declares all queues.
    ///
    /// Makes a bounded number of immediate attempts; if the broker stays
    /// unreachable this returns a typed connection error, but the
    /// background reconnect loop still runs until `stop()`, so the process
    /// recovers unattended once the broker comes back.
    pub async fn start(&self) -> Result<()> {
        self.stop_monitor().await;

        let mut last_error: Option<BrokerError> = None;
        for attempt in 1..=self.config.immediate_attempts.max(1) {
            match self.broker.ping().await {
                Ok(()) => {
                    last_error = None;
                    break;
                },
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.config.immediate_attempts,
                        error = %e,
                        "broker connect attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.config.immediate_attempts {
                        self.clock.sleep(self.config.immediate_retry_delay).await;
                    }
                },
            }
        }

        let result = match last_error {
            None => match self.establish().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.record_failure(&e);
                    Err(e)
                },
            },
            Some(e) => {
                self.record_failure(&e);
                Err(e)
            },
        };

        self.spawn_monitor().await;
        result
    }

    /// Gracefully closes the connection: stops the monitor, deregisters
    /// consumers, and marks the manager disconnected. Acknowledgements
    /// already sent are not rolled back.
    pub async fn stop(&self) {
        self.stop_monitor().await;
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).clear();
        // Registrations die with the workers; the next start re-registers.
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clear();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.connected = false;
        drop(state);
        let _ = self.connectivity.send(false);
        info!("broker connection stopped");
    }

    /// Returns an immutable snapshot of the connection state.
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        ConnectionStatus {
            connected: state.connected,
            last_error: state.last_error.clone(),
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    /// Whether the broker is currently reachable.
    pub fn is_connected(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).connected
    }

    /// Subscribes to connectivity transitions; the value is the current
    /// connected flag.
    pub fn watch_connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    /// Names of the declared queues.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    /// Registers a consumer on a queue. The registration outlives
    /// disconnects: the monitor re-subscribes every registered consumer on
    /// recovery (workers re-register, they are not re-created).
    pub async fn register_consumer(&self, queue: &str) -> Result<()> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).push(queue.to_string());

        if self.is_connected() {
            let handle = self.broker.subscribe(queue).await?;
            self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        }
        Ok(())
    }

    /// Publishes a message through the managed connection.
    pub async fn publish(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;
        self.broker.publish(queue, payload).await.map_err(|e| self.note_error(e))
    }

    /// Publishes a message that becomes visible after `delay`.
    pub async fn publish_delayed(&self, queue: &str, payload: Bytes, delay: Duration) -> Result<()> {
        self.ensure_connected()?;
        self.broker.publish_delayed(queue, payload, delay).await.map_err(|e| self.note_error(e))
    }

    /// Claims up to `max` messages from a queue.
    pub async fn consume(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        self.ensure_connected()?;
        self.broker.consume(queue, max).await.map_err(|e| self.note_error(e))
    }

    /// Acknowledges a delivery.
    pub async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        self.ensure_connected()?;
        self.broker.ack(tag).await.map_err(|e| self.note_error(e))
    }

    /// Reads messages without consuming them.
    pub async fn peek(&self, queue: &str, max: usize) -> Result<Vec<Bytes>> {
        self.ensure_connected()?;
        self.broker.peek(queue, max).await.map_err(|e| self.note_error(e))
    }

    /// Point-in-time stats for one queue, fetched from the broker at call
    /// time.
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueSnapshot> {
        self.ensure_connected()?;
        self.broker.queue_stats(queue).await.map_err(|e| self.note_error(e))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::connection("broker connection is not established"))
        }
    }

    /// Flags a proxied failure. Connectivity errors flip the connected
    /// state immediately instead of waiting for the next health tick.
    fn note_error(&self, error: BrokerError) -> BrokerError {
        if error.is_connectivity() {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.connected {
                warn!(error = %error, "broker connection lost");
                state.connected = false;
            }
            state.last_error = Some(error.to_string());
            drop(state);
            let _ = self.connectivity.send(false);
        }
        error
    }

    fn record_failure(&self, error: &BrokerError) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.connected {
            warn!(error = %error, "broker connection lost");
        }
        state.connected = false;
        state.last_error = Some(error.to_string());
        drop(state);
        let _ = self.connectivity.send(false);
    }

    /// Declares queues, re-subscribes registered consumers, and marks the
    /// connection live.
    async fn establish(&self) -> Result<()> {
        for spec in &self.queues {
            self.broker.declare_queue(spec).await?;
        }
        self.resubscribe().await?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.connected = true;
        state.last_error = None;
        drop(state);
        let _ = self.connectivity.send(true);

        info!(queues = self.queues.len(), "broker connection established");
        Ok(())
    }

    async fn resubscribe(&self) -> Result<()> {
        let queues: Vec<String> =
            self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let mut fresh = Vec::with_capacity(queues.len());
        for queue in &queues {
            fresh.push(self.broker.subscribe(queue).await?);
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        *handles = fresh;
        if !queues.is_empty() {
            debug!(consumers = queues.len(), "re-registered consumers");
        }
        Ok(())
    }

    async fn spawn_monitor(&self) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            manager.monitor_loop(token).await;
        });

        let mut monitor = self.monitor.lock().await;
        monitor.cancel = Some(cancel);
        monitor.handle = Some(handle);
    }

    async fn stop_monitor(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some(cancel) = monitor.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = monitor.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "connection monitor task panicked");
                }
            }
        }
    }

    /// Health monitor: pings on a fixed cadence while connected and with
    /// capped exponential backoff while reconnecting.
    async fn monitor_loop(&self, cancel: CancellationToken) {
        let mut backoff = self.config.initial_backoff;

        loop {
            let delay = if self.is_connected() {
                backoff = self.config.initial_backoff;
                self.config.health_interval
            } else {
                let current = backoff;
                backoff = (backoff * 2).min(self.config.max_backoff);
                current
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.clock.sleep(delay) => {},
            }
            if cancel.is_cancelled() {
                break;
            }

            let was_connected = self.is_connected();
            match self.broker.ping().await {
                Ok(()) => {
                    if !was_connected {
                        {
                            let mut state =
                                self.state.write().unwrap_or_else(|e| e.into_inner());
                            state.reconnect_attempts += 1;
                        }
                        match self.establish().await {
                            Ok(()) => info!("broker connection recovered"),
                            Err(e) => self.record_failure(&e),
                        }
                    }
                },
                Err(e) => {
                    if !was_connected {
                        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                        state.reconnect_attempts += 1;
                        state.last_error = Some(e.to_string());
                    } else {
                        self.record_failure(&e);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::RealClock;

    use super::*;
    use crate::broker::{memory::MemoryBroker, standard_queues, OUTBOUND_QUEUE};

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            immediate_attempts: 2,
            immediate_retry_delay: Duration::from_millis(10),
            health_interval: Duration::from_millis(25),
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(100),
        }
    }

    fn manager_over(broker: Arc<MemoryBroker>) -> Arc<ConnectionManager> {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        ConnectionManager::new(broker, clock, fast_config(), standard_queues())
    }

    async fn wait_for_connected(manager: &ConnectionManager, expected: bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.is_connected() != expected {
            assert!(std::time::Instant::now() < deadline, "connectivity never became {expected}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn start_declares_queues_and_connects() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let broker = Arc::new(MemoryBroker::new(clock));
        let manager = manager_over(broker.clone());

        manager.start().await.expect("start should succeed");
        assert!(manager.is_connected());

        // Queues were declared; publishing through the manager works.
        manager
            .publish(OUTBOUND_QUEUE, Bytes::from_static(b"hello"))
            .await
            .expect("publish through manager");

        manager.stop().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn start_fails_fast_when_unreachable_then_recovers() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let broker = Arc::new(MemoryBroker::new(clock));
        broker.set_unreachable(true);
        let manager = manager_over(broker.clone());

        let err = manager.start().await.expect_err("start should fail fast");
        assert!(matches!(err, BrokerError::Connection { .. }));
        let status = manager.status();
        assert!(!status.connected);
        assert!(status.last_error.is_some());

        // The background loop keeps trying and recovers unattended.
        broker.set_unreachable(false);
        wait_for_connected(&manager, true).await;
        assert!(manager.status().reconnect_attempts >= 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn outage_flips_status_and_recovery_resubscribes_consumers() {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let broker = Arc::new(MemoryBroker::new(clock));
        let manager = manager_over(broker.clone());
        manager.start().await.expect("start");

        manager.register_consumer(OUTBOUND_QUEUE).await.expect("register");
        assert_eq!(
            broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats").consumer_count,
            1
        );

        broker.set_unreachable(true);
        wait_for_connected(&manager, false).await;

        // While disconnected the manager refuses to issue channels.
        let err = manager
            .publish(OUTBOUND_QUEUE, Bytes::from_static(b"x"))
            .await
            .expect_err("publish while down");
        assert!(err.is_connectivity());

        broker.set_unreachable(false);
        wait_for_connected(&manager, true).await;

        // The registered consumer was re-subscribed, not lost.
        assert_eq!(
            broker.queue_stats(OUTBOUND_QUEUE).await.expect("stats").consumer_count,
            1
        );

        manager.stop().await;
    }
}
