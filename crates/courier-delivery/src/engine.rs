//! Pipeline engine: lifecycle supervision over every component.
//!
//! Composes the connection manager, worker pools, and retry pump into one
//! start/stop/restart surface. Lifecycle state sits behind interior locks
//! so the HTTP layer can hold a shared handle and trigger restarts.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_core::Clock;
use tracing::{info, warn};

use crate::{
    apply::EventApplier,
    broker::{standard_queues, Broker},
    connection::{ConnectionConfig, ConnectionManager},
    error::Result,
    gateway::SendGateway,
    idempotency::IdempotencyGuard,
    ingest::IngestWorker,
    outbound::OutboundWorker,
    pool::WorkerPool,
    producer::Producer,
    retry::{RetryCoordinator, RetryPolicy},
    status::{Lifecycle, StatusReport, StatusService},
};

/// Configuration for the pipeline engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent outbound delivery consumer loops.
    pub outbound_workers: usize,

    /// Concurrent webhook ingestion consumer loops.
    pub webhook_workers: usize,

    /// Unacknowledged messages each consumer may hold at once.
    pub prefetch: usize,

    /// How often idle consumers poll for new messages.
    pub poll_interval: Duration,

    /// Maximum time to wait for in-flight messages on shutdown.
    pub shutdown_timeout: Duration,

    /// Completed-id capacity of each idempotency guard.
    pub idempotency_capacity: usize,

    /// Retry policy applied by the coordinator.
    pub retry_policy: RetryPolicy,

    /// Connection establishment and supervision settings.
    pub connection: ConnectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outbound_workers: 3,
            webhook_workers: 2,
            prefetch: 10,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            idempotency_capacity: 1024,
            retry_policy: RetryPolicy::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

struct RunningWorkers {
    outbound: WorkerPool,
    webhook: WorkerPool,
    retry: WorkerPool,
}

/// Supervises the whole pipeline: connection, worker pools, retry pump.
pub struct Engine {
    config: EngineConfig,
    manager: Arc<ConnectionManager>,
    coordinator: Arc<RetryCoordinator>,
    gateway: Arc<dyn SendGateway>,
    applier: Arc<dyn EventApplier>,
    clock: Arc<dyn Clock>,
    outbound_guard: Arc<IdempotencyGuard>,
    webhook_guard: Arc<IdempotencyGuard>,
    lifecycle: Arc<Lifecycle>,
    outbound_live: Arc<AtomicUsize>,
    webhook_live: Arc<AtomicUsize>,
    retry_live: Arc<AtomicUsize>,
    running: tokio::sync::Mutex<Option<RunningWorkers>>,
}

impl Engine {
    /// Wires an engine over a broker backend and the two collaborator
    /// seams. Nothing runs until `start()`.
    pub fn new(
        broker: Arc<dyn Broker>,
        gateway: Arc<dyn SendGateway>,
        applier: Arc<dyn EventApplier>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let manager = ConnectionManager::new(
            broker,
            clock.clone(),
            config.connection.clone(),
            standard_queues(),
        );
        let coordinator = Arc::new(RetryCoordinator::new(
            manager.clone(),
            config.retry_policy.clone(),
            clock.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.initialized.store(true, Ordering::Release);

        Self {
            outbound_guard: Arc::new(IdempotencyGuard::new(config.idempotency_capacity)),
            webhook_guard: Arc::new(IdempotencyGuard::new(config.idempotency_capacity)),
            config,
            manager,
            coordinator,
            gateway,
            applier,
            clock,
            lifecycle,
            outbound_live: Arc::new(AtomicUsize::new(0)),
            webhook_live: Arc::new(AtomicUsize::new(0)),
            retry_live: Arc::new(AtomicUsize::new(0)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// The connection manager issuing all broker channels.
    pub fn manager(&self) -> Arc<ConnectionManager> {
        self.manager.clone()
    }

    /// The retry coordinator.
    pub fn coordinator(&self) -> Arc<RetryCoordinator> {
        self.coordinator.clone()
    }

    /// Producer surface for external collaborators.
    pub fn producer(&self) -> Producer {
        Producer::new(self.manager.clone(), self.clock.clone())
    }

    /// Read-only status surface.
    pub fn status_service(&self) -> StatusService {
        StatusService::new(
            self.manager.clone(),
            self.coordinator.clone(),
            self.lifecycle.clone(),
            self.outbound_live.clone(),
            self.webhook_live.clone(),
            self.retry_live.clone(),
        )
    }

    /// Current status snapshot.
    pub fn status(&self) -> StatusReport {
        self.status_service().status()
    }

    /// Starts the connection and spawns all worker groups.
    ///
    /// If the broker is unreachable the connection error is returned after
    /// the workers are spawned: they idle against the reconnect loop and
    /// draining resumes unattended once the broker recovers.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("engine start requested while already running");
            return Ok(());
        }

        info!(
            outbound_workers = self.config.outbound_workers,
            webhook_workers = self.config.webhook_workers,
            prefetch = self.config.prefetch,
            "starting delivery engine"
        );

        let connect_result = self.manager.start().await;

        let mut outbound = WorkerPool::with_gauge("outbound", self.outbound_live.clone());
        for id in 0..self.config.outbound_workers {
            let worker = OutboundWorker::new(
                id,
                self.manager.clone(),
                self.gateway.clone(),
                self.coordinator.clone(),
                self.outbound_guard.clone(),
                self.clock.clone(),
                self.config.prefetch,
                self.config.poll_interval,
                outbound.cancellation_token(),
            );
            outbound.spawn(format!("outbound-{id}"), worker.run());
        }

        let mut webhook = WorkerPool::with_gauge("webhook", self.webhook_live.clone());
        for id in 0..self.config.webhook_workers {
            let worker = IngestWorker::new(
                id,
                self.manager.clone(),
                self.applier.clone(),
                self.coordinator.clone(),
                self.webhook_guard.clone(),
                self.clock.clone(),
                self.config.prefetch,
                self.config.poll_interval,
                webhook.cancellation_token(),
            );
            webhook.spawn(format!("webhook-{id}"), worker.run());
        }

        let mut retry = WorkerPool::with_gauge("retry", self.retry_live.clone());
        let pump = self.coordinator.clone().run_pump(
            retry.cancellation_token(),
            self.config.poll_interval,
            self.config.prefetch,
        );
        retry.spawn("retry-pump".to_string(), pump);

        *running = Some(RunningWorkers { outbound, webhook, retry });
        self.lifecycle.started.store(true, Ordering::Release);

        info!("delivery engine started");
        connect_result.map_err(Into::into)
    }

    /// Signals every consumer loop to finish its in-flight message, joins
    /// the pools within the shutdown timeout, then closes the connection.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        self.lifecycle.started.store(false, Ordering::Release);

        let result = match running.take() {
            Some(workers) => {
                info!("stopping delivery engine");
                let mut result = Ok(());
                for pool in [workers.outbound, workers.webhook, workers.retry] {
                    if let Err(e) = pool.shutdown(self.config.shutdown_timeout).await {
                        result = Err(e);
                    }
                }
                result
            },
            None => Ok(()),
        };

        self.manager.stop().await;
        info!("delivery engine stopped");
        result
    }

    /// Runs `stop()` then `start()`.
    pub async fn restart(&self) -> Result<()> {
        info!("restarting delivery engine");
        self.stop().await?;
        self.start().await
    }
}
