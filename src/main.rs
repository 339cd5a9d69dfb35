//! Courier delivery service.
//!
//! Main entry point: wires configuration, tracing, the broker backend, the
//! delivery engine, and the HTTP status surface, and coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{RealClock, WebhookEvent};
use courier_delivery::{
    broker::{memory::MemoryBroker, postgres::PgBroker, Broker},
    ApplyError, Engine, EventApplier, HttpSendGateway,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting courier delivery service");

    let config = Config::load()?;
    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("(in-memory broker)"),
        server_addr = %format!("{}:{}", config.host, config.port),
        outbound_workers = config.outbound_workers,
        webhook_workers = config.webhook_workers,
        "configuration loaded"
    );

    let clock = Arc::new(RealClock::new());
    let broker = create_broker(&config, clock.clone()).await?;
    let gateway = Arc::new(
        HttpSendGateway::new(config.to_gateway_config())
            .map_err(|e| anyhow::anyhow!("failed to build send gateway: {e}"))?,
    );
    let applier = Arc::new(LoggingApplier);

    let engine =
        Arc::new(Engine::new(broker, gateway, applier, clock, config.to_engine_config()));

    // A failed start leaves the reconnect loop running; the pipeline
    // drains on its own once the broker comes back.
    if let Err(e) = engine.start().await {
        warn!(error = %e, "engine started degraded, waiting for broker");
    }

    let addr = config.parse_server_addr()?;
    let state = AppState::new(engine.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = courier_api::start_server(state, addr).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!(addr = %addr, "courier is ready");

    // The server task returns once a shutdown signal is handled.
    let _ = server.await;

    info!("shutting down");
    if let Err(e) = engine.stop().await {
        warn!(error = %e, "engine shutdown incomplete");
    }
    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug,tower_http=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Builds the broker backend: PostgreSQL when configured, in-memory
/// otherwise.
async fn create_broker(config: &Config, clock: Arc<RealClock>) -> Result<Arc<dyn Broker>> {
    match &config.database_url {
        Some(url) => {
            let pool = create_database_pool(url, config.database_max_connections).await?;
            info!("using PostgreSQL-backed durable broker");
            Ok(Arc::new(PgBroker::new(pool)))
        },
        None => {
            warn!("no database URL configured, using non-durable in-memory broker");
            Ok(Arc::new(MemoryBroker::new(clock)))
        },
    }
}

/// Creates the database connection pool with bounded retries.
async fn create_database_pool(url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Downstream applier used when the surrounding product has not wired its
/// own: logs the event and acknowledges it. Ticket/message record updates
/// belong to the external collaborator.
struct LoggingApplier;

#[async_trait::async_trait]
impl EventApplier for LoggingApplier {
    async fn apply_event(&self, event: &WebhookEvent) -> Result<(), ApplyError> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            instance = %event.instance_name,
            "webhook event received (no downstream applier configured)"
        );
        Ok(())
    }
}
