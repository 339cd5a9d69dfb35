//! Broker-backed delivery pipeline with reliability guarantees.
//!
//! This crate implements the engineering core of the courier system:
//! reliable delivery of outbound chat messages to an external gateway and
//! reliable ingestion of inbound webhook events, with a durable message
//! broker as the backbone.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  publish   ┌──────────────────┐  consume  ┌──────────────┐
//! │ Producer │───────────▶│ Broker (queues)  │──────────▶│ Worker pools │
//! └──────────┘            └──────────────────┘           └──────┬───────┘
//!                               ▲        ▲                      │
//!                    delayed    │        │ dead letters         │ failures
//!                    envelopes  │        │                      ▼
//!                         ┌─────┴────────┴─────┐        ┌───────────────┐
//!                         │ Retry Coordinator  │◀───────│ classification │
//!                         └────────────────────┘        └───────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **At-least-once**: a message is acknowledged off its queue only after
//!   its terminal disposition (or a replacement retry/dead-letter message)
//!   is durably published.
//! - **Effectively-once**: a bounded idempotency guard suppresses
//!   redelivery duplicates after a crash-before-ack; downstream
//!   idempotency keys carry the rest.
//! - **Unattended recovery**: broker outages are absorbed by the
//!   connection manager's reconnect loop; consumers re-register and
//!   draining resumes without intervention.

pub mod apply;
pub mod broker;
pub mod connection;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod ingest;
pub mod outbound;
pub mod pool;
pub mod producer;
pub mod retry;
pub mod status;

pub use apply::{ApplyError, EventApplier};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionStatus};
pub use engine::{Engine, EngineConfig};
pub use error::{DeliveryError, Result};
pub use gateway::{GatewayConfig, HttpSendGateway, SendAck, SendGateway};
pub use producer::{EnqueueError, Producer};
pub use retry::{RetryCoordinator, RetryPolicy, RetryStats};
pub use status::{ProcessorsRunning, StatusReport, StatusService};

/// Default number of concurrent outbound delivery workers.
pub const DEFAULT_OUTBOUND_WORKERS: usize = 3;

/// Default number of concurrent webhook ingestion workers.
pub const DEFAULT_WEBHOOK_WORKERS: usize = 2;

/// Default prefetch per consumer.
pub const DEFAULT_PREFETCH: usize = 10;

/// Default gateway send timeout in seconds.
pub const DEFAULT_SEND_TIMEOUT_SECONDS: u64 = 15;
