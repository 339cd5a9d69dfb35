//! Core domain models for the courier delivery pipeline.
//!
//! Provides strongly-typed identifiers, job and event models, broker-level
//! error types, and the clock abstraction used for deterministic scheduling.
//! All other crates depend on these foundational types for type safety and
//! consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{BrokerError, Result};
pub use models::{
    DeadLetterEntry, EventId, EventType, JobError, JobId, JobStatus, MessagePayload,
    OutboundMessageJob, QueueSnapshot, QueuedAck, WebhookEvent,
};
pub use time::{Clock, RealClock, TestClock};
