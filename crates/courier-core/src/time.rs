//! Clock abstraction for testable scheduling.
//!
//! Every scheduling decision in the pipeline is a wall timestamp
//! (`next_retry_at`, delayed visibility, lease expiry), so the clock deals
//! in `DateTime<Utc>`. Production code uses `RealClock`; tests inject
//! `TestClock` and advance virtual time instead of sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Time source for the pipeline.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    ///
    /// `RealClock` maps this to `tokio::time::sleep`; `TestClock` advances
    /// virtual time and yields immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// Starts at the construction instant and moves only when advanced, either
/// explicitly or by a task calling `sleep`. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    epoch: DateTime<Utc>,
    offset_ms: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a virtual clock anchored at the current system time.
    pub fn new() -> Self {
        Self { epoch: Utc::now(), offset_ms: Arc::new(AtomicI64::new(0)) }
    }

    /// Creates a virtual clock anchored at a specific instant.
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self { epoch, offset_ms: Arc::new(AtomicI64::new(0)) }
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Returns how far the clock has advanced since construction.
    pub fn elapsed(&self) -> Duration {
        let ms = self.offset_ms.load(Ordering::Acquire).max(0);
        Duration::from_millis(ms as u64)
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.offset_ms.load(Ordering::Acquire);
        self.epoch + chrono::Duration::milliseconds(ms)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        // Yield so other tasks observe the advanced time before we resume.
        Box::pin(tokio::task::yield_now())
    }
}
