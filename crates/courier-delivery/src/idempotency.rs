//! Idempotency guard for duplicate suppression.
//!
//! Broker redelivery after a crash-before-ack can hand a worker a job that
//! already reached its terminal state. This bounded LRU of completed ids
//! lets the worker skip the side effect in that window. Best-effort and
//! process-local only: the downstream idempotency key remains the real
//! guarantee.

use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
};

#[derive(Debug, Default)]
struct GuardInner {
    completed: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded LRU of recently-completed job/event ids.
#[derive(Debug)]
pub struct IdempotencyGuard {
    inner: Mutex<GuardInner>,
    capacity: usize,
}

impl IdempotencyGuard {
    /// Creates a guard remembering at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(GuardInner::default()), capacity: capacity.max(1) }
    }

    /// Whether the id already reached a terminal state.
    pub fn is_completed(&self, id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.completed.contains(id)
    }

    /// Records a terminal id, evicting the oldest entries past capacity.
    pub fn record(&self, id: impl Into<String>) {
        let id = id.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if !inner.completed.insert(id.clone()) {
            return;
        }
        inner.order.push_back(id);

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.completed.remove(&evicted);
            }
        }
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    /// Whether the guard is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_detects_completed_ids() {
        let guard = IdempotencyGuard::new(8);

        assert!(!guard.is_completed("job-1"));
        guard.record("job-1");
        assert!(guard.is_completed("job-1"));
        assert!(!guard.is_completed("job-2"));
    }

    #[test]
    fn duplicate_records_do_not_grow_the_guard() {
        let guard = IdempotencyGuard::new(8);

        guard.record("job-1");
        guard.record("job-1");
        guard.record("job-1");

        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let guard = IdempotencyGuard::new(3);

        for i in 0..5 {
            guard.record(format!("job-{i}"));
        }

        assert_eq!(guard.len(), 3);
        assert!(!guard.is_completed("job-0"));
        assert!(!guard.is_completed("job-1"));
        assert!(guard.is_completed("job-2"));
        assert!(guard.is_completed("job-4"));
    }
}
