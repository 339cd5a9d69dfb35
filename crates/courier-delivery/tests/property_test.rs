//! Property tests over retry timing and the idempotency guard.

use std::time::Duration;

use courier_delivery::{idempotency::IdempotencyGuard, retry::RetryPolicy};
use proptest::prelude::*;

fn arbitrary_policy() -> impl Strategy<Value = RetryPolicy> {
    (
        1u32..=20,
        1u64..=10_000,
        prop_oneof![Just(1.0f64), 1.0f64..=4.0],
        1u64..=600_000,
        0.0f64..=1.0,
    )
        .prop_map(|(max_attempts, base_ms, multiplier, max_ms, jitter)| RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            backoff_multiplier: multiplier,
            max_delay: Duration::from_millis(max_ms),
            jitter_fraction: jitter,
        })
}

proptest! {
    /// The jittered delay never exceeds the configured cap, for any policy
    /// and any attempt number.
    #[test]
    fn jittered_delay_never_exceeds_cap(policy in arbitrary_policy(), attempt in 1u32..=100) {
        let delay = policy.jittered_delay(attempt);
        prop_assert!(delay <= policy.max_delay);
    }

    /// Without jitter, delays are non-decreasing in the attempt number
    /// (geometric growth until the cap, then flat).
    #[test]
    fn raw_delays_are_monotonic(policy in arbitrary_policy(), attempt in 1u32..=99) {
        let current = policy.delay_for_attempt(attempt);
        let next = policy.delay_for_attempt(attempt + 1);
        prop_assert!(next >= current);
    }

    /// The first retry always waits the base delay (capped). Computed in
    /// float seconds, so allow sub-microsecond rounding.
    #[test]
    fn first_retry_uses_base_delay(policy in arbitrary_policy()) {
        let expected = policy.base_delay.min(policy.max_delay);
        let actual = policy.delay_for_attempt(1);
        let difference = if actual > expected { actual - expected } else { expected - actual };
        prop_assert!(difference <= Duration::from_micros(1));
    }

    /// The guard never remembers more ids than its capacity, and the most
    /// recently recorded id is always present.
    #[test]
    fn guard_respects_capacity(capacity in 1usize..=64, ids in prop::collection::vec("[a-z0-9]{1,12}", 1..200)) {
        let guard = IdempotencyGuard::new(capacity);
        for id in &ids {
            guard.record(id.clone());
            prop_assert!(guard.is_completed(id));
            prop_assert!(guard.len() <= capacity);
        }
    }
}
