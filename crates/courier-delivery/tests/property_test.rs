//! Property-based tests for the retry schedule and the delivery state
//! machine.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use courier_core::JobStatus;
use courier_delivery::{decide, BackoffStrategy, DeliveryOutcome, RetryPolicy};
use proptest::prelude::*;

fn strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Quadratic),
        Just(BackoffStrategy::Exponential),
    ]
}

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..=30, 1u64..=600, 1u64..=48, strategy()).prop_map(
        |(max_attempts, base_secs, cap_hours, backoff_strategy)| RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(base_secs.max(cap_hours * 3600)),
            backoff_strategy,
        },
    )
}

fn outcome_strategy() -> impl Strategy<Value = DeliveryOutcome> {
    prop_oneof![
        (200u16..300).prop_map(|status_code| DeliveryOutcome::Delivered {
            status_code,
            body: String::new(),
            latency: Duration::from_millis(1),
        }),
        (300u16..600).prop_map(|status_code| DeliveryOutcome::Rejected {
            status_code,
            body: String::new(),
            latency: Duration::from_millis(1),
        }),
        Just(DeliveryOutcome::Unreachable {
            error: "connection refused".to_string(),
            latency: Duration::from_millis(1),
        }),
    ]
}

proptest! {
    #[test]
    fn delays_never_decrease(policy in policy_strategy(), failures in 1u32..200) {
        prop_assert!(policy.delay_for(failures) <= policy.delay_for(failures + 1));
    }

    #[test]
    fn delays_respect_the_cap(policy in policy_strategy(), failures in 0u32..10_000) {
        let delay = policy.delay_for(failures);
        prop_assert!(delay <= policy.max_delay);
        prop_assert!(delay >= policy.base_delay.min(policy.max_delay));
    }

    #[test]
    fn schedule_is_deterministic(policy in policy_strategy(), failures in 1u32..100) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prop_assert_eq!(
            policy.next_attempt_at(now, failures),
            policy.next_attempt_at(now, failures)
        );
        prop_assert!(policy.next_attempt_at(now, failures) > now);
    }

    #[test]
    fn attempt_count_never_decreases(
        policy in policy_strategy(),
        attempt_count in 0i32..30,
        outcome in outcome_strategy(),
    ) {
        let t = decide(attempt_count, &outcome, Utc::now(), &policy);
        prop_assert!(t.attempt_count >= attempt_count);
        prop_assert_ne!(t.status, JobStatus::Processing);
        prop_assert_eq!(t.callback.is_some(), t.is_terminal());
    }

    #[test]
    fn failures_become_terminal_exactly_at_the_limit(
        policy in policy_strategy(),
        outcome in outcome_strategy(),
    ) {
        prop_assume!(!outcome.is_success());
        let limit = i32::try_from(policy.max_attempts).unwrap_or(i32::MAX);
        let now = Utc::now();

        let last = decide(limit - 1, &outcome, now, &policy);
        prop_assert_eq!(last.status, JobStatus::Error);
        prop_assert_eq!(last.attempt_count, limit);
        prop_assert_eq!(last.next_attempt_time, None);

        if limit >= 2 {
            let retry = decide(limit - 2, &outcome, now, &policy);
            prop_assert_eq!(retry.status, JobStatus::Available);
            prop_assert!(retry.next_attempt_time.is_some_and(|at| at > now));
        }
    }

    #[test]
    fn success_keeps_attempt_count(attempt_count in 0i32..30, policy in policy_strategy()) {
        let outcome = DeliveryOutcome::Delivered {
            status_code: 200,
            body: "ok".to_string(),
            latency: Duration::from_millis(1),
        };
        let t = decide(attempt_count, &outcome, Utc::now(), &policy);
        prop_assert_eq!(t.status, JobStatus::Success);
        prop_assert_eq!(t.attempt_count, attempt_count);
    }
}
