mod common;

use common::strategies::max_attempts_strategy;
use pgcontrol_core::config::RetryPolicyConfig;
use pgcontrol_core::error::{ControlError, ErrorKind};
use pgcontrol_core::orchestration::{poll_until_ready, ProbeOutcome, RetryPolicy, StopCondition};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_exactly_max_attempts() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1))
        .stop_after_attempts(4);

    let err = poll_until_ready("waiting for 16/main", &policy, || async {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        ProbeOutcome::<()>::NotReadyYet(format!("no response ({n})"))
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(err.kind(), ErrorKind::Transient);
    match err {
        ControlError::Timeout {
            operation,
            attempts,
            last_reason,
            ..
        } => {
            assert_eq!(operation, "waiting for 16/main");
            assert_eq!(attempts, 4);
            assert_eq!(last_reason, "no response (4)");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_total_wait() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::fixed(Duration::from_secs(2)).stop_after_delay(Duration::from_secs(5));
    let started = Instant::now();

    let err = poll_until_ready("deadline", &policy, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        ProbeOutcome::<()>::NotReadyYet("starting up".to_string())
    })
    .await
    .unwrap_err();

    // Probes at 0s, 2s, 4s and 5s; the last sleep is cut to the deadline
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6), "{waited:?}");
    assert!(matches!(err, ControlError::Timeout { attempts: 4, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_ready_value_is_returned() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::fixed(Duration::from_millis(50)).stop_after_attempts(10);
    let port = poll_until_ready("port", &policy, || async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
            ProbeOutcome::NotReadyYet("not listening".to_string())
        } else {
            ProbeOutcome::Ready(5432u16)
        }
    })
    .await
    .unwrap();
    assert_eq!(port, 5432);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_outcome_is_not_retried() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::fixed(Duration::from_millis(50)).stop_after_attempts(10);
    let err = poll_until_ready("fatal", &policy, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        ProbeOutcome::<()>::Fatal(ControlError::Unsupported("no data directory".to_string()))
    })
    .await
    .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_policy_from_configuration() {
    let config = RetryPolicyConfig {
        min_interval_ms: 200,
        max_interval_ms: 1_000,
        multiplier: 3.0,
        max_attempts: None,
        deadline_ms: Some(30_000),
    };
    let policy = RetryPolicy::from(&config);
    assert_eq!(policy.stop, StopCondition::Deadline(Duration::from_secs(30)));
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for(2), Duration::from_millis(600));
    assert_eq!(policy.delay_for(3), Duration::from_millis(1_000));
}

proptest! {
    /// Property: an attempt limit of M means exactly M checks and then a timeout
    #[test]
    fn attempt_limit_is_exact(max_attempts in max_attempts_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(Duration::from_millis(10), Duration::from_secs(5))
            .stop_after_attempts(max_attempts);

        let err = runtime
            .block_on(poll_until_ready("bounded", &policy, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                ProbeOutcome::<()>::NotReadyYet("not yet".to_string())
            }))
            .unwrap_err();
        prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        let is_timeout_after_max =
            matches!(err, ControlError::Timeout { attempts, .. } if attempts == max_attempts);
        prop_assert!(is_timeout_after_max);
    }
}
