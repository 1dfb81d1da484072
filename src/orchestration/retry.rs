//! # Readiness Polling
//!
//! Bounded polling with exponential backoff, used wherever the core waits for
//! another process: PostgreSQL accepting connections, an HA coordinator
//! reporting ready, a REST API going away, a log file appearing.

use crate::config::RetryPolicyConfig;
use crate::error::{ControlError, ControlResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// When polling gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// After this many probe calls
    Attempts(u32),
    /// Once this much time has elapsed since the first probe
    Deadline(Duration),
    /// Never; only for probes that are bounded elsewhere
    Never,
}

/// Backoff schedule and stop condition
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub stop: StopCondition,
}

impl RetryPolicy {
    /// Doubling intervals between `min` and `max`, no stop condition yet
    pub fn exponential(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            multiplier: 2.0,
            stop: StopCondition::Never,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self {
            min_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            stop: StopCondition::Never,
        }
    }

    pub fn stop_after_attempts(mut self, attempts: u32) -> Self {
        self.stop = StopCondition::Attempts(attempts.max(1));
        self
    }

    pub fn stop_after_delay(mut self, deadline: Duration) -> Self {
        self.stop = StopCondition::Deadline(deadline);
        self
    }

    /// Delay after the `attempt`-th failed probe (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.min_interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        let stop = match (config.max_attempts, config.deadline_ms) {
            (Some(attempts), _) => StopCondition::Attempts(attempts.max(1)),
            (None, Some(deadline)) => StopCondition::Deadline(Duration::from_millis(deadline)),
            (None, None) => StopCondition::Never,
        };
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
            stop,
        }
    }
}

/// Result of one readiness probe
#[derive(Debug)]
pub enum ProbeOutcome<T> {
    Ready(T),
    /// Try again later; the reason ends up in the timeout error
    NotReadyYet(String),
    /// Stop polling and fail with this error
    Fatal(ControlError),
}

/// Call `probe` until it reports ready, fails fatally, or the policy gives up.
///
/// With [`StopCondition::Attempts`]`(n)` the probe is called exactly `n` times
/// before a [`ControlError::Timeout`] is returned.
pub async fn poll_until_ready<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut probe: F,
) -> ControlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let reason = match probe().await {
            ProbeOutcome::Ready(value) => {
                debug!(operation, attempts, elapsed = ?started.elapsed(), "ready");
                return Ok(value);
            }
            ProbeOutcome::Fatal(e) => return Err(e),
            ProbeOutcome::NotReadyYet(reason) => reason,
        };

        let elapsed = started.elapsed();
        let mut delay = policy.delay_for(attempts);
        let exhausted = match policy.stop {
            StopCondition::Attempts(max) => attempts >= max,
            StopCondition::Deadline(deadline) => {
                if elapsed >= deadline {
                    true
                } else {
                    delay = delay.min(deadline - elapsed);
                    false
                }
            }
            StopCondition::Never => false,
        };
        if exhausted {
            return Err(ControlError::Timeout {
                operation: operation.to_string(),
                attempts,
                elapsed,
                last_reason: reason,
            });
        }

        debug!(operation, attempts, ?delay, reason = %reason, "not ready yet, retrying");
        tokio::time::sleep(delay).await;
    }
}
