//! Retry and backoff utilities.
//!
//! One capped exponential backoff policy drives both Helix request retries
//! and EventSub session reconnects. Delays double per attempt up to
//! `max_backoff` and carry a small jitter so that many clients dropped by the
//! same server restart do not reconnect in lockstep.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt budget.
    ///
    /// For [`retry_async`] this includes the first attempt. The session
    /// worker counts only reconnect attempts made after a connection is lost
    /// or the initial connect fails.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy used to re-establish a failed EventSub session.
    ///
    /// Six reconnect attempts after the failure, spaced 0.5s, 1s, 2s, 4s,
    /// 8s, 16s (plus jitter), before the session is declared lost.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }

    /// Policy used for Helix REST calls.
    pub fn helix() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(50),
        }
    }

    /// Returns whether a 1-based `attempt` is still within the policy budget.
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        attempt <= self.max_attempts.max(1)
    }

    /// Computes the delay to apply after the given failed attempt.
    ///
    /// `attempt` is 1-based and should correspond to the attempt that failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.backoff_for_attempt(attempt) + jitter_duration(self.jitter, attempt)
    }

    fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !policy.allows_attempt(attempt + 1) || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
