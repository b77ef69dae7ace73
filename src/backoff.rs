//! Retry policies with decorrelated jitter
//!
//! A single backoff abstraction shared by sink delivery and session
//! ingestion. Each sleep is drawn uniformly from
//! `[base, min(cap, prev * 3)]`, so consecutive delays wander upward
//! toward the cap instead of marching in lockstep.

use metrics::increment_counter;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounds and attempt budget for one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Lower bound of every delay draw
    pub base: Duration,
    /// Upper bound of every delay draw
    pub cap: Duration,
    /// Total attempts, including the first one
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Policy applied to every sink delivery: 1 s base, 10 s cap, 5 attempts.
    pub fn sink() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }

    /// Policy applied to whole-session ingestion restarts: 3 s base,
    /// 2 min cap, 5 attempts.
    pub fn session() -> Self {
        Self {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(120),
            max_attempts: 5,
        }
    }
}

/// Decorrelated jitter state for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    prev: Duration,
}

impl Backoff {
    /// Create a fresh backoff; the first draw is bounded by `base * 3`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            prev: policy.base,
        }
    }

    /// Draw the next sleep duration.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.policy.base.as_millis() as u64;
        let high = self
            .policy
            .cap
            .min(self.prev.saturating_mul(3))
            .as_millis() as u64;
        let high_ms = high.max(base_ms);
        let drawn = rand::rng().random_range(base_ms..=high_ms);
        self.prev = Duration::from_millis(drawn);
        self.prev
    }
}

/// Outcome of a retried operation that was not a hard failure.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The operation eventually succeeded.
    Done(T),
    /// The cancellation token fired; treated as graceful shutdown, not
    /// failure.
    Cancelled,
}

/// Run `op` under `policy`, sleeping with decorrelated jitter between
/// attempts.
///
/// Cancellation short-circuits both in-flight attempts and backoff sleeps
/// and yields `RetryOutcome::Cancelled`. When all attempts fail, the last
/// error is propagated.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(policy);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(RetryOutcome::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(RetryOutcome::Done(value)),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                increment_counter!("delivery_retry_total");
                let delay = backoff.next_delay();
                debug!(
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(RetryOutcome::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
