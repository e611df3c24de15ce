use crate::{
    config::RetryConfig,
    errors::{ErrorClass, UpstreamError},
};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wall-clock budget for the whole operation, including backoff sleeps. `None` retries until
    /// the operation succeeds or reports a non-retryable outcome.
    pub timeout: Option<Duration>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Immediate retries after a rate-limit signal (the caller rotates endpoints) before the
    /// policy falls back to a backoff sleep.
    pub max_rotations: u32,
    /// Random jitter (`0..=jitter_max_ms`) added to each backoff sleep.
    pub jitter_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), Some(Duration::from_secs(15)))
    }
}

impl RetryPolicy {
    fn from_config(cfg: &RetryConfig, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_rotations: cfg.max_rotations,
            jitter_max_ms: cfg.jitter_max_ms,
        }
    }

    pub fn price(cfg: &RetryConfig) -> Self {
        Self::from_config(cfg, crate::config::ttl(cfg.price_timeout_seconds))
    }

    pub fn rpc(cfg: &RetryConfig) -> Self {
        Self::from_config(cfg, crate::config::ttl(cfg.rpc_timeout_seconds))
    }

    pub fn discovery(cfg: &RetryConfig) -> Self {
        Self::from_config(cfg, crate::config::ttl(cfg.discovery_timeout_seconds))
    }

    /// RPC policy for reads whose failure only empties one slot: batch items and token metadata.
    pub fn batch(cfg: &RetryConfig) -> Self {
        Self::rpc(cfg).with_timeout(crate::config::ttl(cfg.batch_timeout_seconds))
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let pow2 = 1_u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(pow2).min(max_ms);
    let jitter = if policy.jitter_max_ms == 0 {
        0
    } else {
        // Avoid holding a non-Send RNG across await points.
        let range = policy.jitter_max_ms.saturating_add(1);
        rand::random::<u64>() % range
    };
    Duration::from_millis(ms.saturating_add(jitter))
}

fn give_up(last: Option<&UpstreamError>, why: &str) -> UpstreamError {
    let after = last.map_or(ErrorClass::Transient, UpstreamError::root_class);
    let detail = last.map_or_else(|| why.to_owned(), |e| format!("{why}; last error: {e}"));
    UpstreamError::unavailable(after, detail)
}

/// Run `op` until it succeeds, classifying every failure.
///
/// - `RateLimited`: retried immediately up to `max_rotations` times, then after a backoff sleep.
///   Rate limits never advance the backoff attempt counter.
/// - `Transient`: retried after `min(max_delay, base_delay * 2^attempt)`.
/// - `NotFound` / `Unavailable`: returned as is, there is nothing to retry.
///
/// Each attempt runs under the remaining budget, so a hung call cannot outlive the timeout.
/// Exhausting the budget yields `Unavailable` carrying the class of the last failure.
pub async fn retry_classified<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let deadline = policy.timeout.map(|t| Instant::now() + t);
    let mut attempt = 0_u32;
    let mut rotations = 0_u32;
    let mut last: Option<UpstreamError> = None;

    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if remaining == Some(Duration::ZERO) {
            return Err(give_up(last.as_ref(), "retry budget exhausted"));
        }

        let res = match remaining {
            Some(r) => match tokio::time::timeout(r, op()).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    return Err(give_up(last.as_ref(), "timed out waiting for upstream"));
                }
            },
            None => op().await,
        };

        let err = match res {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        let delay = match err.class() {
            ErrorClass::NotFound | ErrorClass::Unavailable => return Err(err),
            ErrorClass::RateLimited if rotations < policy.max_rotations => {
                rotations = rotations.saturating_add(1);
                debug!(op = label, rotations, error = %err, "rate limited; retrying on next endpoint");
                last = Some(err);
                continue;
            }
            ErrorClass::RateLimited => {
                rotations = 0;
                compute_backoff_delay(policy, attempt)
            }
            ErrorClass::Transient => {
                let d = compute_backoff_delay(policy, attempt);
                attempt = attempt.saturating_add(1);
                d
            }
        };
        debug!(op = label, attempt, delay_ms = delay.as_millis(), error = %err, "retrying after backoff");
        last = Some(err);

        let sleep_for = deadline.map_or(delay, |d| {
            delay.min(d.saturating_duration_since(Instant::now()))
        });
        tokio::time::sleep(sleep_for).await;
    }
}

/// [`retry_classified`] for callers that treat "no value" as a normal outcome.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    match retry_classified(policy, label, op).await {
        Ok(v) => Some(v),
        Err(e) if e.class() == ErrorClass::NotFound => {
            debug!(op = label, error = %e, "no data");
            None
        }
        Err(e) => {
            warn!(op = label, error = %e, "giving up");
            None
        }
    }
}
