use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CommandError, CommandResult};

/// Exponential backoff with full jitter, capped at `max_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 50,
            max_ms: 5_000,
        }
    }
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Upper bound of the delay before retry number `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self.base_ms.saturating_mul(1u64 << shift).min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Randomized delay in `[ceiling / 2, ceiling]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let half = ceiling / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=ceiling - half))
    }
}

/// Caller-side retry budget for optimistic conflicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Run `op` until it succeeds or fails with something other than a
/// [`CommandError::VersionConflict`], at most `policy.max_attempts` times.
///
/// `op` receives the 1-based attempt number and must re-read the latest
/// version and rebuild its command on every call.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> CommandResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CommandResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Err(err @ CommandError::VersionConflict { .. }) if attempt < max_attempts => {
                let delay = policy.backoff.delay(attempt);
                warn!(attempt, ?delay, error = %err, "version conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
