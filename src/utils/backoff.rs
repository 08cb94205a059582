// kvrestore/src/utils/backoff.rs
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MAX_SHIFT: u32 = 16;

/// Bounded exponential backoff: `initial`, doubling per failure, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    initial: Duration,
    max_delay: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial,
            max_delay,
            failures: 0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records a failure. Returns the wait before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_attempts {
            return None;
        }
        let shift = (self.failures - 1).min(MAX_SHIFT);
        let delay = self.initial.saturating_mul(1u32 << shift);
        Some(delay.min(self.max_delay))
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempt(s): {last:#}")]
    Exhausted { attempts: u32, last: anyhow::Error },

    #[error("retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

/// Runs `op` until it succeeds, the backoff gives up, or `cancel` fires.
///
/// `op` receives the zero-based attempt number so callers can rotate targets.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    backoff: &mut ExponentialBackoff,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        let result = op(attempt).await;
        attempt += 1;
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(delay) = backoff.next_delay() else {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        };
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %format!("{err:#}"), "retrying after failure");
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
