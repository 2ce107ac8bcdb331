//! Retry combinator with exponential backoff.
//!
//! Attempt `k` (k >= 2) starts no earlier than `delay * backoff^(k-2)` after
//! attempt `k-1` failed. There is no jitter and no upper bound on a single
//! pause other than what the policy implies.
//!
//! ```ignore
//! let policy = RetryPolicy::new(3, Duration::from_millis(10), 1.0);
//! retry(&policy, &cancel, || transport.send("a@b.com", "hi")).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Pause after the first failure.
    pub delay: Duration,
    /// Multiplier applied to the pause after every further failure.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, backoff: f64) -> Self {
        Self {
            attempts,
            delay,
            backoff,
        }
    }

    /// Delivery policy from the `SEND_RETRY_*` settings.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.send_retry_attempts,
            config.send_retry_delay(),
            config.send_retry_backoff,
        )
    }

    /// Pause before the 1-based `attempt`. The first attempt starts immediately.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.delay.as_secs_f64() * self.backoff.powi(exponent);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Worst-case time spent waiting between attempts.
    pub fn total_delay(&self) -> Duration {
        (2..=self.attempts.max(1))
            .map(|attempt| self.delay_before(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Why [`retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts } => {
                *attempts
            }
        }
    }
}

/// Run `operation` until it succeeds, the policy runs out, or `cancel` fires.
///
/// Cancellation is observed before each attempt and during the pause between
/// attempts. An attempt already running is allowed to finish, so a success
/// that races with shutdown is still reported as a success.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
            });
        }

        let result = operation().await;

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => e,
        };

        let pause = policy.delay_before(attempt + 1);
        tracing::debug!(
            attempt,
            max_attempts,
            retry_in_ms = pause.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(pause) => {}
        }
        attempt += 1;
    }
}
