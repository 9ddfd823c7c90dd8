//! Bounded exponential-backoff retry with a per-call timeout.

use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::warn;

use crate::errors::{PipelineError, Result};

/// Retry discipline for one capability call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Each attempt is abandoned after this long and counted as transient.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Backoff applied inside a capability adapter, below the stage-level retry.
///
/// It only absorbs short provider hiccups; its elapsed-time budget should stay
/// within [`RetryPolicy::call_timeout`] so the stage sees a timely answer.
#[derive(Debug, Clone)]
pub struct ClientBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for ClientBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl ClientBackoff {
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Transient failures (see [`PipelineError::is_transient`]) and timeouts are
/// retried with exponential backoff. Once `max_attempts` is reached the last
/// error is returned unchanged, so callers can still tell a transient
/// exhaustion (requeue) from a permanent failure.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_max_elapsed_time(None)
        .build();

    let max_attempts = policy.max_attempts.max(1);
    let call_timeout = policy.call_timeout;
    let mut attempt = 0u32;

    backoff::future::retry(backoff, || {
        attempt += 1;
        let current = attempt;
        let call = op();
        async move {
            let outcome = match tokio::time::timeout(call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(call_timeout)),
            };
            match outcome {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() && current < max_attempts => {
                    warn!(
                        operation,
                        attempt = current,
                        max_attempts,
                        error = %e,
                        "transient failure, backing off"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}
