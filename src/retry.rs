//! Uniform retry policy for external calls.
//!
//! One policy is applied at the processor-invocation boundary for every
//! external call the engine makes: transient failures retry with exponential
//! backoff up to the attempt cap, malformed results retry exactly once and
//! then fail fast. There are no per-call-site retry loops anywhere else.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CallError;

/// Retry behavior for classified external-call failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum total attempts for transient failures (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on a single backoff delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): base * 2^(attempt - 1),
    /// capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` under this policy.
    ///
    /// Transient errors are retried with backoff until `max_attempts` is
    /// exhausted. A malformed result is retried once, immediately, then
    /// returned as-is so a systemic prompt/schema mismatch surfaces quickly.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut transient_attempts = 0u32;
        let mut malformed_retried = false;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    transient_attempts += 1;
                    if transient_attempts >= self.max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.delay_for_attempt(transient_attempts)).await;
                }
                Err(err) if err.is_malformed() && !malformed_retried => {
                    malformed_retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Bound `fut` by a wall-clock timeout, classifying expiry as transient.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T, CallError>
where
    Fut: Future<Output = Result<T, CallError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CallError::Timeout(limit)),
    }
}
