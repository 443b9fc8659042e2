//! Retry logic for transient key store failures.
//!
//! [`with_retry`] wraps an async store operation with automatic retry on
//! transient errors (connection failures, timeouts). Definitive answers
//! (not found, conflict, serialization) are returned immediately.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added to prevent thundering-herd effects
//!   when many requests hit a recovering store together

use std::{future::Future, time::Duration};

use rand::Rng;
use tokengate_storage::{StorageError, StorageResult};

use crate::config::RetryPolicyConfig;

/// Executes `operation` with automatic retry on transient errors.
///
/// Each attempt is bounded by `attempt_timeout`; an attempt that runs over is
/// reported as [`StorageError::Timeout`], which is itself transient and
/// therefore retried while attempts remain.
///
/// Returns the result of the first successful call, or the last error if all
/// attempts are exhausted.
#[tracing::instrument(skip(policy, operation), fields(max_retries = policy.max_retries))]
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryPolicyConfig,
    attempt_timeout: Duration,
    operation_name: &str,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StorageError::timeout()),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = compute_backoff(policy, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if attempt > 0 && err.is_transient() {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Computes the backoff delay for a given attempt number.
fn compute_backoff(policy: &RetryPolicyConfig, attempt: u32) -> Duration {
    let base = policy.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(policy.max_backoff);

    // 0–50% jitter
    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}
