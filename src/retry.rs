// ABOUTME: Bounded exponential-backoff retry helper for downstream calls
// ABOUTME: Used for notifier delivery and queue pushes where transient failures are expected
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::constants::retry_defaults;
use crate::errors::{AppError, AppResult, ErrorCode};

/// Retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: retry_defaults::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(retry_defaults::BASE_DELAY_MS),
            backoff_factor: retry_defaults::BACKOFF_FACTOR,
        }
    }
}

/// Run `operation` up to `policy.max_attempts` times with exponential backoff.
///
/// Exhausted retries surface as `UNAVAILABLE` carrying the last error.
///
/// # Errors
///
/// Returns the mapped `UNAVAILABLE` error once every attempt has failed.
pub async fn with_retry<T, F, Fut, E>(
    label: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.base_delay;
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                if attempt < policy.max_attempts {
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    let wait = delay + Duration::from_millis(jitter);
                    warn!(
                        "{label} failed (attempt {attempt}/{}), retrying in {wait:?}: {last_error}",
                        policy.max_attempts
                    );
                    tokio::time::sleep(wait).await;
                    delay *= policy.backoff_factor;
                }
            }
        }
    }

    Err(AppError::new(
        ErrorCode::Unavailable,
        format!("{label} failed after {} attempts: {last_error}", policy.max_attempts),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_unavailable() {
        let result: AppResult<()> =
            with_retry("op", fast_policy(), || async { Err("down") }).await;
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert!(err.message.contains("after 3 attempts"));
    }
}
