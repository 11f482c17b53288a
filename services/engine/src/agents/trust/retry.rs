//! Bounded retry combinator shared by every polling loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::error::TrustError;

/// Fixed-interval, fixed-attempt polling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// `budget / interval` attempts, never fewer than one.
    pub fn from_budget(budget: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            (budget.as_millis() / interval.as_millis()).clamp(1, u32::MAX as u128) as u32
        };
        Self {
            interval,
            max_attempts: attempts,
        }
    }
}

/// Every attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: String,
}

impl From<RetryExhausted> for TrustError {
    fn from(e: RetryExhausted) -> Self {
        TrustError::Timeout {
            attempts: e.attempts,
            last_error: e.last_error,
        }
    }
}

/// Run `operation` until it returns `Ok`, sleeping `interval` between attempts.
///
/// The operation receives the 1-based attempt number. Its `Err` is the
/// not-yet-successful signal; the last one is kept for the report.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %last_error,
                    "Attempt did not succeed"
                );
            }
        }

        if attempt < policy.max_attempts {
            sleep(policy.interval).await;
        }
    }

    Err(RetryExhausted {
        attempts: policy.max_attempts,
        last_error,
    })
}

/// `retry` driven by a success predicate over a probe's output.
pub async fn poll_until<T, F, Fut, P>(
    policy: RetryPolicy,
    mut probe: F,
    is_ready: P,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let is_ready = &is_ready;
    retry(policy, move |_| {
        let next = probe();
        async move {
            let value = next.await;
            if is_ready(&value) {
                Ok(value)
            } else {
                Err("predicate not satisfied")
            }
        }
    })
    .await
}
