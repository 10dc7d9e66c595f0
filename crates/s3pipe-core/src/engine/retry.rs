//! Bounded retries with truncated exponential backoff
//!
//! Every attempt runs under its own timeout. Only errors that report
//! themselves as retryable are tried again.

use crate::error::{StoreError, TransferError};
use s3pipe_types::RetryPolicy;
use std::future::Future;
use tokio::time::Instant;
use tracing::warn;

/// Last error of an operation that ran out of attempts
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub error: StoreError,
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// `on_retry` is called with the failed attempt number and its error
/// before sleeping.
pub async fn retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    mut on_retry: R,
    mut op: F,
) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
    R: FnMut(u32, &StoreError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    label, attempt, max_attempts, error, delay
                );
                on_retry(attempt, &error);
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(Exhausted {
                    attempts: attempt,
                    error,
                })
            }
        }
    }
}

/// Resolves once the deadline passes; never resolves without one
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Whether the deadline has already passed
pub fn is_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

/// Run a single control call against an optional whole-transfer deadline.
///
/// Only for calls with no parts in flight; part traffic is drained instead.
pub async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .unwrap_or(Err(TransferError::DeadlineExceeded)),
        None => fut.await,
    }
}
