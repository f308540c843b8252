//! Caller-side retry policy
//!
//! The engine never retries. Callers that want to ride out lock contention
//! or brief outages wrap a whole transfer in [`RetryPolicy::run`], which
//! re-runs it only for errors where [`TransferError::is_retryable`] holds.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1` (exponential, capped)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying transfer"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 35,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(60), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::default()
            .run(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TransferError::Store(StoreError::Deadlock))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::default()
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Store(StoreError::LockTimeout))
            })
            .await;

        assert_eq!(result, Err(TransferError::Store(StoreError::LockTimeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::default()
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::InsufficientFunds)
            })
            .await;

        assert_eq!(result, Err(TransferError::InsufficientFunds));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
