//! Bounded exponential backoff for row store calls.
//!
//! Everything that talks to the shared store goes through one policy so
//! that transient failures are retried a bounded number of times, and a
//! spent quota is answered by waiting instead of hammering the store.

use crate::config::RetryConfig;
use crate::error::PairingError;
use std::future::Future;
use std::time::Duration;

/// Retry parameters shared by create and verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Wait after a quota error when the store gave no `Retry-After`.
    pub quota_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            quota_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            quota_delay: Duration::from_millis(config.quota_delay_ms),
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, err: &PairingError) -> Duration {
        if err.is_quota() {
            return err.retry_after().unwrap_or(self.quota_delay);
        }
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, PairingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PairingError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &err);
                    tracing::warn!(
                        op = label,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Row store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> PairingError {
        PairingError::from(StoreError::Unavailable("reset".into()))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let err = unavailable();
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3, &err), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX, &err), Duration::from_secs(5));
    }

    #[test]
    fn quota_waits_for_retry_after_or_default() {
        let policy = RetryPolicy::default();
        let hinted = PairingError::from(StoreError::QuotaExceeded {
            retry_after: Some(Duration::from_secs(42)),
        });
        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(42));

        let bare = PairingError::from(StoreError::QuotaExceeded { retry_after: None });
        assert_eq!(policy.delay_for(1, &bare), Duration::from_secs(15));
    }

    #[test]
    fn from_config_clamps_attempts() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = RetryPolicy::default()
            .run("scan", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 250ms + 500ms of backoff on the paused clock
        assert_eq!(started.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("append", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PairingError::Timeout)
            })
            .await;
        assert_eq!(result, Err(PairingError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("overwrite", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PairingError::AlreadyVerified)
            })
            .await;
        assert_eq!(result, Err(PairingError::AlreadyVerified));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_number_is_passed_through() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let _: Result<(), _> = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        }
        .run("scan", |attempt| {
            seen.lock().push(attempt);
            async { Err(PairingError::Timeout) }
        })
        .await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }
}
