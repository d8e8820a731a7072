//! Client-side enforcement of the shared row store quota.
//!
//! The remote store allows a fixed number of operations per minute for
//! everyone using the same credentials. Wrapping an adapter in
//! [`ThrottledStore`] lets this process refuse calls locally once the
//! window is spent, instead of burning a request just to get a 429.
//!
//! ## Design
//! - Sliding one-minute window of call timestamps read from [`Clock`]
//! - Over budget: `QuotaExceeded` with the wait until the oldest call ages out
//! - A limit of 0 disables throttling

use super::{Row, RowRef, RowStore, StoreError, StoredRow};
use crate::clock::Clock;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Quota window: 60 seconds.
pub const QUOTA_WINDOW_MS: i64 = 60_000;

/// Default external budget: 100 operations per minute.
pub const DEFAULT_QUOTA_PER_MINUTE: u32 = 100;

/// Row store decorator that spends one unit of the local budget per call.
pub struct ThrottledStore<S> {
    inner: S,
    clock: Arc<dyn Clock>,
    limit_per_window: u32,
    window_ms: i64,
    stamps: Mutex<VecDeque<i64>>,
}

impl<S: RowStore> ThrottledStore<S> {
    pub fn new(inner: S, clock: Arc<dyn Clock>, limit_per_minute: u32) -> Self {
        Self {
            inner,
            clock,
            limit_per_window: limit_per_minute,
            window_ms: QUOTA_WINDOW_MS,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Wrapped adapter.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Calls still available in the current window.
    pub fn remaining(&self) -> u32 {
        if self.limit_per_window == 0 {
            return u32::MAX;
        }
        let now = self.clock.now_ms();
        let mut stamps = self.stamps.lock();
        self.evict(&mut stamps, now);
        self.limit_per_window
            .saturating_sub(u32::try_from(stamps.len()).unwrap_or(u32::MAX))
    }

    fn evict(&self, stamps: &mut VecDeque<i64>, now: i64) {
        let cutoff = now - self.window_ms;
        while stamps.front().is_some_and(|&t| t <= cutoff) {
            stamps.pop_front();
        }
    }

    /// Record a call, or report how long to wait before one is allowed.
    fn admit(&self) -> Result<(), StoreError> {
        if self.limit_per_window == 0 {
            return Ok(());
        }

        let now = self.clock.now_ms();
        let mut stamps = self.stamps.lock();
        self.evict(&mut stamps, now);

        if stamps.len() >= self.limit_per_window as usize {
            let oldest = stamps.front().copied().unwrap_or(now);
            let wait_ms = (oldest + self.window_ms - now).max(1);
            let retry_after = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(1));
            tracing::warn!(
                store = self.inner.name(),
                limit = self.limit_per_window,
                retry_after_ms = wait_ms,
                "Local row store quota exhausted"
            );
            return Err(StoreError::QuotaExceeded {
                retry_after: Some(retry_after),
            });
        }

        stamps.push_back(now);
        Ok(())
    }
}

#[async_trait]
impl<S: RowStore> RowStore for ThrottledStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn append(&self, row: Row) -> Result<(), StoreError> {
        self.admit()?;
        self.inner.append(row).await
    }

    async fn scan(&self) -> Result<Vec<StoredRow>, StoreError> {
        self.admit()?;
        self.inner.scan().await
    }

    async fn overwrite(&self, row_ref: RowRef, row: Row) -> Result<(), StoreError> {
        self.admit()?;
        self.inner.overwrite(row_ref, row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryRowStore;

    fn throttled(limit: u32) -> (ThrottledStore<MemoryRowStore>, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let store = ThrottledStore::new(MemoryRowStore::new(), Arc::new(clock.clone()), limit);
        (store, clock)
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_refuses() {
        let (store, _clock) = throttled(3);
        store.append(vec!["a".into()]).await.unwrap();
        store.scan().await.unwrap();
        store.scan().await.unwrap();

        let err = store.scan().await.unwrap_err();
        assert_eq!(
            err,
            StoreError::QuotaExceeded {
                retry_after: Some(Duration::from_millis(60_000))
            }
        );
        // Refused calls never reach the inner store
        assert_eq!(store.inner().operation_count(), 3);
    }

    #[tokio::test]
    async fn window_slides_with_clock() {
        let (store, clock) = throttled(2);
        store.scan().await.unwrap();
        clock.advance(30_000);
        store.scan().await.unwrap();
        assert_eq!(store.remaining(), 0);

        // First call ages out exactly one window after it was made
        clock.advance(30_000);
        assert_eq!(store.remaining(), 1);
        store.scan().await.unwrap();

        let err = store.scan().await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(30_000)));
    }

    #[tokio::test]
    async fn zero_limit_disables_throttle() {
        let (store, _clock) = throttled(0);
        for _ in 0..500 {
            store.scan().await.unwrap();
        }
        assert_eq!(store.remaining(), u32::MAX);
    }

    #[tokio::test]
    async fn inner_failures_still_count_against_budget() {
        let (store, _clock) = throttled(2);
        store
            .inner()
            .inject_failure(crate::store::StoreOp::Scan, StoreError::Timeout);
        assert_eq!(store.scan().await.unwrap_err(), StoreError::Timeout);
        assert_eq!(store.remaining(), 1);
    }
}
