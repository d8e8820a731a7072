//! Primary-side wait for the secondary device.
//!
//! ## Design
//! - One [`PairingService::poll_once`] per interval, never overlapping
//! - Cancellation and the caller's deadline are checked before every store
//!   call and interrupt the sleep between calls; an in-flight call is
//!   allowed to finish
//! - Transient failures are retried on the next tick, quota errors wait at
//!   least the store's `retry_after`
//! - Once the session's expiry is known the loop stops on its own clock,
//!   even while the store is unreachable
//!
//! [`PollBudget`] checks up front that polling for a whole session lifetime
//! fits in the shared per-minute quota.

use super::machine::PairingService;
use crate::error::PairingError;
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default poll interval: 3 seconds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default number of consecutive transient failures before giving up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Store calls spent outside polling during one pairing (create + verify).
const NON_POLL_OPS: u64 = 2;

const MINUTE_MS: u64 = 60_000;

/// How the wait for pairing ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The secondary verified the session before it expired.
    Paired { user_id: String, session: Session },
    /// The session is past its expiry; a new one must be created.
    Expired,
    /// No row carries the session id.
    NotFound,
    /// Cancelled by the caller or stopped by the caller's deadline.
    Cancelled,
    /// Too many consecutive transient failures; the caller may retry.
    TransientFailure(PairingError),
    /// A terminal error other than expiry or absence.
    Failed(PairingError),
}

/// Poll loop settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Repeatedly polls one session until it reaches a terminal outcome.
pub struct Poller {
    service: Arc<PairingService>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(service: Arc<PairingService>, config: PollerConfig) -> Self {
        Self { service, config }
    }

    /// Poll `session_id` until paired, expired, missing, failed or cancelled.
    ///
    /// `expires_at` is the expiry from session creation when the caller has
    /// it; otherwise it is learned from the first successful poll.
    pub async fn run(
        &self,
        session_id: &str,
        mut expires_at: Option<i64>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let clock = self.service.clock().clone();
        let max_failures = self.config.max_consecutive_failures.max(1);
        let mut consecutive_failures = 0u32;
        let mut polls = 0u64;

        loop {
            if cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::info!(polls, "Pairing poll cancelled");
                return PollOutcome::Cancelled;
            }
            if expires_at.is_some_and(|exp| clock.now_ms() > exp) {
                tracing::info!(polls, "Pairing session expired while waiting");
                return PollOutcome::Expired;
            }

            polls += 1;
            let result = self.service.poll_once(session_id).await;
            let mut wait = self.config.interval;

            match (result.verified, result.session, result.error) {
                (true, Some(session), _) => {
                    let user_id = session.user_id.clone().unwrap_or_default();
                    tracing::info!(polls, "Pairing completed");
                    return PollOutcome::Paired { user_id, session };
                }
                (_, _, Some(PairingError::Expired)) => return PollOutcome::Expired,
                (_, _, Some(PairingError::NotFound)) => return PollOutcome::NotFound,
                (_, _, Some(err)) if err.is_retriable() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= max_failures {
                        tracing::warn!(
                            polls,
                            consecutive_failures,
                            error = %err,
                            "Giving up pairing poll after repeated failures"
                        );
                        return PollOutcome::TransientFailure(err);
                    }
                    if let Some(retry_after) = err.retry_after() {
                        wait = wait.max(retry_after);
                    }
                    tracing::warn!(
                        polls,
                        consecutive_failures,
                        delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Pairing poll failed, will retry"
                    );
                }
                (_, _, Some(err)) => {
                    tracing::warn!(polls, error = %err, "Pairing poll stopped");
                    return PollOutcome::Failed(err);
                }
                (_, session, None) => {
                    consecutive_failures = 0;
                    if let Some(session) = session {
                        expires_at.get_or_insert(session.expires_at);
                    }
                    tracing::debug!(polls, "Session still pending");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(polls, "Pairing poll cancelled");
                    return PollOutcome::Cancelled;
                }
                _ = sleep_until_deadline(deadline) => {
                    tracing::info!(polls, "Pairing poll deadline reached");
                    return PollOutcome::Cancelled;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Quota budget ─────────────────────────────────────────────────

/// Store calls one pairing needs against what the shared quota allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Polls over a full session lifetime.
    pub polls_per_session: u64,
    /// Polls plus the create and verify calls.
    pub ops_per_session: u64,
    /// Calls the quota allows over the session lifetime.
    pub ops_available: u64,
    /// Calls one pairing makes in its busiest minute.
    pub ops_per_minute: u64,
}

impl PollBudget {
    /// Compute the budget without judging it.
    pub fn compute(ttl: Duration, interval: Duration, quota_per_minute: u32) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        let polls_per_session = ttl_ms.div_ceil(interval_ms);
        let minutes = ttl_ms.div_ceil(MINUTE_MS).max(1);
        let polls_per_minute = MINUTE_MS.div_ceil(interval_ms).min(polls_per_session);
        Self {
            polls_per_session,
            ops_per_session: polls_per_session + NON_POLL_OPS,
            ops_available: u64::from(quota_per_minute).saturating_mul(minutes),
            ops_per_minute: polls_per_minute + NON_POLL_OPS,
        }
    }

    /// Fail when a pairing would exceed the quota. A quota of 0 means the
    /// store is unmetered.
    pub fn check(ttl: Duration, interval: Duration, quota_per_minute: u32) -> anyhow::Result<Self> {
        let budget = Self::compute(ttl, interval, quota_per_minute);
        if quota_per_minute == 0 {
            return Ok(budget);
        }
        if budget.ops_per_minute > u64::from(quota_per_minute) {
            anyhow::bail!(
                "Poll interval {}ms needs {} store calls per minute, quota allows {}",
                interval.as_millis(),
                budget.ops_per_minute,
                quota_per_minute
            );
        }
        if budget.ops_per_session > budget.ops_available {
            anyhow::bail!(
                "One pairing needs {} store calls, quota allows {} over the session lifetime",
                budget.ops_per_session,
                budget.ops_available
            );
        }
        Ok(budget)
    }
}
