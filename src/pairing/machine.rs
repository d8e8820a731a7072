//! Pairing state machine and public API.
//!
//! ```text
//!            verify (now ≤ expiresAt, not yet verified)
//!  PENDING ─────────────────────────────────────────────▶ VERIFIED
//!     │                                                      │
//!     │ now > expiresAt                    now > expiresAt   │
//!     ▼                                                      ▼
//!  EXPIRED ◀─────────────────────────────────────────────────┘
//! ```
//!
//! Only the `PENDING → VERIFIED` edge is written to the store. Expiry is
//! computed by every reader and checked before the verified flag, so a
//! session verified in time is still reported expired to a late poll.

use super::payload::{PairingPayload, StoreLocator};
use crate::clock::{is_well_formed_session_id, session_tag, Clock};
use crate::error::PairingError;
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionRepository, SessionStatus};
use parking_lot::Mutex;
use std::sync::Arc;

/// Longest accepted fingerprint or user id, in bytes.
pub const MAX_FIELD_BYTES: usize = 512;

/// Result of [`PairingService::create_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: String,
    pub payload: PairingPayload,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Result of one poll by the primary device.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    /// True only for a verified session that has not expired.
    pub verified: bool,
    /// The session as read, absent on errors and once expired.
    pub session: Option<Session>,
    pub error: Option<PairingError>,
}

impl PollResult {
    fn failed(error: PairingError) -> Self {
        Self {
            verified: false,
            session: None,
            error: Some(error),
        }
    }
}

/// Session lifecycle over a shared row store.
pub struct PairingService {
    repo: SessionRepository,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    locator: StoreLocator,
}

impl PairingService {
    pub fn new(
        repo: SessionRepository,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        locator: StoreLocator,
    ) -> Self {
        Self {
            repo,
            clock,
            retry,
            locator,
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn locator(&self) -> &StoreLocator {
        &self.locator
    }

    /// Primary side: create a pending session and its QR payload.
    ///
    /// The append is retried with the same session id, so an append that
    /// timed out after landing leaves a harmless duplicate row.
    pub async fn create_session(
        &self,
        primary_fingerprint: &str,
    ) -> Result<CreatedSession, PairingError> {
        validate_field("primary fingerprint", primary_fingerprint)?;

        let session = self
            .repo
            .prepare(primary_fingerprint, self.clock.now_ms());
        self.retry
            .run("create", |_| self.repo.insert(&session))
            .await?;

        Ok(CreatedSession {
            session_id: session.session_id.clone(),
            payload: PairingPayload::new(&self.locator, &session),
            created_at: session.created_at,
            expires_at: session.expires_at,
        })
    }

    /// Secondary side: claim a pending session for `user_id`.
    ///
    /// Each attempt re-reads the row and takes a fresh timestamp. When a
    /// retry finds the session already verified with exactly the values an
    /// earlier attempt of this call wrote, that earlier write landed and the
    /// call succeeds.
    pub async fn verify_session(
        &self,
        session_id: &str,
        secondary_fingerprint: &str,
        user_id: &str,
    ) -> Result<Session, PairingError> {
        validate_session_id(session_id)?;
        validate_field("secondary fingerprint", secondary_fingerprint)?;
        validate_field("user id", user_id)?;

        let attempted_at: Mutex<Vec<i64>> = Mutex::new(Vec::new());
        let result = self
            .retry
            .run("verify", |attempt| {
                let attempted_at = &attempted_at;
                async move {
                    let current = self.repo.find_by_id(session_id).await?;
                    let landed_earlier = attempt > 1
                        && current.verified
                        && current.user_id.as_deref() == Some(user_id)
                        && current.secondary_fingerprint.as_deref() == Some(secondary_fingerprint)
                        && current
                            .verified_at
                            .is_some_and(|at| attempted_at.lock().contains(&at));
                    if landed_earlier {
                        tracing::info!(
                            session = %session_tag(session_id),
                            attempt,
                            "Earlier verification attempt had landed"
                        );
                        return Ok(current);
                    }

                    let now = self.clock.now_ms();
                    attempted_at.lock().push(current.verification_time(now));
                    self.repo
                        .commit_verification(&current, secondary_fingerprint, user_id, now)
                        .await
                }
            })
            .await;

        if let Err(err) = &result {
            tracing::warn!(
                session = %session_tag(session_id),
                error = %err,
                "Verification failed"
            );
        }
        result
    }

    /// Primary side: one read of the session, no retries.
    pub async fn poll_once(&self, session_id: &str) -> PollResult {
        if let Err(err) = validate_session_id(session_id) {
            return PollResult::failed(err);
        }
        match self.repo.find_by_id(session_id).await {
            // Time is taken after the read completes
            Ok(session) => evaluate(session, self.clock.now_ms()),
            Err(err) => PollResult::failed(err),
        }
    }

    /// Current derived status of a session.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, PairingError> {
        validate_session_id(session_id)?;
        let session = self.repo.find_by_id(session_id).await?;
        Ok(session.status_at(self.clock.now_ms()))
    }
}

/// Judge a freshly read session at `now`. Expiry is checked first.
pub fn evaluate(session: Session, now: i64) -> PollResult {
    match session.status_at(now) {
        SessionStatus::Expired => PollResult::failed(PairingError::Expired),
        SessionStatus::Verified => PollResult {
            verified: true,
            session: Some(session),
            error: None,
        },
        SessionStatus::Pending => PollResult {
            verified: false,
            session: Some(session),
            error: None,
        },
    }
}

/// Reject empty, oversized or control-character input before any store
/// call is spent on it.
pub fn validate_field(name: &str, value: &str) -> Result<(), PairingError> {
    if value.trim().is_empty() {
        return Err(PairingError::InvalidInput(format!("{name} must not be empty")));
    }
    if value.len() > MAX_FIELD_BYTES {
        return Err(PairingError::InvalidInput(format!(
            "{name} exceeds {MAX_FIELD_BYTES} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(PairingError::InvalidInput(format!(
            "{name} contains control characters"
        )));
    }
    if value.trim() != value {
        return Err(PairingError::InvalidInput(format!(
            "{name} has leading or trailing whitespace"
        )));
    }
    Ok(())
}

/// Session ids must look exactly like generated ones.
pub fn validate_session_id(session_id: &str) -> Result<(), PairingError> {
    if is_well_formed_session_id(session_id) {
        Ok(())
    } else {
        Err(PairingError::InvalidInput(
            "session id must be 64 lowercase hex characters".into(),
        ))
    }
}
