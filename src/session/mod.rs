//! Pairing sessions: the typed record, its row encoding and its repository.
//!
//! A session is created by the primary device, verified at most once by a
//! secondary device, and stops being usable once its expiry instant has
//! passed. The status is never stored; it is derived from the `verified`
//! flag and the clock every time a session is read.

pub mod codec;
pub mod repository;

pub use repository::SessionRepository;

use crate::store::RowRef;
use serde::{Deserialize, Serialize};

/// Derived lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, waiting for a secondary device.
    Pending,
    /// Verified and still within its lifetime.
    Verified,
    /// Past its expiry instant, whether or not it was verified.
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pairing session as stored in the shared table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unguessable id; the only credential a secondary device needs.
    pub session_id: String,
    /// Epoch ms at creation.
    pub created_at: i64,
    /// Epoch ms after which the session is expired.
    pub expires_at: i64,
    /// Fingerprint of the device that created the session.
    pub primary_fingerprint: String,
    /// Fingerprint of the device that verified it.
    pub secondary_fingerprint: Option<String>,
    /// Monotonic: false until the single successful verification.
    pub verified: bool,
    /// Identity asserted by the verifying device.
    pub user_id: Option<String>,
    /// Epoch ms of the verification.
    pub verified_at: Option<i64>,
    /// Where the row lives in the store, when it came from a scan.
    #[serde(skip)]
    pub row_ref: Option<RowRef>,
}

impl Session {
    /// Fresh unverified session.
    pub fn pending(session_id: String, primary_fingerprint: String, now: i64, ttl_ms: i64) -> Self {
        Self {
            session_id,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
            primary_fingerprint,
            secondary_fingerprint: None,
            verified: false,
            user_id: None,
            verified_at: None,
            row_ref: None,
        }
    }

    /// Expiry is strict: a session is still valid at exactly `expires_at`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Status at `now`. Expiry wins over the verified flag.
    pub fn status_at(&self, now: i64) -> SessionStatus {
        if self.is_expired_at(now) {
            SessionStatus::Expired
        } else if self.verified {
            SessionStatus::Verified
        } else {
            SessionStatus::Pending
        }
    }

    /// Milliseconds of lifetime left at `now` (0 once expired).
    pub fn remaining_ms(&self, now: i64) -> i64 {
        self.expires_at.saturating_sub(now).max(0)
    }

    /// Timestamp a verification at `now` records. The verifier's clock may
    /// run behind the creator's, so it never precedes `created_at`.
    pub fn verification_time(&self, now: i64) -> i64 {
        now.max(self.created_at)
    }

    /// Copy of this session with the verification fields filled in.
    /// Creation fields are carried over untouched.
    pub fn verified_by(&self, secondary_fingerprint: &str, user_id: &str, now: i64) -> Self {
        Self {
            secondary_fingerprint: Some(secondary_fingerprint.to_string()),
            verified: true,
            user_id: Some(user_id.to_string()),
            verified_at: Some(self.verification_time(now)),
            ..self.clone()
        }
    }
}
