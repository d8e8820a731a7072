//! Error taxonomy of the pairing core.
//!
//! Callers branch on these variants to pick a user-visible outcome:
//! paired, expired (regenerate the QR code) or transient failure (retry).

use crate::store::StoreError;
use std::time::Duration;

/// Failures of the session repository, state machine and poller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PairingError {
    /// No row carries the requested session id.
    #[error("session not found")]
    NotFound,
    /// The session is past its expiry instant.
    #[error("session expired")]
    Expired,
    /// The session was already verified by some device.
    #[error("session already verified")]
    AlreadyVerified,
    /// The row store failed; retriable only when the underlying failure is.
    #[error(transparent)]
    StoreUnavailable(StoreError),
    /// A store call did not complete in time.
    #[error("row store request timed out")]
    Timeout,
    /// The matching row could not be decoded.
    #[error("malformed session row: {0}")]
    MalformedRow(String),
    /// Caller-supplied input was rejected before touching the store.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PairingError {
    /// Whether a bounded retry with backoff may clear this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::StoreUnavailable(inner) => inner.is_retriable(),
            Self::Timeout => true,
            _ => false,
        }
    }

    /// Quota back-off requested by the store, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::StoreUnavailable(inner) => inner.retry_after(),
            _ => None,
        }
    }

    /// Whether this is the shared quota running out.
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(StoreError::QuotaExceeded { .. })
        )
    }
}

impl From<StoreError> for PairingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout => Self::Timeout,
            StoreError::Malformed(detail) => Self::MalformedRow(detail),
            other => Self::StoreUnavailable(other),
        }
    }
}
