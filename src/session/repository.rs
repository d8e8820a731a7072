//! Session persistence over a [`RowStore`].
//!
//! ## Design
//! - One row per session, appended at creation and overwritten once at
//!   verification; rows are never deleted
//! - Lookup is a full scan; the first structurally valid row whose id
//!   matches wins
//! - Every scan rebuilds an in-process `session_id → row` index; a commit
//!   for a session that was not read from a scan takes its row from there
//! - Verification is read-check-write: the row is re-read, its pre-image
//!   checked, then overwritten
//!
//! ## Race
//! The store has no conditional write. Two verifiers that both read the
//! pre-image before either overwrites it will both pass the check, and the
//! later overwrite wins. The window is one scan-to-overwrite round trip and
//! only a holder of the session id can enter it.

use super::codec;
use super::Session;
use crate::clock::{generate_session_id, session_tag};
use crate::error::PairingError;
use crate::store::{RowRef, RowStore, StoredRow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default session lifetime: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Typed access to the session table.
pub struct SessionRepository {
    store: Arc<dyn RowStore>,
    ttl_ms: i64,
    index: Mutex<HashMap<String, RowRef>>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn RowStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Session lifetime in milliseconds.
    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Build a new pending session with a fresh id. Nothing is written.
    pub fn prepare(&self, primary_fingerprint: &str, now: i64) -> Session {
        Session::pending(
            generate_session_id(),
            primary_fingerprint.to_string(),
            now,
            self.ttl_ms,
        )
    }

    /// Append a prepared session. Appending the same session twice leaves
    /// two identical rows; lookups resolve to the first one.
    pub async fn insert(&self, session: &Session) -> Result<(), PairingError> {
        self.store.append(codec::encode(session)).await?;
        tracing::info!(
            session = %session_tag(&session.session_id),
            expires_at = session.expires_at,
            store = self.store.name(),
            "Pairing session created"
        );
        Ok(())
    }

    /// Create and persist a new pending session.
    pub async fn create(&self, primary_fingerprint: &str, now: i64) -> Result<Session, PairingError> {
        let session = self.prepare(primary_fingerprint, now);
        self.insert(&session).await?;
        Ok(session)
    }

    /// Find a session by id with a full scan.
    pub async fn find_by_id(&self, session_id: &str) -> Result<Session, PairingError> {
        let rows = self.store.scan().await?;
        self.locate(&rows, session_id)
    }

    /// Every decodable session in table order, refreshing the index.
    /// Undecodable rows are returned separately with their error.
    pub async fn list(&self) -> Result<(Vec<Session>, Vec<(RowRef, String)>), PairingError> {
        let rows = self.store.scan().await?;
        let mut sessions = Vec::new();
        let mut malformed = Vec::new();
        let mut index = HashMap::new();
        for row in rows.iter().filter(|r| !codec::is_header(&r.cells)) {
            match codec::decode_stored(row) {
                Ok(session) => {
                    index
                        .entry(session.session_id.clone())
                        .or_insert(row.row_ref);
                    sessions.push(session);
                }
                Err(detail) => malformed.push((row.row_ref, detail)),
            }
        }
        *self.index.lock() = index;
        Ok((sessions, malformed))
    }

    /// Mark a session verified: re-read, check, overwrite.
    pub async fn apply_verification(
        &self,
        session_id: &str,
        secondary_fingerprint: &str,
        user_id: &str,
        now: i64,
    ) -> Result<Session, PairingError> {
        let current = self.find_by_id(session_id).await?;
        self.commit_verification(&current, secondary_fingerprint, user_id, now)
            .await
    }

    /// Check a freshly read pre-image and overwrite it with the verified row.
    pub async fn commit_verification(
        &self,
        current: &Session,
        secondary_fingerprint: &str,
        user_id: &str,
        now: i64,
    ) -> Result<Session, PairingError> {
        let tag = session_tag(&current.session_id);
        if current.verified {
            tracing::warn!(session = %tag, "Verification refused: session already verified");
            return Err(PairingError::AlreadyVerified);
        }
        if current.is_expired_at(now) {
            tracing::info!(
                session = %tag,
                expired_ms_ago = now.saturating_sub(current.expires_at),
                "Verification refused: session expired"
            );
            return Err(PairingError::Expired);
        }
        let row_ref = current
            .row_ref
            .or_else(|| self.cached_ref(&current.session_id))
            .ok_or(PairingError::NotFound)?;
        if now < current.created_at {
            tracing::debug!(
                session = %tag,
                behind_ms = current.created_at.saturating_sub(now),
                "Verifier clock is behind the creator's; recording createdAt"
            );
        }

        let mut updated = current.verified_by(secondary_fingerprint, user_id, now);
        self.store
            .overwrite(row_ref, codec::encode(&updated))
            .await?;
        updated.row_ref = Some(row_ref);

        tracing::info!(session = %tag, %row_ref, "Pairing session verified");
        Ok(updated)
    }

    /// Number of distinct session ids seen by the last scan.
    pub fn index_len(&self) -> usize {
        self.index.lock().len()
    }

    /// Row handle of `session_id` as of the last scan.
    pub fn cached_ref(&self, session_id: &str) -> Option<RowRef> {
        self.index.lock().get(session_id).copied()
    }

    fn locate(&self, rows: &[StoredRow], session_id: &str) -> Result<Session, PairingError> {
        let mut index = HashMap::new();
        let mut found = None;
        let mut malformed_match = None;

        for row in rows.iter().filter(|r| !codec::is_header(&r.cells)) {
            match codec::decode_stored(row) {
                Ok(session) => {
                    index
                        .entry(session.session_id.clone())
                        .or_insert(row.row_ref);
                    if found.is_none() && session.session_id == session_id {
                        found = Some(session);
                    }
                }
                Err(detail) => {
                    let is_match = codec::row_session_id(&row.cells) == Some(session_id);
                    tracing::debug!(
                        row = %row.row_ref,
                        matches_lookup = is_match,
                        error = %detail,
                        "Skipping malformed session row"
                    );
                    if is_match && malformed_match.is_none() {
                        malformed_match = Some(format!("{}: {detail}", row.row_ref));
                    }
                }
            }
        }
        *self.index.lock() = index;

        match (found, malformed_match) {
            (Some(session), _) => Ok(session),
            (None, Some(detail)) => Err(PairingError::MalformedRow(detail)),
            (None, None) => Err(PairingError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRowStore, StoreError, StoreOp};

    fn setup() -> (SessionRepository, Arc<MemoryRowStore>) {
        let store = Arc::new(MemoryRowStore::new());
        let repo = SessionRepository::new(store.clone(), DEFAULT_TTL);
        (repo, store)
    }

    #[tokio::test]
    async fn create_appends_pending_row() {
        let (repo, store) = setup();
        let session = repo.create("fp-primary", 1_000).await.unwrap();

        assert_eq!(session.created_at, 1_000);
        assert_eq!(session.expires_at, 301_000);
        assert!(!session.verified);
        assert_eq!(store.len(), 1);
        assert_eq!(store.rows()[0], codec::encode(&session));
    }

    #[tokio::test]
    async fn find_returns_session_with_row_ref() {
        let (repo, _store) = setup();
        let _other = repo.create("fp-a", 0).await.unwrap();
        let wanted = repo.create("fp-b", 0).await.unwrap();

        let found = repo.find_by_id(&wanted.session_id).await.unwrap();
        assert_eq!(found.primary_fingerprint, "fp-b");
        assert_eq!(found.row_ref, Some(RowRef::new(2)));
        assert_eq!(repo.index_len(), 2);
        assert_eq!(repo.cached_ref(&wanted.session_id), Some(RowRef::new(2)));
    }

    #[tokio::test]
    async fn find_unknown_id_is_not_found() {
        let (repo, _store) = setup();
        repo.create("fp", 0).await.unwrap();
        assert_eq!(
            repo.find_by_id("nope").await.unwrap_err(),
            PairingError::NotFound
        );
    }

    #[tokio::test]
    async fn header_and_foreign_malformed_rows_are_skipped() {
        let (repo, store) = setup();
        store.push_raw(codec::HEADER.iter().map(|h| h.to_string()).collect());
        store.push_raw(vec!["garbage".into(), "maybe".into()]);
        let session = repo.create("fp", 0).await.unwrap();

        let found = repo.find_by_id(&session.session_id).await.unwrap();
        assert_eq!(found.row_ref, Some(RowRef::new(3)));
        assert_eq!(repo.index_len(), 1);
    }

    #[tokio::test]
    async fn malformed_match_is_surfaced_not_repaired() {
        let (repo, store) = setup();
        store.push_raw(vec![
            "broken-id".into(),
            "TRUE".into(),
            "1000".into(),
            "2000".into(),
            "fp".into(),
        ]);
        let err = repo.find_by_id("broken-id").await.unwrap_err();
        assert!(matches!(err, PairingError::MalformedRow(ref d) if d.contains("row#1")));
    }

    #[tokio::test]
    async fn valid_match_wins_over_malformed_duplicate() {
        let (repo, store) = setup();
        let session = repo.prepare("fp", 0);
        store.push_raw(vec![session.session_id.clone(), "nonsense".into()]);
        repo.insert(&session).await.unwrap();

        let found = repo.find_by_id(&session.session_id).await.unwrap();
        assert_eq!(found.row_ref, Some(RowRef::new(2)));
    }

    #[tokio::test]
    async fn duplicate_append_resolves_to_first_row() {
        let (repo, store) = setup();
        let session = repo.prepare("fp", 0);
        repo.insert(&session).await.unwrap();
        repo.insert(&session).await.unwrap();
        assert_eq!(store.len(), 2);

        let verified = repo
            .apply_verification(&session.session_id, "fp-2", "u1", 10)
            .await
            .unwrap();
        assert_eq!(verified.row_ref, Some(RowRef::new(1)));
        let again = repo.find_by_id(&session.session_id).await.unwrap();
        assert!(again.verified);
    }

    #[tokio::test]
    async fn verification_overwrites_in_place() {
        let (repo, store) = setup();
        let session = repo.create("fp-primary", 0).await.unwrap();

        let verified = repo
            .apply_verification(&session.session_id, "fp-secondary", "u42", 2_000)
            .await
            .unwrap();
        assert!(verified.verified);
        assert_eq!(verified.user_id.as_deref(), Some("u42"));
        assert_eq!(verified.verified_at, Some(2_000));
        assert_eq!(verified.primary_fingerprint, "fp-primary");
        assert_eq!(verified.expires_at, session.expires_at);

        assert_eq!(store.len(), 1);
        assert_eq!(store.rows()[0][codec::COL_VERIFIED], "TRUE");
    }

    #[tokio::test]
    async fn second_verification_is_refused_and_identity_kept() {
        let (repo, store) = setup();
        let session = repo.create("fp", 0).await.unwrap();
        repo.apply_verification(&session.session_id, "fp-1", "first", 1_000)
            .await
            .unwrap();

        let err = repo
            .apply_verification(&session.session_id, "fp-2", "second", 2_000)
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::AlreadyVerified);
        assert_eq!(store.rows()[0][codec::COL_USER_ID], "first");
        assert_eq!(store.rows()[0][codec::COL_SECONDARY_FP], "fp-1");
    }

    #[tokio::test]
    async fn expired_session_rejects_verification_and_row_unchanged() {
        let (repo, store) = setup();
        let session = repo.create("fp", 0).await.unwrap();
        let before = store.rows();

        let err = repo
            .apply_verification(&session.session_id, "fp-2", "u", session.expires_at + 1)
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::Expired);
        assert_eq!(store.rows(), before);
    }

    #[tokio::test]
    async fn verification_at_exact_expiry_succeeds() {
        let (repo, _store) = setup();
        let session = repo.create("fp", 0).await.unwrap();
        assert!(repo
            .apply_verification(&session.session_id, "fp-2", "u", session.expires_at)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let (repo, store) = setup();
        store.inject_failure(StoreOp::Append, StoreError::Unavailable("503".into()));
        assert!(matches!(
            repo.create("fp", 0).await.unwrap_err(),
            PairingError::StoreUnavailable(_)
        ));
        assert!(store.is_empty());

        let session = repo.create("fp", 0).await.unwrap();
        store.inject_failure(StoreOp::Overwrite, StoreError::Timeout);
        assert_eq!(
            repo.apply_verification(&session.session_id, "fp-2", "u", 1)
                .await
                .unwrap_err(),
            PairingError::Timeout
        );
        assert!(!repo.find_by_id(&session.session_id).await.unwrap().verified);
    }

    #[tokio::test]
    async fn concurrent_verifiers_race_last_write_wins() {
        let (repo, store) = setup();
        let session = repo.create("fp", 0).await.unwrap();

        // Both verifiers read the pending pre-image before either writes
        let seen_by_a = repo.find_by_id(&session.session_id).await.unwrap();
        let seen_by_b = repo.find_by_id(&session.session_id).await.unwrap();
        repo.commit_verification(&seen_by_a, "fp-a", "alice", 10)
            .await
            .unwrap();
        repo.commit_verification(&seen_by_b, "fp-b", "bob", 11)
            .await
            .unwrap();

        assert_eq!(store.rows()[0][codec::COL_USER_ID], "bob");
    }

    #[tokio::test]
    async fn verifier_clock_behind_creator_keeps_row_readable() {
        let (repo, _store) = setup();
        let session = repo.create("fp", 100_000).await.unwrap();

        let verified = repo
            .apply_verification(&session.session_id, "fp-2", "u42", 95_000)
            .await
            .unwrap();
        assert_eq!(verified.verified_at, Some(100_000));

        let again = repo.find_by_id(&session.session_id).await.unwrap();
        assert!(again.verified);
        assert_eq!(again.verified_at, Some(100_000));
        assert_eq!(
            repo.apply_verification(&session.session_id, "fp-3", "other", 96_000)
                .await
                .unwrap_err(),
            PairingError::AlreadyVerified
        );
    }

    #[tokio::test]
    async fn expired_log_field_survives_extreme_row_timestamps() {
        let (repo, store) = setup();
        let id = "a".repeat(64);
        let min = (i64::MIN + 1).to_string();
        store.push_raw(vec![
            id.clone(),
            "FALSE".into(),
            min.clone(),
            min,
            "fp".into(),
        ]);
        assert_eq!(
            repo.apply_verification(&id, "fp-2", "u", i64::MAX)
                .await
                .unwrap_err(),
            PairingError::Expired
        );
    }

    #[tokio::test]
    async fn commit_without_row_ref_uses_index_from_last_scan() {
        let (repo, store) = setup();
        repo.create("fp-other", 0).await.unwrap();
        let session = repo.create("fp", 0).await.unwrap();
        assert!(session.row_ref.is_none());

        // Unknown until a scan has seen it
        assert_eq!(
            repo.commit_verification(&session, "fp-2", "u", 1)
                .await
                .unwrap_err(),
            PairingError::NotFound
        );

        repo.list().await.unwrap();
        let verified = repo
            .commit_verification(&session, "fp-2", "u", 1)
            .await
            .unwrap();
        assert_eq!(verified.row_ref, Some(RowRef::new(2)));
        assert_eq!(store.rows()[1][codec::COL_USER_ID], "u");
        assert_eq!(store.rows()[0][codec::COL_VERIFIED], "FALSE");
    }

    #[tokio::test]
    async fn list_reports_sessions_and_malformed_rows() {
        let (repo, store) = setup();
        repo.create("fp-1", 0).await.unwrap();
        store.push_raw(vec!["x".into()]);
        repo.create("fp-2", 0).await.unwrap();

        let (sessions, malformed) = repo.list().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed[0].0, RowRef::new(2));
        assert_eq!(repo.index_len(), 2);
    }
}
