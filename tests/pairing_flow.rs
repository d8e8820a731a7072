//! End-to-end pairing between two simulated devices that share nothing but
//! a row store.

use devpair::clock::{Clock, ManualClock};
use devpair::pairing::{PairingPayload, PairingService, PollOutcome, Poller, PollerConfig, StoreLocator};
use devpair::retry::RetryPolicy;
use devpair::session::SessionRepository;
use devpair::store::{MemoryRowStore, RowStore, SqliteRowStore, ThrottledStore};
use devpair::PairingError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_secs(300);

fn locator() -> StoreLocator {
    StoreLocator {
        store: "shared".into(),
        sheet: "Pairing".into(),
    }
}

fn device(store: Arc<dyn RowStore>, clock: Arc<dyn Clock>) -> PairingService {
    PairingService::new(
        SessionRepository::new(store, TTL),
        clock,
        RetryPolicy::default(),
        locator(),
    )
}

#[tokio::test]
async fn desktop_and_phone_pair_then_session_expires() {
    let store = Arc::new(MemoryRowStore::new());
    let clock = ManualClock::new(0);
    let desktop = device(store.clone(), Arc::new(clock.clone()));
    let phone = device(store.clone(), Arc::new(clock.clone()));

    // t=0: desktop creates the session and shows the QR payload
    let created = desktop.create_session("fp-desktop").await.unwrap();
    assert_eq!(created.session_id.len(), 64);
    assert_eq!(created.expires_at, 300_000);

    // t=1000: nobody has scanned yet
    clock.set(1_000);
    let poll = desktop.poll_once(&created.session_id).await;
    assert!(!poll.verified);
    assert!(poll.error.is_none());

    // t=2000: phone scans the payload and verifies as u42
    clock.set(2_000);
    let scanned = PairingPayload::decode(&created.payload.encode().unwrap()).unwrap();
    assert_eq!(scanned.locator(), *phone.locator());
    phone
        .verify_session(&scanned.session_id, "fp-phone", "u42")
        .await
        .unwrap();

    // t=3000: desktop sees the pairing
    clock.set(3_000);
    let poll = desktop.poll_once(&created.session_id).await;
    assert!(poll.verified);
    let session = poll.session.unwrap();
    assert_eq!(session.user_id.as_deref(), Some("u42"));
    assert_eq!(session.secondary_fingerprint.as_deref(), Some("fp-phone"));
    assert_eq!(session.primary_fingerprint, "fp-desktop");

    // A second phone cannot take over the session
    let err = phone
        .verify_session(&created.session_id, "fp-intruder", "mallory")
        .await
        .unwrap_err();
    assert_eq!(err, PairingError::AlreadyVerified);

    // t=301000: expiry wins over the verified flag
    clock.set(301_000);
    let poll = desktop.poll_once(&created.session_id).await;
    assert!(!poll.verified);
    assert_eq!(poll.error, Some(PairingError::Expired));

    // Rows are never deleted
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn late_verification_is_rejected() {
    let store = Arc::new(MemoryRowStore::new());
    let clock = ManualClock::new(0);
    let desktop = device(store.clone(), Arc::new(clock.clone()));
    let phone = device(store.clone(), Arc::new(clock.clone()));

    let created = desktop.create_session("fp-desktop").await.unwrap();
    clock.set(created.expires_at + 1);
    assert_eq!(
        phone
            .verify_session(&created.session_id, "fp-phone", "u42")
            .await
            .unwrap_err(),
        PairingError::Expired
    );
    clock.set(created.expires_at);
    assert!(!desktop.poll_once(&created.session_id).await.verified);
}

#[tokio::test]
async fn phone_clock_behind_desktop_still_pairs() {
    let store = Arc::new(MemoryRowStore::new());
    let desktop_clock = ManualClock::new(100_000);
    let phone_clock = ManualClock::new(95_000);
    let desktop = device(store.clone(), Arc::new(desktop_clock.clone()));
    let phone = device(store.clone(), Arc::new(phone_clock.clone()));

    let created = desktop.create_session("fp-desktop").await.unwrap();
    let verified = phone
        .verify_session(&created.session_id, "fp-phone", "u42")
        .await
        .unwrap();
    assert_eq!(verified.verified_at, Some(created.created_at));

    desktop_clock.advance(1_000);
    let poll = desktop.poll_once(&created.session_id).await;
    assert!(poll.error.is_none(), "unexpected {:?}", poll.error);
    assert!(poll.verified);
    assert_eq!(poll.session.unwrap().user_id.as_deref(), Some("u42"));

    phone_clock.advance(1_000);
    assert_eq!(
        phone
            .verify_session(&created.session_id, "fp-other", "mallory")
            .await
            .unwrap_err(),
        PairingError::AlreadyVerified
    );
}

#[tokio::test]
async fn devices_pair_through_one_sqlite_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("rows.db");
    let clock = ManualClock::new(10_000);

    let desktop = device(
        Arc::new(SqliteRowStore::open(&path, "Pairing").unwrap()),
        Arc::new(clock.clone()),
    );
    let phone = device(
        Arc::new(SqliteRowStore::open(&path, "Pairing").unwrap()),
        Arc::new(clock.clone()),
    );

    let created = desktop.create_session("fp-desktop").await.unwrap();
    clock.advance(5_000);
    phone
        .verify_session(&created.session_id, "fp-phone", "u7")
        .await
        .unwrap();

    let poll = desktop.poll_once(&created.session_id).await;
    assert!(poll.verified);
    assert_eq!(poll.session.unwrap().user_id.as_deref(), Some("u7"));
}

#[tokio::test(start_paused = true)]
async fn poller_waits_for_phone_through_throttled_store() {
    /// Wall clock that follows tokio's paused clock.
    struct TokioClock(tokio::time::Instant);

    impl Clock for TokioClock {
        fn now_ms(&self) -> i64 {
            i64::try_from(self.0.elapsed().as_millis()).unwrap_or(i64::MAX)
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(TokioClock(tokio::time::Instant::now()));
    let shared = Arc::new(MemoryRowStore::new());
    let throttled: Arc<dyn RowStore> =
        Arc::new(ThrottledStore::new(shared.clone(), clock.clone(), 100));
    let desktop = Arc::new(device(throttled.clone(), clock.clone()));
    let phone = device(throttled, clock);

    let created = desktop.create_session("fp-desktop").await.unwrap();
    let session_id = created.session_id.clone();
    let phone_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(40)).await;
        phone.verify_session(&session_id, "fp-phone", "u42").await
    });

    let outcome = Poller::new(desktop.clone(), PollerConfig::default())
        .run(
            &created.session_id,
            Some(created.expires_at),
            None,
            &CancellationToken::new(),
        )
        .await;
    phone_task.await.unwrap().unwrap();

    match outcome {
        PollOutcome::Paired { user_id, .. } => assert_eq!(user_id, "u42"),
        other => panic!("expected Paired, got {other:?}"),
    }
    // create + 15 polls (0..=42s every 3s) + verify scan and overwrite
    assert_eq!(shared.operation_count(), 1 + 15 + 2);
}
