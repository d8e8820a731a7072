//! Clock and identifier source for the pairing core.
//!
//! Every component reads time through [`Clock`] so tests can drive the
//! session lifecycle deterministically with [`ManualClock`]. Session ids
//! come from the thread-local CSPRNG and are the only capability a
//! secondary device needs, so they carry 256 bits of entropy.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Session id byte length before hex encoding (32 bytes = 64 hex chars).
pub const SESSION_ID_BYTES: usize = 32;

/// Length of a hex-encoded session id.
pub const SESSION_ID_LEN: usize = SESSION_ID_BYTES * 2;

/// Length of the log-safe tag derived from a session id.
const SESSION_TAG_LEN: usize = 12;

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by the host's system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests and simulations.
///
/// Clones share the same underlying instant, so two simulated devices can
/// observe one timeline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Generate a fresh session id (lowercase hex).
pub fn generate_session_id() -> String {
    let bytes: [u8; SESSION_ID_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Whether `candidate` has the exact shape of a generated session id.
pub fn is_well_formed_session_id(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Short, non-reversible tag for a session id, safe to put in logs.
///
/// The id itself is a bearer credential and must never be logged in full.
pub fn session_tag(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut tag = hex::encode(digest);
    tag.truncate(SESSION_TAG_LEN);
    tag
}
