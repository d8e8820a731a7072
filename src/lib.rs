//! Cross-device session pairing over a shared, non-transactional row store.
//!
//! A primary device creates a short-lived session and shows its id as a QR
//! payload; a secondary device scans it and verifies the session with its
//! fingerprint and user id; the primary polls until it sees the
//! verification, the session expires, or the caller gives up. The only
//! channel between the two devices is a table that supports append, full
//! read and row overwrite.

pub mod clock;
pub mod config;
pub mod error;
pub mod pairing;
pub mod retry;
pub mod session;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::PairingError;
pub use pairing::{
    CreatedSession, PairingPayload, PairingService, PollOutcome, PollResult, Poller, StoreLocator,
};
pub use retry::RetryPolicy;
pub use session::{Session, SessionRepository, SessionStatus};
pub use store::{RowStore, StoreError};
