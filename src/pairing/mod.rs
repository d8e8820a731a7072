//! Pairing protocol: state machine, QR payload and the primary-side poller.

pub mod machine;
pub mod payload;
pub mod poller;

pub use machine::{evaluate, CreatedSession, PairingService, PollResult};
pub use payload::{PairingPayload, StoreLocator};
pub use poller::{PollBudget, PollOutcome, Poller, PollerConfig};
