//! QR payload handed from the primary device to the secondary.
//!
//! Carries everything the secondary needs to reach the same session: the
//! store locator, the sheet, the session id and the expiry (so the
//! scanning app can refuse stale codes without a store call). Rendering
//! and scanning the QR image is left to the host application.

use crate::error::PairingError;
use crate::session::Session;
use serde::{Deserialize, Serialize};

/// Protocol tag embedded in every payload.
pub const PROTOCOL_TAG: &str = "devpair";

/// Current payload version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Where the shared session table lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocator {
    /// Store locator (spreadsheet id or database path).
    pub store: String,
    /// Sheet (table) name.
    pub sheet: String,
}

/// Serialized contents of the pairing QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    pub protocol: String,
    pub version: u32,
    pub store: String,
    pub sheet: String,
    pub session_id: String,
    pub expires_at: i64,
}

impl PairingPayload {
    pub fn new(locator: &StoreLocator, session: &Session) -> Self {
        Self {
            protocol: PROTOCOL_TAG.to_string(),
            version: PROTOCOL_VERSION,
            store: locator.store.clone(),
            sheet: locator.sheet.clone(),
            session_id: session.session_id.clone(),
            expires_at: session.expires_at,
        }
    }

    /// Compact JSON for the QR encoder.
    pub fn encode(&self) -> Result<String, PairingError> {
        serde_json::to_string(self)
            .map_err(|e| PairingError::InvalidInput(format!("payload encoding failed: {e}")))
    }

    /// Parse a scanned payload, rejecting foreign or future formats.
    pub fn decode(raw: &str) -> Result<Self, PairingError> {
        let payload: Self = serde_json::from_str(raw.trim())
            .map_err(|e| PairingError::InvalidInput(format!("not a pairing payload: {e}")))?;
        if payload.protocol != PROTOCOL_TAG {
            return Err(PairingError::InvalidInput(format!(
                "unknown protocol {:?}",
                payload.protocol
            )));
        }
        if payload.version != PROTOCOL_VERSION {
            return Err(PairingError::InvalidInput(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        if payload.session_id.is_empty() || payload.store.is_empty() || payload.sheet.is_empty() {
            return Err(PairingError::InvalidInput(
                "payload is missing session or store fields".into(),
            ));
        }
        Ok(payload)
    }

    /// Store locator of the session this payload points at.
    pub fn locator(&self) -> StoreLocator {
        StoreLocator {
            store: self.store.clone(),
            sheet: self.sheet.clone(),
        }
    }

    /// Whether the embedded expiry has already passed at `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
