//! Session ⇄ row encoding.
//!
//! Column layout (8 text cells, one session per row):
//!
//! | col | field                  | format                       |
//! |-----|------------------------|------------------------------|
//! | A   | `sessionId`            | 64 lowercase hex chars       |
//! | B   | `verified`             | `TRUE` / `FALSE`             |
//! | C   | `createdAt`            | epoch ms, base 10            |
//! | D   | `expiresAt`            | epoch ms, base 10            |
//! | E   | `primaryFingerprint`   | opaque text                  |
//! | F   | `secondaryFingerprint` | opaque text, empty if unset  |
//! | G   | `userId`               | opaque text, empty if unset  |
//! | H   | `verifiedAt`           | epoch ms, empty if unset     |
//!
//! Decoding never repairs a row: anything that does not fit the layout is
//! reported as malformed and left for the caller to skip or surface.

use super::Session;
use crate::store::{Row, StoredRow, ROW_WIDTH};

pub const COL_SESSION_ID: usize = 0;
pub const COL_VERIFIED: usize = 1;
pub const COL_CREATED_AT: usize = 2;
pub const COL_EXPIRES_AT: usize = 3;
pub const COL_PRIMARY_FP: usize = 4;
pub const COL_SECONDARY_FP: usize = 5;
pub const COL_USER_ID: usize = 6;
pub const COL_VERIFIED_AT: usize = 7;

/// Column titles, as a human-maintained sheet would carry them in row 1.
pub const HEADER: [&str; ROW_WIDTH] = [
    "sessionId",
    "verified",
    "createdAt",
    "expiresAt",
    "primaryFingerprint",
    "secondaryFingerprint",
    "userId",
    "verifiedAt",
];

/// Encode a session into its 8-cell row.
pub fn encode(session: &Session) -> Row {
    vec![
        session.session_id.clone(),
        if session.verified { "TRUE" } else { "FALSE" }.to_string(),
        session.created_at.to_string(),
        session.expires_at.to_string(),
        session.primary_fingerprint.clone(),
        session.secondary_fingerprint.clone().unwrap_or_default(),
        session.user_id.clone().unwrap_or_default(),
        session
            .verified_at
            .map(|t| t.to_string())
            .unwrap_or_default(),
    ]
}

/// Whether a scanned row is the column header rather than a session.
pub fn is_header(cells: &[String]) -> bool {
    cells
        .first()
        .is_some_and(|c| c.trim() == HEADER[COL_SESSION_ID])
}

/// Session id cell of a raw row, if present and non-empty.
pub fn row_session_id(cells: &[String]) -> Option<&str> {
    cells
        .get(COL_SESSION_ID)
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
}

/// Decode a scanned row, attaching its row handle.
pub fn decode_stored(row: &StoredRow) -> Result<Session, String> {
    let mut session = decode(&row.cells)?;
    session.row_ref = Some(row.row_ref);
    Ok(session)
}

/// Decode one row. Rows shorter than 8 cells are padded with empty cells
/// (stores trim trailing blanks); longer rows are rejected.
pub fn decode(cells: &[String]) -> Result<Session, String> {
    if cells.len() > ROW_WIDTH {
        return Err(format!(
            "expected at most {ROW_WIDTH} cells, got {}",
            cells.len()
        ));
    }
    let cell = |i: usize| cells.get(i).map(|c| c.trim()).unwrap_or("");

    let session_id = cell(COL_SESSION_ID);
    if session_id.is_empty() {
        return Err("empty sessionId".into());
    }

    let verified = parse_bool(cell(COL_VERIFIED))?;
    let created_at = parse_millis("createdAt", cell(COL_CREATED_AT))?;
    let expires_at = parse_millis("expiresAt", cell(COL_EXPIRES_AT))?;
    let primary_fingerprint = cell(COL_PRIMARY_FP);
    if primary_fingerprint.is_empty() {
        return Err("empty primaryFingerprint".into());
    }
    let secondary_fingerprint = optional_text(cell(COL_SECONDARY_FP));
    let user_id = optional_text(cell(COL_USER_ID));
    let verified_at = match cell(COL_VERIFIED_AT) {
        "" => None,
        raw => Some(parse_millis("verifiedAt", raw)?),
    };

    if expires_at < created_at {
        return Err(format!(
            "expiresAt {expires_at} precedes createdAt {created_at}"
        ));
    }

    if verified {
        if secondary_fingerprint.is_none() || user_id.is_none() || verified_at.is_none() {
            return Err("verified row is missing verification fields".into());
        }
    } else if secondary_fingerprint.is_some() || user_id.is_some() || verified_at.is_some() {
        return Err("unverified row carries verification fields".into());
    }

    if let Some(at) = verified_at {
        if at < created_at {
            return Err(format!("verifiedAt {at} precedes createdAt {created_at}"));
        }
    }

    Ok(Session {
        session_id: session_id.to_string(),
        created_at,
        expires_at,
        primary_fingerprint: primary_fingerprint.to_string(),
        secondary_fingerprint,
        verified,
        user_id,
        verified_at,
        row_ref: None,
    })
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    if raw.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(format!("verified: expected TRUE or FALSE, got {raw:?}"))
    }
}

fn parse_millis(field: &str, raw: &str) -> Result<i64, String> {
    raw.parse::<i64>()
        .map_err(|_| format!("{field}: expected epoch milliseconds, got {raw:?}"))
}

fn optional_text(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_string())
}
