//! Spreadsheet-backed row store over a Sheets-v4-style values API.
//!
//! ## Design
//! - HTTP client (reqwest) against the `values` endpoints of one spreadsheet
//! - Bearer-token authentication; the token never lives in the config file
//! - Rows are the 8 columns `A:H` of one sheet; the row handle is the
//!   1-based sheet row number
//! - HTTP 429 maps to quota exhaustion (with `Retry-After`), 408/5xx and
//!   transport errors to transient unavailability, any other non-2xx to a
//!   hard rejection
//!
//! The API trims trailing empty cells and trailing empty rows; callers pad
//! rows back to full width when decoding.

use super::{Row, RowRef, RowStore, StoreError, StoredRow, ROW_WIDTH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Last column letter of the session row range (`A` + 7).
const LAST_COLUMN: char = 'H';

/// Default public API endpoint.
pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";

// ── Configuration ────────────────────────────────────────────────

/// Connection settings for one sheet of one spreadsheet.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    /// API base URL (e.g., https://sheets.googleapis.com).
    pub api_base: String,
    /// Spreadsheet id (the store locator carried in the pairing payload).
    pub spreadsheet_id: String,
    /// Sheet (tab) name holding the session rows.
    pub sheet: String,
    /// OAuth access token with read/write scope on the spreadsheet.
    pub access_token: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

// ── Wire models ──────────────────────────────────────────────────

/// Body of a `values` read or write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl ValueRange {
    fn single(row: Row) -> Self {
        Self {
            range: None,
            values: vec![row.into_iter().map(serde_json::Value::String).collect()],
        }
    }
}

// ── Client ───────────────────────────────────────────────────────

/// REST row store client.
pub struct SheetsRowStore {
    config: SheetsConfig,
    http: reqwest::Client,
}

impl SheetsRowStore {
    /// Create a new client.
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        if config.spreadsheet_id.trim().is_empty() {
            anyhow::bail!("Spreadsheet id must not be empty");
        }
        if config.sheet.trim().is_empty() {
            anyhow::bail!("Sheet name must not be empty");
        }
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }

    /// Build the values URL for an A1 range on our sheet.
    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}!{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.spreadsheet_id,
            urlencoding::encode(&self.config.sheet),
            range
        )
    }

    /// Full-width range covering every row.
    fn table_range() -> String {
        format!("A:{LAST_COLUMN}")
    }

    /// Range covering exactly one row.
    fn row_range(row_ref: RowRef) -> String {
        let n = row_ref.position();
        format!("A{n}:{LAST_COLUMN}{n}")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let resp = request
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(classify_transport)?;
        check_status(resp).await
    }
}

/// Transport-level failures: timeouts are distinguished, everything else
/// (DNS, connect, reset) is transient unavailability.
fn classify_transport(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

/// Turn a non-success response into the matching [`StoreError`].
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        tracing::warn!(?retry_after, "Row store quota exceeded");
        return Err(StoreError::QuotaExceeded { retry_after });
    }

    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return Err(StoreError::Unavailable(format!("{status}: {body}")));
    }
    Err(StoreError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Render one returned cell as text. The API returns formatted strings by
/// default but may hand back numbers or booleans for typed cells.
fn cell_text(value: serde_json::Value) -> Result<String, StoreError> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(true) => Ok("TRUE".to_string()),
        serde_json::Value::Bool(false) => Ok("FALSE".to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(StoreError::Malformed(format!("unexpected cell value {other}"))),
    }
}

#[async_trait]
impl RowStore for SheetsRowStore {
    fn name(&self) -> &str {
        "sheets"
    }

    async fn append(&self, row: Row) -> Result<(), StoreError> {
        let url = format!("{}:append", self.values_url(&Self::table_range()));
        let request = self
            .http
            .post(&url)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&ValueRange::single(row));
        self.send(request).await?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<StoredRow>, StoreError> {
        let url = self.values_url(&Self::table_range());
        let request = self
            .http
            .get(&url)
            .query(&[("majorDimension", "ROWS")]);
        let resp = self.send(request).await?;
        let range: ValueRange = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(format!("values response: {e}")))?;

        range
            .values
            .into_iter()
            .enumerate()
            .map(|(i, cells)| {
                if cells.len() > ROW_WIDTH {
                    return Err(StoreError::Malformed(format!(
                        "row {} has {} cells, expected at most {ROW_WIDTH}",
                        i + 1,
                        cells.len()
                    )));
                }
                let cells = cells.into_iter().map(cell_text).collect::<Result<Row, _>>()?;
                Ok(StoredRow {
                    row_ref: RowRef::new(i as u64 + 1),
                    cells,
                })
            })
            .collect()
    }

    async fn overwrite(&self, row_ref: RowRef, row: Row) -> Result<(), StoreError> {
        if row_ref.position() == 0 {
            return Err(StoreError::UnknownRow(row_ref));
        }
        let url = self.values_url(&Self::row_range(row_ref));
        let request = self
            .http
            .put(&url)
            .query(&[("valueInputOption", "RAW")])
            .json(&ValueRange::single(row));
        self.send(request).await?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
