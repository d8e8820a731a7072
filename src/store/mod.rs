//! Row store adapters: the only code that talks to the shared table.
//!
//! The shared store is a flat sheet of fixed-width text rows with three
//! operations: append a row, read every row, overwrite one row in place.
//! There is no conditional write, no transaction and no notification, so
//! everything above this layer treats it as unreliable and eventually
//! consistent.
//!
//! ## Adapters
//! - [`MemoryRowStore`]: in-process table with fault injection (tests, demos)
//! - [`SqliteRowStore`]: file-backed table shared by processes on one host
//! - [`SheetsRowStore`]: REST client for a spreadsheet values API
//! - [`ThrottledStore`]: decorator enforcing the shared per-minute quota
//!
//! Every call on every adapter consumes one unit of the external rate budget.

pub mod memory;
pub mod sheets;
pub mod sqlite;
pub mod throttle;

pub use memory::MemoryRowStore;
pub use sheets::{SheetsConfig, SheetsRowStore};
pub use sqlite::SqliteRowStore;
pub use throttle::ThrottledStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Number of cells in every session row.
pub const ROW_WIDTH: usize = 8;

/// One row as an ordered list of text cells.
pub type Row = Vec<String>;

/// Opaque handle to a row position, required to overwrite it.
///
/// Handles are only meaningful to the adapter that produced them and only
/// until the table is reorganised by something outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowRef(u64);

impl RowRef {
    pub fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn position(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

/// A row as returned by [`RowStore::scan`], with the handle to overwrite it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub row_ref: RowRef,
    pub cells: Row,
}

/// Which store operation an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Append,
    Scan,
    Overwrite,
}

impl StoreOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Scan => "scan",
            Self::Overwrite => "overwrite",
        }
    }
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by a row store adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Network failure or server-side error; worth retrying after a delay.
    #[error("row store unavailable: {0}")]
    Unavailable(String),
    /// The request did not complete in time; worth retrying after a delay.
    #[error("row store request timed out")]
    Timeout,
    /// The shared rate budget is spent; back off before the next call.
    #[error("row store quota exceeded")]
    QuotaExceeded { retry_after: Option<Duration> },
    /// The store answered with data that does not have the expected shape.
    #[error("row store returned malformed data: {0}")]
    Malformed(String),
    /// The store refused the request (auth, bad range, missing sheet).
    #[error("row store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// Overwrite targeted a row that does not exist.
    #[error("{0} does not exist")]
    UnknownRow(RowRef),
}

impl StoreError {
    /// Transient failures that a bounded retry with backoff may clear.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout | Self::QuotaExceeded { .. }
        )
    }

    /// Server-suggested wait before the next call, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Contract of the shared tabular store.
///
/// No operation is atomic with respect to another caller's operation on
/// the same row; `overwrite` unconditionally replaces the whole row.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Adapter name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Append one row at the end of the table.
    async fn append(&self, row: Row) -> Result<(), StoreError>;

    /// Read every row, in table order. Re-enumerated on every call.
    async fn scan(&self) -> Result<Vec<StoredRow>, StoreError>;

    /// Replace the row at `row_ref` with `row`.
    async fn overwrite(&self, row_ref: RowRef, row: Row) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: RowStore + ?Sized> RowStore for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn append(&self, row: Row) -> Result<(), StoreError> {
        (**self).append(row).await
    }

    async fn scan(&self) -> Result<Vec<StoredRow>, StoreError> {
        (**self).scan().await
    }

    async fn overwrite(&self, row_ref: RowRef, row: Row) -> Result<(), StoreError> {
        (**self).overwrite(row_ref, row).await
    }
}
