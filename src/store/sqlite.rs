//! SQLite-backed row store.
//!
//! Gives two processes on the same host (e.g. two terminals acting as the
//! primary and the secondary device) one shared "sheet". Only the
//! append/scan/overwrite contract is exposed: the pairing protocol must
//! work against stores without conditional writes, so this adapter does
//! not offer any even though SQLite could.
//!
//! Tables:
//! - `sheet_rows`: position (row handle), sheet name, cells as a JSON array
//!
//! A row whose `cells` is not a JSON text array is scanned as a row with no
//! cells, so one hand-edited row is skipped by readers like any other
//! malformed row instead of failing every scan.

use super::{Row, RowRef, RowStore, StoreError, StoredRow};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;

/// Row store persisted in a SQLite file.
pub struct SqliteRowStore {
    conn: Mutex<rusqlite::Connection>,
    sheet: String,
}

impl SqliteRowStore {
    /// Open (or create) a file-backed store. Every process pointing at the
    /// same file and sheet sees the same rows.
    pub fn open(db_path: &Path, sheet: &str) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(db_path)
            .with_context(|| format!("Failed to open row store at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            sheet: sheet.to_string(),
        })
    }

    /// Create an in-memory store (for tests).
    pub fn open_in_memory(sheet: &str) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            sheet: sheet.to_string(),
        })
    }

    fn init_tables(conn: &rusqlite::Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sheet_rows (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                sheet TEXT NOT NULL,
                cells TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sheet_rows_sheet ON sheet_rows(sheet);",
        )
        .context("Failed to initialize sheet_rows table")?;
        Ok(())
    }

    /// Sheet name this store reads and writes.
    pub fn sheet(&self) -> &str {
        &self.sheet
    }
}

/// Map SQLite failures onto the store taxonomy. Lock contention from the
/// other device's process is transient; everything else is still reported
/// as unavailable so bounded retries apply.
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Unavailable(format!("database busy: {err}"))
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn encode_cells(row: &Row) -> Result<String, StoreError> {
    serde_json::to_string(row).map_err(|e| StoreError::Malformed(e.to_string()))
}

#[async_trait]
impl RowStore for SqliteRowStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, row: Row) -> Result<(), StoreError> {
        let cells = encode_cells(&row)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sheet_rows (sheet, cells) VALUES (?1, ?2)",
            rusqlite::params![self.sheet, cells],
        )
        .map_err(classify)?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<StoredRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT position, cells FROM sheet_rows WHERE sheet = ?1 ORDER BY position")
            .map_err(classify)?;
        let raw = stmt
            .query_map(rusqlite::params![self.sheet], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        raw.into_iter()
            .map(|(position, cells)| {
                let cells: Row = serde_json::from_str(&cells).unwrap_or_else(|e| {
                    tracing::warn!(row = position, error = %e, "Row cells are not a text array");
                    Row::new()
                });
                let position = u64::try_from(position)
                    .map_err(|_| StoreError::Malformed(format!("negative row position {position}")))?;
                Ok(StoredRow {
                    row_ref: RowRef::new(position),
                    cells,
                })
            })
            .collect()
    }

    async fn overwrite(&self, row_ref: RowRef, row: Row) -> Result<(), StoreError> {
        let cells = encode_cells(&row)?;
        let position =
            i64::try_from(row_ref.position()).map_err(|_| StoreError::UnknownRow(row_ref))?;
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE sheet_rows SET cells = ?1 WHERE position = ?2 AND sheet = ?3",
                rusqlite::params![cells, position, self.sheet],
            )
            .map_err(classify)?;
        if updated == 0 {
            return Err(StoreError::UnknownRow(row_ref));
        }
        Ok(())
    }
}
