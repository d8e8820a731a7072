//! In-process row store.
//!
//! Behaves like the shared sheet (append/scan/overwrite, 1-based row
//! positions, no conditional writes) and adds hooks to inject failures
//! and inspect traffic, so the pairing protocol can be exercised without
//! a network.

use super::{Row, RowRef, RowStore, StoreError, StoreOp, StoredRow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe in-memory table.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    rows: Mutex<Vec<Row>>,
    /// Queued one-shot failures per operation kind.
    faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    ops: AtomicU64,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call of `op`. Failures are consumed in
    /// the order they were queued, one per call.
    pub fn inject_failure(&self, op: StoreOp, err: StoreError) {
        self.faults.lock().entry(op).or_default().push_back(err);
    }

    /// Insert a row verbatim, bypassing the codec. Used to simulate foreign
    /// or corrupted rows written by something other than this crate.
    pub fn push_raw(&self, cells: Row) {
        self.rows.lock().push(cells);
    }

    /// Snapshot of the table contents.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().clone()
    }

    /// Number of rows in the table.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Total operations served, including injected failures.
    pub fn operation_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    fn begin(&self, op: StoreOp) -> Result<(), StoreError> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock();
        match faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                tracing::debug!(op = %op, error = %err, "MemoryRowStore: injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, row: Row) -> Result<(), StoreError> {
        self.begin(StoreOp::Append)?;
        self.rows.lock().push(row);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<StoredRow>, StoreError> {
        self.begin(StoreOp::Scan)?;
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, cells)| StoredRow {
                row_ref: RowRef::new(i as u64 + 1),
                cells: cells.clone(),
            })
            .collect())
    }

    async fn overwrite(&self, row_ref: RowRef, row: Row) -> Result<(), StoreError> {
        self.begin(StoreOp::Overwrite)?;
        let mut rows = self.rows.lock();
        let index = usize::try_from(row_ref.position())
            .ok()
            .and_then(|p| p.checked_sub(1))
            .filter(|&i| i < rows.len())
            .ok_or(StoreError::UnknownRow(row_ref))?;
        rows[index] = row;
        Ok(())
    }
}
