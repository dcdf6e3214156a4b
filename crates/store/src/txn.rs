//! Storage-layer transactions
//!
//! Per-tid handles over the row substrate. Under 2PL a transaction stages
//! its writes and carries a ledger of held column locks plus per-piece
//! acquisition status; under OCC it captures read versions for prepare-time
//! validation; under the deferred protocols it accesses rows directly and
//! the protocol layer owns staging.

use crate::alock::ReqId;
use crate::error::{Error, Result};
use crate::schema::ColumnId;
use crate::table::StoredRow;
use crate::versioned_row::VersionedRow;
use rill_common::{RunMode, TxnId};
use rill_value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Acquisition status of one piece of a 2PL transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceState {
    /// Lock acquisition in flight.
    Pending,
    /// All locks granted, body executed.
    Acquired,
    /// Denied or wounded; the transaction must abort.
    Aborted,
}

/// One granted column lock, remembered for release.
#[derive(Debug)]
pub struct HeldLock {
    pub row: Arc<dyn StoredRow>,
    pub column: ColumnId,
    pub req: ReqId,
}

/// One write buffered until commit.
#[derive(Debug)]
pub struct StagedWrite {
    pub row: Arc<dyn StoredRow>,
    pub column: ColumnId,
    pub value: Value,
}

/// A two-phase-locking storage transaction.
#[derive(Debug)]
pub struct Txn2Pl {
    tid: TxnId,
    held: Vec<HeldLock>,
    staged: Vec<StagedWrite>,
    pieces: HashMap<u32, PieceState>,
}

impl Txn2Pl {
    pub fn new(tid: TxnId) -> Self {
        Self {
            tid,
            held: Vec::new(),
            staged: Vec::new(),
            pieces: HashMap::new(),
        }
    }

    pub fn tid(&self) -> TxnId {
        self.tid
    }

    pub fn piece_begin(&mut self, pid: u32) {
        self.pieces.insert(pid, PieceState::Pending);
    }

    pub fn piece_acquired(&mut self, pid: u32) {
        self.pieces.insert(pid, PieceState::Acquired);
    }

    pub fn piece_aborted(&mut self, pid: u32) {
        self.pieces.insert(pid, PieceState::Aborted);
    }

    pub fn piece_state(&self, pid: u32) -> Option<PieceState> {
        self.pieces.get(&pid).copied()
    }

    /// Commit is allowed only when every piece reported acquired.
    pub fn all_pieces_acquired(&self) -> bool {
        !self.pieces.is_empty()
            && self
                .pieces
                .values()
                .all(|state| *state == PieceState::Acquired)
    }

    pub fn record_lock(&mut self, row: Arc<dyn StoredRow>, column: ColumnId, req: ReqId) {
        self.held.push(HeldLock { row, column, req });
    }

    pub fn stage_write(&mut self, row: Arc<dyn StoredRow>, column: ColumnId, value: Value) {
        self.staged.push(StagedWrite { row, column, value });
    }

    pub fn staged(&self) -> &[StagedWrite] {
        &self.staged
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Release every held column lock.
    pub fn release_locks(&mut self) {
        for held in self.held.drain(..) {
            if let Some(fine) = held.row.as_fine() {
                fine.unlock_column_by(held.column, held.req);
            }
        }
    }

    /// Apply staged writes, then release all locks.
    pub fn commit(&mut self) -> Result<()> {
        debug!(tid = %self.tid, writes = self.staged.len(), "2pl commit");
        let staged = std::mem::take(&mut self.staged);
        let mut result = Ok(());
        for write in staged {
            if let Err(e) = write.row.update(write.column, &write.value) {
                result = Err(e);
                break;
            }
        }
        self.release_locks();
        result
    }

    /// Discard staged writes and release all locks.
    pub fn abort(&mut self) {
        debug!(tid = %self.tid, "2pl abort");
        self.staged.clear();
        self.release_locks();
    }
}

/// An optimistic storage transaction over versioned rows.
#[derive(Debug)]
pub struct TxnOcc {
    tid: TxnId,
    reads: Vec<(Arc<VersionedRow>, ColumnId, u64)>,
    staged: Vec<(Arc<VersionedRow>, ColumnId, Value)>,
}

impl TxnOcc {
    pub fn new(tid: TxnId) -> Self {
        Self {
            tid,
            reads: Vec::new(),
            staged: Vec::new(),
        }
    }

    pub fn tid(&self) -> TxnId {
        self.tid
    }

    /// Read a column, capturing its version for prepare-time validation.
    pub fn read_column(&mut self, row: &Arc<VersionedRow>, column: ColumnId) -> Result<Value> {
        let value = row.get_column(column)?;
        let ver = row.column_ver(column)?;
        self.reads.push((row.clone(), column, ver));
        Ok(value)
    }

    pub fn stage_write(&mut self, row: Arc<VersionedRow>, column: ColumnId, value: Value) {
        self.staged.push((row, column, value));
    }

    /// Every captured read version must still be current.
    pub fn validate(&self) -> bool {
        self.reads.iter().all(|(row, column, ver)| {
            row.column_ver(*column)
                .map(|current| current == *ver)
                .unwrap_or(false)
        })
    }

    /// Apply staged writes and publish them by bumping column versions.
    pub fn commit(&mut self) -> Result<()> {
        if !self.validate() {
            return Err(Error::ValidationFailed(self.tid));
        }
        debug!(tid = %self.tid, writes = self.staged.len(), "occ commit");
        for (row, column, value) in self.staged.drain(..) {
            row.update(column, &value)?;
            row.incr_column_ver(column)?;
        }
        self.reads.clear();
        Ok(())
    }

    pub fn abort(&mut self) {
        debug!(tid = %self.tid, "occ abort");
        self.staged.clear();
        self.reads.clear();
    }
}

/// A pass-through handle for the deferred protocols: the dependency layer
/// does its own staging, so storage access is direct.
#[derive(Debug)]
pub struct TxnUnsafe {
    tid: TxnId,
}

impl TxnUnsafe {
    pub fn new(tid: TxnId) -> Self {
        Self { tid }
    }

    pub fn tid(&self) -> TxnId {
        self.tid
    }

    pub fn read_column(&self, row: &Arc<dyn StoredRow>, column: ColumnId) -> Result<Value> {
        row.get_column(column)
    }

    pub fn write_column(
        &self,
        row: &Arc<dyn StoredRow>,
        column: ColumnId,
        value: &Value,
    ) -> Result<()> {
        row.update(column, value)
    }
}

/// Per-tid storage transaction of the mode's flavor.
#[derive(Debug)]
pub enum StorageTxn {
    Unsafe(TxnUnsafe),
    TwoPl(Txn2Pl),
    Occ(TxnOcc),
}

impl StorageTxn {
    pub fn tid(&self) -> TxnId {
        match self {
            StorageTxn::Unsafe(t) => t.tid(),
            StorageTxn::TwoPl(t) => t.tid(),
            StorageTxn::Occ(t) => t.tid(),
        }
    }

    pub fn as_two_pl_mut(&mut self) -> Option<&mut Txn2Pl> {
        match self {
            StorageTxn::TwoPl(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_occ_mut(&mut self) -> Option<&mut TxnOcc> {
        match self {
            StorageTxn::Occ(t) => Some(t),
            _ => None,
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        match self {
            StorageTxn::Unsafe(_) => Ok(()),
            StorageTxn::TwoPl(t) => t.commit(),
            StorageTxn::Occ(t) => t.commit(),
        }
    }

    pub fn abort(&mut self) {
        match self {
            StorageTxn::Unsafe(_) => {}
            StorageTxn::TwoPl(t) => t.abort(),
            StorageTxn::Occ(t) => t.abort(),
        }
    }
}

/// Creates storage transactions of the flavor the run mode requires.
#[derive(Debug, Clone, Copy)]
pub struct TxnMgr {
    mode: RunMode,
}

impl TxnMgr {
    pub fn new(mode: RunMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn start(&self, tid: TxnId) -> StorageTxn {
        match self.mode {
            RunMode::TwoPl => StorageTxn::TwoPl(Txn2Pl::new(tid)),
            RunMode::Occ => StorageTxn::Occ(TxnOcc::new(tid)),
            RunMode::Rcc | RunMode::Rot => StorageTxn::Unsafe(TxnUnsafe::new(tid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Schema};
    use crate::table::{RowFlavor, Table};
    use rill_value::ValueKind;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                Column::new("id", ValueKind::I64).primary_key(),
                Column::new("bal", ValueKind::I64),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_2pl_commit_applies_staged_writes() {
        let table = Table::new("accounts", schema(), RowFlavor::Fine);
        let row = table
            .insert_values(&[Value::I64(1), Value::I64(100)])
            .unwrap();

        let mut txn = Txn2Pl::new(TxnId::new(10));
        txn.piece_begin(0);
        txn.stage_write(row.clone(), 1, Value::I64(150));
        txn.piece_acquired(0);
        assert!(txn.all_pieces_acquired());

        // Read-your-staged is not provided; the row still holds the old
        // value until commit.
        assert_eq!(row.get_column(1).unwrap(), Value::I64(100));
        txn.commit().unwrap();
        assert_eq!(row.get_column(1).unwrap(), Value::I64(150));
    }

    #[test]
    fn test_2pl_abort_discards_and_releases() {
        let table = Table::new("accounts", schema(), RowFlavor::Fine);
        let row = table
            .insert_values(&[Value::I64(1), Value::I64(100)])
            .unwrap();
        let fine = row.as_fine().unwrap();

        let owner = TxnId::new(10);
        let mut txn = Txn2Pl::new(owner);
        let req = fine.reg_wlock(1, owner, |_| {}, |_| {});
        assert!(fine.alock(1).is_held(req));
        txn.record_lock(row.clone(), 1, req);
        txn.stage_write(row.clone(), 1, Value::I64(999));

        txn.abort();
        assert_eq!(row.get_column(1).unwrap(), Value::I64(100));
        assert!(!fine.alock(1).is_held(req));
        assert_eq!(txn.held_count(), 0);
    }

    #[test]
    fn test_occ_validate_and_commit() {
        let row = Arc::new(
            VersionedRow::create(schema(), &[Value::I64(1), Value::I64(100)]).unwrap(),
        );

        let mut txn = TxnOcc::new(TxnId::new(20));
        let value = txn.read_column(&row, 1).unwrap();
        assert_eq!(value, Value::I64(100));
        txn.stage_write(row.clone(), 1, Value::I64(200));
        assert!(txn.validate());
        txn.commit().unwrap();
        assert_eq!(row.get_column(1).unwrap(), Value::I64(200));
        assert_eq!(row.column_ver(1).unwrap(), 1);
    }

    #[test]
    fn test_occ_validation_fails_on_concurrent_write() {
        let row = Arc::new(
            VersionedRow::create(schema(), &[Value::I64(1), Value::I64(100)]).unwrap(),
        );

        let mut txn = TxnOcc::new(TxnId::new(20));
        txn.read_column(&row, 1).unwrap();
        txn.stage_write(row.clone(), 1, Value::I64(200));

        // A concurrent writer publishes first.
        row.update(1, &Value::I64(111)).unwrap();
        row.incr_column_ver(1).unwrap();

        assert!(!txn.validate());
        assert!(matches!(txn.commit(), Err(Error::ValidationFailed(_))));
    }

    #[test]
    fn test_mgr_selects_flavor() {
        assert!(matches!(
            TxnMgr::new(RunMode::TwoPl).start(TxnId::new(1)),
            StorageTxn::TwoPl(_)
        ));
        assert!(matches!(
            TxnMgr::new(RunMode::Occ).start(TxnId::new(1)),
            StorageTxn::Occ(_)
        ));
        assert!(matches!(
            TxnMgr::new(RunMode::Rcc).start(TxnId::new(1)),
            StorageTxn::Unsafe(_)
        ));
        assert!(matches!(
            TxnMgr::new(RunMode::Rot).start(TxnId::new(1)),
            StorageTxn::Unsafe(_)
        ));
    }
}
