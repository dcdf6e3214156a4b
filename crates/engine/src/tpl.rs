//! 2PL execution helpers
//!
//! The immediate path for pieces running under two-phase locking: lock
//! requests are registered for the piece's whole access set, the body runs
//! once every grant arrives, and any denial releases what was already
//! granted and rejects the piece. Piece acquisition status accumulates in
//! the storage transaction; prepare succeeds only when every piece
//! reported acquired.

use crate::error::{Error, Result};
use crate::runner::TxnRunner;
use parking_lot::Mutex;
use rill_common::{PieceResult, RequestHeader, TxnId, TxnOutcome};
use rill_store::{ColumnId, Error as StoreError, LockMode, ReqId, StorageTxn, StoredRow, Txn2Pl};
use rill_value::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// One cell the piece will touch, with the lock mode it needs.
pub struct AccessEntry {
    pub row: Arc<dyn StoredRow>,
    pub column: ColumnId,
    pub mode: LockMode,
}

/// The piece body: runs under all granted locks with the storage
/// transaction for staging writes.
pub type PieceBody =
    Arc<dyn Fn(&RequestHeader, &[Value], &mut Txn2Pl) -> (PieceResult, Vec<Value>) + Send + Sync>;

/// Completion continuation for the piece reply.
pub type PieceDone = Box<dyn FnOnce(PieceResult, Vec<Value>) + Send>;

struct SuccessCtx {
    runner: Arc<TxnRunner>,
    header: RequestHeader,
    input: Vec<Value>,
    body: PieceBody,
}

struct Acquire {
    remaining: usize,
    failed: bool,
    granted: Vec<(Arc<dyn StoredRow>, ColumnId, ReqId)>,
    ctx: Option<SuccessCtx>,
    done: Option<PieceDone>,
}

/// Two-phase-locking callback factories.
pub struct Tpl;

/// OCC shares the piece-status machinery; validation happens in the
/// storage transaction at prepare.
pub type Occ = Tpl;

impl Tpl {
    /// Run one piece under 2PL: enqueue lock requests for the access set,
    /// invoke the body when fully acquired, reject on any denial.
    pub fn execute_piece(
        runner: &Arc<TxnRunner>,
        header: RequestHeader,
        input: Vec<Value>,
        access: Vec<AccessEntry>,
        body: PieceBody,
        done: PieceDone,
    ) {
        let tid = header.tid;
        let pid = header.pid;
        {
            let txn_arc = runner.get_txn(tid);
            let mut txn = txn_arc.lock();
            txn.as_two_pl_mut()
                .expect("2PL execution requires the two-pl run mode")
                .piece_begin(pid);
        }

        let ctx = SuccessCtx {
            runner: runner.clone(),
            header,
            input,
            body,
        };
        if access.is_empty() {
            Self::on_all_acquired(ctx, Vec::new(), done);
            return;
        }

        let state = Arc::new(Mutex::new(Acquire {
            remaining: access.len(),
            failed: false,
            granted: Vec::new(),
            ctx: Some(ctx),
            done: Some(done),
        }));

        for entry in access {
            let AccessEntry { row, column, mode } = entry;
            let fine = row
                .as_fine()
                .expect("2PL execution requires fine-locked rows");

            let grant_state = state.clone();
            let grant_row = row.clone();
            let on_grant = move |req: ReqId| {
                let mut st = grant_state.lock();
                if st.failed {
                    // The piece was already denied; hand the grant back.
                    drop(st);
                    if let Some(fine) = grant_row.as_fine() {
                        fine.unlock_column_by(column, req);
                    }
                    return;
                }
                st.granted.push((grant_row.clone(), column, req));
                st.remaining -= 1;
                if st.remaining == 0 {
                    let ctx = st.ctx.take().expect("success context present");
                    let done = st.done.take().expect("done continuation present");
                    let granted = std::mem::take(&mut st.granted);
                    drop(st);
                    Tpl::on_all_acquired(ctx, granted, done);
                }
            };

            let fail_state = state.clone();
            let wound_runner = runner.clone();
            let on_fail = move |reason: StoreError| {
                let mut st = fail_state.lock();
                if st.failed {
                    return;
                }
                st.failed = true;
                let granted = std::mem::take(&mut st.granted);
                let ctx = st.ctx.take();
                let done = st.done.take();
                drop(st);
                match (ctx, done) {
                    (Some(ctx), Some(done)) => Tpl::on_denied(ctx, granted, reason, done),
                    // Wounded after the piece completed: release
                    // everything and fail the transaction at prepare.
                    _ => {
                        for (row, col, req) in granted {
                            if let Some(fine) = row.as_fine() {
                                fine.unlock_column_by(col, req);
                            }
                        }
                        let txn_arc = wound_runner.get_txn(tid);
                        let mut txn = txn_arc.lock();
                        if let Some(two_pl) = txn.as_two_pl_mut() {
                            two_pl.piece_aborted(pid);
                            two_pl.release_locks();
                        }
                        warn!(%tid, pid, %reason, "piece preempted after completion");
                    }
                }
            };

            match mode {
                LockMode::Write => fine.reg_wlock(column, tid, on_grant, on_fail),
                LockMode::Read => fine.reg_rlock(column, tid, on_grant, on_fail),
            };
        }
    }

    /// All locks granted: record them, run the body, mark the piece.
    fn on_all_acquired(
        ctx: SuccessCtx,
        granted: Vec<(Arc<dyn StoredRow>, ColumnId, ReqId)>,
        done: PieceDone,
    ) {
        let txn_arc = ctx.runner.get_txn(ctx.header.tid);
        let mut txn = txn_arc.lock();
        let two_pl = txn
            .as_two_pl_mut()
            .expect("2PL execution requires the two-pl run mode");
        for (row, column, req) in granted {
            two_pl.record_lock(row, column, req);
        }

        let (result, output) = (ctx.body)(&ctx.header, &ctx.input, two_pl);
        if result == PieceResult::Ok {
            two_pl.piece_acquired(ctx.header.pid);
            debug!(tid = %ctx.header.tid, pid = ctx.header.pid, "piece acquired");
        } else {
            two_pl.piece_aborted(ctx.header.pid);
        }
        drop(txn);
        done(result, output);
    }

    /// A lock was denied or the transaction was wounded: release partial
    /// grants and everything the transaction already holds, then reject.
    fn on_denied(
        ctx: SuccessCtx,
        granted: Vec<(Arc<dyn StoredRow>, ColumnId, ReqId)>,
        reason: StoreError,
        done: PieceDone,
    ) {
        for (row, column, req) in granted {
            if let Some(fine) = row.as_fine() {
                fine.unlock_column_by(column, req);
            }
        }
        {
            let txn_arc = ctx.runner.get_txn(ctx.header.tid);
            let mut txn = txn_arc.lock();
            if let Some(two_pl) = txn.as_two_pl_mut() {
                two_pl.piece_aborted(ctx.header.pid);
                two_pl.release_locks();
            }
        }
        warn!(tid = %ctx.header.tid, pid = ctx.header.pid, %reason,
              "piece denied, locks released");
        done(PieceResult::Reject, Vec::new());
    }

    /// 2PC prepare: commit only if every piece acquired (2PL) or the read
    /// set validates (OCC).
    pub fn do_prepare(runner: &TxnRunner, tid: TxnId) -> Result<TxnOutcome> {
        let txn_arc = runner
            .lookup_txn(tid)
            .ok_or(Error::TransactionNotFound(tid))?;
        let mut txn = txn_arc.lock();
        let outcome = match &mut *txn {
            StorageTxn::TwoPl(two_pl) => {
                if two_pl.all_pieces_acquired() {
                    TxnOutcome::Commit
                } else {
                    TxnOutcome::Abort
                }
            }
            StorageTxn::Occ(occ) => {
                if occ.validate() {
                    TxnOutcome::Commit
                } else {
                    TxnOutcome::Abort
                }
            }
            StorageTxn::Unsafe(_) => TxnOutcome::Commit,
        };
        debug!(%tid, ?outcome, "prepare");
        Ok(outcome)
    }

    /// Apply staged writes and release all locks.
    pub fn do_commit(runner: &TxnRunner, tid: TxnId) -> Result<()> {
        let txn_arc = runner.del_txn(tid)?;
        let mut txn = txn_arc.lock();
        txn.commit()?;
        Ok(())
    }

    /// Discard staged writes and release all locks.
    pub fn do_abort(runner: &TxnRunner, tid: TxnId) -> Result<()> {
        let txn_arc = runner.del_txn(tid)?;
        txn_arc.lock().abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_common::{EngineConfig, PieceType, RunMode, ServerId, TxnType};
    use rill_store::{Column, Schema};
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

    fn header(tid: u64, pid: u32) -> RequestHeader {
        RequestHeader::new(TxnType(1), PieceType(1), TxnId::new(tid), ServerId(0), pid)
    }

    fn two_pl_runner() -> (Arc<TxnRunner>, Arc<dyn StoredRow>) {
        let runner = Arc::new(TxnRunner::init(&EngineConfig::new(RunMode::TwoPl)));
        let table = runner.reg_table("accounts", schema()).unwrap();
        let row = table
            .insert_values(&[Value::I64(1), Value::I64(100)])
            .unwrap();
        (runner, row)
    }

    type ReplySlot = Arc<Mutex<Option<(PieceResult, Vec<Value>)>>>;

    fn capture() -> (ReplySlot, PieceDone) {
        let slot: ReplySlot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let done = Box::new(move |result, output| {
            *sink.lock() = Some((result, output));
        });
        (slot, done)
    }

    #[test]
    fn test_empty_access_set_runs_body_immediately() {
        let (runner, row) = two_pl_runner();
        let (slot, done) = capture();
        let body_row = row.clone();

        Tpl::execute_piece(
            &runner,
            header(10, 0),
            vec![],
            vec![],
            Arc::new(move |_header, _input, txn: &mut Txn2Pl| {
                txn.stage_write(body_row.clone(), 1, Value::I64(7));
                (PieceResult::Ok, vec![])
            }),
            done,
        );

        assert_eq!(slot.lock().as_ref().unwrap().0, PieceResult::Ok);
        assert_eq!(
            Tpl::do_prepare(&runner, TxnId::new(10)).unwrap(),
            TxnOutcome::Commit
        );
        Tpl::do_commit(&runner, TxnId::new(10)).unwrap();
        assert_eq!(row.get_column(1).unwrap(), Value::I64(7));
    }

    #[test]
    fn test_denied_piece_fails_prepare() {
        let (runner, row) = two_pl_runner();
        let fine = row.as_fine().unwrap();

        // An older transaction holds the column the piece needs.
        let blocker_req = fine.reg_wlock(1, TxnId::new(5), |_| {}, |_| {});
        let (slot, done) = capture();
        Tpl::execute_piece(
            &runner,
            header(10, 0),
            vec![],
            vec![AccessEntry {
                row: row.clone(),
                column: 1,
                mode: LockMode::Write,
            }],
            Arc::new(|_, _, _| (PieceResult::Ok, vec![])),
            done,
        );

        assert_eq!(slot.lock().as_ref().unwrap().0, PieceResult::Reject);
        assert_eq!(
            Tpl::do_prepare(&runner, TxnId::new(10)).unwrap(),
            TxnOutcome::Abort
        );
        Tpl::do_abort(&runner, TxnId::new(10)).unwrap();
        assert!(fine.alock(1).is_held(blocker_req));
        fine.unlock_column_by(1, blocker_req);
    }

    #[test]
    fn test_prepare_without_txn_errors() {
        let runner = Arc::new(TxnRunner::init(&EngineConfig::new(RunMode::Rcc)));
        assert!(matches!(
            Tpl::do_prepare(&runner, TxnId::new(9)),
            Err(Error::TransactionNotFound(_))
        ));

        // Pass-through transactions always prepare to commit.
        runner.get_txn(TxnId::new(9));
        assert_eq!(
            Tpl::do_prepare(&runner, TxnId::new(9)).unwrap(),
            TxnOutcome::Commit
        );
    }
}
