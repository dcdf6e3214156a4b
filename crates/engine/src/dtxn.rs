//! Distributed transaction instances
//!
//! One `DTxn` per transaction per server, created by the manager for the
//! configured protocol: dependency-graph deferred commit, or its
//! read-only extension over multi-versioned rows. Deferred pieces are
//! staged at start with their dependency edges recorded; the finish
//! request merges the coordinator's graph fragment and the decision fires
//! once every external ancestor has decided, executing the strongly
//! connected component as a unit in deterministic order.

use crate::cell::CellTable;
use crate::error::{Error, Result};
use crate::graph::{DecideCheck, DepGraph, GraphFragment, TxnStatus};
use crate::registry::{DeferMode, RccPhase, RccScope, RowMap, PieceRun, TxnRegistry};
use crate::runner::TxnRunner;
use parking_lot::Mutex;
use rill_common::{PieceResult, RequestHeader, RunMode, TxnId, TxnOutcome};
use rill_store::VersionId;
use rill_value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A piece staged for execution at decide time.
#[derive(Debug)]
pub struct DeferredRequest {
    pub header: RequestHeader,
    pub inputs: Vec<Value>,
    /// Rows the start phase located; frozen until the apply phase.
    pub row_map: RowMap,
}

/// The coordinator's finish request: outcome plus the assembled
/// dependency-graph fragment for this transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub tid: TxnId,
    pub outcome: TxnOutcome,
    pub graph: GraphFragment,
}

/// Reply to a finish request, released once the decision is reached.
#[derive(Debug, Default)]
pub struct FinishResponse {
    /// Outputs of the deferred pieces, in invocation order.
    pub outputs: Vec<(RequestHeader, Vec<Value>)>,
}

/// Deferred reply continuation for a finish request.
pub type FinishReply = Box<dyn FnOnce(FinishResponse) + Send>;

/// Hook used to request an unknown vertex's subgraph from its owner.
pub type AskSender = Arc<dyn Fn(TxnId) + Send + Sync>;

/// Result of starting a piece.
#[derive(Debug)]
pub enum StartOutcome {
    /// The piece was staged; the reply carries no output yet.
    Deferred,
    /// The piece executed immediately.
    Executed {
        result: PieceResult,
        output: Vec<Value>,
    },
}

/// Result of a read-only piece.
#[derive(Debug)]
pub struct RoOutcome {
    pub result: PieceResult,
    pub output: Vec<Value>,
    /// Last writers of every cell read; the coordinator waits these out.
    pub conflicts: Vec<TxnId>,
}

/// Dependency-graph deferred transaction state.
#[derive(Debug, Default)]
pub struct RccDTxn {
    pub dreqs: Vec<DeferredRequest>,
}

/// Read-only fast-path transaction: RCC plus a snapshot version choice.
#[derive(Debug, Default)]
pub struct Ro6DTxn {
    pub rcc: RccDTxn,
    /// Coordinator-chosen read version for multi-versioned reads.
    pub read_version: Option<VersionId>,
}

/// A per-server distributed transaction instance.
#[derive(Debug)]
pub enum DTxn {
    Rcc(RccDTxn),
    Ro6(Ro6DTxn),
}

impl DTxn {
    pub fn rcc(&self) -> &RccDTxn {
        match self {
            DTxn::Rcc(rcc) => rcc,
            DTxn::Ro6(ro) => &ro.rcc,
        }
    }

    pub fn rcc_mut(&mut self) -> &mut RccDTxn {
        match self {
            DTxn::Rcc(rcc) => rcc,
            DTxn::Ro6(ro) => &mut ro.rcc,
        }
    }

    pub fn read_version(&self) -> Option<VersionId> {
        match self {
            DTxn::Rcc(_) => None,
            DTxn::Ro6(ro) => ro.read_version,
        }
    }
}

struct PendingDecision {
    tid: TxnId,
    reply: Option<FinishReply>,
}

/// Lifecycle map of active distributed transactions, plus the shared
/// dependency state they hang off.
pub struct DTxnMgr {
    mode: RunMode,
    registry: Arc<TxnRegistry>,
    runner: Arc<TxnRunner>,
    graph: Arc<DepGraph>,
    cells: Arc<CellTable>,
    ask: AskSender,
    dtxns: Mutex<HashMap<TxnId, Arc<Mutex<DTxn>>>>,
    pending: Mutex<Vec<PendingDecision>>,
}

impl DTxnMgr {
    pub fn new(mode: RunMode, registry: Arc<TxnRegistry>, runner: Arc<TxnRunner>) -> Self {
        Self {
            mode,
            registry,
            runner,
            graph: Arc::new(DepGraph::new()),
            cells: Arc::new(CellTable::new()),
            ask: Arc::new(|tid| {
                warn!(%tid, "no ask sender configured; graph stays incomplete");
            }),
            dtxns: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Install the hook that requests unknown vertices from their owners.
    pub fn with_ask_sender(mut self, ask: AskSender) -> Self {
        self.ask = ask;
        self
    }

    pub fn graph(&self) -> &Arc<DepGraph> {
        &self.graph
    }

    pub fn cells(&self) -> &Arc<CellTable> {
        &self.cells
    }

    pub fn runner(&self) -> &Arc<TxnRunner> {
        &self.runner
    }

    /// The transaction instance for `tid`, created per the run mode.
    pub fn get_or_create(&self, tid: TxnId) -> Arc<Mutex<DTxn>> {
        self.dtxns
            .lock()
            .entry(tid)
            .or_insert_with(|| {
                let dtxn = match self.mode {
                    RunMode::Rcc => DTxn::Rcc(RccDTxn::default()),
                    RunMode::Rot => DTxn::Ro6(Ro6DTxn::default()),
                    other => panic!("mode {:?} has no deferred transaction instance", other),
                };
                Arc::new(Mutex::new(dtxn))
            })
            .clone()
    }

    pub fn get(&self, tid: TxnId) -> Result<Arc<Mutex<DTxn>>> {
        self.dtxns
            .lock()
            .get(&tid)
            .cloned()
            .ok_or(Error::TransactionNotFound(tid))
    }

    /// Drop a fully acknowledged transaction and its reader claims.
    pub fn destroy(&self, tid: TxnId) -> Result<()> {
        self.dtxns
            .lock()
            .remove(&tid)
            .ok_or(Error::TransactionNotFound(tid))?;
        self.runner.release_claims(tid);
        debug!(%tid, "dtxn destroyed");
        Ok(())
    }

    /// Dispatch a piece. Deferred pieces run their start phase (row
    /// staging and dependency recording) and are queued; immediate pieces
    /// execute with dependency bookkeeping enabled.
    pub fn start(&self, header: &RequestHeader, input: &[Value]) -> Result<StartOutcome> {
        let dtxn_arc = self.get_or_create(header.tid);
        let mut dtxn = dtxn_arc.lock();
        self.graph.touch_vertex(header.tid);

        let defer = self.registry.get(header).defer;
        match defer {
            DeferMode::Real | DeferMode::Fake => {
                let mut dreq = DeferredRequest {
                    header: header.clone(),
                    inputs: input.to_vec(),
                    row_map: RowMap::new(),
                };
                let (result, output) = self.run_piece(
                    header,
                    input,
                    RccPhase::Start,
                    &mut dreq.row_map,
                    Some(header.tid),
                    None,
                    dtxn.read_version(),
                );
                if result != PieceResult::Ok {
                    return Ok(StartOutcome::Executed { result, output });
                }
                dtxn.rcc_mut().dreqs.push(dreq);
                debug!(tid = %header.tid, pid = header.pid, "piece deferred");
                Ok(StartOutcome::Deferred)
            }
            DeferMode::No => {
                let mut row_map = RowMap::new();
                let (result, output) = self.run_piece(
                    header,
                    input,
                    RccPhase::Immediate,
                    &mut row_map,
                    Some(header.tid),
                    None,
                    dtxn.read_version(),
                );
                Ok(StartOutcome::Executed { result, output })
            }
        }
    }

    /// Execute a piece read-only: no vertex, no staging; every cell read
    /// reports its last writer for the coordinator to wait out.
    pub fn start_ro(
        &self,
        header: &RequestHeader,
        input: &[Value],
        read_version: Option<VersionId>,
    ) -> Result<RoOutcome> {
        let dtxn_arc = self.get_or_create(header.tid);
        let mut dtxn = dtxn_arc.lock();
        if let DTxn::Ro6(ro) = &mut *dtxn {
            if read_version.is_some() {
                ro.read_version = read_version;
            }
        }
        let read_version = dtxn.read_version().or(read_version);

        let mut conflicts = Vec::new();
        let mut row_map = RowMap::new();
        let (result, output) = self.run_piece(
            header,
            input,
            RccPhase::Immediate,
            &mut row_map,
            None,
            Some(&mut conflicts),
            read_version,
        );
        conflicts.sort();
        conflicts.dedup();
        Ok(RoOutcome {
            result,
            output,
            conflicts,
        })
    }

    /// Handle the coordinator's finish request. Commit merges the graph
    /// fragment and schedules the decision; the reply fires only after
    /// this transaction's vertex decides and its deferred pieces ran.
    /// Abort discards staged effects and detaches the vertex before any
    /// successor decides.
    pub fn commit(&self, finish: FinishRequest, reply: FinishReply) -> Result<()> {
        let tid = finish.tid;
        self.graph.merge(&finish.graph);

        match finish.outcome {
            TxnOutcome::Abort => {
                if let Ok(dtxn_arc) = self.get(tid) {
                    dtxn_arc.lock().rcc_mut().dreqs.clear();
                }
                self.cells.forget(tid);
                self.graph.detach(tid);
                info!(%tid, "transaction aborted");
                reply(FinishResponse::default());
                // An abort may unblock successors waiting on this vertex.
                self.check_decisions();
                Ok(())
            }
            TxnOutcome::Commit => {
                self.graph.touch_vertex(tid);
                self.graph.advance_status(tid, TxnStatus::FinishRequested);
                self.pending.lock().push(PendingDecision {
                    tid,
                    reply: Some(reply),
                });
                self.check_decisions();
                Ok(())
            }
        }
    }

    /// Request an unknown vertex's subgraph from its owning server.
    pub fn send_ask_req(&self, tid: TxnId) {
        debug!(%tid, "asking owner for subgraph");
        (self.ask)(tid);
    }

    /// A requested subgraph arrived; retry pending decisions.
    pub fn on_ask_reply(&self, fragment: &GraphFragment) {
        self.graph.merge(fragment);
        self.check_decisions();
    }

    /// Try to decide every pending transaction, looping while decisions
    /// cascade.
    fn check_decisions(&self) {
        loop {
            let mut progressed = false;
            let tids: Vec<TxnId> = self.pending.lock().iter().map(|p| p.tid).collect();

            for tid in tids {
                match self.graph.decide_check(tid) {
                    DecideCheck::Unknown { missing } => {
                        for m in missing {
                            self.send_ask_req(m);
                        }
                    }
                    DecideCheck::Undecided { .. } => {}
                    DecideCheck::Ready { scc } => {
                        self.decide_scc(&scc);
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Decide and apply one strongly connected component: members execute
    /// their deferred pieces in ascending transaction id order, then the
    /// finish replies are released.
    fn decide_scc(&self, scc: &[TxnId]) {
        debug!(members = scc.len(), "deciding component");
        for &member in scc {
            self.graph.advance_status(member, TxnStatus::Decided);
        }

        let mut outputs_by: HashMap<TxnId, Vec<(RequestHeader, Vec<Value>)>> = HashMap::new();
        for &member in scc {
            if let Ok(dtxn_arc) = self.get(member) {
                let mut dtxn = dtxn_arc.lock();
                let outputs = self.exe_deferred(dtxn.rcc_mut());
                outputs_by.insert(member, outputs);
            }
            self.graph.advance_status(member, TxnStatus::Applied);
        }

        let mut to_fire: Vec<(FinishReply, FinishResponse)> = Vec::new();
        {
            let mut pending = self.pending.lock();
            for entry in pending.iter_mut() {
                if scc.contains(&entry.tid) {
                    if let Some(reply) = entry.reply.take() {
                        let outputs = outputs_by.remove(&entry.tid).unwrap_or_default();
                        to_fire.push((reply, FinishResponse { outputs }));
                    }
                }
            }
            pending.retain(|entry| entry.reply.is_some());
        }
        for (reply, response) in to_fire {
            reply(response);
        }
    }

    /// Run the staged pieces of one transaction in invocation order with
    /// their frozen row maps, collecting per-piece outputs.
    fn exe_deferred(&self, rcc: &mut RccDTxn) -> Vec<(RequestHeader, Vec<Value>)> {
        let mut outputs = Vec::new();
        for dreq in rcc.dreqs.iter_mut() {
            let defer = self.registry.get(&dreq.header).defer;
            let (result, output) = match defer {
                DeferMode::Fake => (PieceResult::Ok, Vec::new()),
                _ => self.run_piece(
                    &dreq.header,
                    &dreq.inputs,
                    RccPhase::Apply,
                    &mut dreq.row_map,
                    None,
                    None,
                    None,
                ),
            };
            if result != PieceResult::Ok {
                warn!(tid = %dreq.header.tid, pid = dreq.header.pid, ?result,
                      "deferred piece failed at apply");
            }
            outputs.push((dreq.header.clone(), output));
        }
        rcc.dreqs.clear();
        outputs
    }

    #[allow(clippy::too_many_arguments)]
    fn run_piece(
        &self,
        header: &RequestHeader,
        input: &[Value],
        phase: RccPhase,
        row_map: &mut RowMap,
        tv: Option<TxnId>,
        ro_conflicts: Option<&mut Vec<TxnId>>,
        read_version: Option<VersionId>,
    ) -> (PieceResult, Vec<Value>) {
        let def = self.registry.get(header);
        let scope = RccScope {
            phase,
            row_map,
            tv,
            graph: self.graph.as_ref(),
            cells: self.cells.as_ref(),
            ro_conflicts,
            read_version,
        };
        let mut run = PieceRun {
            header,
            input,
            output: Vec::new(),
            rcc: Some(scope),
        };
        let result = (def.handler)(&mut run);
        (result, run.output)
    }
}
