//! Protocol engine for rill
//!
//! Binds pre-declared transaction handlers to runtime piece invocations
//! and runs them under the configured concurrency-control protocol:
//! dependency-graph deferred commit with a read-only fast path over
//! multi-versioned rows, or two-phase locking / optimistic validation on
//! the immediate path. Waiting is always expressed as a registered
//! continuation; nothing in the engine blocks a worker thread.

pub mod cell;
pub mod dtxn;
pub mod error;
pub mod graph;
pub mod registry;
pub mod runner;
pub mod tpl;

pub use cell::{CellEntry, CellLocator, CellTable};
pub use dtxn::{
    AskSender, DTxn, DTxnMgr, DeferredRequest, FinishReply, FinishRequest, FinishResponse,
    RccDTxn, Ro6DTxn, RoOutcome, StartOutcome,
};
pub use error::{Error, Result};
pub use graph::{DecideCheck, DepGraph, EdgeKind, GraphFragment, TxnInfo, TxnStatus};
pub use registry::{
    DeferMode, PieceDef, PieceRun, RccPhase, RccScope, RowMap, TxnHandler, TxnRegistry,
};
pub use runner::{PrepareEntry, TxnRunner};
pub use tpl::{AccessEntry, Occ, PieceBody, PieceDone, Tpl};
