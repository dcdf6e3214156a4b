//! In-memory row substrate for the rill transactional engine
//!
//! Rows pack fixed-width columns into a contiguous buffer and keep var
//! columns dense or sparse. Concurrency disciplines are row variants:
//! coarse and fine (per-column adaptive) locking for 2PL, integer column
//! versions for OCC, and full per-column version history with GC for the
//! read-only fast path. Tables own rows by primary key; the storage
//! transaction layer stages writes and tracks piece acquisition status.

pub mod alock;
pub mod error;
pub mod lock;
pub mod locked_row;
pub mod row;
pub mod schema;
pub mod table;
pub mod txn;
pub mod versioned_row;

pub use alock::{ALock, LockMode, ReqId};
pub use error::{Error, Result};
pub use lock::RowLock;
pub use locked_row::{set_lock_policy, CoarseLockedRow, FineLockedRow};
pub use row::{Row, VarPart};
pub use schema::{Column, ColumnId, Schema};
pub use table::{BasicRow, RowFlavor, StoredRow, Table};
pub use txn::{PieceState, StorageTxn, Txn2Pl, TxnMgr, TxnOcc, TxnUnsafe};
pub use versioned_row::{
    next_version, GcPolicy, MultiVersionedRow, VersionId, VersionedRow,
};
