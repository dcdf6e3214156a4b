//! Error types for the storage substrate

use rill_common::TxnId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Schema errors
    #[error("schema error: {0}")]
    Schema(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("column id out of range: {0}")]
    ColumnIdOutOfRange(usize),

    // Row errors
    #[error("column kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: rill_value::ValueKind,
        found: rill_value::ValueKind,
    },

    #[error("row is readonly")]
    ReadonlyRow,

    #[error("row serialization error: {0}")]
    Serialization(String),

    #[error("value codec error: {0}")]
    Codec(#[from] rill_value::codec::Error),

    // Table errors
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    DuplicateTable(String),

    #[error("duplicate key in table {0}")]
    DuplicateKey(String),

    // Concurrency errors
    #[error("lock denied")]
    LockDenied,

    #[error("transaction wounded by {by}")]
    Wounded { by: TxnId },

    #[error("lock acquisition timeout")]
    LockTimeout,

    #[error("stale version {requested} on column {column}")]
    StaleVersion { column: usize, requested: u64 },

    #[error("transaction not found: {0}")]
    TransactionNotFound(TxnId),

    #[error("validation failed for transaction {0}")]
    ValidationFailed(TxnId),
}
