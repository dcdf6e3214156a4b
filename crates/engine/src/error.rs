//! Error types for the protocol engine

use rill_common::TxnId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] rill_store::Error),

    #[error("transaction not found: {0}")]
    TransactionNotFound(TxnId),

    #[error("dependency graph incomplete: missing vertex for {0}")]
    GraphIncomplete(TxnId),

    #[error("serialization error: {0}")]
    Serialization(String),
}
