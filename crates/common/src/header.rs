//! Piece invocation header
//!
//! Every piece dispatched by the coordinator carries this header; the
//! registry key is `(t_type, p_type)` and the rest identifies the runtime
//! invocation.

use crate::TxnId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction type, the first half of a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnType(pub i32);

/// Piece type, the second half of a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceType(pub i32);

/// Server (shard) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub i32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Header attached to every piece invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Transaction type.
    pub t_type: TxnType,
    /// Piece type within the transaction.
    pub p_type: PieceType,
    /// The enclosing distributed transaction.
    pub tid: TxnId,
    /// The shard this piece was dispatched to.
    pub sid: ServerId,
    /// Piece instance id, unique within the transaction.
    pub pid: u32,
}

impl RequestHeader {
    pub fn new(t_type: TxnType, p_type: PieceType, tid: TxnId, sid: ServerId, pid: u32) -> Self {
        Self {
            t_type,
            p_type,
            tid,
            sid,
            pid,
        }
    }
}
