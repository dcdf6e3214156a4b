//! Result codes
//!
//! Pieces and transactions report outcomes as tagged codes rather than
//! errors; only protocol-invariant violations abort the process.

use serde::{Deserialize, Serialize};

/// Outcome of a single piece execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceResult {
    /// Piece executed successfully.
    Ok,
    /// Piece was denied (lock conflict, wound); the transaction aborts.
    Reject,
    /// A versioned read could not be served; retry with a newer snapshot.
    StaleVersion,
    /// Unexpected internal failure.
    Internal,
}

impl PieceResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, PieceResult::Ok)
    }
}

/// Final outcome of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOutcome {
    Commit,
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_result_ok() {
        assert!(PieceResult::Ok.is_ok());
        assert!(!PieceResult::Reject.is_ok());
        assert!(!PieceResult::StaleVersion.is_ok());
    }
}
