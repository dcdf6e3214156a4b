//! Transaction identifier
//!
//! A plain 64-bit id assigned by the coordinator. Smaller ids are older,
//! which is all the lock schedulers need for wait-die and wound-die
//! priority decisions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier with a deterministic total order.
///
/// The id doubles as the lock priority: a transaction with a smaller id
/// is older and wins priority contests under wait-die and wound-die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this transaction outranks `other` in lock priority.
    pub fn is_older_than(&self, other: TxnId) -> bool {
        self.0 < other.0
    }
}

impl From<u64> for TxnId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_matches_age() {
        let older = TxnId::new(100);
        let younger = TxnId::new(200);

        assert!(older < younger);
        assert!(older.is_older_than(younger));
        assert!(!younger.is_older_than(older));
        assert!(!older.is_older_than(older));
    }

    #[test]
    fn test_hash_eq_consistency() {
        use std::collections::HashMap;

        let id = TxnId::new(42);
        let copy = id;

        let mut map = HashMap::new();
        map.insert(id, "value");
        assert_eq!(map.get(&copy), Some(&"value"));
    }
}
