//! Coarse row lock
//!
//! An owner-tracked reader/writer lock. Grants are bookkeeping only: the
//! caller identifies itself by transaction id and the lock answers whether
//! the 2PL discipline allows the access. Re-entrant per owner.

use parking_lot::Mutex;
use rill_common::TxnId;
use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
struct RowLockState {
    readers: HashSet<TxnId>,
    writer: Option<TxnId>,
}

/// Per-row reader/writer lock with owner identity.
#[derive(Debug, Default)]
pub struct RowLock {
    state: Mutex<RowLockState>,
}

impl RowLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read grant for `owner`. Fails if another owner holds the
    /// write grant.
    pub fn rlock_by(&self, owner: TxnId) -> bool {
        let mut state = self.state.lock();
        match state.writer {
            Some(writer) if writer != owner => false,
            _ => {
                state.readers.insert(owner);
                true
            }
        }
    }

    /// Acquire the write grant for `owner`. Fails if any other owner holds
    /// a grant.
    pub fn wlock_by(&self, owner: TxnId) -> bool {
        let mut state = self.state.lock();
        if state.writer.is_some_and(|w| w != owner) {
            return false;
        }
        if state.readers.iter().any(|&r| r != owner) {
            return false;
        }
        state.writer = Some(owner);
        true
    }

    /// Release every grant held by `owner`. Returns whether anything was
    /// released.
    pub fn unlock_by(&self, owner: TxnId) -> bool {
        let mut state = self.state.lock();
        let had_read = state.readers.remove(&owner);
        let had_write = state.writer == Some(owner);
        if had_write {
            state.writer = None;
        }
        had_read || had_write
    }

    pub fn is_free(&self) -> bool {
        let state = self.state.lock();
        state.readers.is_empty() && state.writer.is_none()
    }

    /// Deep copy of the current grant state.
    pub fn snapshot(&self) -> RowLock {
        RowLock {
            state: Mutex::new(self.state.lock().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share() {
        let lock = RowLock::new();
        assert!(lock.rlock_by(TxnId::new(1)));
        assert!(lock.rlock_by(TxnId::new(2)));
        assert!(!lock.wlock_by(TxnId::new(3)));
    }

    #[test]
    fn test_writer_excludes() {
        let lock = RowLock::new();
        assert!(lock.wlock_by(TxnId::new(1)));
        assert!(!lock.rlock_by(TxnId::new(2)));
        assert!(!lock.wlock_by(TxnId::new(2)));

        assert!(lock.unlock_by(TxnId::new(1)));
        assert!(lock.wlock_by(TxnId::new(2)));
    }

    #[test]
    fn test_reentrant_upgrade() {
        let lock = RowLock::new();
        let owner = TxnId::new(1);
        assert!(lock.rlock_by(owner));
        assert!(lock.wlock_by(owner));
        assert!(lock.unlock_by(owner));
        assert!(lock.is_free());
    }

    #[test]
    fn test_unlock_without_grant() {
        let lock = RowLock::new();
        assert!(!lock.unlock_by(TxnId::new(9)));
    }
}
