//! Locked row variants
//!
//! `CoarseLockedRow` guards the whole row with one owner-tracked RW lock;
//! `FineLockedRow` carries one adaptive lock per column. The adaptive lock
//! policy is process-wide configuration, fixed before the first fine-locked
//! row is created and immutable afterwards.

use crate::alock::{ALock, ReqId};
use crate::error::{Error, Result};
use crate::lock::RowLock;
use crate::row::Row;
use crate::schema::{ColumnId, Schema};
use parking_lot::RwLock;
use rill_common::{LockPolicy, TxnId};
use rill_value::{MultiValue, Value};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

static TYPE_2PL: OnceLock<(LockPolicy, Duration)> = OnceLock::new();

/// Fix the process-wide adaptive lock policy. Must be called before the
/// first fine-locked row is created; calling again with a different
/// selection is a bug.
pub fn set_lock_policy(policy: LockPolicy, timeout: Duration) {
    let fixed = TYPE_2PL.get_or_init(|| (policy, timeout));
    assert_eq!(
        *fixed,
        (policy, timeout),
        "adaptive lock policy is process-wide and already fixed"
    );
}

fn lock_policy() -> (LockPolicy, Duration) {
    *TYPE_2PL.get_or_init(|| (LockPolicy::WaitDie, DEFAULT_LOCK_TIMEOUT))
}

/// A row protected by a single owner-tracked RW lock.
#[derive(Debug)]
pub struct CoarseLockedRow {
    inner: RwLock<Row>,
    lock: RowLock,
}

impl CoarseLockedRow {
    pub fn create(schema: Arc<Schema>, values: &[Value]) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(Row::create(schema, values)?),
            lock: RowLock::new(),
        })
    }

    pub fn from_row(row: Row) -> Self {
        Self {
            inner: RwLock::new(row),
            lock: RowLock::new(),
        }
    }

    pub fn rlock_row_by(&self, owner: TxnId) -> bool {
        self.lock.rlock_by(owner)
    }

    pub fn wlock_row_by(&self, owner: TxnId) -> bool {
        self.lock.wlock_by(owner)
    }

    pub fn unlock_row_by(&self, owner: TxnId) -> bool {
        self.lock.unlock_by(owner)
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Value> {
        self.inner.read().get_column(id)
    }

    pub fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        self.inner.write().update(id, value)
    }

    pub fn get_key(&self) -> MultiValue {
        self.inner.read().get_key()
    }

    pub fn make_readonly(&self) {
        self.inner.write().make_readonly()
    }

    pub fn set_table(&self, name: &str) {
        self.inner.write().set_table(name)
    }

    pub fn table(&self) -> Option<String> {
        self.inner.read().table().map(str::to_string)
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.inner.read().schema().clone()
    }

    /// Access the underlying row under the data lock.
    pub fn with_row<T>(&self, f: impl FnOnce(&Row) -> T) -> T {
        f(&self.inner.read())
    }

    pub fn with_row_mut<T>(&self, f: impl FnOnce(&mut Row) -> T) -> T {
        f(&mut self.inner.write())
    }

    /// Deep copy of columns and lock state.
    pub fn copy(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
            lock: self.lock.snapshot(),
        }
    }
}

/// A row with one adaptive lock per column.
#[derive(Debug)]
pub struct FineLockedRow {
    inner: RwLock<Row>,
    locks: Vec<ALock>,
}

impl FineLockedRow {
    pub fn create(schema: Arc<Schema>, values: &[Value]) -> Result<Self> {
        let (policy, timeout) = lock_policy();
        let locks = (0..schema.columns_count())
            .map(|_| ALock::new(policy, timeout))
            .collect();
        Ok(Self {
            inner: RwLock::new(Row::create(schema, values)?),
            locks,
        })
    }

    pub fn alock(&self, column: ColumnId) -> &ALock {
        &self.locks[column]
    }

    pub fn reg_wlock<G, F>(&self, column: ColumnId, owner: TxnId, on_grant: G, on_fail: F) -> ReqId
    where
        G: FnOnce(ReqId) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        self.locks[column].reg_wlock(owner, on_grant, on_fail)
    }

    pub fn reg_rlock<G, F>(&self, column: ColumnId, owner: TxnId, on_grant: G, on_fail: F) -> ReqId
    where
        G: FnOnce(ReqId) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        self.locks[column].reg_rlock(owner, on_grant, on_fail)
    }

    pub fn abort_lock_req(&self, column: ColumnId, req: ReqId) {
        self.locks[column].abort_lock_req(req)
    }

    pub fn unlock_column_by(&self, column: ColumnId, req: ReqId) {
        self.locks[column].unlock_by(req)
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Value> {
        self.inner.read().get_column(id)
    }

    pub fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        self.inner.write().update(id, value)
    }

    pub fn get_key(&self) -> MultiValue {
        self.inner.read().get_key()
    }

    pub fn make_readonly(&self) {
        self.inner.write().make_readonly()
    }

    pub fn set_table(&self, name: &str) {
        self.inner.write().set_table(name)
    }

    pub fn table(&self) -> Option<String> {
        self.inner.read().table().map(str::to_string)
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.inner.read().schema().clone()
    }

    /// Column locks carry identity; a copied row would share or forge
    /// grants. Copying this variant is refused.
    pub fn copy(&self) -> Self {
        panic!("fine-locked rows cannot be copied: column locks carry identity");
    }
}
