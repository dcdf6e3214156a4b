//! Keyed row containers
//!
//! A table owns its rows (shared handles, keyed by primary key) and binds
//! each row back to itself by name on insert. The row flavor is selected
//! by the process run mode when the table is created and never changes.

use crate::error::{Error, Result};
use crate::locked_row::{CoarseLockedRow, FineLockedRow};
use crate::row::Row;
use crate::schema::{ColumnId, Schema};
use crate::versioned_row::{GcPolicy, MultiVersionedRow, VersionedRow};
use parking_lot::RwLock;
use rill_common::RunMode;
use rill_value::{MultiValue, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Row representation used by a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFlavor {
    Basic,
    Coarse,
    Fine,
    Versioned,
    MultiVersioned,
}

impl RowFlavor {
    /// The flavor each protocol runs on.
    pub fn for_mode(mode: RunMode) -> RowFlavor {
        match mode {
            RunMode::Rcc => RowFlavor::Basic,
            RunMode::Rot => RowFlavor::MultiVersioned,
            RunMode::TwoPl => RowFlavor::Fine,
            RunMode::Occ => RowFlavor::Versioned,
        }
    }
}

/// Uniform access to a stored row regardless of its flavor.
///
/// Concurrency metadata stays behind the concrete types; protocol code
/// downcasts through the `as_*` accessors when it needs the lock or
/// version surface of a specific flavor.
pub trait StoredRow: Send + Sync + std::fmt::Debug {
    fn schema(&self) -> Arc<Schema>;
    fn key(&self) -> MultiValue;
    fn get_column(&self, id: ColumnId) -> Result<Value>;
    fn update(&self, id: ColumnId, value: &Value) -> Result<()>;
    fn make_readonly(&self);
    fn bind_table(&self, name: &str);
    fn table(&self) -> Option<String>;

    fn as_fine(&self) -> Option<&FineLockedRow> {
        None
    }
    fn as_versioned(&self) -> Option<&VersionedRow> {
        None
    }
    fn as_multi_versioned(&self) -> Option<&MultiVersionedRow> {
        None
    }
}

/// A basic row behind a data lock, with no concurrency discipline.
#[derive(Debug)]
pub struct BasicRow {
    inner: RwLock<Row>,
}

impl BasicRow {
    pub fn create(schema: Arc<Schema>, values: &[Value]) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(Row::create(schema, values)?),
        })
    }

    pub fn with_row<T>(&self, f: impl FnOnce(&Row) -> T) -> T {
        f(&self.inner.read())
    }

    pub fn with_row_mut<T>(&self, f: impl FnOnce(&mut Row) -> T) -> T {
        f(&mut self.inner.write())
    }

    pub fn copy(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
        }
    }
}

impl StoredRow for BasicRow {
    fn schema(&self) -> Arc<Schema> {
        self.inner.read().schema().clone()
    }

    fn key(&self) -> MultiValue {
        self.inner.read().get_key()
    }

    fn get_column(&self, id: ColumnId) -> Result<Value> {
        self.inner.read().get_column(id)
    }

    fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        self.inner.write().update(id, value)
    }

    fn make_readonly(&self) {
        self.inner.write().make_readonly()
    }

    fn bind_table(&self, name: &str) {
        self.inner.write().set_table(name)
    }

    fn table(&self) -> Option<String> {
        self.inner.read().table().map(str::to_string)
    }
}

impl StoredRow for CoarseLockedRow {
    fn schema(&self) -> Arc<Schema> {
        CoarseLockedRow::schema(self)
    }

    fn key(&self) -> MultiValue {
        self.get_key()
    }

    fn get_column(&self, id: ColumnId) -> Result<Value> {
        CoarseLockedRow::get_column(self, id)
    }

    fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        CoarseLockedRow::update(self, id, value)
    }

    fn make_readonly(&self) {
        CoarseLockedRow::make_readonly(self)
    }

    fn bind_table(&self, name: &str) {
        self.set_table(name)
    }

    fn table(&self) -> Option<String> {
        CoarseLockedRow::table(self)
    }
}

impl StoredRow for FineLockedRow {
    fn schema(&self) -> Arc<Schema> {
        FineLockedRow::schema(self)
    }

    fn key(&self) -> MultiValue {
        self.get_key()
    }

    fn get_column(&self, id: ColumnId) -> Result<Value> {
        FineLockedRow::get_column(self, id)
    }

    fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        FineLockedRow::update(self, id, value)
    }

    fn make_readonly(&self) {
        FineLockedRow::make_readonly(self)
    }

    fn bind_table(&self, name: &str) {
        self.set_table(name)
    }

    fn table(&self) -> Option<String> {
        FineLockedRow::table(self)
    }

    fn as_fine(&self) -> Option<&FineLockedRow> {
        Some(self)
    }
}

impl StoredRow for VersionedRow {
    fn schema(&self) -> Arc<Schema> {
        VersionedRow::schema(self)
    }

    fn key(&self) -> MultiValue {
        self.get_key()
    }

    fn get_column(&self, id: ColumnId) -> Result<Value> {
        VersionedRow::get_column(self, id)
    }

    fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        VersionedRow::update(self, id, value)
    }

    fn make_readonly(&self) {
        VersionedRow::make_readonly(self)
    }

    fn bind_table(&self, name: &str) {
        self.set_table(name)
    }

    fn table(&self) -> Option<String> {
        VersionedRow::table(self)
    }

    fn as_versioned(&self) -> Option<&VersionedRow> {
        Some(self)
    }
}

impl StoredRow for MultiVersionedRow {
    fn schema(&self) -> Arc<Schema> {
        MultiVersionedRow::schema(self)
    }

    fn key(&self) -> MultiValue {
        self.get_key()
    }

    fn get_column(&self, id: ColumnId) -> Result<Value> {
        MultiVersionedRow::get_column(self, id)
    }

    fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        MultiVersionedRow::update(self, id, value)
    }

    fn make_readonly(&self) {
        MultiVersionedRow::make_readonly(self)
    }

    fn bind_table(&self, name: &str) {
        self.set_table(name)
    }

    fn table(&self) -> Option<String> {
        MultiVersionedRow::table(self)
    }

    fn as_multi_versioned(&self) -> Option<&MultiVersionedRow> {
        Some(self)
    }
}

/// A keyed row container of one flavor.
#[derive(Debug)]
pub struct Table {
    name: String,
    schema: Arc<Schema>,
    flavor: RowFlavor,
    gc: GcPolicy,
    rows: RwLock<BTreeMap<MultiValue, Arc<dyn StoredRow>>>,
}

impl Table {
    pub fn new(name: impl Into<String>, schema: Arc<Schema>, flavor: RowFlavor) -> Self {
        Self::with_gc(name, schema, flavor, GcPolicy::default())
    }

    pub fn with_gc(
        name: impl Into<String>,
        schema: Arc<Schema>,
        flavor: RowFlavor,
        gc: GcPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            flavor,
            gc,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn flavor(&self) -> RowFlavor {
        self.flavor
    }

    /// Create a row of this table's flavor and insert it.
    pub fn insert_values(&self, values: &[Value]) -> Result<Arc<dyn StoredRow>> {
        let row: Arc<dyn StoredRow> = match self.flavor {
            RowFlavor::Basic => Arc::new(BasicRow::create(self.schema.clone(), values)?),
            RowFlavor::Coarse => Arc::new(CoarseLockedRow::create(self.schema.clone(), values)?),
            RowFlavor::Fine => Arc::new(FineLockedRow::create(self.schema.clone(), values)?),
            RowFlavor::Versioned => Arc::new(VersionedRow::create(self.schema.clone(), values)?),
            RowFlavor::MultiVersioned => Arc::new(MultiVersionedRow::create(
                self.schema.clone(),
                values,
                self.gc,
            )?),
        };
        self.insert(row.clone())?;
        Ok(row)
    }

    /// Insert an already-built row. Duplicate keys are rejected.
    pub fn insert(&self, row: Arc<dyn StoredRow>) -> Result<()> {
        let key = row.key();
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(Error::DuplicateKey(self.name.clone()));
        }
        row.bind_table(&self.name);
        debug!(table = %self.name, key = %key, "row inserted");
        rows.insert(key, row);
        Ok(())
    }

    pub fn query(&self, key: &MultiValue) -> Option<Arc<dyn StoredRow>> {
        self.rows.read().get(key).cloned()
    }

    pub fn remove(&self, key: &MultiValue) -> Option<Arc<dyn StoredRow>> {
        self.rows.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Visit every row in key order.
    pub fn for_each(&self, mut f: impl FnMut(&MultiValue, &Arc<dyn StoredRow>)) {
        for (key, row) in self.rows.read().iter() {
            f(key, row);
        }
    }
}
