//! Versioned row variants
//!
//! `VersionedRow` tracks a monotonically increasing integer version per
//! column: OCC readers capture pre-read versions and validate them at
//! prepare time, and commit publishes writes with `incr_column_ver`.
//!
//! `MultiVersionedRow` keeps the full recent history of each column in an
//! ordered version map so read-only transactions can be served at a chosen
//! snapshot version. Version ids come from one process-wide monotonic
//! counter. History is garbage-collected in segments: every
//! `gc_threshold` retained versions, entries older than the safe time and
//! not claimed by an observed reader are evicted.

use crate::error::{Error, Result};
use crate::locked_row::CoarseLockedRow;
use crate::row::Row;
use crate::schema::{ColumnId, Schema};
use parking_lot::Mutex;
use rill_common::{EngineConfig, TxnId};
use rill_value::{MultiValue, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Globally ordered version number.
pub type VersionId = u64;

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Draw the next version id from the process-wide counter.
pub fn next_version() -> VersionId {
    VERSION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// A coarse-locked row with one integer version per column.
#[derive(Debug)]
pub struct VersionedRow {
    locked: CoarseLockedRow,
    vers: Vec<AtomicU64>,
}

impl VersionedRow {
    pub fn create(schema: Arc<Schema>, values: &[Value]) -> Result<Self> {
        let columns = schema.columns_count();
        Ok(Self {
            locked: CoarseLockedRow::create(schema, values)?,
            vers: (0..columns).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    pub fn column_ver(&self, id: ColumnId) -> Result<u64> {
        self.vers
            .get(id)
            .map(|v| v.load(Ordering::SeqCst))
            .ok_or(Error::ColumnIdOutOfRange(id))
    }

    /// Publish a write: bump the column version. Strictly increasing.
    pub fn incr_column_ver(&self, id: ColumnId) -> Result<u64> {
        self.vers
            .get(id)
            .map(|v| v.fetch_add(1, Ordering::SeqCst) + 1)
            .ok_or(Error::ColumnIdOutOfRange(id))
    }

    pub fn rlock_row_by(&self, owner: TxnId) -> bool {
        self.locked.rlock_row_by(owner)
    }

    pub fn wlock_row_by(&self, owner: TxnId) -> bool {
        self.locked.wlock_row_by(owner)
    }

    pub fn unlock_row_by(&self, owner: TxnId) -> bool {
        self.locked.unlock_row_by(owner)
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Value> {
        self.locked.get_column(id)
    }

    pub fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        self.locked.update(id, value)
    }

    pub fn get_key(&self) -> MultiValue {
        self.locked.get_key()
    }

    pub fn make_readonly(&self) {
        self.locked.make_readonly()
    }

    pub fn set_table(&self, name: &str) {
        self.locked.set_table(name)
    }

    pub fn table(&self) -> Option<String> {
        self.locked.table()
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.locked.schema()
    }

    /// Deep copy of columns, lock state and column versions.
    pub fn copy(&self) -> Self {
        Self {
            locked: self.locked.copy(),
            vers: self
                .vers
                .iter()
                .map(|v| AtomicU64::new(v.load(Ordering::SeqCst)))
                .collect(),
        }
    }
}

/// Version-history GC knobs, taken from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct GcPolicy {
    /// GC runs every this many retained versions per column.
    pub threshold: usize,
    /// Versions younger than this are never evicted.
    pub safe_time: Duration,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            threshold: 100,
            safe_time: Duration::from_millis(5000),
        }
    }
}

impl From<&EngineConfig> for GcPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            threshold: config.gc_threshold.max(1),
            safe_time: Duration::from_millis(config.version_safe_time_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ColumnHistory {
    /// `old_values[v]` is the value the column held before version `v`
    /// was written.
    old_values: BTreeMap<VersionId, Value>,
    /// Version of the latest write; 0 if the column was never written.
    cur_ver: VersionId,
    /// First version of each threshold-sized block, with its wall time.
    segments: BTreeMap<VersionId, Instant>,
    /// History below this version has been garbage-collected; only
    /// claimed entries survive down there.
    horizon: VersionId,
    inserted: usize,
}

#[derive(Debug, Clone)]
struct MvInner {
    row: Row,
    columns: HashMap<ColumnId, ColumnHistory>,
    /// Observed readers: versions claimed against GC, per reader.
    claims: HashMap<TxnId, Vec<(ColumnId, VersionId)>>,
}

/// A row that retains per-column version history for snapshot reads.
#[derive(Debug)]
pub struct MultiVersionedRow {
    gc: GcPolicy,
    inner: Mutex<MvInner>,
}

impl MultiVersionedRow {
    pub fn create(schema: Arc<Schema>, values: &[Value], gc: GcPolicy) -> Result<Self> {
        Ok(Self {
            gc,
            inner: Mutex::new(MvInner {
                row: Row::create(schema, values)?,
                columns: HashMap::new(),
                claims: HashMap::new(),
            }),
        })
    }

    /// Update one column, retaining the prior value in the history.
    pub fn update(&self, id: ColumnId, value: &Value) -> Result<()> {
        let mut inner = self.inner.lock();
        let MvInner {
            row,
            columns,
            claims,
        } = &mut *inner;

        if row.readonly() {
            return Err(Error::ReadonlyRow);
        }
        let column = row.schema().column(id)?;
        if value.kind() != column.kind {
            return Err(Error::KindMismatch {
                expected: column.kind,
                found: value.kind(),
            });
        }

        let old = row.get_column(id)?;
        let ver = next_version();
        let hist = columns.entry(id).or_default();
        hist.old_values.insert(ver, old);
        hist.cur_ver = ver;
        if hist.inserted % self.gc.threshold == 0 {
            hist.segments.insert(ver, Instant::now());
        }
        hist.inserted += 1;
        if hist.old_values.len() % self.gc.threshold == 0 {
            Self::collect_garbage(id, hist, claims, self.gc);
        }
        row.update(id, value)
    }

    /// Version of the latest write to `id`; 0 if never written.
    pub fn current_version(&self, id: ColumnId) -> VersionId {
        self.inner
            .lock()
            .columns
            .get(&id)
            .map(|h| h.cur_ver)
            .unwrap_or(0)
    }

    /// Read the column as of version `ver`.
    ///
    /// `ver` at or past the current version reads the live value;
    /// otherwise the least retained version at or above `ver` serves the
    /// read. A pruned version is a stale read.
    pub fn get_column_by_version(&self, id: ColumnId, ver: VersionId) -> Result<Value> {
        let inner = self.inner.lock();
        let cur = inner.columns.get(&id).map(|h| h.cur_ver).unwrap_or(0);
        if ver >= cur {
            return inner.row.get_column(id);
        }
        // cur > 0, so a history entry for the column exists.
        let hist = &inner.columns[&id];
        match hist.old_values.range(ver..).next() {
            // Above the GC horizon the history is contiguous; below it
            // only an entry pinned by a claim can serve the read.
            Some((&k, value)) if ver >= hist.horizon || k < hist.horizon => Ok(value.clone()),
            _ => Err(Error::StaleVersion {
                column: id,
                requested: ver,
            }),
        }
    }

    /// Record that `reader` depends on version `ver` of column `id`; GC
    /// will not evict the entry serving that read while the claim stands.
    pub fn claim_version(&self, id: ColumnId, reader: TxnId, ver: VersionId) {
        let mut inner = self.inner.lock();
        let MvInner {
            columns, claims, ..
        } = &mut *inner;
        // Pin the history entry that serves reads at `ver`. Version ids
        // are globally monotonic, so the serving entry never changes
        // while it is retained.
        let pinned = columns
            .get(&id)
            .and_then(|h| h.old_values.range(ver..).next().map(|(&k, _)| k))
            .unwrap_or(ver);
        claims.entry(reader).or_default().push((id, pinned));
    }

    /// Drop every claim held by `reader`.
    pub fn release_claims(&self, reader: TxnId) {
        self.inner.lock().claims.remove(&reader);
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Value> {
        self.inner.lock().row.get_column(id)
    }

    pub fn get_key(&self) -> MultiValue {
        self.inner.lock().row.get_key()
    }

    pub fn make_readonly(&self) {
        self.inner.lock().row.make_readonly()
    }

    pub fn set_table(&self, name: &str) {
        self.inner.lock().row.set_table(name)
    }

    pub fn table(&self) -> Option<String> {
        self.inner.lock().row.table().map(str::to_string)
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.inner.lock().row.schema().clone()
    }

    /// Number of retained history entries for a column (tests and
    /// introspection).
    pub fn history_len(&self, id: ColumnId) -> usize {
        self.inner
            .lock()
            .columns
            .get(&id)
            .map(|h| h.old_values.len())
            .unwrap_or(0)
    }

    /// Deep copy including version history and claims.
    pub fn copy(&self) -> Self {
        Self {
            gc: self.gc,
            inner: Mutex::new(self.inner.lock().clone()),
        }
    }

    fn collect_garbage(
        col: ColumnId,
        hist: &mut ColumnHistory,
        claims: &HashMap<TxnId, Vec<(ColumnId, VersionId)>>,
        gc: GcPolicy,
    ) {
        let now = Instant::now();

        // Versions below a segment start were inserted before that
        // segment's wall time; the youngest sufficiently old segment start
        // bounds what is certainly past the safe time.
        let mut horizon: VersionId = 0;
        for (&start, &at) in hist.segments.iter() {
            if now.duration_since(at) >= gc.safe_time {
                horizon = horizon.max(start);
            }
        }
        if horizon == 0 {
            return;
        }

        let claimed: HashSet<VersionId> = claims
            .values()
            .flatten()
            .filter(|(c, _)| *c == col)
            .map(|(_, v)| *v)
            .collect();

        let stale: Vec<VersionId> = hist
            .old_values
            .range(..horizon)
            .map(|(&v, _)| v)
            .filter(|v| !claimed.contains(v))
            .collect();
        let evicted = stale.len();
        for v in stale {
            hist.old_values.remove(&v);
        }
        hist.segments.retain(|&start, _| start >= horizon);
        hist.horizon = hist.horizon.max(horizon);
        if evicted > 0 {
            debug!(column = col, evicted, "evicted stale column versions");
        }
    }
}
