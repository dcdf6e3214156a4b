//! Cell-level dependency tracking
//!
//! A cell is one column of one row of one table. Each cell remembers the
//! most recent writer's transaction vertex; writers link themselves behind
//! it with a graph edge, and read-only pieces collect it as a conflict the
//! coordinator must wait out.

use crate::graph::{DepGraph, EdgeKind};
use parking_lot::Mutex;
use rill_common::TxnId;
use rill_store::ColumnId;
use rill_value::MultiValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Identifies a cell for dependency tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellLocator {
    pub table: String,
    pub key: MultiValue,
    pub column: ColumnId,
}

impl CellLocator {
    pub fn new(table: impl Into<String>, key: MultiValue, column: ColumnId) -> Self {
        Self {
            table: table.into(),
            key,
            column,
        }
    }
}

impl PartialOrd for CellLocator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CellLocator {
    fn cmp(&self, other: &Self) -> Ordering {
        // Table, then column, then key.
        self.table
            .cmp(&other.table)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| self.key.compare(&other.key))
    }
}

impl fmt::Display for CellLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}[{}]", self.table, self.key, self.column)
    }
}

/// Per-cell tracker holding the most recent writer's vertex.
#[derive(Debug, Default, Clone)]
pub struct CellEntry {
    last: Option<TxnId>,
}

impl CellEntry {
    /// Record `tv` as the newest writer: add an edge from the previous
    /// writer's vertex, immediate when the write order must be observed
    /// in the commit decision.
    pub fn touch(&mut self, graph: &DepGraph, tv: TxnId, immediate: bool) {
        if let Some(prev) = self.last {
            if prev != tv {
                let kind = if immediate {
                    EdgeKind::WriteWrite
                } else {
                    EdgeKind::ReadWrite
                };
                graph.add_edge(prev, tv, kind);
            }
        }
        self.last = Some(tv);
    }

    /// Stage a read-after-write conflict: the last writer must be waited
    /// out before a read-only result is returned.
    pub fn ro_touch(&self, conflicts: &mut Vec<TxnId>) {
        if let Some(last) = self.last {
            conflicts.push(last);
        }
    }

    pub fn last_writer(&self) -> Option<TxnId> {
        self.last
    }
}

/// The shared cell tracker table.
#[derive(Debug, Default)]
pub struct CellTable {
    cells: Mutex<HashMap<CellLocator, CellEntry>>,
}

impl CellTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, graph: &DepGraph, locator: CellLocator, tv: TxnId, immediate: bool) {
        let mut cells = self.cells.lock();
        cells.entry(locator).or_default().touch(graph, tv, immediate);
    }

    pub fn ro_touch(&self, locator: &CellLocator, conflicts: &mut Vec<TxnId>) {
        if let Some(entry) = self.cells.lock().get(locator) {
            entry.ro_touch(conflicts);
        }
    }

    pub fn last_writer(&self, locator: &CellLocator) -> Option<TxnId> {
        self.cells.lock().get(locator).and_then(|e| e.last_writer())
    }

    /// Clear every cell whose last writer is the aborted transaction; its
    /// vertex is about to be detached.
    pub fn forget(&self, tid: TxnId) {
        let mut cells = self.cells.lock();
        for entry in cells.values_mut() {
            if entry.last == Some(tid) {
                entry.last = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TxnStatus;
    use rill_value::Value;

    fn loc(table: &str, key: i64, column: ColumnId) -> CellLocator {
        CellLocator::new(table, MultiValue::from(Value::I64(key)), column)
    }

    #[test]
    fn test_locator_order() {
        let a = loc("a", 1, 0);
        let b = loc("a", 1, 1);
        let c = loc("a", 2, 0);
        let d = loc("b", 0, 0);

        // Table first, then column, then key.
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert!(b < d);
    }

    #[test]
    fn test_touch_links_writers() {
        let graph = DepGraph::new();
        let cells = CellTable::new();
        let cell = loc("accounts", 1, 1);

        cells.touch(&graph, cell.clone(), TxnId::new(1), true);
        assert_eq!(cells.last_writer(&cell), Some(TxnId::new(1)));

        cells.touch(&graph, cell.clone(), TxnId::new(2), true);
        assert_eq!(cells.last_writer(&cell), Some(TxnId::new(2)));
        assert_eq!(graph.parents_of(TxnId::new(2)), vec![TxnId::new(1)]);
    }

    #[test]
    fn test_touch_same_writer_adds_no_edge() {
        let graph = DepGraph::new();
        let cells = CellTable::new();
        let cell = loc("accounts", 1, 1);

        cells.touch(&graph, cell.clone(), TxnId::new(1), true);
        cells.touch(&graph, cell.clone(), TxnId::new(1), true);
        assert!(graph.parents_of(TxnId::new(1)).is_empty());
    }

    #[test]
    fn test_ro_touch_collects_last_writer() {
        let graph = DepGraph::new();
        let cells = CellTable::new();
        let cell = loc("accounts", 1, 1);

        let mut conflicts = Vec::new();
        cells.ro_touch(&cell, &mut conflicts);
        assert!(conflicts.is_empty());

        cells.touch(&graph, cell.clone(), TxnId::new(7), true);
        cells.ro_touch(&cell, &mut conflicts);
        assert_eq!(conflicts, vec![TxnId::new(7)]);
    }

    #[test]
    fn test_forget_clears_aborted_writer() {
        let graph = DepGraph::new();
        let cells = CellTable::new();
        let cell = loc("accounts", 1, 1);

        cells.touch(&graph, cell.clone(), TxnId::new(7), true);
        graph.advance_status(TxnId::new(7), TxnStatus::Aborted);
        cells.forget(TxnId::new(7));
        assert_eq!(cells.last_writer(&cell), None);
    }
}
