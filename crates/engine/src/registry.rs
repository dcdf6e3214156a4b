//! Transaction registry
//!
//! The process-wide mapping from `(t_type, p_type)` to a piece handler and
//! its defer policy. Registration happens once at startup and the registry
//! is frozen before the first dispatch; unknown lookups and duplicate
//! registrations are bugs, not runtime errors.

use crate::cell::{CellLocator, CellTable};
use crate::graph::DepGraph;
use rill_common::{PieceResult, PieceType, RequestHeader, TxnId, TxnType};
use rill_store::{StoredRow, VersionId};
use rill_value::{MultiValue, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Rows a deferred piece touched, keyed by table and primary key. Frozen
/// into the deferred request at start and replayed at apply time.
pub type RowMap = HashMap<String, HashMap<MultiValue, Arc<dyn StoredRow>>>;

/// When a piece's effects take place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferMode {
    /// Effects are staged and applied when the transaction decides.
    Real,
    /// The piece executes immediately.
    No,
    /// Deferred for protocol bookkeeping, a no-op at apply time.
    Fake,
}

/// Which invocation of a deferred handler this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RccPhase {
    /// Start phase: locate rows, stage them in the row map, record
    /// dependencies. No writes.
    Start,
    /// Apply phase: perform the writes against the frozen row map.
    Apply,
    /// Immediate execution with dependency bookkeeping (defer = No).
    Immediate,
}

/// Dependency-tracking hooks handed to handlers running under the
/// deferred protocols.
pub struct RccScope<'a> {
    pub phase: RccPhase,
    /// Rows touched by this piece.
    pub row_map: &'a mut RowMap,
    /// The transaction vertex, present during start and immediate phases.
    pub tv: Option<TxnId>,
    pub graph: &'a DepGraph,
    pub cells: &'a CellTable,
    /// Read-only conflict collection; present only under `start_ro`.
    pub ro_conflicts: Option<&'a mut Vec<TxnId>>,
    /// Snapshot version for multi-versioned reads; present under RO-6.
    pub read_version: Option<VersionId>,
}

impl RccScope<'_> {
    /// Record a write to `locator` by this transaction's vertex.
    pub fn touch(&mut self, locator: CellLocator, immediate: bool) {
        if let Some(tv) = self.tv {
            self.cells.touch(self.graph, locator, tv, immediate);
        }
    }

    /// Record a read of `locator`, collecting its last writer.
    pub fn ro_touch(&mut self, locator: &CellLocator) {
        if let Some(conflicts) = self.ro_conflicts.as_deref_mut() {
            self.cells.ro_touch(locator, conflicts);
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.ro_conflicts.is_some()
    }

    /// Stage a row into the row map for the apply phase.
    pub fn stage_row(&mut self, table: &str, row: Arc<dyn StoredRow>) {
        self.row_map
            .entry(table.to_string())
            .or_default()
            .insert(row.key(), row);
    }

    /// A row staged during the start phase.
    pub fn staged_row(&self, table: &str, key: &MultiValue) -> Option<Arc<dyn StoredRow>> {
        self.row_map.get(table).and_then(|rows| rows.get(key)).cloned()
    }
}

/// One piece invocation: header, inputs, output buffer, and the RCC hooks
/// when running under a deferred protocol.
pub struct PieceRun<'a> {
    pub header: &'a RequestHeader,
    pub input: &'a [Value],
    pub output: Vec<Value>,
    pub rcc: Option<RccScope<'a>>,
}

/// A registered piece handler.
pub type TxnHandler = Arc<dyn Fn(&mut PieceRun<'_>) -> PieceResult + Send + Sync>;

/// Handler plus defer policy, the registry's value type.
#[derive(Clone)]
pub struct PieceDef {
    pub handler: TxnHandler,
    pub defer: DeferMode,
}

/// Initialize-then-freeze registry of piece handlers.
#[derive(Default)]
pub struct TxnRegistry {
    all: HashMap<(TxnType, PieceType), PieceDef>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same `(t_type, p_type)` twice
    /// is a bug.
    pub fn reg<H>(&mut self, t_type: TxnType, p_type: PieceType, defer: DeferMode, handler: H)
    where
        H: Fn(&mut PieceRun<'_>) -> PieceResult + Send + Sync + 'static,
    {
        let previous = self.all.insert(
            (t_type, p_type),
            PieceDef {
                handler: Arc::new(handler),
                defer,
            },
        );
        assert!(
            previous.is_none(),
            "duplicate handler registration for ({:?}, {:?})",
            t_type,
            p_type
        );
    }

    /// Freeze the registry for sharing. No further registration.
    pub fn freeze(self) -> Arc<TxnRegistry> {
        Arc::new(self)
    }

    pub fn lookup(&self, t_type: TxnType, p_type: PieceType) -> Option<&PieceDef> {
        self.all.get(&(t_type, p_type))
    }

    /// Every dispatched `(t_type, p_type)` must be registered; an unknown
    /// lookup is a bug.
    pub fn get(&self, header: &RequestHeader) -> &PieceDef {
        self.lookup(header.t_type, header.p_type)
            .unwrap_or_else(|| {
                panic!(
                    "no handler registered for ({:?}, {:?})",
                    header.t_type, header.p_type
                )
            })
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Invoke a handler outside any deferred protocol (no RCC hooks).
    pub fn execute(&self, header: &RequestHeader, input: &[Value]) -> (PieceResult, Vec<Value>) {
        let def = self.get(header);
        let mut run = PieceRun {
            header,
            input,
            output: Vec::new(),
            rcc: None,
        };
        let result = (def.handler)(&mut run);
        (result, run.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_common::ServerId;

    fn header(t: i32, p: i32) -> RequestHeader {
        RequestHeader::new(TxnType(t), PieceType(p), TxnId::new(1), ServerId(0), 0)
    }

    #[test]
    fn test_register_and_execute() {
        let mut registry = TxnRegistry::new();
        registry.reg(TxnType(1), PieceType(1), DeferMode::No, |run| {
            run.output.push(Value::I64(42));
            PieceResult::Ok
        });
        let registry = registry.freeze();

        let (result, output) = registry.execute(&header(1, 1), &[]);
        assert_eq!(result, PieceResult::Ok);
        assert_eq!(output, vec![Value::I64(42)]);
    }

    #[test]
    #[should_panic(expected = "duplicate handler registration")]
    fn test_duplicate_registration_panics() {
        let mut registry = TxnRegistry::new();
        registry.reg(TxnType(1), PieceType(1), DeferMode::No, |_| PieceResult::Ok);
        registry.reg(TxnType(1), PieceType(1), DeferMode::Real, |_| {
            PieceResult::Ok
        });
    }

    #[test]
    #[should_panic(expected = "no handler registered")]
    fn test_unknown_lookup_panics() {
        let registry = TxnRegistry::new().freeze();
        registry.get(&header(9, 9));
    }

    #[test]
    fn test_defer_mode_recorded() {
        let mut registry = TxnRegistry::new();
        registry.reg(TxnType(1), PieceType(1), DeferMode::Real, |_| {
            PieceResult::Ok
        });
        registry.reg(TxnType(1), PieceType(2), DeferMode::Fake, |_| {
            PieceResult::Ok
        });
        let registry = registry.freeze();

        assert_eq!(
            registry.lookup(TxnType(1), PieceType(1)).unwrap().defer,
            DeferMode::Real
        );
        assert_eq!(
            registry.lookup(TxnType(1), PieceType(2)).unwrap().defer,
            DeferMode::Fake
        );
        assert_eq!(registry.len(), 2);
    }
}
