//! Dependency graph
//!
//! Vertices carry per-transaction protocol state and are kept in an arena
//! keyed by transaction id; edges are labelled id pairs. Fragments of the
//! graph travel with piece replies and finish requests, so vertices and
//! edges are serializable. A vertex referenced by an edge but never
//! described by a fragment is *unknown*: deciding past it requires asking
//! its owning server for the subgraph.

use parking_lot::RwLock;
use rill_common::TxnId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Protocol progress of one transaction vertex, in advancement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxnStatus {
    Started,
    FinishRequested,
    Decided,
    Applied,
    Aborted,
}

/// Dependency label. Write-after-write edges are immediate: they must be
/// observed in the commit decision. Read/write serialization edges may be
/// weakened by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    WriteWrite,
    ReadWrite,
}

impl EdgeKind {
    fn strongest(self, other: EdgeKind) -> EdgeKind {
        if self == EdgeKind::WriteWrite || other == EdgeKind::WriteWrite {
            EdgeKind::WriteWrite
        } else {
            EdgeKind::ReadWrite
        }
    }
}

/// Per-vertex transaction info carried across servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnInfo {
    pub tid: TxnId,
    pub status: TxnStatus,
}

/// A serializable piece of the graph: vertices plus labelled edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFragment {
    pub vertices: Vec<TxnInfo>,
    pub edges: Vec<(TxnId, TxnId, EdgeKind)>,
}

#[derive(Debug)]
struct VertexData {
    status: TxnStatus,
    /// False when the vertex is only an edge endpoint from a merged
    /// fragment; its own subgraph lives on another server.
    known: bool,
    parents: HashMap<TxnId, EdgeKind>,
    children: HashMap<TxnId, EdgeKind>,
}

impl VertexData {
    fn new(known: bool) -> Self {
        Self {
            status: TxnStatus::Started,
            known,
            parents: HashMap::new(),
            children: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct GraphInner {
    vertices: HashMap<TxnId, VertexData>,
}

impl GraphInner {
    fn ensure(&mut self, tid: TxnId, known: bool) -> &mut VertexData {
        let vertex = self
            .vertices
            .entry(tid)
            .or_insert_with(|| VertexData::new(known));
        if known {
            vertex.known = true;
        }
        vertex
    }
}

/// Outcome of checking whether a vertex can be decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecideCheck {
    /// Every external ancestor is decided and the whole SCC has finish
    /// requests; members are sorted by transaction id.
    Ready { scc: Vec<TxnId> },
    /// Some ancestor or SCC member has not progressed far enough yet.
    Undecided { waiting_on: Vec<TxnId> },
    /// Some ancestor vertex is unknown locally; ask its owner.
    Unknown { missing: Vec<TxnId> },
}

/// The process-wide dependency graph. Internally synchronized; lookups
/// and edge insertions are linearizable.
#[derive(Debug, Default)]
pub struct DepGraph {
    inner: RwLock<GraphInner>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a known vertex exists for `tid`.
    pub fn touch_vertex(&self, tid: TxnId) {
        self.inner.write().ensure(tid, true);
    }

    pub fn contains(&self, tid: TxnId) -> bool {
        self.inner.read().vertices.contains_key(&tid)
    }

    pub fn status(&self, tid: TxnId) -> Option<TxnStatus> {
        self.inner.read().vertices.get(&tid).map(|v| v.status)
    }

    /// Advance a vertex's status; statuses never move backwards.
    pub fn advance_status(&self, tid: TxnId, status: TxnStatus) {
        let mut inner = self.inner.write();
        let vertex = inner.ensure(tid, true);
        if status > vertex.status {
            vertex.status = status;
        }
    }

    /// Insert (or strengthen) the edge `from → to`.
    pub fn add_edge(&self, from: TxnId, to: TxnId, kind: EdgeKind) {
        if from == to {
            return;
        }
        let mut inner = self.inner.write();
        inner.ensure(from, false);
        inner.ensure(to, false);
        let from_vertex = inner.vertices.get_mut(&from).expect("ensured");
        let merged = from_vertex
            .children
            .get(&to)
            .map(|k| k.strongest(kind))
            .unwrap_or(kind);
        from_vertex.children.insert(to, merged);
        let to_vertex = inner.vertices.get_mut(&to).expect("ensured");
        to_vertex.parents.insert(from, merged);
    }

    pub fn parents_of(&self, tid: TxnId) -> Vec<TxnId> {
        self.inner
            .read()
            .vertices
            .get(&tid)
            .map(|v| {
                let mut parents: Vec<TxnId> = v.parents.keys().copied().collect();
                parents.sort();
                parents
            })
            .unwrap_or_default()
    }

    /// Merge a fragment: described vertices become known, statuses take
    /// the furthest-advanced value, edge labels take the strongest.
    pub fn merge(&self, fragment: &GraphFragment) {
        {
            let mut inner = self.inner.write();
            for info in &fragment.vertices {
                let vertex = inner.ensure(info.tid, true);
                if info.status > vertex.status {
                    vertex.status = info.status;
                }
            }
        }
        for (from, to, kind) in &fragment.edges {
            self.add_edge(*from, *to, *kind);
        }
    }

    /// Export the subgraph of `tid` and its known ancestors, for ask
    /// replies and finish-request assembly.
    pub fn fragment_for(&self, tid: TxnId) -> GraphFragment {
        let inner = self.inner.read();
        let mut visited = HashSet::new();
        let mut stack = vec![tid];
        while let Some(cur) = stack.pop() {
            if !visited.insert(cur) {
                continue;
            }
            if let Some(vertex) = inner.vertices.get(&cur) {
                for &parent in vertex.parents.keys() {
                    stack.push(parent);
                }
            }
        }

        let mut vertices: Vec<TxnInfo> = Vec::new();
        let mut edges = Vec::new();
        for &tid in &visited {
            if let Some(vertex) = inner.vertices.get(&tid) {
                if vertex.known {
                    vertices.push(TxnInfo {
                        tid,
                        status: vertex.status,
                    });
                }
                for (&child, &kind) in &vertex.children {
                    if visited.contains(&child) {
                        edges.push((tid, child, kind));
                    }
                }
            }
        }
        vertices.sort_by_key(|v| v.tid);
        edges.sort();
        GraphFragment { vertices, edges }
    }

    /// Remove a vertex and its incident edges (abort path). Successors
    /// lose the dependency before they decide.
    pub fn detach(&self, tid: TxnId) {
        let mut inner = self.inner.write();
        if let Some(vertex) = inner.vertices.remove(&tid) {
            for parent in vertex.parents.keys() {
                if let Some(p) = inner.vertices.get_mut(parent) {
                    p.children.remove(&tid);
                }
            }
            for child in vertex.children.keys() {
                if let Some(c) = inner.vertices.get_mut(child) {
                    c.parents.remove(&tid);
                }
            }
            debug!(%tid, "vertex detached");
        }
    }

    /// Check whether `tid` can be decided.
    pub fn decide_check(&self, tid: TxnId) -> DecideCheck {
        let inner = self.inner.read();
        if !inner.vertices.contains_key(&tid) {
            return DecideCheck::Unknown { missing: vec![tid] };
        }

        // Transitive ancestors.
        let mut ancestors = HashSet::new();
        let mut missing = Vec::new();
        let mut stack = vec![tid];
        let mut seen = HashSet::new();
        seen.insert(tid);
        while let Some(cur) = stack.pop() {
            let Some(vertex) = inner.vertices.get(&cur) else {
                continue;
            };
            if cur != tid {
                ancestors.insert(cur);
                if !vertex.known {
                    missing.push(cur);
                }
            }
            for &parent in vertex.parents.keys() {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return DecideCheck::Unknown { missing };
        }

        let scc = scc_of(&inner, tid);
        let scc_set: HashSet<TxnId> = scc.iter().copied().collect();

        // Every member of the SCC must have its finish request before the
        // component can decide as a unit.
        let mut waiting_on: Vec<TxnId> = scc
            .iter()
            .copied()
            .filter(|member| {
                inner
                    .vertices
                    .get(member)
                    .map(|v| v.status < TxnStatus::FinishRequested)
                    .unwrap_or(true)
            })
            .collect();

        // External ancestors must already be decided.
        waiting_on.extend(ancestors.iter().copied().filter(|a| {
            !scc_set.contains(a)
                && inner
                    .vertices
                    .get(a)
                    .map(|v| v.status < TxnStatus::Decided)
                    .unwrap_or(false)
        }));

        if waiting_on.is_empty() {
            DecideCheck::Ready { scc }
        } else {
            waiting_on.sort();
            waiting_on.dedup();
            DecideCheck::Undecided { waiting_on }
        }
    }
}

/// Members of the strongly connected component containing `tid`, sorted
/// by transaction id.
fn scc_of(inner: &GraphInner, tid: TxnId) -> Vec<TxnId> {
    // Deterministic node order for the traversal.
    let mut tids: Vec<TxnId> = inner.vertices.keys().copied().collect();
    tids.sort();
    let index_of: HashMap<TxnId, usize> = tids.iter().enumerate().map(|(i, &t)| (t, i)).collect();
    let succ: Vec<Vec<usize>> = tids
        .iter()
        .map(|t| {
            let mut children: Vec<usize> = inner.vertices[t]
                .children
                .keys()
                .filter_map(|c| index_of.get(c).copied())
                .collect();
            children.sort_unstable();
            children
        })
        .collect();

    let n = tids.len();
    let mut index = vec![usize::MAX; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut component_of = vec![usize::MAX; n];
    let mut components = 0usize;

    for root in 0..n {
        if index[root] != usize::MAX {
            continue;
        }
        let mut call: Vec<(usize, usize)> = vec![(root, 0)];
        while !call.is_empty() {
            let (v, child_pos) = {
                let frame = call.last_mut().expect("non-empty");
                let v = frame.0;
                if frame.1 == 0 && index[v] == usize::MAX {
                    index[v] = next_index;
                    low[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                let pos = frame.1;
                frame.1 += 1;
                (v, pos)
            };

            if child_pos < succ[v].len() {
                let w = succ[v][child_pos];
                if index[w] == usize::MAX {
                    call.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
            } else {
                if low[v] == index[v] {
                    loop {
                        let w = stack.pop().expect("scc stack non-empty");
                        on_stack[w] = false;
                        component_of[w] = components;
                        if w == v {
                            break;
                        }
                    }
                    components += 1;
                }
                call.pop();
                if let Some(parent) = call.last() {
                    let p = parent.0;
                    low[p] = low[p].min(low[v]);
                }
            }
        }
    }

    let target = component_of[index_of[&tid]];
    tids.iter()
        .enumerate()
        .filter(|(i, _)| component_of[*i] == target)
        .map(|(_, &t)| t)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(raw: u64) -> TxnId {
        TxnId::new(raw)
    }

    #[test]
    fn test_edge_insert_and_strengthen() {
        let graph = DepGraph::new();
        graph.add_edge(tid(1), tid(2), EdgeKind::ReadWrite);
        graph.add_edge(tid(1), tid(2), EdgeKind::WriteWrite);
        let frag = graph.fragment_for(tid(2));
        assert_eq!(frag.edges, vec![(tid(1), tid(2), EdgeKind::WriteWrite)]);
    }

    #[test]
    fn test_status_only_advances() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(1));
        graph.advance_status(tid(1), TxnStatus::Decided);
        graph.advance_status(tid(1), TxnStatus::FinishRequested);
        assert_eq!(graph.status(tid(1)), Some(TxnStatus::Decided));
    }

    #[test]
    fn test_scc_of_cycle() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(1));
        graph.touch_vertex(tid(2));
        graph.touch_vertex(tid(3));
        graph.add_edge(tid(1), tid(2), EdgeKind::WriteWrite);
        graph.add_edge(tid(2), tid(1), EdgeKind::WriteWrite);
        graph.add_edge(tid(2), tid(3), EdgeKind::ReadWrite);

        let inner = graph.inner.read();
        assert_eq!(scc_of(&inner, tid(1)), vec![tid(1), tid(2)]);
        assert_eq!(scc_of(&inner, tid(3)), vec![tid(3)]);
    }

    #[test]
    fn test_decide_waits_for_ancestor() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(1));
        graph.touch_vertex(tid(2));
        graph.add_edge(tid(1), tid(2), EdgeKind::WriteWrite);
        graph.advance_status(tid(2), TxnStatus::FinishRequested);

        // Ancestor 1 is not decided yet.
        assert_eq!(
            graph.decide_check(tid(2)),
            DecideCheck::Undecided {
                waiting_on: vec![tid(1)]
            }
        );

        graph.advance_status(tid(1), TxnStatus::Decided);
        assert_eq!(
            graph.decide_check(tid(2)),
            DecideCheck::Ready { scc: vec![tid(2)] }
        );
    }

    #[test]
    fn test_decide_cycle_as_unit() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(1));
        graph.touch_vertex(tid(2));
        graph.add_edge(tid(1), tid(2), EdgeKind::WriteWrite);
        graph.add_edge(tid(2), tid(1), EdgeKind::WriteWrite);
        graph.advance_status(tid(1), TxnStatus::FinishRequested);

        // The peer has no finish request yet: not ready.
        assert!(matches!(
            graph.decide_check(tid(1)),
            DecideCheck::Undecided { .. }
        ));

        graph.advance_status(tid(2), TxnStatus::FinishRequested);
        assert_eq!(
            graph.decide_check(tid(1)),
            DecideCheck::Ready {
                scc: vec![tid(1), tid(2)]
            }
        );
    }

    #[test]
    fn test_unknown_ancestor_reports_missing() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(2));
        // Edge endpoint 9 arrives via merge without a vertex description.
        graph.merge(&GraphFragment {
            vertices: vec![],
            edges: vec![(tid(9), tid(2), EdgeKind::WriteWrite)],
        });
        graph.advance_status(tid(2), TxnStatus::FinishRequested);

        assert_eq!(
            graph.decide_check(tid(2)),
            DecideCheck::Unknown {
                missing: vec![tid(9)]
            }
        );

        // The owner's subgraph arrives: now decidable once decided.
        graph.merge(&GraphFragment {
            vertices: vec![TxnInfo {
                tid: tid(9),
                status: TxnStatus::Decided,
            }],
            edges: vec![],
        });
        assert_eq!(
            graph.decide_check(tid(2)),
            DecideCheck::Ready { scc: vec![tid(2)] }
        );
    }

    #[test]
    fn test_detach_unblocks_successor() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(1));
        graph.touch_vertex(tid(2));
        graph.add_edge(tid(1), tid(2), EdgeKind::WriteWrite);
        graph.advance_status(tid(2), TxnStatus::FinishRequested);
        assert!(matches!(
            graph.decide_check(tid(2)),
            DecideCheck::Undecided { .. }
        ));

        graph.detach(tid(1));
        assert_eq!(
            graph.decide_check(tid(2)),
            DecideCheck::Ready { scc: vec![tid(2)] }
        );
        assert!(graph.parents_of(tid(2)).is_empty());
    }

    #[test]
    fn test_fragment_roundtrip_through_merge() {
        let graph = DepGraph::new();
        graph.touch_vertex(tid(1));
        graph.touch_vertex(tid(2));
        graph.add_edge(tid(1), tid(2), EdgeKind::WriteWrite);
        graph.advance_status(tid(1), TxnStatus::Decided);

        let frag = graph.fragment_for(tid(2));
        let other = DepGraph::new();
        other.merge(&frag);
        assert_eq!(other.status(tid(1)), Some(TxnStatus::Decided));
        assert_eq!(other.parents_of(tid(2)), vec![tid(1)]);
    }
}
