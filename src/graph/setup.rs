use crate::{
    config::Config,
    graph::Node,
    types::{IndexMap, IndexSet, NodeId},
};
use rustc_hash::FxBuildHasher;
use std::collections::VecDeque;
use thiserror::Error;

/// Errors detected while building or freezing a graph.
///
/// A failing call leaves the graph exactly as it was.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The edge would close a cycle, or the graph contains one.
    #[error("graph contains cycle(s)")]
    CycleDetected,
    /// The graph was frozen for execution and can no longer change.
    #[error("graph is frozen")]
    GraphFrozen,
    /// The operation needs a frozen graph.
    #[error("graph is not frozen")]
    NotFrozen,
    /// The node does not belong to this graph.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// The edge already exists.
    #[error("edge {from} -> {to} already exists")]
    DuplicateEdge {
        /// Producer side.
        from: NodeId,
        /// Consumer side.
        to: NodeId,
    },
    /// Another node already uses the name.
    #[error("node name `{0}` is already taken")]
    DuplicateName(String),
    /// Node ids are `u16` indices.
    #[error("graph cannot hold more than {max} nodes", max = u16::MAX)]
    TooManyNodes,
    /// There is nothing to execute.
    #[error("graph has no nodes")]
    EmptyGraph,
    /// A node without a callback has several predecessors and nothing to
    /// combine them with.
    #[error("node {0} has no callback but more than one predecessor")]
    AmbiguousPassThrough(NodeId),
    /// Pipeline depth must be in `1..=u16::MAX`.
    #[error("invalid pipeline depth {0}")]
    InvalidPipelineDepth(usize),
}

struct NodeSetupLayout<'a> {
    level: u16,
    predecessors: &'a [NodeId],
}

/// Compute a topological order of `nodes` together with each node's level
/// (longest distance in edges from any input node).
///
/// # Panics
/// In case of internal invariant violations. Impossible if there are no
/// bugs in the code.
///
/// # Errors
/// If the graph contains cycle(s).
pub(super) fn topological_levels<C: Config>(
    nodes: &[Node<C>],
) -> Result<IndexMap<NodeId, u16>, GraphError> {
    // Example:
    //
    //   A     B
    //    \   /
    //      C
    //      |
    //      D
    //
    // - Roots: A, B => appear first in the final order; level(A) = level(B) = 0.
    // - C depends on both A and B => level(C) = 1 + max(level(A), level(B)) = 1.
    // - D depends on C only       => level(D) = 1 + level(C) = 2.
    //
    // Phase 1: Seed the order with roots (input nodes).
    let mut layout: IndexMap<NodeId, NodeSetupLayout<'_>> = nodes
        .iter()
        .filter(|node| node.is_source())
        .map(|node| {
            (
                node.id(),
                NodeSetupLayout {
                    level: 0,
                    predecessors: node.predecessors(),
                },
            )
        })
        .collect();

    // If there are nodes but no roots, the entire graph must be cyclic.
    if layout.is_empty() && !nodes.is_empty() {
        return Err(GraphError::CycleDetected);
    }

    // Phase 2: Worklist of candidates whose predecessors might soon be fully
    // placed. `pending_set` prevents duplicates.
    let max_cap = nodes.len() - layout.len();
    let mut pending_queue = VecDeque::with_capacity(max_cap);
    let mut pending_set = IndexSet::with_capacity_and_hasher(max_cap, FxBuildHasher);
    for &id in layout.keys() {
        for &child in nodes[id.index()].successors() {
            if pending_set.insert(child) {
                pending_queue.push_back(child);
            }
        }
    }

    // Phase 3: Kahn-like processing with progress detection. A candidate is
    // placed once all its predecessors are placed; otherwise it is skipped and
    // re-enqueued later by its missing predecessor. If no progress happens for
    // as many iterations as the queue held at the last progress moment, the
    // remaining subgraph is cyclic.
    let mut last_progress_iter = 0usize;
    let mut last_progress_queue_len = pending_queue.len();
    let mut iter = 0usize;

    'process_pending: while let Some(id) = pending_queue.pop_front() {
        let removed = pending_set.swap_remove(&id);
        assert!(removed, "topological_levels: [1]");
        if iter
            .checked_sub(last_progress_iter)
            .expect("topological_levels: [2]")
            >= last_progress_queue_len
        {
            return Err(GraphError::CycleDetected);
        }
        iter = iter.checked_add(1).expect("topological_levels: [3]");

        let node = &nodes[id.index()];
        let mut level = 1;
        for pred in node.predecessors() {
            let Some(pred_layout) = layout.get(pred) else {
                continue 'process_pending;
            };
            let candidate = pred_layout
                .level
                .checked_add(1)
                .expect("topological_levels: [4]");
            level = level.max(candidate);
        }
        let inserted_new = layout
            .insert(
                id,
                NodeSetupLayout {
                    level,
                    predecessors: node.predecessors(),
                },
            )
            .is_none();
        assert!(inserted_new, "topological_levels: [5]");

        for &child in node.successors() {
            if pending_set.insert(child) {
                pending_queue.push_back(child);
            }
        }
        last_progress_iter = iter;
        last_progress_queue_len = pending_queue.len();
    }

    // Nodes that were never placed sit on a cycle or below one.
    if layout.len() != nodes.len() {
        return Err(GraphError::CycleDetected);
    }
    for (id, entry) in &layout {
        for pred in entry.predecessors {
            assert!(
                layout.get_index_of(pred) < layout.get_index_of(id),
                "topological_levels: [6]"
            );
        }
    }
    Ok(layout
        .into_iter()
        .map(|(id, entry)| (id, entry.level))
        .collect())
}
