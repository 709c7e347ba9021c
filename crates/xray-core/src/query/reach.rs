//! Forward and reverse reachability over a unified graph.

use std::collections::{BTreeSet, VecDeque};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::model::{NodeId, UnifiedGraph};
use crate::models::PackageVersion;

// ---------------------------------------------------------------------------
// GraphIndex
// ---------------------------------------------------------------------------

/// Dense adjacency lists over a graph's nodes, in sorted node order.
#[derive(Clone, Debug)]
pub struct GraphIndex {
    nodes: IndexSet<NodeId>,
    forward: Vec<Vec<usize>>,
    reverse: Vec<Vec<usize>>,
}

impl GraphIndex {
    pub fn new(graph: &UnifiedGraph) -> Self {
        let nodes: IndexSet<NodeId> = graph.nodes().cloned().collect();
        let mut forward = vec![Vec::new(); nodes.len()];
        let mut reverse = vec![Vec::new(); nodes.len()];
        for (a, b) in graph.edges() {
            if let (Some(ia), Some(ib)) = (nodes.get_index_of(a), nodes.get_index_of(b)) {
                forward[ia].push(ib);
                reverse[ib].push(ia);
            }
        }
        Self {
            nodes,
            forward,
            reverse,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &NodeId {
        &self.nodes[idx]
    }

    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.nodes.get_index_of(node)
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.forward[idx]
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.reverse[idx]
    }

    /// Indices of `package`'s own interpreted nodes.
    pub fn own_functions(&self, package: &PackageVersion) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n, NodeId::Interpreted { package: p, .. } if p == package))
            .map(|(i, _)| i)
            .collect()
    }

    /// Positions of the given nodes that exist in the graph, sorted.
    pub fn positions<'a, I>(&self, nodes: I) -> Vec<usize>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let mut out: Vec<usize> = nodes.into_iter().filter_map(|n| self.position(n)).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Mark every node reachable from `starts` along outgoing edges.
    pub fn forward_closure(&self, starts: &[usize]) -> Vec<bool> {
        closure(&self.forward, starts)
    }

    /// Mark every node that can reach one of `targets`.
    pub fn reverse_closure(&self, targets: &[usize]) -> Vec<bool> {
        closure(&self.reverse, targets)
    }
}

/// BFS with one visited set for the whole traversal: linear in nodes + edges.
fn closure(adjacency: &[Vec<usize>], starts: &[usize]) -> Vec<bool> {
    let mut visited = vec![false; adjacency.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();
    for &s in starts {
        if !visited[s] {
            visited[s] = true;
            queue.push_back(s);
        }
    }
    while let Some(current) = queue.pop_front() {
        for &next in &adjacency[current] {
            if !visited[next] {
                visited[next] = true;
                queue.push_back(next);
            }
        }
    }
    visited
}

// ---------------------------------------------------------------------------
// Reached graph
// ---------------------------------------------------------------------------

/// Induced subgraph over everything reachable from `roots`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachedGraph {
    pub roots: BTreeSet<NodeId>,
    pub graph: UnifiedGraph,
}

impl ReachedGraph {
    pub fn contains(&self, node: &NodeId) -> bool {
        self.graph.contains_node(node)
    }
}

/// Roots of a client analysis: the client's own interpreted functions.
pub fn client_roots(graph: &UnifiedGraph, client: &PackageVersion) -> BTreeSet<NodeId> {
    graph.interpreted_nodes_of(client).cloned().collect()
}

/// Reached set from explicit roots; roots absent from the graph are dropped.
pub fn reached_graph(graph: &UnifiedGraph, roots: &BTreeSet<NodeId>) -> ReachedGraph {
    let index = GraphIndex::new(graph);
    let starts = index.positions(roots);
    let marked = index.forward_closure(&starts);
    let keep: BTreeSet<NodeId> = marked
        .iter()
        .enumerate()
        .filter(|(_, hit)| **hit)
        .map(|(i, _)| index.node(i).clone())
        .collect();
    debug!(roots = starts.len(), reached = keep.len(), total = index.len(), "reachability computed");
    ReachedGraph {
        roots: starts.iter().map(|&i| index.node(i).clone()).collect(),
        graph: graph.induced_subgraph(&keep),
    }
}

/// Reached set of a client package.
pub fn reached_from_package(graph: &UnifiedGraph, client: &PackageVersion) -> ReachedGraph {
    reached_graph(graph, &client_roots(graph, client))
}
