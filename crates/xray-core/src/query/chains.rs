//! Call-chain queries: bounded simple-path enumeration and shortest witness.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::reach::GraphIndex;
use crate::config::ChainConfig;
use crate::graph::model::{NodeId, UnifiedGraph};

pub type Chain = Vec<NodeId>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainQueryResult {
    pub chains: Vec<Chain>,
    /// Set when a cap cut the enumeration short.
    pub truncated: bool,
}

/// Nodes named `symbol`, optionally restricted to one library path.
pub fn find_targets(graph: &UnifiedGraph, symbol: &str, library: Option<&str>) -> Vec<NodeId> {
    graph
        .nodes()
        .filter(|n| n.name() == symbol)
        .filter(|n| match library {
            Some(path) => n.library().is_some_and(|l| l.path == path),
            None => true,
        })
        .cloned()
        .collect()
}

/// Enumerate simple paths from any root to `target`.
///
/// Roots are tried in node order and successors in index order, so the
/// emitted chains are deterministic. Only nodes that can reach the target are
/// ever entered. At most `limits.max_chains` chains of at most
/// `limits.max_depth` edges are returned.
pub fn enumerate_chains(
    index: &GraphIndex,
    roots: &BTreeSet<NodeId>,
    target: &NodeId,
    limits: &ChainConfig,
) -> ChainQueryResult {
    let mut result = ChainQueryResult::default();
    let Some(target) = index.position(target) else {
        return result;
    };
    let useful = index.reverse_closure(&[target]);
    let mut on_path = vec![false; index.len()];

    'roots: for root in index.positions(roots) {
        if !useful[root] {
            continue;
        }
        let mut path: Vec<usize> = vec![root];
        let mut cursor: Vec<usize> = vec![0];
        on_path[root] = true;

        while let Some(&node) = path.last() {
            if node == target {
                if result.chains.len() >= limits.max_chains {
                    result.truncated = true;
                    for &n in &path {
                        on_path[n] = false;
                    }
                    break 'roots;
                }
                result
                    .chains
                    .push(path.iter().map(|&i| index.node(i).clone()).collect());
                on_path[node] = false;
                path.pop();
                cursor.pop();
                continue;
            }

            let Some(slot) = cursor.last_mut() else {
                break;
            };
            let successors = index.successors(node);
            if *slot >= successors.len() {
                on_path[node] = false;
                path.pop();
                cursor.pop();
                continue;
            }
            let next = successors[*slot];
            *slot += 1;
            if on_path[next] || !useful[next] {
                continue;
            }
            if path.len() > limits.max_depth {
                result.truncated = true;
                continue;
            }
            on_path[next] = true;
            path.push(next);
            cursor.push(0);
        }
    }

    debug!(chains = result.chains.len(), truncated = result.truncated, "chain enumeration finished");
    result
}

/// One shortest chain from any root to `target` (multi-source BFS).
pub fn shortest_chain(index: &GraphIndex, roots: &BTreeSet<NodeId>, target: &NodeId) -> Option<Chain> {
    let target = index.position(target)?;
    let mut parent: Vec<Option<usize>> = vec![None; index.len()];
    let mut visited = vec![false; index.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();
    for root in index.positions(roots) {
        visited[root] = true;
        queue.push_back(root);
    }

    while let Some(current) = queue.pop_front() {
        if current == target {
            let mut chain = vec![current];
            let mut cursor = current;
            while let Some(prev) = parent[cursor] {
                chain.push(prev);
                cursor = prev;
            }
            chain.reverse();
            return Some(chain.into_iter().map(|i| index.node(i).clone()).collect());
        }
        for &next in index.successors(current) {
            if !visited[next] {
                visited[next] = true;
                parent[next] = Some(current);
                queue.push_back(next);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LibraryRef, PackageVersion};

    fn pv() -> PackageVersion {
        PackageVersion::new("pkg", "1.0")
    }

    fn n(name: &str) -> NodeId {
        NodeId::interpreted(&pv(), name)
    }

    fn roots(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|s| n(s)).collect()
    }

    /// a -> b -> d, a -> c -> d, c -> b, d -> a (cycle back)
    fn diamond() -> UnifiedGraph {
        let mut g = UnifiedGraph::new();
        g.add_edge(n("a"), n("b"));
        g.add_edge(n("a"), n("c"));
        g.add_edge(n("b"), n("d"));
        g.add_edge(n("c"), n("d"));
        g.add_edge(n("c"), n("b"));
        g.add_edge(n("d"), n("a"));
        g
    }

    #[test]
    fn enumerates_all_simple_paths() {
        let g = diamond();
        let index = GraphIndex::new(&g);
        let result = enumerate_chains(&index, &roots(&["a"]), &n("d"), &ChainConfig::default());
        assert!(!result.truncated);
        let names: Vec<Vec<&str>> = result
            .chains
            .iter()
            .map(|c| c.iter().map(|x| x.name()).collect())
            .collect();
        assert_eq!(
            names,
            vec![vec!["a", "b", "d"], vec!["a", "c", "b", "d"], vec!["a", "c", "d"]]
        );
    }

    #[test]
    fn chain_cap_sets_truncated() {
        let g = diamond();
        let index = GraphIndex::new(&g);
        let limits = ChainConfig {
            max_chains: 2,
            ..ChainConfig::default()
        };
        let result = enumerate_chains(&index, &roots(&["a"]), &n("d"), &limits);
        assert_eq!(result.chains.len(), 2);
        assert!(result.truncated);
    }

    #[test]
    fn depth_cap_drops_long_paths() {
        let g = diamond();
        let index = GraphIndex::new(&g);
        let limits = ChainConfig {
            max_depth: 2,
            ..ChainConfig::default()
        };
        let result = enumerate_chains(&index, &roots(&["a"]), &n("d"), &limits);
        assert_eq!(result.chains.len(), 2);
        assert!(result.chains.iter().all(|c| c.len() <= 3));
        assert!(result.truncated);
    }

    #[test]
    fn root_equal_to_target_is_a_single_node_chain() {
        let g = diamond();
        let index = GraphIndex::new(&g);
        let result = enumerate_chains(&index, &roots(&["d"]), &n("d"), &ChainConfig::default());
        assert_eq!(result.chains, vec![vec![n("d")]]);
    }

    #[test]
    fn shortest_chain_uses_bfs() {
        let g = diamond();
        let index = GraphIndex::new(&g);
        let chain = shortest_chain(&index, &roots(&["a"]), &n("d")).unwrap();
        assert_eq!(chain.len(), 3);
        assert!(shortest_chain(&index, &roots(&["a"]), &n("zzz")).is_none());
    }

    #[test]
    fn targets_can_be_scoped_by_library() {
        let a = LibraryRef::new(pv(), "a.so");
        let b = LibraryRef::new(pv(), "b.so");
        let mut g = UnifiedGraph::new();
        g.add_node(NodeId::native(&a, "foo"));
        g.add_node(NodeId::native(&b, "foo"));
        assert_eq!(find_targets(&g, "foo", None).len(), 2);
        assert_eq!(find_targets(&g, "foo", Some("b.so")), vec![NodeId::native(&b, "foo")]);
    }
}
