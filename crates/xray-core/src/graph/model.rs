//! Unified call graph: scoped node identities and a value-semantics graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{XrayError, XrayResult};
use crate::models::{LibraryRef, PackageVersion};

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identity of a call-graph node.
///
/// Interpreted nodes are scoped by their defining package release and native
/// nodes by their library, so the two spaces never collide and the same
/// symbol name in two libraries is two nodes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeId {
    Interpreted {
        package: PackageVersion,
        name: String,
    },
    Native {
        library: LibraryRef,
        symbol: String,
    },
}

impl NodeId {
    pub fn interpreted(package: &PackageVersion, name: impl Into<String>) -> Self {
        NodeId::Interpreted {
            package: package.clone(),
            name: name.into(),
        }
    }

    pub fn native(library: &LibraryRef, symbol: impl Into<String>) -> Self {
        NodeId::Native {
            library: library.clone(),
            symbol: symbol.into(),
        }
    }

    /// Dotted name or native symbol.
    pub fn name(&self) -> &str {
        match self {
            NodeId::Interpreted { name, .. } => name,
            NodeId::Native { symbol, .. } => symbol,
        }
    }

    /// Package that defines (or installed the library of) this node.
    pub fn package(&self) -> &PackageVersion {
        match self {
            NodeId::Interpreted { package, .. } => package,
            NodeId::Native { library, .. } => &library.package,
        }
    }

    pub fn library(&self) -> Option<&LibraryRef> {
        match self {
            NodeId::Native { library, .. } => Some(library),
            NodeId::Interpreted { .. } => None,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, NodeId::Native { .. })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Interpreted { package, name } => write!(f, "{package}::{name}"),
            NodeId::Native { library, symbol } => write!(f, "{library}::{symbol}"),
        }
    }
}

// ---------------------------------------------------------------------------
// UnifiedGraph
// ---------------------------------------------------------------------------

pub type Edge = (NodeId, NodeId);

/// Deduplicated node and edge sets. Every edge endpoint is a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "SerializedGraph", try_from = "SerializedGraph")]
pub struct UnifiedGraph {
    nodes: BTreeSet<NodeId>,
    edges: BTreeSet<Edge>,
}

impl UnifiedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeId) -> bool {
        self.nodes.insert(node)
    }

    /// Insert an edge, adding its endpoints as nodes.
    pub fn add_edge(&mut self, caller: NodeId, callee: NodeId) -> bool {
        self.nodes.insert(caller.clone());
        self.nodes.insert(callee.clone());
        self.edges.insert((caller, callee))
    }

    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn contains_edge(&self, caller: &NodeId, callee: &NodeId) -> bool {
        self.edges.contains(&(caller.clone(), callee.clone()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes defined by `package` in its interpreted namespace.
    pub fn interpreted_nodes_of<'a>(
        &'a self,
        package: &'a PackageVersion,
    ) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.nodes
            .iter()
            .filter(move |n| matches!(n, NodeId::Interpreted { package: p, .. } if p == package))
    }

    /// Union of two graphs.
    pub fn merge(&mut self, other: &UnifiedGraph) {
        self.nodes.extend(other.nodes.iter().cloned());
        self.edges.extend(other.edges.iter().cloned());
    }

    /// Subgraph over `keep`, with every edge whose endpoints are both kept.
    pub fn induced_subgraph(&self, keep: &BTreeSet<NodeId>) -> UnifiedGraph {
        let nodes: BTreeSet<NodeId> = self.nodes.intersection(keep).cloned().collect();
        let edges = self
            .edges
            .iter()
            .filter(|(a, b)| nodes.contains(a) && nodes.contains(b))
            .cloned()
            .collect();
        UnifiedGraph { nodes, edges }
    }

    pub fn to_json(&self) -> XrayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> XrayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Indexed wire form
// ---------------------------------------------------------------------------

/// One node of the indexed form. `library` is present only on native nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub name: String,
    pub package: PackageVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
}

/// `{nodes: {"<idx>": {...}}, edges: [[src, dst]]}` with indices in sorted node order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedGraph {
    pub nodes: BTreeMap<usize, SerializedNode>,
    pub edges: Vec<[usize; 2]>,
}

impl From<UnifiedGraph> for SerializedGraph {
    fn from(graph: UnifiedGraph) -> Self {
        let index: BTreeMap<&NodeId, usize> =
            graph.nodes.iter().enumerate().map(|(i, n)| (n, i)).collect();
        let nodes = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let serialized = match node {
                    NodeId::Interpreted { package, name } => SerializedNode {
                        name: name.clone(),
                        package: package.clone(),
                        library: None,
                    },
                    NodeId::Native { library, symbol } => SerializedNode {
                        name: symbol.clone(),
                        package: library.package.clone(),
                        library: Some(library.path.clone()),
                    },
                };
                (i, serialized)
            })
            .collect();
        let edges = graph
            .edges
            .iter()
            .filter_map(|(a, b)| Some([*index.get(a)?, *index.get(b)?]))
            .collect();
        SerializedGraph { nodes, edges }
    }
}

impl TryFrom<SerializedGraph> for UnifiedGraph {
    type Error = XrayError;

    fn try_from(raw: SerializedGraph) -> XrayResult<Self> {
        let mut by_index: BTreeMap<usize, NodeId> = BTreeMap::new();
        let mut graph = UnifiedGraph::new();
        for (idx, node) in raw.nodes {
            let id = match node.library {
                Some(path) => NodeId::Native {
                    library: LibraryRef::new(node.package, path),
                    symbol: node.name,
                },
                None => NodeId::Interpreted {
                    package: node.package,
                    name: node.name,
                },
            };
            graph.add_node(id.clone());
            by_index.insert(idx, id);
        }
        for [src, dst] in raw.edges {
            let (Some(a), Some(b)) = (by_index.get(&src), by_index.get(&dst)) else {
                return Err(XrayError::inconsistency(
                    "serialized graph",
                    format!("edge [{src}, {dst}] references an undeclared node"),
                ));
            };
            graph.add_edge(a.clone(), b.clone());
        }
        Ok(graph)
    }
}
