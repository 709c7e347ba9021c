//! Per-dependent centrality of a target node.
//!
//! One reverse-reachability pass from the target marks every node that can
//! reach it. A dependent's centrality is the marked fraction of its own
//! interpreted functions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::chains::{find_targets, shortest_chain, Chain};
use super::reach::GraphIndex;
use crate::graph::model::{NodeId, UnifiedGraph};
use crate::models::PackageVersion;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentralityResult {
    pub package: PackageVersion,
    pub target: NodeId,
    pub own_functions: usize,
    /// Own functions with at least one chain to the target.
    pub chain_count: usize,
    /// In `[0, 1]`; zero when the package has no own functions.
    pub centrality: f64,
    pub sample_chain: Option<Chain>,
}

/// Centrality of `target` for one dependent.
pub fn centrality(index: &GraphIndex, package: &PackageVersion, target: &NodeId) -> CentralityResult {
    let own = index.own_functions(package);
    let (reaching, sample_chain) = match index.position(target) {
        Some(t) => {
            let marked = index.reverse_closure(&[t]);
            let reaching: BTreeSet<NodeId> = own
                .iter()
                .filter(|&&i| marked[i])
                .map(|&i| index.node(i).clone())
                .collect();
            let sample = shortest_chain(index, &reaching, target);
            (reaching.len(), sample)
        }
        None => (0, None),
    };
    let ratio = if own.is_empty() {
        0.0
    } else {
        reaching as f64 / own.len() as f64
    };
    CentralityResult {
        package: package.clone(),
        target: target.clone(),
        own_functions: own.len(),
        chain_count: reaching,
        centrality: ratio,
        sample_chain,
    }
}

/// Centrality of `target` for each dependent sharing one graph.
pub fn centrality_by_dependent(
    graph: &UnifiedGraph,
    dependents: &[PackageVersion],
    target: &NodeId,
) -> BTreeMap<PackageVersion, CentralityResult> {
    let index = GraphIndex::new(graph);
    dependents
        .iter()
        .map(|p| (p.clone(), centrality(&index, p, target)))
        .collect()
}

// ---------------------------------------------------------------------------
// Vulnerability impact
// ---------------------------------------------------------------------------

/// A vulnerable symbol, optionally pinned to one library path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetSymbol {
    pub symbol: String,
    #[serde(default)]
    pub library: Option<String>,
}

/// Aggregate exposure of one dependent to a set of targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DependentImpact {
    pub package: PackageVersion,
    /// Highest centrality over all matched targets.
    pub centrality: f64,
    /// Sum over targets of own functions with a chain.
    pub chain_count: usize,
    pub sample_chain: Option<Chain>,
}

/// Exposure of each dependent (analysed in its own unified graph) to `targets`.
pub fn vulnerability_impact(
    dependents: &[(PackageVersion, &UnifiedGraph)],
    targets: &[TargetSymbol],
) -> Vec<DependentImpact> {
    let mut out = Vec::with_capacity(dependents.len());
    for (package, graph) in dependents {
        let index = GraphIndex::new(graph);
        let mut impact = DependentImpact {
            package: package.clone(),
            centrality: 0.0,
            chain_count: 0,
            sample_chain: None,
        };
        for target in targets {
            for node in find_targets(graph, &target.symbol, target.library.as_deref()) {
                let result = centrality(&index, package, &node);
                impact.chain_count += result.chain_count;
                let better_sample = match (&impact.sample_chain, &result.sample_chain) {
                    (None, Some(_)) => true,
                    (Some(current), Some(candidate)) => candidate.len() < current.len(),
                    _ => false,
                };
                if better_sample {
                    impact.sample_chain = result.sample_chain.clone();
                }
                if result.centrality > impact.centrality {
                    impact.centrality = result.centrality;
                }
            }
        }
        info!(
            package = %package,
            centrality = impact.centrality,
            chains = impact.chain_count,
            "dependent impact computed"
        );
        out.push(impact);
    }
    out
}
