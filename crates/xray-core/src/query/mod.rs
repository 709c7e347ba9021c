pub mod centrality;
pub mod chains;
pub mod guards;
pub mod reach;

pub use centrality::{centrality, vulnerability_impact, CentralityResult, DependentImpact, TargetSymbol};
pub use chains::{enumerate_chains, find_targets, shortest_chain, Chain, ChainQueryResult};
pub use reach::{client_roots, reached_from_package, reached_graph, GraphIndex, ReachedGraph};
