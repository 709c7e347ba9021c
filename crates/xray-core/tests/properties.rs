mod common;

use std::collections::BTreeSet;

use _xray_core::config::ChainConfig;
use _xray_core::graph::{stitch, InterpretedCallGraph, NativeCallGraph, NodeId, StitchInputs, UnifiedGraph};
use _xray_core::models::{Bridge, BridgeReport, LibraryRef, PackageVersion};
use _xray_core::query::{enumerate_chains, reached_graph, GraphIndex};
use proptest::prelude::*;

use common::*;

const PACKAGES: [&str; 3] = ["app", "lib", "ext"];

fn fn_name(package: &str, i: u8) -> String {
    format!("{package}.f{i}")
}

fn sym_name(i: u8) -> String {
    format!("sym{i}")
}

fn library(package: &PackageVersion) -> LibraryRef {
    LibraryRef::new(package.clone(), format!("{}/_native.so", package.name))
}

/// Per-package interpreted edges, native edges and bridges over a small name space.
#[derive(Clone, Debug)]
struct Inputs {
    interpreted: Vec<InterpretedCallGraph>,
    native: Vec<NativeCallGraph>,
    bridges: Vec<BridgeReport>,
}

fn inputs_strategy() -> impl Strategy<Value = Inputs> {
    let edges = || prop::collection::vec((0u8..6, 0u8..6), 0..12);
    let links = || prop::collection::vec((0u8..6, 0u8..6), 0..4);
    (
        prop::collection::vec(edges(), 3),
        prop::collection::vec(edges(), 3),
        prop::collection::vec(links(), 3),
    )
        .prop_map(|(py_edges, c_edges, bridge_links)| {
            let mut inputs = Inputs {
                interpreted: Vec::new(),
                native: Vec::new(),
                bridges: Vec::new(),
            };
            for (p, name) in PACKAGES.iter().enumerate() {
                let package = pv(name);
                let lib = library(&package);

                let mut py = InterpretedCallGraph::new(package.clone());
                for (a, b) in &py_edges[p] {
                    py.add_edge(fn_name(name, *a), fn_name(name, *b));
                }
                for (a, _) in &bridge_links[p] {
                    py.add_function(fn_name(name, *a));
                }
                inputs.interpreted.push(py);

                let mut c = NativeCallGraph::new(lib.clone());
                for (a, b) in &c_edges[p] {
                    c.add_edge(sym_name(*a), sym_name(*b));
                }
                for (_, s) in &bridge_links[p] {
                    c.add_export(sym_name(*s), u64::from(*s) * 0x10);
                }
                inputs.native.push(c);

                let bridges = bridge_links[p]
                    .iter()
                    .map(|(a, s)| Bridge::new(fn_name(name, *a), sym_name(*s), lib.path.clone()))
                    .collect();
                inputs.bridges.push(report(&package, bridges));
            }
            inputs
        })
}

fn stitched(inputs: &Inputs) -> UnifiedGraph {
    stitch(StitchInputs {
        interpreted: &inputs.interpreted,
        native: &inputs.native,
        bridges: &inputs.bridges,
    })
    .unwrap()
    .graph
}

fn arbitrary_graph() -> impl Strategy<Value = UnifiedGraph> {
    prop::collection::vec((0u8..10, 0u8..10), 0..30).prop_map(|edges| {
        let package = pv("app");
        let mut graph = UnifiedGraph::new();
        for (a, b) in edges {
            graph.add_edge(
                NodeId::interpreted(&package, fn_name("app", a)),
                NodeId::interpreted(&package, fn_name("app", b)),
            );
        }
        graph
    })
}

fn node(i: u8) -> NodeId {
    NodeId::interpreted(&pv("app"), fn_name("app", i))
}

proptest! {
    #[test]
    fn stitching_ignores_input_order(
        inputs in inputs_strategy(),
        seed in any::<u64>(),
    ) {
        let mut shuffled = inputs.clone();
        let rotate = (seed % 3) as usize;
        shuffled.interpreted.rotate_left(rotate);
        shuffled.native.reverse();
        shuffled.bridges.rotate_right(rotate);
        for report in &mut shuffled.bridges {
            report.bridges.reverse();
        }
        prop_assert_eq!(stitched(&inputs), stitched(&shuffled));
    }

    #[test]
    fn adding_an_edge_never_shrinks_the_reached_set(
        graph in arbitrary_graph(),
        root in 0u8..10,
        extra in (0u8..10, 0u8..10),
    ) {
        let roots: BTreeSet<NodeId> = [node(root)].into_iter().collect();
        let before = reached_graph(&graph, &roots);

        let mut grown = graph.clone();
        grown.add_edge(node(extra.0), node(extra.1));
        let after = reached_graph(&grown, &roots);

        for n in before.graph.nodes() {
            prop_assert!(after.contains(n));
        }
    }

    #[test]
    fn enumerated_chains_are_simple_edge_paths(
        graph in arbitrary_graph(),
        root in 0u8..10,
        target in 0u8..10,
    ) {
        let roots: BTreeSet<NodeId> = [node(root)].into_iter().collect();
        let index = GraphIndex::new(&graph);
        let limits = ChainConfig { max_chains: 50, max_depth: 12 };
        let result = enumerate_chains(&index, &roots, &node(target), &limits);

        prop_assert!(result.chains.len() <= limits.max_chains);
        for chain in &result.chains {
            let distinct: BTreeSet<&NodeId> = chain.iter().collect();
            prop_assert_eq!(distinct.len(), chain.len());
            prop_assert!(chain.len() <= limits.max_depth + 1);
            prop_assert_eq!(chain.first(), Some(&node(root)));
            prop_assert_eq!(chain.last(), Some(&node(target)));
            for pair in chain.windows(2) {
                prop_assert!(graph.contains_edge(&pair[0], &pair[1]));
            }
        }
        let reached = reached_graph(&graph, &roots);
        if graph.contains_node(&node(root)) && !reached.contains(&node(target)) {
            prop_assert!(result.chains.is_empty());
        }
    }
}
