//! Graph stitching: interpreted graphs + native graphs + bridges -> one
//! [`UnifiedGraph`].
//!
//! Stitching is a pure function of its inputs. All intermediate lookups use
//! ordered maps, and the output is a set-based graph, so permuting any input
//! list yields the same graph and the same report.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::input::{InterpretedCallGraph, NativeCallGraph};
use super::model::{NodeId, UnifiedGraph};
use crate::errors::XrayResult;
use crate::models::{Bridge, BridgeReport, LibraryRef, PackageVersion};

const CONSTRUCTOR_SUFFIX: &str = ".__init__";

/// Everything one stitch consumes.
#[derive(Clone, Copy, Debug, Default)]
pub struct StitchInputs<'a> {
    pub interpreted: &'a [InterpretedCallGraph],
    pub native: &'a [NativeCallGraph],
    pub bridges: &'a [BridgeReport],
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BridgeMiss {
    pub package: PackageVersion,
    pub bridge: Bridge,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalMiss {
    pub package: PackageVersion,
    pub caller: String,
    pub callee: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImportMiss {
    pub library: LibraryRef,
    pub symbol: String,
}

/// Unified graph plus everything that could not be connected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StitchReport {
    pub graph: UnifiedGraph,
    pub bridges_applied: usize,
    pub missing_interpreted: Vec<BridgeMiss>,
    pub missing_native: Vec<BridgeMiss>,
    pub externals_resolved: usize,
    pub missed_externals: Vec<ExternalMiss>,
    pub imports_linked: usize,
    pub unresolved_imports: Vec<ImportMiss>,
}

impl StitchReport {
    pub fn bridges_missed(&self) -> usize {
        self.missing_interpreted.len() + self.missing_native.len()
    }
}

// ---------------------------------------------------------------------------
// Stitcher
// ---------------------------------------------------------------------------

/// Build the unified graph.
///
/// Fails only on malformed input (an edge naming an undeclared node); every
/// other mismatch is recorded in the report.
pub fn stitch(inputs: StitchInputs<'_>) -> XrayResult<StitchReport> {
    for graph in inputs.interpreted {
        graph.validate()?;
    }
    for graph in inputs.native {
        graph.validate()?;
    }

    let mut report = StitchReport::default();

    let interpreted: BTreeMap<&PackageVersion, BTreeSet<&str>> = merge_interpreted(inputs.interpreted);
    add_interpreted(&mut report, inputs.interpreted, &interpreted);
    resolve_externals(&mut report, inputs.interpreted, &interpreted);
    add_native(&mut report, inputs.native);
    link_imports(&mut report, inputs.native);
    apply_bridges(&mut report, inputs.bridges);

    report.missing_interpreted.sort();
    report.missing_native.sort();
    report.missed_externals.sort();
    report.missed_externals.dedup();
    report.unresolved_imports.sort();
    report.unresolved_imports.dedup();

    info!(
        nodes = report.graph.node_count(),
        edges = report.graph.edge_count(),
        bridges_applied = report.bridges_applied,
        bridges_missed = report.bridges_missed(),
        externals_missed = report.missed_externals.len(),
        "stitch finished"
    );
    Ok(report)
}

/// Declared names per package; a package supplied in several pieces is merged.
fn merge_interpreted(graphs: &[InterpretedCallGraph]) -> BTreeMap<&PackageVersion, BTreeSet<&str>> {
    let mut out: BTreeMap<&PackageVersion, BTreeSet<&str>> = BTreeMap::new();
    for graph in graphs {
        out.entry(&graph.package)
            .or_default()
            .extend(graph.functions.iter().map(String::as_str));
    }
    out
}

fn constructor_of(name: &str) -> String {
    format!("{name}{CONSTRUCTOR_SUFFIX}")
}

fn add_interpreted(
    report: &mut StitchReport,
    graphs: &[InterpretedCallGraph],
    declared: &BTreeMap<&PackageVersion, BTreeSet<&str>>,
) {
    for graph in graphs {
        let package = &graph.package;
        let names = declared.get(package);
        for function in &graph.functions {
            report.graph.add_node(NodeId::interpreted(package, function.as_str()));
        }
        for (caller, callee) in &graph.edges {
            let from = NodeId::interpreted(package, caller.as_str());
            report
                .graph
                .add_edge(from.clone(), NodeId::interpreted(package, callee.as_str()));
            let ctor = constructor_of(callee);
            if names.is_some_and(|n| n.contains(ctor.as_str())) {
                report.graph.add_edge(from, NodeId::interpreted(package, ctor));
            }
        }
    }
}

/// Resolve calls into other packages by the owner of the callee's top-level name.
fn resolve_externals(
    report: &mut StitchReport,
    graphs: &[InterpretedCallGraph],
    declared: &BTreeMap<&PackageVersion, BTreeSet<&str>>,
) {
    // Iterating packages in order makes the smallest package win a contested name.
    let mut owners: BTreeMap<&str, &PackageVersion> = BTreeMap::new();
    for (package, names) in declared {
        for name in names {
            if let Some(top) = name.split('.').next() {
                owners.entry(top).or_insert(*package);
            }
        }
    }

    for graph in graphs {
        for (caller, callee) in &graph.external_calls {
            let from = NodeId::interpreted(&graph.package, caller.as_str());
            let top = callee.split('.').next().unwrap_or(callee);
            let owner = owners.get(top).copied();
            let names = owner.and_then(|p| declared.get(p));

            let mut hit = false;
            if let (Some(owner), Some(names)) = (owner, names) {
                if names.contains(callee.as_str()) {
                    report
                        .graph
                        .add_edge(from.clone(), NodeId::interpreted(owner, callee.as_str()));
                    hit = true;
                }
                let ctor = constructor_of(callee);
                if names.contains(ctor.as_str()) {
                    report.graph.add_edge(from.clone(), NodeId::interpreted(owner, ctor));
                    hit = true;
                }
            }
            if hit {
                report.externals_resolved += 1;
            } else {
                debug!(package = %graph.package, caller = %caller, callee = %callee, "external call unresolved");
                report.missed_externals.push(ExternalMiss {
                    package: graph.package.clone(),
                    caller: caller.clone(),
                    callee: callee.clone(),
                });
            }
        }
    }
}

fn add_native(report: &mut StitchReport, graphs: &[NativeCallGraph]) {
    for graph in graphs {
        let lib = &graph.library;
        for symbol in graph.functions.iter().chain(graph.imports.iter()) {
            report.graph.add_node(NodeId::native(lib, symbol.as_str()));
        }
        for (caller, callee) in &graph.edges {
            report.graph.add_edge(
                NodeId::native(lib, caller.as_str()),
                NodeId::native(lib, callee.as_str()),
            );
        }
    }
}

/// Link each imported stub to the library exporting that symbol.
///
/// Candidates from the importing library's own package win; ties go to the
/// smallest [`LibraryRef`].
fn link_imports(report: &mut StitchReport, graphs: &[NativeCallGraph]) {
    let mut exporters: BTreeMap<&str, BTreeSet<&LibraryRef>> = BTreeMap::new();
    for graph in graphs {
        for export in &graph.exports {
            exporters
                .entry(export.name.as_str())
                .or_default()
                .insert(&graph.library);
        }
    }

    for graph in graphs {
        let lib = &graph.library;
        for symbol in &graph.imports {
            let candidates = exporters.get(symbol.as_str());
            let target = candidates.and_then(|libs| {
                let others = || libs.iter().copied().filter(|l| *l != lib);
                others()
                    .find(|l| l.package == lib.package)
                    .or_else(|| others().next())
            });
            match target {
                Some(target) => {
                    report.graph.add_edge(
                        NodeId::native(lib, symbol.as_str()),
                        NodeId::native(target, symbol.as_str()),
                    );
                    report.imports_linked += 1;
                }
                None => report.unresolved_imports.push(ImportMiss {
                    library: lib.clone(),
                    symbol: symbol.clone(),
                }),
            }
        }
    }
}

fn apply_bridges(report: &mut StitchReport, reports: &[BridgeReport]) {
    let mut seen: BTreeSet<(PackageVersion, Bridge)> = BTreeSet::new();
    for bridge_report in reports {
        let package = &bridge_report.package;
        for bridge in &bridge_report.bridges {
            if !seen.insert((package.clone(), bridge.clone())) {
                continue;
            }
            let from = NodeId::interpreted(package, bridge.pyname.as_str());
            let to = NodeId::native(&bridge.library_ref(package), bridge.native_symbol.as_str());
            let miss = BridgeMiss {
                package: package.clone(),
                bridge: bridge.clone(),
            };
            if !report.graph.contains_node(&from) {
                debug!(pyname = %bridge.pyname, "bridge source not in interpreted graph");
                report.missing_interpreted.push(miss);
            } else if !report.graph.contains_node(&to) {
                warn!(symbol = %bridge.native_symbol, library = %bridge.library, "bridge target not in native graph");
                report.missing_native.push(miss);
            } else {
                report.graph.add_edge(from, to);
                report.bridges_applied += 1;
            }
        }
    }
}
