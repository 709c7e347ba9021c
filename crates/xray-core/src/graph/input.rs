//! Call graphs supplied by the external analyzers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::bridges::symbols::ExportedSymbol;
use crate::errors::{XrayError, XrayResult};
use crate::models::{LibraryRef, PackageVersion};

// ---------------------------------------------------------------------------
// Interpreted
// ---------------------------------------------------------------------------

/// Source-level call graph of one package release.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpretedCallGraph {
    pub package: PackageVersion,
    /// Fully qualified names of every function and class the package defines.
    pub functions: BTreeSet<String>,
    /// Calls between declared functions.
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    /// Calls from a declared function to a dotted name defined elsewhere.
    #[serde(default)]
    pub external_calls: Vec<(String, String)>,
}

impl InterpretedCallGraph {
    pub fn new(package: PackageVersion) -> Self {
        Self {
            package,
            ..Self::default()
        }
    }

    pub fn add_function(&mut self, name: impl Into<String>) {
        self.functions.insert(name.into());
    }

    /// Add an internal edge, declaring both endpoints.
    pub fn add_edge(&mut self, caller: impl Into<String>, callee: impl Into<String>) {
        let (caller, callee) = (caller.into(), callee.into());
        self.functions.insert(caller.clone());
        self.functions.insert(callee.clone());
        self.edges.push((caller, callee));
    }

    pub fn add_external_call(&mut self, caller: impl Into<String>, callee: impl Into<String>) {
        let caller = caller.into();
        self.functions.insert(caller.clone());
        self.external_calls.push((caller, callee.into()));
    }

    /// Every edge endpoint must be a declared function.
    pub fn validate(&self) -> XrayResult<()> {
        let source = format!("interpreted graph {}", self.package);
        for (caller, callee) in &self.edges {
            for end in [caller, callee] {
                if !self.functions.contains(end) {
                    return Err(XrayError::inconsistency(
                        &source,
                        format!("edge {caller} -> {callee} references undeclared {end}"),
                    ));
                }
            }
        }
        for (caller, callee) in &self.external_calls {
            if !self.functions.contains(caller) {
                return Err(XrayError::inconsistency(
                    &source,
                    format!("external call {caller} -> {callee} has an undeclared caller"),
                ));
            }
        }
        Ok(())
    }

    /// Top-level import names this package defines.
    pub fn top_levels(&self) -> BTreeSet<String> {
        self.functions
            .iter()
            .filter_map(|f| f.split('.').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Native
// ---------------------------------------------------------------------------

/// Binary call graph of one shared object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCallGraph {
    pub library: LibraryRef,
    /// Symbols defined in this library.
    pub functions: BTreeSet<String>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    #[serde(default)]
    pub exports: Vec<ExportedSymbol>,
    /// Undefined symbols this library calls into.
    #[serde(default)]
    pub imports: BTreeSet<String>,
}

/// Analyzer output: `{nodes: {"<idx>": {name}}, edges: [[s, d]], exports?, imports?}`.
#[derive(Debug, Deserialize)]
struct AnalyzerOutput {
    #[serde(default)]
    nodes: BTreeMap<String, AnalyzerNode>,
    #[serde(default)]
    edges: Vec<(String, String)>,
    #[serde(default)]
    exports: Vec<ExportedSymbol>,
    #[serde(default)]
    imports: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnalyzerNode {
    name: String,
}

impl NativeCallGraph {
    pub fn new(library: LibraryRef) -> Self {
        Self {
            library,
            functions: BTreeSet::new(),
            edges: Vec::new(),
            exports: Vec::new(),
            imports: BTreeSet::new(),
        }
    }

    pub fn add_edge(&mut self, caller: impl Into<String>, callee: impl Into<String>) {
        let (caller, callee) = (caller.into(), callee.into());
        self.functions.insert(caller.clone());
        if !self.imports.contains(&callee) {
            self.functions.insert(callee.clone());
        }
        self.edges.push((caller, callee));
    }

    pub fn add_export(&mut self, name: impl Into<String>, offset: u64) {
        let name = name.into();
        self.functions.insert(name.clone());
        self.exports.push(ExportedSymbol::new(name, offset));
    }

    pub fn add_import(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.functions.remove(&name);
        self.imports.insert(name);
    }

    /// Every node referenced by edges: defined functions and imported stubs.
    pub fn declares(&self, symbol: &str) -> bool {
        self.functions.contains(symbol) || self.imports.contains(symbol)
    }

    pub fn exports_symbol(&self, symbol: &str) -> bool {
        self.exports.iter().any(|e| e.name == symbol)
    }

    pub fn validate(&self) -> XrayResult<()> {
        let source = format!("native graph {}", self.library);
        for (caller, callee) in &self.edges {
            for end in [caller, callee] {
                if !self.declares(end) {
                    return Err(XrayError::inconsistency(
                        &source,
                        format!("edge {caller} -> {callee} references undeclared {end}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Parse the indexed analyzer output for `library`.
    ///
    /// Edge endpoints may be node indices (as strings or numbers) and must
    /// name a listed node. Imported symbols are listed as nodes too; they
    /// become stubs rather than definitions.
    pub fn from_analyzer_json(library: LibraryRef, text: &str) -> XrayResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let normalized = normalize_edge_indices(value);
        let raw: AnalyzerOutput = serde_json::from_value(normalized)?;

        let mut graph = NativeCallGraph::new(library);
        graph.imports = raw.imports.into_iter().collect();
        for node in raw.nodes.values() {
            if !graph.imports.contains(&node.name) {
                graph.functions.insert(node.name.clone());
            }
        }
        for (src, dst) in raw.edges {
            let (Some(a), Some(b)) = (raw.nodes.get(&src), raw.nodes.get(&dst)) else {
                return Err(XrayError::inconsistency(
                    format!("native graph {}", graph.library),
                    format!("edge [{src}, {dst}] references an undeclared node"),
                ));
            };
            graph.edges.push((a.name.clone(), b.name.clone()));
        }
        for export in raw.exports {
            graph.functions.insert(export.name.clone());
            graph.exports.push(export);
        }
        graph.exports.sort();
        graph.exports.dedup();
        Ok(graph)
    }
}

/// Edge indices may be emitted as numbers; map them to the string keys used by `nodes`.
fn normalize_edge_indices(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(edges) = value.get_mut("edges").and_then(|e| e.as_array_mut()) {
        for edge in edges.iter_mut() {
            if let Some(pair) = edge.as_array_mut() {
                for end in pair.iter_mut() {
                    if let Some(n) = end.as_u64() {
                        *end = serde_json::Value::String(n.to_string());
                    }
                }
            }
        }
    }
    value
}
