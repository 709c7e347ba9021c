//! Python bindings for the `_xray_core` extension module.
//!
//! Structured inputs cross the boundary as JSON strings and results come back
//! as plain Python objects built with `json.loads`.

pub mod runtime;

use std::collections::BTreeMap;
use std::path::PathBuf;

use pyo3::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::bridges::discovery::default_entry_modules;
use crate::bridges::recovery::{recover_bridges, ScanRequest};
use crate::bridges::symbols::{resolver_for_package, ExportedSymbol};
use crate::bridges::ObjectModel;
use crate::config::{expand_tilde, CacheConfig, XrayConfig};
use crate::errors::XrayError;
use crate::graph::input::{InterpretedCallGraph, NativeCallGraph};
use crate::graph::model::UnifiedGraph;
use crate::graph::stitch::{stitch, StitchInputs};
use crate::models::{BridgeReport, PackageVersion};
use crate::query::centrality::{vulnerability_impact, TargetSymbol};
use crate::query::chains::{enumerate_chains, find_targets, ChainQueryResult};
use crate::query::guards;
use crate::query::reach::{client_roots, reached_from_package, GraphIndex};
use crate::store::cache::{CacheKey, CacheKind, CacheManager};

use self::runtime::{current_library_ranges, LiveRuntime};

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json_str = serde_json::to_string(value).map_err(XrayError::from)?;
    let json_module = py.import("json")?;
    json_module
        .call_method1("loads", (json_str,))
        .map(|o| o.into())
}

fn parse_all<T: serde::de::DeserializeOwned>(texts: &[String]) -> PyResult<Vec<T>> {
    texts
        .iter()
        .map(|t| serde_json::from_str(t).map_err(|e| PyErr::from(XrayError::from(e))))
        .collect()
}

// ---------------------------------------------------------------------------
// Bridge recovery
// ---------------------------------------------------------------------------

/// Scan an installed package in this interpreter and return its bridge report.
///
/// `exports_json` maps root-relative library paths to `[{name, offset}]`.
#[pyfunction]
#[pyo3(signature = (name, version, root, entry_modules=None, exports_json=None, emit_import_bridges=false))]
pub fn scan_bridges(
    py: Python<'_>,
    name: &str,
    version: &str,
    root: PathBuf,
    entry_modules: Option<Vec<String>>,
    exports_json: Option<&str>,
    emit_import_bridges: bool,
) -> PyResult<PyObject> {
    let package = PackageVersion::new(name, version);
    let root = std::fs::canonicalize(expand_tilde(&root.to_string_lossy())).map_err(XrayError::Io)?;
    let entries = entry_modules.unwrap_or_else(|| default_entry_modules(&root));
    let mut scan = XrayConfig::load(None)?.scan;
    scan.emit_import_bridges |= emit_import_bridges;

    let runtime = LiveRuntime::new();
    runtime.add_to_path(&root)?;
    for entry in &entries {
        // Map the native libraries before reading the address space.
        if let Err(e) = runtime.import_module(entry) {
            debug!(module = %entry, error = %e, "entry import failed before mapping");
        }
    }
    let ranges = current_library_ranges(&root)?;
    let exports: BTreeMap<String, Vec<ExportedSymbol>> = match exports_json {
        Some(text) => serde_json::from_str(text).map_err(XrayError::from)?,
        None => BTreeMap::new(),
    };
    let resolver = resolver_for_package(&package, &ranges, &exports, scan.match_mode);
    let request = ScanRequest {
        package: &package,
        root: &root,
        entry_modules: &entries,
    };
    let report = recover_bridges(&runtime, &resolver, &request, &scan);
    to_py(py, &report)
}

// ---------------------------------------------------------------------------
// Stitching and reachability
// ---------------------------------------------------------------------------

#[pyfunction]
pub fn stitch_graphs(
    py: Python<'_>,
    interpreted: Vec<String>,
    native: Vec<String>,
    bridge_reports: Vec<String>,
) -> PyResult<PyObject> {
    let interpreted: Vec<InterpretedCallGraph> = parse_all(&interpreted)?;
    let native: Vec<NativeCallGraph> = parse_all(&native)?;
    let bridges: Vec<BridgeReport> = parse_all(&bridge_reports)?;
    let report = py.allow_threads(|| {
        stitch(StitchInputs {
            interpreted: &interpreted,
            native: &native,
            bridges: &bridges,
        })
    })?;
    to_py(py, &report)
}

#[pyfunction]
pub fn reached_graph(py: Python<'_>, graph_json: &str, name: &str, version: &str) -> PyResult<PyObject> {
    let graph = UnifiedGraph::from_json(graph_json)?;
    let client = PackageVersion::new(name, version);
    let reached = py.allow_threads(|| reached_from_package(&graph, &client));
    to_py(py, &reached)
}

/// Simple chains from the client's own functions to every node named `symbol`.
#[pyfunction]
#[pyo3(signature = (graph_json, name, version, symbol, library=None, max_chains=None, max_depth=None))]
#[allow(clippy::too_many_arguments)]
pub fn call_chains(
    py: Python<'_>,
    graph_json: &str,
    name: &str,
    version: &str,
    symbol: &str,
    library: Option<&str>,
    max_chains: Option<usize>,
    max_depth: Option<usize>,
) -> PyResult<PyObject> {
    let graph = UnifiedGraph::from_json(graph_json)?;
    let client = PackageVersion::new(name, version);
    let mut limits = XrayConfig::load(None)?.chains;
    if let Some(n) = max_chains {
        limits.max_chains = guards::clamp_limit(n, guards::MAX_CHAINS);
    }
    if let Some(d) = max_depth {
        limits.max_depth = guards::clamp_depth(d, guards::MAX_CHAIN_DEPTH);
    }
    let result = py.allow_threads(|| {
        let index = GraphIndex::new(&graph);
        let roots = client_roots(&graph, &client);
        let mut merged = ChainQueryResult::default();
        for target in find_targets(&graph, symbol, library) {
            let remaining = limits.max_chains.saturating_sub(merged.chains.len());
            if remaining == 0 {
                merged.truncated = true;
                break;
            }
            let mut per_target = limits.clone();
            per_target.max_chains = remaining;
            let found = enumerate_chains(&index, &roots, &target, &per_target);
            merged.truncated |= found.truncated;
            merged.chains.extend(found.chains);
        }
        merged
    });
    to_py(py, &result)
}

#[pyfunction]
#[pyo3(signature = (graph_json, name, version, symbol, library=None))]
pub fn shortest_chain(
    py: Python<'_>,
    graph_json: &str,
    name: &str,
    version: &str,
    symbol: &str,
    library: Option<&str>,
) -> PyResult<PyObject> {
    let graph = UnifiedGraph::from_json(graph_json)?;
    let client = PackageVersion::new(name, version);
    let chain = py.allow_threads(|| {
        let index = GraphIndex::new(&graph);
        let roots = client_roots(&graph, &client);
        find_targets(&graph, symbol, library)
            .iter()
            .filter_map(|t| crate::query::chains::shortest_chain(&index, &roots, t))
            .min_by_key(Vec::len)
    });
    to_py(py, &chain)
}

/// Centrality of `symbol` for each `(name, version)` dependent, keyed `name:version`.
#[pyfunction]
#[pyo3(signature = (graph_json, dependents, symbol, library=None))]
pub fn centrality(
    py: Python<'_>,
    graph_json: &str,
    dependents: Vec<(String, String)>,
    symbol: &str,
    library: Option<String>,
) -> PyResult<PyObject> {
    let graph = UnifiedGraph::from_json(graph_json)?;
    let targets = [TargetSymbol {
        symbol: symbol.to_string(),
        library,
    }];
    let by_dependent = py.allow_threads(|| {
        let pairs: Vec<(PackageVersion, &UnifiedGraph)> = dependents
            .iter()
            .map(|(n, v)| (PackageVersion::new(n.as_str(), v.as_str()), &graph))
            .collect();
        vulnerability_impact(&pairs, &targets)
            .into_iter()
            .map(|impact| (impact.package.to_string(), impact))
            .collect::<BTreeMap<_, _>>()
    });
    to_py(py, &by_dependent)
}

#[pyfunction]
#[pyo3(name = "init_tracing")]
pub fn py_init_tracing() {
    crate::logging::init_tracing();
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Durable compute-once cache shared by every analysis stage.
#[pyclass(name = "Cache")]
pub struct PyCache {
    inner: CacheManager,
}

fn cache_key(kind: &str, name: &str, version: &str, context: &str) -> PyResult<CacheKey> {
    let kind = CacheKind::parse(kind).ok_or_else(|| XrayError::Config(format!("unknown cache kind {kind:?}")))?;
    Ok(CacheKey::new(kind, PackageVersion::new(name, version), context))
}

#[pymethods]
impl PyCache {
    #[new]
    #[pyo3(signature = (path, lease_secs=None, poll_interval_ms=None))]
    pub fn new(path: PathBuf, lease_secs: Option<u64>, poll_interval_ms: Option<u64>) -> PyResult<Self> {
        let mut config = CacheConfig {
            path: expand_tilde(&path.to_string_lossy()),
            ..CacheConfig::default()
        };
        if let Some(secs) = lease_secs {
            config.lease_secs = secs;
        }
        if let Some(ms) = poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        Ok(Self {
            inner: CacheManager::open(&config)?,
        })
    }

    #[getter]
    fn path(&self) -> String {
        self.inner.db_path().to_string_lossy().into_owned()
    }

    /// Return the payload for the key, calling `compute()` (which must return
    /// a string) only if no other caller owns or has completed it. The GIL is
    /// released while waiting on another owner.
    fn get_or_compute(
        &self,
        py: Python<'_>,
        kind: &str,
        name: &str,
        version: &str,
        context: &str,
        compute: PyObject,
    ) -> PyResult<String> {
        let key = cache_key(kind, name, version, context)?;
        let payload = py.allow_threads(|| {
            self.inner.get_or_compute_raw(&key, || {
                Python::with_gil(|py| compute.call0(py).and_then(|v| v.extract::<String>(py)))
                    .map_err(|e| XrayError::Analyzer(e.to_string()))
            })
        })?;
        Ok(payload)
    }

    fn lookup(&self, kind: &str, name: &str, version: &str, context: &str) -> PyResult<Option<String>> {
        let key = cache_key(kind, name, version, context)?;
        Ok(self.inner.lookup(&key)?)
    }

    fn status(&self, kind: &str, name: &str, version: &str, context: &str) -> PyResult<Option<String>> {
        let key = cache_key(kind, name, version, context)?;
        Ok(self.inner.status(&key)?.map(|s| s.as_str().to_string()))
    }

    fn invalidate(&self, kind: &str, name: &str, version: &str, context: &str) -> PyResult<bool> {
        let key = cache_key(kind, name, version, context)?;
        Ok(self.inner.invalidate(&key)?)
    }

    fn stats(&self, py: Python<'_>) -> PyResult<PyObject> {
        to_py(py, &self.inner.stats())
    }
}
