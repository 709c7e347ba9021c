//! xray core library: cross-language call graphs for interpreted packages and
//! the native extensions they load.
//!
//! The crate recovers bridges from interpreted callables to native symbols,
//! stitches interpreted and native call graphs into one unified graph, and
//! answers reachability, call-chain and centrality queries over it. Expensive
//! stage results go through a durable compute-once cache. With the `python`
//! feature it is also built as the `_xray_core` extension module.

pub mod bridges;
pub mod config;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod store;

#[cfg(feature = "python")]
pub mod python;

#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use pyo3::wrap_pyfunction;

// ---------------------------------------------------------------------------
// Top-level Python module: _xray_core
// ---------------------------------------------------------------------------

#[cfg(feature = "python")]
#[pymodule]
fn _xray_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // -- Cache ----------------------------------------------------------------
    m.add_class::<python::PyCache>()?;

    // -- Guards (constants) ---------------------------------------------------
    m.add("MAX_UNWRAP_DEPTH", query::guards::MAX_UNWRAP_DEPTH)?;
    m.add("MAX_SCAN_DEPTH", query::guards::MAX_SCAN_DEPTH)?;
    m.add("MAX_SCAN_OBJECTS", query::guards::MAX_SCAN_OBJECTS)?;
    m.add("MAX_CHAINS", query::guards::MAX_CHAINS)?;
    m.add("MAX_CHAIN_DEPTH", query::guards::MAX_CHAIN_DEPTH)?;
    m.add("DEFAULT_LEASE_SECS", query::guards::DEFAULT_LEASE_SECS)?;

    // -- Bridge recovery --------------------------------------------------------
    m.add_function(wrap_pyfunction!(python::scan_bridges, m)?)?;

    // -- Stitching and queries ----------------------------------------------------
    m.add_function(wrap_pyfunction!(python::stitch_graphs, m)?)?;
    m.add_function(wrap_pyfunction!(python::reached_graph, m)?)?;
    m.add_function(wrap_pyfunction!(python::call_chains, m)?)?;
    m.add_function(wrap_pyfunction!(python::shortest_chain, m)?)?;
    m.add_function(wrap_pyfunction!(python::centrality, m)?)?;

    // -- Logging ----------------------------------------------------------------
    m.add_function(wrap_pyfunction!(python::py_init_tracing, m)?)?;

    Ok(())
}
