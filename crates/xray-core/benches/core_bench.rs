//! Criterion benchmarks for xray-core.
//!
//! Everything here runs without a Python runtime: graphs are synthetic and
//! built directly through the Rust API.
//!
//! ## Benchmark groups
//!
//! 1. **stitch**: unifying interpreted graphs, native graphs and bridges.
//! 2. **reach**: reached-set extraction, chain enumeration and centrality.
//! 3. **cache**: schema init and warm lookups against an on-disk cache.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/xray-core/Cargo.toml
//! # Run only the reachability group:
//! cargo bench --manifest-path crates/xray-core/Cargo.toml -- reach
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use _xray_core::config::ChainConfig;
use _xray_core::graph::{stitch, InterpretedCallGraph, NativeCallGraph, NodeId, StitchInputs, UnifiedGraph};
use _xray_core::models::{Bridge, BridgeReport, LibraryRef, PackageVersion};
use _xray_core::query::{centrality, client_roots, enumerate_chains, reached_from_package, GraphIndex};
use _xray_core::store::schema::init_schema;
use _xray_core::store::{CacheKey, CacheKind, CacheManager};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Synthetic {
    interpreted: Vec<InterpretedCallGraph>,
    native: Vec<NativeCallGraph>,
    bridges: Vec<BridgeReport>,
}

/// `packages` packages of `n` functions each. Every function calls its two
/// successors, every tenth function is bridged into the package's library,
/// and each package calls into the next one's entry point.
fn synthetic(packages: usize, n: usize) -> Synthetic {
    let mut out = Synthetic {
        interpreted: Vec::new(),
        native: Vec::new(),
        bridges: Vec::new(),
    };
    for p in 0..packages {
        let package = PackageVersion::new(format!("pkg{p}"), "1.0");
        let lib = LibraryRef::new(package.clone(), format!("pkg{p}/_native.so"));

        let mut py = InterpretedCallGraph::new(package.clone());
        let mut c = NativeCallGraph::new(lib.clone());
        let mut report = BridgeReport::empty(package.clone());
        for i in 0..n {
            let name = format!("pkg{p}.f{i}");
            py.add_function(name.clone());
            for step in 1..=2 {
                if i + step < n {
                    py.add_edge(name.clone(), format!("pkg{p}.f{}", i + step));
                }
            }
            if i % 10 == 0 {
                let sym = format!("c_f{i}");
                c.add_export(sym.clone(), i as u64 * 0x20);
                if i + 1 < n {
                    c.add_edge(sym.clone(), format!("c_f{}", i + 1));
                }
                report.bridges.push(Bridge::new(name, sym, lib.path.clone()));
            }
        }
        if p + 1 < packages {
            py.add_external_call(format!("pkg{p}.f{}", n - 1), format!("pkg{}.f0", p + 1));
        }
        report.count = report.bridges.len();
        report.jump_libs = vec![lib.path.clone()];
        out.interpreted.push(py);
        out.native.push(c);
        out.bridges.push(report);
    }
    out
}

fn unified(data: &Synthetic) -> UnifiedGraph {
    stitch(StitchInputs {
        interpreted: &data.interpreted,
        native: &data.native,
        bridges: &data.bridges,
    })
    .unwrap()
    .graph
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_stitch(c: &mut Criterion) {
    let mut group = c.benchmark_group("stitch");
    for &(packages, n) in &[(4usize, 250usize), (16, 500), (32, 2_000)] {
        let data = synthetic(packages, n);
        group.bench_with_input(
            BenchmarkId::new("unify", packages * n),
            &data,
            |b, data| b.iter(|| black_box(unified(data))),
        );
    }
    group.finish();
}

fn bench_reach(c: &mut Criterion) {
    let mut group = c.benchmark_group("reach");
    for &(packages, n) in &[(4usize, 250usize), (16, 500)] {
        let data = synthetic(packages, n);
        let graph = unified(&data);
        let client = PackageVersion::new("pkg0", "1.0");
        let size = graph.node_count();

        group.bench_with_input(BenchmarkId::new("reached_graph", size), &graph, |b, graph| {
            b.iter(|| black_box(reached_from_package(graph, &client)))
        });

        let index = GraphIndex::new(&graph);
        let roots: BTreeSet<NodeId> = client_roots(&graph, &client);
        let last = packages - 1;
        let target = NodeId::native(
            &LibraryRef::new(
                PackageVersion::new(format!("pkg{last}"), "1.0"),
                format!("pkg{last}/_native.so"),
            ),
            "c_f1",
        );
        let limits = ChainConfig {
            max_chains: 200,
            max_depth: 64,
        };
        group.bench_with_input(BenchmarkId::new("enumerate_chains", size), &index, |b, index| {
            b.iter(|| black_box(enumerate_chains(index, &roots, &target, &limits)))
        });
        group.bench_with_input(BenchmarkId::new("centrality", size), &index, |b, index| {
            b.iter(|| black_box(centrality(index, &client, &target)))
        });
    }
    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    group.bench_function("schema_init_in_memory", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            init_schema(&conn).unwrap();
            black_box(conn)
        })
    });

    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::new(
        dir.path().join("cache.sqlite3"),
        Duration::from_secs(60),
        Duration::from_millis(10),
    )
    .unwrap();
    let key = CacheKey::new(
        CacheKind::UnifiedGraph,
        PackageVersion::new("pkg0", "1.0"),
        "bench",
    );
    let graph = unified(&synthetic(4, 250));
    let _: UnifiedGraph = cache.get_or_compute(&key, || Ok(graph.clone())).unwrap();
    group.bench_function("warm_hit", |b| {
        b.iter(|| {
            let hit: UnifiedGraph = cache.get_or_compute(&key, || Ok(UnifiedGraph::new())).unwrap();
            black_box(hit)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_stitch, bench_reach, bench_cache);
criterion_main!(benches);
