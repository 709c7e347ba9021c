//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use _xray_core::bridges::{NativeKind, ObjectShape};
use _xray_core::graph::{InterpretedCallGraph, NativeCallGraph};
use _xray_core::models::{Bridge, BridgeReport, LibraryRef, PackageVersion};

pub fn pv(name: &str) -> PackageVersion {
    PackageVersion::new(name, "1.0")
}

/// Create `files` (root-relative) under `root` with empty contents.
pub fn install(root: &Path, files: &[&str]) {
    for rel in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }
}

pub fn module_at(root: &Path, rel: &str) -> ObjectShape {
    ObjectShape::Module {
        file: Some(root.join(rel)),
    }
}

pub fn builtin(addr: u64) -> ObjectShape {
    ObjectShape::Native {
        kind: NativeKind::BuiltinFunction,
        entries: vec![addr],
        declared_name: None,
    }
}

/// A `/proc/<pid>/maps` line for `path` loaded at `[start, end)`.
pub fn maps_line(start: u64, end: u64, path: &Path) -> String {
    format!("{start:08x}-{end:08x} r-xp 00000000 08:01 4242    {}", path.display())
}

pub fn report(package: &PackageVersion, bridges: Vec<Bridge>) -> BridgeReport {
    let mut report = BridgeReport::empty(package.clone());
    report.count = bridges.len();
    report.jump_libs = bridges.iter().map(|b| b.library.clone()).collect();
    report.jump_libs.sort();
    report.jump_libs.dedup();
    report.bridges = bridges;
    report
}

pub fn interpreted(package: &PackageVersion, edges: &[(&str, &str)]) -> InterpretedCallGraph {
    let mut graph = InterpretedCallGraph::new(package.clone());
    for (caller, callee) in edges {
        graph.add_edge(*caller, *callee);
    }
    graph
}

pub fn native(library: &LibraryRef, edges: &[(&str, &str)], exports: &[&str]) -> NativeCallGraph {
    let mut graph = NativeCallGraph::new(library.clone());
    for (caller, callee) in edges {
        graph.add_edge(*caller, *callee);
    }
    for (i, name) in exports.iter().enumerate() {
        graph.add_export(*name, 0x100 * i as u64);
    }
    graph
}
