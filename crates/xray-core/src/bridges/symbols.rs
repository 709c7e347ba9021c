//! Address-to-symbol resolution against a package's mapped libraries.
//!
//! Resolution is scoped: only libraries installed under the package root are
//! registered, so an address inside a system library or another package's
//! copy of a library resolves to [`Resolution::OutsideMappedLibraries`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{normalize_rel_path, LibraryRef, PackageVersion};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How an address is matched against exported symbols.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The address must equal a symbol's start address.
    #[default]
    Exact,
    /// Fall back to the closest symbol at or below the address.
    Nearest,
}

/// An exported symbol with its offset from the library load base.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportedSymbol {
    pub name: String,
    pub offset: u64,
}

impl ExportedSymbol {
    pub fn new(name: impl Into<String>, offset: u64) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

/// A library loaded at `[start, end)` with its exports at absolute addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedLibrary {
    pub library: LibraryRef,
    pub start: u64,
    pub end: u64,
    exports: BTreeMap<u64, String>,
}

impl MappedLibrary {
    /// Build from absolute export addresses.
    ///
    /// When several names share an address the lexicographically smallest wins.
    pub fn new<I, S>(library: LibraryRef, start: u64, end: u64, exports: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut table: BTreeMap<u64, String> = BTreeMap::new();
        for (name, addr) in exports {
            let name = name.into();
            match table.get(&addr) {
                Some(existing) if *existing <= name => {}
                _ => {
                    table.insert(addr, name);
                }
            }
        }
        Self {
            library,
            start,
            end,
            exports: table,
        }
    }

    /// Build from base-relative exports (as listed in a native call graph).
    pub fn from_offsets(library: LibraryRef, base: u64, end: u64, exports: &[ExportedSymbol]) -> Self {
        let absolute = exports
            .iter()
            .map(|e| (e.name.clone(), base.saturating_add(e.offset)));
        Self::new(library, base, end, absolute)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    fn lookup(&self, addr: u64, mode: MatchMode) -> Option<&str> {
        match mode {
            MatchMode::Exact => self.exports.get(&addr).map(String::as_str),
            MatchMode::Nearest => self
                .exports
                .range(..=addr)
                .next_back()
                .map(|(_, name)| name.as_str()),
        }
    }

    fn exports_name(&self, name: &str) -> bool {
        self.exports.values().any(|n| n == name)
    }
}

/// Outcome of resolving one native entry address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved { library: LibraryRef, symbol: String },
    /// The address is not inside any registered library.
    OutsideMappedLibraries,
    /// Inside a library, but no symbol matched under the active mode.
    NoExactSymbol { library: LibraryRef },
}

// ---------------------------------------------------------------------------
// SymbolResolver
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct SymbolResolver {
    libraries: Vec<MappedLibrary>,
    mode: MatchMode,
}

impl SymbolResolver {
    pub fn new(mut libraries: Vec<MappedLibrary>, mode: MatchMode) -> Self {
        libraries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.library.cmp(&b.library)));
        Self { libraries, mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn libraries(&self) -> &[MappedLibrary] {
        &self.libraries
    }

    pub fn resolve(&self, addr: u64) -> Resolution {
        let Some(lib) = self.libraries.iter().find(|l| l.contains(addr)) else {
            return Resolution::OutsideMappedLibraries;
        };
        match lib.lookup(addr, self.mode) {
            Some(symbol) => Resolution::Resolved {
                library: lib.library.clone(),
                symbol: symbol.to_string(),
            },
            None => Resolution::NoExactSymbol {
                library: lib.library.clone(),
            },
        }
    }

    /// Find the library exporting a declared foreign name.
    ///
    /// Libraries are tried in [`LibraryRef`] order so the answer does not
    /// depend on load addresses.
    pub fn resolve_name(&self, name: &str) -> Option<LibraryRef> {
        self.libraries
            .iter()
            .filter(|l| l.exports_name(name))
            .map(|l| l.library.clone())
            .min()
    }
}

// ---------------------------------------------------------------------------
// Process memory maps
// ---------------------------------------------------------------------------

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapRegion {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: Option<String>,
}

// Regex pattern (compiled once via LazyLock)
static MAPS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-fA-F]+)-([0-9a-fA-F]+)\s+\S+\s+([0-9a-fA-F]+)\s+\S+\s+\d+\s*(.*)$").unwrap()
});

/// Parse the text of a memory-map listing; malformed lines are skipped.
pub fn parse_proc_maps(text: &str) -> Vec<MapRegion> {
    text.lines()
        .filter_map(|line| {
            let caps = MAPS_LINE_RE.captures(line.trim_end())?;
            let start = u64::from_str_radix(&caps[1], 16).ok()?;
            let end = u64::from_str_radix(&caps[2], 16).ok()?;
            let offset = u64::from_str_radix(&caps[3], 16).ok()?;
            let path = caps
                .get(4)
                .map(|m| m.as_str().trim())
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            Some(MapRegion {
                start,
                end,
                offset,
                path,
            })
        })
        .collect()
}

/// Load range of a library: base (the zero-offset mapping) and end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadRange {
    pub base: u64,
    pub end: u64,
}

/// Group regions backed by files under `root` into per-library load ranges,
/// keyed by root-relative path.
pub fn library_ranges(regions: &[MapRegion], root: &Path) -> BTreeMap<String, LoadRange> {
    let mut out: BTreeMap<String, LoadRange> = BTreeMap::new();
    for region in regions {
        let Some(path) = region.path.as_deref() else {
            continue;
        };
        let Ok(rel) = Path::new(path).strip_prefix(root) else {
            continue;
        };
        let key = normalize_rel_path(&rel.to_string_lossy());
        let entry = out.entry(key).or_insert(LoadRange {
            base: region.start,
            end: region.end,
        });
        entry.base = entry.base.min(region.start);
        entry.end = entry.end.max(region.end);
    }
    out
}

/// Build a package-scoped resolver from load ranges and per-library exports.
///
/// Libraries mapped without a known export table are still registered, so
/// their addresses count as inside the package but never resolve.
pub fn resolver_for_package(
    package: &PackageVersion,
    ranges: &BTreeMap<String, LoadRange>,
    exports: &BTreeMap<String, Vec<ExportedSymbol>>,
    mode: MatchMode,
) -> SymbolResolver {
    let libraries = ranges
        .iter()
        .map(|(path, range)| {
            let table = exports.get(path).map(Vec::as_slice).unwrap_or(&[]);
            MappedLibrary::from_offsets(
                LibraryRef::new(package.clone(), path.clone()),
                range.base,
                range.end,
                table,
            )
        })
        .collect();
    SymbolResolver::new(libraries, mode)
}
