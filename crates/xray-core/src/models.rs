//! Shared typed models used across bridge recovery, stitching, and queries.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Record constants
// ---------------------------------------------------------------------------

/// Pyname used for synthetic module-initialisation bridges.
pub const IMPORT_PYNAME: &str = "___IMPORT___";

/// Symbol prefix of CPython extension module initialisers.
pub const MODULE_INIT_PREFIX: &str = "PyInit_";

// ---------------------------------------------------------------------------
// PackageVersion
// ---------------------------------------------------------------------------

/// Identity of a published package release: the unit of caching and analysis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageVersion {
    pub name: String,
    pub version: String,
}

impl PackageVersion {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse the `name:version` form used by batch inputs.
    pub fn parse(spec: &str) -> Option<Self> {
        let (name, version) = spec.trim().split_once(':')?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(name, version))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// LibraryRef
// ---------------------------------------------------------------------------

/// A native shared object, scoped to the package that installed it.
///
/// Two copies of the same library bundled by different packages are distinct
/// `LibraryRef`s, and so are their symbols.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryRef {
    pub package: PackageVersion,
    /// Path relative to the package install root, `/`-separated.
    pub path: String,
}

impl LibraryRef {
    pub fn new(package: PackageVersion, path: impl Into<String>) -> Self {
        Self {
            package,
            path: normalize_rel_path(&path.into()),
        }
    }

    /// File name without directories.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for LibraryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.package, self.path)
    }
}

/// Normalise a root-relative path to forward slashes without a leading `./`.
pub fn normalize_rel_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified.trim_start_matches("./").trim_start_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// A discovered edge from an interpreted callable to its native entry point.
///
/// The library is stored root-relative; the owning package comes from the
/// enclosing [`BridgeReport`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bridge {
    pub pyname: String,
    #[serde(rename = "cfunc")]
    pub native_symbol: String,
    pub library: String,
}

impl Bridge {
    pub fn new(
        pyname: impl Into<String>,
        native_symbol: impl Into<String>,
        library: impl Into<String>,
    ) -> Self {
        Self {
            pyname: pyname.into(),
            native_symbol: native_symbol.into(),
            library: normalize_rel_path(&library.into()),
        }
    }

    /// The scoped library this bridge lands in.
    pub fn library_ref(&self, package: &PackageVersion) -> LibraryRef {
        LibraryRef::new(package.clone(), self.library.clone())
    }
}

// ---------------------------------------------------------------------------
// BridgeReport
// ---------------------------------------------------------------------------

/// A module that yielded at least one foreign callable during a scan.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub path: String,
    pub import_name: String,
}

/// A module that could not be imported or inspected.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanFailure {
    pub import_name: String,
    pub reason: String,
}

/// Per-package aggregate produced by bridge recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeReport {
    pub package: PackageVersion,
    pub objects_examined: u64,
    pub callable_objects: u64,
    pub foreign_callable_objects: u64,
    pub duration_sec: f64,
    pub count: usize,
    pub modules: Vec<ModuleRecord>,
    pub jump_libs: Vec<String>,
    pub bridges: Vec<Bridge>,
    #[serde(default)]
    pub unresolved_foreign: u64,
    #[serde(default)]
    pub skipped_modules: Vec<ScanFailure>,
}

impl BridgeReport {
    /// An empty report, e.g. for a package without native code.
    pub fn empty(package: PackageVersion) -> Self {
        Self {
            package,
            objects_examined: 0,
            callable_objects: 0,
            foreign_callable_objects: 0,
            duration_sec: 0.0,
            count: 0,
            modules: Vec::new(),
            jump_libs: Vec::new(),
            bridges: Vec::new(),
            unresolved_foreign: 0,
            skipped_modules: Vec::new(),
        }
    }

    /// Libraries implicated by this report, scoped to its package.
    pub fn implicated_libraries(&self) -> Vec<LibraryRef> {
        self.jump_libs
            .iter()
            .map(|path| LibraryRef::new(self.package.clone(), path.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Hash helpers
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of arbitrary text, used to build content keys.
pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_version_parse_round_trips_display() {
        let pv = PackageVersion::parse("numpy:1.26.4").unwrap();
        assert_eq!(pv.name, "numpy");
        assert_eq!(pv.version, "1.26.4");
        assert_eq!(pv.to_string(), "numpy:1.26.4");
        assert!(PackageVersion::parse("numpy").is_none());
        assert!(PackageVersion::parse(":1.0").is_none());
    }

    #[test]
    fn library_ref_normalizes_paths() {
        let pv = PackageVersion::new("pkg", "1.0");
        let lib = LibraryRef::new(pv, "./pkg\\_native.so");
        assert_eq!(lib.path, "pkg/_native.so");
        assert_eq!(lib.file_name(), "_native.so");
    }

    #[test]
    fn bridge_serializes_native_symbol_as_cfunc() {
        let bridge = Bridge::new("pkg.math.add", "add_numbers", "pkg/_native.so");
        let value = serde_json::to_value(&bridge).unwrap();
        assert_eq!(value["cfunc"], "add_numbers");
        assert_eq!(value["library"], "pkg/_native.so");
        assert!(value.get("native_symbol").is_none());
    }

    #[test]
    fn same_library_path_in_two_packages_is_distinct() {
        let a = LibraryRef::new(PackageVersion::new("a", "1"), "libz.so");
        let b = LibraryRef::new(PackageVersion::new("b", "1"), "libz.so");
        assert_ne!(a, b);
    }

    #[test]
    fn content_digest_is_stable() {
        assert_eq!(content_digest("abc"), content_digest("abc"));
        assert_ne!(content_digest("abc"), content_digest("abd"));
        assert_eq!(content_digest("").len(), 64);
    }
}
