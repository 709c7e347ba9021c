//! Filesystem discovery of an installed package: shared objects, top-level
//! import names, and default scan entry modules.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::models::{normalize_rel_path, LibraryRef, PackageVersion};

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Metadata directories that never hold importable code.
const SKIPPED_DIR_SUFFIXES: &[&str] = &[".dist-info", ".egg-info", "__pycache__"];

pub fn is_identifier(text: &str) -> bool {
    IDENT_RE.is_match(text)
}

/// Whether a file name denotes a shared object (`x.so`, `x.so.1.2`, `x.cpython-311-x86_64-linux-gnu.so`).
pub fn is_shared_object(file_name: &str) -> bool {
    file_name.ends_with(".so") || file_name.contains(".so.")
}

fn skipped_dir(name: &str) -> bool {
    SKIPPED_DIR_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn walk_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_type().is_dir() || !skipped_dir(&e.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(normalize_rel_path(&rel.to_string_lossy()));
        }
    }
    files
}

/// Every shared object under `root`, root-relative and sorted.
pub fn find_shared_objects(root: &Path) -> Vec<String> {
    let mut out: Vec<String> = walk_files(root)
        .into_iter()
        .filter(|p| is_shared_object(p.rsplit('/').next().unwrap_or(p)))
        .collect();
    out.sort();
    out
}

/// Dotted import name for a root-relative module file, if it is importable.
///
/// `pkg/__init__.py` -> `pkg`, `pkg/math.py` -> `pkg.math`,
/// `pkg/_native.cpython-311-x86_64-linux-gnu.so` -> `pkg._native`.
pub fn module_import_name(rel_path: &str) -> Option<String> {
    let rel = normalize_rel_path(rel_path);
    let mut parts: Vec<&str> = rel.split('/').collect();
    let file = parts.pop()?;

    let stem = if let Some(stem) = file.strip_suffix(".py") {
        stem
    } else if file.ends_with(".so") {
        file.split('.').next()?
    } else {
        return None;
    };

    if !parts.iter().all(|p| is_identifier(p)) {
        return None;
    }
    let mut segments: Vec<&str> = parts;
    if stem != "__init__" {
        if !is_identifier(stem) {
            return None;
        }
        segments.push(stem);
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("."))
}

/// Top-level import names provided by the install root.
pub fn top_levels(root: &Path) -> BTreeSet<String> {
    walk_files(root)
        .iter()
        .filter_map(|p| module_import_name(p))
        .filter_map(|name| name.split('.').next().map(str::to_string))
        .collect()
}

/// Extension modules under `root`: the default bridge-scan entry points.
pub fn default_entry_modules(root: &Path) -> Vec<String> {
    let names: BTreeSet<String> = find_shared_objects(root)
        .iter()
        .filter(|p| p.ends_with(".so"))
        .filter_map(|p| module_import_name(p))
        .collect();
    names.into_iter().collect()
}

/// An installed package release and its install root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledPackage {
    pub id: PackageVersion,
    pub root: PathBuf,
}

impl InstalledPackage {
    pub fn new(id: PackageVersion, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
        }
    }

    pub fn libraries(&self) -> Vec<LibraryRef> {
        find_shared_objects(&self.root)
            .into_iter()
            .map(|p| LibraryRef::new(self.id.clone(), p))
            .collect()
    }

    pub fn has_native_code(&self) -> bool {
        !find_shared_objects(&self.root).is_empty()
    }

    pub fn entry_modules(&self) -> Vec<String> {
        default_entry_modules(&self.root)
    }

    pub fn top_levels(&self) -> BTreeSet<String> {
        top_levels(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn import_names_follow_python_layout() {
        assert_eq!(module_import_name("pkg/__init__.py").as_deref(), Some("pkg"));
        assert_eq!(module_import_name("pkg/math.py").as_deref(), Some("pkg.math"));
        assert_eq!(
            module_import_name("pkg/_native.cpython-311-x86_64-linux-gnu.so").as_deref(),
            Some("pkg._native")
        );
        assert_eq!(module_import_name("pkg.libs/libz-1a2b.so.1"), None);
        assert_eq!(module_import_name("pkg/data.json"), None);
        assert_eq!(module_import_name("__init__.py"), None);
    }

    #[test]
    fn discovery_walks_install_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "pkg/__init__.py");
        touch(root, "pkg/math.py");
        touch(root, "pkg/_native.cpython-311-x86_64-linux-gnu.so");
        touch(root, "pkg.libs/libopenblas-r0.so");
        touch(root, "helper.py");
        touch(root, "pkg-1.0.dist-info/RECORD");
        touch(root, "pkg-1.0.dist-info/fake.so");

        assert_eq!(
            find_shared_objects(root),
            vec![
                "pkg.libs/libopenblas-r0.so".to_string(),
                "pkg/_native.cpython-311-x86_64-linux-gnu.so".to_string(),
            ]
        );
        let tops: Vec<String> = top_levels(root).into_iter().collect();
        assert_eq!(tops, vec!["helper".to_string(), "pkg".to_string()]);
        assert_eq!(default_entry_modules(root), vec!["pkg._native".to_string()]);

        let installed = InstalledPackage::new(PackageVersion::new("pkg", "1.0"), root);
        assert!(installed.has_native_code());
        assert_eq!(installed.libraries().len(), 2);
    }

    #[test]
    fn pure_package_has_no_native_code() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "pure/__init__.py");
        let installed = InstalledPackage::new(PackageVersion::new("pure", "0.1"), dir.path());
        assert!(!installed.has_native_code());
        assert!(installed.entry_modules().is_empty());
    }
}
