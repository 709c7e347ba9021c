//! Bridge recovery: walk a package's object graph from its entry modules and
//! pair every foreign callable with the native symbol it enters.
//!
//! The walk is breadth-first with attributes visited in name order, each
//! object is examined once, and a foreign object reached under several names
//! is reported under its canonical name (fewest segments, then smallest).
//! The report therefore does not depend on attribute enumeration order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::classifier::{classify, ForeignEntry};
use super::discovery::is_shared_object;
use super::object_model::{ObjectId, ObjectModel, ObjectShape};
use super::symbols::{Resolution, SymbolResolver};
use crate::config::ScanConfig;
use crate::models::{
    normalize_rel_path, Bridge, BridgeReport, ModuleRecord, PackageVersion, ScanFailure,
    IMPORT_PYNAME, MODULE_INIT_PREFIX,
};

/// What to scan.
#[derive(Clone, Debug)]
pub struct ScanRequest<'a> {
    pub package: &'a PackageVersion,
    /// Install root; modules whose file lies outside it are not followed.
    pub root: &'a Path,
    pub entry_modules: &'a [String],
}

struct ForeignObject {
    entry: ForeignEntry,
    pyname: String,
    module: String,
}

impl ForeignObject {
    fn offer_name(&mut self, candidate: &str) {
        if canonical_order(candidate, &self.pyname) == std::cmp::Ordering::Less {
            self.pyname = candidate.to_string();
        }
    }
}

fn canonical_order(a: &str, b: &str) -> std::cmp::Ordering {
    let segments = |s: &str| s.split('.').count();
    segments(a).cmp(&segments(b)).then_with(|| a.cmp(b))
}

struct Walk<'m, M: ObjectModel + ?Sized> {
    model: &'m M,
    root: &'m Path,
    config: &'m ScanConfig,
    seen: HashSet<ObjectId>,
    foreign: HashMap<ObjectId, ForeignObject>,
    objects_examined: u64,
    callable_objects: u64,
    budget_hit: bool,
}

impl<'m, M: ObjectModel + ?Sized> Walk<'m, M> {
    fn module_rel_path(&self, shape: &ObjectShape) -> Option<String> {
        let ObjectShape::Module { file: Some(file) } = shape else {
            return None;
        };
        file.strip_prefix(self.root)
            .ok()
            .map(|rel| normalize_rel_path(&rel.to_string_lossy()))
    }

    fn walk_entry(&mut self, module_id: ObjectId, import_name: &str) {
        let mut queue: VecDeque<(ObjectId, String, usize)> = VecDeque::new();
        if self.seen.insert(module_id) {
            queue.push_back((module_id, import_name.to_string(), 0));
        }

        while let Some((id, name, depth)) = queue.pop_front() {
            let mut children = match self.model.attributes(id) {
                Ok(children) => children,
                Err(e) => {
                    debug!(object = %name, error = %e, "attributes unavailable");
                    continue;
                }
            };
            children.sort_by(|a, b| a.0.cmp(&b.0));

            for (attr, child) in children {
                let child_name = format!("{name}.{attr}");
                if let Some(known) = self.foreign.get_mut(&child) {
                    known.offer_name(&child_name);
                }
                if depth + 1 > self.config.max_depth || self.seen.contains(&child) {
                    continue;
                }
                if self.seen.len() >= self.config.max_objects {
                    if !self.budget_hit {
                        warn!(limit = self.config.max_objects, "object budget exhausted; scan truncated");
                    }
                    self.budget_hit = true;
                    return;
                }

                let shape = match self.model.shape(child) {
                    Ok(shape) => shape,
                    Err(e) => {
                        debug!(object = %child_name, error = %e, "shape unavailable");
                        self.seen.insert(child);
                        continue;
                    }
                };
                if shape.is_module() && self.module_rel_path(&shape).is_none() {
                    continue;
                }
                self.seen.insert(child);
                self.examine(child, &child_name, import_name);
                queue.push_back((child, child_name, depth + 1));
            }
        }
    }

    fn examine(&mut self, id: ObjectId, name: &str, module: &str) {
        self.objects_examined += 1;
        let classification = classify(self.model, id, self.config.max_unwrap_depth);
        if classification.is_callable() {
            self.callable_objects += 1;
        }
        if let Some(entry) = classification.into_foreign() {
            self.foreign.insert(
                id,
                ForeignObject {
                    entry,
                    pyname: name.to_string(),
                    module: module.to_string(),
                },
            );
        }
    }
}

/// Recover the bridges of one package.
///
/// Modules that fail to import are recorded in `skipped_modules` and the
/// scan continues with the remaining entries.
pub fn recover_bridges<M: ObjectModel + ?Sized>(
    model: &M,
    resolver: &SymbolResolver,
    request: &ScanRequest<'_>,
    config: &ScanConfig,
) -> BridgeReport {
    let started = Instant::now();
    let mut report = BridgeReport::empty(request.package.clone());

    let entries: BTreeSet<&str> = request.entry_modules.iter().map(String::as_str).collect();
    let mut walk = Walk {
        model,
        root: request.root,
        config,
        seen: HashSet::new(),
        foreign: HashMap::new(),
        objects_examined: 0,
        callable_objects: 0,
        budget_hit: false,
    };
    let mut module_paths: BTreeMap<String, String> = BTreeMap::new();

    for import_name in entries {
        let module_id = match model.import_module(import_name) {
            Ok(id) => id,
            Err(e) => {
                warn!(module = import_name, error = %e, "module import failed");
                report.skipped_modules.push(ScanFailure {
                    import_name: import_name.to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let rel_path = match model.shape(module_id) {
            Ok(shape) => walk.module_rel_path(&shape),
            Err(_) => None,
        };
        let Some(rel_path) = rel_path else {
            report.skipped_modules.push(ScanFailure {
                import_name: import_name.to_string(),
                reason: "module file is outside the package root".to_string(),
            });
            continue;
        };
        module_paths.insert(import_name.to_string(), rel_path);
        walk.walk_entry(module_id, import_name);
        if walk.budget_hit {
            break;
        }
    }

    let mut bridges: BTreeSet<Bridge> = BTreeSet::new();
    let mut jump_libs: BTreeSet<String> = BTreeSet::new();
    let mut bridged_modules: BTreeSet<String> = BTreeSet::new();
    let mut unresolved = 0u64;

    let mut foreign: Vec<&ForeignObject> = walk.foreign.values().collect();
    foreign.sort_by(|a, b| canonical_order(&a.pyname, &b.pyname));

    for object in &foreign {
        let mut landed = false;
        for addr in &object.entry.addresses {
            match resolver.resolve(*addr) {
                Resolution::Resolved { library, symbol } => {
                    bridges.insert(Bridge::new(object.pyname.clone(), symbol, library.path.clone()));
                    jump_libs.insert(library.path);
                    landed = true;
                }
                Resolution::NoExactSymbol { .. } | Resolution::OutsideMappedLibraries => {}
            }
        }
        if !landed {
            if let Some(name) = object.entry.declared_name.as_deref() {
                if let Some(library) = resolver.resolve_name(name) {
                    bridges.insert(Bridge::new(object.pyname.clone(), name, library.path.clone()));
                    jump_libs.insert(library.path);
                    landed = true;
                }
            }
        }
        if landed {
            bridged_modules.insert(object.module.clone());
        } else {
            unresolved += 1;
            debug!(pyname = %object.pyname, kind = ?object.entry.kind, "foreign callable left unresolved");
        }
    }

    if config.emit_import_bridges {
        for (import_name, rel_path) in &module_paths {
            let file = rel_path.rsplit('/').next().unwrap_or(rel_path);
            if !is_shared_object(file) {
                continue;
            }
            let base = import_name.rsplit('.').next().unwrap_or(import_name);
            bridges.insert(Bridge::new(
                IMPORT_PYNAME,
                format!("{MODULE_INIT_PREFIX}{base}"),
                rel_path.clone(),
            ));
            jump_libs.insert(rel_path.clone());
        }
    }

    report.objects_examined = walk.objects_examined;
    report.callable_objects = walk.callable_objects;
    report.foreign_callable_objects = walk.foreign.len() as u64;
    report.unresolved_foreign = unresolved;
    report.modules = bridged_modules
        .into_iter()
        .filter_map(|import_name| {
            module_paths.get(&import_name).map(|path| ModuleRecord {
                path: path.clone(),
                import_name,
            })
        })
        .collect();
    report.bridges = bridges.into_iter().collect();
    report.count = report.bridges.len();
    report.jump_libs = jump_libs.into_iter().collect();
    report.duration_sec = started.elapsed().as_secs_f64();

    info!(
        package = %request.package,
        bridges = report.count,
        examined = report.objects_examined,
        foreign = report.foreign_callable_objects,
        unresolved = report.unresolved_foreign,
        "bridge recovery finished"
    );
    report
}
