//! Per-package analysis pipeline and the parallel batch driver.
//!
//! Stages for one client run strictly in order: native graphs, bridge
//! reports, interpreted graphs, stitching, reachability. Every stage except
//! reachability goes through the [`CacheManager`], which is the only state
//! shared between packages analysed in parallel.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridges::discovery::InstalledPackage;
use crate::config::{ScanConfig, XrayConfig};
use crate::errors::{XrayError, XrayResult};
use crate::graph::input::{InterpretedCallGraph, NativeCallGraph};
use crate::graph::stitch::{stitch, StitchInputs, StitchReport};
use crate::models::{content_digest, BridgeReport, LibraryRef, PackageVersion};
use crate::query::reach::{reached_from_package, ReachedGraph};
use crate::store::cache::{CacheKey, CacheKind, CacheManager};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The external producers the pipeline depends on.
pub trait Collaborators: Sync {
    fn recover_bridges(&self, package: &InstalledPackage, config: &ScanConfig) -> XrayResult<BridgeReport>;

    fn interpreted_graph(&self, package: &InstalledPackage) -> XrayResult<InterpretedCallGraph>;

    /// Native call graph of the shared object at `path`. Implementations
    /// should give up after `timeout`.
    fn native_graph(
        &self,
        library: &LibraryRef,
        path: &Path,
        timeout: Option<Duration>,
    ) -> XrayResult<NativeCallGraph>;
}

// ---------------------------------------------------------------------------
// External native analyzer
// ---------------------------------------------------------------------------

const CHILD_POLL: Duration = Duration::from_millis(20);

/// Runs a binary analyzer command per library and parses its JSON output.
///
/// Arguments may contain `{input}` (library path), `{output}` (result file)
/// and `{name}` (library file name). Without `{output}` the result is read
/// from stdout.
#[derive(Clone, Debug)]
pub struct ExternalNativeAnalyzer {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl ExternalNativeAnalyzer {
    pub fn new(command: &[String], work_dir: impl Into<PathBuf>) -> XrayResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| XrayError::Config("native analyzer command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            work_dir: work_dir.into(),
        })
    }

    fn writes_output_file(&self) -> bool {
        self.args.iter().any(|a| a.contains("{output}"))
    }

    fn render(&self, input: &Path, output: &Path, name: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{name}", name)
            })
            .collect()
    }

    pub fn analyze(
        &self,
        library: &LibraryRef,
        path: &Path,
        timeout: Option<Duration>,
    ) -> XrayResult<NativeCallGraph> {
        std::fs::create_dir_all(&self.work_dir)?;
        let stem = content_digest(&library.to_string());
        let output = self.work_dir.join(format!("{}-{}.json", library.file_name(), &stem[..12]));
        let args = self.render(path, &output, library.file_name());
        debug!(library = %library, program = %self.program, "starting native analyzer");

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| XrayError::Analyzer(format!("cannot start {}: {e}", self.program)))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, timeout, library)?;
        let stdout = join_drain(stdout);
        let stderr = join_drain(stderr);
        if !status.success() {
            return Err(XrayError::Analyzer(format!(
                "{} exited with {status} for {library}: {}",
                self.program,
                stderr.trim()
            )));
        }

        let text = if self.writes_output_file() {
            let text = std::fs::read_to_string(&output)?;
            let _ = std::fs::remove_file(&output);
            text
        } else {
            stdout
        };
        let graph = NativeCallGraph::from_analyzer_json(library.clone(), &text)?;
        info!(
            library = %library,
            functions = graph.functions.len(),
            edges = graph.edges.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "native analysis finished"
        );
        Ok(graph)
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut s| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = s.read_to_string(&mut buf);
            buf
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Wait for `child`, killing it once `timeout` elapses.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
    library: &LibraryRef,
) -> XrayResult<ExitStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                warn!(library = %library, seconds = limit.as_secs(), "native analyzer timed out");
                return Err(XrayError::Timeout {
                    what: format!("native analysis of {library}"),
                    seconds: limit.as_secs(),
                });
            }
        }
        std::thread::sleep(CHILD_POLL);
    }
}

// ---------------------------------------------------------------------------
// Per-package analysis
// ---------------------------------------------------------------------------

/// One client package and its installed dependency closure.
#[derive(Clone, Debug)]
pub struct AnalysisJob {
    pub client: InstalledPackage,
    pub dependencies: Vec<InstalledPackage>,
}

impl AnalysisJob {
    pub fn new(client: InstalledPackage, dependencies: Vec<InstalledPackage>) -> Self {
        Self {
            client,
            dependencies,
        }
    }

    /// Client first, then dependencies in identity order.
    fn packages(&self) -> Vec<&InstalledPackage> {
        let mut deps: Vec<&InstalledPackage> = self.dependencies.iter().collect();
        deps.sort_by(|a, b| a.id.cmp(&b.id));
        deps.dedup_by(|a, b| a.id == b.id);
        let mut out = vec![&self.client];
        out.extend(deps.into_iter().filter(|d| d.id != self.client.id));
        out
    }
}

/// A library whose native graph could not be produced; its edges are absent.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryFailure {
    pub library: LibraryRef,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageAnalysis {
    pub package: PackageVersion,
    pub bridge_reports: Vec<BridgeReport>,
    pub stitch: StitchReport,
    pub reached: ReachedGraph,
    pub degraded_libraries: Vec<LibraryFailure>,
}

impl PackageAnalysis {
    pub fn skipped_modules(&self) -> usize {
        self.bridge_reports.iter().map(|r| r.skipped_modules.len()).sum()
    }

    pub fn unresolved_foreign(&self) -> u64 {
        self.bridge_reports.iter().map(|r| r.unresolved_foreign).sum()
    }
}

fn scan_context(config: &ScanConfig) -> XrayResult<String> {
    let digest = content_digest(&serde_json::to_string(config)?);
    Ok(format!("scan-{}", &digest[..16]))
}

/// Analyse one client against its dependencies.
///
/// A library whose native analysis fails or times out is recorded in
/// `degraded_libraries` and stitched without native edges. Failures of the
/// bridge or interpreted stages fail the package.
pub fn analyze_package<C: Collaborators + ?Sized>(
    job: &AnalysisJob,
    collaborators: &C,
    cache: &CacheManager,
    config: &XrayConfig,
) -> XrayResult<PackageAnalysis> {
    let started = Instant::now();
    let packages = job.packages();
    let client = &job.client.id;
    info!(package = %client, dependencies = packages.len() - 1, "analysis started");

    // -- native graphs ------------------------------------------------------
    let timeout = config.batch.native_timeout();
    let mut native = Vec::new();
    let mut degraded = Vec::new();
    for package in &packages {
        for library in package.libraries() {
            let key = CacheKey::new(CacheKind::NativeGraph, library.package.clone(), library.path.clone());
            let path = package.root.join(&library.path);
            match cache.get_or_compute(&key, || collaborators.native_graph(&library, &path, timeout)) {
                Ok(graph) => native.push(graph),
                Err(e) => {
                    warn!(library = %library, error = %e, "native graph unavailable; continuing without it");
                    degraded.push(LibraryFailure {
                        library,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    // -- bridge reports -----------------------------------------------------
    let context = scan_context(&config.scan)?;
    let mut bridge_reports = Vec::with_capacity(packages.len());
    for package in &packages {
        let key = CacheKey::new(CacheKind::BridgeReport, package.id.clone(), context.clone());
        let report: BridgeReport =
            cache.get_or_compute(&key, || collaborators.recover_bridges(package, &config.scan))?;
        bridge_reports.push(report);
    }

    // -- interpreted graphs -------------------------------------------------
    let mut interpreted = Vec::with_capacity(packages.len());
    for package in &packages {
        let key = CacheKey::new(CacheKind::InterpretedGraph, package.id.clone(), "callgraph");
        let graph: InterpretedCallGraph = cache.get_or_compute(&key, || collaborators.interpreted_graph(package))?;
        interpreted.push(graph);
    }

    // -- stitch -------------------------------------------------------------
    let unified_context = {
        let ids: Vec<String> = packages.iter().map(|p| p.id.to_string()).collect();
        let missing: Vec<String> = degraded.iter().map(|f| f.library.to_string()).collect();
        let digest = content_digest(&format!("{}|{}|{}", ids.join(","), missing.join(","), context));
        format!("xlcg-{}", &digest[..16])
    };
    let key = CacheKey::new(CacheKind::UnifiedGraph, client.clone(), unified_context);
    let stitched: StitchReport = cache.get_or_compute(&key, || {
        stitch(StitchInputs {
            interpreted: &interpreted,
            native: &native,
            bridges: &bridge_reports,
        })
    })?;

    // -- reach --------------------------------------------------------------
    let reached = reached_from_package(&stitched.graph, client);
    info!(
        package = %client,
        nodes = stitched.graph.node_count(),
        reached = reached.graph.node_count(),
        degraded = degraded.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "analysis finished"
    );
    Ok(PackageAnalysis {
        package: client.clone(),
        bridge_reports,
        stitch: stitched,
        reached,
        degraded_libraries: degraded,
    })
}

// ---------------------------------------------------------------------------
// Batch driver
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageOutcome {
    pub package: PackageVersion,
    pub analysis: Option<PackageAnalysis>,
    pub error: Option<String>,
}

/// Batch-level counts reported alongside the per-package outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub packages_analysed: usize,
    pub packages_failed: usize,
    pub skipped_modules: usize,
    /// Foreign entry points not resolved plus bridges without a stitch endpoint.
    pub unresolved_bridges: u64,
    pub failed_computations: usize,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub outcomes: Vec<PackageOutcome>,
    pub summary: BatchSummary,
}

fn run_one<C: Collaborators + ?Sized>(
    job: &AnalysisJob,
    collaborators: &C,
    cache: &CacheManager,
    config: &XrayConfig,
) -> PackageOutcome {
    match analyze_package(job, collaborators, cache, config) {
        Ok(analysis) => PackageOutcome {
            package: job.client.id.clone(),
            analysis: Some(analysis),
            error: None,
        },
        Err(e) => {
            warn!(package = %job.client.id, error = %e, "package analysis failed");
            PackageOutcome {
                package: job.client.id.clone(),
                analysis: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Analyse every job on a pool of `config.batch.workers` threads.
///
/// Outcomes are returned in job order. A failing package never stops the
/// batch.
pub fn run_batch<C: Collaborators + ?Sized>(
    jobs: &[AnalysisJob],
    collaborators: &C,
    cache: &CacheManager,
    config: &XrayConfig,
) -> BatchResult {
    let started = Instant::now();
    let cache_failures_before = cache.stats().failures;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.batch.workers.max(1))
        .build();
    let outcomes: Vec<PackageOutcome> = match pool {
        Ok(pool) => pool.install(|| {
            jobs.par_iter()
                .map(|job| run_one(job, collaborators, cache, config))
                .collect()
        }),
        Err(e) => {
            warn!(error = %e, "thread pool unavailable; running sequentially");
            jobs.iter()
                .map(|job| run_one(job, collaborators, cache, config))
                .collect()
        }
    };

    let mut summary = BatchSummary {
        failed_computations: (cache.stats().failures - cache_failures_before) as usize,
        elapsed_ms: started.elapsed().as_millis() as u64,
        ..BatchSummary::default()
    };
    for outcome in &outcomes {
        match &outcome.analysis {
            Some(analysis) => {
                summary.packages_analysed += 1;
                summary.skipped_modules += analysis.skipped_modules();
                summary.unresolved_bridges +=
                    analysis.unresolved_foreign() + analysis.stitch.bridges_missed() as u64;
            }
            None => summary.packages_failed += 1,
        }
    }
    info!(
        analysed = summary.packages_analysed,
        failed = summary.packages_failed,
        skipped_modules = summary.skipped_modules,
        unresolved_bridges = summary.unresolved_bridges,
        failed_computations = summary.failed_computations,
        "batch finished"
    );
    BatchResult { outcomes, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bridge;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// `app` calls `dep.wrap`, which is bridged into `dep/_native.so`.
    struct Fixture {
        native_calls: AtomicUsize,
        fail_native: bool,
        graphs: HashMap<String, (Vec<(&'static str, &'static str)>, Vec<(&'static str, &'static str)>)>,
    }

    impl Fixture {
        fn new(fail_native: bool) -> Self {
            let mut graphs = HashMap::new();
            graphs.insert("app".to_string(), (vec![("app.main", "app.helper")], vec![("app.helper", "dep.wrap")]));
            graphs.insert("dep".to_string(), (vec![("dep.wrap", "dep.inner")], vec![]));
            Self {
                native_calls: AtomicUsize::new(0),
                fail_native,
                graphs,
            }
        }
    }

    impl Collaborators for Fixture {
        fn recover_bridges(&self, package: &InstalledPackage, _config: &ScanConfig) -> XrayResult<BridgeReport> {
            let mut report = BridgeReport::empty(package.id.clone());
            if package.id.name == "dep" {
                report.bridges.push(Bridge::new("dep.inner", "c_inner", "dep/_native.so"));
                report.count = 1;
                report.jump_libs.push("dep/_native.so".to_string());
            }
            Ok(report)
        }

        fn interpreted_graph(&self, package: &InstalledPackage) -> XrayResult<InterpretedCallGraph> {
            let mut graph = InterpretedCallGraph::new(package.id.clone());
            if let Some((edges, externals)) = self.graphs.get(&package.id.name) {
                for (a, b) in edges {
                    graph.add_edge(*a, *b);
                }
                for (a, b) in externals {
                    graph.add_function(*a);
                    graph.add_external_call(*a, *b);
                }
            }
            Ok(graph)
        }

        fn native_graph(&self, library: &LibraryRef, _path: &Path, _timeout: Option<Duration>) -> XrayResult<NativeCallGraph> {
            self.native_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_native {
                return Err(XrayError::Analyzer("disassembler crashed".into()));
            }
            let mut graph = NativeCallGraph::new(library.clone());
            graph.add_edge("c_inner", "c_leaf");
            graph.add_export("c_inner", 0x10);
            Ok(graph)
        }
    }

    fn job(dir: &Path) -> AnalysisJob {
        let app = dir.join("app");
        let dep = dir.join("dep");
        std::fs::create_dir_all(app.join("app")).unwrap();
        std::fs::create_dir_all(dep.join("dep")).unwrap();
        std::fs::write(app.join("app/__init__.py"), "").unwrap();
        std::fs::write(dep.join("dep/__init__.py"), "").unwrap();
        std::fs::write(dep.join("dep/_native.so"), b"\x7fELF").unwrap();
        AnalysisJob::new(
            InstalledPackage::new(PackageVersion::new("app", "1.0"), app),
            vec![InstalledPackage::new(PackageVersion::new("dep", "2.0"), dep)],
        )
    }

    fn cache(dir: &Path) -> CacheManager {
        CacheManager::new(dir.join("cache.sqlite3"), Duration::from_secs(60), Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn client_reaches_native_code_through_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let fixture = Fixture::new(false);
        let analysis = analyze_package(&job, &fixture, &cache(dir.path()), &XrayConfig::default()).unwrap();
        let reached: Vec<String> = analysis.reached.graph.nodes().map(|n| n.name().to_string()).collect();
        assert!(reached.contains(&"c_leaf".to_string()));
        assert_eq!(analysis.stitch.bridges_applied, 1);
        assert!(analysis.degraded_libraries.is_empty());
    }

    #[test]
    fn shared_library_is_analysed_once_across_clients() {
        let dir = tempfile::tempdir().unwrap();
        let first = job(dir.path());
        let mut second = first.clone();
        second.client.id = PackageVersion::new("app", "1.1");
        let fixture = Fixture::new(false);
        let result = run_batch(&[first, second], &fixture, &cache(dir.path()), &XrayConfig::default());
        assert_eq!(result.summary.packages_analysed, 2);
        assert_eq!(fixture.native_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_native_analysis_degrades_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let fixture = Fixture::new(true);
        let result = run_batch(&[job], &fixture, &cache(dir.path()), &XrayConfig::default());
        assert_eq!(result.summary.packages_analysed, 1);
        assert_eq!(result.summary.failed_computations, 1);
        let analysis = result.outcomes[0].analysis.as_ref().unwrap();
        assert_eq!(analysis.degraded_libraries.len(), 1);
        assert_eq!(analysis.stitch.missing_native.len(), 1);
        assert_eq!(result.summary.unresolved_bridges, 1);
    }

    #[cfg(unix)]
    #[test]
    fn external_analyzer_reads_stdout_and_enforces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("libx.json");
        std::fs::write(
            &input,
            r#"{"nodes": {"0": {"name": "f"}, "1": {"name": "g"}}, "edges": [[0, 1]], "exports": [], "imports": []}"#,
        )
        .unwrap();
        let lib = LibraryRef::new(PackageVersion::new("x", "1"), "libx.so");

        let cat = ExternalNativeAnalyzer::new(&["cat".to_string(), "{input}".to_string()], dir.path().join("work")).unwrap();
        let graph = cat.analyze(&lib, &input, None).unwrap();
        assert_eq!(graph.edges, vec![("f".to_string(), "g".to_string())]);

        let slow = ExternalNativeAnalyzer::new(&["sleep".to_string(), "5".to_string()], dir.path().join("work")).unwrap();
        let err = slow.analyze(&lib, &input, Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, XrayError::Timeout { .. }));
    }

    #[test]
    fn empty_analyzer_command_is_rejected() {
        assert!(ExternalNativeAnalyzer::new(&[], "/tmp").is_err());
    }
}
