//! Durable compute-once cache for analysis results.
//!
//! Each key has exactly one computing owner at a time. Inside a process,
//! callers for the same key share one in-flight slot and wait on it. Across
//! processes, ownership is claimed with an immediate SQLite transaction and
//! kept alive by a heartbeat; an in-progress entry whose heartbeat is older
//! than the lease is treated as abandoned and reclaimed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::errors::{XrayError, XrayResult};
use crate::models::PackageVersion;
use crate::store::schema;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKind {
    BridgeReport,
    InterpretedGraph,
    NativeGraph,
    UnifiedGraph,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::BridgeReport => "bridge-report",
            CacheKind::InterpretedGraph => "interpreted-graph",
            CacheKind::NativeGraph => "native-graph",
            CacheKind::UnifiedGraph => "unified-graph",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "bridge-report" => Some(CacheKind::BridgeReport),
            "interpreted-graph" => Some(CacheKind::InterpretedGraph),
            "native-graph" => Some(CacheKind::NativeGraph),
            "unified-graph" => Some(CacheKind::UnifiedGraph),
            _ => None,
        }
    }
}

/// `(kind, package release, context)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub package: PackageVersion,
    /// Scan context, e.g. a library path or the client package for a unified graph.
    pub context: String,
}

impl CacheKey {
    pub fn new(kind: CacheKind, package: PackageVersion, context: impl Into<String>) -> Self {
        Self {
            kind,
            package,
            context: context.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_str(), self.package, self.context)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    InProgress,
    Complete,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Complete => "complete",
            EntryStatus::Failed => "failed",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "in_progress" => Some(EntryStatus::InProgress),
            "complete" => Some(EntryStatus::Complete),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

/// Counters for one manager instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub computed: u64,
    pub waited: u64,
    pub failures: u64,
    pub reclaimed: u64,
}

// ---------------------------------------------------------------------------
// In-process coordination
// ---------------------------------------------------------------------------

enum FlightState {
    Running,
    Done(Result<String, String>),
}

struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<String, String> {
        let mut state = self.state.lock();
        loop {
            if let FlightState::Done(result) = &*state {
                return result.clone();
            }
            self.done.wait(&mut state);
        }
    }

    fn finish(&self, result: Result<String, String>) {
        *self.state.lock() = FlightState::Done(result);
        self.done.notify_all();
    }
}

enum Claim {
    Complete(String),
    Owned { reclaimed: bool },
    Busy,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

/// Shared result cache. Cheap to share behind an `Arc`.
pub struct CacheManager {
    db_path: PathBuf,
    lease: Duration,
    poll_interval: Duration,
    owner_id: String,
    inflight: Mutex<HashMap<CacheKey, Arc<Flight>>>,
    stats: Mutex<CacheStats>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("db_path", &self.db_path)
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

impl CacheManager {
    /// Open (and initialise) the cache database at `db_path`.
    pub fn new(db_path: impl AsRef<Path>, lease: Duration, poll_interval: Duration) -> XrayResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let manager = Self {
            db_path,
            lease,
            poll_interval,
            owner_id: format!("{}-{}-{:x}", std::process::id(), instance, now_millis()),
            inflight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        };
        schema::init_schema(&manager.connect()?)?;
        Ok(manager)
    }

    pub fn open(config: &CacheConfig) -> XrayResult<Self> {
        Self::new(&config.path, config.lease(), config.poll_interval())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    fn connect(&self) -> XrayResult<Connection> {
        open_connection(&self.db_path)
    }

    // -- lookups ------------------------------------------------------------

    /// Payload of a complete entry.
    pub fn lookup(&self, key: &CacheKey) -> XrayResult<Option<String>> {
        let conn = self.connect()?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT status, payload FROM cache_entries \
                 WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4;",
                params![key.kind.as_str(), key.package.name, key.package.version, key.context],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((status, payload)) if status == EntryStatus::Complete.as_str() => payload,
            _ => None,
        })
    }

    pub fn status(&self, key: &CacheKey) -> XrayResult<Option<EntryStatus>> {
        let conn = self.connect()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM cache_entries \
                 WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4;",
                params![key.kind.as_str(), key.package.name, key.package.version, key.context],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(EntryStatus::parse))
    }

    /// Number of computations attempted for `key` across all processes.
    pub fn attempts(&self, key: &CacheKey) -> XrayResult<i64> {
        let conn = self.connect()?;
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM cache_entries \
                 WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4;",
                params![key.kind.as_str(), key.package.name, key.package.version, key.context],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(0))
    }

    /// Entry counts per status.
    pub fn count_by_status(&self) -> XrayResult<HashMap<String, i64>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM cache_entries GROUP BY status;")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count);
        }
        Ok(out)
    }

    /// Drop an entry so the next request recomputes it.
    pub fn invalidate(&self, key: &CacheKey) -> XrayResult<bool> {
        let conn = self.connect()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries \
             WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4 \
             AND status != 'in_progress';",
            params![key.kind.as_str(), key.package.name, key.package.version, key.context],
        )?;
        Ok(removed > 0)
    }

    // -- get_or_compute -----------------------------------------------------

    /// Typed wrapper over [`CacheManager::get_or_compute_raw`] with JSON payloads.
    pub fn get_or_compute<T, F>(&self, key: &CacheKey, compute: F) -> XrayResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> XrayResult<T>,
    {
        let payload = self.get_or_compute_raw(key, || {
            let value = compute()?;
            Ok(serde_json::to_string(&value)?)
        })?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// Return the complete payload for `key`, computing it at most once.
    ///
    /// A failed computation leaves the entry `failed` with no payload and is
    /// reported as [`XrayError::ComputationFailed`]; the next call retries.
    pub fn get_or_compute_raw<F>(&self, key: &CacheKey, compute: F) -> XrayResult<String>
    where
        F: FnOnce() -> XrayResult<String>,
    {
        if let Some(payload) = self.lookup(key)? {
            self.stats.lock().hits += 1;
            debug!(key = %key, "cache hit");
            return Ok(payload);
        }

        let (flight, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let flight = Arc::new(Flight::new());
                    inflight.insert(key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            self.stats.lock().waited += 1;
            debug!(key = %key, "waiting on in-process owner");
            return flight.wait().map_err(|message| XrayError::ComputationFailed {
                key: key.to_string(),
                message,
            });
        }

        let mut slot = FlightSlot {
            manager: self,
            key,
            flight,
            published: false,
        };
        let outcome = self.lead(key, compute);
        slot.publish(match &outcome {
            Ok(payload) => Ok(payload.clone()),
            Err(e) => Err(e.to_string()),
        });
        outcome
    }

    /// Claim the key across processes, then compute or adopt the result.
    fn lead<F>(&self, key: &CacheKey, compute: F) -> XrayResult<String>
    where
        F: FnOnce() -> XrayResult<String>,
    {
        loop {
            match self.try_claim(key)? {
                Claim::Complete(payload) => {
                    self.stats.lock().hits += 1;
                    return Ok(payload);
                }
                Claim::Busy => {
                    std::thread::sleep(self.poll_interval);
                }
                Claim::Owned { reclaimed } => {
                    if reclaimed {
                        self.stats.lock().reclaimed += 1;
                        warn!(key = %key, "reclaimed abandoned in-progress entry");
                    }
                    return self.compute_owned(key, compute);
                }
            }
        }
    }

    fn try_claim(&self, key: &CacheKey) -> XrayResult<Claim> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<String>, Option<String>, Option<i64>)> = tx
            .query_row(
                "SELECT status, payload, owner, heartbeat_at FROM cache_entries \
                 WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4;",
                params![key.kind.as_str(), key.package.name, key.package.version, key.context],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let now = now_millis();
        let mut reclaimed = false;
        if let Some((status, payload, owner, heartbeat)) = row {
            match EntryStatus::parse(&status) {
                Some(EntryStatus::Complete) => {
                    if let Some(payload) = payload {
                        return Ok(Claim::Complete(payload));
                    }
                }
                Some(EntryStatus::InProgress) => {
                    let age = now - heartbeat.unwrap_or(0);
                    let ours = owner.as_deref() == Some(self.owner_id.as_str());
                    if !ours && age < self.lease.as_millis() as i64 {
                        return Ok(Claim::Busy);
                    }
                    reclaimed = !ours;
                }
                Some(EntryStatus::Failed) | None => {}
            }
        }

        tx.execute(
            "INSERT INTO cache_entries \
               (kind, package, version, context, status, payload, owner, heartbeat_at, error, updated_at, attempts) \
             VALUES (?1, ?2, ?3, ?4, 'in_progress', NULL, ?5, ?6, NULL, ?6, 1) \
             ON CONFLICT(kind, package, version, context) DO UPDATE SET \
               status = 'in_progress', payload = NULL, owner = excluded.owner, \
               heartbeat_at = excluded.heartbeat_at, error = NULL, \
               updated_at = excluded.updated_at, attempts = cache_entries.attempts + 1;",
            params![
                key.kind.as_str(),
                key.package.name,
                key.package.version,
                key.context,
                self.owner_id,
                now
            ],
        )?;
        tx.commit()?;
        Ok(Claim::Owned { reclaimed })
    }

    fn compute_owned<F>(&self, key: &CacheKey, compute: F) -> XrayResult<String>
    where
        F: FnOnce() -> XrayResult<String>,
    {
        let mut lease = OwnedLease::start(self, key);
        info!(key = %key, "computing");
        match compute() {
            Ok(payload) => {
                lease.complete(&payload)?;
                self.stats.lock().computed += 1;
                Ok(payload)
            }
            Err(e) => {
                let message = e.to_string();
                lease.fail(&message);
                self.stats.lock().failures += 1;
                warn!(key = %key, error = %message, "computation failed");
                Err(XrayError::ComputationFailed {
                    key: key.to_string(),
                    message,
                })
            }
        }
    }

    fn mark_failed(&self, key: &CacheKey, message: &str) -> XrayResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE cache_entries SET status = 'failed', payload = NULL, owner = NULL, \
             error = ?6, updated_at = ?7 \
             WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4 AND owner = ?5;",
            params![
                key.kind.as_str(),
                key.package.name,
                key.package.version,
                key.context,
                self.owner_id,
                message,
                now_millis()
            ],
        )?;
        Ok(())
    }

    fn mark_complete(&self, key: &CacheKey, payload: &str) -> XrayResult<()> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE cache_entries SET status = 'complete', payload = ?6, owner = NULL, \
             error = NULL, updated_at = ?7 \
             WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4 AND owner = ?5;",
            params![
                key.kind.as_str(),
                key.package.name,
                key.package.version,
                key.context,
                self.owner_id,
                payload,
                now_millis()
            ],
        )?;
        if updated == 0 {
            warn!(key = %key, "lost ownership before completion; result not persisted");
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> XrayResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(30))?;
    Ok(conn)
}

/// Refresh the heartbeat of an owned entry until stopped.
fn spawn_heartbeat(
    db_path: PathBuf,
    key: CacheKey,
    owner: String,
    every: Duration,
) -> (Sender<()>, JoinHandle<()>) {
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = std::thread::spawn(move || loop {
        match stopped.recv_timeout(every) {
            Err(RecvTimeoutError::Timeout) => {
                let beat = open_connection(&db_path).and_then(|conn| {
                    conn.execute(
                        "UPDATE cache_entries SET heartbeat_at = ?6 \
                         WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4 \
                         AND owner = ?5 AND status = 'in_progress';",
                        params![
                            key.kind.as_str(),
                            key.package.name,
                            key.package.version,
                            key.context,
                            owner,
                            now_millis()
                        ],
                    )?;
                    Ok(())
                });
                if let Err(e) = beat {
                    debug!(key = %key, error = %e, "heartbeat failed");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    });
    (stop, handle)
}

/// Ownership of one key while its computation runs. Dropping it without
/// completing (e.g. while unwinding) marks the entry failed.
struct OwnedLease<'a> {
    manager: &'a CacheManager,
    key: &'a CacheKey,
    heartbeat: Option<(Sender<()>, JoinHandle<()>)>,
    settled: bool,
}

impl<'a> OwnedLease<'a> {
    fn start(manager: &'a CacheManager, key: &'a CacheKey) -> Self {
        let every = (manager.lease / 3).max(Duration::from_millis(10));
        let heartbeat = spawn_heartbeat(
            manager.db_path.clone(),
            key.clone(),
            manager.owner_id.clone(),
            every,
        );
        Self {
            manager,
            key,
            heartbeat: Some(heartbeat),
            settled: false,
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some((stop, handle)) = self.heartbeat.take() {
            let _ = stop.send(());
            let _ = handle.join();
        }
    }

    fn complete(&mut self, payload: &str) -> XrayResult<()> {
        self.stop_heartbeat();
        self.settled = true;
        self.manager.mark_complete(self.key, payload)
    }

    fn fail(&mut self, message: &str) {
        self.stop_heartbeat();
        self.settled = true;
        if let Err(e) = self.manager.mark_failed(self.key, message) {
            warn!(key = %self.key, error = %e, "could not record failure");
        }
    }
}

impl Drop for OwnedLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.fail("computation aborted");
        }
    }
}

/// In-process slot held by the local leader; always resolved for waiters.
struct FlightSlot<'a> {
    manager: &'a CacheManager,
    key: &'a CacheKey,
    flight: Arc<Flight>,
    published: bool,
}

impl FlightSlot<'_> {
    fn publish(&mut self, result: Result<String, String>) {
        self.manager.inflight.lock().remove(self.key);
        self.flight.finish(result);
        self.published = true;
    }
}

impl Drop for FlightSlot<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(Err("computation aborted".to_string()));
        }
    }
}
