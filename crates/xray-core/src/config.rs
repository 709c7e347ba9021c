//! Runtime configuration: defaults, optional TOML file, environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridges::symbols::MatchMode;
use crate::errors::{XrayError, XrayResult};
use crate::query::guards::{
    clamp_depth, clamp_limit, DEFAULT_CHAIN_DEPTH, DEFAULT_LEASE_SECS, DEFAULT_MAX_CHAINS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_SCAN_DEPTH, DEFAULT_SCAN_OBJECTS, DEFAULT_UNWRAP_DEPTH,
    MAX_CHAINS, MAX_CHAIN_DEPTH, MAX_SCAN_DEPTH, MAX_SCAN_OBJECTS, MAX_UNWRAP_DEPTH,
    MIN_LEASE_SECS, MIN_POLL_INTERVAL_MS,
};

// ---------------------------------------------------------------------------
// Helper: tilde expansion (equivalent to Python's Path.expanduser())
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// An in-progress entry whose heartbeat is older than this is stale.
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: expand_tilde("~/.cache/xray/cache.sqlite3"),
            lease_secs: DEFAULT_LEASE_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(MIN_LEASE_SECS))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_depth: usize,
    pub max_objects: usize,
    pub max_unwrap_depth: usize,
    pub match_mode: MatchMode,
    pub emit_import_bridges: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_SCAN_DEPTH,
            max_objects: DEFAULT_SCAN_OBJECTS,
            max_unwrap_depth: DEFAULT_UNWRAP_DEPTH,
            match_mode: MatchMode::Exact,
            emit_import_bridges: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub max_chains: usize,
    pub max_depth: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_chains: DEFAULT_MAX_CHAINS,
            max_depth: DEFAULT_CHAIN_DEPTH,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
    pub native_timeout_secs: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: rayon::current_num_threads(),
            native_timeout_secs: None,
        }
    }
}

impl BatchConfig {
    pub fn native_timeout(&self) -> Option<Duration> {
        self.native_timeout_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// XrayConfig
// ---------------------------------------------------------------------------

/// Top-level configuration shared by every stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XrayConfig {
    pub cache: CacheConfig,
    pub scan: ScanConfig,
    pub chains: ChainConfig,
    pub batch: BatchConfig,
}

impl XrayConfig {
    /// Defaults, then the TOML file (if given), then `XRAY_*` env overrides.
    pub fn load(path: Option<&Path>) -> XrayResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config.clamped())
    }

    pub fn from_toml_str(text: &str) -> XrayResult<Self> {
        let mut config: XrayConfig = toml::from_str(text)?;
        let raw = config.cache.path.to_string_lossy().into_owned();
        config.cache.path = expand_tilde(&raw);
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process env in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> XrayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("XRAY_CACHE_PATH") {
            self.cache.path = expand_tilde(path.trim());
        }
        if let Some(v) = lookup("XRAY_CACHE_LEASE_SECS") {
            self.cache.lease_secs = parse_number("XRAY_CACHE_LEASE_SECS", &v)?;
        }
        if let Some(v) = lookup("XRAY_WORKERS") {
            self.batch.workers = parse_number("XRAY_WORKERS", &v)?;
        }
        if let Some(v) = lookup("XRAY_NATIVE_TIMEOUT_SECS") {
            let secs: u64 = parse_number("XRAY_NATIVE_TIMEOUT_SECS", &v)?;
            self.batch.native_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(v) = lookup("XRAY_MATCH_MODE") {
            self.scan.match_mode = match v.trim().to_lowercase().as_str() {
                "exact" => MatchMode::Exact,
                "nearest" => MatchMode::Nearest,
                other => {
                    return Err(XrayError::Config(format!(
                        "XRAY_MATCH_MODE must be exact or nearest, got {other:?}"
                    )))
                }
            };
        }
        Ok(())
    }

    /// Bound every limit to its guard range.
    pub fn clamped(mut self) -> Self {
        self.scan.max_depth = clamp_depth(self.scan.max_depth, MAX_SCAN_DEPTH);
        self.scan.max_objects = clamp_limit(self.scan.max_objects, MAX_SCAN_OBJECTS);
        self.scan.max_unwrap_depth = clamp_depth(self.scan.max_unwrap_depth, MAX_UNWRAP_DEPTH);
        self.chains.max_chains = clamp_limit(self.chains.max_chains, MAX_CHAINS);
        self.chains.max_depth = clamp_depth(self.chains.max_depth, MAX_CHAIN_DEPTH);
        self.batch.workers = self.batch.workers.max(1);
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> XrayResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| XrayError::Config(format!("{key} must be a non-negative integer, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_within_guards() {
        let config = XrayConfig::default().clamped();
        assert_eq!(config.scan.match_mode, MatchMode::Exact);
        assert!(!config.scan.emit_import_bridges);
        assert_eq!(config.chains.max_chains, DEFAULT_MAX_CHAINS);
        assert!(config.batch.workers >= 1);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let text = r#"
            [scan]
            max_depth = 4
            emit_import_bridges = true

            [chains]
            max_chains = 0
        "#;
        let config = XrayConfig::from_toml_str(text).unwrap().clamped();
        assert_eq!(config.scan.max_depth, 4);
        assert!(config.scan.emit_import_bridges);
        assert_eq!(config.chains.max_chains, 1);
        assert_eq!(config.chains.max_depth, DEFAULT_CHAIN_DEPTH);
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let env: HashMap<&str, &str> = [
            ("XRAY_CACHE_PATH", "/tmp/xray-test.sqlite3"),
            ("XRAY_WORKERS", "3"),
            ("XRAY_NATIVE_TIMEOUT_SECS", "60"),
            ("XRAY_MATCH_MODE", "nearest"),
        ]
        .into_iter()
        .collect();
        let mut config = XrayConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache.path, PathBuf::from("/tmp/xray-test.sqlite3"));
        assert_eq!(config.batch.workers, 3);
        assert_eq!(config.batch.native_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.scan.match_mode, MatchMode::Nearest);
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let mut config = XrayConfig::default();
        let err = config
            .apply_env(|k| (k == "XRAY_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, XrayError::Config(_)));
    }

    #[test]
    fn zero_timeout_disables_native_timeout() {
        let mut config = XrayConfig::default();
        config
            .apply_env(|k| (k == "XRAY_NATIVE_TIMEOUT_SECS").then(|| "0".to_string()))
            .unwrap();
        assert_eq!(config.batch.native_timeout(), None);
    }
}
