//! Shared guardrails for traversal limits and query bounds.

// Bridge recovery guards
pub const MAX_UNWRAP_DEPTH: usize = 32;
pub const DEFAULT_UNWRAP_DEPTH: usize = 8;
pub const MAX_SCAN_DEPTH: usize = 64;
pub const DEFAULT_SCAN_DEPTH: usize = 12;
pub const MAX_SCAN_OBJECTS: usize = 5_000_000;
pub const DEFAULT_SCAN_OBJECTS: usize = 500_000;

// Chain enumeration guards
pub const MAX_CHAINS: usize = 100_000;
pub const DEFAULT_MAX_CHAINS: usize = 1_000;
pub const MAX_CHAIN_DEPTH: usize = 512;
pub const DEFAULT_CHAIN_DEPTH: usize = 64;

// Cache guards
pub const MIN_LEASE_SECS: u64 = 5;
pub const DEFAULT_LEASE_SECS: u64 = 900;
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_depth(value: usize, maximum: usize) -> usize {
    value.clamp(1, maximum)
}

pub fn clamp_limit(value: usize, maximum: usize) -> usize {
    value.clamp(1, maximum)
}
