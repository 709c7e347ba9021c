pub mod cache;
pub mod schema;

pub use cache::{CacheKey, CacheKind, CacheManager, CacheStats, EntryStatus};
