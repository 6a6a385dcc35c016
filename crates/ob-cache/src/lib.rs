//! Persistent memoization of benchmark runs.

pub mod cache;
pub mod key;

pub use cache::{CacheMode, CacheOutcome, CacheStats, RunCache, CACHE_DIR_ENV};
pub use key::CacheKey;
