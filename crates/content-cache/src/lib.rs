//! Disk-backed content cache with size- and age-bounded eviction
//!
//! Stores byte blobs as flat files in a single directory with an in-memory
//! metadata index, reconciles that index against the directory on startup,
//! and evicts by write time to hold a total-size cap and a maximum entry age.

mod cache;
mod error;
mod types;

pub use cache::{ContentCache, DEFAULT_MAX_CACHE_AGE_HOURS, DEFAULT_MAX_CACHE_SIZE};
pub use error::{CacheError, Result};
pub use types::CacheStats;
