//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for one cached blob, plus its lazily loaded content.
///
/// `data` doubles as the loaded flag: `None` until the file has been read,
/// after which `size` always equals `data.len()`.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub id: String,
    pub path: PathBuf,
    pub last_write: DateTime<Utc>,
    pub size: u64,
    pub data: Option<Vec<u8>>,
}

impl CacheEntry {
    /// Entry age in hours relative to `now`.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_write).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}
