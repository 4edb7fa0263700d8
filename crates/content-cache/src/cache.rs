//! Disk-backed content cache
//!
//! One flat directory holds one `<id>.bytes` file per entry; an in-memory
//! index tracks per-entry metadata and the running total size. Content is
//! loaded lazily on first access. Eviction is by write time: entries older
//! than the age cap are purged, and the write-time-oldest entries are evicted
//! while the running total exceeds the size cap.

use crate::error::{CacheError, Result};
use crate::types::{CacheEntry, CacheStats};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default size cap (50 MiB).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 50 * 1024 * 1024;

/// Default age cap (one week).
pub const DEFAULT_MAX_CACHE_AGE_HOURS: f64 = 24.0 * 7.0;

/// Index plus accounting, guarded by one lock so that concurrent calls are
/// safe and index mutation stays in step with disk mutation.
#[derive(Default)]
struct CacheState {
    index: HashMap<String, CacheEntry>,
    total_size: u64,
    hits: u64,
    misses: u64,
}

/// Disk-backed content cache with size- and age-bounded eviction.
///
/// Keys are sanitized ids (path separators become `_`), each backed by one
/// `<id>.bytes` file directly under the cache directory. File mtime is the
/// only persisted freshness signal; `init` rebuilds the index from it.
pub struct ContentCache {
    root: PathBuf,
    max_size_bytes: u64,
    max_age_hours: f64,
    state: Mutex<CacheState>,
}

impl ContentCache {
    /// Create a cache over `root` with explicit size and age caps.
    ///
    /// No disk access happens until [`init`](Self::init).
    pub fn new(root: impl Into<PathBuf>, max_size_bytes: u64, max_age_hours: f64) -> Self {
        Self {
            root: root.into(),
            max_size_bytes,
            max_age_hours,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Create a cache over `root` with the default caps (50 MiB, one week).
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_MAX_CACHE_SIZE, DEFAULT_MAX_CACHE_AGE_HOURS)
    }

    /// Cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Size cap in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Age cap in hours.
    pub fn max_age_hours(&self) -> f64 {
        self.max_age_hours
    }

    /// Initialize the cache: create the directory if needed, rebuild the
    /// index from the files already present, then purge aged entries.
    ///
    /// Fails only if the cache directory cannot be created. Per-file scan
    /// errors are logged and the file skipped; content is not read here,
    /// only metadata.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.index.clear();
            state.total_size = 0;

            match fs::read_dir(&self.root).await {
                Ok(mut dir) => loop {
                    let entry = match dir.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "cache directory scan aborted");
                            break;
                        }
                    };

                    let path = entry.path();
                    let meta = match entry.metadata().await {
                        Ok(meta) => meta,
                        Err(e) => {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "skipping unreadable cache file"
                            );
                            continue;
                        }
                    };
                    if !meta.is_file() {
                        continue;
                    }

                    let id = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(stem) => stem.to_string(),
                        None => {
                            warn!(
                                path = %path.display(),
                                "skipping cache file without a usable stem"
                            );
                            continue;
                        }
                    };
                    if state.index.contains_key(&id) {
                        warn!(
                            id = %id,
                            path = %path.display(),
                            "duplicate cache stem, skipping file"
                        );
                        continue;
                    }

                    let last_write = match meta.modified() {
                        Ok(mtime) => DateTime::<Utc>::from(mtime),
                        Err(e) => {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "skipping cache file without mtime"
                            );
                            continue;
                        }
                    };

                    let size = meta.len();
                    state.total_size += size;
                    state.index.insert(
                        id.clone(),
                        CacheEntry {
                            id,
                            path,
                            last_write,
                            size,
                            data: None,
                        },
                    );
                },
                Err(e) => {
                    warn!(error = %e, "failed to scan cache directory");
                }
            }

            info!(
                entries = state.index.len(),
                total_size = state.total_size,
                "content cache initialized"
            );
        }

        // Purge stale entries before first use.
        self.flush_aged().await;

        Ok(())
    }

    /// Look up `id` and return its content, reading the backing file into
    /// memory on first access.
    ///
    /// Returns `Ok(None)` for a key that was never indexed; a read failure
    /// on an indexed file surfaces as an IO error. A size mismatch against
    /// the recorded size is not an error: the index is corrected in place
    /// and the actual bytes returned.
    pub async fn find(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let key = sanitize_id(id);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(entry) = state.index.get_mut(&key) else {
            state.misses += 1;
            return Ok(None);
        };

        if entry.data.is_none() {
            let bytes = fs::read(&entry.path).await?;
            let actual = bytes.len() as u64;
            if actual != entry.size {
                warn!(
                    id = %entry.id,
                    expected = entry.size,
                    actual,
                    "cached file size changed on disk, correcting index"
                );
                if actual > entry.size {
                    state.total_size += actual - entry.size;
                } else {
                    state.total_size -= entry.size - actual;
                }
                entry.size = actual;
            }
            entry.data = Some(bytes);
        }

        state.hits += 1;
        Ok(entry.data.clone())
    }

    /// Write `data` under `id`, replacing any existing entry with the same
    /// key, then evict oldest entries while the running total exceeds the
    /// size cap.
    ///
    /// A payload larger than the size cap is rejected up front with
    /// [`CacheError::EntryTooLarge`]; a failure to evict the previous entry
    /// for the same key aborts the save.
    pub async fn save(&self, id: &str, data: &[u8]) -> Result<()> {
        let key = sanitize_id(id);
        let size = data.len() as u64;
        if size > self.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                capacity: self.max_size_bytes,
            });
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.index.contains_key(&key) {
            debug!(id = %key, "replacing existing cache entry");
            self.flush_locked(state, &key).await?;
        }

        let path = self.root.join(format!("{}.bytes", key));
        fs::write(&path, data).await?;

        state.total_size += size;
        state.index.insert(
            key.clone(),
            CacheEntry {
                id: key,
                path,
                last_write: Utc::now(),
                size,
                data: Some(data.to_vec()),
            },
        );

        while state.total_size > self.max_size_bytes {
            if !self.flush_oldest_locked(state).await {
                break;
            }
        }

        Ok(())
    }

    /// Evict a single entry: remove its backing file, then drop it from the
    /// index and subtract its size.
    ///
    /// Returns `Ok(false)` for an unknown key. If the file cannot be
    /// removed the error is returned and the index entry is left intact; a
    /// file already deleted out of band still evicts.
    pub async fn flush(&self, id: &str) -> Result<bool> {
        let key = sanitize_id(id);
        let mut guard = self.state.lock().await;
        self.flush_locked(&mut guard, &key).await
    }

    /// Evict every entry older than the age cap. Returns whether at least
    /// one entry was evicted; per-entry failures are logged and skipped.
    pub async fn flush_aged(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Utc::now();

        let aged: Vec<String> = guard
            .index
            .values()
            .filter(|entry| entry.age_hours(now) > self.max_age_hours)
            .map(|entry| entry.id.clone())
            .collect();

        let mut flushed = false;
        for id in aged {
            match self.flush_locked(&mut guard, &id).await {
                Ok(removed) => flushed |= removed,
                Err(e) => warn!(id = %id, error = %e, "failed to flush aged cache entry"),
            }
        }

        flushed
    }

    /// Evict the entry with the oldest write time. Returns false on an
    /// empty index or when the eviction fails.
    pub async fn flush_oldest(&self) -> bool {
        let mut guard = self.state.lock().await;
        self.flush_oldest_locked(&mut guard).await
    }

    /// Remove every backing file (best effort), then clear the index and
    /// reset the running size. Never fails from the caller's perspective.
    pub async fn flush_all(&self) {
        let mut guard = self.state.lock().await;

        for entry in guard.index.values() {
            if let Err(e) = fs::remove_file(&entry.path).await {
                warn!(id = %entry.id, error = %e, "failed to remove cache file");
            }
        }

        guard.index.clear();
        guard.total_size = 0;
    }

    /// Snapshot of entry count, running size, and hit/miss counters.
    pub async fn stats(&self) -> CacheStats {
        let guard = self.state.lock().await;
        CacheStats {
            entries: guard.index.len(),
            total_size: guard.total_size,
            hits: guard.hits,
            misses: guard.misses,
        }
    }

    async fn flush_locked(&self, state: &mut CacheState, key: &str) -> Result<bool> {
        let Some(entry) = state.index.get(key) else {
            return Ok(false);
        };

        // Disk removal first: on failure the entry stays indexed untouched.
        // A file already gone counts as removed.
        match fs::remove_file(&entry.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id = %entry.id, "cache file already missing on disk, dropping entry");
            }
            Err(e) => return Err(e.into()),
        }

        let size = entry.size;
        state.index.remove(key);
        state.total_size -= size;
        Ok(true)
    }

    async fn flush_oldest_locked(&self, state: &mut CacheState) -> bool {
        let Some(oldest) = state
            .index
            .values()
            .min_by_key(|entry| entry.last_write)
            .map(|entry| entry.id.clone())
        else {
            return false;
        };

        match self.flush_locked(state, &oldest).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(id = %oldest, error = %e, "failed to flush oldest cache entry");
                false
            }
        }
    }
}

/// Normalize an id for use as a file stem: path separators become `_`.
fn sanitize_id(id: &str) -> String {
    id.replace('/', "_").replace('\\', "_")
}
