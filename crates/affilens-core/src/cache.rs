//! On-disk PDF cache.
//!
//! One file per paper id under the cache directory. Writes go through a
//! temp file and an atomic rename, so a crashed download never leaves a
//! truncated PDF behind. Per-id async locks let concurrent workers dedup
//! downloads of the same paper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Hit/miss counters, reported at the end of a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct DocumentCache {
    dir: PathBuf,
    /// Per-id locks so only one worker downloads a given paper at a time.
    locks: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DocumentCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Where the PDF for `id` lives (whether or not it exists yet).
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.pdf", sanitize_id(id)))
    }

    /// Look up a cached PDF. Counts a hit or a miss.
    pub fn get(&self, id: &str) -> Option<PathBuf> {
        let path = self.path_for(id);
        if path.is_file() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(path)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store PDF bytes for `id` atomically and return the final path.
    pub fn put(&self, id: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path_for(id);
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::fs::write(tmp.path(), bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    /// Per-id lock guarding fetch of `id`. Hold it across the
    /// check-then-download sequence.
    pub fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Map a paper id onto a safe, unique file stem. Anything outside
/// `[A-Za-z0-9._-]` becomes `_`; a short hash of the original id is
/// appended so ids that sanitize identically ("a:b" and "a_b") still get
/// distinct paths. `DefaultHasher::new()` uses fixed keys, so the stem is
/// stable across runs.
fn sanitize_id(id: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{:08x}", stem, hasher.finish() as u32)
}
