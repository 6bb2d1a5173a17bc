//! Persistent sync cache, one file per root pair
//!
//! The cache is loaded whole at session start, mutated in memory, and
//! committed atomically (write to temp, rename). A crash mid-commit
//! never leaves a torn file; a later load sees either the old or the
//! new state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::state::FileRecord;

/// Identity of one (local-root, remote-root) pairing. Scopes exactly
/// one cache file and one session lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootPairKey {
    pub local: String,
    pub remote: String,
}

impl RootPairKey {
    #[must_use]
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Stable short fingerprint used as the cache file name
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.local.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.remote.as_bytes());
        let hex = hasher.finalize().to_hex().to_string();
        hex[..16].to_string()
    }
}

/// In-memory cache for one root pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCache {
    /// Path -> record; insertion order irrelevant, stored sorted
    pub entries: BTreeMap<String, FileRecord>,
    /// Advances monotonically on each committed sync
    pub last_sync_at: i64,
}

impl SyncCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure in-memory lookup; no disk I/O
    #[must_use]
    pub fn record(&self, path: &str) -> Option<&FileRecord> {
        self.entries.get(path)
    }

    /// Insert or replace a record, keyed by its path
    pub fn upsert(&mut self, record: FileRecord) {
        self.entries.insert(record.path.clone(), record);
    }

    /// Remove a record, returning it if present
    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.entries.remove(path)
    }

    /// The reconciliation baseline for a path, if one was ever synced
    #[must_use]
    pub fn baseline(&self, path: &str) -> Option<&ContentHash> {
        self.entries.get(path).and_then(FileRecord::baseline)
    }

    /// Advance the sync timestamp; strictly monotonic even under
    /// clock skew or sub-second re-runs.
    pub fn touch(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.last_sync_at = now.max(self.last_sync_at + 1);
    }
}

/// Disk store for caches, one JSON file per root pair.
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn cache_path(&self, key: &RootPairKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.fingerprint()))
    }

    /// Load the cache for a root pair, or an empty cache if none exists.
    ///
    /// # Errors
    /// Returns `SyncError::CacheCorrupt` if the persisted form cannot be
    /// parsed; the caller decides whether to discard and reinitialize.
    pub fn load(&self, key: &RootPairKey) -> Result<SyncCache> {
        let path = self.cache_path(key);
        if !path.exists() {
            debug!(path = %path.display(), "no cache file, starting empty");
            return Ok(SyncCache::new());
        }

        let content = std::fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(SyncCache::new());
        }

        let cache: SyncCache =
            serde_json::from_str(&content).map_err(|e| SyncError::CacheCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        info!(
            path = %path.display(),
            entries = cache.entries.len(),
            "loaded sync cache"
        );
        Ok(cache)
    }

    /// Persist the full cache atomically: serialize, write to a temp
    /// file, rename over the target.
    ///
    /// # Errors
    /// Returns an error if serialization or any filesystem step fails;
    /// on failure the previous cache file is untouched.
    pub fn commit(&self, key: &RootPairKey, cache: &SyncCache) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.cache_path(key);
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(cache)?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;

        debug!(
            path = %path.display(),
            entries = cache.entries.len(),
            last_sync_at = cache.last_sync_at,
            "committed sync cache"
        );
        Ok(())
    }

    /// Discard persisted state for a root pair; the next sync treats
    /// every path as new.
    ///
    /// # Errors
    /// Returns an error if the cache file exists but cannot be removed.
    pub fn clear(&self, key: &RootPairKey) -> Result<()> {
        let path = self.cache_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!(path = %path.display(), "cleared sync cache");
        }
        Ok(())
    }
}

/// Content-addressed stash of baseline file contents, keyed by hash.
///
/// Three-way merge needs the bytes behind `last_synced_hash`, which
/// neither replica still has once both sides diverge. Whenever a
/// baseline is confirmed, the content is stored here; `prune` drops
/// objects no record references anymore.
pub struct BaseStore {
    dir: PathBuf,
}

impl BaseStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(hash.to_hex())
    }

    /// Fetch baseline content by hash
    #[must_use]
    pub fn get(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        std::fs::read(self.object_path(hash)).ok()
    }

    /// Store baseline content; a no-op if the object already exists.
    ///
    /// # Errors
    /// Returns an error if the object cannot be written.
    pub fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.object_path(hash);
        if !path.exists() {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, data)?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(())
    }

    /// Remove objects not referenced by any record's baseline.
    ///
    /// # Errors
    /// Returns an error only if the store directory cannot be listed.
    pub fn prune(&self, cache: &SyncCache) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }

        let referenced: std::collections::HashSet<String> = cache
            .entries
            .values()
            .filter_map(|r| r.last_synced_hash.as_ref())
            .map(ContentHash::to_hex)
            .collect();

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}
