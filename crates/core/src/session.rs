//! Sync session: the state machine driving one root pair
//!
//! A session owns the cache for its pair and holds the pair's advisory
//! lock for its lifetime. `run_sync` walks the full pass: snapshot both
//! replicas, build the plan, encode and apply per-file payloads, update
//! baselines for confirmed writes only, commit the cache atomically.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::block::BlockDiffer;
use crate::cache::{BaseStore, CacheStore, RootPairKey, SyncCache};
use crate::config::SyncOptions;
use crate::conflict::{
    build_plan, ConflictRecord, ResolutionOutcome, ResolutionPolicy, SyncPlan,
};
use crate::diff::{BlockStrategy, DiffMode, DiffStrategy, TreeStrategy};
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::merge::{merge3, MergeOutcome};
use crate::replica::{LocalReplica, Replica};
use crate::scan::STATE_DIR;
use crate::state::{derive_status, FileRecord, SyncStatus};
use crate::tree::{classify, IgnoreRules, TreeChange};

/// Transient local IO is retried this many times before the failure is
/// reported for that file
const IO_RETRIES: usize = 3;

/// Where a session is in its lifecycle. External callers only ever
/// observe `Idle` or `AwaitingResolution`; the rest exist for logging
/// and for `InvalidState` reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    ComparingState,
    Diffing,
    DetectingConflicts,
    AwaitingResolution,
    Applying,
    Committing,
}

/// In-process registry of held root-pair locks. Distinct pairs sync
/// concurrently; a second session for the same pair is refused.
static ACTIVE_PAIRS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

struct SessionLock {
    fingerprint: String,
}

impl SessionLock {
    fn acquire(key: &RootPairKey) -> Result<Self> {
        let registry = ACTIVE_PAIRS.get_or_init(|| Mutex::new(HashSet::new()));
        let mut held = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.fingerprint()) {
            return Err(SyncError::SessionActive);
        }
        Ok(Self {
            fingerprint: key.fingerprint(),
        })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Some(registry) = ACTIVE_PAIRS.get() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.fingerprint);
        }
    }
}

/// Outcome of one sync pass (or one resolution round).
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Files written, deleted, or resolved successfully
    pub files_synced: usize,
    /// Per-file failures as `(path, error)`; siblings were unaffected
    pub files_failed: Vec<(String, String)>,
    /// Conflicts: pending ones under `Manual`, resolved ones otherwise
    pub conflicts: Vec<ConflictRecord>,
}

/// One row of `compute_status` output.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub path: String,
    pub status: SyncStatus,
    pub local_hash: Option<ContentHash>,
    pub remote_hash: Option<ContentHash>,
    pub last_synced_hash: Option<ContentHash>,
}

#[derive(Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

/// A sync session between a local directory and a remote replica.
pub struct SyncSession {
    state: SessionState,
    local: LocalReplica,
    remote: Box<dyn Replica>,
    key: RootPairKey,
    store: CacheStore,
    base: BaseStore,
    cache: SyncCache,
    options: SyncOptions,
    differ: BlockDiffer,
    strategy: Box<dyn DiffStrategy>,
    pending: Vec<ConflictRecord>,
    _lock: SessionLock,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession").finish_non_exhaustive()
    }
}

impl SyncSession {
    /// Initialize a session for a root pair.
    ///
    /// Loads `.mirsync.toml` from the local root when `options` is
    /// `None`, loads (or creates) the cache, and acquires the pair's
    /// advisory lock.
    ///
    /// # Errors
    /// `SyncError::SessionActive` if another session holds this pair;
    /// `SyncError::CacheCorrupt` if the persisted cache will not parse.
    pub fn init(
        local_root: impl AsRef<Path>,
        remote: Box<dyn Replica>,
        options: Option<SyncOptions>,
    ) -> Result<Self> {
        let local = LocalReplica::open(local_root)?;
        let options = match options {
            Some(options) => options,
            None => SyncOptions::load(local.root())?,
        };

        let key = RootPairKey::new(local.id(), remote.id());
        let lock = SessionLock::acquire(&key)?;

        let cache_dir = options
            .cache_dir
            .clone()
            .unwrap_or_else(|| local.root().join(STATE_DIR));
        let store = CacheStore::new(&cache_dir);
        let base = BaseStore::new(cache_dir.join("objects"));
        let cache = store.load(&key)?;

        let differ = BlockDiffer::with_block_size(options.block_size);
        let strategy: Box<dyn DiffStrategy> = match options.mode {
            DiffMode::Block => Box::new(BlockStrategy::new(BlockDiffer::with_block_size(
                options.block_size,
            ))),
            DiffMode::Tree => Box::new(TreeStrategy),
        };

        info!(
            local = %local.id(),
            remote = %remote.id(),
            mode = ?options.mode,
            "sync session initialized"
        );

        Ok(Self {
            state: SessionState::Idle,
            local,
            remote,
            key,
            store,
            base,
            cache,
            options,
            differ,
            strategy,
            pending: Vec::new(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Conflicts parked by a `Manual`-policy pass
    #[must_use]
    pub fn pending_conflicts(&self) -> &[ConflictRecord] {
        &self.pending
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "session transition");
        self.state = state;
    }

    /// Derived per-path status across both replicas. Read-only; the
    /// cache and both trees are untouched.
    ///
    /// # Errors
    /// `SyncError::InvalidState` unless the session is idle or awaiting
    /// resolution; scan failures propagate.
    pub fn compute_status(&self) -> Result<Vec<StatusEntry>> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::AwaitingResolution
        ) {
            return Err(SyncError::InvalidState { state: self.state });
        }

        let local_snap = self.local.snapshot(&self.options.ignore)?;
        let remote_snap = self.remote.snapshot(&self.options.ignore)?;
        let rules = IgnoreRules::compile(&self.options.ignore)?;

        let mut paths: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
        paths.extend(local_snap.files.keys());
        paths.extend(remote_snap.files.keys());
        paths.extend(self.cache.entries.keys());

        let mut entries = Vec::new();
        for path in paths {
            if rules.is_ignored(path) {
                continue;
            }
            let local_hash = local_snap.hash_of(path).copied();
            let remote_hash = remote_snap.hash_of(path).copied();
            let last_synced_hash = self.cache.baseline(path).copied();
            let status = derive_status(
                local_hash.as_ref(),
                remote_hash.as_ref(),
                last_synced_hash.as_ref(),
            );
            entries.push(StatusEntry {
                path: path.clone(),
                status,
                local_hash,
                remote_hash,
                last_synced_hash,
            });
        }
        Ok(entries)
    }

    /// Tree-level dry run: how the local tree differs from the remote,
    /// per path. No contents are read beyond scanning's hashes and
    /// nothing is written.
    ///
    /// # Errors
    /// `SyncError::InvalidState` unless idle or awaiting resolution;
    /// scan failures propagate.
    pub fn preview(&self) -> Result<BTreeMap<String, TreeChange>> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::AwaitingResolution
        ) {
            return Err(SyncError::InvalidState { state: self.state });
        }
        let local_snap = self.local.snapshot(&self.options.ignore)?;
        let remote_snap = self.remote.snapshot(&self.options.ignore)?;
        let rules = IgnoreRules::compile(&self.options.ignore)?;
        Ok(classify(&local_snap, &remote_snap, &self.cache, &rules))
    }

    /// Run one full sync pass under the given conflict policy.
    ///
    /// With `Manual` and conflicts present, all non-conflicting files
    /// are applied and committed, and the session parks in
    /// `AwaitingResolution` with the conflicts listed in the result.
    ///
    /// # Errors
    /// `SyncError::InvalidState` unless idle. Scan and commit failures
    /// propagate; per-file apply failures do not, and are enumerated in
    /// the result instead.
    pub fn run_sync(&mut self, policy: ResolutionPolicy) -> Result<SyncResult> {
        if self.state != SessionState::Idle {
            return Err(SyncError::InvalidState { state: self.state });
        }
        self.set_state(SessionState::Initializing);

        self.set_state(SessionState::ComparingState);
        let local_snap = self.local.snapshot(&self.options.ignore)?;
        let remote_snap = self.remote.snapshot(&self.options.ignore)?;

        self.set_state(SessionState::Diffing);
        let rules = IgnoreRules::compile(&self.options.ignore)?;
        let plan = build_plan(&local_snap, &remote_snap, &self.cache, &rules);

        self.set_state(SessionState::DetectingConflicts);
        let mut result = SyncResult::default();

        self.set_state(SessionState::Applying);
        self.apply_plan(&plan, &mut result);

        if plan.conflicts.is_empty() {
            self.commit()?;
            return Ok(result);
        }

        match policy {
            ResolutionPolicy::Manual => {
                // Commit what was applied, park the rest.
                self.set_state(SessionState::Committing);
                self.cache.touch();
                self.store.commit(&self.key, &self.cache)?;
                self.base.prune(&self.cache)?;

                self.pending = plan.conflicts.clone();
                result.conflicts = plan.conflicts;
                self.set_state(SessionState::AwaitingResolution);
                info!(pending = self.pending.len(), "awaiting manual resolution");
                Ok(result)
            }
            policy => {
                let requested = match policy {
                    ResolutionPolicy::PreferLocal => ResolutionOutcome::UseLocal,
                    ResolutionPolicy::PreferRemote => ResolutionOutcome::UseRemote,
                    ResolutionPolicy::Merge => ResolutionOutcome::Merged,
                    ResolutionPolicy::Rename | ResolutionPolicy::Manual => {
                        ResolutionOutcome::Renamed
                    }
                };
                for mut record in plan.conflicts {
                    match self.apply_resolution(&mut record, requested) {
                        Ok(()) => result.files_synced += 1,
                        Err(e) => result.files_failed.push((record.path.clone(), e.to_string())),
                    }
                    result.conflicts.push(record);
                }
                self.commit()?;
                Ok(result)
            }
        }
    }

    /// Apply explicit outcomes to the conflicts parked by a `Manual`
    /// pass. Every pending conflict must be covered.
    ///
    /// # Errors
    /// `SyncError::InvalidState` unless awaiting resolution;
    /// `SyncError::ConflictUnresolved` if any pending conflict lacks an
    /// entry, in which case nothing is applied.
    pub fn resolve_conflicts(
        &mut self,
        resolutions: &BTreeMap<String, ResolutionOutcome>,
    ) -> Result<SyncResult> {
        if self.state != SessionState::AwaitingResolution {
            return Err(SyncError::InvalidState { state: self.state });
        }

        let uncovered = self
            .pending
            .iter()
            .filter(|c| !resolutions.contains_key(&c.path))
            .count();
        if uncovered > 0 {
            return Err(SyncError::ConflictUnresolved { count: uncovered });
        }

        self.set_state(SessionState::Applying);
        let mut result = SyncResult::default();
        let pending = std::mem::take(&mut self.pending);
        for mut record in pending {
            // Coverage was checked above
            if let Some(&requested) = resolutions.get(&record.path) {
                match self.apply_resolution(&mut record, requested) {
                    Ok(()) => result.files_synced += 1,
                    Err(e) => result.files_failed.push((record.path.clone(), e.to_string())),
                }
            }
            result.conflicts.push(record);
        }

        self.commit()?;
        Ok(result)
    }

    /// Abandon a parked session. The cache keeps whatever the pass
    /// already committed; pending conflicts are forgotten.
    ///
    /// # Errors
    /// `SyncError::InvalidState` if called mid-apply (not reachable
    /// through the public API).
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::AwaitingResolution => {
                self.pending.clear();
                self.set_state(SessionState::Idle);
                Ok(())
            }
            state => Err(SyncError::InvalidState { state }),
        }
    }

    /// Discard all persisted state for this pair; the next sync treats
    /// every path as new.
    ///
    /// # Errors
    /// `SyncError::InvalidState` unless idle; removal failures propagate.
    pub fn clear_cache(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SyncError::InvalidState { state: self.state });
        }
        self.store.clear(&self.key)?;
        self.cache = SyncCache::new();
        self.base.prune(&self.cache)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.set_state(SessionState::Committing);
        self.cache.touch();
        self.store.commit(&self.key, &self.cache)?;
        self.base.prune(&self.cache)?;
        self.set_state(SessionState::Idle);
        Ok(())
    }

    fn apply_plan(&mut self, plan: &SyncPlan, result: &mut SyncResult) {
        for path in &plan.push {
            let outcome = self.transfer_file(path, Direction::Push);
            track(path, outcome, result);
        }
        for path in &plan.pull {
            let outcome = self.transfer_file(path, Direction::Pull);
            track(path, outcome, result);
        }
        for path in &plan.delete_remote {
            let outcome = self.delete_file(path, Direction::Push);
            track(path, outcome, result);
        }
        for path in &plan.delete_local {
            let outcome = self.delete_file(path, Direction::Pull);
            track(path, outcome, result);
        }
        for path in &plan.rebaseline {
            if let Ok(bytes) = self.local.read(path) {
                if let Err(e) = self.record_sync(path, &bytes) {
                    result.files_failed.push((path.clone(), e.to_string()));
                }
            }
        }
        for path in &plan.drop_records {
            self.cache.remove(path);
        }
    }

    /// Encode, transfer, and apply one modified or new file.
    ///
    /// The payload is applied against the receiver's prior bytes and
    /// verified; a reconstruction or patch failure falls back to full
    /// content rather than failing the file.
    fn transfer_file(&mut self, path: &str, direction: Direction) -> Result<()> {
        let final_bytes = {
            let (sender, receiver): (&dyn Replica, &dyn Replica) = match direction {
                Direction::Push => (&self.local, self.remote.as_ref()),
                Direction::Pull => (self.remote.as_ref(), &self.local),
            };

            let new_data = with_retry(|| sender.read(path))?;
            let bytes = match read_optional(receiver, path)? {
                None => new_data,
                Some(old_bytes) => {
                    let cached_sig = self
                        .cache
                        .record(path)
                        .filter(|r| r.content_hash == ContentHash::from_bytes(&old_bytes))
                        .and_then(|r| r.block_signatures.as_ref());
                    let payload = self.strategy.update_payload(&new_data, &old_bytes, cached_sig);
                    match payload.apply(&old_bytes, &self.differ) {
                        Ok(rebuilt) => rebuilt,
                        Err(SyncError::Reconstruction { .. } | SyncError::PatchConflict { .. }) => {
                            warn!(path, "payload did not verify, sending full content");
                            new_data
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            with_retry(|| receiver.write(path, &bytes))?;
            bytes
        };

        self.record_sync(path, &final_bytes)
    }

    fn delete_file(&mut self, path: &str, direction: Direction) -> Result<()> {
        {
            let receiver: &dyn Replica = match direction {
                Direction::Push => self.remote.as_ref(),
                Direction::Pull => &self.local,
            };
            with_retry(|| receiver.remove(path))?;
        }
        self.cache.remove(path);
        debug!(path, "deletion propagated");
        Ok(())
    }

    /// Record a confirmed agreement point: both sides now hold `bytes`
    /// at `path`. Stores baseline content for future merges.
    fn record_sync(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let hash = ContentHash::from_bytes(bytes);
        let now = epoch_secs();
        let block_signatures = match self.options.mode {
            DiffMode::Block => Some(self.differ.signature(bytes)),
            DiffMode::Tree => None,
        };

        self.base.put(&hash, bytes)?;
        self.cache.upsert(FileRecord {
            path: path.to_string(),
            size: bytes.len() as u64,
            mtime_secs: now,
            content_hash: hash,
            block_signatures,
            last_synced_hash: Some(hash),
            last_synced_at: now,
        });
        Ok(())
    }

    /// Resolve one conflict. Idempotent: an already-resolved record is
    /// left alone. A deletion-vs-modification race degenerates to the
    /// surviving side regardless of the requested outcome.
    fn apply_resolution(
        &mut self,
        record: &mut ConflictRecord,
        requested: ResolutionOutcome,
    ) -> Result<()> {
        if record.is_resolved() {
            return Ok(());
        }
        let path = record.path.clone();
        let local_bytes = read_optional(&self.local, &path)?;
        let remote_bytes = read_optional(self.remote.as_ref(), &path)?;

        let outcome = match (local_bytes, remote_bytes) {
            (Some(data), None) => {
                self.write_both(&path, &data)?;
                ResolutionOutcome::UseLocal
            }
            (None, Some(data)) => {
                self.write_both(&path, &data)?;
                ResolutionOutcome::UseRemote
            }
            (None, None) => {
                // Both sides gone since detection; nothing to keep
                self.cache.remove(&path);
                record.resolution = Some(requested);
                return Ok(());
            }
            (Some(local_data), Some(remote_data)) => match requested {
                ResolutionOutcome::UseLocal => {
                    self.write_both(&path, &local_data)?;
                    ResolutionOutcome::UseLocal
                }
                ResolutionOutcome::UseRemote => {
                    self.write_both(&path, &remote_data)?;
                    ResolutionOutcome::UseRemote
                }
                ResolutionOutcome::Merged => {
                    match self.try_merge(record.base_hash.as_ref(), &local_data, &remote_data) {
                        Some(merged) => {
                            self.write_both(&path, merged.as_bytes())?;
                            ResolutionOutcome::Merged
                        }
                        None => {
                            self.rename_resolution(&path, &local_data, &remote_data)?;
                            ResolutionOutcome::Renamed
                        }
                    }
                }
                ResolutionOutcome::Renamed => {
                    self.rename_resolution(&path, &local_data, &remote_data)?;
                    ResolutionOutcome::Renamed
                }
            },
        };

        info!(path, ?outcome, "conflict resolved");
        record.resolution = Some(outcome);
        Ok(())
    }

    /// Write identical content on both sides and record the baseline.
    fn write_both(&mut self, path: &str, data: &[u8]) -> Result<()> {
        with_retry(|| self.local.write(path, data))?;
        {
            let remote = self.remote.as_ref();
            with_retry(|| remote.write(path, data))?;
        }
        self.record_sync(path, data)
    }

    /// Three-way merge attempt; `None` means fall back to rename.
    /// Requires the ancestor bytes to still be in the base store and
    /// all three versions to be valid UTF-8.
    fn try_merge(
        &self,
        base_hash: Option<&ContentHash>,
        local_data: &[u8],
        remote_data: &[u8],
    ) -> Option<String> {
        let base_bytes = self.base.get(base_hash?)?;
        let base = String::from_utf8(base_bytes).ok()?;
        let ours = std::str::from_utf8(local_data).ok()?;
        let theirs = std::str::from_utf8(remote_data).ok()?;
        match merge3(&base, ours, theirs) {
            MergeOutcome::Merged(text) => Some(text),
            MergeOutcome::Conflicted => None,
        }
    }

    /// Keep both versions: local at the path, remote under a derived
    /// conflict name, mirrored on both sides.
    fn rename_resolution(&mut self, path: &str, local_data: &[u8], remote_data: &[u8]) -> Result<()> {
        let alt = conflict_name(path, "remote");
        self.write_both(path, local_data)?;
        self.write_both(&alt, remote_data)
    }
}

/// Derive the alternate path for a renamed conflict loser,
/// e.g. `src/main.rs` -> `src/main.conflict-remote.rs`.
#[must_use]
pub fn conflict_name(path: &str, side: &str) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{dir}{stem}.conflict-{side}.{ext}"),
        _ => format!("{dir}{name}.conflict-{side}"),
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn track(path: &str, outcome: Result<()>, result: &mut SyncResult) {
    match outcome {
        Ok(()) => result.files_synced += 1,
        Err(e) => {
            warn!(path, error = %e, "file failed, continuing with siblings");
            result.files_failed.push((path.to_string(), e.to_string()));
        }
    }
}

fn read_optional(replica: &dyn Replica, path: &str) -> Result<Option<Vec<u8>>> {
    match replica.read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Retry transient local IO a bounded number of times.
fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < IO_RETRIES => {
                attempt += 1;
                debug!(error = %e, attempt, "transient IO failure, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
