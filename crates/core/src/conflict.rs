//! Conflict detection and the bidirectional sync plan
//!
//! Detection is a pure function over two snapshots plus the cache:
//! every path is classified by `derive_status` and binned into a
//! `SyncPlan`. Resolution policy is applied later, at session time;
//! the plan itself just records what is in conflict.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::SyncCache;
use crate::hash::ContentHash;
use crate::snapshot::Snapshot;
use crate::state::{derive_status, SyncStatus};
use crate::tree::IgnoreRules;

/// How a session resolves detected conflicts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Park conflicts for explicit per-file resolution
    #[default]
    Manual,
    /// Local content wins everywhere
    PreferLocal,
    /// Remote content wins everywhere
    PreferRemote,
    /// Attempt a three-way text merge, fall back to `Rename`
    Merge,
    /// Keep both: local content at the path, remote under a conflict name
    Rename,
}

/// How one conflict was actually resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    UseLocal,
    UseRemote,
    Merged,
    Renamed,
}

/// One detected conflict, resolution filled in once decided.
///
/// Hashes are `None` for a side that deleted the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    pub local_hash: Option<ContentHash>,
    pub remote_hash: Option<ContentHash>,
    pub base_hash: Option<ContentHash>,
    pub resolution: Option<ResolutionOutcome>,
}

impl ConflictRecord {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Everything one reconciliation pass decided to do, path-ordered
/// within each bin.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Propagate local content to the remote
    pub push: Vec<String>,
    /// Propagate remote content to the local replica
    pub pull: Vec<String>,
    /// Local deleted; remove on the remote
    pub delete_remote: Vec<String>,
    /// Remote deleted; remove locally
    pub delete_local: Vec<String>,
    /// Gone from both sides; drop the stale cache record
    pub drop_records: Vec<String>,
    /// Hashes already agree but the baseline is stale; update cache only
    pub rebaseline: Vec<String>,
    /// Divergent paths needing policy or manual resolution
    pub conflicts: Vec<ConflictRecord>,
}

impl SyncPlan {
    /// True when the pass has nothing to transfer, delete, or resolve.
    /// Rebaselining and record cleanup are cache-only bookkeeping.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.push.is_empty()
            && self.pull.is_empty()
            && self.delete_remote.is_empty()
            && self.delete_local.is_empty()
            && self.conflicts.is_empty()
    }
}

/// Build the plan for one reconciliation pass.
///
/// Pure over its inputs: snapshots of both replicas, the cache, and
/// the session's ignore rules. Paths matching the rules never enter
/// the plan even if a stale cache record exists for them.
#[must_use]
pub fn build_plan(
    local: &Snapshot,
    remote: &Snapshot,
    cache: &SyncCache,
    rules: &IgnoreRules,
) -> SyncPlan {
    let mut paths: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
    paths.extend(local.files.keys());
    paths.extend(remote.files.keys());
    paths.extend(cache.entries.keys());

    let mut plan = SyncPlan::default();

    for path in paths {
        if rules.is_ignored(path) {
            continue;
        }

        let local_hash = local.hash_of(path);
        let remote_hash = remote.hash_of(path);
        let baseline = cache.baseline(path);
        let status = derive_status(local_hash, remote_hash, baseline);

        match status {
            SyncStatus::Synced => {
                match (local_hash, remote_hash) {
                    // Present and equal, but the baseline disagrees or
                    // is missing: record the agreement point.
                    (Some(l), Some(_)) if baseline != Some(l) => {
                        plan.rebaseline.push(path.clone());
                    }
                    // Gone on both sides but still in the cache.
                    (None, None) if cache.record(path).is_some() => {
                        plan.drop_records.push(path.clone());
                    }
                    _ => {}
                }
            }
            SyncStatus::ModifiedLocal => plan.push.push(path.clone()),
            SyncStatus::ModifiedRemote => plan.pull.push(path.clone()),
            SyncStatus::DeletedLocal => plan.delete_remote.push(path.clone()),
            SyncStatus::DeletedRemote => plan.delete_local.push(path.clone()),
            SyncStatus::New => match (local_hash, remote_hash) {
                (Some(_), None) => plan.push.push(path.clone()),
                (None, Some(_)) => plan.pull.push(path.clone()),
                _ => {}
            },
            SyncStatus::ModifiedBoth => {
                plan.conflicts.push(ConflictRecord {
                    path: path.clone(),
                    local_hash: local_hash.copied(),
                    remote_hash: remote_hash.copied(),
                    base_hash: baseline.copied(),
                    resolution: None,
                });
            }
        }
    }

    debug!(
        push = plan.push.len(),
        pull = plan.pull.len(),
        delete_remote = plan.delete_remote.len(),
        delete_local = plan.delete_local.len(),
        conflicts = plan.conflicts.len(),
        "reconciliation plan built"
    );
    plan
}
