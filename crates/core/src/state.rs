//! File-state model: per-path records and derived sync status
//!
//! The reconciliation baseline is `last_synced_hash`: the content hash
//! both replicas last agreed on. Status is always derived from the
//! (local, remote, baseline) hash triple, never set directly.

use serde::{Deserialize, Serialize};

use crate::block::Signature;
use crate::hash::ContentHash;
use crate::scan::FileEntry;

/// One cache entry per tracked path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Normalized repository-relative path; unique key within a state set
    pub path: String,
    pub size: u64,
    pub mtime_secs: i64,
    /// Strong hash of full content at last observation
    pub content_hash: ContentHash,
    /// Block signatures, present only in block-diff mode; lazily computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_signatures: Option<Signature>,
    /// Content hash at the last confirmed two-sided agreement point.
    /// Updated only after a write is confirmed on both sides.
    pub last_synced_hash: Option<ContentHash>,
    /// Timestamp of that agreement point, seconds since UNIX epoch
    pub last_synced_at: i64,
}

impl FileRecord {
    /// Build a record for a freshly observed file with no sync history
    #[must_use]
    pub fn from_entry(entry: &FileEntry) -> Self {
        Self {
            path: entry.path.clone(),
            size: entry.size,
            mtime_secs: entry.mtime_secs,
            content_hash: entry.hash,
            block_signatures: None,
            last_synced_hash: None,
            last_synced_at: 0,
        }
    }

    /// The reconciliation baseline for this path, if one exists
    #[must_use]
    pub fn baseline(&self) -> Option<&ContentHash> {
        self.last_synced_hash.as_ref()
    }
}

/// Derived per-path sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Both sides agree; terminal, no action
    Synced,
    /// Local diverged from baseline, remote unchanged: propagate local -> remote
    ModifiedLocal,
    /// Remote diverged from baseline, local unchanged: propagate remote -> local
    ModifiedRemote,
    /// Both diverged from the baseline and from each other: conflict
    ModifiedBoth,
    /// Local deleted a previously synced file, remote unchanged
    DeletedLocal,
    /// Remote deleted a previously synced file, local unchanged
    DeletedRemote,
    /// Path has no baseline and exists on one side only
    New,
}

/// Derive status from current hashes on both sides plus the baseline.
///
/// `None` means the file is absent on that side (or, for `baseline`,
/// that the path was never synced). Two rules matter most:
///
/// - equal local and remote hashes are always `Synced`, no matter what
///   size or mtime claim; metadata never overrides content;
/// - a deletion racing a modification is `ModifiedBoth`, never a
///   silent delete.
#[must_use]
pub fn derive_status(
    local: Option<&ContentHash>,
    remote: Option<&ContentHash>,
    baseline: Option<&ContentHash>,
) -> SyncStatus {
    match (local, remote, baseline) {
        // Agreement is terminal whether or not a baseline exists.
        (Some(l), Some(r), _) if l == r => SyncStatus::Synced,
        (None, None, _) => SyncStatus::Synced,

        // No baseline: the path was never synced.
        (Some(_), None, None) | (None, Some(_), None) => SyncStatus::New,
        // Both sides created the path independently with different content.
        (Some(_), Some(_), None) => SyncStatus::ModifiedBoth,

        (Some(l), Some(r), Some(b)) => {
            if r == b {
                SyncStatus::ModifiedLocal
            } else if l == b {
                SyncStatus::ModifiedRemote
            } else {
                SyncStatus::ModifiedBoth
            }
        }

        // One side deleted. Only a clean deletion propagates; if the
        // surviving side also changed, it is a conflict.
        (None, Some(r), Some(b)) => {
            if r == b {
                SyncStatus::DeletedLocal
            } else {
                SyncStatus::ModifiedBoth
            }
        }
        (Some(l), None, Some(b)) => {
            if l == b {
                SyncStatus::DeletedRemote
            } else {
                SyncStatus::ModifiedBoth
            }
        }
    }
}
