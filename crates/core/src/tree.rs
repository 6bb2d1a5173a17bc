//! Tree-level comparison between two snapshots
//!
//! Classifies every path across a source snapshot, a target snapshot,
//! and the cached baseline. Deletions are only reported for paths with
//! a sync history; a path absent everywhere it was never synced to is
//! simply not the target's business.

use std::collections::BTreeMap;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::cache::SyncCache;
use crate::error::Result;
use crate::snapshot::Snapshot;

/// Compiled ignore patterns applied to relative paths during planning.
///
/// Scanning already honors `.gitignore` files inside each root; these
/// rules are the session-level additions from config or the caller.
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Rules that ignore nothing
    #[must_use]
    pub fn empty() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    /// Compile gitignore-style patterns.
    ///
    /// # Errors
    /// Returns an error for a malformed pattern.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            builder.add_line(None, pattern)?;
        }
        Ok(Self {
            matcher: builder.build()?,
        })
    }

    #[must_use]
    pub fn is_ignored(&self, path: &str) -> bool {
        // Parent-aware so directory patterns like "build/" cover
        // everything beneath them
        self.matcher
            .matched_path_or_any_parents(path, false)
            .is_ignore()
    }
}

/// How one path differs between a source and a target snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeChange {
    /// Present in source, absent in target
    New,
    /// Absent in source, present in target, and previously synced
    Deleted,
    /// Present on both sides with differing content
    Modified,
    Unchanged,
}

/// Classify every path in either snapshot, ordered by path.
///
/// Paths matching `rules` are skipped entirely. A path present only in
/// `target` with no baseline is not reported; nothing ever synced it,
/// so the source has no claim on it.
#[must_use]
pub fn classify(
    source: &Snapshot,
    target: &Snapshot,
    cache: &SyncCache,
    rules: &IgnoreRules,
) -> BTreeMap<String, TreeChange> {
    let mut result = BTreeMap::new();

    for (path, entry) in source.iter() {
        if rules.is_ignored(path) {
            continue;
        }
        let change = match target.hash_of(path) {
            Some(h) if *h == entry.hash => TreeChange::Unchanged,
            Some(_) => TreeChange::Modified,
            None => TreeChange::New,
        };
        result.insert(path.clone(), change);
    }

    for path in target.iter().map(|(p, _)| p) {
        if result.contains_key(path) || rules.is_ignored(path) {
            continue;
        }
        if cache.baseline(path).is_some() {
            result.insert(path.clone(), TreeChange::Deleted);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use crate::scan::FileEntry;
    use crate::state::FileRecord;

    fn entry(path: &str, content: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size: content.len() as u64,
            mtime_secs: 0,
            hash: ContentHash::from_bytes(content),
        }
    }

    fn snap(entries: Vec<FileEntry>) -> Snapshot {
        Snapshot::from_entries(entries)
    }

    fn synced_cache(path: &str, content: &[u8]) -> SyncCache {
        let mut cache = SyncCache::new();
        let mut record = FileRecord::from_entry(&entry(path, content));
        record.last_synced_hash = Some(ContentHash::from_bytes(content));
        record.last_synced_at = 1;
        cache.upsert(record);
        cache
    }

    #[test]
    fn test_classify_new_modified_unchanged() {
        let source = snap(vec![
            entry("a.txt", b"same"),
            entry("b.txt", b"edited"),
            entry("c.txt", b"created"),
        ]);
        let target = snap(vec![entry("a.txt", b"same"), entry("b.txt", b"original")]);

        let changes = classify(&source, &target, &SyncCache::new(), &IgnoreRules::empty());
        assert_eq!(changes["a.txt"], TreeChange::Unchanged);
        assert_eq!(changes["b.txt"], TreeChange::Modified);
        assert_eq!(changes["c.txt"], TreeChange::New);
    }

    #[test]
    fn test_deleted_only_with_sync_history() {
        let source = snap(vec![]);
        let target = snap(vec![entry("tracked.txt", b"x"), entry("untracked.txt", b"y")]);
        let cache = synced_cache("tracked.txt", b"x");

        let changes = classify(&source, &target, &cache, &IgnoreRules::empty());
        assert_eq!(changes.get("tracked.txt"), Some(&TreeChange::Deleted));
        // never synced -> not the source's to delete
        assert_eq!(changes.get("untracked.txt"), None);
    }

    #[test]
    fn test_ignore_rules_skip_paths() {
        let source = snap(vec![entry("keep.rs", b"a"), entry("build/out.o", b"b")]);
        let target = snap(vec![]);
        let rules = IgnoreRules::compile(&["build/".to_string()]).unwrap();

        let changes = classify(&source, &target, &SyncCache::new(), &rules);
        assert!(changes.contains_key("keep.rs"));
        assert!(!changes.contains_key("build/out.o"));
    }

    #[test]
    fn test_ignore_glob_patterns() {
        let rules = IgnoreRules::compile(&["*.log".to_string(), "tmp/".to_string()]).unwrap();
        assert!(rules.is_ignored("debug.log"));
        assert!(rules.is_ignored("nested/deep/trace.log"));
        assert!(!rules.is_ignored("src/main.rs"));
    }
}
