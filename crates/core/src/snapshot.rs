//! Snapshot: a point-in-time view of one replica's file tree

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::scan::FileEntry;

/// A snapshot of a replica at a point in time, keyed by normalized path.
///
/// Uses a `BTreeMap` so iteration (and therefore diff output) is ordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub files: BTreeMap<String, FileEntry>,
}

impl Snapshot {
    /// Create a snapshot from scanned entries
    #[must_use]
    pub fn from_entries(entries: Vec<FileEntry>) -> Self {
        let files = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Self { files }
    }

    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Get a file by path
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Get just the content hash for a path
    #[must_use]
    pub fn hash_of(&self, path: &str) -> Option<&ContentHash> {
        self.files.get(path).map(|e| &e.hash)
    }

    /// Iterate entries in path order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }
}
