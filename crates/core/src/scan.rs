//! Replica scanning with gitignore support via the `ignore` crate

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::ContentHash;

/// Directory holding the engine's own state; never scanned or synced.
pub const STATE_DIR: &str = ".mirsync";

/// Metadata for a single tracked file.
///
/// `path` is root-relative with forward-slash separators on every
/// platform, and is the unique key within a replica's state set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time, seconds since UNIX epoch
    pub mtime_secs: i64,
    /// Content hash (BLAKE3), always recomputed from content.
    /// Size and mtime are never trusted for change detection.
    pub hash: ContentHash,
}

/// Turn a root-relative path into the normalized string key.
#[must_use]
pub fn normalize_path(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// Scanner for directory trees with gitignore support
pub struct Scanner {
    root: PathBuf,
    /// Extra ignore patterns beyond .gitignore, in gitignore syntax
    extra_ignores: Vec<String>,
}

impl Scanner {
    /// Create a new scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extra_ignores: Vec::new(),
        }
    }

    /// Add an extra ignore pattern
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.extra_ignores.push(pattern.into());
        self
    }

    /// Add several extra ignore patterns
    #[must_use]
    pub fn ignore_all(mut self, patterns: &[String]) -> Self {
        self.extra_ignores.extend(patterns.iter().cloned());
        self
    }

    fn walk_builder(&self) -> Result<WalkBuilder> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false) // Include hidden files (e.g., .env.example)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false) // Work even without .git directory
            .filter_entry(|e| e.file_name() != ".git" && e.file_name() != STATE_DIR);

        if !self.extra_ignores.is_empty() {
            // Overrides with a leading "!" act as ignore patterns.
            let mut overrides = OverrideBuilder::new(&self.root);
            for pattern in &self.extra_ignores {
                overrides.add(&format!("!{pattern}"))?;
            }
            builder.overrides(overrides.build()?);
        }

        Ok(builder)
    }

    /// Scan the directory and return all file entries, hashing each file.
    ///
    /// # Errors
    /// Returns an error if directory traversal or file reading fails
    pub fn scan(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        for result in self.walk_builder()?.build() {
            let entry = result?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            let metadata = std::fs::metadata(path)?;
            let relative = path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_path_buf();

            let mtime_secs = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            entries.push(FileEntry {
                path: normalize_path(&relative),
                size: metadata.len(),
                mtime_secs,
                hash: ContentHash::from_file(path)?,
            });
        }

        // Sort for deterministic ordering
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_simple_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file1.txt"), "hello").unwrap();
        fs::write(dir.path().join("file2.txt"), "world").unwrap();

        let scanner = Scanner::new(dir.path());
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.path == "file1.txt"));
        assert!(entries.iter().any(|e| e.path == "file2.txt"));
    }

    #[test]
    fn test_scan_respects_gitignore() {
        let dir = TempDir::new().unwrap();
        // Need .git directory for the ignore crate to recognize a repo
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("ignore.log"), "ignore").unwrap();

        let scanner = Scanner::new(dir.path());
        let entries = scanner.scan().unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert!(paths.contains(&"keep.txt".to_string()), "paths: {paths:?}");
        assert!(
            !paths.contains(&"ignore.log".to_string()),
            "paths: {paths:?}"
        );
    }

    #[test]
    fn test_scan_extra_ignore_pattern() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("skip.tmp"), "skip").unwrap();

        let scanner = Scanner::new(dir.path()).ignore("*.tmp");
        let entries = scanner.scan().unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert!(paths.contains(&"keep.txt".to_string()));
        assert!(!paths.contains(&"skip.tmp".to_string()), "paths: {paths:?}");
    }

    #[test]
    fn test_scan_skips_state_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(STATE_DIR)).unwrap();
        fs::write(dir.path().join(STATE_DIR).join("cache.json"), "{}").unwrap();
        fs::write(dir.path().join("tracked.txt"), "data").unwrap();

        let scanner = Scanner::new(dir.path());
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "tracked.txt");
    }

    #[test]
    fn test_scan_nested_directories_normalized() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let scanner = Scanner::new(dir.path());
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 3);
        // Forward slashes regardless of platform
        assert!(entries.iter().any(|e| e.path == "sub/dir/deep.txt"));
    }
}
