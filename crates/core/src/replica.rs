//! Replica abstraction: anywhere a file tree lives
//!
//! Sessions talk to both sides through this trait, so the engine never
//! cares whether a replica is a local directory or something mounted.
//! Paths are always the normalized relative form from scanning.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::scan::Scanner;
use crate::snapshot::Snapshot;

/// One side of a sync pair.
pub trait Replica {
    /// Stable identifier, used in logs and the root-pair key
    fn id(&self) -> &str;

    /// Scan the tree into a snapshot
    ///
    /// # Errors
    /// Propagates traversal and hashing failures.
    fn snapshot(&self, extra_ignores: &[String]) -> Result<Snapshot>;

    /// Read a file's full content
    ///
    /// # Errors
    /// Fails if the file is missing or unreadable.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write full content, creating parent directories as needed
    ///
    /// # Errors
    /// Propagates filesystem failures.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Remove a file; removing an already-absent path succeeds
    ///
    /// # Errors
    /// Propagates filesystem failures other than absence.
    fn remove(&self, path: &str) -> Result<()>;
}

/// A replica backed by a local directory.
pub struct LocalReplica {
    root: PathBuf,
    id: String,
}

impl LocalReplica {
    /// Open (creating if needed) a local directory as a replica.
    ///
    /// # Errors
    /// Fails if the directory cannot be created or canonicalized.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        let id = root.to_string_lossy().into_owned();
        Ok(Self { root, id })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Replica for LocalReplica {
    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot(&self, extra_ignores: &[String]) -> Result<Snapshot> {
        let entries = Scanner::new(&self.root).ignore_all(extra_ignores).scan()?;
        Ok(Snapshot::from_entries(entries))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.absolute(path))?)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.absolute(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never observe a partial file
        let tmp = target.with_extension("mirsync-tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        match std::fs::remove_file(self.absolute(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip_nested() {
        let dir = tempfile::tempdir().unwrap();
        let replica = LocalReplica::open(dir.path()).unwrap();

        replica.write("deep/nested/file.txt", b"content").unwrap();
        assert_eq!(replica.read("deep/nested/file.txt").unwrap(), b"content");

        let snap = replica.snapshot(&[]).unwrap();
        assert!(snap.get("deep/nested/file.txt").is_some());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let replica = LocalReplica::open(dir.path()).unwrap();
        replica.remove("never/existed.txt").unwrap();
    }

    #[test]
    fn test_snapshot_honors_extra_ignores() {
        let dir = tempfile::tempdir().unwrap();
        let replica = LocalReplica::open(dir.path()).unwrap();
        replica.write("keep.rs", b"fn main() {}").unwrap();
        replica.write("noise.log", b"...").unwrap();

        let snap = replica.snapshot(&["*.log".to_string()]).unwrap();
        assert!(snap.get("keep.rs").is_some());
        assert!(snap.get("noise.log").is_none());
    }

    #[test]
    fn test_open_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let replica = LocalReplica::open(dir.path().join("fresh")).unwrap();
        assert!(replica.root().exists());
        assert!(replica.snapshot(&[]).unwrap().is_empty());
    }
}
