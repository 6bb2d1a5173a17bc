//! Session options, loadable from `.mirsync.toml` at the local root

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::block::BLOCK_SIZE;
use crate::diff::DiffMode;
use crate::error::Result;

/// Config file name looked up at the local root
pub const CONFIG_FILE: &str = ".mirsync.toml";

/// Tunable options for a sync session.
///
/// All fields default sensibly, so an absent or empty config file is
/// a valid one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Diff engine for modified files
    pub mode: DiffMode,
    /// Block size for block-diff mode
    pub block_size: usize,
    /// Extra gitignore-style patterns applied on top of .gitignore
    pub ignore: Vec<String>,
    /// Override for where cache state lives; defaults to
    /// `<local root>/.mirsync`
    pub cache_dir: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: DiffMode::Block,
            block_size: BLOCK_SIZE,
            ignore: Vec::new(),
            cache_dir: None,
        }
    }
}

impl SyncOptions {
    /// Load options from `.mirsync.toml` under `root`, or defaults if
    /// the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }
}
