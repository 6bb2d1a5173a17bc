//! Error taxonomy for the sync engine

use std::path::PathBuf;

use thiserror::Error;

use crate::hash::ContentHash;
use crate::session::SessionState;

/// Convenience alias used throughout the engine
pub type Result<T> = std::result::Result<T, SyncError>;

/// All failure modes surfaced by the engine.
///
/// `CacheCorrupt` is recoverable by discarding the cache and
/// reinitializing; `Reconstruction` and `PatchConflict` are
/// non-retryable for that file in that mode and callers fall back to
/// full-content transfer; `ConflictUnresolved` is fatal to the session
/// but not the process.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Persisted cache could not be parsed. Never silently ignored;
    /// the caller decides whether to discard and reinitialize.
    #[error("cache file {path} is corrupt: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },

    /// Applying a block reconstruction plan produced the wrong bytes.
    #[error("reconstruction produced hash {actual}, expected {expected}")]
    Reconstruction {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// A text patch did not apply cleanly against the receiver's copy.
    #[error("patch does not apply cleanly at line {line}")]
    PatchConflict { line: usize },

    /// The session reached `Applying` with conflicts lacking a resolution.
    #[error("{count} conflict(s) lack a resolution")]
    ConflictUnresolved { count: usize },

    /// Another session already holds the lock for this root pair.
    #[error("a sync session is already active for this root pair")]
    SessionActive,

    /// The requested operation is not valid in the session's current state.
    #[error("operation not valid in session state {state:?}")]
    InvalidState { state: SessionState },

    #[error("ignore pattern error: {0}")]
    Ignore(#[from] ignore::Error),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a bounded retry may help (transient local IO only).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
