//! mirsync-core: Incremental two-replica sync engine
//!
//! Provides file scanning, hashing, block deltas, tree patches,
//! conflict detection/resolution, and the sync session state machine.

pub mod block;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod hash;
pub mod merge;
pub mod patch;
pub mod replica;
pub mod scan;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod tree;

pub use block::{BlockDiffer, Delta, Signature, BLOCK_SIZE};
pub use cache::{BaseStore, CacheStore, RootPairKey, SyncCache};
pub use config::SyncOptions;
pub use conflict::{ConflictRecord, ResolutionOutcome, ResolutionPolicy, SyncPlan};
pub use diff::{DiffMode, DiffResult, FileOp, UpdatePayload};
pub use error::{Result, SyncError};
pub use hash::ContentHash;
pub use patch::TextPatch;
pub use replica::{LocalReplica, Replica};
pub use scan::{FileEntry, Scanner};
pub use session::{SessionState, StatusEntry, SyncResult, SyncSession};
pub use snapshot::Snapshot;
pub use state::{derive_status, FileRecord, SyncStatus};
pub use tree::{IgnoreRules, TreeChange};
