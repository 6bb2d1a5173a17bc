//! Per-file transfer payloads and the strategy that chooses them
//!
//! A diff strategy turns "this file changed" into a concrete payload:
//! full content, a block reconstruction plan, or a line patch. The
//! receiver applies the payload against its own prior copy and always
//! falls back to full content if application fails verification.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::block::{BlockDiffer, Delta, Signature};
use crate::error::Result;
use crate::patch::{self, TextPatch};

/// Which diff engine a session uses for modified files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// Fixed-size block matching; best for large or binary files
    #[default]
    Block,
    /// Line-based patches; best for text trees with small edits
    Tree,
}

/// Payload for an update to a file both sides already have
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// Complete replacement content; the universal fallback
    Full { data: Bytes },
    /// Block reconstruction plan against the receiver's copy
    Blocks(Delta),
    /// Line patch against the receiver's copy
    Patch(TextPatch),
}

impl UpdatePayload {
    /// Materialize the new content from the receiver's prior bytes.
    ///
    /// # Errors
    /// `Blocks` surfaces `SyncError::Reconstruction` and `Patch`
    /// surfaces `SyncError::PatchConflict` when the receiver's copy is
    /// not what the payload was computed against; the caller retries
    /// with full content.
    pub fn apply(&self, old: &[u8], differ: &BlockDiffer) -> Result<Vec<u8>> {
        match self {
            Self::Full { data } => Ok(data.to_vec()),
            Self::Blocks(delta) => differ.apply(old, delta),
            Self::Patch(text_patch) => {
                let old_text = String::from_utf8_lossy(old);
                Ok(text_patch.apply(&old_text)?.into_bytes())
            }
        }
    }

    /// Approximate transfer size in bytes
    #[must_use]
    pub fn wire_size(&self) -> usize {
        match self {
            Self::Full { data } => data.len(),
            Self::Blocks(delta) => delta
                .ops
                .iter()
                .map(|op| match op {
                    crate::block::DeltaOp::Copy { .. } => 8,
                    crate::block::DeltaOp::Literal { data } => data.len(),
                })
                .sum(),
            Self::Patch(text_patch) => text_patch
                .hunks
                .iter()
                .flat_map(|h| &h.lines)
                .map(|l| match l {
                    crate::patch::PatchLine::Context(s)
                    | crate::patch::PatchLine::Remove(s)
                    | crate::patch::PatchLine::Insert(s) => s.len() + 1,
                })
                .sum(),
        }
    }
}

/// One planned operation against a receiving replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileOp {
    /// Path does not exist on the receiver; send full content
    Create { data: Bytes },
    /// Path exists on both sides; payload chosen by the strategy
    Update(UpdatePayload),
    /// Path was cleanly deleted on the sender
    Delete,
}

/// One path's planned change, ordered by path within a `DiffResult`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub op: FileOp,
}

/// Ordered list of per-path operations for one transfer direction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffResult {
    pub files: Vec<FileDiff>,
}

impl DiffResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn push(&mut self, path: String, op: FileOp) {
        self.files.push(FileDiff { path, op });
    }
}

/// Chooses an update payload for a modified file.
///
/// Strategies see the sender's new content and whatever the receiver
/// has (bytes, possibly a cached signature) and emit the cheapest
/// payload they can stand behind.
pub trait DiffStrategy {
    fn update_payload(
        &self,
        new_data: &[u8],
        receiver_data: &[u8],
        receiver_sig: Option<&Signature>,
    ) -> UpdatePayload;
}

/// Block-diff strategy: rsync-style reconstruction plans.
pub struct BlockStrategy {
    differ: BlockDiffer,
}

impl BlockStrategy {
    #[must_use]
    pub fn new(differ: BlockDiffer) -> Self {
        Self { differ }
    }
}

impl DiffStrategy for BlockStrategy {
    fn update_payload(
        &self,
        new_data: &[u8],
        receiver_data: &[u8],
        receiver_sig: Option<&Signature>,
    ) -> UpdatePayload {
        let computed;
        let sig = match receiver_sig {
            // A cached signature is only valid at the session's block size
            Some(s) if s.block_size == self.differ.block_size() => s,
            _ => {
                computed = self.differ.signature(receiver_data);
                &computed
            }
        };

        let delta = self.differ.delta(new_data, sig);
        UpdatePayload::Blocks(delta)
    }
}

/// Tree-diff strategy: line patches for text, full content otherwise.
pub struct TreeStrategy;

impl DiffStrategy for TreeStrategy {
    fn update_payload(
        &self,
        new_data: &[u8],
        receiver_data: &[u8],
        _receiver_sig: Option<&Signature>,
    ) -> UpdatePayload {
        if patch::is_binary(new_data) || patch::is_binary(receiver_data) {
            return UpdatePayload::Full {
                data: Bytes::copy_from_slice(new_data),
            };
        }
        match (std::str::from_utf8(receiver_data), std::str::from_utf8(new_data)) {
            (Ok(old_text), Ok(new_text)) => {
                UpdatePayload::Patch(TextPatch::compute(old_text, new_text))
            }
            _ => UpdatePayload::Full {
                data: Bytes::copy_from_slice(new_data),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_strategy_roundtrip() {
        let differ = BlockDiffer::with_block_size(32);
        let strategy = BlockStrategy::new(BlockDiffer::with_block_size(32));

        let old = b"block content ".repeat(50);
        let mut new = old.clone();
        new.extend_from_slice(b"appended");

        let payload = strategy.update_payload(&new, &old, None);
        assert!(matches!(payload, UpdatePayload::Blocks(_)));
        assert_eq!(payload.apply(&old, &differ).unwrap(), new);
    }

    #[test]
    fn test_block_strategy_rejects_stale_signature_block_size() {
        let differ = BlockDiffer::with_block_size(32);
        let strategy = BlockStrategy::new(BlockDiffer::with_block_size(32));

        let old = b"0123456789".repeat(40);
        let new = b"0123456789".repeat(41);

        // Signature computed at a different block size must be ignored
        let foreign_sig = BlockDiffer::with_block_size(64).signature(&old);
        let payload = strategy.update_payload(&new, &old, Some(&foreign_sig));
        assert_eq!(payload.apply(&old, &differ).unwrap(), new);
    }

    #[test]
    fn test_tree_strategy_text_patch() {
        let strategy = TreeStrategy;
        let differ = BlockDiffer::new();

        let old = b"one\ntwo\nthree\n";
        let new = b"one\nTWO\nthree\n";
        let payload = strategy.update_payload(new, old, None);
        assert!(matches!(payload, UpdatePayload::Patch(_)));
        assert_eq!(payload.apply(old, &differ).unwrap(), new.to_vec());
    }

    #[test]
    fn test_tree_strategy_binary_falls_back_to_full() {
        let strategy = TreeStrategy;
        let differ = BlockDiffer::new();

        let old = b"\x00\x01\x02binary";
        let new = b"\x00\x01\x03binary";
        let payload = strategy.update_payload(new, old, None);
        assert!(matches!(payload, UpdatePayload::Full { .. }));
        assert_eq!(payload.apply(old, &differ).unwrap(), new.to_vec());
    }

    #[test]
    fn test_diff_result_applies_in_order() {
        let differ = BlockDiffer::with_block_size(32);
        let strategy = BlockStrategy::new(BlockDiffer::with_block_size(32));

        let old = b"shared prefix ".repeat(20);
        let mut new = old.clone();
        new.extend_from_slice(b"new suffix");

        let mut result = DiffResult::default();
        result.push(
            "created.txt".to_string(),
            FileOp::Create {
                data: Bytes::from_static(b"fresh"),
            },
        );
        result.push(
            "updated.bin".to_string(),
            FileOp::Update(strategy.update_payload(&new, &old, None)),
        );
        result.push("removed.txt".to_string(), FileOp::Delete);
        assert!(!result.is_empty());

        // A receiver materializes each op against its prior state
        let mut tree: std::collections::BTreeMap<String, Vec<u8>> =
            [("updated.bin".to_string(), old.clone()),
             ("removed.txt".to_string(), b"doomed".to_vec())]
            .into_iter()
            .collect();

        for file in &result.files {
            match &file.op {
                FileOp::Create { data } => {
                    tree.insert(file.path.clone(), data.to_vec());
                }
                FileOp::Update(payload) => {
                    let prior = tree.get(&file.path).cloned().unwrap_or_default();
                    let rebuilt = payload.apply(&prior, &differ).unwrap();
                    tree.insert(file.path.clone(), rebuilt);
                }
                FileOp::Delete => {
                    tree.remove(&file.path);
                }
            }
        }

        assert_eq!(tree["created.txt"], b"fresh");
        assert_eq!(tree["updated.bin"], new);
        assert!(!tree.contains_key("removed.txt"));
    }

    #[test]
    fn test_patch_wire_size_smaller_than_full() {
        let strategy = TreeStrategy;
        let mut old = String::new();
        for i in 0..500 {
            old.push_str(&format!("line {i}\n"));
        }
        let new = old.replace("line 250\n", "line 250 edited\n");

        let payload = strategy.update_payload(new.as_bytes(), old.as_bytes(), None);
        assert!(payload.wire_size() < new.len() / 10);
    }
}
