//! Block-diff engine: rsync-style fixed-size block matching
//!
//! The receiver supplies block signatures for its current copy; the
//! sender emits a reconstruction plan of reused block indices and
//! literal bytes. The receiver never sends content.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hash::{ContentHash, RollingChecksum};

/// Default block size for delta computation (4KB)
pub const BLOCK_SIZE: usize = 4096;

/// Signature for a single block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Rolling checksum for candidate matching
    pub weak: u32,
    /// Strong hash (BLAKE3) to confirm a candidate; a weak hit with a
    /// differing strong hash is treated as changed, never reused
    pub strong: ContentHash,
    /// Block index in the receiver's file
    pub index: usize,
}

/// Per-file block signature list, computed on the receiving side.
///
/// The final block may be shorter than `block_size`; an empty file has
/// an empty block list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub blocks: Vec<BlockSignature>,
    pub file_size: u64,
    pub block_size: usize,
}

/// An operation in a reconstruction plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Reuse block `index` from the receiver's existing copy
    Copy { index: usize },
    /// Insert literal bytes
    Literal { data: Bytes },
}

/// A transferable delta between the sender's content and the
/// receiver's signed copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Ordered reconstruction plan
    pub ops: Vec<DeltaOp>,
    /// Whole-file hash of the sender's content, verified after apply
    pub new_hash: ContentHash,
    pub new_size: u64,
}

/// Computes and applies block deltas at a fixed block size
pub struct BlockDiffer {
    block_size: usize,
}

impl Default for BlockDiffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDiffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_size: BLOCK_SIZE,
        }
    }

    /// Create with a custom block size (clamped to at least 1)
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Compute block signatures for receiver-side content
    #[must_use]
    pub fn signature(&self, data: &[u8]) -> Signature {
        let mut blocks = Vec::with_capacity(data.len() / self.block_size + 1);

        for (i, chunk) in data.chunks(self.block_size).enumerate() {
            blocks.push(BlockSignature {
                weak: RollingChecksum::new(chunk).value(),
                strong: ContentHash::from_bytes(chunk),
                index: i,
            });
        }

        Signature {
            blocks,
            file_size: data.len() as u64,
            block_size: self.block_size,
        }
    }

    /// Compute a delta from the sender's content against the receiver's
    /// signature.
    ///
    /// Slides a rolling window over the sender's bytes; every weak-hash
    /// hit is confirmed with the strong hash before a block is reused,
    /// so a checksum collision costs bandwidth but never correctness.
    #[must_use]
    pub fn delta(&self, new_data: &[u8], old_sig: &Signature) -> Delta {
        // weak -> [(strong, index)]; collisions keep all candidates
        let mut lookup: HashMap<u32, Vec<(ContentHash, usize)>> = HashMap::new();
        for block in &old_sig.blocks {
            lookup
                .entry(block.weak)
                .or_default()
                .push((block.strong, block.index));
        }

        let mut ops = Vec::new();
        let mut pos = 0;
        let mut literal_start = 0;
        let mut rolling: Option<RollingChecksum> = None;

        while pos + self.block_size <= new_data.len() {
            let weak = match &rolling {
                Some(r) => r.value(),
                None => {
                    let r = RollingChecksum::new(&new_data[pos..pos + self.block_size]);
                    let value = r.value();
                    rolling = Some(r);
                    value
                }
            };

            let matched = lookup.get(&weak).and_then(|candidates| {
                let strong = ContentHash::from_bytes(&new_data[pos..pos + self.block_size]);
                candidates
                    .iter()
                    .find(|(candidate, _)| *candidate == strong)
                    .map(|(_, index)| *index)
            });

            if let Some(index) = matched {
                if literal_start < pos {
                    ops.push(DeltaOp::Literal {
                        data: Bytes::copy_from_slice(&new_data[literal_start..pos]),
                    });
                }
                ops.push(DeltaOp::Copy { index });
                pos += self.block_size;
                literal_start = pos;
                rolling = None;
            } else {
                if let (Some(r), Some(&inb)) = (&mut rolling, new_data.get(pos + self.block_size))
                {
                    r.roll(new_data[pos], inb);
                }
                pos += 1;
            }
        }

        // Tail shorter than a full block: reuse it if it matches the
        // receiver's (short) final block exactly, otherwise send literal.
        if literal_start < new_data.len() {
            let tail = &new_data[literal_start..];
            let tail_match = lookup.get(&RollingChecksum::new(tail).value()).and_then(
                |candidates| {
                    let strong = ContentHash::from_bytes(tail);
                    candidates
                        .iter()
                        .find(|(candidate, _)| *candidate == strong)
                        .map(|(_, index)| *index)
                },
            );

            match tail_match {
                Some(index) => ops.push(DeltaOp::Copy { index }),
                None => ops.push(DeltaOp::Literal {
                    data: Bytes::copy_from_slice(tail),
                }),
            }
        }

        Delta {
            ops,
            new_hash: ContentHash::from_bytes(new_data),
            new_size: new_data.len() as u64,
        }
    }

    /// Apply a reconstruction plan to the receiver's prior content.
    ///
    /// # Errors
    /// Returns `SyncError::Reconstruction` if the rebuilt file's hash
    /// does not match the sender's; the caller must fall back to
    /// full-content transfer for this file.
    pub fn apply(&self, old_data: &[u8], delta: &Delta) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(delta.new_size as usize);

        for op in &delta.ops {
            match op {
                DeltaOp::Copy { index } => {
                    let start = index * self.block_size;
                    let end = (start + self.block_size).min(old_data.len());
                    result.extend_from_slice(old_data.get(start..end).unwrap_or(&[]));
                }
                DeltaOp::Literal { data } => {
                    result.extend_from_slice(data);
                }
            }
        }

        let actual = ContentHash::from_bytes(&result);
        if actual != delta.new_hash {
            return Err(SyncError::Reconstruction {
                expected: delta.new_hash,
                actual,
            });
        }

        Ok(result)
    }

    /// Serialize and zstd-compress a delta for the wire
    ///
    /// # Errors
    /// Returns an error if serialization or compression fails
    pub fn compress_delta(delta: &Delta) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(delta)?;
        Ok(zstd::encode_all(json.as_slice(), 3)?)
    }

    /// Decompress and deserialize a delta
    ///
    /// # Errors
    /// Returns an error if decompression or deserialization fails
    pub fn decompress_delta(data: &[u8]) -> Result<Delta> {
        let decompressed = zstd::decode_all(data)?;
        Ok(serde_json::from_slice(&decompressed)?)
    }

    /// Serialize and zstd-compress a signature for the wire
    ///
    /// # Errors
    /// Returns an error if serialization or compression fails
    pub fn compress_signature(sig: &Signature) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(sig)?;
        Ok(zstd::encode_all(json.as_slice(), 3)?)
    }

    /// Decompress and deserialize a signature
    ///
    /// # Errors
    /// Returns an error if decompression or deserialization fails
    pub fn decompress_signature(data: &[u8]) -> Result<Signature> {
        let decompressed = zstd::decode_all(data)?;
        Ok(serde_json::from_slice(&decompressed)?)
    }
}

/// Fraction of the original size a delta actually transfers
#[must_use]
pub fn compression_ratio(original_size: u64, delta: &Delta) -> f64 {
    let delta_size: u64 = delta
        .ops
        .iter()
        .map(|op| match op {
            DeltaOp::Copy { .. } => 8, // just the index
            DeltaOp::Literal { data } => data.len() as u64,
        })
        .sum();

    if original_size == 0 {
        return 1.0;
    }

    delta_size as f64 / original_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_files() {
        let differ = BlockDiffer::new();
        let data = b"Hello, World! This is some test data that spans multiple blocks."
            .repeat(100);

        let sig = differ.signature(&data);
        let delta = differ.delta(&data, &sig);

        let copy_count = delta
            .ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Copy { .. }))
            .count();
        assert!(copy_count > 0);
        assert!(!delta
            .ops
            .iter()
            .any(|op| matches!(op, DeltaOp::Literal { .. })));

        let reconstructed = differ.apply(&data, &delta).unwrap();
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn test_single_byte_change() {
        let differ = BlockDiffer::new();
        let old_data = b"AAAA".repeat(4000);
        let mut new_data = old_data.clone();
        new_data[6000] = b'B';

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);

        let reconstructed = differ.apply(&old_data, &delta).unwrap();
        assert_eq!(reconstructed, new_data);
    }

    #[test]
    fn test_insertion_shifts_alignment() {
        // An insertion misaligns every later block; the rolling window
        // must still find them at their shifted offsets.
        let differ = BlockDiffer::with_block_size(64);
        let mut old_data = Vec::new();
        for i in 0..200 {
            old_data.extend_from_slice(format!("line number {i} with some text\n").as_bytes());
        }
        let mut new_data = b"inserted header\n".to_vec();
        new_data.extend_from_slice(&old_data);

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);

        let copied: usize = delta
            .ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Copy { .. }))
            .count();
        assert!(copied > 0, "expected block reuse after insertion");

        let reconstructed = differ.apply(&old_data, &delta).unwrap();
        assert_eq!(reconstructed, new_data);
    }

    #[test]
    fn test_deletion_and_append() {
        let differ = BlockDiffer::with_block_size(32);
        let old_data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        // Delete a middle range, then append
        let mut new_data = Vec::new();
        new_data.extend_from_slice(&old_data[..700]);
        new_data.extend_from_slice(&old_data[900..]);
        new_data.extend_from_slice(b"appended tail bytes");

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);
        let reconstructed = differ.apply(&old_data, &delta).unwrap();
        assert_eq!(reconstructed, new_data);
    }

    #[test]
    fn test_file_shrinks() {
        let differ = BlockDiffer::with_block_size(16);
        let old_data = b"0123456789abcdef".repeat(10);
        let new_data = old_data[..48].to_vec();

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);
        let reconstructed = differ.apply(&old_data, &delta).unwrap();
        assert_eq!(reconstructed, new_data);
    }

    #[test]
    fn test_empty_file() {
        let differ = BlockDiffer::new();
        let sig = differ.signature(b"");
        assert!(sig.blocks.is_empty());
        assert_eq!(sig.file_size, 0);

        let delta = differ.delta(b"", &sig);
        assert!(delta.ops.is_empty());
        let reconstructed = differ.apply(b"", &delta).unwrap();
        assert!(reconstructed.is_empty());
    }

    #[test]
    fn test_short_final_block_reused() {
        let differ = BlockDiffer::with_block_size(64);
        // 3 full blocks plus a 10-byte tail
        let old_data: Vec<u8> = (0..202u32).map(|i| (i % 201) as u8).collect();
        // Change the first block only; tail stays identical
        let mut new_data = old_data.clone();
        new_data[3] ^= 0xff;

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);

        // The unchanged short tail must come through as a Copy
        assert!(matches!(delta.ops.last(), Some(DeltaOp::Copy { .. })));
        let reconstructed = differ.apply(&old_data, &delta).unwrap();
        assert_eq!(reconstructed, new_data);
    }

    #[test]
    fn test_completely_different() {
        let differ = BlockDiffer::new();
        let old_data = b"AAAA".repeat(100);
        let new_data = b"BBBB".repeat(100);

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);

        assert!(delta
            .ops
            .iter()
            .all(|op| matches!(op, DeltaOp::Literal { .. })));

        let reconstructed = differ.apply(&old_data, &delta).unwrap();
        assert_eq!(reconstructed, new_data);
    }

    #[test]
    fn test_apply_detects_corruption() {
        let differ = BlockDiffer::with_block_size(8);
        let old_data = b"one block".repeat(8);

        // Delta full of Copy ops against the matching base
        let sig = differ.signature(&old_data);
        let delta = differ.delta(&old_data, &sig);
        assert!(delta.ops.iter().any(|op| matches!(op, DeltaOp::Copy { .. })));

        // Applying against the wrong prior content must not silently succeed
        let wrong_base = b"entirely different base data".repeat(4);
        match differ.apply(&wrong_base, &delta) {
            Err(SyncError::Reconstruction { .. }) => {}
            other => panic!("expected reconstruction error, got {other:?}"),
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let differ = BlockDiffer::new();
        let data = b"Hello, World!".repeat(1000);
        let sig = differ.signature(&data);
        let delta = differ.delta(&data, &sig);

        let compressed = BlockDiffer::compress_delta(&delta).unwrap();
        let decompressed = BlockDiffer::decompress_delta(&compressed).unwrap();
        assert_eq!(delta.new_hash, decompressed.new_hash);
        assert_eq!(delta.ops.len(), decompressed.ops.len());

        let sig_compressed = BlockDiffer::compress_signature(&sig).unwrap();
        let sig_back = BlockDiffer::decompress_signature(&sig_compressed).unwrap();
        assert_eq!(sig.blocks.len(), sig_back.blocks.len());
        assert_eq!(sig.block_size, sig_back.block_size);
    }

    #[test]
    fn test_compression_ratio_small_edit() {
        let differ = BlockDiffer::new();
        let old_data = b"x".repeat(100 * BLOCK_SIZE);
        let mut new_data = old_data.clone();
        new_data[50 * BLOCK_SIZE] = b'y';

        let sig = differ.signature(&old_data);
        let delta = differ.delta(&new_data, &sig);
        let ratio = compression_ratio(new_data.len() as u64, &delta);
        assert!(ratio < 0.1, "one-byte edit should transfer little: {ratio}");
    }
}
