//! Line-based text diffing and patches
//!
//! Used by the tree-diff engine for modified text files and by the
//! three-way merge as its underlying diff. Patches are line-granular
//! with a few context lines, in the spirit of unified diffs.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Context lines kept around each change in a hunk
const CONTEXT_LINES: usize = 3;

/// DP table cap for the LCS; beyond this the diff degenerates to a
/// whole-file replacement rather than burning quadratic memory
const MAX_LCS_CELLS: usize = 4_000_000;

/// Binary sniff: NUL byte anywhere in the first 8KB
#[must_use]
pub fn is_binary(data: &[u8]) -> bool {
    data[..data.len().min(8192)].contains(&0)
}

/// Split text into lines, each keeping its trailing newline, so that
/// concatenating the pieces reproduces the input byte-for-byte.
#[must_use]
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// A contiguous edited region: `old_len` lines at `old_start` (0-based)
/// are replaced by `new_lines`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub old_start: usize,
    pub old_len: usize,
    pub new_lines: Vec<String>,
}

impl Change {
    #[must_use]
    pub fn old_end(&self) -> usize {
        self.old_start + self.old_len
    }
}

/// Compute the edited regions between two line arrays via LCS.
#[must_use]
pub fn changes(old: &[&str], new: &[&str]) -> Vec<Change> {
    if old.len().saturating_mul(new.len()) > MAX_LCS_CELLS {
        // Whole-file replacement; correctness over minimality
        if old == new {
            return Vec::new();
        }
        return vec![Change {
            old_start: 0,
            old_len: old.len(),
            new_lines: new.iter().map(|l| (*l).to_string()).collect(),
        }];
    }

    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let at = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[at(i, j)] = if old[i] == new[j] {
                table[at(i + 1, j + 1)] + 1
            } else {
                table[at(i + 1, j)].max(table[at(i, j + 1)])
            };
        }
    }

    // Walk the table forward, coalescing non-matching runs into changes
    let mut result = Vec::new();
    let mut pending: Option<Change> = None;
    let (mut i, mut j) = (0, 0);

    let flush = |pending: &mut Option<Change>, result: &mut Vec<Change>| {
        if let Some(change) = pending.take() {
            if change.old_len > 0 || !change.new_lines.is_empty() {
                result.push(change);
            }
        }
    };

    while i < n && j < m {
        if old[i] == new[j] {
            flush(&mut pending, &mut result);
            i += 1;
            j += 1;
        } else {
            let change = pending.get_or_insert_with(|| Change {
                old_start: i,
                old_len: 0,
                new_lines: Vec::new(),
            });
            if table[at(i + 1, j)] >= table[at(i, j + 1)] {
                change.old_len += 1;
                i += 1;
            } else {
                change.new_lines.push(new[j].to_string());
                j += 1;
            }
        }
    }
    if i < n || j < m {
        let change = pending.get_or_insert_with(|| Change {
            old_start: i,
            old_len: 0,
            new_lines: Vec::new(),
        });
        change.old_len += n - i;
        change
            .new_lines
            .extend(new[j..].iter().map(|l| (*l).to_string()));
    }
    flush(&mut pending, &mut result);

    result
}

/// One line of a hunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchLine {
    Context(String),
    Remove(String),
    Insert(String),
}

/// A group of nearby changes plus surrounding context.
/// `old_start` is the 0-based line index in the old file where the
/// hunk's first line sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub lines: Vec<PatchLine>,
}

/// A line-based patch between two text files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPatch {
    pub hunks: Vec<Hunk>,
}

impl TextPatch {
    /// Diff `old` against `new`
    #[must_use]
    pub fn compute(old: &str, new: &str) -> Self {
        let old_lines = split_lines(old);
        let new_lines = split_lines(new);
        let changes = changes(&old_lines, &new_lines);
        Self {
            hunks: build_hunks(&old_lines, &changes, CONTEXT_LINES),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Apply the patch to `old`, verifying context and removed lines.
    ///
    /// # Errors
    /// Returns `SyncError::PatchConflict` when the receiver's copy does
    /// not match the lines the patch expects (1-based line number).
    pub fn apply(&self, old: &str) -> Result<String> {
        let old_lines = split_lines(old);
        let mut out = String::with_capacity(old.len());
        let mut cursor = 0usize;

        for hunk in &self.hunks {
            if hunk.old_start < cursor || hunk.old_start > old_lines.len() {
                return Err(SyncError::PatchConflict {
                    line: hunk.old_start + 1,
                });
            }
            for line in &old_lines[cursor..hunk.old_start] {
                out.push_str(line);
            }
            cursor = hunk.old_start;

            for line in &hunk.lines {
                match line {
                    PatchLine::Context(expected) | PatchLine::Remove(expected) => {
                        match old_lines.get(cursor) {
                            Some(actual) if *actual == expected => {}
                            _ => {
                                return Err(SyncError::PatchConflict { line: cursor + 1 });
                            }
                        }
                        if matches!(line, PatchLine::Context(_)) {
                            out.push_str(expected);
                        }
                        cursor += 1;
                    }
                    PatchLine::Insert(text) => out.push_str(text),
                }
            }
        }

        for line in &old_lines[cursor..] {
            out.push_str(line);
        }
        Ok(out)
    }
}

fn build_hunks(old: &[&str], changes: &[Change], context: usize) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut idx = 0;

    while idx < changes.len() {
        // Group changes whose context regions touch or overlap
        let mut last = idx;
        while last + 1 < changes.len() {
            let next_start = changes[last + 1].old_start.saturating_sub(context);
            if next_start <= changes[last].old_end() + context {
                last += 1;
            } else {
                break;
            }
        }

        let hunk_start = changes[idx].old_start.saturating_sub(context);
        let mut lines = Vec::new();
        let mut cursor = hunk_start;

        for change in &changes[idx..=last] {
            for line in &old[cursor..change.old_start] {
                lines.push(PatchLine::Context((*line).to_string()));
            }
            for line in &old[change.old_start..change.old_end()] {
                lines.push(PatchLine::Remove((*line).to_string()));
            }
            for line in &change.new_lines {
                lines.push(PatchLine::Insert(line.clone()));
            }
            cursor = change.old_end();
        }

        let tail_end = (cursor + context).min(old.len());
        for line in &old[cursor..tail_end] {
            lines.push(PatchLine::Context((*line).to_string()));
        }

        hunks.push(Hunk {
            old_start: hunk_start,
            lines,
        });
        idx = last + 1;
    }

    hunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_binary() {
        assert!(is_binary(b"abc\0def"));
        assert!(!is_binary(b"plain text\nwith lines\n"));
        assert!(!is_binary(b""));
    }

    #[test]
    fn test_identical_text_empty_patch() {
        let text = "line one\nline two\nline three\n";
        let patch = TextPatch::compute(text, text);
        assert!(patch.is_empty());
        assert_eq!(patch.apply(text).unwrap(), text);
    }

    #[test]
    fn test_patch_roundtrip_edit() {
        let old = "alpha\nbeta\ngamma\ndelta\n";
        let new = "alpha\nBETA\ngamma\ndelta\n";
        let patch = TextPatch::compute(old, new);
        assert_eq!(patch.hunks.len(), 1);
        assert_eq!(patch.apply(old).unwrap(), new);
    }

    #[test]
    fn test_patch_roundtrip_insert_delete() {
        let old = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let new = "a\nb\nX\nc\ne\nf\ng\nh\nextra\n";
        let patch = TextPatch::compute(old, new);
        assert_eq!(patch.apply(old).unwrap(), new);
    }

    #[test]
    fn test_patch_no_trailing_newline() {
        let old = "one\ntwo";
        let new = "one\ntwo\nthree";
        let patch = TextPatch::compute(old, new);
        assert_eq!(patch.apply(old).unwrap(), new);
    }

    #[test]
    fn test_patch_from_empty() {
        let patch = TextPatch::compute("", "fresh\ncontent\n");
        assert_eq!(patch.apply("").unwrap(), "fresh\ncontent\n");
    }

    #[test]
    fn test_patch_to_empty() {
        let old = "doomed\nlines\n";
        let patch = TextPatch::compute(old, "");
        assert_eq!(patch.apply(old).unwrap(), "");
    }

    #[test]
    fn test_far_apart_edits_make_separate_hunks() {
        let mut old = String::new();
        for i in 0..40 {
            old.push_str(&format!("line {i}\n"));
        }
        let new = old
            .replace("line 2\n", "line 2 edited\n")
            .replace("line 30\n", "line 30 edited\n");

        let patch = TextPatch::compute(&old, &new);
        assert_eq!(patch.hunks.len(), 2);
        assert_eq!(patch.apply(&old).unwrap(), new);
    }

    #[test]
    fn test_apply_rejects_mismatched_base() {
        let old = "a\nb\nc\n";
        let new = "a\nB\nc\n";
        let patch = TextPatch::compute(old, new);

        let drifted = "a\nsomething else\nc\n";
        match patch.apply(drifted) {
            Err(SyncError::PatchConflict { .. }) => {}
            other => panic!("expected patch conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_changes_regions() {
        let old = ["a\n", "b\n", "c\n"];
        let new = ["a\n", "x\n", "c\n"];
        let regions = changes(&old, &new);
        assert_eq!(
            regions,
            vec![Change {
                old_start: 1,
                old_len: 1,
                new_lines: vec!["x\n".to_string()],
            }]
        );
    }

    #[test]
    fn test_patch_serde_roundtrip() {
        let patch = TextPatch::compute("a\nb\n", "a\nc\n");
        let json = serde_json::to_string(&patch).unwrap();
        let back: TextPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(patch, back);
    }
}
