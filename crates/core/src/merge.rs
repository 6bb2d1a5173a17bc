//! Three-way line merge for text conflicts
//!
//! Diffs each side against the shared ancestor and walks the two
//! change lists over the base. Non-overlapping changes combine;
//! identical changes apply once; any overlap at all is reported as a
//! conflict rather than guessed at.

use crate::patch::{changes, split_lines, Change};

/// Result of attempting an automatic merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Both sides' edits combined cleanly
    Merged(String),
    /// Edits overlap; manual or policy resolution required
    Conflicted,
}

/// Merge `ours` and `theirs` against their common ancestor `base`.
#[must_use]
pub fn merge3(base: &str, ours: &str, theirs: &str) -> MergeOutcome {
    if ours == theirs {
        return MergeOutcome::Merged(ours.to_string());
    }
    if ours == base {
        return MergeOutcome::Merged(theirs.to_string());
    }
    if theirs == base {
        return MergeOutcome::Merged(ours.to_string());
    }

    let base_lines = split_lines(base);
    let our_changes = changes(&base_lines, &split_lines(ours));
    let their_changes = changes(&base_lines, &split_lines(theirs));

    let mut out = String::with_capacity(base.len().max(ours.len()).max(theirs.len()));
    let mut cursor = 0usize;
    let (mut oi, mut ti) = (0usize, 0usize);

    loop {
        let our = our_changes.get(oi);
        let their = their_changes.get(ti);

        let next = match (our, their) {
            (None, None) => break,
            (Some(o), None) => Side::Ours(o),
            (None, Some(t)) => Side::Theirs(t),
            (Some(o), Some(t)) => {
                if o == t {
                    // Same edit on both sides, apply once
                    oi += 1;
                    ti += 1;
                    Side::Ours(o)
                } else if overlap(o, t) {
                    return MergeOutcome::Conflicted;
                } else if region_before(o, t) {
                    Side::Ours(o)
                } else {
                    Side::Theirs(t)
                }
            }
        };

        let change = match next {
            Side::Ours(c) => {
                oi += 1;
                c
            }
            Side::Theirs(c) => {
                ti += 1;
                c
            }
        };

        for line in &base_lines[cursor..change.old_start] {
            out.push_str(line);
        }
        for line in &change.new_lines {
            out.push_str(line);
        }
        cursor = change.old_end();
    }

    for line in &base_lines[cursor..] {
        out.push_str(line);
    }

    MergeOutcome::Merged(out)
}

enum Side<'a> {
    Ours(&'a Change),
    Theirs(&'a Change),
}

/// Strict overlap test. Two pure insertions at the same point also
/// count: there is no principled ordering between them.
fn overlap(a: &Change, b: &Change) -> bool {
    if a.old_start == b.old_start {
        return true;
    }
    a.old_start < b.old_end() && b.old_start < a.old_end()
}

fn region_before(a: &Change, b: &Change) -> bool {
    a.old_end() <= b.old_start
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "one\ntwo\nthree\nfour\nfive\nsix\nseven\neight\n";

    #[test]
    fn test_disjoint_edits_merge() {
        let ours = BASE.replace("two\n", "TWO\n");
        let theirs = BASE.replace("seven\n", "SEVEN\n");
        let expected = BASE.replace("two\n", "TWO\n").replace("seven\n", "SEVEN\n");
        assert_eq!(merge3(BASE, &ours, &theirs), MergeOutcome::Merged(expected));
    }

    #[test]
    fn test_one_side_unchanged_takes_other() {
        let theirs = BASE.replace("four\n", "FOUR\n");
        assert_eq!(
            merge3(BASE, BASE, &theirs),
            MergeOutcome::Merged(theirs.clone())
        );
        assert_eq!(merge3(BASE, &theirs, BASE), MergeOutcome::Merged(theirs));
    }

    #[test]
    fn test_identical_edits_apply_once() {
        let both = BASE.replace("three\n", "shared edit\n");
        assert_eq!(
            merge3(BASE, &both, &both),
            MergeOutcome::Merged(both.clone())
        );
    }

    #[test]
    fn test_overlapping_edits_conflict() {
        let ours = BASE.replace("three\n", "ours\n");
        let theirs = BASE.replace("three\n", "theirs\n");
        assert_eq!(merge3(BASE, &ours, &theirs), MergeOutcome::Conflicted);
    }

    #[test]
    fn test_adjacent_edits_merge() {
        let ours = BASE.replace("two\n", "TWO\n");
        let theirs = BASE.replace("three\n", "THREE\n");
        let expected = BASE.replace("two\n", "TWO\n").replace("three\n", "THREE\n");
        assert_eq!(merge3(BASE, &ours, &theirs), MergeOutcome::Merged(expected));
    }

    #[test]
    fn test_insertions_at_same_point_conflict() {
        let ours = format!("{BASE}ours appended\n");
        let theirs = format!("{BASE}theirs appended\n");
        assert_eq!(merge3(BASE, &ours, &theirs), MergeOutcome::Conflicted);
    }

    #[test]
    fn test_deletion_vs_distant_edit_merges() {
        let ours = BASE.replace("one\n", "");
        let theirs = BASE.replace("eight\n", "EIGHT\n");
        let expected = BASE.replace("one\n", "").replace("eight\n", "EIGHT\n");
        assert_eq!(merge3(BASE, &ours, &theirs), MergeOutcome::Merged(expected));
    }
}
