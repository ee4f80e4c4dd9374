//! Pure diff utilities: unified-diff production, changed-range
//! extraction, and line-numbered rendering.
//!
//! No I/O and no state. The diff itself is line-level via
//! [`similar::TextDiff`]; inputs whose comparison table would be
//! enormous take a degraded line-by-line path instead so a pathological
//! file cannot stall a review worker.

use similar::{DiffOp, TextDiff};

use super::types::LineRange;

/// Context lines around each hunk.
const CONTEXT_LINES: usize = 3;

/// Above this many LCS table cells the diff falls back to a plain
/// equality walk.
const MAX_DIFF_CELLS: usize = 25_000_000;

/// Literal returned when both inputs are line-identical.
const NO_CHANGES: &str = "(no changes detected)";

// ── Unified diff ─────────────────────────────────────────────────

/// Produce a standard unified diff between two text blobs.
///
/// Lines are compared with trailing CR stripped, so CRLF/LF churn
/// does not show up as changes. Returns `"(no changes detected)"`
/// when the inputs are line-identical.
pub fn compute_unified_diff(original: &str, modified: &str, path: &str) -> String {
    compute_unified_diff_with_context(original, modified, path, CONTEXT_LINES)
}

pub fn compute_unified_diff_with_context(
    original: &str,
    modified: &str,
    path: &str,
    context: usize,
) -> String {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = modified.lines().collect();

    if old == new {
        return NO_CHANGES.to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("--- a/{path}\n"));
    out.push_str(&format!("+++ b/{path}\n"));

    if old.len().saturating_mul(new.len()) > MAX_DIFF_CELLS {
        render_fallback_hunks(&mut out, &old, &new, context);
    } else {
        let diff = TextDiff::from_slices(&old, &new);
        for group in diff.grouped_ops(context) {
            render_group(&mut out, &old, &new, &group);
        }
    }

    out
}

/// Render one group of ops as a hunk.
fn render_group(out: &mut String, old: &[&str], new: &[&str], group: &[DiffOp]) {
    let first = match group.first() {
        Some(op) => op,
        None => return,
    };
    let last = group.last().expect("non-empty group");

    let old_start = first.old_range().start;
    let old_end = last.old_range().end;
    let new_start = first.new_range().start;
    let new_end = last.new_range().end;

    out.push_str(&hunk_header(
        old_start,
        old_end - old_start,
        new_start,
        new_end - new_start,
    ));

    for op in group {
        match op {
            DiffOp::Equal { old_index, len, .. } => {
                for line in &old[*old_index..*old_index + *len] {
                    out.push(' ');
                    out.push_str(line);
                    out.push('\n');
                }
            }
            DiffOp::Delete { old_index, old_len, .. } => {
                for line in &old[*old_index..*old_index + *old_len] {
                    out.push('-');
                    out.push_str(line);
                    out.push('\n');
                }
            }
            DiffOp::Insert { new_index, new_len, .. } => {
                for line in &new[*new_index..*new_index + *new_len] {
                    out.push('+');
                    out.push_str(line);
                    out.push('\n');
                }
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                for line in &old[*old_index..*old_index + *old_len] {
                    out.push('-');
                    out.push_str(line);
                    out.push('\n');
                }
                for line in &new[*new_index..*new_index + *new_len] {
                    out.push('+');
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
    }
}

/// Degraded path for enormous inputs: walk both files in lockstep
/// and emit a delete+insert pair at every unequal position. The
/// changed-range superset stays safe for comment validation even
/// though hunks are cruder than a real LCS diff.
fn render_fallback_hunks(out: &mut String, old: &[&str], new: &[&str], context: usize) {
    let total = old.len().max(new.len());
    let changed: Vec<usize> = (0..total).filter(|&i| old.get(i) != new.get(i)).collect();
    if changed.is_empty() {
        return;
    }

    // Cluster changed indices; a gap of more than 2*context starts a
    // new hunk.
    let mut clusters: Vec<(usize, usize)> = Vec::new();
    for &i in &changed {
        match clusters.last_mut() {
            Some((_, end)) if i - *end <= 2 * context + 1 => *end = i,
            _ => clusters.push((i, i)),
        }
    }

    for (first, last) in clusters {
        let start = first.saturating_sub(context);
        let end = (last + context).min(total - 1);

        let old_count = (start..=end).filter(|&i| i < old.len()).count();
        let new_count = (start..=end).filter(|&i| i < new.len()).count();
        let old_start = if old_count > 0 { start } else { start.min(old.len()) };
        let new_start = if new_count > 0 { start } else { start.min(new.len()) };
        out.push_str(&hunk_header(old_start, old_count, new_start, new_count));

        for i in start..=end {
            match (old.get(i), new.get(i)) {
                (Some(o), Some(n)) if o == n => {
                    out.push(' ');
                    out.push_str(o);
                    out.push('\n');
                }
                (o, n) => {
                    if let Some(o) = o {
                        out.push('-');
                        out.push_str(o);
                        out.push('\n');
                    }
                    if let Some(n) = n {
                        out.push('+');
                        out.push_str(n);
                        out.push('\n');
                    }
                }
            }
        }
    }
}

/// `@@ -oStart,oCount +nStart,nCount @@` with 0-based inputs; a
/// zero-count side keeps its 0-based anchor per unified convention.
fn hunk_header(old_start: usize, old_count: usize, new_start: usize, new_count: usize) -> String {
    let o = if old_count > 0 { old_start + 1 } else { old_start };
    let n = if new_count > 0 { new_start + 1 } else { new_start };
    format!("@@ -{o},{old_count} +{n},{new_count} @@\n")
}

// ── Changed-range extraction ─────────────────────────────────────

/// Extract the `+`-side ranges of every hunk header as inclusive
/// 1-based line ranges into the new file. Zero-count hunks are
/// elided; empty or non-diff input yields an empty list.
pub fn parse_changed_line_ranges(unified_diff: &str) -> Vec<LineRange> {
    let mut ranges = Vec::new();
    for line in unified_diff.lines() {
        if !line.starts_with("@@") {
            continue;
        }
        let Some(plus) = line.split_whitespace().find(|tok| tok.starts_with('+')) else {
            continue;
        };
        let body = &plus[1..];
        let (start, count) = match body.split_once(',') {
            Some((s, c)) => match (s.parse::<usize>(), c.parse::<usize>()) {
                (Ok(s), Ok(c)) => (s, c),
                _ => continue,
            },
            None => match body.parse::<usize>() {
                Ok(s) => (s, 1),
                Err(_) => continue,
            },
        };
        if count == 0 {
            continue;
        }
        ranges.push(LineRange::new(start, start + count - 1));
    }
    ranges
}

// ── Line numbering ───────────────────────────────────────────────

/// Prefix each line with its 1-based index, right-justified to the
/// file's widest line number, followed by `" | "`.
pub fn add_line_numbers(content: &str) -> String {
    let total = content.lines().count();
    if total == 0 {
        return String::new();
    }
    let width = total.to_string().len();
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>width$} | {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_yield_literal() {
        assert_eq!(compute_unified_diff("a\nb\n", "a\nb\n", "f.rs"), NO_CHANGES);
    }

    #[test]
    fn crlf_only_churn_is_no_change() {
        assert_eq!(compute_unified_diff("a\r\nb\r\n", "a\nb\n", "f.rs"), NO_CHANGES);
    }

    #[test]
    fn single_line_edit_produces_one_hunk() {
        let old = "one\ntwo\nthree\nfour\nfive\n";
        let new = "one\ntwo\nTHREE\nfour\nfive\n";
        let diff = compute_unified_diff(old, new, "src/x.rs");

        assert!(diff.starts_with("--- a/src/x.rs\n+++ b/src/x.rs\n"));
        assert!(diff.contains("-three\n"));
        assert!(diff.contains("+THREE\n"));
        assert_eq!(diff.matches("@@").count(), 2, "one hunk, two @@ markers");
    }

    #[test]
    fn distant_edits_produce_separate_hunks() {
        let old: String = (1..=40).map(|i| format!("line{i}\n")).collect();
        let new = old.replace("line2\n", "LINE2\n").replace("line38\n", "LINE38\n");
        let diff = compute_unified_diff(&old, &new, "f");
        assert_eq!(diff.matches("@@").count(), 4, "two hunks");
    }

    #[test]
    fn nearby_edits_merge_into_one_hunk() {
        let old: String = (1..=20).map(|i| format!("line{i}\n")).collect();
        // Lines 5 and 9 changed: separated by 3 equal lines ≤ 2*context.
        let new = old.replace("line5\n", "LINE5\n").replace("line9\n", "LINE9\n");
        let diff = compute_unified_diff(&old, &new, "f");
        assert_eq!(diff.matches("@@").count(), 2, "merged into one hunk");
    }

    #[test]
    fn parse_ranges_from_headers() {
        let diff = "--- a/f\n+++ b/f\n@@ -3,2 +3,4 @@\n x\n@@ -20,1 +22,1 @@\n y\n";
        let ranges = parse_changed_line_ranges(diff);
        assert_eq!(ranges, vec![LineRange::new(3, 6), LineRange::new(22, 22)]);
    }

    #[test]
    fn parse_elides_zero_count_and_handles_bare_start() {
        let diff = "@@ -5,3 +5,0 @@\n@@ -1 +1 @@\n";
        let ranges = parse_changed_line_ranges(diff);
        assert_eq!(ranges, vec![LineRange::new(1, 1)]);
    }

    #[test]
    fn parse_empty_input() {
        assert!(parse_changed_line_ranges("").is_empty());
        assert!(parse_changed_line_ranges(NO_CHANGES).is_empty());
    }

    #[test]
    fn round_trip_ranges_cover_every_changed_line() {
        let old: String = (1..=60).map(|i| format!("l{i}\n")).collect();
        let new = old
            .replace("l7\n", "edited7\n")
            .replace("l30\n", "edited30\n")
            .replace("l55\n", "edited55\n");

        let diff = compute_unified_diff(&old, &new, "f");
        let ranges = parse_changed_line_ranges(&diff);

        // Every line in `new` that differs from `old` must fall in a range.
        let old_lines: Vec<&str> = old.lines().collect();
        for (idx, line) in new.lines().enumerate() {
            if old_lines.get(idx) != Some(&line) {
                let lineno = idx + 1;
                assert!(
                    ranges.iter().any(|r| r.contains(lineno)),
                    "line {lineno} ({line}) not covered by {ranges:?}"
                );
            }
        }
    }

    #[test]
    fn inserted_lines_fall_inside_a_range() {
        let old: String = (1..=20).map(|i| format!("l{i}\n")).collect();
        let new = old.replace("l10\n", "l10\nnew-a\nnew-b\n");

        let diff = compute_unified_diff(&old, &new, "f");
        let ranges = parse_changed_line_ranges(&diff);

        // The inserted lines land at 11 and 12 in the new file.
        assert!(ranges.iter().any(|r| r.contains(11)));
        assert!(ranges.iter().any(|r| r.contains(12)));
    }

    #[test]
    fn fallback_walk_still_covers_changes() {
        let old: String = (1..=30).map(|i| format!("a{i}\n")).collect();
        let new = old.replace("a15\n", "b15\n");
        let old_lines: Vec<&str> = old.lines().collect();
        let new_lines: Vec<&str> = new.lines().collect();

        let mut out = String::new();
        render_fallback_hunks(&mut out, &old_lines, &new_lines, 3);
        assert!(out.contains("-a15\n"));
        assert!(out.contains("+b15\n"));

        let ranges = parse_changed_line_ranges(&out);
        assert!(ranges.iter().any(|r| r.contains(15)));
    }

    #[test]
    fn fallback_handles_unequal_lengths() {
        let old = "a\nb\n";
        let new = "a\nb\nc\nd\n";
        let old_lines: Vec<&str> = old.lines().collect();
        let new_lines: Vec<&str> = new.lines().collect();

        let mut out = String::new();
        render_fallback_hunks(&mut out, &old_lines, &new_lines, 3);
        assert!(out.contains("+c\n"));
        assert!(out.contains("+d\n"));
        let ranges = parse_changed_line_ranges(&out);
        assert!(ranges.iter().any(|r| r.contains(3)));
        assert!(ranges.iter().any(|r| r.contains(4)));
    }

    #[test]
    fn line_numbers_right_justified() {
        let content: String = (1..=12).map(|i| format!("line{i}\n")).collect();
        let numbered = add_line_numbers(&content);
        let lines: Vec<&str> = numbered.lines().collect();
        assert_eq!(lines[0], " 1 | line1");
        assert_eq!(lines[9], "10 | line10");
        assert_eq!(lines[11], "12 | line12");
    }

    #[test]
    fn line_numbers_empty_content() {
        assert_eq!(add_line_numbers(""), "");
    }
}
