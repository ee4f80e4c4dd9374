//! Deterministic filtering of AI-produced inline comments against
//! the actual changed-file set.
//!
//! Providers hallucinate paths, misplace line numbers, and claim
//! symbols are missing when they exist. Every comment runs the same
//! gauntlet before it is allowed near the PR:
//!
//! 1. path must belong to a reviewed file
//! 2. snippet resolution rebinds lines to the quoted code
//! 3. lines are clamped into the file
//! 4. the comment must sit on or near changed lines
//! 5. the 1..1 convention marker for non-line-specific output is dropped
//! 6. "X is not defined" claims are checked against the file itself

use std::sync::OnceLock;

use regex::Regex;

use super::types::{FileChange, InlineComment, LineRange};

/// How far (in lines) a comment may sit from a changed range.
const PROXIMITY_LINES: usize = 5;

/// Half-width of the density window around a comment.
const DENSITY_WINDOW: usize = 25;

/// Fraction of the density window that must be changed lines.
const DENSITY_THRESHOLD: f64 = 0.40;

/// Phrases that mark a "missing symbol" claim worth double-checking.
const FALSE_POSITIVE_PHRASES: &[&str] = &[
    "not defined",
    "is not defined",
    "not found",
    "not implemented",
    "missing definition",
    "missing implementation",
    "ensure it is implemented",
];

// ── Diagnostics ──────────────────────────────────────────────────

/// Counters describing what a validation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub input: usize,
    pub kept: usize,
    pub dropped_unknown_path: usize,
    pub dropped_outside_changes: usize,
    pub dropped_line_one_marker: usize,
    pub dropped_false_positive: usize,
    pub snippets_resolved: usize,
}

// ── Validator ────────────────────────────────────────────────────

/// Validate and filter a batch of inline comments against the files
/// under review. Comment line fields may be rewritten in place.
pub fn validate_comments(
    comments: Vec<InlineComment>,
    files: &[FileChange],
) -> (Vec<InlineComment>, ValidationStats) {
    let mut stats = ValidationStats {
        input: comments.len(),
        ..Default::default()
    };
    let mut kept = Vec::with_capacity(comments.len());

    for mut comment in comments {
        let Some(file) = find_file(files, &comment.path) else {
            stats.dropped_unknown_path += 1;
            continue;
        };
        let Some(content) = file.modified_content.as_deref() else {
            // Deleted files have nothing to anchor a comment to.
            stats.dropped_unknown_path += 1;
            continue;
        };
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        if total == 0 {
            stats.dropped_unknown_path += 1;
            continue;
        }

        if resolve_snippet(&mut comment, &lines) {
            stats.snippets_resolved += 1;
        }

        clamp(&mut comment, total);

        if !file.changed_line_ranges.is_empty()
            && !near_changes(&comment, &file.changed_line_ranges, total)
        {
            stats.dropped_outside_changes += 1;
            continue;
        }

        if comment.start_line == 1 && comment.end_line == 1 {
            stats.dropped_line_one_marker += 1;
            continue;
        }

        if is_refuted_missing_symbol_claim(&comment.comment, content) {
            stats.dropped_false_positive += 1;
            continue;
        }

        kept.push(comment);
    }

    stats.kept = kept.len();
    (kept, stats)
}

fn find_file<'a>(files: &'a [FileChange], path: &str) -> Option<&'a FileChange> {
    files
        .iter()
        .find(|f| f.path == path)
        .or_else(|| files.iter().find(|f| f.path.eq_ignore_ascii_case(path)))
}

/// Rebind the comment's range to the first occurrence of its snippet,
/// case-sensitive first and case-insensitive second. A miss keeps the
/// original lines.
fn resolve_snippet(comment: &mut InlineComment, lines: &[&str]) -> bool {
    let Some(snippet) = comment.code_snippet.as_deref() else {
        return false;
    };
    let Some(first) = snippet.lines().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    let needle = first.trim();
    if needle.is_empty() {
        return false;
    }

    let hit = lines
        .iter()
        .position(|l| l.contains(needle))
        .or_else(|| {
            let lowered = needle.to_lowercase();
            lines.iter().position(|l| l.to_lowercase().contains(&lowered))
        });

    let Some(idx) = hit else {
        return false;
    };

    let snippet_lines = snippet.lines().count().max(1);
    comment.start_line = idx + 1;
    comment.end_line = (idx + snippet_lines).min(lines.len());
    true
}

fn clamp(comment: &mut InlineComment, total: usize) {
    comment.start_line = comment.start_line.clamp(1, total);
    comment.end_line = comment.end_line.clamp(comment.start_line, total);
}

/// Changed-region gate: proximity or density.
fn near_changes(comment: &InlineComment, ranges: &[LineRange], total: usize) -> bool {
    let span = comment.range();

    if ranges.iter().any(|r| r.overlaps_within(&span, PROXIMITY_LINES)) {
        return true;
    }

    // Density: a heavy rewrite justifies method-level comments even
    // when the exact lines are untouched.
    let win_start = span.start.saturating_sub(DENSITY_WINDOW).max(1);
    let win_end = (span.end + DENSITY_WINDOW).min(total);
    if win_end < win_start {
        return false;
    }
    let window = (win_start..=win_end).count();
    let changed = (win_start..=win_end)
        .filter(|&line| ranges.iter().any(|r| r.contains(line)))
        .count();

    changed as f64 / window as f64 >= DENSITY_THRESHOLD
}

// ── False-positive gate ──────────────────────────────────────────

fn backtick_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([A-Za-z_][A-Za-z0-9_.:]*)\(?\)?`").expect("static regex"))
}

fn noun_phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:method|class|function|property|variable|interface)\s+`?([A-Za-z_][A-Za-z0-9_]*)`?")
            .expect("static regex")
    })
}

/// True when the comment claims a symbol is missing and the symbol
/// in fact occurs verbatim in the file.
fn is_refuted_missing_symbol_claim(comment: &str, content: &str) -> bool {
    let lowered = comment.to_lowercase();
    if !FALSE_POSITIVE_PHRASES.iter().any(|p| lowered.contains(p)) {
        return false;
    }

    let mut identifiers: Vec<String> = Vec::new();
    for cap in backtick_re().captures_iter(comment) {
        identifiers.push(cap[1].trim_end_matches("()").to_string());
    }
    for cap in noun_phrase_re().captures_iter(comment) {
        identifiers.push(cap[1].to_string());
    }

    identifiers
        .iter()
        .filter(|id| !id.is_empty())
        .any(|id| content.contains(id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::types::{ChangeType, CommentState, LeadIn};

    fn file(path: &str, content: &str, ranges: Vec<LineRange>) -> FileChange {
        FileChange {
            path: path.into(),
            change_type: ChangeType::Edit,
            original_content: Some(String::new()),
            modified_content: Some(content.into()),
            unified_diff: None,
            changed_line_ranges: ranges,
        }
    }

    fn comment(path: &str, start: usize, end: usize, text: &str) -> InlineComment {
        InlineComment {
            path: path.into(),
            start_line: start,
            end_line: end,
            lead_in: LeadIn::Suggestion,
            comment: text.into(),
            code_snippet: None,
            status: CommentState::Active,
        }
    }

    fn numbered_content(lines: usize) -> String {
        (1..=lines).map(|i| format!("line{i}\n")).collect()
    }

    #[test]
    fn unknown_path_is_dropped() {
        let files = vec![file("src/a.rs", &numbered_content(10), vec![LineRange::new(2, 4)])];
        let (kept, stats) = validate_comments(vec![comment("src/other.rs", 3, 3, "x")], &files);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped_unknown_path, 1);
    }

    #[test]
    fn path_match_tolerates_case() {
        let files = vec![file("src/a.rs", &numbered_content(10), vec![LineRange::new(2, 4)])];
        let (kept, _) = validate_comments(vec![comment("Src/A.rs", 3, 3, "x")], &files);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn snippet_resolution_rebinds_lines() {
        let content = "fn a() {}\nfn target() {\n    body();\n}\nfn z() {}\n";
        let files = vec![file("src/a.rs", content, vec![LineRange::new(1, 5)])];
        let mut c = comment("src/a.rs", 99, 99, "rename this");
        c.code_snippet = Some("fn target() {\n    body();".into());

        let (kept, stats) = validate_comments(vec![c], &files);
        assert_eq!(stats.snippets_resolved, 1);
        assert_eq!(kept[0].start_line, 2);
        assert_eq!(kept[0].end_line, 3);
    }

    #[test]
    fn snippet_miss_keeps_original_lines_then_clamps() {
        let files = vec![file("src/a.rs", &numbered_content(5), vec![LineRange::new(1, 5)])];
        let mut c = comment("src/a.rs", 4, 40, "check");
        c.code_snippet = Some("no such line anywhere".into());

        let (kept, stats) = validate_comments(vec![c], &files);
        assert_eq!(stats.snippets_resolved, 0);
        assert_eq!(kept[0].start_line, 4);
        assert_eq!(kept[0].end_line, 5);
    }

    #[test]
    fn snippet_search_falls_back_to_case_insensitive() {
        let content = "alpha\nBETA LINE\ngamma\n";
        let files = vec![file("f", content, vec![LineRange::new(1, 3)])];
        let mut c = comment("f", 9, 9, "x");
        c.code_snippet = Some("beta line".into());

        let (kept, _) = validate_comments(vec![c], &files);
        assert_eq!(kept[0].start_line, 2);
    }

    #[test]
    fn comment_far_from_changes_is_dropped() {
        let files = vec![file("f", &numbered_content(100), vec![LineRange::new(2, 4)])];
        let (kept, stats) = validate_comments(vec![comment("f", 60, 61, "x")], &files);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped_outside_changes, 1);
    }

    #[test]
    fn comment_within_proximity_survives() {
        let files = vec![file("f", &numbered_content(100), vec![LineRange::new(20, 24)])];
        // 5 lines below the changed range.
        let (kept, _) = validate_comments(vec![comment("f", 29, 29, "x")], &files);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn density_allows_method_level_comment_on_heavy_rewrite() {
        // A comment between two rewritten regions: more than 5 lines
        // from both, but most of the ±25 window is changed lines.
        let ranges = vec![LineRange::new(10, 60), LineRange::new(80, 95)];
        let files = vec![file("f", &numbered_content(100), ranges)];
        let (kept, _) = validate_comments(vec![comment("f", 70, 70, "x")], &files);
        assert_eq!(kept.len(), 1);

        // Sparse surroundings fail the density gate.
        let files = vec![file("f", &numbered_content(100), vec![LineRange::new(10, 60)])];
        let (kept, stats) = validate_comments(vec![comment("f", 97, 97, "x")], &files);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped_outside_changes, 1);
    }

    #[test]
    fn file_without_ranges_skips_region_gate() {
        let files = vec![file("f", &numbered_content(50), vec![])];
        let (kept, _) = validate_comments(vec![comment("f", 40, 40, "x")], &files);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn line_one_marker_is_dropped() {
        let files = vec![file("f", &numbered_content(10), vec![LineRange::new(1, 10)])];
        let (kept, stats) = validate_comments(vec![comment("f", 1, 1, "general remark")], &files);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped_line_one_marker, 1);
    }

    #[test]
    fn refuted_missing_symbol_claim_is_dropped() {
        let content = "fn helper() {}\nfn main() { helper(); }\n";
        let files = vec![file("f", content, vec![LineRange::new(1, 2)])];
        let c = comment("f", 2, 2, "The method `helper` is not defined anywhere.");

        let (kept, stats) = validate_comments(vec![c], &files);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped_false_positive, 1);
    }

    #[test]
    fn missing_symbol_claim_with_truly_absent_symbol_survives() {
        let content = "fn main() {\n    other();\n}\n";
        let files = vec![file("f", content, vec![LineRange::new(1, 3)])];
        let c = comment("f", 2, 2, "The function `ghost_fn` is not defined.");

        let (kept, _) = validate_comments(vec![c], &files);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn noun_phrase_identifier_extraction() {
        let content = "struct Widget;\nimpl Widget {}\n";
        let files = vec![file("f", content, vec![LineRange::new(1, 2)])];
        let c = comment("f", 2, 2, "class Widget is not implemented in this file.");

        let (kept, stats) = validate_comments(vec![c], &files);
        assert!(kept.is_empty());
        assert_eq!(stats.dropped_false_positive, 1);
    }

    #[test]
    fn unrelated_comment_passes_false_positive_gate() {
        let content = "let x = 1;\nlet y = 2;\n";
        let files = vec![file("f", content, vec![LineRange::new(1, 2)])];
        let c = comment("f", 2, 2, "Consider renaming `y` for clarity.");

        let (kept, _) = validate_comments(vec![c], &files);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn surviving_comments_satisfy_bounds_invariant() {
        let files = vec![file("f", &numbered_content(30), vec![LineRange::new(1, 30)])];
        let inputs = vec![
            comment("f", 0, 0, "a"),
            comment("f", 500, 900, "b"),
            comment("f", 12, 3, "c"),
        ];
        let (kept, _) = validate_comments(inputs, &files);
        for c in &kept {
            assert!(c.start_line >= 1);
            assert!(c.start_line <= c.end_line);
            assert!(c.end_line <= 30);
        }
    }
}
