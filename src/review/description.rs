//! Marker-delimited review-history table in the PR description.
//!
//! The table lives between two literal HTML comments so re-writes can
//! find it again. Existing data rows are preserved verbatim; each
//! review appends exactly one row.

use super::types::ReviewHistoryEntry;

pub const HISTORY_START: &str = "<!-- AI-REVIEW-HISTORY-START -->";
pub const HISTORY_END: &str = "<!-- AI-REVIEW-HISTORY-END -->";

const TABLE_HEADER: &str =
    "| Review # | Date (UTC) | Action | Verdict | Commit | Iteration | Scope |";
const TABLE_SEPARATOR: &str = "|---|---|---|---|---|---|---|";

/// Render one history entry as a table row.
fn render_row(entry: &ReviewHistoryEntry) -> String {
    let commit = short_sha(&entry.source_commit);
    format!(
        "| {} | {} | {} | {} | {} | {} | {} file(s) |",
        entry.review_number,
        entry.reviewed_at_utc.format("%Y-%m-%d %H:%M"),
        entry.action.label(),
        entry.verdict,
        commit,
        entry.iteration,
        entry.files_changed,
    )
}

/// First 8 characters of a commit id, or a dash when unknown.
pub fn short_sha(commit: &str) -> &str {
    if commit.is_empty() {
        "-"
    } else {
        commit.get(..8).unwrap_or(commit)
    }
}

/// Append a history row to the description, creating the marker block
/// on first write. Pre-existing rows survive every re-write.
pub fn append_history_row(description: &str, entry: &ReviewHistoryEntry) -> String {
    let row = render_row(entry);

    let (start, end) = match (description.find(HISTORY_START), description.find(HISTORY_END)) {
        (Some(s), Some(e)) if s < e => (s, e),
        // No block yet (or degenerate markers): create a fresh one at
        // the end of the description.
        _ => {
            let mut out = description.trim_end().to_string();
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(HISTORY_START);
            out.push('\n');
            out.push_str(TABLE_HEADER);
            out.push('\n');
            out.push_str(TABLE_SEPARATOR);
            out.push('\n');
            out.push_str(&row);
            out.push('\n');
            out.push_str(HISTORY_END);
            return out;
        }
    };

    let block = &description[start..end];
    let mut rebuilt = String::with_capacity(description.len() + row.len() + 2);
    rebuilt.push_str(&description[..start]);
    rebuilt.push_str(block.trim_end());
    rebuilt.push('\n');
    rebuilt.push_str(&row);
    rebuilt.push('\n');
    rebuilt.push_str(&description[end..]);
    rebuilt
}
