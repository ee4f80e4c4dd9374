//! Prompt assembly shared by the direct transports.
//!
//! Kept deliberately functional: the interesting contract is the JSON
//! shape the model is asked to return, which `parse_review_text` and
//! `parse_resolution_text` consume.

use crate::review::diff::add_line_numbers;
use crate::review::types::{FileChange, PullRequestSnapshot, ResolutionCandidate};

const RESPONSE_SCHEMA: &str = r#"Respond with EXACTLY this JSON (no prose outside the fence):
```json
{
  "summary": {
    "description": "what this change does",
    "verdict": "APPROVED" | "APPROVED WITH SUGGESTIONS" | "NEEDS WORK" | "REJECTED",
    "verdict_justification": "one or two sentences"
  },
  "file_reviews": [
    { "path": "repo/relative/path", "verdict": "OK" | "CONCERN" | "REJECTED", "review_text": "..." }
  ],
  "inline_comments": [
    {
      "path": "repo/relative/path",
      "start_line": 1,
      "end_line": 1,
      "lead_in": "LGTM" | "Good catch" | "Important" | "Concern" | "Suggestion" | "Bug" | "Security" | "Performance",
      "comment": "...",
      "code_snippet": "1-3 lines copied verbatim from the NEW file, or null"
    }
  ],
  "observations": ["cross-cutting notes"],
  "recommended_vote": 10 | 5 | -5 | -10
}
```
Use start_line/end_line 1 only for comments that are not about a specific line.
When you pin a location, copy the exact code into code_snippet."#;

fn push_pr_header(out: &mut String, pr: &PullRequestSnapshot) {
    out.push_str(&format!(
        "## Pull Request #{}\nTitle: {}\nAuthor: {}\nSource: {} -> {}\nDraft: {}\n\n{}\n",
        pr.pr_id, pr.title, pr.author, pr.source_branch, pr.target_branch, pr.is_draft,
        pr.description,
    ));
}

fn push_file(out: &mut String, file: &FileChange) {
    out.push_str(&format!("\n### File: {} ({:?})\n", file.path, file.change_type));
    if let Some(diff) = file.unified_diff.as_deref() {
        out.push_str("```diff\n");
        out.push_str(diff);
        out.push_str("\n```\n");
    }
    if let Some(content) = file.modified_content.as_deref() {
        out.push_str("New content (line-numbered):\n```\n");
        out.push_str(&add_line_numbers(content));
        out.push_str("\n```\n");
    }
}

/// Whole-PR review prompt.
pub(crate) fn review_all_prompt(
    pr: &PullRequestSnapshot,
    files: &[FileChange],
    custom_instructions: Option<&str>,
) -> String {
    let mut out = String::from(
        "You are a senior engineer reviewing a pull request. \
         Review every file below for correctness, security and performance. \
         Skip trivial style nitpicks.\n\n",
    );
    push_pr_header(&mut out, pr);
    for file in files {
        push_file(&mut out, file);
    }
    if let Some(custom) = custom_instructions {
        out.push_str("\n## Additional instructions\n");
        out.push_str(custom);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(RESPONSE_SCHEMA);
    out
}

/// Single-file review prompt.
pub(crate) fn review_one_prompt(
    pr: &PullRequestSnapshot,
    file: &FileChange,
    total_files: usize,
    custom_instructions: Option<&str>,
) -> String {
    let mut out = format!(
        "You are a senior engineer reviewing one file of a pull request \
         that touches {total_files} file(s). Review only this file; comment \
         only on lines that exist in its new content.\n\n",
    );
    push_pr_header(&mut out, pr);
    push_file(&mut out, file);
    if let Some(custom) = custom_instructions {
        out.push_str("\n## Additional instructions\n");
        out.push_str(custom);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(RESPONSE_SCHEMA);
    out
}

/// Resolution-verification prompt over a batch of prior comments.
pub(crate) fn verify_resolutions_prompt(candidates: &[ResolutionCandidate]) -> String {
    let mut out = String::from(
        "Earlier code-review comments are listed below together with the \
         CURRENT code around their location. For each, decide whether the \
         concern has been addressed by the current code.\n",
    );
    for c in candidates {
        out.push_str(&format!(
            "\n--- thread_id {} ({})\nComment: {}\nCurrent code:\n```\n{}\n```\n",
            c.thread_id, c.path, c.comment, c.code_context,
        ));
    }
    out.push_str(
        "\nRespond with EXACTLY a JSON array:\n```json\n\
         [{\"thread_id\": 0, \"is_fixed\": true, \"reasoning\": \"...\"}]\n```\n\
         Mark is_fixed true only when the current code clearly resolves the comment.",
    );
    out
}
