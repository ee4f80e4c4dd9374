//! Domain model for the review engine.
//!
//! Everything the orchestrator, validator and providers exchange lives
//! here: the immutable PR snapshot, per-file changes, provider output,
//! the durable per-PR metadata, and the append-only review history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Verdict ──────────────────────────────────────────────────────

/// Overall verdict for a review, ordered by severity.
///
/// The wire strings are fixed; anything a provider returns outside
/// the four legal values is treated as [`Verdict::Approved`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    ApprovedWithSuggestions,
    NeedsWork,
    Rejected,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::ApprovedWithSuggestions => "APPROVED WITH SUGGESTIONS",
            Self::NeedsWork => "NEEDS WORK",
            Self::Rejected => "REJECTED",
        }
    }

    /// Case-insensitive parse; illegal values collapse to `Approved`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "REJECTED" => Self::Rejected,
            "NEEDS WORK" => Self::NeedsWork,
            "APPROVED WITH SUGGESTIONS" => Self::ApprovedWithSuggestions,
            _ => Self::Approved,
        }
    }

    /// The harsher of two verdicts.
    pub fn worse(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Reviewer vote ────────────────────────────────────────────────

/// Clamp an arbitrary vote to the platform domain `{10, 5, -5, -10}`.
pub fn normalize_vote(raw: i32) -> i32 {
    if raw >= 10 {
        10
    } else if raw > 0 {
        5
    } else if raw > -10 {
        -5
    } else {
        -10
    }
}

// ── Lead-in ──────────────────────────────────────────────────────

/// Category prefix an inline comment opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadIn {
    Lgtm,
    GoodCatch,
    Important,
    Concern,
    Suggestion,
    Bug,
    Security,
    Performance,
}

impl LeadIn {
    pub fn label(self) -> &'static str {
        match self {
            Self::Lgtm => "LGTM",
            Self::GoodCatch => "Good catch",
            Self::Important => "Important",
            Self::Concern => "Concern",
            Self::Suggestion => "Suggestion",
            Self::Bug => "Bug",
            Self::Security => "Security",
            Self::Performance => "Performance",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "lgtm" => Self::Lgtm,
            "good catch" => Self::GoodCatch,
            "important" => Self::Important,
            "concern" => Self::Concern,
            "bug" => Self::Bug,
            "security" => Self::Security,
            "performance" => Self::Performance,
            _ => Self::Suggestion,
        }
    }

    /// Severity bucket used by the outcome counters.
    pub fn severity(self) -> CommentSeverity {
        match self {
            Self::Bug | Self::Security => CommentSeverity::Error,
            Self::Concern | Self::Performance => CommentSeverity::Warning,
            _ => CommentSeverity::Info,
        }
    }
}

/// Severity bucket for outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentSeverity {
    Error,
    Warning,
    Info,
}

// ── Line ranges ──────────────────────────────────────────────────

/// Inclusive 1-based line range into a modified file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Whether `[self]` and `[other]` intersect within `tolerance` lines.
    pub fn overlaps_within(&self, other: &LineRange, tolerance: usize) -> bool {
        self.start <= other.end + tolerance && other.start <= self.end + tolerance
    }

    pub fn contains(&self, line: usize) -> bool {
        line >= self.start && line <= self.end
    }
}

// ── Pull request snapshot ────────────────────────────────────────

/// Immutable view of a PR at observation time. Produced by the state
/// store; the engine never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub pr_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub is_draft: bool,
    /// Opaque commit identifier of the source tip.
    pub source_commit: String,
    /// Opaque commit identifier of the merge target.
    pub target_commit: String,
    #[serde(default)]
    pub reviewers: Vec<ReviewerIdentity>,
}

/// One reviewer on the PR, with their current platform vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerIdentity {
    pub id: String,
    pub display_name: String,
    /// Platform vote: -10, -5, 0, 5 or 10.
    pub vote: i32,
}

// ── File changes ─────────────────────────────────────────────────

/// Kind of change a file underwent in the PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Edit,
    Delete,
    Rename,
}

/// Unit of review: one changed file with both contents and the
/// derived diff artifacts.
///
/// Invariants: `Add` has no original content and the changed ranges
/// cover the whole file; `Delete` has no modified content and no
/// ranges; `Edit` has both contents and ranges derived from the diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    /// Repo-relative path.
    pub path: String,
    pub change_type: ChangeType,
    pub original_content: Option<String>,
    pub modified_content: Option<String>,
    pub unified_diff: Option<String>,
    #[serde(default)]
    pub changed_line_ranges: Vec<LineRange>,
}

impl FileChange {
    /// Number of lines in the modified content (0 for deletes).
    pub fn modified_line_count(&self) -> usize {
        self.modified_content
            .as_deref()
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }
}

// ── Inline comments ──────────────────────────────────────────────

/// Lifecycle state of an inline comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentState {
    Active,
    Closed,
}

/// One AI-produced inline comment. Lines are 1-based inclusive and
/// may be rewritten during validation (snippet resolution, clamping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineComment {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub lead_in: LeadIn,
    pub comment: String,
    /// 1–3 line verbatim excerpt from the modified file, when the
    /// provider pinned a specific location.
    pub code_snippet: Option<String>,
    pub status: CommentState,
}

impl InlineComment {
    /// The comment body without the attribution suffix.
    pub fn core_content(&self) -> String {
        format!("**{}.** {}", self.lead_in.label(), self.comment)
    }

    pub fn range(&self) -> LineRange {
        LineRange::new(self.start_line, self.end_line)
    }
}

// ── Review results ───────────────────────────────────────────────

/// Headline numbers and verdict for one review scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub files_changed: usize,
    pub edits_count: usize,
    pub adds_count: usize,
    pub deletes_count: usize,
    pub description: String,
    #[serde(default)]
    pub verdict: Verdict,
    #[serde(default)]
    pub verdict_justification: String,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Approved
    }
}

/// Per-file assessment inside a [`ReviewResult`].
///
/// `verdict` is a free-form marker here ("OK", "CONCERN", "REJECTED");
/// the summary thread only surfaces CONCERN/REJECTED files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReview {
    pub path: String,
    pub verdict: String,
    pub review_text: String,
}

/// Token and latency accounting for one provider call (or a merged
/// set of calls).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewMetrics {
    pub model_name: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub ai_duration_ms: u64,
}

/// Output of one provider for one scope (whole PR or single file).
/// Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub summary: ReviewSummary,
    #[serde(default)]
    pub file_reviews: Vec<FileReview>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    #[serde(default)]
    pub observations: Vec<String>,
    /// Recommended platform vote, constrained to {10, 5, -5, -10}.
    pub recommended_vote: i32,
    #[serde(default)]
    pub metrics: ReviewMetrics,
}

impl ReviewResult {
    /// An empty approved result, used as the merge seed.
    pub fn approved(model_name: &str) -> Self {
        Self {
            summary: ReviewSummary {
                verdict: Verdict::Approved,
                ..Default::default()
            },
            file_reviews: Vec::new(),
            inline_comments: Vec::new(),
            observations: Vec::new(),
            recommended_vote: 10,
            metrics: ReviewMetrics {
                model_name: model_name.to_string(),
                ..Default::default()
            },
        }
    }
}

// ── Durable metadata ─────────────────────────────────────────────

/// Canonical per-PR state persisted in platform properties. Absent
/// properties deserialize to the zero value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewMetadata {
    #[serde(default)]
    pub last_reviewed_source_commit: String,
    #[serde(default)]
    pub last_reviewed_target_commit: String,
    #[serde(default)]
    pub last_reviewed_iteration: i64,
    #[serde(default)]
    pub was_draft: bool,
    #[serde(default)]
    pub reviewed_at_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vote_submitted: bool,
    #[serde(default)]
    pub review_count: u32,
}

impl ReviewMetadata {
    /// A non-empty last-reviewed commit is the signal that this PR
    /// has been reviewed before.
    pub fn has_previous_review(&self) -> bool {
        !self.last_reviewed_source_commit.is_empty()
    }
}

// ── Review history ───────────────────────────────────────────────

/// What an orchestrator invocation did, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewAction {
    #[serde(rename = "Full Review")]
    FullReview,
    #[serde(rename = "Re-Review")]
    ReReview,
    #[serde(rename = "Vote Only")]
    VoteOnly,
    #[serde(rename = "Skipped")]
    Skipped,
}

impl ReviewAction {
    pub fn label(self) -> &'static str {
        match self {
            Self::FullReview => "Full Review",
            Self::ReReview => "Re-Review",
            Self::VoteOnly => "Vote Only",
            Self::Skipped => "Skipped",
        }
    }
}

/// Append-only event record. `review_number` is derived from the
/// stored history length at write time, so numbering survives a
/// metadata wipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewHistoryEntry {
    pub review_number: u32,
    pub reviewed_at_utc: DateTime<Utc>,
    pub action: ReviewAction,
    pub verdict: String,
    pub source_commit: String,
    pub iteration: i64,
    pub is_draft: bool,
    pub inline_comments_posted: usize,
    pub files_changed: usize,
    pub vote: Option<i32>,
    #[serde(default)]
    pub metrics: ReviewMetrics,
}

// ── Existing threads ─────────────────────────────────────────────

/// Platform thread status, with the platform's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Fixed,
    WontFix,
    Closed,
    ByDesign,
    Pending,
}

impl ThreadStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Active => 1,
            Self::Fixed => 2,
            Self::WontFix => 3,
            Self::Closed => 4,
            Self::ByDesign => 5,
            Self::Pending => 6,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Active,
            2 => Self::Fixed,
            3 => Self::WontFix,
            5 => Self::ByDesign,
            6 => Self::Pending,
            _ => Self::Closed,
        }
    }

    /// Unknown names default to `Closed`.
    pub fn from_name_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "fixed" => Self::Fixed,
            "wontfix" => Self::WontFix,
            "bydesign" => Self::ByDesign,
            "pending" => Self::Pending,
            _ => Self::Closed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Fixed => "fixed",
            Self::WontFix => "wontfix",
            Self::Closed => "closed",
            Self::ByDesign => "bydesign",
            Self::Pending => "pending",
        }
    }
}

/// Read-only view of a prior comment thread on the PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingCommentThread {
    pub thread_id: i64,
    /// `None` for top-level threads with no file context.
    pub path: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub status: ThreadStatus,
}

impl ExistingCommentThread {
    /// Whether this thread was posted by the engine, recognized
    /// exclusively by the attribution marker.
    pub fn is_ai_generated(&self, attribution_tag: &str) -> bool {
        !attribution_tag.is_empty() && self.content.contains(&format!("_[{attribution_tag}]_"))
    }
}

// ── Resolution verification ──────────────────────────────────────

/// One prior comment whose underlying lines changed, packaged for
/// the provider to judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionCandidate {
    pub thread_id: i64,
    pub path: String,
    /// The original comment text.
    pub comment: String,
    /// ±10-line window of current code around the comment's range.
    pub code_context: String,
}

/// Provider judgement over one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionVerdict {
    pub thread_id: i64,
    pub is_fixed: bool,
    #[serde(default)]
    pub reasoning: String,
}

// ── Orchestrator outcome ─────────────────────────────────────────

/// Top-level status of one orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Reviewed,
    Skipped,
    RateLimited,
    Error,
}

/// Tagged outcome returned from the orchestrator's entry point. The
/// state machine never propagates an error past this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote: Option<i32>,
    pub issue_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Seconds until the cooldown expires; only on rate-limited
    /// outcomes, so HTTP callers can back off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ReviewOutcome {
    pub fn skipped(summary: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            summary: Some(summary.into()),
            ..Self::empty(OutcomeStatus::Skipped)
        }
    }

    pub fn rate_limited(summary: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self {
            status: OutcomeStatus::RateLimited,
            summary: Some(summary.into()),
            retry_after_seconds: Some(retry_after_seconds),
            ..Self::empty(OutcomeStatus::RateLimited)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            error_message: Some(message.into()),
            ..Self::empty(OutcomeStatus::Error)
        }
    }

    /// Blank reviewed outcome; callers fill the interesting fields.
    pub fn reviewed() -> Self {
        Self::empty(OutcomeStatus::Reviewed)
    }

    fn empty(status: OutcomeStatus) -> Self {
        Self {
            status,
            recommendation: None,
            vote: None,
            issue_count: 0,
            error_count: 0,
            warning_count: 0,
            info_count: 0,
            summary: None,
            error_message: None,
            retry_after_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_severity_ordering() {
        assert!(Verdict::Rejected > Verdict::NeedsWork);
        assert!(Verdict::NeedsWork > Verdict::ApprovedWithSuggestions);
        assert!(Verdict::ApprovedWithSuggestions > Verdict::Approved);
    }

    #[test]
    fn verdict_lossy_parse() {
        assert_eq!(Verdict::from_str_lossy("needs work"), Verdict::NeedsWork);
        assert_eq!(Verdict::from_str_lossy("REJECTED"), Verdict::Rejected);
        assert_eq!(
            Verdict::from_str_lossy("Approved With Suggestions"),
            Verdict::ApprovedWithSuggestions
        );
        // Illegal values collapse to APPROVED
        assert_eq!(Verdict::from_str_lossy("LGTM!!"), Verdict::Approved);
    }

    #[test]
    fn vote_normalization() {
        assert_eq!(normalize_vote(10), 10);
        assert_eq!(normalize_vote(7), 5);
        assert_eq!(normalize_vote(0), -5);
        assert_eq!(normalize_vote(-3), -5);
        assert_eq!(normalize_vote(-10), -10);
        assert_eq!(normalize_vote(-100), -10);
    }

    #[test]
    fn lead_in_severity_buckets() {
        assert_eq!(LeadIn::Bug.severity(), CommentSeverity::Error);
        assert_eq!(LeadIn::Security.severity(), CommentSeverity::Error);
        assert_eq!(LeadIn::Concern.severity(), CommentSeverity::Warning);
        assert_eq!(LeadIn::Performance.severity(), CommentSeverity::Warning);
        assert_eq!(LeadIn::Suggestion.severity(), CommentSeverity::Info);
        assert_eq!(LeadIn::Lgtm.severity(), CommentSeverity::Info);
    }

    #[test]
    fn line_range_overlap_tolerance() {
        let a = LineRange::new(5, 10);
        let b = LineRange::new(12, 14);
        assert!(a.overlaps_within(&b, 3));
        assert!(b.overlaps_within(&a, 3));
        let c = LineRange::new(14, 20);
        assert!(!a.overlaps_within(&c, 3));
    }

    #[test]
    fn metadata_previous_review_signal() {
        let mut m = ReviewMetadata::default();
        assert!(!m.has_previous_review());
        m.last_reviewed_source_commit = "abc123".into();
        assert!(m.has_previous_review());
    }

    #[test]
    fn history_entry_round_trips_through_json() {
        let entry = ReviewHistoryEntry {
            review_number: 3,
            reviewed_at_utc: Utc::now(),
            action: ReviewAction::ReReview,
            verdict: "NEEDS WORK".into(),
            source_commit: "deadbeef".into(),
            iteration: 4,
            is_draft: false,
            inline_comments_posted: 2,
            files_changed: 5,
            vote: Some(-5),
            metrics: ReviewMetrics::default(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"Re-Review\""));
        let back: ReviewHistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.review_number, 3);
        assert_eq!(back.action, ReviewAction::ReReview);
        assert_eq!(back.vote, Some(-5));
    }

    #[test]
    fn thread_status_code_mapping() {
        assert_eq!(ThreadStatus::Active.code(), 1);
        assert_eq!(ThreadStatus::Fixed.code(), 2);
        assert_eq!(ThreadStatus::from_code(6), ThreadStatus::Pending);
        assert_eq!(ThreadStatus::from_code(99), ThreadStatus::Closed);
        assert_eq!(ThreadStatus::from_name_lossy("ByDesign"), ThreadStatus::ByDesign);
        assert_eq!(ThreadStatus::from_name_lossy("nonsense"), ThreadStatus::Closed);
    }

    #[test]
    fn ai_attribution_detection() {
        let thread = ExistingCommentThread {
            thread_id: 1,
            path: Some("src/lib.rs".into()),
            start_line: 3,
            end_line: 4,
            content: "**Bug.** Off-by-one.\n\n_[prwarden]_".into(),
            status: ThreadStatus::Active,
        };
        assert!(thread.is_ai_generated("prwarden"));
        assert!(!thread.is_ai_generated("other-bot"));
        assert!(!thread.is_ai_generated(""));
    }

    #[test]
    fn inline_comment_core_content() {
        let c = InlineComment {
            path: "src/main.rs".into(),
            start_line: 4,
            end_line: 6,
            lead_in: LeadIn::GoodCatch,
            comment: "Handles the empty case.".into(),
            code_snippet: None,
            status: CommentState::Active,
        };
        assert_eq!(c.core_content(), "**Good catch.** Handles the empty case.");
    }
}
