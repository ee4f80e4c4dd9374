//! The review state machine.
//!
//! Each request runs one pass of a fixed decision procedure:
//!
//! ```text
//! request ─▸ RateGate ─▸ metadata ─▸ decide() ─┬─▸ FullReview ┐
//!                                              ├─▸ ReReview   ├─▸ fan-out ▸ merge ▸
//!                                              ├─▸ VoteOnly   │   validate ▸ post ▸
//!                                              └─▸ Skip       ┘   vote ▸ persist
//! ```
//!
//! The entry point never propagates an error: every failure class is
//! folded into a tagged [`ReviewOutcome`]. Peripheral failures (vote,
//! tag, description, individual posts) are logged and absorbed;
//! losing every provider on the primary review is fatal.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::config::{Config, ReviewOptions};
use crate::providers::ReviewProvider;

use super::description::{append_history_row, short_sha};
use super::rate_gate::{GateKey, RateGate};
use super::store::ReviewStateStore;
use super::types::{
    CommentSeverity, ExistingCommentThread, FileChange, InlineComment, PullRequestSnapshot,
    ResolutionCandidate, ReviewAction, ReviewHistoryEntry, ReviewMetadata, ReviewOutcome,
    ReviewResult, ThreadStatus, Verdict,
};
use super::validator::validate_comments;

/// Lines of context packed around a thread for resolution checks.
const RESOLUTION_CONTEXT_LINES: usize = 10;

// ── Action decision ──────────────────────────────────────────────

/// What kind of review (if any) this request should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    FullReview,
    ReReview,
    VoteOnly,
    Skip,
}

/// Pure decision over the PR snapshot and stored metadata.
pub fn decide(metadata: &ReviewMetadata, pr: &PullRequestSnapshot, add_reviewer_vote: bool) -> Action {
    if !metadata.has_previous_review() {
        Action::FullReview
    } else if !metadata
        .last_reviewed_source_commit
        .eq_ignore_ascii_case(&pr.source_commit)
    {
        Action::ReReview
    } else if metadata.was_draft && !pr.is_draft && !metadata.vote_submitted && add_reviewer_vote {
        Action::VoteOnly
    } else {
        Action::Skip
    }
}

// ── Progress sink ────────────────────────────────────────────────

/// Best-effort coarse progress notifications. Implementations must
/// never fail; the orchestrator does not await on them.
pub trait ProgressSink: Send + Sync {
    fn stage(&self, pr_id: i64, stage: &str);
}

/// Default sink: does nothing.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn stage(&self, _pr_id: i64, _stage: &str) {}
}

// ── Orchestrator ─────────────────────────────────────────────────

pub struct ReviewOrchestrator {
    store: Arc<dyn ReviewStateStore>,
    provider: Arc<dyn ReviewProvider>,
    rate_gate: Arc<RateGate>,
    progress: Arc<dyn ProgressSink>,
    organization: String,
    options: ReviewOptions,
    max_parallel: usize,
}

impl ReviewOrchestrator {
    pub fn new(
        store: Arc<dyn ReviewStateStore>,
        provider: Arc<dyn ReviewProvider>,
        rate_gate: Arc<RateGate>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            provider,
            rate_gate,
            progress: Arc::new(NoopProgress),
            organization: config.platform.organization.clone(),
            options: config.review.clone(),
            max_parallel: config.orchestration.max_parallel_reviews.max(1),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Run one review pass. Never returns an error; every failure is
    /// folded into the outcome.
    pub async fn run(&self, project: &str, repo: &str, pr_id: i64) -> ReviewOutcome {
        match self.run_inner(project, repo, pr_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(project, repo, pr_id, error = %format!("{e:#}"), "review failed");
                ReviewOutcome::error(format!("{e:#}"))
            }
        }
    }

    async fn run_inner(&self, project: &str, repo: &str, pr_id: i64) -> Result<ReviewOutcome> {
        let key = GateKey::new(&self.organization, project, repo, pr_id);
        let gate = self
            .rate_gate
            .check(&key, self.options.min_review_interval_minutes);
        if !gate.allowed {
            let next_allowed = Utc::now() + chrono::Duration::seconds(gate.seconds_remaining as i64);
            tracing::info!(%key, seconds_remaining = gate.seconds_remaining, "review rate-limited");
            return Ok(ReviewOutcome::rate_limited(
                format!(
                    "Review of PR {pr_id} is rate-limited; next allowed at {} ({} s remaining)",
                    next_allowed.format("%Y-%m-%d %H:%M:%S UTC"),
                    gate.seconds_remaining,
                ),
                gate.seconds_remaining,
            ));
        }

        let pr = self
            .store
            .get_pr(project, repo, pr_id)
            .await
            .context("loading pull request")?;
        let metadata = self
            .store
            .get_metadata(project, repo, pr_id)
            .await
            .context("loading review metadata")?;

        let action = decide(&metadata, &pr, self.options.add_reviewer_vote);
        tracing::info!(
            project,
            repo,
            pr_id,
            action = ?action,
            source_commit = %short_sha(&pr.source_commit),
            is_draft = pr.is_draft,
            "review action decided"
        );

        match action {
            Action::Skip => self.handle_skip(project, repo, &key, &pr).await,
            Action::VoteOnly => self.handle_vote_only(project, repo, &key, &pr, metadata).await,
            Action::FullReview | Action::ReReview => {
                self.handle_review(action, project, repo, &key, &pr, metadata).await
            }
        }
    }

    // ── Skip ─────────────────────────────────────────────────────

    async fn handle_skip(
        &self,
        project: &str,
        repo: &str,
        key: &GateKey,
        pr: &PullRequestSnapshot,
    ) -> Result<ReviewOutcome> {
        let history = self.store.get_history(project, repo, pr.pr_id).await?;
        let iteration = self
            .store
            .get_iteration_count(project, repo, pr.pr_id)
            .await
            .unwrap_or(0);

        let entry = ReviewHistoryEntry {
            review_number: history.len() as u32 + 1,
            reviewed_at_utc: Utc::now(),
            action: ReviewAction::Skipped,
            verdict: "No Changes".into(),
            source_commit: pr.source_commit.clone(),
            iteration,
            is_draft: pr.is_draft,
            inline_comments_posted: 0,
            files_changed: 0,
            vote: None,
            metrics: Default::default(),
        };

        if let Err(e) = self.store.append_history(project, repo, pr.pr_id, &entry).await {
            tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to append skip history entry");
        }
        self.update_description(project, repo, pr, &entry).await;
        self.rate_gate.record(key);

        Ok(ReviewOutcome::skipped(format!(
            "Commit {} of PR {} has already been reviewed; nothing to do.",
            short_sha(&pr.source_commit),
            pr.pr_id,
        )))
    }

    // ── Vote only ────────────────────────────────────────────────

    async fn handle_vote_only(
        &self,
        project: &str,
        repo: &str,
        key: &GateKey,
        pr: &PullRequestSnapshot,
        mut metadata: ReviewMetadata,
    ) -> Result<ReviewOutcome> {
        self.progress.stage(pr.pr_id, "voting");

        let vote = match self.store.add_reviewer_vote(project, repo, pr.pr_id, 5).await {
            Ok(()) => Some(5),
            Err(e) => {
                tracing::warn!(pr_id = pr.pr_id, error = %e, "draft-to-active vote failed");
                None
            }
        };

        let history = self.store.get_history(project, repo, pr.pr_id).await?;
        let review_number = history.len() as u32 + 1;

        metadata.vote_submitted = vote.is_some();
        metadata.was_draft = false;
        metadata.review_count = review_number;
        metadata.reviewed_at_utc = Some(Utc::now());
        if let Err(e) = self.store.set_metadata(project, repo, pr.pr_id, &metadata).await {
            tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to store vote-only metadata");
        }

        let entry = ReviewHistoryEntry {
            review_number,
            reviewed_at_utc: Utc::now(),
            action: ReviewAction::VoteOnly,
            verdict: Verdict::ApprovedWithSuggestions.as_str().into(),
            source_commit: pr.source_commit.clone(),
            iteration: metadata.last_reviewed_iteration,
            is_draft: false,
            inline_comments_posted: 0,
            files_changed: 0,
            vote,
            metrics: Default::default(),
        };
        if let Err(e) = self.store.append_history(project, repo, pr.pr_id, &entry).await {
            tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to append vote-only history entry");
        }
        self.update_description(project, repo, pr, &entry).await;
        self.rate_gate.record(key);

        Ok(ReviewOutcome {
            recommendation: Some("ApprovedWithSuggestions".into()),
            vote,
            summary: Some(format!(
                "Draft-to-active transition on PR {}: vote cast from the existing review.",
                pr.pr_id,
            )),
            ..ReviewOutcome::reviewed()
        })
    }

    // ── Full review / re-review ──────────────────────────────────

    async fn handle_review(
        &self,
        action: Action,
        project: &str,
        repo: &str,
        key: &GateKey,
        pr: &PullRequestSnapshot,
        metadata: ReviewMetadata,
    ) -> Result<ReviewOutcome> {
        let is_rereview = action == Action::ReReview;

        // Summary-comment pre-count; the display number survives a
        // metadata wipe because it is derived from posted threads.
        let summary_number = self
            .store
            .count_summary_comments(project, repo, pr.pr_id)
            .await
            .unwrap_or(0) as u32
            + 1;

        let iteration = self
            .store
            .get_iteration_count(project, repo, pr.pr_id)
            .await
            .unwrap_or(0);

        self.progress.stage(pr.pr_id, "fetching changes");
        let files = self
            .store
            .get_file_changes(project, repo, pr.pr_id, pr)
            .await
            .context("loading file changes")?;

        if files.is_empty() {
            return self
                .handle_empty_file_set(project, repo, key, pr, metadata, summary_number, iteration)
                .await;
        }

        self.progress.stage(pr.pr_id, "reviewing files");
        let merged = self.fan_out(pr, &files).await?;

        self.progress.stage(pr.pr_id, "validating comments");
        let (validated, stats) = validate_comments(merged.inline_comments.clone(), &files);
        tracing::info!(
            pr_id = pr.pr_id,
            input = stats.input,
            kept = stats.kept,
            dropped_unknown_path = stats.dropped_unknown_path,
            dropped_outside_changes = stats.dropped_outside_changes,
            dropped_false_positive = stats.dropped_false_positive,
            "inline comments validated"
        );

        let mut resolved_threads = 0usize;
        if is_rereview && self.options.auto_resolve_threads && !self.options.attribution_tag.is_empty()
        {
            self.progress.stage(pr.pr_id, "resolving prior threads");
            resolved_threads = self.resolve_prior_threads(project, repo, pr, &files).await;
        }

        self.progress.stage(pr.pr_id, "posting comments");
        let posted = self
            .post_inline_comments(project, repo, pr, &validated)
            .await;

        self.progress.stage(pr.pr_id, "posting summary");
        let summary_markdown = self.build_summary_markdown(
            action,
            summary_number,
            pr,
            &metadata,
            &merged,
            posted,
            resolved_threads,
            iteration,
        );
        if let Err(e) = self
            .store
            .post_comment_thread(project, repo, pr.pr_id, &summary_markdown, ThreadStatus::Closed)
            .await
        {
            tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to post summary thread");
        }

        // Vote only on non-draft PRs, and only when configured.
        let vote = if !pr.is_draft && self.options.add_reviewer_vote {
            match self
                .store
                .add_reviewer_vote(project, repo, pr.pr_id, merged.recommended_vote)
                .await
            {
                Ok(()) => Some(merged.recommended_vote),
                Err(e) => {
                    tracing::warn!(pr_id = pr.pr_id, error = %e, "reviewer vote failed");
                    None
                }
            }
        } else {
            None
        };

        self.persist_review(
            action, project, repo, pr, metadata, &merged, posted, vote, iteration,
        )
        .await;
        self.rate_gate.record(key);

        let (errors, warnings, infos) = severity_counts(&validated);
        Ok(ReviewOutcome {
            recommendation: Some(recommendation(merged.summary.verdict).into()),
            vote,
            issue_count: validated.len(),
            error_count: errors,
            warning_count: warnings,
            info_count: infos,
            summary: Some(format!(
                "{} {} posted for PR {}: {} inline comment(s), verdict {}.",
                if is_rereview { "Re-Review" } else { "Code Review" },
                summary_number,
                pr.pr_id,
                posted,
                merged.summary.verdict,
            )),
            ..ReviewOutcome::reviewed()
        })
    }

    /// No reviewable files: auto-approve without any LLM call.
    #[allow(clippy::too_many_arguments)]
    async fn handle_empty_file_set(
        &self,
        project: &str,
        repo: &str,
        key: &GateKey,
        pr: &PullRequestSnapshot,
        metadata: ReviewMetadata,
        summary_number: u32,
        iteration: i64,
    ) -> Result<ReviewOutcome> {
        let content = format!(
            "## Code Review (Review {summary_number}) -- PR {}\n\nNo reviewable file changes were found; approved automatically.",
            pr.pr_id,
        );
        if let Err(e) = self
            .store
            .post_comment_thread(project, repo, pr.pr_id, &content, ThreadStatus::Closed)
            .await
        {
            tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to post auto-approve summary");
        }

        let vote = if !pr.is_draft && self.options.add_reviewer_vote {
            match self.store.add_reviewer_vote(project, repo, pr.pr_id, 10).await {
                Ok(()) => Some(10),
                Err(e) => {
                    tracing::warn!(pr_id = pr.pr_id, error = %e, "auto-approve vote failed");
                    None
                }
            }
        } else {
            None
        };

        let mut merged = ReviewResult::approved("");
        merged.summary.description = "No reviewable files.".to_string();

        let action = if metadata.has_previous_review() {
            Action::ReReview
        } else {
            Action::FullReview
        };
        self.persist_review_with_verdict(
            action,
            project,
            repo,
            pr,
            metadata,
            &merged,
            "Approved (auto - no files)",
            0,
            vote,
            iteration,
        )
        .await;
        self.rate_gate.record(key);

        Ok(ReviewOutcome {
            recommendation: Some("Approved".into()),
            vote,
            summary: Some(format!("PR {} has no reviewable files; auto-approved.", pr.pr_id)),
            ..ReviewOutcome::reviewed()
        })
    }

    // ── Per-file fan-out ─────────────────────────────────────────

    /// Review every file with bounded concurrency and merge the
    /// results in input order. A failed file becomes a sentinel
    /// CONCERN entry; all files failing is fatal.
    async fn fan_out(&self, pr: &PullRequestSnapshot, files: &[FileChange]) -> Result<ReviewResult> {
        let total = files.len();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        let calls = files.iter().map(|file| {
            let semaphore = Arc::clone(&semaphore);
            let provider = Arc::clone(&self.provider);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                let outcome = provider.review_one(pr, file, total).await;
                (file, outcome)
            }
        });

        // join_all preserves input order, which fixes the merge order.
        let outcomes = join_all(calls).await;

        let mut results: Vec<ReviewResult> = Vec::with_capacity(total);
        let mut failures = 0usize;
        for (file, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(path = %file.path, error = %format!("{e:#}"), "per-file review failed, substituting sentinel");
                    results.push(sentinel_result(&file.path, &e));
                }
            }
        }

        if failures == total {
            anyhow::bail!("review failed for all {total} files; no provider output to post");
        }

        Ok(merge_file_results(results, files))
    }

    // ── Thread resolution ────────────────────────────────────────

    /// Re-review pass over prior AI threads: close what no longer
    /// applies, verify what sits on modified lines, leave the rest.
    async fn resolve_prior_threads(
        &self,
        project: &str,
        repo: &str,
        pr: &PullRequestSnapshot,
        files: &[FileChange],
    ) -> usize {
        let tag = self.options.attribution_tag.as_str();
        let threads = match self
            .store
            .get_existing_threads(project, repo, pr.pr_id, Some(tag))
            .await
        {
            Ok(threads) => threads,
            Err(e) => {
                tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to list prior threads");
                return 0;
            }
        };

        let mut resolved = 0usize;
        let mut batch: Vec<ResolutionCandidate> = Vec::new();

        for thread in threads.iter().filter(|t| t.status == ThreadStatus::Active) {
            let Some(path) = thread.path.as_deref() else {
                continue;
            };
            let file = files.iter().find(|f| f.path.eq_ignore_ascii_case(path));

            match file {
                None => {
                    // The file is no longer touched by the PR; the
                    // concern was addressed or the file vanished.
                    if self.mark_fixed(project, repo, pr.pr_id, thread.thread_id).await {
                        resolved += 1;
                    }
                }
                Some(fc) => {
                    let span = super::types::LineRange::new(thread.start_line, thread.end_line);
                    let touched = fc
                        .changed_line_ranges
                        .iter()
                        .any(|r| r.overlaps_within(&span, 0));
                    if !touched {
                        // Nothing to verify; the lines did not change.
                        continue;
                    }
                    let context = fc
                        .modified_content
                        .as_deref()
                        .map(|content| context_window(content, thread.start_line, thread.end_line))
                        .unwrap_or_default();
                    batch.push(ResolutionCandidate {
                        thread_id: thread.thread_id,
                        path: path.to_string(),
                        comment: thread.content.clone(),
                        code_context: context,
                    });
                }
            }
        }

        if batch.is_empty() {
            return resolved;
        }

        // Never auto-close on uncertain evidence: a failed call
        // leaves every candidate active.
        let verdicts = match self.provider.verify_resolutions(&batch).await {
            Ok(verdicts) => verdicts,
            Err(e) => {
                tracing::warn!(pr_id = pr.pr_id, error = %format!("{e:#}"), "resolution verification failed; leaving threads active");
                Vec::new()
            }
        };

        for verdict in verdicts.iter().filter(|v| v.is_fixed) {
            tracing::info!(
                pr_id = pr.pr_id,
                thread_id = verdict.thread_id,
                reasoning = %verdict.reasoning,
                "prior comment verified as fixed"
            );
            if self.mark_fixed(project, repo, pr.pr_id, verdict.thread_id).await {
                resolved += 1;
            }
        }
        resolved
    }

    async fn mark_fixed(&self, project: &str, repo: &str, pr_id: i64, thread_id: i64) -> bool {
        match self
            .store
            .update_thread_status(project, repo, pr_id, thread_id, ThreadStatus::Fixed)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pr_id, thread_id, error = %e, "failed to mark thread fixed");
                false
            }
        }
    }

    // ── Posting ──────────────────────────────────────────────────

    /// Post validated comments, skipping any that already exist with
    /// the same path, lines and content (tagged or untagged form).
    async fn post_inline_comments(
        &self,
        project: &str,
        repo: &str,
        pr: &PullRequestSnapshot,
        comments: &[InlineComment],
    ) -> usize {
        if comments.is_empty() {
            return 0;
        }
        let existing = match self
            .store
            .get_existing_threads(project, repo, pr.pr_id, None)
            .await
        {
            Ok(threads) => threads,
            Err(e) => {
                tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to list threads for dedup; posting all");
                Vec::new()
            }
        };

        let mut posted = 0usize;
        for comment in comments {
            let core = comment.core_content();
            let tagged = self.tagged_content(&core);

            if is_duplicate(&existing, comment, &core, &tagged) {
                tracing::debug!(
                    pr_id = pr.pr_id,
                    path = %comment.path,
                    start = comment.start_line,
                    "skipping duplicate inline comment"
                );
                continue;
            }

            match self
                .store
                .post_inline_comment_thread(
                    project,
                    repo,
                    pr.pr_id,
                    &comment.path,
                    comment.start_line,
                    comment.end_line,
                    &tagged,
                    ThreadStatus::Active,
                )
                .await
            {
                Ok(()) => posted += 1,
                Err(e) => {
                    tracing::warn!(pr_id = pr.pr_id, path = %comment.path, error = %e, "failed to post inline comment");
                }
            }
        }
        posted
    }

    fn tagged_content(&self, core: &str) -> String {
        if self.options.attribution_tag.is_empty() {
            core.to_string()
        } else {
            format!("{core}\n\n_[{}]_", self.options.attribution_tag)
        }
    }

    // ── Summary thread ───────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn build_summary_markdown(
        &self,
        action: Action,
        summary_number: u32,
        pr: &PullRequestSnapshot,
        prior: &ReviewMetadata,
        merged: &ReviewResult,
        posted: usize,
        resolved_threads: usize,
        iteration: i64,
    ) -> String {
        let mut out = String::new();
        let header = if action == Action::ReReview {
            "Re-Review"
        } else {
            "Code Review"
        };
        out.push_str(&format!("## {header} (Review {summary_number}) -- PR {}\n\n", pr.pr_id));

        if action == Action::ReReview {
            let prior_vote = if prior.vote_submitted { "vote cast" } else { "no vote" };
            let draft_badge = if prior.was_draft { ", draft" } else { "" };
            let when = prior
                .reviewed_at_utc
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "unknown time".into());
            out.push_str(&format!(
                "> Previous review: {when}, commit {}, iteration {}, {prior_vote}{draft_badge}\n\n",
                short_sha(&prior.last_reviewed_source_commit),
                prior.last_reviewed_iteration,
            ));
            if resolved_threads > 0 {
                out.push_str(&format!(
                    "> {resolved_threads} earlier comment(s) verified as addressed and closed.\n\n"
                ));
            }
        }

        let s = &merged.summary;
        out.push_str("### Summary\n\n");
        out.push_str(&format!(
            "{} file(s) changed ({} edited, {} added, {} deleted), iteration {iteration}.\n\n{}\n\n",
            s.files_changed, s.edits_count, s.adds_count, s.deletes_count, s.description,
        ));

        let flagged: Vec<_> = merged
            .file_reviews
            .iter()
            .filter(|f| {
                let v = f.verdict.to_ascii_uppercase();
                v == "CONCERN" || v == "REJECTED" || f.review_text.contains("AI review failed")
            })
            .collect();
        if !flagged.is_empty() {
            out.push_str("### Code Changes Review\n\n");
            for file in flagged {
                out.push_str(&format!("- **{}** ({}): {}\n", file.path, file.verdict, file.review_text));
            }
            out.push('\n');
        }

        if !merged.observations.is_empty() {
            out.push_str("### Observations\n\n");
            for obs in &merged.observations {
                out.push_str(&format!("- {obs}\n"));
            }
            out.push('\n');
        }

        out.push_str(&format!("### Verdict: **{}**\n\n{}\n", s.verdict, s.verdict_justification));
        if posted > 0 {
            out.push_str(&format!("\n{posted} inline comment(s) posted.\n"));
        }
        out
    }

    // ── Persistence ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn persist_review(
        &self,
        action: Action,
        project: &str,
        repo: &str,
        pr: &PullRequestSnapshot,
        metadata: ReviewMetadata,
        merged: &ReviewResult,
        posted: usize,
        vote: Option<i32>,
        iteration: i64,
    ) {
        self.persist_review_with_verdict(
            action,
            project,
            repo,
            pr,
            metadata,
            merged,
            merged.summary.verdict.as_str(),
            posted,
            vote,
            iteration,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_review_with_verdict(
        &self,
        action: Action,
        project: &str,
        repo: &str,
        pr: &PullRequestSnapshot,
        mut metadata: ReviewMetadata,
        merged: &ReviewResult,
        verdict: &str,
        posted: usize,
        vote: Option<i32>,
        iteration: i64,
    ) {
        let pr_id = pr.pr_id;
        let history = match self.store.get_history(project, repo, pr_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(pr_id, error = %e, "failed to read history; numbering from metadata");
                Vec::new()
            }
        };
        let review_number = history.len() as u32 + 1;

        metadata.last_reviewed_source_commit = pr.source_commit.clone();
        metadata.last_reviewed_target_commit = pr.target_commit.clone();
        metadata.last_reviewed_iteration = iteration;
        metadata.was_draft = pr.is_draft;
        metadata.reviewed_at_utc = Some(Utc::now());
        metadata.vote_submitted = vote.is_some();
        metadata.review_count = review_number;
        if let Err(e) = self.store.set_metadata(project, repo, pr_id, &metadata).await {
            tracing::warn!(pr_id, error = %e, "failed to store review metadata");
        }

        // Idempotent decorative tag.
        match self.store.has_review_tag(project, repo, pr_id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.store.add_review_tag(project, repo, pr_id).await {
                    tracing::warn!(pr_id, error = %e, "failed to add review tag");
                }
            }
            Err(e) => {
                tracing::warn!(pr_id, error = %e, "failed to query review tag");
            }
        }

        let entry = ReviewHistoryEntry {
            review_number,
            reviewed_at_utc: Utc::now(),
            action: if action == Action::ReReview {
                ReviewAction::ReReview
            } else {
                ReviewAction::FullReview
            },
            verdict: verdict.to_string(),
            source_commit: pr.source_commit.clone(),
            iteration,
            is_draft: pr.is_draft,
            inline_comments_posted: posted,
            files_changed: merged.summary.files_changed,
            vote,
            metrics: merged.metrics.clone(),
        };
        if let Err(e) = self.store.append_history(project, repo, pr_id, &entry).await {
            tracing::warn!(pr_id, error = %e, "failed to append history entry");
        }
        self.update_description(project, repo, pr, &entry).await;
    }

    /// Peripheral: a failed description write never fails the review.
    async fn update_description(
        &self,
        project: &str,
        repo: &str,
        pr: &PullRequestSnapshot,
        entry: &ReviewHistoryEntry,
    ) {
        let updated = append_history_row(&pr.description, entry);
        if let Err(e) = self
            .store
            .update_pr_description(project, repo, pr.pr_id, &updated)
            .await
        {
            tracing::warn!(pr_id = pr.pr_id, error = %e, "failed to update PR description history table");
        }
    }
}

// ── Merge helpers ────────────────────────────────────────────────

/// Sentinel result for a file whose review call failed.
fn sentinel_result(path: &str, error: &anyhow::Error) -> ReviewResult {
    let mut result = ReviewResult::approved("");
    result.file_reviews.push(super::types::FileReview {
        path: path.to_string(),
        verdict: "CONCERN".into(),
        review_text: format!("AI review failed: {error:#}"),
    });
    result
}

/// Merge per-file results in input order into one review.
fn merge_file_results(results: Vec<ReviewResult>, files: &[FileChange]) -> ReviewResult {
    let mut merged = ReviewResult::approved("");
    merged.summary.files_changed = files.len();

    let mut model_names: Vec<String> = Vec::new();
    let mut worst: Option<&ReviewResult> = None;

    for result in &results {
        if worst.map_or(true, |w| result.summary.verdict > w.summary.verdict) {
            worst = Some(result);
        }
        merged.summary.edits_count += result.summary.edits_count;
        merged.summary.adds_count += result.summary.adds_count;
        merged.summary.deletes_count += result.summary.deletes_count;
        merged.summary.verdict = merged.summary.verdict.worse(result.summary.verdict);
        merged.recommended_vote = merged.recommended_vote.min(result.recommended_vote);

        merged.inline_comments.extend(result.inline_comments.iter().cloned());
        merged.file_reviews.extend(result.file_reviews.iter().cloned());
        for obs in &result.observations {
            if !merged.observations.iter().any(|o| o.eq_ignore_ascii_case(obs)) {
                merged.observations.push(obs.clone());
            }
        }

        merged.metrics.prompt_tokens += result.metrics.prompt_tokens;
        merged.metrics.completion_tokens += result.metrics.completion_tokens;
        merged.metrics.total_tokens += result.metrics.total_tokens;
        merged.metrics.ai_duration_ms += result.metrics.ai_duration_ms;
        if !result.metrics.model_name.is_empty()
            && !model_names.contains(&result.metrics.model_name)
        {
            model_names.push(result.metrics.model_name.clone());
        }
    }

    if let Some(worst) = worst {
        merged.summary.description = worst.summary.description.clone();
        merged.summary.verdict_justification = worst.summary.verdict_justification.clone();
    }
    merged.metrics.model_name = model_names.join("+");
    merged
}

/// ±10-line window of current code around a 1-based range.
fn context_window(content: &str, start: usize, end: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let lo = start.saturating_sub(RESOLUTION_CONTEXT_LINES + 1);
    let hi = (end + RESOLUTION_CONTEXT_LINES).min(lines.len());
    lines[lo..hi].join("\n")
}

fn is_duplicate(
    existing: &[ExistingCommentThread],
    comment: &InlineComment,
    core: &str,
    tagged: &str,
) -> bool {
    existing.iter().any(|t| {
        t.path
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(&comment.path))
            && t.start_line == comment.start_line
            && t.end_line == comment.end_line
            && (t.content == tagged || t.content == core)
    })
}

fn severity_counts(comments: &[InlineComment]) -> (usize, usize, usize) {
    let mut errors = 0;
    let mut warnings = 0;
    let mut infos = 0;
    for comment in comments {
        match comment.lead_in.severity() {
            CommentSeverity::Error => errors += 1,
            CommentSeverity::Warning => warnings += 1,
            CommentSeverity::Info => infos += 1,
        }
    }
    (errors, warnings, infos)
}

fn recommendation(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Approved => "Approved",
        Verdict::ApprovedWithSuggestions => "ApprovedWithSuggestions",
        Verdict::NeedsWork => "NeedsWork",
        Verdict::Rejected => "Rejected",
    }
}
