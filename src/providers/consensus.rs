//! Multi-provider consensus review.
//!
//! Wraps N named providers behind the same [`ReviewProvider`] port:
//! every call fans out to all of them in parallel, failures are
//! isolated per provider, and the surviving results are merged into
//! one authoritative review. Inline comments only survive when enough
//! distinct providers independently flagged overlapping lines.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;

use crate::review::types::{
    FileChange, FileReview, InlineComment, PullRequestSnapshot, ResolutionCandidate,
    ResolutionVerdict, ReviewResult,
};

use super::ReviewProvider;

/// Line tolerance when deciding that two comments talk about the
/// same spot.
const OVERLAP_TOLERANCE: usize = 3;

pub struct ConsensusProvider {
    providers: Vec<Arc<dyn ReviewProvider>>,
    threshold: usize,
    display_name: String,
}

impl ConsensusProvider {
    /// `threshold` is clamped into `[1, N]`.
    pub fn new(providers: Vec<Arc<dyn ReviewProvider>>, threshold: usize) -> Self {
        assert!(!providers.is_empty(), "consensus needs at least one provider");
        let threshold = threshold.clamp(1, providers.len());
        let display_name = providers
            .iter()
            .map(|p| p.display_name())
            .collect::<Vec<_>>()
            .join("+");
        Self {
            providers,
            threshold,
            display_name,
        }
    }

    /// Split per-provider outcomes into survivors, or fail with an
    /// aggregate error when nobody survived.
    fn survivors<T>(&self, outcomes: Vec<(String, Result<T>)>) -> Result<Vec<(String, T)>> {
        let mut ok = Vec::new();
        let mut errors = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(value) => ok.push((name, value)),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider call failed, continuing without it");
                    errors.push(format!("{name}: {e:#}"));
                }
            }
        }
        if ok.is_empty() {
            bail!("all {} providers failed: {}", self.providers.len(), errors.join("; "));
        }
        Ok(ok)
    }
}

#[async_trait]
impl ReviewProvider for ConsensusProvider {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn review_all(
        &self,
        pr: &PullRequestSnapshot,
        files: &[FileChange],
    ) -> Result<ReviewResult> {
        let calls = self.providers.iter().map(|p| async move {
            (p.display_name().to_string(), p.review_all(pr, files).await)
        });
        let surviving = self.survivors(join_all(calls).await)?;
        Ok(merge_results(surviving, self.threshold))
    }

    async fn review_one(
        &self,
        pr: &PullRequestSnapshot,
        file: &FileChange,
        total_files: usize,
    ) -> Result<ReviewResult> {
        let calls = self.providers.iter().map(|p| async move {
            (
                p.display_name().to_string(),
                p.review_one(pr, file, total_files).await,
            )
        });
        let surviving = self.survivors(join_all(calls).await)?;
        Ok(merge_results(surviving, self.threshold))
    }

    async fn verify_resolutions(
        &self,
        candidates: &[ResolutionCandidate],
    ) -> Result<Vec<ResolutionVerdict>> {
        let calls = self.providers.iter().map(|p| async move {
            (
                p.display_name().to_string(),
                p.verify_resolutions(candidates).await,
            )
        });
        let surviving = self.survivors(join_all(calls).await)?;
        Ok(majority_verdicts(candidates, &surviving))
    }
}

// ── Result merge ─────────────────────────────────────────────────

/// Merge surviving provider results into one review.
fn merge_results(surviving: Vec<(String, ReviewResult)>, threshold: usize) -> ReviewResult {
    let provider_count = surviving.len();

    // Winning summary: the most severe verdict among survivors.
    let winner = surviving
        .iter()
        .map(|(_, r)| r)
        .max_by_key(|r| r.summary.verdict)
        .expect("survivors are non-empty");
    let mut summary = winner.summary.clone();
    summary.description = format!(
        "[Consensus from {provider_count} providers] {}",
        summary.description
    );

    let recommended_vote = surviving
        .iter()
        .map(|(_, r)| r.recommended_vote)
        .min()
        .expect("survivors are non-empty");

    let inline_comments = merge_comments(&surviving, threshold);
    let file_reviews = merge_file_reviews(&surviving);

    // Observations: case-insensitive union, first spelling wins.
    let mut observations: Vec<String> = Vec::new();
    for (_, result) in &surviving {
        for obs in &result.observations {
            if !observations.iter().any(|o| o.eq_ignore_ascii_case(obs)) {
                observations.push(obs.clone());
            }
        }
    }

    // Token counts sum; duration is the slowest provider since the
    // calls ran in parallel.
    let mut metrics = crate::review::types::ReviewMetrics {
        model_name: surviving
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join("+"),
        ..Default::default()
    };
    for (_, result) in &surviving {
        metrics.prompt_tokens += result.metrics.prompt_tokens;
        metrics.completion_tokens += result.metrics.completion_tokens;
        metrics.total_tokens += result.metrics.total_tokens;
        metrics.ai_duration_ms = metrics.ai_duration_ms.max(result.metrics.ai_duration_ms);
    }

    ReviewResult {
        summary,
        file_reviews,
        inline_comments,
        observations,
        recommended_vote,
        metrics,
    }
}

/// Whether two comments talk about the same spot: same path
/// (case-insensitive) and ranges intersecting within ±3 lines.
fn comments_overlap(a: &InlineComment, b: &InlineComment) -> bool {
    a.path.eq_ignore_ascii_case(&b.path) && a.range().overlaps_within(&b.range(), OVERLAP_TOLERANCE)
}

/// Greedy overlap clustering over the pooled comments. A cluster is
/// kept when it contains at least `threshold` distinct providers; the
/// anchor comment represents it, prefixed with the provider list.
fn merge_comments(surviving: &[(String, ReviewResult)], threshold: usize) -> Vec<InlineComment> {
    let pool: Vec<(&str, &InlineComment)> = surviving
        .iter()
        .flat_map(|(name, r)| r.inline_comments.iter().map(move |c| (name.as_str(), c)))
        .collect();

    let mut used = vec![false; pool.len()];
    let mut merged = Vec::new();

    for anchor_idx in 0..pool.len() {
        if used[anchor_idx] {
            continue;
        }
        used[anchor_idx] = true;
        let (anchor_provider, anchor) = pool[anchor_idx];
        let mut cluster_providers = vec![anchor_provider];

        for other_idx in anchor_idx + 1..pool.len() {
            if used[other_idx] {
                continue;
            }
            let (other_provider, other) = pool[other_idx];
            if other_provider != anchor_provider && comments_overlap(anchor, other) {
                used[other_idx] = true;
                if !cluster_providers.contains(&other_provider) {
                    cluster_providers.push(other_provider);
                }
            }
        }

        if cluster_providers.len() >= threshold {
            let mut representative = anchor.clone();
            representative.comment =
                format!("[{}] {}", cluster_providers.join("+"), representative.comment);
            merged.push(representative);
        }
    }

    merged
}

/// Rank for the free-form per-file verdict strings.
fn file_verdict_rank(verdict: &str) -> u8 {
    match verdict.to_ascii_uppercase().as_str() {
        "REJECTED" => 2,
        "CONCERN" => 1,
        _ => 0,
    }
}

/// Union of per-file reviews, keeping the most severe verdict per
/// path.
fn merge_file_reviews(surviving: &[(String, ReviewResult)]) -> Vec<FileReview> {
    let mut by_path: Vec<FileReview> = Vec::new();
    for (_, result) in surviving {
        for review in &result.file_reviews {
            match by_path
                .iter_mut()
                .find(|r| r.path.eq_ignore_ascii_case(&review.path))
            {
                Some(existing) => {
                    if file_verdict_rank(&review.verdict) > file_verdict_rank(&existing.verdict) {
                        *existing = review.clone();
                    }
                }
                None => by_path.push(review.clone()),
            }
        }
    }
    by_path
}

// ── Verification majority ────────────────────────────────────────

/// Strict-majority election over per-provider resolution verdicts.
fn majority_verdicts(
    candidates: &[ResolutionCandidate],
    surviving: &[(String, Vec<ResolutionVerdict>)],
) -> Vec<ResolutionVerdict> {
    let mut votes: HashMap<i64, Vec<(&str, &ResolutionVerdict)>> = HashMap::new();
    for (name, verdicts) in surviving {
        for verdict in verdicts {
            votes
                .entry(verdict.thread_id)
                .or_default()
                .push((name.as_str(), verdict));
        }
    }

    candidates
        .iter()
        .map(|candidate| {
            let cast = votes.get(&candidate.thread_id).map(Vec::as_slice).unwrap_or(&[]);
            let total = cast.len();
            let fixed = cast.iter().filter(|(_, v)| v.is_fixed).count();
            let reasons = cast
                .iter()
                .filter(|(_, v)| !v.reasoning.is_empty())
                .map(|(name, v)| format!("{name}: {}", v.reasoning))
                .collect::<Vec<_>>()
                .join(" | ");
            ResolutionVerdict {
                thread_id: candidate.thread_id,
                is_fixed: fixed * 2 > total,
                reasoning: format!("Consensus: {fixed}/{total} providers say fixed. {reasons}"),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::types::{
        ChangeType, CommentState, LeadIn, LineRange, ReviewMetrics, ReviewSummary, Verdict,
    };
    use chrono::Utc;
    use parking_lot::Mutex;

    // ── Fakes ────────────────────────────────────────────────────

    struct FakeProvider {
        name: String,
        review: Option<ReviewResult>,
        resolutions: Option<Vec<ResolutionVerdict>>,
        calls: Mutex<usize>,
    }

    impl FakeProvider {
        fn ok(name: &str, review: ReviewResult) -> Arc<dyn ReviewProvider> {
            Arc::new(Self {
                name: name.into(),
                review: Some(review),
                resolutions: Some(Vec::new()),
                calls: Mutex::new(0),
            })
        }

        fn failing(name: &str) -> Arc<dyn ReviewProvider> {
            Arc::new(Self {
                name: name.into(),
                review: None,
                resolutions: None,
                calls: Mutex::new(0),
            })
        }

        fn voting(name: &str, verdicts: Vec<ResolutionVerdict>) -> Arc<dyn ReviewProvider> {
            Arc::new(Self {
                name: name.into(),
                review: None,
                resolutions: Some(verdicts),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ReviewProvider for FakeProvider {
        fn display_name(&self) -> &str {
            &self.name
        }

        async fn review_all(
            &self,
            _pr: &PullRequestSnapshot,
            _files: &[FileChange],
        ) -> Result<ReviewResult> {
            *self.calls.lock() += 1;
            self.review.clone().ok_or_else(|| anyhow::anyhow!("boom from {}", self.name))
        }

        async fn review_one(
            &self,
            pr: &PullRequestSnapshot,
            file: &FileChange,
            _total: usize,
        ) -> Result<ReviewResult> {
            self.review_all(pr, std::slice::from_ref(file)).await
        }

        async fn verify_resolutions(
            &self,
            _candidates: &[ResolutionCandidate],
        ) -> Result<Vec<ResolutionVerdict>> {
            self.resolutions
                .clone()
                .ok_or_else(|| anyhow::anyhow!("verify boom from {}", self.name))
        }
    }

    fn pr() -> PullRequestSnapshot {
        PullRequestSnapshot {
            pr_id: 1,
            title: "t".into(),
            description: String::new(),
            source_branch: "s".into(),
            target_branch: "m".into(),
            author: "a".into(),
            created_at: Utc::now(),
            is_draft: false,
            source_commit: "c1".into(),
            target_commit: "c2".into(),
            reviewers: vec![],
        }
    }

    fn file() -> FileChange {
        FileChange {
            path: "src/a.rs".into(),
            change_type: ChangeType::Edit,
            original_content: Some(String::new()),
            modified_content: Some("x\n".into()),
            unified_diff: None,
            changed_line_ranges: vec![LineRange::new(1, 1)],
        }
    }

    fn inline(path: &str, start: usize, end: usize, text: &str) -> InlineComment {
        InlineComment {
            path: path.into(),
            start_line: start,
            end_line: end,
            lead_in: LeadIn::Concern,
            comment: text.into(),
            code_snippet: None,
            status: CommentState::Active,
        }
    }

    fn result(verdict: Verdict, vote: i32, comments: Vec<InlineComment>) -> ReviewResult {
        ReviewResult {
            summary: ReviewSummary {
                description: "desc".into(),
                verdict,
                ..Default::default()
            },
            file_reviews: vec![],
            inline_comments: comments,
            observations: vec![],
            recommended_vote: vote,
            metrics: ReviewMetrics {
                model_name: "m".into(),
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
                ai_duration_ms: 800,
            },
        }
    }

    // ── Tests ────────────────────────────────────────────────────

    #[tokio::test]
    async fn overlapping_comments_merge_with_provenance() {
        let a = FakeProvider::ok(
            "ProviderA",
            result(Verdict::NeedsWork, 5, vec![inline("src/a.rs", 5, 10, "too deep")]),
        );
        let b = FakeProvider::ok(
            "ProviderB",
            result(Verdict::ApprovedWithSuggestions, -5, vec![inline("SRC/A.RS", 6, 11, "nesting")]),
        );
        let consensus = ConsensusProvider::new(vec![a, b], 2);

        let merged = consensus.review_all(&pr(), &[file()]).await.unwrap();
        assert_eq!(merged.inline_comments.len(), 1);
        assert!(merged.inline_comments[0].comment.starts_with("[ProviderA+ProviderB] "));
        // Harsher verdict and most critical vote win.
        assert_eq!(merged.summary.verdict, Verdict::NeedsWork);
        assert_eq!(merged.recommended_vote, -5);
        assert!(merged.summary.description.starts_with("[Consensus from 2 providers] "));
        // Tokens sum; duration is the max.
        assert_eq!(merged.metrics.total_tokens, 300);
        assert_eq!(merged.metrics.ai_duration_ms, 800);
        assert_eq!(merged.metrics.model_name, "ProviderA+ProviderB");
    }

    #[tokio::test]
    async fn threshold_one_keeps_every_comment() {
        let a = FakeProvider::ok(
            "A",
            result(Verdict::Approved, 10, vec![inline("src/a.rs", 5, 5, "x")]),
        );
        let b = FakeProvider::ok(
            "B",
            result(Verdict::Approved, 10, vec![inline("src/a.rs", 90, 90, "y")]),
        );
        let consensus = ConsensusProvider::new(vec![a, b], 1);

        let merged = consensus.review_all(&pr(), &[file()]).await.unwrap();
        assert_eq!(merged.inline_comments.len(), 2);
        assert!(merged.inline_comments.iter().all(|c| c.comment.starts_with('[')));
    }

    #[tokio::test]
    async fn threshold_n_requires_unanimity() {
        let a = FakeProvider::ok(
            "A",
            result(
                Verdict::Approved,
                10,
                vec![inline("src/a.rs", 5, 5, "shared"), inline("src/a.rs", 50, 50, "solo")],
            ),
        );
        let b = FakeProvider::ok(
            "B",
            result(Verdict::Approved, 10, vec![inline("src/a.rs", 6, 6, "shared too")]),
        );
        let consensus = ConsensusProvider::new(vec![a, b], 2);

        let merged = consensus.review_all(&pr(), &[file()]).await.unwrap();
        assert_eq!(merged.inline_comments.len(), 1);
        assert!(merged.inline_comments[0].comment.contains("shared"));
    }

    #[tokio::test]
    async fn same_provider_duplicates_do_not_cluster() {
        let a = FakeProvider::ok(
            "A",
            result(
                Verdict::Approved,
                10,
                vec![inline("src/a.rs", 5, 5, "first"), inline("src/a.rs", 6, 6, "second")],
            ),
        );
        let b = FakeProvider::ok("B", result(Verdict::Approved, 10, vec![]));
        let consensus = ConsensusProvider::new(vec![a, b], 2);

        let merged = consensus.review_all(&pr(), &[file()]).await.unwrap();
        // One provider flagging twice is not consensus.
        assert!(merged.inline_comments.is_empty());
    }

    #[tokio::test]
    async fn failed_provider_is_isolated() {
        let a = FakeProvider::ok(
            "A",
            result(Verdict::NeedsWork, -5, vec![inline("src/a.rs", 5, 5, "x")]),
        );
        let b = FakeProvider::failing("B");
        let consensus = ConsensusProvider::new(vec![a, b], 1);

        let merged = consensus.review_all(&pr(), &[file()]).await.unwrap();
        assert_eq!(merged.summary.verdict, Verdict::NeedsWork);
        assert!(merged.summary.description.starts_with("[Consensus from 1 providers] "));
    }

    #[tokio::test]
    async fn all_failed_is_aggregate_error() {
        let consensus =
            ConsensusProvider::new(vec![FakeProvider::failing("A"), FakeProvider::failing("B")], 1);
        let err = consensus.review_all(&pr(), &[file()]).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("all 2 providers failed"));
        assert!(msg.contains("A:"));
        assert!(msg.contains("B:"));
    }

    #[tokio::test]
    async fn verification_strict_majority() {
        let vote = |id: i64, fixed: bool, why: &str| ResolutionVerdict {
            thread_id: id,
            is_fixed: fixed,
            reasoning: why.into(),
        };
        let a = FakeProvider::voting("A", vec![vote(1, true, "ra1"), vote(2, false, "ra2")]);
        let b = FakeProvider::voting("B", vec![vote(1, true, "rb1"), vote(2, true, "rb2")]);
        let c = FakeProvider::voting("C", vec![vote(1, false, "rc1"), vote(2, false, "rc2")]);
        let consensus = ConsensusProvider::new(vec![a, b, c], 2);

        let candidates = vec![
            ResolutionCandidate {
                thread_id: 1,
                path: "a".into(),
                comment: "x".into(),
                code_context: String::new(),
            },
            ResolutionCandidate {
                thread_id: 2,
                path: "b".into(),
                comment: "y".into(),
                code_context: String::new(),
            },
        ];
        let verdicts = consensus.verify_resolutions(&candidates).await.unwrap();

        let one = verdicts.iter().find(|v| v.thread_id == 1).unwrap();
        assert!(one.is_fixed);
        assert!(one.reasoning.starts_with("Consensus: 2/3 providers say fixed. "));
        assert!(one.reasoning.contains("ra1"));
        assert!(one.reasoning.contains(" | "));

        let two = verdicts.iter().find(|v| v.thread_id == 2).unwrap();
        assert!(!two.is_fixed);
        assert!(two.reasoning.starts_with("Consensus: 1/3 providers say fixed. "));
    }

    #[tokio::test]
    async fn candidate_with_no_votes_defaults_unfixed() {
        let a = FakeProvider::voting("A", vec![]);
        let consensus = ConsensusProvider::new(vec![a], 1);
        let candidates = vec![ResolutionCandidate {
            thread_id: 7,
            path: "p".into(),
            comment: "c".into(),
            code_context: String::new(),
        }];
        let verdicts = consensus.verify_resolutions(&candidates).await.unwrap();
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].is_fixed);
        assert!(verdicts[0].reasoning.starts_with("Consensus: 0/0"));
    }

    #[test]
    fn threshold_is_clamped() {
        let a = FakeProvider::ok("A", result(Verdict::Approved, 10, vec![]));
        let consensus = ConsensusProvider::new(vec![a], 99);
        assert_eq!(consensus.threshold, 1);
    }

    #[test]
    fn overlap_is_reflexive_and_symmetric() {
        let a = inline("f", 5, 10, "a");
        let b = inline("F", 13, 14, "b");
        assert!(comments_overlap(&a, &a));
        assert_eq!(comments_overlap(&a, &b), comments_overlap(&b, &a));
    }
}
