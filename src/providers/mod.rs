//! LLM review providers.
//!
//! The orchestrator talks to a single [`ReviewProvider`]; that port
//! has two concrete shapes: a direct transport ([`OpenAiProvider`],
//! [`AnthropicProvider`]) or a [`ConsensusProvider`] composing several
//! transports. Construction is driven by the configuration registry;
//! unknown type tags fail with a precise message.

pub mod anthropic;
pub mod consensus;
pub mod openai;
mod prompt;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{Config, ProviderEntry, ReviewMode};
use crate::review::types::{
    ChangeType, CommentState, FileChange, FileReview, InlineComment, LeadIn, PullRequestSnapshot,
    ResolutionCandidate, ResolutionVerdict, ReviewResult, ReviewSummary, Verdict, normalize_vote,
};

pub use anthropic::AnthropicProvider;
pub use consensus::ConsensusProvider;
pub use openai::OpenAiProvider;

/// Retries after the first attempt on HTTP 429.
const MAX_RETRIES: u32 = 3;

/// Base delay for the exponential back-off.
const RETRY_BASE_MS: u64 = 500;

/// Per-call transport timeout.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ── Provider port ────────────────────────────────────────────────

/// Contract for a single LLM reviewer.
///
/// Implementors must keep `recommended_vote` in `{10, 5, -5, -10}`,
/// verdicts in the four legal strings (illegal input collapses to
/// APPROVED), every inline-comment path inside the given file set,
/// and `start_line ≤ end_line ≥ 1`. A call may fail; callers
/// tolerate per-call failure.
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// Stable display name used in provenance prefixes and metrics.
    fn display_name(&self) -> &str;

    /// Review the whole PR in one call.
    async fn review_all(
        &self,
        pr: &PullRequestSnapshot,
        files: &[FileChange],
    ) -> Result<ReviewResult>;

    /// Review a single file, knowing how many files the PR touches.
    async fn review_one(
        &self,
        pr: &PullRequestSnapshot,
        file: &FileChange,
        total_files: usize,
    ) -> Result<ReviewResult>;

    /// Judge whether prior comments have been addressed by the
    /// current code.
    async fn verify_resolutions(
        &self,
        candidates: &[ResolutionCandidate],
    ) -> Result<Vec<ResolutionVerdict>>;
}

// ── Construction ─────────────────────────────────────────────────

/// Build one transport from a registry entry.
pub fn build_transport(entry: &ProviderEntry) -> Result<Arc<dyn ReviewProvider>> {
    match entry.provider_type.as_str() {
        "azure-openai" => Ok(Arc::new(OpenAiProvider::azure(entry)?)),
        "openai" => Ok(Arc::new(OpenAiProvider::openai(entry)?)),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(entry)?)),
        other => bail!(
            "unknown provider type '{other}' for '{}'; expected one of: azure-openai, openai, anthropic",
            entry.display_name
        ),
    }
}

/// Build the provider the orchestrator will use, honoring the
/// configured mode.
pub fn build_provider(config: &Config) -> Result<Arc<dyn ReviewProvider>> {
    let enabled: Vec<&ProviderEntry> =
        config.providers.iter().filter(|p| p.enabled).collect();
    if enabled.is_empty() {
        bail!("no enabled providers configured");
    }

    match config.orchestration.mode {
        ReviewMode::Single => {
            let key = &config.orchestration.active_provider;
            let entry = enabled
                .iter()
                .find(|p| &p.key == key)
                .with_context(|| format!("active provider '{key}' is not an enabled provider"))?;
            build_transport(entry)
        }
        ReviewMode::Consensus => {
            let mut inner = Vec::with_capacity(enabled.len());
            for entry in &enabled {
                inner.push(build_transport(entry)?);
            }
            let threshold = config.orchestration.consensus_threshold.clamp(1, inner.len());
            Ok(Arc::new(ConsensusProvider::new(inner, threshold)))
        }
    }
}

// ── Shared transport plumbing ────────────────────────────────────

/// Send a request, retrying with exponential back-off on HTTP 429.
/// Non-retryable failures and exhausted retries surface to the
/// caller, which isolates them per provider / per file.
pub(crate) async fn send_with_retry(
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let mut attempt: u32 = 0;
    loop {
        let request = builder
            .try_clone()
            .context("request body must be cloneable for retry")?;
        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
            let delay = Duration::from_millis(RETRY_BASE_MS * 2u64.pow(attempt));
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "rate limited by LLM API, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error {status}: {body}");
        }

        return Ok(response);
    }
}

/// Extract JSON from a response that may be wrapped in markdown
/// code fences.
pub(crate) fn extract_json_block(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return text[json_start..json_start + end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let block_start = start + 3;
        if let Some(end) = text[block_start..].find("```") {
            let candidate = text[block_start..block_start + end].trim();
            if let Some(nl) = candidate.find('\n') {
                let first_line = &candidate[..nl];
                if !first_line.starts_with('{') && !first_line.starts_with('[') {
                    return candidate[nl + 1..].trim();
                }
            }
            return candidate;
        }
    }
    text.trim()
}

// ── Wire shapes ──────────────────────────────────────────────────

/// Lenient review payload the model is asked to produce. Everything
/// defaults so a partially-wrong response still yields a result.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireReview {
    #[serde(default)]
    summary: WireSummary,
    #[serde(default)]
    file_reviews: Vec<WireFileReview>,
    #[serde(default)]
    inline_comments: Vec<WireInlineComment>,
    #[serde(default)]
    observations: Vec<String>,
    #[serde(default)]
    recommended_vote: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSummary {
    #[serde(default)]
    description: String,
    #[serde(default)]
    verdict: String,
    #[serde(default)]
    verdict_justification: String,
}

#[derive(Debug, Deserialize)]
struct WireFileReview {
    path: String,
    #[serde(default)]
    verdict: String,
    #[serde(default)]
    review_text: String,
}

#[derive(Debug, Deserialize)]
struct WireInlineComment {
    path: String,
    #[serde(default = "one")]
    start_line: usize,
    #[serde(default = "one")]
    end_line: usize,
    #[serde(default)]
    lead_in: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    code_snippet: Option<String>,
}

fn one() -> usize {
    1
}

/// Per-candidate verdict payload for resolution verification.
#[derive(Debug, Deserialize)]
pub(crate) struct WireResolution {
    thread_id: i64,
    #[serde(default)]
    is_fixed: bool,
    #[serde(default)]
    reasoning: String,
}

/// Convert model output text into a [`ReviewResult`], enforcing the
/// port contracts (verdict/vote domains, line ordering).
pub(crate) fn parse_review_text(
    text: &str,
    files: &[FileChange],
    model_name: &str,
) -> ReviewResult {
    let wire: WireReview = serde_json::from_str(extract_json_block(text)).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unparseable review payload, using raw text as description");
        WireReview {
            summary: WireSummary {
                description: text.chars().take(400).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    });

    let (edits, adds, deletes) = count_change_kinds(files);
    let verdict = Verdict::from_str_lossy(&wire.summary.verdict);

    let inline_comments = wire
        .inline_comments
        .into_iter()
        .map(|c| {
            let start = c.start_line.max(1);
            let end = c.end_line.max(start);
            InlineComment {
                path: c.path,
                start_line: start,
                end_line: end,
                lead_in: LeadIn::from_str_lossy(&c.lead_in),
                comment: c.comment,
                code_snippet: c.code_snippet.filter(|s| !s.trim().is_empty()),
                status: CommentState::Active,
            }
        })
        .collect();

    ReviewResult {
        summary: ReviewSummary {
            files_changed: files.len(),
            edits_count: edits,
            adds_count: adds,
            deletes_count: deletes,
            description: wire.summary.description,
            verdict,
            verdict_justification: wire.summary.verdict_justification,
        },
        file_reviews: wire
            .file_reviews
            .into_iter()
            .map(|f| FileReview {
                path: f.path,
                verdict: if f.verdict.is_empty() { "OK".into() } else { f.verdict },
                review_text: f.review_text,
            })
            .collect(),
        inline_comments,
        observations: wire.observations,
        recommended_vote: normalize_vote(wire.recommended_vote.unwrap_or(10)),
        metrics: crate::review::types::ReviewMetrics {
            model_name: model_name.to_string(),
            ..Default::default()
        },
    }
}

/// Parse resolution verdicts from model output.
pub(crate) fn parse_resolution_text(
    text: &str,
    candidates: &[ResolutionCandidate],
) -> Result<Vec<ResolutionVerdict>> {
    let wire: Vec<WireResolution> = serde_json::from_str(extract_json_block(text))
        .context("resolution payload was not a JSON array of verdicts")?;

    // Only candidates we actually asked about count.
    let known: std::collections::HashSet<i64> = candidates.iter().map(|c| c.thread_id).collect();
    Ok(wire
        .into_iter()
        .filter(|w| known.contains(&w.thread_id))
        .map(|w| ResolutionVerdict {
            thread_id: w.thread_id,
            is_fixed: w.is_fixed,
            reasoning: w.reasoning,
        })
        .collect())
}

pub(crate) fn count_change_kinds(files: &[FileChange]) -> (usize, usize, usize) {
    let mut edits = 0;
    let mut adds = 0;
    let mut deletes = 0;
    for f in files {
        match f.change_type {
            ChangeType::Add => adds += 1,
            ChangeType::Delete => deletes += 1,
            ChangeType::Edit | ChangeType::Rename => edits += 1,
        }
    }
    (edits, adds, deletes)
}
