//! Azure DevOps implementation of the review state store.
//!
//! Speaks the Git REST API (PRs, iterations, item contents, threads,
//! properties, reviewers, labels) with PAT basic auth. Durable review
//! state lives in PR properties under the `AiCodeReview.*` keys; the
//! history is a JSON array in one property.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::config::PlatformConfig;
use crate::review::diff::{compute_unified_diff, parse_changed_line_ranges};
use crate::review::store::ReviewStateStore;
use crate::review::types::{
    ChangeType, ExistingCommentThread, FileChange, PullRequestSnapshot, ReviewHistoryEntry,
    ReviewMetadata, ReviewerIdentity, ThreadStatus,
};

const API_VERSION: &str = "7.1";
const PROPERTIES_API_VERSION: &str = "7.1-preview.1";

/// Property keys for the durable per-PR review state.
mod keys {
    pub const LAST_SOURCE_COMMIT: &str = "AiCodeReview.LastSourceCommit";
    pub const LAST_TARGET_COMMIT: &str = "AiCodeReview.LastTargetCommit";
    pub const LAST_ITERATION: &str = "AiCodeReview.LastIteration";
    pub const WAS_DRAFT: &str = "AiCodeReview.WasDraft";
    pub const REVIEWED_AT_UTC: &str = "AiCodeReview.ReviewedAtUtc";
    pub const VOTE_SUBMITTED: &str = "AiCodeReview.VoteSubmitted";
    pub const REVIEW_COUNT: &str = "AiCodeReview.ReviewCount";
    pub const REVIEW_HISTORY: &str = "AiCodeReview.ReviewHistory";
}

/// Label attached to reviewed PRs.
const REVIEW_TAG: &str = "ai-reviewed";

pub struct AzureDevOpsStore {
    base_url: String,
    organization: String,
    auth_header: String,
    client: reqwest::Client,
}

impl AzureDevOpsStore {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        if config.pat.is_empty() {
            bail!("Azure DevOps PAT is not configured (set platform.pat or AZURE_DEVOPS_PAT)");
        }
        let token = base64::engine::general_purpose::STANDARD.encode(format!(":{}", config.pat));
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            organization: config.organization.clone(),
            auth_header: format!("Basic {token}"),
            client: reqwest::Client::new(),
        })
    }

    fn repo_url(&self, project: &str, repo: &str) -> String {
        format!(
            "{}/{}/{}/_apis/git/repositories/{}",
            self.base_url, self.organization, project, repo
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        Self::check_status(url, &response)?;
        response.json().await.with_context(|| format!("decoding {url}"))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        content_type: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .request(method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("{method} {url}"))?;
        Self::check_status(url, &response)?;
        response.json().await.with_context(|| format!("decoding {url}"))
    }

    fn check_status(url: &str, response: &reqwest::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            bail!("Azure DevOps returned {status} for {url}");
        }
        Ok(())
    }

    /// Raw file content at a specific commit; `None` when the path
    /// does not exist at that version.
    async fn item_content(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        commit: &str,
    ) -> Result<Option<String>> {
        let url = format!(
            "{}/items?path=/{}&versionDescriptor.version={commit}&versionDescriptor.versionType=commit&includeContent=true&$format=text&api-version={API_VERSION}",
            self.repo_url(project, repo),
            urlencode(path.trim_start_matches('/')),
        );
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(&url, &response)?;
        Ok(Some(response.text().await?))
    }

    /// The authenticated bot identity, needed to cast votes.
    async fn authenticated_user_id(&self) -> Result<String> {
        let url = format!(
            "{}/{}/_apis/connectionData",
            self.base_url, self.organization
        );
        let data: ConnectionData = self.get_json(&url).await?;
        Ok(data.authenticated_user.id)
    }

    async fn properties(&self, project: &str, repo: &str, pr_id: i64) -> Result<PropertyBag> {
        let url = format!(
            "{}/pullrequests/{pr_id}/properties?api-version={PROPERTIES_API_VERSION}",
            self.repo_url(project, repo),
        );
        self.get_json(&url).await
    }

    async fn patch_properties(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        entries: &[(&str, String)],
    ) -> Result<()> {
        let patch: Vec<serde_json::Value> = entries
            .iter()
            .map(|(key, value)| {
                // JSON-Patch "add" upserts; "replace" would fail on
                // the first write of a property.
                json!({
                    "op": "add",
                    "path": format!("/{key}"),
                    "value": value,
                })
            })
            .collect();
        let url = format!(
            "{}/pullrequests/{pr_id}/properties?api-version={PROPERTIES_API_VERSION}",
            self.repo_url(project, repo),
        );
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PATCH,
                &url,
                "application/json-patch+json",
                &serde_json::Value::Array(patch),
            )
            .await?;
        Ok(())
    }

    async fn threads_raw(&self, project: &str, repo: &str, pr_id: i64) -> Result<Vec<WireThread>> {
        let url = format!(
            "{}/pullrequests/{pr_id}/threads?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let list: ListOf<WireThread> = self.get_json(&url).await?;
        Ok(list.value)
    }
}

// ── Wire shapes ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListOf<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePullRequest {
    pull_request_id: i64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    source_ref_name: String,
    target_ref_name: String,
    created_by: WireIdentity,
    creation_date: DateTime<Utc>,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    last_merge_source_commit: Option<WireCommitRef>,
    #[serde(default)]
    last_merge_target_commit: Option<WireCommitRef>,
    #[serde(default)]
    reviewers: Vec<WireReviewer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIdentity {
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommitRef {
    commit_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReviewer {
    id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    vote: i32,
}

#[derive(Debug, Deserialize)]
struct ConnectionData {
    #[serde(rename = "authenticatedUser")]
    authenticated_user: AuthenticatedUser,
}

#[derive(Debug, Deserialize)]
struct AuthenticatedUser {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PropertyBag {
    #[serde(default)]
    value: serde_json::Map<String, serde_json::Value>,
}

impl PropertyBag {
    /// Property values arrive as `{"$type": ..., "$value": ...}`.
    fn get_str(&self, key: &str) -> Option<String> {
        let entry = self.value.get(key)?;
        let value = entry.get("$value")?;
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThread {
    id: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    thread_context: Option<WireThreadContext>,
    #[serde(default)]
    comments: Vec<WireComment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThreadContext {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    right_file_start: Option<WirePosition>,
    #[serde(default)]
    right_file_end: Option<WirePosition>,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    line: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireComment {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    is_deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIterationChanges {
    #[serde(default)]
    change_entries: Vec<WireChangeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChangeEntry {
    #[serde(default)]
    change_type: String,
    #[serde(default)]
    item: Option<WireItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireItem {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    is_folder: bool,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    name: String,
}

// ── Pure mapping helpers ─────────────────────────────────────────

/// `refs/heads/main` → `main`.
fn branch_short_name(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name)
}

fn map_change_type(raw: &str) -> ChangeType {
    // Azure DevOps uses flag strings like "edit, rename".
    let lowered = raw.to_ascii_lowercase();
    if lowered.contains("rename") {
        ChangeType::Rename
    } else if lowered.contains("delete") {
        ChangeType::Delete
    } else if lowered.contains("add") {
        ChangeType::Add
    } else {
        ChangeType::Edit
    }
}

fn map_thread_status(raw: Option<&str>) -> ThreadStatus {
    match raw {
        Some(name) => ThreadStatus::from_name_lossy(name),
        None => ThreadStatus::Closed,
    }
}

fn metadata_from_properties(bag: &PropertyBag) -> ReviewMetadata {
    ReviewMetadata {
        last_reviewed_source_commit: bag.get_str(keys::LAST_SOURCE_COMMIT).unwrap_or_default(),
        last_reviewed_target_commit: bag.get_str(keys::LAST_TARGET_COMMIT).unwrap_or_default(),
        last_reviewed_iteration: bag
            .get_str(keys::LAST_ITERATION)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        was_draft: bag
            .get_str(keys::WAS_DRAFT)
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        reviewed_at_utc: bag
            .get_str(keys::REVIEWED_AT_UTC)
            .and_then(|s| s.parse().ok()),
        vote_submitted: bag
            .get_str(keys::VOTE_SUBMITTED)
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        review_count: bag
            .get_str(keys::REVIEW_COUNT)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    }
}

fn bool_prop(value: bool) -> String {
    if value { "True".into() } else { "False".into() }
}

fn urlencode(path: &str) -> String {
    // Minimal percent-encoding for repo paths in query strings.
    path.replace('%', "%25")
        .replace(' ', "%20")
        .replace('#', "%23")
        .replace('?', "%3F")
        .replace('&', "%26")
        .replace('+', "%2B")
}

// ── Store implementation ─────────────────────────────────────────

#[async_trait]
impl ReviewStateStore for AzureDevOpsStore {
    async fn get_pr(&self, project: &str, repo: &str, pr_id: i64) -> Result<PullRequestSnapshot> {
        let url = format!(
            "{}/pullrequests/{pr_id}?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let wire: WirePullRequest = self.get_json(&url).await?;
        Ok(PullRequestSnapshot {
            pr_id: wire.pull_request_id,
            title: wire.title,
            description: wire.description.unwrap_or_default(),
            source_branch: branch_short_name(&wire.source_ref_name).to_string(),
            target_branch: branch_short_name(&wire.target_ref_name).to_string(),
            author: wire.created_by.display_name,
            created_at: wire.creation_date,
            is_draft: wire.is_draft,
            source_commit: wire
                .last_merge_source_commit
                .map(|c| c.commit_id)
                .unwrap_or_default(),
            target_commit: wire
                .last_merge_target_commit
                .map(|c| c.commit_id)
                .unwrap_or_default(),
            reviewers: wire
                .reviewers
                .into_iter()
                .map(|r| ReviewerIdentity {
                    id: r.id,
                    display_name: r.display_name,
                    vote: r.vote,
                })
                .collect(),
        })
    }

    async fn get_iteration_count(&self, project: &str, repo: &str, pr_id: i64) -> Result<i64> {
        let url = format!(
            "{}/pullrequests/{pr_id}/iterations?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let list: ListOf<serde_json::Value> = self.get_json(&url).await?;
        Ok(list.value.len() as i64)
    }

    async fn get_metadata(&self, project: &str, repo: &str, pr_id: i64) -> Result<ReviewMetadata> {
        // Absent properties must read as the zero metadata, never an
        // error.
        match self.properties(project, repo, pr_id).await {
            Ok(bag) => Ok(metadata_from_properties(&bag)),
            Err(e) => {
                tracing::warn!(pr_id, error = %e, "property read failed; treating as unreviewed");
                Ok(ReviewMetadata::default())
            }
        }
    }

    async fn set_metadata(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        metadata: &ReviewMetadata,
    ) -> Result<()> {
        let reviewed_at = metadata
            .reviewed_at_utc
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        self.patch_properties(
            project,
            repo,
            pr_id,
            &[
                (keys::LAST_SOURCE_COMMIT, metadata.last_reviewed_source_commit.clone()),
                (keys::LAST_TARGET_COMMIT, metadata.last_reviewed_target_commit.clone()),
                (keys::LAST_ITERATION, metadata.last_reviewed_iteration.to_string()),
                (keys::WAS_DRAFT, bool_prop(metadata.was_draft)),
                (keys::REVIEWED_AT_UTC, reviewed_at),
                (keys::VOTE_SUBMITTED, bool_prop(metadata.vote_submitted)),
                (keys::REVIEW_COUNT, metadata.review_count.to_string()),
            ],
        )
        .await
    }

    async fn get_history(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
    ) -> Result<Vec<ReviewHistoryEntry>> {
        let bag = match self.properties(project, repo, pr_id).await {
            Ok(bag) => bag,
            Err(_) => return Ok(Vec::new()),
        };
        let Some(raw) = bag.get_str(keys::REVIEW_HISTORY) else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(history) => Ok(history),
            Err(e) => {
                tracing::warn!(pr_id, error = %e, "unparseable review history; starting fresh");
                Ok(Vec::new())
            }
        }
    }

    async fn append_history(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        entry: &ReviewHistoryEntry,
    ) -> Result<()> {
        let mut history = self.get_history(project, repo, pr_id).await?;
        history.push(entry.clone());
        let raw = serde_json::to_string(&history)?;
        self.patch_properties(project, repo, pr_id, &[(keys::REVIEW_HISTORY, raw)])
            .await
    }

    async fn get_existing_threads(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        attribution_tag: Option<&str>,
    ) -> Result<Vec<ExistingCommentThread>> {
        let threads = self.threads_raw(project, repo, pr_id).await?;
        let marker = attribution_tag.map(|tag| format!("_[{tag}]_"));

        Ok(threads
            .into_iter()
            .filter(|t| !t.is_deleted)
            .filter_map(|t| {
                let content = t
                    .comments
                    .iter()
                    .find(|c| !c.is_deleted)
                    .and_then(|c| c.content.clone())
                    .unwrap_or_default();
                if let Some(marker) = &marker {
                    if !content.contains(marker.as_str()) {
                        return None;
                    }
                }
                let (path, start, end) = match &t.thread_context {
                    Some(ctx) => (
                        ctx.file_path.clone(),
                        ctx.right_file_start.as_ref().map(|p| p.line).unwrap_or(0),
                        ctx.right_file_end.as_ref().map(|p| p.line).unwrap_or(0),
                    ),
                    None => (None, 0, 0),
                };
                Some(ExistingCommentThread {
                    thread_id: t.id,
                    path: path.map(|p| p.trim_start_matches('/').to_string()),
                    start_line: start,
                    end_line: end,
                    content,
                    status: map_thread_status(t.status.as_deref()),
                })
            })
            .collect())
    }

    async fn update_thread_status(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        thread_id: i64,
        status: ThreadStatus,
    ) -> Result<()> {
        let url = format!(
            "{}/pullrequests/{pr_id}/threads/{thread_id}?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PATCH,
                &url,
                "application/json",
                &json!({ "status": status.name() }),
            )
            .await?;
        Ok(())
    }

    async fn count_summary_comments(&self, project: &str, repo: &str, pr_id: i64) -> Result<usize> {
        let threads = self.threads_raw(project, repo, pr_id).await?;
        Ok(threads
            .iter()
            .filter(|t| !t.is_deleted && t.thread_context.is_none())
            .filter(|t| {
                t.comments
                    .first()
                    .and_then(|c| c.content.as_deref())
                    .map(|c| c.starts_with("## Code Review") || c.starts_with("## Re-Review"))
                    .unwrap_or(false)
            })
            .count())
    }

    async fn get_file_changes(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        pr: &PullRequestSnapshot,
    ) -> Result<Vec<FileChange>> {
        let iterations = self.get_iteration_count(project, repo, pr_id).await?;
        if iterations == 0 {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/pullrequests/{pr_id}/iterations/{iterations}/changes?$compareTo=0&api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let changes: WireIterationChanges = self.get_json(&url).await?;

        let mut files = Vec::new();
        for entry in changes.change_entries {
            let Some(item) = entry.item else { continue };
            if item.is_folder {
                continue;
            }
            let Some(path) = item.path else { continue };
            let path = path.trim_start_matches('/').to_string();
            let change_type = map_change_type(&entry.change_type);

            let modified_content = if change_type == ChangeType::Delete {
                None
            } else {
                self.item_content(project, repo, &path, &pr.source_commit)
                    .await?
            };
            let original_content = if change_type == ChangeType::Add {
                None
            } else {
                self.item_content(project, repo, &path, &pr.target_commit)
                    .await?
            };

            let (unified_diff, changed_line_ranges) = match (&original_content, &modified_content) {
                (Some(original), Some(modified)) => {
                    let diff = compute_unified_diff(original, modified, &path);
                    let ranges = parse_changed_line_ranges(&diff);
                    (Some(diff), ranges)
                }
                (None, Some(modified)) => {
                    // Adds cover every line of the new file.
                    let lines = modified.lines().count();
                    let ranges = if lines > 0 {
                        vec![crate::review::types::LineRange::new(1, lines)]
                    } else {
                        Vec::new()
                    };
                    (None, ranges)
                }
                _ => (None, Vec::new()),
            };

            files.push(FileChange {
                path,
                change_type,
                original_content,
                modified_content,
                unified_diff,
                changed_line_ranges,
            });
        }
        Ok(files)
    }

    async fn post_comment_thread(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        content: &str,
        status: ThreadStatus,
    ) -> Result<()> {
        let url = format!(
            "{}/pullrequests/{pr_id}/threads?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let body = json!({
            "comments": [{ "parentCommentId": 0, "content": content, "commentType": "text" }],
            "status": status.name(),
        });
        let _: serde_json::Value = self
            .send_json(reqwest::Method::POST, &url, "application/json", &body)
            .await?;
        Ok(())
    }

    async fn post_inline_comment_thread(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        path: &str,
        start_line: usize,
        end_line: usize,
        content: &str,
        status: ThreadStatus,
    ) -> Result<()> {
        let url = format!(
            "{}/pullrequests/{pr_id}/threads?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let body = json!({
            "comments": [{ "parentCommentId": 0, "content": content, "commentType": "text" }],
            "status": status.name(),
            "threadContext": {
                "filePath": format!("/{path}"),
                "rightFileStart": { "line": start_line, "offset": 1 },
                "rightFileEnd": { "line": end_line, "offset": 1 },
            },
        });
        let _: serde_json::Value = self
            .send_json(reqwest::Method::POST, &url, "application/json", &body)
            .await?;
        Ok(())
    }

    async fn add_reviewer_vote(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        vote: i32,
    ) -> Result<()> {
        let reviewer_id = self.authenticated_user_id().await?;
        let url = format!(
            "{}/pullrequests/{pr_id}/reviewers/{reviewer_id}?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PUT,
                &url,
                "application/json",
                &json!({ "vote": vote }),
            )
            .await?;
        Ok(())
    }

    async fn update_pr_description(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        new_description: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/pullrequests/{pr_id}?api-version={API_VERSION}",
            self.repo_url(project, repo),
        );
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PATCH,
                &url,
                "application/json",
                &json!({ "description": new_description }),
            )
            .await?;
        Ok(())
    }

    async fn has_review_tag(&self, project: &str, repo: &str, pr_id: i64) -> Result<bool> {
        let url = format!(
            "{}/pullrequests/{pr_id}/labels?api-version={PROPERTIES_API_VERSION}",
            self.repo_url(project, repo),
        );
        let labels: ListOf<WireLabel> = self.get_json(&url).await?;
        Ok(labels
            .value
            .iter()
            .any(|l| l.name.eq_ignore_ascii_case(REVIEW_TAG)))
    }

    async fn add_review_tag(&self, project: &str, repo: &str, pr_id: i64) -> Result<()> {
        let url = format!(
            "{}/pullrequests/{pr_id}/labels?api-version={PROPERTIES_API_VERSION}",
            self.repo_url(project, repo),
        );
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &url,
                "application/json",
                &json!({ "name": REVIEW_TAG }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_shortened() {
        assert_eq!(branch_short_name("refs/heads/main"), "main");
        assert_eq!(branch_short_name("refs/heads/feature/x"), "feature/x");
        assert_eq!(branch_short_name("main"), "main");
    }

    #[test]
    fn change_type_mapping() {
        assert_eq!(map_change_type("edit"), ChangeType::Edit);
        assert_eq!(map_change_type("add"), ChangeType::Add);
        assert_eq!(map_change_type("delete"), ChangeType::Delete);
        assert_eq!(map_change_type("edit, rename"), ChangeType::Rename);
        assert_eq!(map_change_type("unknown"), ChangeType::Edit);
    }

    #[test]
    fn properties_round_trip_into_metadata() {
        let raw = serde_json::json!({
            "count": 4,
            "value": {
                "AiCodeReview.LastSourceCommit": { "$type": "System.String", "$value": "abc123" },
                "AiCodeReview.LastIteration": { "$type": "System.String", "$value": "3" },
                "AiCodeReview.WasDraft": { "$type": "System.String", "$value": "True" },
                "AiCodeReview.VoteSubmitted": { "$type": "System.String", "$value": "False" },
                "AiCodeReview.ReviewCount": { "$type": "System.Int64", "$value": 2 },
            }
        });
        let bag: PropertyBag = serde_json::from_value(raw).unwrap();
        let metadata = metadata_from_properties(&bag);
        assert_eq!(metadata.last_reviewed_source_commit, "abc123");
        assert_eq!(metadata.last_reviewed_iteration, 3);
        assert!(metadata.was_draft);
        assert!(!metadata.vote_submitted);
        assert_eq!(metadata.review_count, 2);
        assert!(metadata.has_previous_review());
    }

    #[test]
    fn empty_properties_are_zero_metadata() {
        let bag = PropertyBag::default();
        let metadata = metadata_from_properties(&bag);
        assert!(!metadata.has_previous_review());
        assert_eq!(metadata.review_count, 0);
        assert!(metadata.reviewed_at_utc.is_none());
    }

    #[test]
    fn bool_props_use_platform_casing() {
        assert_eq!(bool_prop(true), "True");
        assert_eq!(bool_prop(false), "False");
    }

    #[test]
    fn path_encoding_for_queries() {
        assert_eq!(urlencode("/src/a b.rs"), "/src/a%20b.rs");
        assert_eq!(urlencode("/c#/x.cs"), "/c%23/x.cs");
    }

    #[test]
    fn thread_status_defaults_to_closed() {
        assert_eq!(map_thread_status(None), ThreadStatus::Closed);
        assert_eq!(map_thread_status(Some("active")), ThreadStatus::Active);
        assert_eq!(map_thread_status(Some("byDesign")), ThreadStatus::ByDesign);
        assert_eq!(map_thread_status(Some("garbage")), ThreadStatus::Closed);
    }
}
