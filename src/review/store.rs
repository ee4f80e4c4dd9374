//! Collaborator contract for durable review state.
//!
//! Everything the engine persists lives on the platform side: PR
//! snapshots, per-PR metadata properties, the JSON review history,
//! comment threads, votes, and the PR description. The orchestrator
//! only ever talks to this trait; the Azure DevOps implementation
//! lives in `crate::platform`.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{
    ExistingCommentThread, FileChange, PullRequestSnapshot, ReviewHistoryEntry, ReviewMetadata,
    ThreadStatus,
};

/// Read/write access to platform-owned review state for one PR.
///
/// Implementations must not fail `get_metadata` on a PR that has
/// never been reviewed; absent fields default to zero/empty.
/// `append_history` is a read-modify-write of the stored list.
#[async_trait]
pub trait ReviewStateStore: Send + Sync {
    async fn get_pr(&self, project: &str, repo: &str, pr_id: i64) -> Result<PullRequestSnapshot>;

    /// Number of iterations (push events) the platform has recorded.
    async fn get_iteration_count(&self, project: &str, repo: &str, pr_id: i64) -> Result<i64>;

    async fn get_metadata(&self, project: &str, repo: &str, pr_id: i64) -> Result<ReviewMetadata>;

    async fn set_metadata(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        metadata: &ReviewMetadata,
    ) -> Result<()>;

    async fn get_history(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
    ) -> Result<Vec<ReviewHistoryEntry>>;

    async fn append_history(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        entry: &ReviewHistoryEntry,
    ) -> Result<()>;

    /// Existing comment threads; when `attribution_tag` is given, only
    /// threads carrying the `_[tag]_` marker are returned.
    async fn get_existing_threads(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        attribution_tag: Option<&str>,
    ) -> Result<Vec<ExistingCommentThread>>;

    async fn update_thread_status(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        thread_id: i64,
        status: ThreadStatus,
    ) -> Result<()>;

    /// Count of prior top-level summary comments (content beginning
    /// with `## Code Review` or `## Re-Review`). Survives a metadata
    /// wipe, so review numbering stays monotonic.
    async fn count_summary_comments(&self, project: &str, repo: &str, pr_id: i64) -> Result<usize>;

    /// Changed files with contents, diffs and changed-line ranges.
    async fn get_file_changes(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        pr: &PullRequestSnapshot,
    ) -> Result<Vec<FileChange>>;

    async fn post_comment_thread(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        content: &str,
        status: ThreadStatus,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// May fail transiently; callers treat failure as a null vote.
    async fn add_reviewer_vote(&self, project: &str, repo: &str, pr_id: i64, vote: i32)
        -> Result<()>;

    async fn update_pr_description(
        &self,
        project: &str,
        repo: &str,
        pr_id: i64,
        new_description: &str,
    ) -> Result<()>;

    async fn has_review_tag(&self, project: &str, repo: &str, pr_id: i64) -> Result<bool>;

    async fn add_review_tag(&self, project: &str, repo: &str, pr_id: i64) -> Result<()>;
}
