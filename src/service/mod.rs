//! Repository service adapters
//!
//! One capability set (commit statuses, releases, artifact uploads, release
//! links, webhook decoding) behind a runtime-selected implementation per
//! hosted service. The core never branches on provider identity.

mod bitbucket;
mod github;
mod gitlab;
mod http;

pub use bitbucket::BitBucket;
pub use github::GitHub;
pub use gitlab::GitLab;
pub use http::{ApiClient, ApiError};

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::build::{BuildScheduler, BuildType};
use crate::config::{Configuration, RepoServiceKind};

/// Commit-status check name shown by the repository service
pub const STATUS_CONTEXT: &str = "OS image CI";

/// Webhook decoding errors
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook authentication failed")]
    Auth,

    #[error("malformed webhook payload: {0}")]
    Payload(String),
}

/// Canonical events decoded from provider webhooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoEvent {
    PullRequestOpened { commit_id: String, pr_no: u64 },
    PullRequestUpdated { commit_id: String, pr_no: u64 },
    Commit { commit_id: String, branch: String },
    Tag { commit_id: Option<String>, tag: String },
}

/// Commit status states; each adapter maps them to its provider's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Pending,
    Success,
    Failed,
}

/// A release being assembled on the repository service
#[derive(Debug, Clone, Default)]
pub struct Release {
    /// Provider release id, when the provider models releases as entities
    pub id: Option<i64>,

    pub tag: String,
    pub name: String,

    /// Asset upload URL template (GitHub)
    pub upload_url: Option<String>,

    /// Release description, grown by `add_release_link`
    pub body: String,
}

/// Inputs to release creation
#[derive(Debug, Clone)]
pub struct ReleaseContext<'a> {
    pub commit_id: Option<&'a str>,
    pub tag: &'a str,
    pub name: &'a str,
    pub branch: Option<&'a str>,
    pub build_type: BuildType,
}

/// The repository-service capability set.
///
/// `create_release` must replace an existing release with the same tag: the
/// old release is removed and the git tag itself deleted (via a
/// custom-command build) before the fresh release is created. Tag-type
/// releases are created as drafts where the provider supports them.
#[async_trait]
pub trait RepoService: Send + Sync {
    /// Provider name; also the webhook/log endpoint path segment.
    fn name(&self) -> &'static str;

    /// Authenticate and decode a webhook delivery into canonical events.
    fn decode_webhook(&self, headers: &HeaderMap, body: &[u8])
        -> Result<Vec<RepoEvent>, WebhookError>;

    /// Update the commit status check. A missing commit id is a no-op.
    async fn set_status(
        &self,
        commit_id: Option<&str>,
        status: CommitStatus,
        target_url: &str,
        description: &str,
    ) -> Result<(), ApiError>;

    async fn create_release(&self, ctx: &ReleaseContext<'_>) -> Result<Release, ApiError>;

    async fn upload_release_file(
        &self,
        release: &Release,
        name: &str,
        content: Vec<u8>,
    ) -> Result<(), ApiError>;

    async fn add_release_link(
        &self,
        release: &mut Release,
        name: &str,
        url: &str,
    ) -> Result<(), ApiError>;
}

/// Instantiate the configured service adapter.
pub fn create(
    config: &Arc<Configuration>,
    scheduler: Arc<BuildScheduler>,
) -> Result<Arc<dyn RepoService>, ApiError> {
    Ok(match config.repo_service {
        RepoServiceKind::Github => Arc::new(GitHub::new(config.clone(), scheduler)?),
        RepoServiceKind::Gitlab => Arc::new(GitLab::new(config.clone())?),
        RepoServiceKind::Bitbucket => Arc::new(BitBucket::new(config.clone())?),
    })
}
