//! GitLab adapter
//!
//! GitLab has no first-class release entity in the API surface used here: a
//! "release" is a git tag plus its release description. Artifacts go through
//! project uploads and are linked from the description.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::Configuration;

use super::http::{ApiClient, ApiError};
use super::{
    CommitStatus, Release, ReleaseContext, RepoEvent, RepoService, WebhookError, STATUS_CONTEXT,
};

pub struct GitLab {
    config: Arc<Configuration>,
    client: ApiClient,
}

impl GitLab {
    pub fn new(config: Arc<Configuration>) -> Result<Self, ApiError> {
        let base = format!("{}/api/v4", config.gitlab.base_url.trim_end_matches('/'));
        let client = ApiClient::new(base, config.gitlab.request_timeout)?;
        Ok(Self { config, client })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, path)
            .header("Private-Token", &self.config.gitlab.access_token)
            .header("User-Agent", &self.config.git.repo)
    }

    fn tag_path(&self, tag: &str) -> String {
        format!(
            "/projects/{}/repository/tags/{}",
            self.config.gitlab.project_id, tag
        )
    }

    /// Append a markdown link to the tag's release description, creating the
    /// release when the tag has none yet.
    async fn append_release_description(&self, tag: &str, link: &str) -> Result<(), ApiError> {
        let value = self
            .client
            .execute(self.request(Method::GET, &self.tag_path(tag)))
            .await?
            .ok_or(ApiError::MissingField("tag"))?;

        let existing = value["release"]["description"].as_str();
        let description = match existing {
            Some(description) => format!("{}\n\n{}", description, link),
            None => link.to_string(),
        };

        let path = format!("{}/release", self.tag_path(tag));
        let method = if value["release"].is_object() {
            Method::PUT
        } else {
            Method::POST
        };

        self.client
            .execute(
                self.request(method, &path)
                    .json(&json!({ "description": description })),
            )
            .await?;

        Ok(())
    }
}

#[derive(Deserialize)]
struct PushHookPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    commits: Vec<HookCommit>,
}

#[derive(Deserialize)]
struct HookCommit {
    id: String,
}

#[derive(Deserialize)]
struct TagPushHookPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    checkout_sha: Option<String>,
}

#[derive(Deserialize)]
struct MergeRequestHookPayload {
    object_attributes: MergeRequestAttributes,
}

#[derive(Deserialize)]
struct MergeRequestAttributes {
    action: String,
    iid: u64,
    last_commit: HookCommit,
}

#[async_trait]
impl RepoService for GitLab {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    fn decode_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Vec<RepoEvent>, WebhookError> {
        let token = headers
            .get("X-Gitlab-Token")
            .and_then(|value| value.to_str().ok())
            .ok_or(WebhookError::Auth)?;
        if token != self.config.web.secret {
            return Err(WebhookError::Auth);
        }

        let event = headers
            .get("X-Gitlab-Event")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let mut events = Vec::new();
        match event {
            "Push Hook" => {
                let payload: PushHookPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;
                let branch = payload
                    .git_ref
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();

                for commit in payload.commits {
                    events.push(RepoEvent::Commit {
                        commit_id: commit.id,
                        branch: branch.clone(),
                    });
                }
            }
            "Tag Push Hook" => {
                let payload: TagPushHookPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;
                // checkout_sha is null when the tag was deleted
                if let Some(commit_id) = payload.checkout_sha {
                    let tag = payload
                        .git_ref
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    events.push(RepoEvent::Tag {
                        commit_id: Some(commit_id),
                        tag,
                    });
                }
            }
            "Merge Request Hook" => {
                let payload: MergeRequestHookPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;
                let attrs = payload.object_attributes;

                match attrs.action.as_str() {
                    "open" => events.push(RepoEvent::PullRequestOpened {
                        commit_id: attrs.last_commit.id,
                        pr_no: attrs.iid,
                    }),
                    "update" => events.push(RepoEvent::PullRequestUpdated {
                        commit_id: attrs.last_commit.id,
                        pr_no: attrs.iid,
                    }),
                    _ => {}
                }
            }
            _ => {}
        }

        Ok(events)
    }

    async fn set_status(
        &self,
        commit_id: Option<&str>,
        status: CommitStatus,
        target_url: &str,
        description: &str,
    ) -> Result<(), ApiError> {
        let Some(commit_id) = commit_id else {
            return Ok(());
        };

        let state = match status {
            CommitStatus::Pending => "pending",
            CommitStatus::Success => "success",
            CommitStatus::Failed => "failed",
        };

        let path = format!(
            "/projects/{}/statuses/{}",
            self.config.gitlab.project_id, commit_id
        );
        self.client
            .execute(self.request(Method::POST, &path).json(&json!({
                "state": state,
                "target_url": target_url,
                "description": description,
                "context": STATUS_CONTEXT,
            })))
            .await?;

        Ok(())
    }

    async fn create_release(&self, ctx: &ReleaseContext<'_>) -> Result<Release, ApiError> {
        debug!("looking for tag {}", ctx.tag);

        let tag_exists = match self
            .client
            .execute(self.request(Method::GET, &self.tag_path(ctx.tag)))
            .await
        {
            Ok(_) => true,
            Err(e) if e.http_status() == Some(404) => false,
            Err(e) => return Err(e),
        };

        if !tag_exists {
            debug!("creating tag {}", ctx.tag);
            let path = format!("/projects/{}/repository/tags", self.config.gitlab.project_id);
            let git_ref = ctx.commit_id.or(ctx.branch).unwrap_or_default();
            self.client
                .execute(
                    self.request(Method::POST, &path)
                        .json(&json!({ "tag_name": ctx.tag, "ref": git_ref })),
                )
                .await?;
        }

        Ok(Release {
            id: None,
            tag: ctx.tag.to_string(),
            name: ctx.name.to_string(),
            upload_url: None,
            body: String::new(),
        })
    }

    async fn upload_release_file(
        &self,
        release: &Release,
        name: &str,
        content: Vec<u8>,
    ) -> Result<(), ApiError> {
        debug!("uploading release file {}", name);

        let content_type = mime_guess::from_path(name).first_or_octet_stream();
        let part = Part::bytes(content)
            .file_name(name.to_string())
            .mime_str(content_type.as_ref())
            .map_err(ApiError::Request)?;
        let form = Form::new().part("file", part);

        let path = format!("/projects/{}/uploads", self.config.gitlab.project_id);
        let value = self
            .client
            .execute(
                self.request(Method::POST, &path)
                    .timeout(Duration::from_secs(self.config.upload_request_timeout))
                    .multipart(form),
            )
            .await?
            .ok_or(ApiError::MissingField("upload"))?;

        let markdown = value["markdown"].as_str().unwrap_or_default();

        // absolutize the relative link the upload endpoint hands back
        let link = match regex::Regex::new(r"\[(.*)\]\((.*)\)")
            .ok()
            .and_then(|re| re.captures(markdown))
        {
            Some(captures) => format!(
                "[{}]({}/{}{})",
                &captures[1],
                self.config.gitlab.base_url.trim_end_matches('/'),
                self.config.git.repo,
                &captures[2]
            ),
            None => markdown.to_string(),
        };

        self.append_release_description(&release.tag, &link).await
    }

    async fn add_release_link(
        &self,
        release: &mut Release,
        name: &str,
        url: &str,
    ) -> Result<(), ApiError> {
        let link = format!("[{}]({})", name, url);
        self.append_release_description(&release.tag, &link).await
    }
}
