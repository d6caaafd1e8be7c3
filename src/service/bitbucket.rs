//! BitBucket adapter
//!
//! BitBucket carries no release entity at all: a "release" is the git tag,
//! and artifacts land in the repository downloads area.

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

pub struct BitBucket {
    config: Arc<Configuration>,
    client: ApiClient,
}

impl BitBucket {
    pub fn new(config: Arc<Configuration>) -> Result<Self, ApiError> {
        let client = ApiClient::new(
            "https://api.bitbucket.org/2.0",
            config.bitbucket.request_timeout,
        )?;
        Ok(Self { config, client })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, path)
            .basic_auth(
                &self.config.bitbucket.username,
                Some(&self.config.bitbucket.password),
            )
            .header("User-Agent", &self.config.git.repo)
    }
}

#[derive(Deserialize)]
struct RepoPushPayload {
    push: PushChanges,
}

#[derive(Deserialize)]
struct PushChanges {
    changes: Vec<PushChange>,
}

#[derive(Deserialize)]
struct PushChange {
    new: Option<ChangeTarget>,
}

#[derive(Deserialize)]
struct ChangeTarget {
    #[serde(rename = "type")]
    change_type: String,
    name: String,
    target: CommitTarget,
}

#[derive(Deserialize)]
struct CommitTarget {
    hash: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    pullrequest: PullRequestData,
}

#[derive(Deserialize)]
struct PullRequestData {
    id: u64,
    source: PullRequestSource,
}

#[derive(Deserialize)]
struct PullRequestSource {
    commit: CommitTarget,
}

#[async_trait]
impl RepoService for BitBucket {
    fn name(&self) -> &'static str {
        "bitbucket"
    }

    fn decode_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Vec<RepoEvent>, WebhookError> {
        // BitBucket webhooks carry no signature
        let event = headers
            .get("X-Event-Key")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let mut events = Vec::new();
        match event {
            "repo:push" => {
                let payload: RepoPushPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;

                for change in payload.push.changes {
                    let Some(target) = change.new else {
                        continue;
                    };

                    match target.change_type.as_str() {
                        "tag" => events.push(RepoEvent::Tag {
                            commit_id: Some(target.target.hash),
                            tag: target.name,
                        }),
                        "branch" => events.push(RepoEvent::Commit {
                            commit_id: target.target.hash,
                            branch: target.name,
                        }),
                        _ => {}
                    }
                }
            }
            "pullrequest:created" | "pullrequest:updated" => {
                let payload: PullRequestPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;
                let commit_id = payload.pullrequest.source.commit.hash;
                let pr_no = payload.pullrequest.id;

                if event.ends_with("created") {
                    events.push(RepoEvent::PullRequestOpened { commit_id, pr_no });
                } else {
                    events.push(RepoEvent::PullRequestUpdated { commit_id, pr_no });
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
            CommitStatus::Pending => "INPROGRESS",
            CommitStatus::Success => "SUCCESSFUL",
            CommitStatus::Failed => "FAILED",
        };

        let path = format!(
            "/repositories/{}/commit/{}/statuses/build",
            self.config.git.repo, commit_id
        );
        self.client
            .execute(self.request(Method::POST, &path).json(&json!({
                "state": state,
                "url": target_url,
                "description": description,
                "name": STATUS_CONTEXT,
                "key": commit_id,
            })))
            .await?;

        Ok(())
    }

    async fn create_release(&self, ctx: &ReleaseContext<'_>) -> Result<Release, ApiError> {
        debug!("creating tag {}", ctx.tag);

        let path = format!("/repositories/{}/refs/tags", self.config.git.repo);
        let result = self
            .client
            .execute(self.request(Method::POST, &path).json(&json!({
                "name": ctx.tag,
                "target": { "hash": ctx.commit_id.unwrap_or_default() },
            })))
            .await;

        match result {
            Ok(_) => debug!("tag created"),
            Err(ApiError::Status { message, .. }) if message.contains("already exists") => {
                debug!("tag already exists");
            }
            Err(e) => return Err(e),
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
        _release: &Release,
        name: &str,
        content: Vec<u8>,
    ) -> Result<(), ApiError> {
        let content_type = mime_guess::from_path(name).first_or_octet_stream();
        let part = Part::bytes(content)
            .file_name(name.to_string())
            .mime_str(content_type.as_ref())
            .map_err(ApiError::Request)?;
        let form = Form::new().part("files", part);

        let path = format!("/repositories/{}/downloads", self.config.git.repo);
        self.client
            .execute(
                self.request(Method::POST, &path)
                    .timeout(Duration::from_secs(self.config.upload_request_timeout))
                    .multipart(form),
            )
            .await?;

        Ok(())
    }

    async fn add_release_link(
        &self,
        _release: &mut Release,
        name: &str,
        _url: &str,
    ) -> Result<(), ApiError> {
        // downloads have no description to link from
        debug!("no release description on this service, skipping link for {}", name);
        Ok(())
    }
}
