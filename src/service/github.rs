//! GitHub adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use sha1::Sha1;
use tracing::{debug, warn};

use crate::build::{BuildScheduler, BuildType};
use crate::config::Configuration;

use super::http::{ApiClient, ApiError};
use super::{
    CommitStatus, Release, ReleaseContext, RepoEvent, RepoService, WebhookError, STATUS_CONTEXT,
};

/// Maximum status description length accepted by GitHub
const MAX_DESCRIPTION_LEN: usize = 140;

type HmacSha1 = Hmac<Sha1>;

pub struct GitHub {
    config: Arc<Configuration>,
    client: ApiClient,
    scheduler: Arc<BuildScheduler>,
}

impl GitHub {
    pub fn new(
        config: Arc<Configuration>,
        scheduler: Arc<BuildScheduler>,
    ) -> Result<Self, ApiError> {
        let client = ApiClient::new("https://api.github.com", config.github.request_timeout)?;
        Ok(Self {
            config,
            client,
            scheduler,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, path)
            .header("Authorization", format!("token {}", self.config.github.access_token))
            .header("User-Agent", &self.config.git.repo)
            .header("Content-Type", "application/json")
    }

    /// Check the HMAC-SHA1 body signature against the shared secret.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let signature = headers
            .get("X-Hub-Signature")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("sha1="))
            .ok_or(WebhookError::Auth)?;
        let signature = hex::decode(signature).map_err(|_| WebhookError::Auth)?;

        let mut mac = HmacSha1::new_from_slice(self.config.web.secret.as_bytes())
            .map_err(|_| WebhookError::Auth)?;
        mac.update(body);
        mac.verify_slice(&signature).map_err(|_| WebhookError::Auth)
    }
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullRequestData,
}

#[derive(Deserialize)]
struct PullRequestData {
    number: u64,
    head: PullRequestHead,
}

#[derive(Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Deserialize)]
struct PushPayload {
    head_commit: Option<HeadCommit>,
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Deserialize)]
struct HeadCommit {
    id: String,
}

#[async_trait]
impl RepoService for GitHub {
    fn name(&self) -> &'static str {
        "github"
    }

    fn decode_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Vec<RepoEvent>, WebhookError> {
        self.verify_signature(headers, body)?;

        let event = headers
            .get("X-GitHub-Event")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let mut events = Vec::new();
        match event {
            "pull_request" => {
                let payload: PullRequestPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;
                let commit_id = payload.pull_request.head.sha;
                let pr_no = payload.pull_request.number;

                match payload.action.as_str() {
                    "opened" => events.push(RepoEvent::PullRequestOpened { commit_id, pr_no }),
                    "synchronize" | "edited" => {
                        events.push(RepoEvent::PullRequestUpdated { commit_id, pr_no })
                    }
                    _ => {}
                }
            }
            "push" => {
                let payload: PushPayload = serde_json::from_slice(body)
                    .map_err(|e| WebhookError::Payload(e.to_string()))?;
                if let Some(head_commit) = payload.head_commit {
                    let name = payload
                        .git_ref
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();

                    if payload.git_ref.starts_with("refs/tags/") {
                        events.push(RepoEvent::Tag {
                            commit_id: Some(head_commit.id),
                            tag: name,
                        });
                    } else {
                        events.push(RepoEvent::Commit {
                            commit_id: head_commit.id,
                            branch: name,
                        });
                    }
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
            CommitStatus::Failed => "failure",
        };
        let description: String = description.chars().take(MAX_DESCRIPTION_LEN).collect();

        let path = format!("/repos/{}/statuses/{}", self.config.git.repo, commit_id);
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
        let repo = &self.config.git.repo;

        debug!("looking for release {}", ctx.tag);
        let path = format!("/repos/{}/releases/tags/{}", repo, ctx.tag);
        let existing = match self.client.execute(self.request(Method::GET, &path)).await {
            Ok(value) => value.and_then(|v| v["id"].as_i64()),
            Err(e) if e.http_status() == Some(404) => None,
            Err(e) => return Err(e),
        };

        if let Some(release_id) = existing {
            debug!("removing previous release {} (id {})", ctx.tag, release_id);
            let path = format!("/repos/{}/releases/{}", repo, release_id);
            self.client
                .execute(self.request(Method::DELETE, &path))
                .await?;

            // the git tag itself has to go too, through the build pipeline
            let custom_cmd = format!("git push --delete origin {}", ctx.tag);
            match self.scheduler.run_custom_cmd(&custom_cmd, false).await {
                Ok(_) => debug!("git tag {} removed", ctx.tag),
                Err(e) => warn!("failed to remove git tag {}: {}", ctx.tag, e),
            }
        }

        debug!("creating release {}", ctx.tag);
        let mut body = json!({
            "tag_name": ctx.tag,
            "name": ctx.name,
            "prerelease": true,
            // never automatically publish a tag build
            "draft": ctx.build_type == BuildType::Tag,
        });
        if let Some(target) = ctx.commit_id.or(ctx.branch) {
            body["target_commitish"] = json!(target);
        }

        let path = format!("/repos/{}/releases", repo);
        let value = self
            .client
            .execute(self.request(Method::POST, &path).json(&body))
            .await?
            .ok_or(ApiError::MissingField("release"))?;

        Ok(Release {
            id: value["id"].as_i64(),
            tag: ctx.tag.to_string(),
            name: ctx.name.to_string(),
            upload_url: value["upload_url"].as_str().map(str::to_string),
            body: value["body"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn upload_release_file(
        &self,
        release: &Release,
        name: &str,
        content: Vec<u8>,
    ) -> Result<(), ApiError> {
        let upload_url = release
            .upload_url
            .as_deref()
            .ok_or(ApiError::MissingField("upload_url"))?;
        // strip the {?name,label} URI template suffix
        let url = upload_url.split('{').next().unwrap_or(upload_url);

        let content_type = mime_guess::from_path(name).first_or_octet_stream();
        let request = self
            .request(Method::POST, url)
            .query(&[("name", name)])
            .header("Content-Type", content_type.as_ref())
            .timeout(Duration::from_secs(self.config.upload_request_timeout))
            .body(content);

        self.client.execute(request).await?;
        Ok(())
    }

    async fn add_release_link(
        &self,
        release: &mut Release,
        name: &str,
        url: &str,
    ) -> Result<(), ApiError> {
        let release_id = release.id.ok_or(ApiError::MissingField("id"))?;

        let link = format!("[{}]({})", name, url);
        release.body = if release.body.is_empty() {
            link
        } else {
            format!("{}\n{}", release.body, link)
        };

        let mut body = json!({ "body": release.body });
        if !release.tag.is_empty() {
            body["tag_name"] = json!(release.tag);
        }

        let path = format!("/repos/{}/releases/{}", self.config.git.repo, release_id);
        self.client
            .execute(self.request(Method::PATCH, &path).json(&body))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ContainerController;
    use crate::events::EventBus;
    use crate::loopdev::LoopDeviceAllocator;

    fn github(config: Configuration) -> GitHub {
        let config = Arc::new(config);
        let events = EventBus::new();
        let docker = Arc::new(ContainerController::new(&config, events.clone()).unwrap());
        let loop_devs = Arc::new(LoopDeviceAllocator::new(200, 203));
        let scheduler = Arc::new(BuildScheduler::new(
            config.clone(),
            events,
            docker,
            loop_devs,
        ));
        GitHub::new(config, scheduler).unwrap()
    }

    fn signed_headers(secret: &str, body: &[u8], event: &str) -> HeaderMap {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Hub-Signature",
            format!("sha1={}", signature).parse().unwrap(),
        );
        headers.insert("X-GitHub-Event", event.parse().unwrap());
        headers
    }

    fn test_config() -> Configuration {
        let mut config = Configuration::default();
        config.web.secret = "deadbeef".into();
        config.git.repo = "owner/project".into();
        config
    }

    #[test]
    fn test_webhook_bad_signature_rejected() {
        let service = github(test_config());
        let body = br#"{"action": "opened"}"#;

        let mut headers = signed_headers("wrong-secret", body, "pull_request");
        let result = service.decode_webhook(&headers, body);
        assert!(matches!(result, Err(WebhookError::Auth)));

        headers.remove("X-Hub-Signature");
        let result = service.decode_webhook(&headers, body);
        assert!(matches!(result, Err(WebhookError::Auth)));
    }

    #[test]
    fn test_webhook_pull_request_opened() {
        let service = github(test_config());
        let body = br#"{
            "action": "opened",
            "pull_request": {"number": 17, "head": {"sha": "abc123"}}
        }"#;
        let headers = signed_headers("deadbeef", body, "pull_request");

        let events = service.decode_webhook(&headers, body).unwrap();
        assert_eq!(
            events,
            vec![RepoEvent::PullRequestOpened {
                commit_id: "abc123".into(),
                pr_no: 17
            }]
        );
    }

    #[test]
    fn test_webhook_push_branch_and_tag() {
        let service = github(test_config());

        let body = br#"{"head_commit": {"id": "abc123"}, "ref": "refs/heads/dev"}"#;
        let headers = signed_headers("deadbeef", body, "push");
        let events = service.decode_webhook(&headers, body).unwrap();
        assert_eq!(
            events,
            vec![RepoEvent::Commit {
                commit_id: "abc123".into(),
                branch: "dev".into()
            }]
        );

        let body = br#"{"head_commit": {"id": "abc123"}, "ref": "refs/tags/20230815"}"#;
        let headers = signed_headers("deadbeef", body, "push");
        let events = service.decode_webhook(&headers, body).unwrap();
        assert_eq!(
            events,
            vec![RepoEvent::Tag {
                commit_id: Some("abc123".into()),
                tag: "20230815".into()
            }]
        );
    }

    #[test]
    fn test_webhook_deleted_branch_ignored() {
        let service = github(test_config());
        let body = br#"{"head_commit": null, "ref": "refs/heads/dev"}"#;
        let headers = signed_headers("deadbeef", body, "push");
        assert!(service.decode_webhook(&headers, body).unwrap().is_empty());
    }
}
