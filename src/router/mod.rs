//! HTTP surface
//!
//! Three endpoints: the configured provider's webhook receiver, a manual
//! trigger for nightly/tag groups, and a plain-text container log tail used
//! as the target of commit-status links.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Configuration;
use crate::docker::ContainerController;
use crate::orchestrator::ReleaseOrchestrator;
use crate::service::{RepoService, WebhookError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub orchestrator: Arc<ReleaseOrchestrator>,
    pub service: Arc<dyn RepoService>,
    pub docker: Arc<ContainerController>,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    let service_path = format!("/{}", state.service.name());

    Router::new()
        .route(&service_path, post(webhook).get(log_tail))
        .route("/trigger", post(trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Decode a webhook delivery and feed the canonical events to the orchestrator.
async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let events = match state.service.decode_webhook(&headers, &body) {
        Ok(events) => events,
        Err(WebhookError::Auth) => {
            warn!("webhook authentication failed");
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
        Err(WebhookError::Payload(message)) => {
            warn!("malformed webhook payload: {}", message);
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    for event in events {
        state.orchestrator.handle_event(event).await;
    }

    StatusCode::NO_CONTENT.into_response()
}

/// Plain-text tail of a build container's log.
async fn log_tail(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, "missing id").into_response();
    };
    let lines = params.get("lines").map(|lines| lines.parse().unwrap_or(1));

    match state.docker.log_tail(id, lines).await {
        Ok(log) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            log,
        )
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// Manual trigger: `?type=nightly&branch=…` or `?type=tag&tag=…`.
async fn trigger(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("type").map(String::as_str) {
        Some("nightly") => {
            let Some(branch) = params.get("branch") else {
                return (StatusCode::BAD_REQUEST, "missing branch").into_response();
            };
            state.orchestrator.schedule_nightly_build(None, branch).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Some("tag") => {
            let Some(tag) = params.get("tag") else {
                return (StatusCode::BAD_REQUEST, "missing tag").into_response();
            };
            state.orchestrator.handle_new_tag(None, tag).await;
            StatusCode::NO_CONTENT.into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            format!("unknown type {}", other.unwrap_or_default()),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tower::ServiceExt;

    use crate::build::BuildScheduler;
    use crate::events::EventBus;
    use crate::loopdev::LoopDeviceAllocator;
    use crate::persist::BranchState;
    use crate::service;

    fn app(dir: &Path) -> (Router, Arc<BuildScheduler>, Arc<ReleaseOrchestrator>) {
        let script = dir.join("runtime.sh");
        std::fs::write(&script, "#!/bin/sh\necho cid1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Configuration::default();
        config.web.secret = "deadbeef".into();
        config.git.repo = "owner/project".into();
        config.boards = vec!["raspberrypi".into()];
        config.nightly.branches = vec!["dev".into()];
        config.release_tag_regex = Some(r"\d{8}".into());
        config.docker.command = script.display().to_string();
        config.dirs.persist = dir.join("persist");
        config.dirs.output = dir.join("output");
        config.dirs.build_logs = dir.join("logs");
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.dirs.persist).unwrap();

        let events = EventBus::new();
        let docker = Arc::new(ContainerController::new(&config, events.clone()).unwrap());
        let loop_devs = Arc::new(LoopDeviceAllocator::new(500, 503));
        let scheduler = Arc::new(BuildScheduler::new(
            config.clone(),
            events,
            docker.clone(),
            loop_devs,
        ));
        let state = Arc::new(BranchState::load(&config.dirs.persist).unwrap());
        let repo_service = service::create(&config, scheduler.clone()).unwrap();
        let orchestrator = Arc::new(ReleaseOrchestrator::new(
            config.clone(),
            scheduler.clone(),
            repo_service.clone(),
            state,
            None,
        ));

        let router = build_router(AppState {
            config,
            orchestrator: orchestrator.clone(),
            service: repo_service,
            docker,
        });

        (router, scheduler, orchestrator)
    }

    #[tokio::test]
    async fn test_invalid_signature_is_401_and_schedules_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (app, scheduler, _) = app(dir.path());

        let request = Request::builder()
            .method("POST")
            .uri("/github")
            .header("X-Hub-Signature", "sha1=0000000000000000000000000000000000000000")
            .header("X-GitHub-Event", "push")
            .body(Body::from(
                r#"{"head_commit": {"id": "abc123"}, "ref": "refs/heads/dev"}"#,
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(scheduler.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_valid_webhook_schedules_builds() {
        use hmac::{Hmac, Mac};

        let dir = tempfile::tempdir().unwrap();
        let (app, scheduler, _) = app(dir.path());

        let body = r#"{"head_commit": {"id": "abc123"}, "ref": "refs/heads/dev"}"#;
        let mut mac = Hmac::<sha1::Sha1>::new_from_slice(b"deadbeef").unwrap();
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/github")
            .header("X-Hub-Signature", format!("sha1={}", signature))
            .header("X-GitHub-Event", "push")
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(scheduler.queued_len().await, 1);
    }

    #[tokio::test]
    async fn test_trigger_nightly_uses_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (app, scheduler, orchestrator) = app(dir.path());

        // an observed commit is required for a manual nightly replay
        orchestrator.handle_commit("abc123", "feature").await;
        orchestrator.handle_commit("def456", "dev").await;
        let already_queued = scheduler.queued_len().await;

        let request = Request::builder()
            .method("POST")
            .uri("/trigger?type=nightly&branch=dev")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        // same key as the push-triggered build: replaced, not duplicated
        assert_eq!(scheduler.queued_len().await, already_queued);
    }

    #[tokio::test]
    async fn test_trigger_unknown_type_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, _) = app(dir.path());

        let request = Request::builder()
            .method("POST")
            .uri("/trigger?type=weekly")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_tail_requires_id() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, _) = app(dir.path());

        let request = Request::builder()
            .method("GET")
            .uri("/github")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
