//! Release orchestration
//!
//! Consumes canonical repository events, turns qualifying ones into build
//! groups (one build per board), keeps the originating commit's status check
//! current while the group runs, and on success publishes the artifacts as a
//! release, optionally mirrored to blob storage.

mod trigger;

pub use trigger::FixedHourTrigger;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::build::{BuildInfo, BuildScheduler, BuildType, GroupProgress};
use crate::config::Configuration;
use crate::events::Event;
use crate::persist::BranchState;
use crate::s3::BlobUploader;
use crate::service::{CommitStatus, ReleaseContext, RepoEvent, RepoService};
use crate::util;

/// Log lines linked from commit statuses
const STATUS_LOG_LINES: usize = 100;

pub struct ReleaseOrchestrator {
    config: Arc<Configuration>,
    scheduler: Arc<BuildScheduler>,
    service: Arc<dyn RepoService>,
    state: Arc<BranchState>,
    uploader: Option<Arc<dyn BlobUploader>>,
}

impl ReleaseOrchestrator {
    pub fn new(
        config: Arc<Configuration>,
        scheduler: Arc<BuildScheduler>,
        service: Arc<dyn RepoService>,
        state: Arc<BranchState>,
        uploader: Option<Arc<dyn BlobUploader>>,
    ) -> Self {
        Self {
            config,
            scheduler,
            service,
            state,
            uploader,
        }
    }

    /// Consume scheduler events on one task; group handling stays serialized.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let orchestrator = self.clone();
        let events = orchestrator.scheduler.events().clone();
        tokio::spawn(async move {
            let mut rx = events.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = rx.recv() => match event {
                        Ok(Event::GroupFirstBuildBegun(info)) => {
                            orchestrator.on_first_build_begin(&info).await;
                        }
                        Ok(Event::BuildEnded(info)) if info.group.is_some() => {
                            orchestrator.on_build_end(&info).await;
                        }
                        Ok(Event::GroupLastBuildEnded(info)) => {
                            orchestrator.on_last_build_end(&info).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("build event stream lagged by {} events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    /// Dispatch a canonical repository event.
    pub async fn handle_event(&self, event: RepoEvent) {
        match event {
            RepoEvent::PullRequestOpened { commit_id, pr_no } => {
                debug!("pull request {} opened ({})", pr_no, commit_id);
                self.handle_pull_request(&commit_id, pr_no).await;
            }
            RepoEvent::PullRequestUpdated { commit_id, pr_no } => {
                debug!("pull request {} updated ({})", pr_no, commit_id);
                self.handle_pull_request(&commit_id, pr_no).await;
            }
            RepoEvent::Commit { commit_id, branch } => {
                self.handle_commit(&commit_id, &branch).await;
            }
            RepoEvent::Tag { commit_id, tag } => {
                self.handle_new_tag(commit_id.as_deref(), &tag).await;
            }
        }
    }

    async fn handle_pull_request(&self, commit_id: &str, pr_no: u64) {
        if !self.config.pull_requests {
            debug!("pull requests ignored");
            return;
        }

        let group = self.scheduler.new_group().await;
        for board in &self.config.boards {
            if let Err(e) = self
                .scheduler
                .schedule_pr_build(group, board, commit_id, pr_no)
                .await
            {
                error!("cannot schedule build of PR {} for board {}: {}", pr_no, board, e);
            }
        }
    }

    pub async fn handle_commit(&self, commit_id: &str, branch: &str) {
        debug!("commit to {} ({})", branch, commit_id);

        if let Err(e) = self.state.set_last_commit(branch, commit_id) {
            error!("cannot persist branch state: {}", e);
        }

        if !self.config.nightly.branches.iter().any(|b| b == branch) {
            debug!("branch {} ignored", branch);
            return;
        }

        if self.config.nightly.fixed_hour.is_none() {
            // build right away; otherwise the fixed-hour trigger takes over
            self.schedule_nightly_build(Some(commit_id.to_string()), branch)
                .await;
        }
    }

    pub async fn handle_new_tag(&self, commit_id: Option<&str>, tag: &str) {
        let commit_id = match commit_id {
            Some(commit_id) => {
                if let Err(e) = self.state.set_commit_for_tag(tag, commit_id) {
                    error!("cannot persist tag state: {}", e);
                }
                Some(commit_id.to_string())
            }
            // manual trigger: fall back to the commit observed with the tag
            None => self.state.commit_for_tag(tag),
        };

        debug!("new tag: {} ({})", tag, commit_id.as_deref().unwrap_or("unknown commit"));

        let Some(version) = self.version_from_tag(tag) else {
            debug!("release: tag {} ignored", tag);
            return;
        };

        let group = self.scheduler.new_group().await;
        for board in &self.config.boards {
            if let Err(e) = self
                .scheduler
                .schedule_tag_build(group, board, commit_id.as_deref(), tag, &version)
                .await
            {
                error!("cannot schedule build of tag {} for board {}: {}", tag, board, e);
            }
        }
    }

    /// Schedule a nightly group at the given commit, or at the branch's last
    /// observed commit.
    pub async fn schedule_nightly_build(&self, commit_id: Option<String>, branch: &str) {
        let Some(commit_id) = commit_id.or_else(|| self.state.last_commit(branch)) else {
            warn!("no known commit for branch {}, not scheduling nightly build", branch);
            return;
        };

        let group = self.scheduler.new_group().await;
        for board in &self.config.boards {
            if let Err(e) = self
                .scheduler
                .schedule_nightly_build(group, board, &commit_id, branch)
                .await
            {
                error!("cannot schedule nightly build for board {}: {}", board, e);
            }
        }

        if let Err(e) = self.state.set_last_nightly_commit(branch, &commit_id) {
            error!("cannot persist branch state: {}", e);
        }
    }

    /// The version a qualifying tag builds as, or None when the tag does not
    /// match `release_tag_regex`.
    fn version_from_tag(&self, tag: &str) -> Option<String> {
        let pattern = self
            .config
            .release_tag_regex
            .as_deref()
            .filter(|pattern| !pattern.is_empty())?;
        let re = regex::Regex::new(pattern).ok()?;
        let captures = re.captures(tag)?;
        if captures.get(0).map(|m| m.start()) != Some(0) {
            return None;
        }

        Some(
            captures
                .get(1)
                .map(|group| group.as_str().to_string())
                .unwrap_or_else(|| tag.to_string()),
        )
    }

    fn log_url(&self, container_id: Option<&str>) -> String {
        format!(
            "{}/{}?id={}&lines={}",
            self.config.web.base_url.trim_end_matches('/'),
            self.service.name(),
            container_id.unwrap_or_default(),
            STATUS_LOG_LINES
        )
    }

    async fn on_first_build_begin(&self, info: &BuildInfo) {
        debug!("handling first {} begin", info);

        let Some(group) = info.group else { return };
        let Some(progress) = self.scheduler.group_progress(group).await else {
            return;
        };

        if progress.completed == 0 {
            self.set_pending_status(info, &progress).await;
        }
    }

    async fn on_build_end(&self, info: &BuildInfo) {
        debug!("handling {} end", info);

        let Some(group) = info.group else { return };
        let Some(progress) = self.scheduler.group_progress(group).await else {
            return;
        };

        if progress.remaining() == 0 {
            return; // the last-end handler takes it from here
        }

        self.set_pending_status(info, &progress).await;
    }

    async fn on_last_build_end(&self, info: &BuildInfo) {
        debug!("handling last {} end", info);

        let Some(group) = info.group else { return };
        let Some(progress) = self.scheduler.group_progress(group).await else {
            return;
        };

        if progress.failed.is_empty() {
            let description = format!(
                "OS images successfully built ({}/{})",
                progress.total, progress.total
            );
            let url = self.log_url(info.container_id.as_deref());
            if let Err(e) = self
                .service
                .set_status(info.commit_id.as_deref(), CommitStatus::Success, &url, &description)
                .await
            {
                error!("set status failed: {}", e);
            }

            if matches!(info.build_type, BuildType::Nightly | BuildType::Tag) {
                if let Err(e) = self
                    .handle_release(info, &progress.image_files_by_board)
                    .await
                {
                    error!("release of {} failed: {}", info, e);
                }
            }
        } else {
            let failed_boards = progress
                .failed
                .iter()
                .map(|build| build.board.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let description = format!("failed to build some OS images: {}", failed_boards);
            let url = self.log_url(progress.failed[0].container_id.as_deref());
            if let Err(e) = self
                .service
                .set_status(info.commit_id.as_deref(), CommitStatus::Failed, &url, &description)
                .await
            {
                error!("set status failed: {}", e);
            }
        }

        self.scheduler.remove_group(group).await;
    }

    async fn set_pending_status(&self, info: &BuildInfo, progress: &GroupProgress) {
        debug!(
            "setting pending status for {} ({}/{})",
            info.commit_id.as_deref().unwrap_or_default(),
            progress.completed,
            progress.total
        );

        // link the log of a build that is actually running, when one is
        let running_container = progress
            .running
            .first()
            .and_then(|build| build.container_id.clone())
            .or_else(|| info.container_id.clone());
        let url = self.log_url(running_container.as_deref());
        let description = format!(
            "building OS images ({}/{})",
            progress.completed, progress.total
        );

        if let Err(e) = self
            .service
            .set_status(info.commit_id.as_deref(), CommitStatus::Pending, &url, &description)
            .await
        {
            error!("set status failed: {}", e);
        }
    }

    /// Publish a successful nightly/tag group: create (or replace) the
    /// release and upload each board's artifacts.
    async fn handle_release(
        &self,
        info: &BuildInfo,
        image_files_by_board: &HashMap<String, HashMap<String, PathBuf>>,
    ) -> Result<(), crate::service::ApiError> {
        if let Some(tag) = &info.tag {
            if self.version_from_tag(tag).is_none() {
                debug!("release: tag {} ignored", tag);
                return Ok(());
            }
        }

        let today = Utc::now().date_naive();
        let branch = info.branch.as_deref().unwrap_or_default();
        let tag = info
            .tag
            .clone()
            .unwrap_or_else(|| util::branches_format(&self.config.nightly.tag_template, branch, today));
        let name = match info.build_type {
            BuildType::Tag => info.version.clone().unwrap_or_else(|| tag.clone()),
            _ => util::branches_format(&self.config.nightly.name_template, branch, today),
        };

        debug!(
            "handling release on commit={}, tag={}, version={}, branch={}",
            info.commit_id.as_deref().unwrap_or_default(),
            tag,
            info.version.as_deref().unwrap_or_default(),
            branch
        );

        let ctx = ReleaseContext {
            commit_id: info.commit_id.as_deref(),
            tag: &tag,
            name: &name,
            branch: info.branch.as_deref(),
            build_type: info.build_type,
        };
        let mut release = self.service.create_release(&ctx).await?;

        for board in &self.config.boards {
            let Some(image_files) = image_files_by_board.get(board) else {
                warn!("no image files supplied for board {}", board);
                continue;
            };

            for format in &self.config.image_file_formats {
                let Some(image_file) = image_files.get(format) else {
                    warn!("no image files supplied for board {}, format {}", board, format);
                    continue;
                };

                let file_name = image_file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let content = match std::fs::read(image_file) {
                    Ok(content) => content,
                    Err(e) => {
                        error!("cannot read image file {}: {}", image_file.display(), e);
                        continue;
                    }
                };

                if self.config.upload_service_build_types.contains(&info.build_type) {
                    debug!("uploading image file {} ({} bytes)", file_name, content.len());
                    if let Err(e) = self
                        .service
                        .upload_release_file(&release, &file_name, content.clone())
                        .await
                    {
                        error!("failed to upload file {}: {}", file_name, e);
                    }
                }

                if let Some(uploader) = &self.uploader {
                    if self.config.s3.build_types.contains(&info.build_type) {
                        self.mirror_to_blob_storage(
                            uploader,
                            &mut release,
                            info,
                            &tag,
                            &file_name,
                            content,
                        )
                        .await;
                    }
                }

                if let Some(script) = self.config.release_script.clone() {
                    run_release_script(&script, image_file, board, format, info.build_type).await;
                }
            }
        }

        debug!("release on tag={} completed", tag);
        Ok(())
    }

    async fn mirror_to_blob_storage(
        &self,
        uploader: &Arc<dyn BlobUploader>,
        release: &mut crate::service::Release,
        info: &BuildInfo,
        tag: &str,
        file_name: &str,
        content: Vec<u8>,
    ) {
        let name = self
            .config
            .s3
            .filename_map
            .as_ref()
            .map(|map| map.apply(file_name))
            .unwrap_or_else(|| file_name.to_string());
        let version = info.version.clone().unwrap_or_else(|| tag.to_string());
        let key = format!("{}/{}/{}", self.config.s3.path, version, name);

        match uploader.upload(&key, content).await {
            Ok(()) => {
                if self.config.s3.add_release_link {
                    let url = uploader.object_url(&key);
                    if let Err(e) = self.service.add_release_link(release, &name, &url).await {
                        error!("failed to add release link for {}: {}", name, e);
                    }
                }
            }
            Err(e) => error!("failed to upload {} to blob storage: {}", name, e),
        }
    }
}

/// Invoke the external release script with `(imageFile, board, format,
/// buildType)`; failures are logged, never fatal.
async fn run_release_script(
    script: &Path,
    image_file: &Path,
    board: &str,
    format: &str,
    build_type: BuildType,
) {
    debug!(
        "calling release script {} with {} {} {} {}",
        script.display(),
        image_file.display(),
        board,
        format,
        build_type
    );

    let output = tokio::process::Command::new(script)
        .arg(image_file)
        .arg(board)
        .arg(format)
        .arg(build_type.as_str())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            debug!(
                "release script output:\n{}",
                String::from_utf8_lossy(&output.stdout)
            );
        }
        Ok(output) => {
            error!("release script call failed");
            error!(
                "release script output:\n{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Err(e) => error!("release script call failed: {}", e),
    }
}
