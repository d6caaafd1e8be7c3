//! Build admission and lifecycle driving
//!
//! The scheduler owns the pending queue and the running set. A 1 s loop
//! promotes eligible builds to running under four rules: the global
//! parallelism bound, one running build per board, group affinity (all builds
//! of the bound group finish before another group starts) and spin avoidance
//! when nothing admissible is queued. All state lives behind one mutex held
//! across each scheduling step, which keeps dequeue, admission and the begin
//! transition atomic with respect to other steps.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Configuration;
use crate::docker::{ContainerController, ContainerState};
use crate::events::{Event, EventBus};
use crate::loopdev::LoopDeviceAllocator;
use crate::util;

use super::{Build, BuildError, BuildGroup, BuildId, BuildInfo, BuildState, BuildType, GroupId};

/// Scheduling loop period
const TICK: Duration = Duration::from_secs(1);

/// Backoff when every queued build is blocked
const BACKOFF: Duration = Duration::from_secs(60);

/// Log lines shown for a failed build
const FAILED_LOG_LINES: usize = 20;

/// Board name used for custom-command builds, which target no real board
const CUSTOM_CMD_BOARD: &str = "dummyboard";

/// Completion summary of a group, as seen by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct GroupProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<BuildInfo>,
    pub running: Vec<BuildInfo>,
    pub image_files_by_board: HashMap<String, HashMap<String, PathBuf>>,
}

impl GroupProgress {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

struct BuildRequest {
    group: Option<GroupId>,
    build_type: BuildType,
    board: String,
    commit_id: Option<String>,
    tag: Option<String>,
    pr_no: Option<u64>,
    branch: Option<String>,
    version: Option<String>,
    custom_cmd: Option<String>,
    interactive: bool,
    done_tx: Option<oneshot::Sender<i32>>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<BuildId>,
    builds: HashMap<BuildId, Build>,
    groups: HashMap<GroupId, BuildGroup>,
    running_by_board: HashMap<String, BuildId>,
    builds_by_container: HashMap<String, BuildId>,
    current_group: Option<GroupId>,
    next_build_id: u64,
    next_group_id: u64,
}

/// The build scheduler
pub struct BuildScheduler {
    state: Mutex<SchedulerState>,
    events: EventBus,
    docker: Arc<ContainerController>,
    loop_devs: Arc<LoopDeviceAllocator>,
    config: Arc<Configuration>,
}

impl BuildScheduler {
    pub fn new(
        config: Arc<Configuration>,
        events: EventBus,
        docker: Arc<ContainerController>,
        loop_devs: Arc<LoopDeviceAllocator>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            events,
            docker,
            loop_devs,
            config,
        }
    }

    /// Create an empty build group.
    pub async fn new_group(&self) -> GroupId {
        let mut state = self.state.lock().await;
        let id = GroupId(state.next_group_id);
        state.next_group_id += 1;
        state.groups.insert(id, BuildGroup::new(id));
        id
    }

    /// Drop a finished group and its builds.
    pub async fn remove_group(&self, group: GroupId) {
        let mut state = self.state.lock().await;
        if let Some(removed) = state.groups.remove(&group) {
            for id in removed.build_ids().collect::<Vec<_>>() {
                state.builds.remove(&id);
            }
        }
    }

    pub async fn schedule_pr_build(
        &self,
        group: GroupId,
        board: &str,
        commit_id: &str,
        pr_no: u64,
    ) -> Result<BuildId, BuildError> {
        self.schedule(BuildRequest {
            group: Some(group),
            build_type: BuildType::PullRequest,
            board: board.to_string(),
            commit_id: Some(commit_id.to_string()),
            tag: None,
            pr_no: Some(pr_no),
            branch: None,
            version: None,
            custom_cmd: None,
            interactive: false,
            done_tx: None,
        })
        .await
    }

    pub async fn schedule_nightly_build(
        &self,
        group: GroupId,
        board: &str,
        commit_id: &str,
        branch: &str,
    ) -> Result<BuildId, BuildError> {
        let version = util::branches_format(
            &self.config.nightly.version_template,
            branch,
            Utc::now().date_naive(),
        );

        self.schedule(BuildRequest {
            group: Some(group),
            build_type: BuildType::Nightly,
            board: board.to_string(),
            commit_id: Some(commit_id.to_string()),
            tag: None,
            pr_no: None,
            branch: Some(branch.to_string()),
            version: Some(version),
            custom_cmd: None,
            interactive: false,
            done_tx: None,
        })
        .await
    }

    pub async fn schedule_tag_build(
        &self,
        group: GroupId,
        board: &str,
        commit_id: Option<&str>,
        tag: &str,
        version: &str,
    ) -> Result<BuildId, BuildError> {
        self.schedule(BuildRequest {
            group: Some(group),
            build_type: BuildType::Tag,
            board: board.to_string(),
            commit_id: commit_id.map(str::to_string),
            tag: Some(tag.to_string()),
            pr_no: None,
            branch: None,
            version: Some(version.to_string()),
            custom_cmd: None,
            interactive: false,
            done_tx: None,
        })
        .await
    }

    /// Schedule a one-off maintenance command and wait for it to finish.
    pub async fn run_custom_cmd(
        &self,
        custom_cmd: &str,
        interactive: bool,
    ) -> Result<BuildInfo, BuildError> {
        let (done_tx, done_rx) = oneshot::channel();

        let build_id = self
            .schedule(BuildRequest {
                group: None,
                build_type: BuildType::Custom,
                board: CUSTOM_CMD_BOARD.to_string(),
                commit_id: None,
                tag: None,
                pr_no: None,
                branch: None,
                version: None,
                custom_cmd: Some(custom_cmd.to_string()),
                interactive,
                done_tx: Some(done_tx),
            })
            .await?;

        let exit_code = done_rx.await.map_err(|_| BuildError::Replaced)?;

        let info = {
            let mut state = self.state.lock().await;
            state.builds.remove(&build_id).map(|build| build.info())
        };

        if exit_code != 0 {
            return Err(BuildError::CustomCommandFailed(exit_code));
        }

        info.ok_or(BuildError::Replaced)
    }

    /// Append a build to the pending queue, replacing any queued build with
    /// the same key (the newest wins).
    async fn schedule(&self, request: BuildRequest) -> Result<BuildId, BuildError> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let id = BuildId(state.next_build_id);
        state.next_build_id += 1;

        let loop_dev = match self.loop_devs.acquire() {
            Ok(dev) => Some(dev),
            Err(e) => {
                error!("failed to acquire loop device: {}", e);
                None
            }
        };

        let build = Build {
            id,
            service: self.config.repo_service.to_string(),
            group: request.group,
            build_type: request.build_type,
            board: request.board,
            commit_id: request.commit_id,
            tag: request.tag,
            pr_no: request.pr_no,
            branch: request.branch,
            version: request.version,
            custom_cmd: request.custom_cmd,
            interactive: request.interactive,
            loop_dev,
            container_id: None,
            exit_code: None,
            begin_time: None,
            end_time: None,
            image_files: HashMap::new(),
            done_tx: request.done_tx,
        };

        debug!("scheduling {}", build);

        if let Some(group_id) = request.group {
            let group = state
                .groups
                .get_mut(&group_id)
                .ok_or(BuildError::UnknownGroup(group_id))?;
            if let Err(e) = group.add_build(&build.board, id) {
                if let Some(dev) = &build.loop_dev {
                    let _ = self.loop_devs.release(dev);
                }
                return Err(e);
            }
        }

        // a queued build with the same key is replaced by the newest one
        let key = build.key();
        let replaced = state
            .queue
            .iter()
            .position(|queued| {
                state
                    .builds
                    .get(queued)
                    .map(|b| b.key() == key)
                    .unwrap_or(false)
            })
            .and_then(|pos| state.queue.remove(pos));

        if let Some(old_id) = replaced {
            if let Some(mut old) = state.builds.remove(&old_id) {
                debug!("replacing pending {}", old);
                // end-of-life for a build that never ran
                if let Some(dev) = old.loop_dev.take() {
                    if let Err(e) = self.loop_devs.release(&dev) {
                        error!("failed to release loop device {} of {}: {}", dev, old, e);
                    }
                }
            }
        }

        state.builds.insert(id, build);
        state.queue.push_back(id);
        debug!("{} queued builds", state.queue.len());

        Ok(id)
    }

    /// Summary of a group's members.
    pub async fn group_progress(&self, group: GroupId) -> Option<GroupProgress> {
        let state = self.state.lock().await;
        let group = state.groups.get(&group)?;

        let mut progress = GroupProgress {
            total: group.len(),
            ..Default::default()
        };

        for id in group.build_ids() {
            let Some(build) = state.builds.get(&id) else {
                continue;
            };
            match build.state() {
                BuildState::Ended => {
                    progress.completed += 1;
                    if build.exit_code != Some(0) {
                        progress.failed.push(build.info());
                    }
                    progress
                        .image_files_by_board
                        .insert(build.board.clone(), build.image_files.clone());
                }
                BuildState::Running => progress.running.push(build.info()),
                BuildState::Pending => {}
            }
        }

        Some(progress)
    }

    /// Spawn the scheduling loop and the container-exit watcher.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let scheduler = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut delay = TICK;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = scheduler.tick().await;
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut rx = scheduler.events.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = rx.recv() => match event {
                        Ok(Event::Container { id, state: ContainerState::Exited, exit_code }) => {
                            scheduler.on_container_exited(&id, exit_code.unwrap_or(1)).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("container event stream lagged by {} events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    /// The bus this scheduler publishes build and group events on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// One scheduling step. Returns the delay before the next one.
    pub(crate) async fn tick(&self) -> Duration {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        if state.queue.is_empty() {
            return TICK;
        }

        if state.running_by_board.len() >= self.config.docker.max_parallel {
            return TICK;
        }

        if state.running_by_board.is_empty() {
            state.current_group = None;
        }

        let all_boards_busy = state.queue.iter().all(|id| {
            state
                .builds
                .get(id)
                .map(|build| state.running_by_board.contains_key(&build.board))
                .unwrap_or(true)
        });
        if all_boards_busy {
            debug!("all queued builds correspond to currently building boards, retrying later");
            return BACKOFF;
        }

        if let Some(current) = state.current_group {
            let other_groups_only = state.queue.iter().all(|id| {
                state
                    .builds
                    .get(id)
                    .map(|build| build.group != Some(current))
                    .unwrap_or(true)
            });
            if other_groups_only {
                debug!("all queued builds correspond to another build group, retrying later");
                return BACKOFF;
            }
        }

        let build_id = match state.queue.pop_front() {
            Some(id) => id,
            None => return TICK,
        };

        let (board, group) = match state.builds.get(&build_id) {
            Some(build) => {
                debug!("dequeued {} ({} remaining queued builds)", build, state.queue.len());
                (build.board.clone(), build.group)
            }
            None => return TICK,
        };

        if state.running_by_board.contains_key(&board) {
            debug!("another build for board {} is currently running, pushing back", board);
            state.queue.push_back(build_id);
            return TICK;
        }

        if let Some(current) = state.current_group {
            if group != Some(current) {
                debug!("dequeued build belongs to another build group, pushing back");
                state.queue.push_back(build_id);
                return TICK;
            }
        }

        self.admit(state, build_id, board, group).await;
        TICK
    }

    /// Admit a dequeued build: bind it to the running set, launch its
    /// container and fire the begin transition.
    async fn admit(
        &self,
        state: &mut SchedulerState,
        build_id: BuildId,
        board: String,
        group: Option<GroupId>,
    ) {
        let (env, interactive) = match state.builds.get(&build_id) {
            Some(build) => (self.build_env(build), build.interactive),
            None => return,
        };

        state.running_by_board.insert(board.clone(), build_id);
        state.current_group = group;

        if let Some(build) = state.builds.get(&build_id) {
            debug!("starting {} ({} running builds)", build, state.running_by_board.len());
        }

        let container = match self.docker.run(env, self.volumes(), interactive).await {
            Ok(container) => container,
            Err(e) => {
                error!("failed to start build: {}", e);
                state.running_by_board.remove(&board);
                self.drop_build(state, build_id);
                return;
            }
        };

        let container_id = container.map(|c| c.id);
        if let Some(cid) = &container_id {
            state.builds_by_container.insert(cid.clone(), build_id);
        }

        let info = {
            let Some(build) = state.builds.get_mut(&build_id) else {
                return;
            };
            if let Err(e) = build.set_begin(container_id.clone()) {
                error!("cannot begin {}: {}", build, e);
                return;
            }
            debug!("{} has begun", build);
            build.info()
        };

        self.events.publish(Event::BuildBegun(info.clone()));

        if let Some(group_id) = group {
            if let Some(group) = state.groups.get_mut(&group_id) {
                if group.latch_first_begin() {
                    self.events.publish(Event::GroupFirstBuildBegun(info.clone()));
                }
            }
        }

        // interactive runs yield no container and are over already
        if container_id.is_none() {
            if let Err(e) = self.finish_locked(state, build_id, 0) {
                error!("cannot end interactive build: {}", e);
            }
        }
    }

    /// End the build bound to an exited container.
    pub async fn on_container_exited(&self, container_id: &str, exit_code: i32) {
        let info = {
            let mut state = self.state.lock().await;
            let state = &mut *state;

            let Some(&build_id) = state.builds_by_container.get(container_id) else {
                return;
            };

            match self.finish_locked(state, build_id, exit_code) {
                Ok(info) => info,
                Err(e) => {
                    error!("cannot end build of container {}: {}", container_id, e);
                    return;
                }
            }
        };

        if exit_code != 0 {
            match self.docker.log_tail(container_id, Some(FAILED_LOG_LINES)).await {
                Ok(tail) => error!("{} failed:\n\n ***\n\n{}\n\n ***\n", info, tail),
                Err(e) => warn!("cannot fetch log of failed {}: {}", info, e),
            }
        }
    }

    /// The end transition: release the loop device, harvest artifacts, update
    /// the running set and fire build/group events. Runs under the state lock.
    fn finish_locked(
        &self,
        state: &mut SchedulerState,
        build_id: BuildId,
        exit_code: i32,
    ) -> Result<BuildInfo, BuildError> {
        let info = {
            let build = state
                .builds
                .get_mut(&build_id)
                .ok_or(BuildError::Replaced)?;

            build.set_end(exit_code)?;

            if let Some(dev) = build.loop_dev.take() {
                if let Err(e) = self.loop_devs.release(&dev) {
                    error!("failed to release loop device {} of {}: {}", dev, build, e);
                }
            }

            build.collect_image_files(&self.config.dirs.output, &self.config.image_file_formats);

            let lifetime = build
                .end_time
                .unwrap_or_default()
                .signed_duration_since(build.begin_time.unwrap_or_default())
                .num_seconds();
            let how = if exit_code == 0 { "successfully" } else { "with error" };
            debug!("{} has ended {} (lifetime={}s)", build, how, lifetime);

            if let Some(tx) = build.done_tx.take() {
                let _ = tx.send(exit_code);
            }

            build.info()
        };

        if state.running_by_board.get(&info.board) == Some(&build_id) {
            state.running_by_board.remove(&info.board);
        } else {
            warn!("{} was not the current build for board {}", info, info.board);
        }
        if let Some(cid) = &info.container_id {
            state.builds_by_container.remove(cid);
        }
        debug!("{} running builds", state.running_by_board.len());

        self.events.publish(Event::BuildEnded(info.clone()));

        if let Some(group_id) = info.group {
            let all_ended = state
                .groups
                .get(&group_id)
                .map(|group| {
                    group.build_ids().all(|id| {
                        state
                            .builds
                            .get(&id)
                            .map(|build| build.state() == BuildState::Ended)
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);

            if let Some(group) = state.groups.get_mut(&group_id) {
                if group.latch_last_end(all_ended) {
                    self.events.publish(Event::GroupLastBuildEnded(info.clone()));
                }
            }
        }

        Ok(info)
    }

    /// Forget a build that will never run (failed launch). Its group, if any,
    /// loses the member; a group left with only ended members completes.
    fn drop_build(&self, state: &mut SchedulerState, build_id: BuildId) {
        let Some(mut build) = state.builds.remove(&build_id) else {
            return;
        };

        if let Some(dev) = build.loop_dev.take() {
            if let Err(e) = self.loop_devs.release(&dev) {
                error!("failed to release loop device {} of {}: {}", dev, build, e);
            }
        }

        let Some(group_id) = build.group else { return };

        if let Some(group) = state.groups.get_mut(&group_id) {
            group.remove_build(&build.board);
        }

        let is_empty = state
            .groups
            .get(&group_id)
            .map(|group| group.is_empty())
            .unwrap_or(true);
        if is_empty {
            state.groups.remove(&group_id);
            return;
        }

        let all_ended = state
            .groups
            .get(&group_id)
            .map(|group| {
                group.build_ids().all(|id| {
                    state
                        .builds
                        .get(&id)
                        .map(|build| build.state() == BuildState::Ended)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        if all_ended {
            let last_ended = state.groups.get(&group_id).and_then(|group| {
                group
                    .build_ids()
                    .filter_map(|id| state.builds.get(&id))
                    .last()
                    .map(|build| build.info())
            });

            if let (Some(group), Some(info)) = (state.groups.get_mut(&group_id), last_ended) {
                if group.latch_last_end(true) {
                    self.events.publish(Event::GroupLastBuildEnded(info));
                }
            }
        }
    }

    /// The environment contract handed to the builder container.
    fn build_env(&self, build: &Build) -> Vec<(String, String)> {
        let mut custom_cmd = build.custom_cmd.clone().unwrap_or_default();
        // workaround for when the runtime is reached through a wrapper (e.g. ssh)
        if !self.config.docker.command.starts_with("docker") {
            custom_cmd = format!("\"{}\"", custom_cmd);
        }

        let clone_args = if self.config.git.clone_depth > 0 {
            format!("--no-single-branch --depth {}", self.config.git.clone_depth)
        } else {
            String::new()
        };

        vec![
            ("TB_REPO".into(), self.config.git.url.clone()),
            ("TB_GIT_CLONE_ARGS".into(), clone_args),
            ("TB_BOARD".into(), build.board.clone()),
            ("TB_COMMIT".into(), build.commit_id.clone().unwrap_or_default()),
            ("TB_TAG".into(), build.tag.clone().unwrap_or_default()),
            (
                "TB_PR".into(),
                build.pr_no.map(|n| n.to_string()).unwrap_or_default(),
            ),
            ("TB_BRANCH".into(), build.branch.clone().unwrap_or_default()),
            ("TB_VERSION".into(), build.version.clone().unwrap_or_default()),
            ("TB_CUSTOM_CMD".into(), custom_cmd),
            (
                "TB_CLEAN_TARGET_ONLY".into(),
                self.config.clean_target_only.to_string(),
            ),
            ("TB_LOOP_DEV".into(), build.loop_dev.clone().unwrap_or_default()),
        ]
    }

    fn volumes(&self) -> Vec<(String, String)> {
        vec![
            (self.config.dirs.dl.display().to_string(), "/mnt/dl".into()),
            (self.config.dirs.ccache.display().to_string(), "/mnt/ccache".into()),
            (self.config.dirs.output.display().to_string(), "/mnt/output".into()),
        ]
    }

    #[cfg(test)]
    pub(crate) async fn queued_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    #[cfg(test)]
    async fn running_boards(&self) -> Vec<String> {
        let mut boards: Vec<String> = self
            .state
            .lock()
            .await
            .running_by_board
            .keys()
            .cloned()
            .collect();
        boards.sort();
        boards
    }

    #[cfg(test)]
    async fn running_container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .await
            .builds_by_container
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
