//! Fixed-hour nightly trigger
//!
//! Wakes once per minute and, at most once per calendar day, when the
//! wall-clock hour matches the configured nightly hour, replays nightly
//! groups for branches whose last observed commit is newer than the last
//! nightly one. The day guard is process-local; a restart near the trigger
//! hour may schedule a second time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Configuration;
use crate::persist::BranchState;

use super::ReleaseOrchestrator;

/// Wake period
const WAKE_INTERVAL: Duration = Duration::from_secs(60);

pub struct FixedHourTrigger {
    config: Arc<Configuration>,
    state: Arc<BranchState>,
    orchestrator: Arc<ReleaseOrchestrator>,
}

impl FixedHourTrigger {
    pub fn new(
        config: Arc<Configuration>,
        state: Arc<BranchState>,
        orchestrator: Arc<ReleaseOrchestrator>,
    ) -> Self {
        Self {
            config,
            state,
            orchestrator,
        }
    }

    /// Spawn the trigger loop. Only meaningful when a fixed hour is configured.
    pub fn spawn(self, shutdown: CancellationToken) {
        let Some(fixed_hour) = self.config.nightly.fixed_hour else {
            return;
        };

        tokio::spawn(async move {
            let mut last_run_day = 0;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(WAKE_INTERVAL) => {}
                }

                let now = Local::now();
                if now.day() == last_run_day {
                    continue;
                }
                if now.hour() != fixed_hour {
                    continue;
                }
                last_run_day = now.day();

                debug!("running fixed hour nightly build check");
                self.schedule_for_new_commits().await;
            }
        });
    }

    /// Schedule a nightly group for every configured branch whose head moved
    /// since the last nightly build.
    async fn schedule_for_new_commits(&self) {
        for branch in &self.config.nightly.branches {
            let Some(last_commit) = self.state.last_commit(branch) else {
                continue;
            };

            if self.state.last_nightly_commit(branch).as_ref() != Some(&last_commit) {
                debug!("new commit found on branch {}", branch);
                self.orchestrator
                    .schedule_nightly_build(Some(last_commit), branch)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use crate::build::BuildScheduler;
    use crate::docker::ContainerController;
    use crate::events::EventBus;
    use crate::loopdev::LoopDeviceAllocator;
    use crate::service;

    async fn trigger_fixture(dir: &std::path::Path) -> (FixedHourTrigger, Arc<BuildScheduler>, Arc<BranchState>) {
        let script = dir.join("runtime.sh");
        std::fs::write(&script, "#!/bin/sh\necho cid1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Configuration::default();
        config.git.repo = "owner/project".into();
        config.boards = vec!["raspberrypi".into()];
        config.nightly.branches = vec!["dev".into()];
        config.nightly.fixed_hour = Some(2);
        config.docker.command = script.display().to_string();
        config.dirs.persist = dir.join("persist");
        config.dirs.output = dir.join("output");
        config.dirs.build_logs = dir.join("logs");
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.dirs.persist).unwrap();

        let events = EventBus::new();
        let docker = Arc::new(ContainerController::new(&config, events.clone()).unwrap());
        let loop_devs = Arc::new(LoopDeviceAllocator::new(400, 403));
        let scheduler = Arc::new(BuildScheduler::new(
            config.clone(),
            events,
            docker,
            loop_devs,
        ));
        let state = Arc::new(BranchState::load(&config.dirs.persist).unwrap());
        let repo_service = service::create(&config, scheduler.clone()).unwrap();
        let orchestrator = Arc::new(ReleaseOrchestrator::new(
            config.clone(),
            scheduler.clone(),
            repo_service,
            state.clone(),
            None,
        ));

        (
            FixedHourTrigger::new(config, state.clone(), orchestrator),
            scheduler,
            state,
        )
    }

    #[tokio::test]
    async fn test_schedules_only_for_new_commits() {
        let dir = tempfile::tempdir().unwrap();
        let (trigger, scheduler, state) = trigger_fixture(dir.path()).await;

        // nothing known yet: nothing scheduled
        trigger.schedule_for_new_commits().await;
        assert_eq!(scheduler.queued_len().await, 0);

        // a fresh commit schedules a nightly group and advances the marker
        state.set_last_commit("dev", "abc123").unwrap();
        trigger.schedule_for_new_commits().await;
        assert_eq!(scheduler.queued_len().await, 1);
        assert_eq!(state.last_nightly_commit("dev").as_deref(), Some("abc123"));

        // unchanged head: no duplicate group
        trigger.schedule_for_new_commits().await;
        assert_eq!(scheduler.queued_len().await, 1);
    }
}
