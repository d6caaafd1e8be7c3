//! Container lifecycle controller
//!
//! Owns the registry of containers belonging to this instance, launches new
//! ones, polls the runtime for state changes and reaps exited containers
//! after persisting their logs. Runtime failures inside the polling loops are
//! logged and retried on the next tick; the loops never terminate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::events::{Event, EventBus};

use super::cli::{self, ListedContainer, RunOptions};
use super::container::{Container, ContainerState};

/// Status poll period
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Cleanup period
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Containers younger than this are exempt from registry pruning; they may
/// have been launched after the current listing was taken.
const PRUNE_GRACE_SECONDS: i64 = 10;

/// Container runtime errors
#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("failed to launch container: {0}")]
    Launch(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("invalid runtime command: {0}")]
    Command(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller for build containers
pub struct ContainerController {
    base_cmd: Vec<String>,
    image: String,
    repo: String,
    name_prefix: String,
    env_file: Option<PathBuf>,
    ssh_key: Option<PathBuf>,
    logs_dir: PathBuf,
    container_max_age: u64,
    logs_max_age: u64,
    registry: DashMap<String, Container>,
    events: EventBus,
}

impl ContainerController {
    pub fn new(config: &Configuration, events: EventBus) -> Result<Self, DockerError> {
        let base_cmd = shell_words::split(&config.docker.command)
            .map_err(|e| DockerError::Command(e.to_string()))?;
        if base_cmd.is_empty() {
            return Err(DockerError::Command("empty runtime command".into()));
        }

        Ok(Self {
            base_cmd,
            image: config.docker.image.clone(),
            repo: config.git.repo.clone(),
            name_prefix: cli::name_prefix(&config.git.repo),
            env_file: config.docker.env_file.clone(),
            ssh_key: config.docker.copy_ssh_private_key.resolve(),
            logs_dir: config.dirs.build_logs.clone(),
            container_max_age: config.docker.container_max_age,
            logs_max_age: config.docker.logs_max_age,
            registry: DashMap::new(),
            events,
        })
    }

    /// Launch a build container.
    ///
    /// Interactive launches inherit standard I/O, block until the command
    /// exits and yield no container; the caller treats such a build as
    /// immediately ended with exit code 0.
    pub async fn run(
        &self,
        env: Vec<(String, String)>,
        volumes: Vec<(String, String)>,
        interactive: bool,
    ) -> Result<Option<Container>, DockerError> {
        let name = cli::container_name(&self.repo);
        let opts = RunOptions {
            name: name.clone(),
            image: self.image.clone(),
            interactive,
            env,
            volumes,
            env_file: self.env_file.clone(),
            ssh_key: self.ssh_key.clone(),
        };
        let args = cli::run_args(&opts);

        if interactive {
            let status = self
                .command(&args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await
                .map_err(|e| DockerError::Launch(e.to_string()))?;

            debug!("interactive container {} exited with {}", name, status);
            return Ok(None);
        }

        let stdout = self
            .exec(&args)
            .await
            .map_err(|e| DockerError::Launch(e.to_string()))?;

        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(DockerError::Launch("runtime returned no container id".into()));
        }

        let container = Container::new(id.clone(), name);
        debug!("started container {} ({})", container.name, container.id);
        self.registry.insert(id, container.clone());

        Ok(Some(container))
    }

    /// Last `last_lines` lines of a container's log, or the whole log.
    ///
    /// Falls back to the persisted log file once the container has been
    /// removed from the runtime.
    pub async fn log_tail(
        &self,
        id: &str,
        last_lines: Option<usize>,
    ) -> Result<String, DockerError> {
        let output = self
            .command(&["logs".to_string(), id.to_string()])
            .output()
            .await?;

        let log = if output.status.success() {
            let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
            log.push_str(&String::from_utf8_lossy(&output.stderr));
            log
        } else {
            let log_path = self.logs_dir.join(format!("build-{}.log", id));
            std::fs::read_to_string(&log_path).map_err(|_| {
                DockerError::Runtime(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                )
            })?
        };

        match last_lines {
            Some(n) => {
                let lines: Vec<&str> = log.lines().collect();
                Ok(lines[lines.len().saturating_sub(n)..].join("\n"))
            }
            None => Ok(log),
        }
    }

    /// A snapshot of a tracked container.
    pub fn container(&self, id: &str) -> Option<Container> {
        self.registry.get(id).map(|entry| entry.value().clone())
    }

    /// Number of tracked containers.
    pub fn count(&self) -> usize {
        self.registry.len()
    }

    /// Spawn the status and cleanup loops.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: CancellationToken) {
        let controller = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => controller.status_tick().await,
                }
            }
        });

        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => controller.cleanup_tick().await,
                }
            }
        });
    }

    /// One status poll: detect exited containers, harvest exit codes, prune
    /// ids the runtime no longer reports.
    async fn status_tick(&self) {
        let listed = match self.list().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!("container listing failed: {}", e);
                return;
            }
        };

        let mut newly_exited = Vec::new();
        for row in &listed {
            if let Some(entry) = self.registry.get(&row.id) {
                if entry.state() == ContainerState::Running && !row.running {
                    newly_exited.push(row.id.clone());
                }
            }
        }

        for id in newly_exited {
            match self.wait_exit_code(&id).await {
                Ok(exit_code) => {
                    if let Some(mut entry) = self.registry.get_mut(&id) {
                        entry.exit_code = Some(exit_code);
                    }
                    debug!("container {} exited with code {}", id, exit_code);
                    self.events.publish(Event::Container {
                        id,
                        state: ContainerState::Exited,
                        exit_code: Some(exit_code),
                    });
                }
                Err(e) => warn!("failed to fetch exit code for {}: {}", id, e),
            }
        }

        let listed_ids: HashSet<&str> = listed.iter().map(|row| row.id.as_str()).collect();
        let now = Utc::now();
        self.registry.retain(|id, container| {
            listed_ids.contains(id.as_str()) || container.age_seconds(now) < PRUNE_GRACE_SECONDS
        });
    }

    /// One cleanup pass: kill over-age runners, persist and remove exited
    /// containers, delete stale log files.
    async fn cleanup_tick(&self) {
        let now = Utc::now();
        let snapshot: Vec<Container> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for container in snapshot {
            match container.state() {
                ContainerState::Running => {
                    if container.age_seconds(now) > self.container_max_age as i64 {
                        warn!(
                            "killing container {} older than {}s",
                            container.id, self.container_max_age
                        );
                        if let Err(e) = self.kill(&container.id).await {
                            warn!("failed to kill container {}: {}", container.id, e);
                        }
                        // the status loop picks up the exit on its next tick
                    }
                }
                ContainerState::Exited => {
                    if let Err(e) = self.reap(&container).await {
                        warn!("failed to reap container {}: {}", container.id, e);
                    }
                }
                ContainerState::Removed => {}
            }
        }

        self.prune_old_logs();
    }

    /// Persist the container's log, remove it from the runtime, mark Removed.
    async fn reap(&self, container: &Container) -> Result<(), DockerError> {
        let log = self.log_tail(&container.id, None).await?;
        let log_path = self.logs_dir.join(format!("build-{}.log", container.id));
        std::fs::write(&log_path, log)?;
        debug!("saved log of {} to {}", container.id, log_path.display());

        self.remove(&container.id).await?;

        if let Some(mut entry) = self.registry.get_mut(&container.id) {
            entry.removed = true;
        }
        self.events.publish(Event::Container {
            id: container.id.clone(),
            state: ContainerState::Removed,
            exit_code: container.exit_code,
        });

        Ok(())
    }

    fn prune_old_logs(&self) {
        let entries = match std::fs::read_dir(&self.logs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read logs dir {}: {}", self.logs_dir.display(), e);
                return;
            }
        };

        for entry in entries.flatten() {
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .and_then(|t| t.elapsed().map_err(|e| std::io::Error::other(e)));

            if let Ok(age) = age {
                if age.as_secs() > self.logs_max_age {
                    debug!("deleting old log file {:?}", entry.file_name());
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!("failed to delete {:?}: {}", entry.path(), e);
                    }
                }
            }
        }
    }

    async fn list(&self) -> Result<Vec<ListedContainer>, DockerError> {
        let stdout = self
            .exec(&[
                "container".to_string(),
                "ls".to_string(),
                "-a".to_string(),
                "--no-trunc".to_string(),
                "--format".to_string(),
                cli::LIST_FORMAT.to_string(),
            ])
            .await?;

        Ok(stdout
            .lines()
            .filter_map(cli::parse_list_line)
            .filter(|row| row.name.starts_with(&self.name_prefix))
            .collect())
    }

    async fn wait_exit_code(&self, id: &str) -> Result<i32, DockerError> {
        let stdout = self.exec(&["wait".to_string(), id.to_string()]).await?;
        stdout
            .trim()
            .parse()
            .map_err(|_| DockerError::Runtime(format!("unparsable exit code {:?}", stdout.trim())))
    }

    async fn kill(&self, id: &str) -> Result<(), DockerError> {
        self.exec(&[
            "container".to_string(),
            "kill".to_string(),
            id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), DockerError> {
        self.exec(&["container".to_string(), "rm".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.base_cmd[0]);
        cmd.args(&self.base_cmd[1..]).args(args);
        cmd
    }

    async fn exec(&self, args: &[String]) -> Result<String, DockerError> {
        let output = self.command(args).output().await?;

        if !output.status.success() {
            return Err(DockerError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, container: Container) {
        self.registry.insert(container.id.clone(), container);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn controller() -> ContainerController {
        let config = Configuration {
            git: crate::config::GitConfiguration {
                repo: "owner/project".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        ContainerController::new(&config, EventBus::new()).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_command() {
        let config = Configuration {
            docker: crate::config::DockerConfiguration {
                command: "".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ContainerController::new(&config, EventBus::new()).is_err());
    }

    #[test]
    fn test_wrapped_base_command() {
        let config = Configuration {
            docker: crate::config::DockerConfiguration {
                command: "ssh builder@host docker".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let controller = ContainerController::new(&config, EventBus::new()).unwrap();
        assert_eq!(controller.base_cmd, vec!["ssh", "builder@host", "docker"]);
    }

    #[test]
    fn test_registry_snapshot() {
        let controller = controller();
        assert_eq!(controller.count(), 0);

        controller.insert_for_test(Container::new("abcd", "thingosdci-owner-project-00112233"));
        assert_eq!(controller.count(), 1);

        let container = controller.container("abcd").unwrap();
        assert_eq!(container.state(), ContainerState::Running);
        assert!(controller.container("unknown").is_none());
    }

    fn fake_runtime(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("runtime.sh");
        std::fs::write(
            &script,
            r#"#!/bin/sh
dir=$(dirname "$0")
case "$1" in
  container)
    case "$2" in
      ls) cat "$dir/ls.out" 2>/dev/null ;;
      *) : ;;
    esac
    ;;
  wait) cat "$dir/exit-$2" 2>/dev/null || echo 0 ;;
  logs) cat "$dir/log-$2" 2>/dev/null ;;
  *) : ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    fn controller_with(dir: &std::path::Path, events: EventBus) -> ContainerController {
        let mut config = Configuration::default();
        config.git.repo = "owner/project".into();
        config.docker.command = fake_runtime(dir);
        config.dirs.build_logs = dir.join("logs");
        std::fs::create_dir_all(&config.dirs.build_logs).unwrap();
        ContainerController::new(&config, events).unwrap()
    }

    fn aged(id: &str, name: &str) -> Container {
        let mut container = Container::new(id, name);
        container.created_at = Utc::now() - chrono::Duration::seconds(60);
        container
    }

    #[tokio::test]
    async fn test_status_tick_detects_exit_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let controller = controller_with(dir.path(), events.clone());
        let mut rx = events.subscribe();

        controller.insert_for_test(aged("cid1", "thingosdci-owner-project-00112233"));
        // an entry the runtime no longer reports
        controller.insert_for_test(aged("cid9", "thingosdci-owner-project-99999999"));

        std::fs::write(
            dir.path().join("ls.out"),
            "cid1%thingosdci-owner-project-00112233%2023-08-15 10:30:00 +0000 UTC%Exited (7) 2 hours ago\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("exit-cid1"), "7").unwrap();

        controller.status_tick().await;

        let container = controller.container("cid1").unwrap();
        assert_eq!(container.state(), ContainerState::Exited);
        assert_eq!(container.exit_code, Some(7));
        assert!(controller.container("cid9").is_none());

        match rx.try_recv().unwrap() {
            Event::Container { id, state, exit_code } => {
                assert_eq!(id, "cid1");
                assert_eq!(state, ContainerState::Exited);
                assert_eq!(exit_code, Some(7));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_tick_ignores_foreign_containers() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let controller = controller_with(dir.path(), events.clone());
        let mut rx = events.subscribe();

        std::fs::write(
            dir.path().join("ls.out"),
            "ffff%some-other-daemon-1%2023-08-15 10:30:00 +0000 UTC%Exited (1) 2 hours ago\n",
        )
        .unwrap();

        controller.status_tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_reaps_exited_container() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let controller = controller_with(dir.path(), events.clone());
        let mut rx = events.subscribe();

        let mut container = aged("cid1", "thingosdci-owner-project-00112233");
        container.exit_code = Some(0);
        controller.insert_for_test(container);
        std::fs::write(dir.path().join("log-cid1"), "line one\nline two\n").unwrap();

        controller.cleanup_tick().await;

        // log persisted, container marked removed, event fired
        let saved = std::fs::read_to_string(dir.path().join("logs").join("build-cid1.log")).unwrap();
        assert!(saved.contains("line one"));
        assert_eq!(
            controller.container("cid1").unwrap().state(),
            ContainerState::Removed
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Container {
                state: ContainerState::Removed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_log_tail_falls_back_to_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), EventBus::new());

        // the runtime knows nothing about this id, but a saved log exists
        let script = dir.path().join("runtime.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in logs) echo \"no such container\" >&2; exit 1 ;; esac\n",
        )
        .unwrap();

        std::fs::write(
            dir.path().join("logs").join("build-cid1.log"),
            "a\nb\nc\nd\n",
        )
        .unwrap();

        let tail = controller.log_tail("cid1", Some(2)).await.unwrap();
        assert_eq!(tail, "c\nd");

        assert!(controller.log_tail("cid2", Some(2)).await.is_err());
    }
}
