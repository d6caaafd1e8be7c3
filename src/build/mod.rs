//! Builds: the unit of work for one board at one revision

mod group;
mod scheduler;

pub use group::BuildGroup;
pub use scheduler::{BuildScheduler, GroupProgress};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::oneshot;

/// Build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("cannot set begin time of build that has already begun")]
    AlreadyBegun,

    #[error("cannot set end time of build that has not begun")]
    NotBegun,

    #[error("cannot set end time of build that has already ended")]
    AlreadyEnded,

    #[error("board {0} already present in build group")]
    DuplicateBoard(String),

    #[error("unknown build group {0}")]
    UnknownGroup(GroupId),

    #[error("build was replaced before it could run")]
    Replaced,

    #[error("custom build command failed with exit code {0}")]
    CustomCommandFailed(i32),
}

/// Identifies a build inside the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildId(pub u64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a build group inside the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group #{}", self.0)
    }
}

/// What triggered a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    #[serde(rename = "pr")]
    PullRequest,
    Nightly,
    Tag,
    Custom,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::PullRequest => "pr",
            BuildType::Nightly => "nightly",
            BuildType::Tag => "tag",
            BuildType::Custom => "custom",
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build state, derived from the begin/end timestamps. Monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Running,
    Ended,
}

/// A single containerized build of one board at one revision.
#[derive(Debug)]
pub struct Build {
    pub id: BuildId,

    /// Repository service name, part of the dedup key
    pub service: String,

    /// Owning group; custom-command builds have none
    pub group: Option<GroupId>,

    pub build_type: BuildType,
    pub board: String,

    pub commit_id: Option<String>,
    pub tag: Option<String>,
    pub pr_no: Option<u64>,
    pub branch: Option<String>,
    pub version: Option<String>,
    pub custom_cmd: Option<String>,
    pub interactive: bool,

    /// Loop device borrowed for the lifetime of the build, when one was free
    pub loop_dev: Option<String>,

    /// Bound at begin for non-interactive builds
    pub container_id: Option<String>,

    pub exit_code: Option<i32>,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// format → artifact path, populated for successful non-custom builds
    pub image_files: HashMap<String, PathBuf>,

    /// Completion signal for custom-command builds
    pub(crate) done_tx: Option<oneshot::Sender<i32>>,
}

impl Build {
    /// Identifier derived from the build type: PR number, branch, tag or a
    /// fingerprint of the custom command.
    pub fn identifier(&self) -> String {
        match self.build_type {
            BuildType::PullRequest => self.pr_no.map(|n| n.to_string()).unwrap_or_default(),
            BuildType::Nightly => self.branch.clone().unwrap_or_default(),
            BuildType::Tag => self.tag.clone().unwrap_or_default(),
            BuildType::Custom => format!(
                "cmd{}",
                crate::util::short_fingerprint(self.custom_cmd.as_deref().unwrap_or_default())
            ),
        }
    }

    /// Key used to dedupe the pending queue.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.service, self.identifier(), self.board)
    }

    pub fn state(&self) -> BuildState {
        match (self.begin_time, self.end_time) {
            (None, _) => BuildState::Pending,
            (Some(_), None) => BuildState::Running,
            (Some(_), Some(_)) => BuildState::Ended,
        }
    }

    /// Mark the build running, bound to the given container.
    pub fn set_begin(&mut self, container_id: Option<String>) -> Result<(), BuildError> {
        if self.begin_time.is_some() {
            return Err(BuildError::AlreadyBegun);
        }

        self.begin_time = Some(Utc::now());
        self.container_id = container_id;
        Ok(())
    }

    /// Mark the build ended. Called exactly once per build.
    pub fn set_end(&mut self, exit_code: i32) -> Result<(), BuildError> {
        if self.begin_time.is_none() {
            return Err(BuildError::NotBegun);
        }
        if self.end_time.is_some() {
            return Err(BuildError::AlreadyEnded);
        }

        self.exit_code = Some(exit_code);
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Gather artifacts of a successful non-custom build.
    ///
    /// `{outputDir}/{board}/.image_files` lists one basename per line; each is
    /// resolved under `{outputDir}/{board}/images/` and grouped by the
    /// configured formats. Duplicates within one format: last wins.
    pub fn collect_image_files(&mut self, output_dir: &Path, formats: &[String]) {
        if self.build_type == BuildType::Custom || self.exit_code != Some(0) {
            return;
        }

        let list_path = output_dir.join(&self.board).join(".image_files");
        let content = match std::fs::read_to_string(&list_path) {
            Ok(content) => content,
            Err(_) => return,
        };

        let images_dir = output_dir.join(&self.board).join("images");
        let files: Vec<PathBuf> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| images_dir.join(name))
            .collect();

        let mut by_format = HashMap::new();
        for format in formats {
            for file in &files {
                if file.to_string_lossy().ends_with(format.as_str()) {
                    by_format.insert(format.clone(), file.clone());
                }
            }
        }

        self.image_files = by_format;
    }

    /// Cloneable snapshot carried by events.
    pub fn info(&self) -> BuildInfo {
        BuildInfo {
            id: self.id,
            service: self.service.clone(),
            group: self.group,
            build_type: self.build_type,
            board: self.board.clone(),
            commit_id: self.commit_id.clone(),
            tag: self.tag.clone(),
            pr_no: self.pr_no,
            branch: self.branch.clone(),
            version: self.version.clone(),
            container_id: self.container_id.clone(),
            exit_code: self.exit_code,
            image_files: self.image_files.clone(),
        }
    }
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build {}/{}/{}", self.build_type, self.identifier(), self.board)
    }
}

/// Immutable snapshot of a build, carried by events.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub id: BuildId,
    pub service: String,
    pub group: Option<GroupId>,
    pub build_type: BuildType,
    pub board: String,
    pub commit_id: Option<String>,
    pub tag: Option<String>,
    pub pr_no: Option<u64>,
    pub branch: Option<String>,
    pub version: Option<String>,
    pub container_id: Option<String>,
    pub exit_code: Option<i32>,
    pub image_files: HashMap<String, PathBuf>,
}

impl BuildInfo {
    pub fn identifier(&self) -> String {
        match self.build_type {
            BuildType::PullRequest => self.pr_no.map(|n| n.to_string()).unwrap_or_default(),
            BuildType::Nightly => self.branch.clone().unwrap_or_default(),
            BuildType::Tag => self.tag.clone().unwrap_or_default(),
            BuildType::Custom => "cmd".to_string(),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build {}/{}/{}", self.build_type, self.identifier(), self.board)
    }
}

#[cfg(test)]
pub(crate) fn test_build(id: u64, build_type: BuildType, board: &str) -> Build {
    Build {
        id: BuildId(id),
        service: "github".into(),
        group: None,
        build_type,
        board: board.into(),
        commit_id: Some("abc123".into()),
        tag: None,
        pr_no: Some(42),
        branch: Some("dev".into()),
        version: None,
        custom_cmd: None,
        interactive: false,
        loop_dev: None,
        container_id: None,
        exit_code: None,
        begin_time: None,
        end_time: None,
        image_files: HashMap::new(),
        done_tx: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_and_key() {
        let build = test_build(1, BuildType::PullRequest, "raspberrypi");
        assert_eq!(build.identifier(), "42");
        assert_eq!(build.key(), "github/42/raspberrypi");

        let build = test_build(2, BuildType::Nightly, "raspberrypi");
        assert_eq!(build.identifier(), "dev");
        assert_eq!(build.key(), "github/dev/raspberrypi");

        let mut build = test_build(3, BuildType::Custom, "dummyboard");
        build.custom_cmd = Some("git push --delete origin nightly-dev".into());
        let id = build.identifier();
        assert!(id.starts_with("cmd"));
        assert_eq!(id.len(), 3 + 8);
    }

    #[test]
    fn test_state_transitions_monotonic() {
        let mut build = test_build(1, BuildType::Nightly, "raspberrypi");
        assert_eq!(build.state(), BuildState::Pending);

        assert!(matches!(build.set_end(0), Err(BuildError::NotBegun)));

        build.set_begin(Some("cid1".into())).unwrap();
        assert_eq!(build.state(), BuildState::Running);
        assert!(matches!(
            build.set_begin(Some("cid2".into())),
            Err(BuildError::AlreadyBegun)
        ));

        build.set_end(0).unwrap();
        assert_eq!(build.state(), BuildState::Ended);
        assert!(matches!(build.set_end(0), Err(BuildError::AlreadyEnded)));
        assert!(build.begin_time.unwrap() <= build.end_time.unwrap());
    }

    #[test]
    fn test_collect_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let board_dir = dir.path().join("raspberrypi");
        std::fs::create_dir_all(board_dir.join("images")).unwrap();
        std::fs::write(
            board_dir.join(".image_files"),
            "os-raspberrypi-1.0.img.gz\nos-raspberrypi-1.0.img.xz\n",
        )
        .unwrap();

        let mut build = test_build(1, BuildType::Nightly, "raspberrypi");
        build.set_begin(Some("cid1".into())).unwrap();
        build.set_end(0).unwrap();
        build.collect_image_files(dir.path(), &[".gz".into(), ".xz".into()]);

        assert_eq!(build.image_files.len(), 2);
        assert_eq!(
            build.image_files[".gz"],
            board_dir.join("images").join("os-raspberrypi-1.0.img.gz")
        );
    }

    #[test]
    fn test_collect_image_files_skips_failures_and_custom() {
        let dir = tempfile::tempdir().unwrap();
        let board_dir = dir.path().join("raspberrypi");
        std::fs::create_dir_all(&board_dir).unwrap();
        std::fs::write(board_dir.join(".image_files"), "image.gz\n").unwrap();

        let mut build = test_build(1, BuildType::Nightly, "raspberrypi");
        build.set_begin(None).unwrap();
        build.set_end(1).unwrap();
        build.collect_image_files(dir.path(), &[".gz".into()]);
        assert!(build.image_files.is_empty());

        let mut build = test_build(2, BuildType::Custom, "raspberrypi");
        build.set_begin(None).unwrap();
        build.set_end(0).unwrap();
        build.collect_image_files(dir.path(), &[".gz".into()]);
        assert!(build.image_files.is_empty());
    }

    #[test]
    fn test_last_format_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let board_dir = dir.path().join("raspberrypi");
        std::fs::create_dir_all(&board_dir).unwrap();
        std::fs::write(board_dir.join(".image_files"), "first.gz\nsecond.gz\n").unwrap();

        let mut build = test_build(1, BuildType::Tag, "raspberrypi");
        build.tag = Some("20230815".into());
        build.set_begin(Some("cid1".into())).unwrap();
        build.set_end(0).unwrap();
        build.collect_image_files(dir.path(), &[".gz".into()]);

        assert_eq!(
            build.image_files[".gz"],
            board_dir.join("images").join("second.gz")
        );
    }
}
