//! Configuration structures and loading

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::build::BuildType;

/// Configuration errors; all of these refuse startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Web server configuration
    pub web: WebConfiguration,

    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    /// Source repository settings
    pub git: GitConfiguration,

    /// Hardware targets; one build per board per group
    pub boards: Vec<String>,

    /// Image file extensions harvested from successful builds
    pub image_file_formats: Vec<String>,

    /// Whether pull-request events are built at all
    pub pull_requests: bool,

    /// Passed to the builder as TB_CLEAN_TARGET_ONLY
    pub clean_target_only: bool,

    /// Tags matching this regex qualify for release builds
    pub release_tag_regex: Option<String>,

    /// Build types whose artifacts are uploaded to the repository service
    pub upload_service_build_types: Vec<BuildType>,

    /// Timeout for artifact uploads, in seconds
    pub upload_request_timeout: u64,

    /// Optional script invoked per published artifact
    pub release_script: Option<PathBuf>,

    /// Nightly build settings
    pub nightly: NightlyConfiguration,

    /// Host directories
    pub dirs: DirsConfiguration,

    /// Which repository service drives this instance
    pub repo_service: RepoServiceKind,

    pub github: GithubConfiguration,
    pub gitlab: GitlabConfiguration,
    pub bitbucket: BitbucketConfiguration,

    /// Container runtime settings
    pub docker: DockerConfiguration,

    /// Inclusive range of loop device numbers handed to builds
    pub loop_dev_range: [u32; 2],

    /// Optional S3 artifact mirror
    pub s3: S3Configuration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            web: WebConfiguration::default(),
            log_level: default_log_level(),
            git: GitConfiguration::default(),
            boards: Vec::new(),
            image_file_formats: default_image_file_formats(),
            pull_requests: false,
            clean_target_only: false,
            release_tag_regex: None,
            upload_service_build_types: default_upload_service_build_types(),
            upload_request_timeout: default_upload_request_timeout(),
            release_script: None,
            nightly: NightlyConfiguration::default(),
            dirs: DirsConfiguration::default(),
            repo_service: RepoServiceKind::Github,
            github: GithubConfiguration::default(),
            gitlab: GitlabConfiguration::default(),
            bitbucket: BitbucketConfiguration::default(),
            docker: DockerConfiguration::default(),
            loop_dev_range: default_loop_dev_range(),
            s3: S3Configuration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from a TOML file, merging `{stem}.local.toml` over
    /// it when present.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        let mut document: toml::Value = content.parse()?;

        let local_path = path.with_extension("local.toml");
        if local_path.exists() {
            let local = std::fs::read_to_string(&local_path)
                .map_err(|e| ConfigError::Io(local_path.clone(), e))?;
            merge_value(&mut document, local.parse()?);
        }

        let config: Configuration = document.try_into()?;
        config.validate()?;

        // Ensure directories exist
        for dir in [
            &config.dirs.dl,
            &config.dirs.ccache,
            &config.dirs.output,
            &config.dirs.build_logs,
            &config.dirs.persist,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io(dir.clone(), e))?;
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(pattern) = &self.release_tag_regex {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::Invalid(format!("release_tag_regex: {}", e)))?;
        }

        if let Some(map) = &self.s3.filename_map {
            regex::Regex::new(&map.pattern)
                .map_err(|e| ConfigError::Invalid(format!("s3.filename_map.pattern: {}", e)))?;
        }

        if self.loop_dev_range[0] > self.loop_dev_range[1] {
            return Err(ConfigError::Invalid(format!(
                "loop_dev_range: {} > {}",
                self.loop_dev_range[0], self.loop_dev_range[1]
            )));
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_image_file_formats() -> Vec<String> {
    vec![".gz".into(), ".xz".into()]
}

fn default_upload_service_build_types() -> Vec<BuildType> {
    vec![BuildType::Nightly, BuildType::Tag]
}

fn default_upload_request_timeout() -> u64 {
    600
}

fn default_loop_dev_range() -> [u32; 2] {
    [8, 15]
}

/// Repository service selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoServiceKind {
    Github,
    Gitlab,
    Bitbucket,
}

impl fmt::Display for RepoServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoServiceKind::Github => write!(f, "github"),
            RepoServiceKind::Gitlab => write!(f, "gitlab"),
            RepoServiceKind::Bitbucket => write!(f, "bitbucket"),
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfiguration {
    /// Port to listen on
    pub port: u16,

    /// Shared secret for webhook signature verification
    pub secret: String,

    /// Externally reachable base URL, used in commit-status log links
    pub base_url: String,
}

impl Default for WebConfiguration {
    fn default() -> Self {
        Self {
            port: 4567,
            secret: String::new(),
            base_url: "http://localhost:4567".into(),
        }
    }
}

/// Source repository settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfiguration {
    /// Clone URL passed to the builder as TB_REPO
    pub url: String,

    /// Clone depth; -1 means a full clone
    pub clone_depth: i64,

    /// Repository in `owner/project` form, used for API paths and container names
    pub repo: String,
}

impl Default for GitConfiguration {
    fn default() -> Self {
        Self {
            url: String::new(),
            clone_depth: -1,
            repo: String::new(),
        }
    }
}

/// Nightly build settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NightlyConfiguration {
    /// Branches that qualify for nightly groups
    pub branches: Vec<String>,

    /// Release tag template, expanded with branch placeholders and strftime
    pub tag_template: String,

    /// Release display-name template
    pub name_template: String,

    /// Version template
    pub version_template: String,

    /// Wall-clock hour for deferred nightly scheduling; None builds on every push
    pub fixed_hour: Option<u32>,
}

impl Default for NightlyConfiguration {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            tag_template: "nightly-{branch}".into(),
            name_template: "Nightly {Branch}".into(),
            version_template: "{branch}%Y%m%d".into(),
            fixed_hour: None,
        }
    }
}

/// Host directories
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirsConfiguration {
    /// Download cache, mounted at /mnt/dl
    pub dl: PathBuf,

    /// Compiler cache, mounted at /mnt/ccache
    pub ccache: PathBuf,

    /// Build output, mounted at /mnt/output
    pub output: PathBuf,

    /// Where exited containers' logs are persisted
    pub build_logs: PathBuf,

    /// Where branch/tag state documents live
    pub persist: PathBuf,
}

impl Default for DirsConfiguration {
    fn default() -> Self {
        Self {
            dl: PathBuf::from("/var/lib/imageci/dl"),
            ccache: PathBuf::from("/var/lib/imageci/ccache"),
            output: PathBuf::from("/var/lib/imageci/output"),
            build_logs: PathBuf::from("/var/lib/imageci/logs"),
            persist: PathBuf::from("/var/lib/imageci/persist"),
        }
    }
}

/// GitHub API settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfiguration {
    pub access_token: String,

    /// Timeout for regular API calls, in seconds
    pub request_timeout: u64,
}

impl Default for GithubConfiguration {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            request_timeout: 20,
        }
    }
}

/// GitLab API settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitlabConfiguration {
    pub access_token: String,

    /// Numeric or url-encoded project id
    pub project_id: String,

    pub base_url: String,

    /// Timeout for regular API calls, in seconds
    pub request_timeout: u64,
}

impl Default for GitlabConfiguration {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            project_id: String::new(),
            base_url: "https://gitlab.com".into(),
            request_timeout: 20,
        }
    }
}

/// BitBucket API settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitbucketConfiguration {
    pub username: String,
    pub password: String,

    /// Timeout for regular API calls, in seconds
    pub request_timeout: u64,
}

impl Default for BitbucketConfiguration {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            request_timeout: 20,
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfiguration {
    /// Maximum concurrently running builds
    pub max_parallel: usize,

    /// Running containers older than this are killed, in seconds
    pub container_max_age: u64,

    /// Persisted log files older than this are deleted, in seconds
    pub logs_max_age: u64,

    /// Builder image
    pub image: String,

    /// Base runtime command; may be a wrapper such as `ssh host docker`
    pub command: String,

    /// Mount an SSH private key read-only into the builder
    pub copy_ssh_private_key: SshKeyOption,

    /// Extra environment file passed to the runtime
    pub env_file: Option<PathBuf>,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            container_max_age: 12 * 3600,
            logs_max_age: 31 * 86400,
            image: "imageci/os-builder".into(),
            command: "docker".into(),
            copy_ssh_private_key: SshKeyOption::default(),
            env_file: None,
        }
    }
}

/// `copy_ssh_private_key` accepts either a boolean or an explicit key path.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SshKeyOption {
    Enabled(bool),
    Path(PathBuf),
}

impl Default for SshKeyOption {
    fn default() -> Self {
        SshKeyOption::Enabled(false)
    }
}

impl SshKeyOption {
    /// The key path to mount, if any.
    pub fn resolve(&self) -> Option<PathBuf> {
        match self {
            SshKeyOption::Enabled(false) => None,
            SshKeyOption::Enabled(true) => std::env::var_os("HOME")
                .map(|home| Path::new(&home).join(".ssh").join("id_rsa")),
            SshKeyOption::Path(path) => Some(path.clone()),
        }
    }
}

/// S3 artifact mirror settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Configuration {
    /// Build types mirrored to S3
    pub build_types: Vec<BuildType>,

    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,

    /// Key prefix; objects land at `{path}/{version}/{name}`
    pub path: String,

    /// Optional regex rewrite applied to artifact names before upload
    pub filename_map: Option<FilenameMap>,

    /// Append a markdown link to the release description for each upload
    pub add_release_link: bool,

    pub storage_class: String,
}

impl Default for S3Configuration {
    fn default() -> Self {
        Self {
            build_types: Vec::new(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            region: "us-east-1".into(),
            path: String::new(),
            filename_map: None,
            add_release_link: false,
            storage_class: "STANDARD".into(),
        }
    }
}

impl S3Configuration {
    pub fn enabled(&self) -> bool {
        !self.bucket.is_empty()
    }
}

/// Regex rewrite applied to artifact file names
#[derive(Debug, Clone, Deserialize)]
pub struct FilenameMap {
    pub pattern: String,
    pub replace: String,
}

impl FilenameMap {
    pub fn apply(&self, name: &str) -> String {
        match regex::Regex::new(&self.pattern) {
            Ok(re) => re.replace_all(name, self.replace.as_str()).into_owned(),
            Err(_) => name.to_string(),
        }
    }
}

/// Merge `over` into `base`; tables merge recursively, everything else replaces.
fn merge_value(base: &mut toml::Value, over: toml::Value) {
    match (base, over) {
        (toml::Value::Table(base), toml::Value::Table(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: Configuration = toml::Value::Table(Default::default()).try_into().unwrap();
        assert_eq!(config.web.port, 4567);
        assert_eq!(config.docker.max_parallel, 4);
        assert_eq!(config.docker.container_max_age, 43200);
        assert_eq!(config.nightly.tag_template, "nightly-{branch}");
        assert_eq!(config.image_file_formats, vec![".gz", ".xz"]);
        assert!(!config.pull_requests);
        assert!(!config.s3.enabled());
    }

    #[test]
    fn test_local_override_merges() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("imageci.toml");
        let local = dir.path().join("imageci.local.toml");

        let dirs = format!(
            r#"
            boards = ["raspberrypi", "raspberrypi2"]

            [git]
            repo = "owner/project"

            [dirs]
            dl = "{0}/dl"
            ccache = "{0}/ccache"
            output = "{0}/output"
            build_logs = "{0}/logs"
            persist = "{0}/persist"
            "#,
            dir.path().display()
        );
        std::fs::File::create(&base)
            .unwrap()
            .write_all(dirs.as_bytes())
            .unwrap();
        std::fs::File::create(&local)
            .unwrap()
            .write_all(b"[git]\nrepo = \"other/project\"\n")
            .unwrap();

        let config = Configuration::load(base.to_str().unwrap()).unwrap();
        assert_eq!(config.git.repo, "other/project");
        assert_eq!(config.boards.len(), 2);
        assert!(dir.path().join("dl").is_dir());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let config = Configuration {
            release_tag_regex: Some("[".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssh_key_option() {
        assert!(SshKeyOption::Enabled(false).resolve().is_none());
        assert_eq!(
            SshKeyOption::Path(PathBuf::from("/etc/key")).resolve(),
            Some(PathBuf::from("/etc/key"))
        );
    }

    #[test]
    fn test_filename_map() {
        let map = FilenameMap {
            pattern: r"\.img\.gz$".into(),
            replace: ".gz".into(),
        };
        assert_eq!(map.apply("os-board-1.0.img.gz"), "os-board-1.0.gz");
    }
}
