//! Runtime command-line construction and list-output parsing

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::util;

/// Format string handed to `container ls`; fields are `%`-separated.
pub const LIST_FORMAT: &str = "{{.ID}}%{{.Names}}%{{.CreatedAt}}%{{.Status}}";

/// Container name prefix shared by every instance of this program.
const NAME_PREFIX: &str = "thingosdci";

/// One row of `container ls` output
#[derive(Debug, Clone)]
pub struct ListedContainer {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub running: bool,
}

/// The name prefix identifying containers belonging to an instance driving
/// the given repository. This filter is what isolates multiple instances of
/// the controller on the same host.
pub fn name_prefix(repo: &str) -> String {
    format!("{}-{}-", NAME_PREFIX, util::sanitize_repo(repo))
}

/// A fresh container name: the instance prefix plus an 8-hex fingerprint of
/// the current epoch milliseconds.
pub fn container_name(repo: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    format!("{}{}", name_prefix(repo), util::short_fingerprint(&millis.to_string()))
}

/// Parse one `%`-separated row of `container ls` output.
///
/// `CreatedAt` is reported as `YYYY-MM-DD HH:MM:SS` followed by zone noise; a
/// `Status` starting with `Up` means the container is running.
pub fn parse_list_line(line: &str) -> Option<ListedContainer> {
    let mut parts = line.splitn(4, '%');
    let id = parts.next()?.trim();
    let name = parts.next()?.trim();
    let created = parts.next()?.trim();
    let status = parts.next()?.trim();

    if id.is_empty() || name.is_empty() {
        return None;
    }

    let mut created_tokens = created.split_whitespace();
    let date = created_tokens.next()?;
    let time = created_tokens.next()?;
    let created_at = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S")
        .ok()?
        .and_utc();

    Some(ListedContainer {
        id: id.to_string(),
        name: name.to_string(),
        created_at,
        running: status.starts_with("Up"),
    })
}

/// Options for a `run` invocation
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub name: String,
    pub image: String,
    pub interactive: bool,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<(String, String)>,
    pub env_file: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
}

/// Arguments for `run`: detached and privileged, with the build environment,
/// the shared cache/output volumes and the capabilities the builder needs to
/// mount loop devices. Interactive runs swap `-td` for `-it`.
pub fn run_args(opts: &RunOptions) -> Vec<String> {
    let mut args = vec!["run".to_string()];

    if opts.interactive {
        args.push("-it".to_string());
    } else {
        args.push("-td".to_string());
    }

    args.push("--privileged".to_string());
    args.push("--name".to_string());
    args.push(opts.name.clone());

    for (key, value) in &opts.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(env_file) = &opts.env_file {
        args.push("--env-file".to_string());
        args.push(env_file.display().to_string());
    }

    for (host, guest) in &opts.volumes {
        args.push("-v".to_string());
        args.push(format!("{}:{}", host, guest));
    }

    if let Some(key) = &opts.ssh_key {
        args.push("-v".to_string());
        args.push(format!("{}:/root/.ssh/id_rsa:ro", key.display()));
    }

    args.push("--cap-add=SYS_ADMIN".to_string());
    args.push("--cap-add=MKNOD".to_string());
    args.push(opts.image.clone());

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_prefix() {
        assert_eq!(name_prefix("owner/project"), "thingosdci-owner-project-");
    }

    #[test]
    fn test_container_name_shape() {
        let name = container_name("owner/project");
        assert!(name.starts_with("thingosdci-owner-project-"));
        let fingerprint = name.rsplit('-').next().unwrap();
        assert_eq!(fingerprint.len(), 8);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_parse_list_line_running() {
        let line = "0a1b2c3d4e5f%thingosdci-owner-project-00112233%2023-08-15 10:30:00 +0000 UTC%Up 2 hours";
        let row = parse_list_line(line).unwrap();
        assert_eq!(row.id, "0a1b2c3d4e5f");
        assert_eq!(row.name, "thingosdci-owner-project-00112233");
        assert!(row.running);
        assert_eq!(
            row.created_at,
            NaiveDateTime::parse_from_str("2023-08-15 10:30:00", "%Y-%m-%d %H:%M:%S")
                .unwrap()
                .and_utc()
        );
    }

    #[test]
    fn test_parse_list_line_exited() {
        let line = "0a1b2c3d4e5f%thingosdci-o-p-00112233%2023-08-15 10:30:00 +0000 UTC%Exited (137) 3 hours ago";
        let row = parse_list_line(line).unwrap();
        assert!(!row.running);
    }

    #[test]
    fn test_parse_list_line_garbage() {
        assert!(parse_list_line("").is_none());
        assert!(parse_list_line("id-only").is_none());
        assert!(parse_list_line("a%b%not-a-date%Up").is_none());
    }

    #[test]
    fn test_run_args() {
        let opts = RunOptions {
            name: "thingosdci-o-p-00112233".into(),
            image: "imageci/os-builder".into(),
            interactive: false,
            env: vec![("TB_BOARD".into(), "raspberrypi".into())],
            volumes: vec![("/var/lib/imageci/dl".into(), "/mnt/dl".into())],
            env_file: None,
            ssh_key: Some(PathBuf::from("/root/.ssh/id_rsa")),
        };

        let args = run_args(&opts);
        assert_eq!(args[0], "run");
        assert_eq!(args[1], "-td");
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"TB_BOARD=raspberrypi".to_string()));
        assert!(args.contains(&"/var/lib/imageci/dl:/mnt/dl".to_string()));
        assert!(args.contains(&"/root/.ssh/id_rsa:/root/.ssh/id_rsa:ro".to_string()));
        assert!(args.contains(&"--cap-add=SYS_ADMIN".to_string()));
        assert!(args.contains(&"--cap-add=MKNOD".to_string()));
        // image comes last
        assert_eq!(args.last().unwrap(), "imageci/os-builder");
    }

    #[test]
    fn test_run_args_interactive() {
        let opts = RunOptions {
            name: "n".into(),
            image: "img".into(),
            interactive: true,
            ..Default::default()
        };
        let args = run_args(&opts);
        assert_eq!(args[1], "-it");
        assert!(!args.contains(&"-td".to_string()));
    }
}
