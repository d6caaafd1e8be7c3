//! Tracked container records

use std::fmt;

use chrono::{DateTime, Utc};

/// Container state, derived from the record: no exit code means Running, an
/// exit code means Exited, removal from the runtime means Removed. Monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Removed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Removed => write!(f, "removed"),
        }
    }
}

/// A container owned by the controller
#[derive(Debug, Clone)]
pub struct Container {
    /// Full container id as reported by the runtime
    pub id: String,

    /// Container name, carrying the controller's instance prefix
    pub name: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Exit code, once the runtime reports the container stopped
    pub exit_code: Option<i32>,

    /// Whether the container has been removed from the runtime
    pub removed: bool,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
            exit_code: None,
            removed: false,
        }
    }

    pub fn state(&self) -> ContainerState {
        if self.removed {
            ContainerState::Removed
        } else if self.exit_code.is_some() {
            ContainerState::Exited
        } else {
            ContainerState::Running
        }
    }

    /// Age in seconds.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_derivation() {
        let mut container = Container::new("abcd", "thingosdci-owner-project-00112233");
        assert_eq!(container.state(), ContainerState::Running);

        container.exit_code = Some(0);
        assert_eq!(container.state(), ContainerState::Exited);

        container.removed = true;
        assert_eq!(container.state(), ContainerState::Removed);
    }

    #[test]
    fn test_age() {
        let mut container = Container::new("abcd", "name");
        container.created_at = Utc::now() - chrono::Duration::seconds(90);
        assert!(container.age_seconds(Utc::now()) >= 90);
    }
}
