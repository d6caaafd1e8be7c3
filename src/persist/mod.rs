//! Persisted branch and tag state
//!
//! Three flat JSON documents under the persist directory record the last
//! commit seen per branch, the last commit a nightly group was built for, and
//! the commit behind each observed tag. Every change rewrites the documents
//! (write-temp-then-rename); this is the only state that survives a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

const LAST_COMMIT_BY_BRANCH: &str = "last-commit-by-branch";
const LAST_NIGHTLY_COMMIT_BY_BRANCH: &str = "last-nightly-commit-by-branch";
const COMMIT_IDS_BY_TAG: &str = "commit-ids-by-tag";

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("cannot read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("cannot write {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("cannot parse {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

#[derive(Default)]
struct Maps {
    last_commit_by_branch: HashMap<String, String>,
    last_nightly_commit_by_branch: HashMap<String, String>,
    commit_ids_by_tag: HashMap<String, String>,
}

/// Branch/tag commit state store
pub struct BranchState {
    dir: PathBuf,
    maps: Mutex<Maps>,
}

impl BranchState {
    /// Load all documents from the persist directory; missing files are empty maps.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        let maps = Maps {
            last_commit_by_branch: load_map(&dir, LAST_COMMIT_BY_BRANCH)?,
            last_nightly_commit_by_branch: load_map(&dir, LAST_NIGHTLY_COMMIT_BY_BRANCH)?,
            commit_ids_by_tag: load_map(&dir, COMMIT_IDS_BY_TAG)?,
        };

        Ok(Self {
            dir,
            maps: Mutex::new(maps),
        })
    }

    pub fn last_commit(&self, branch: &str) -> Option<String> {
        self.maps.lock().last_commit_by_branch.get(branch).cloned()
    }

    pub fn set_last_commit(&self, branch: &str, commit_id: &str) -> Result<(), PersistError> {
        {
            let mut maps = self.maps.lock();
            maps.last_commit_by_branch
                .insert(branch.to_string(), commit_id.to_string());
        }
        self.save()
    }

    pub fn last_nightly_commit(&self, branch: &str) -> Option<String> {
        self.maps
            .lock()
            .last_nightly_commit_by_branch
            .get(branch)
            .cloned()
    }

    pub fn set_last_nightly_commit(
        &self,
        branch: &str,
        commit_id: &str,
    ) -> Result<(), PersistError> {
        {
            let mut maps = self.maps.lock();
            maps.last_nightly_commit_by_branch
                .insert(branch.to_string(), commit_id.to_string());
        }
        self.save()
    }

    pub fn commit_for_tag(&self, tag: &str) -> Option<String> {
        self.maps.lock().commit_ids_by_tag.get(tag).cloned()
    }

    pub fn set_commit_for_tag(&self, tag: &str, commit_id: &str) -> Result<(), PersistError> {
        {
            let mut maps = self.maps.lock();
            maps.commit_ids_by_tag
                .insert(tag.to_string(), commit_id.to_string());
        }
        self.save()
    }

    fn save(&self) -> Result<(), PersistError> {
        let maps = self.maps.lock();
        save_map(&self.dir, LAST_COMMIT_BY_BRANCH, &maps.last_commit_by_branch)?;
        save_map(
            &self.dir,
            LAST_NIGHTLY_COMMIT_BY_BRANCH,
            &maps.last_nightly_commit_by_branch,
        )?;
        save_map(&self.dir, COMMIT_IDS_BY_TAG, &maps.commit_ids_by_tag)?;
        Ok(())
    }
}

fn document_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

fn load_map(dir: &Path, name: &str) -> Result<HashMap<String, String>, PersistError> {
    let path = document_path(dir, name);
    if !path.exists() {
        return Ok(HashMap::new());
    }

    debug!("loading {}", name);
    let content = std::fs::read_to_string(&path).map_err(|e| PersistError::Read(path.clone(), e))?;
    serde_json::from_str(&content).map_err(|e| PersistError::Parse(path, e))
}

fn save_map(dir: &Path, name: &str, map: &HashMap<String, String>) -> Result<(), PersistError> {
    let path = document_path(dir, name);
    let tmp = dir.join(format!("{}.json.tmp", name));

    debug!("saving {}", name);
    let content =
        serde_json::to_string(map).expect("string map serialization cannot fail");
    std::fs::write(&tmp, content).map_err(|e| PersistError::Write(tmp.clone(), e))?;
    std::fs::rename(&tmp, &path).map_err(|e| PersistError::Write(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = BranchState::load(dir.path()).unwrap();

        assert!(state.last_commit("dev").is_none());
        assert!(state.commit_for_tag("20230815").is_none());
    }

    #[test]
    fn test_update_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let state = BranchState::load(dir.path()).unwrap();
            state.set_last_commit("dev", "abc123").unwrap();
            state.set_last_commit("master", "def456").unwrap();
            state.set_last_nightly_commit("dev", "abc123").unwrap();
            state.set_commit_for_tag("20230815", "abc123").unwrap();
        }

        // a fresh load sees exactly the mutated mappings
        let state = BranchState::load(dir.path()).unwrap();
        assert_eq!(state.last_commit("dev").as_deref(), Some("abc123"));
        assert_eq!(state.last_commit("master").as_deref(), Some("def456"));
        assert_eq!(state.last_nightly_commit("dev").as_deref(), Some("abc123"));
        assert_eq!(state.commit_for_tag("20230815").as_deref(), Some("abc123"));
        assert!(state.last_nightly_commit("master").is_none());
    }

    #[test]
    fn test_overwrite_single_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = BranchState::load(dir.path()).unwrap();

        state.set_last_commit("dev", "abc123").unwrap();
        state.set_last_commit("dev", "fed789").unwrap();

        let reloaded = BranchState::load(dir.path()).unwrap();
        assert_eq!(reloaded.last_commit("dev").as_deref(), Some("fed789"));
    }

    #[test]
    fn test_documents_are_flat_json_objects() {
        let dir = tempfile::tempdir().unwrap();
        let state = BranchState::load(dir.path()).unwrap();
        state.set_last_commit("dev", "abc123").unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("last-commit-by-branch.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["dev"], "abc123");
    }
}
