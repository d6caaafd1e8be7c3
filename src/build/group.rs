//! Build groups: the per-board builds of one revision, as a unit

use std::collections::HashMap;

use super::{BuildError, BuildId, GroupId};

/// Aggregates one build per board into a logical unit with two group-level
/// events: the first member starting and the last member ending. Both latch,
/// so each fires at most once regardless of how members end.
#[derive(Debug)]
pub struct BuildGroup {
    pub id: GroupId,
    builds: HashMap<String, BuildId>,
    first_build_begun: bool,
    last_build_ended: bool,
}

impl BuildGroup {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            builds: HashMap::new(),
            first_build_begun: false,
            last_build_ended: false,
        }
    }

    /// Register a member; at most one build per board.
    pub fn add_build(&mut self, board: &str, build: BuildId) -> Result<(), BuildError> {
        if self.builds.contains_key(board) {
            return Err(BuildError::DuplicateBoard(board.to_string()));
        }

        self.builds.insert(board.to_string(), build);
        Ok(())
    }

    /// Drop a member, e.g. when its queue entry is abandoned before running.
    pub fn remove_build(&mut self, board: &str) -> Option<BuildId> {
        self.builds.remove(board)
    }

    pub fn build_ids(&self) -> impl Iterator<Item = BuildId> + '_ {
        self.builds.values().copied()
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    /// Latch the first-begin event. True exactly once.
    pub fn latch_first_begin(&mut self) -> bool {
        if self.first_build_begun {
            return false;
        }
        self.first_build_begun = true;
        true
    }

    /// Latch the last-end event once every member has ended. True at most once.
    pub fn latch_last_end(&mut self, all_ended: bool) -> bool {
        if !all_ended || self.last_build_ended {
            return false;
        }
        self.last_build_ended = true;
        true
    }
}
