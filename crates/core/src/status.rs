//! Working-copy status analysis.
//!
//! A status matrix row describes one path relative to a reference commit: is
//! it in that commit's tree, how does the working directory compare to it,
//! and how does the index compare to both.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::GitError;
use crate::git::RepositoryAccessor;

/// Working-directory state of a path relative to the reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkdirState {
    Absent,
    Identical,
    Modified,
}

/// Index state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Absent,
    IdenticalToHead,
    IdenticalToWorkdir,
    Different,
}

/// One row of a status matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatusEntry {
    pub path: String,
    pub present_in_head: bool,
    pub workdir: WorkdirState,
    pub stage: StageState,
}

impl FileStatusEntry {
    pub fn new(
        path: impl Into<String>,
        present_in_head: bool,
        workdir: WorkdirState,
        stage: StageState,
    ) -> Self {
        Self {
            path: path.into(),
            present_in_head,
            workdir,
            stage,
        }
    }

    /// Not in the reference tree but present in the working directory.
    pub fn is_new(&self) -> bool {
        !self.present_in_head && self.workdir != WorkdirState::Absent
    }

    /// In the reference tree with different working-directory content.
    pub fn is_modified(&self) -> bool {
        self.present_in_head && self.workdir == WorkdirState::Modified
    }

    /// In the reference tree but gone from the working directory.
    pub fn is_deleted(&self) -> bool {
        self.present_in_head && self.workdir == WorkdirState::Absent
    }

    /// The index differs from the reference tree.
    pub fn has_staged_change(&self) -> bool {
        match (self.present_in_head, self.stage) {
            (true, StageState::IdenticalToHead) => false,
            (false, StageState::Absent) => false,
            _ => true,
        }
    }

    /// The working directory differs from the index.
    pub fn has_workdir_change(&self) -> bool {
        match self.stage {
            StageState::IdenticalToWorkdir => false,
            StageState::Different => true,
            StageState::Absent => self.workdir != WorkdirState::Absent,
            StageState::IdenticalToHead => self.workdir != WorkdirState::Identical,
        }
    }

    pub fn is_any_change(&self) -> bool {
        self.is_new()
            || self.is_modified()
            || self.is_deleted()
            || self.has_staged_change()
            || self.has_workdir_change()
    }
}

/// Dirty flag plus the full status matrix against HEAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingCopyState {
    pub is_dirty: bool,
    pub status: Vec<FileStatusEntry>,
}

impl WorkingCopyState {
    pub fn from_status(status: Vec<FileStatusEntry>) -> Self {
        let is_dirty = status.iter().any(FileStatusEntry::is_any_change);
        Self { is_dirty, status }
    }

    /// Rows that need staging before a commit.
    pub fn changed(&self) -> impl Iterator<Item = &FileStatusEntry> {
        self.status.iter().filter(|e| e.is_any_change())
    }
}

/// Compute the working-copy state against HEAD. Reads only.
pub fn get_working_copy_state<R: RepositoryAccessor + ?Sized>(
    repo: &R,
) -> Result<WorkingCopyState, GitError> {
    let state = WorkingCopyState::from_status(repo.status_matrix(None)?);
    debug!(
        dirty = state.is_dirty,
        changed = state.changed().count(),
        "working copy state"
    );
    Ok(state)
}
