//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] turns a decision about a conflicted path into
//! working-directory content and the [`ResolvedFile`] that merge completion
//! stages.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::conflict::reconcile::ConflictedFile;
use crate::errors::ConflictError;
use crate::models::{ResolutionKind, ResolvedFile};

/// Named resolution strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionChoice {
    /// Keep the local version (deleting the file if the local side deleted it).
    Ours,
    /// Take the remote version (deleting the file if the remote side deleted it).
    Theirs,
    /// Use custom merged content.
    Merged(String),
    /// Delete the path.
    Delete,
}

/// Stateless conflict resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Find the pending conflict for `path`.
    pub fn find<'a>(
        conflicts: &'a [ConflictedFile],
        path: &str,
    ) -> Result<&'a ConflictedFile, ConflictError> {
        conflicts
            .iter()
            .find(|c| c.path == path)
            .ok_or_else(|| ConflictError::NotFound(path.to_string()))
    }

    /// Content the working directory should hold for `choice`; `None` means
    /// the path is deleted.
    pub fn resolved_content(conflict: &ConflictedFile, choice: &ResolutionChoice) -> Option<String> {
        match choice {
            ResolutionChoice::Ours if conflict.ours_deleted() => None,
            ResolutionChoice::Ours => Some(conflict.ours_content.clone()),
            ResolutionChoice::Theirs if conflict.theirs_deleted() => None,
            ResolutionChoice::Theirs => Some(conflict.theirs_content.clone()),
            ResolutionChoice::Merged(content) => Some(content.clone()),
            ResolutionChoice::Delete => None,
        }
    }

    /// Write the resolution for `conflict` into `workdir`.
    pub fn apply(
        workdir: &Path,
        conflict: &ConflictedFile,
        choice: &ResolutionChoice,
    ) -> Result<ResolvedFile, ConflictError> {
        let full = workdir.join(&conflict.path);
        let io_err = |source| ConflictError::Io {
            path: conflict.path.clone(),
            source,
        };

        let resolution = match Self::resolved_content(conflict, choice) {
            None => {
                if full.exists() {
                    fs::remove_file(&full).map_err(io_err)?;
                }
                ResolutionKind::Deleted
            }
            Some(content) => {
                let existed = full.exists();
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                fs::write(&full, content).map_err(io_err)?;
                if existed {
                    ResolutionKind::Modified
                } else {
                    ResolutionKind::Created
                }
            }
        };
        info!(path = %conflict.path, ?choice, %resolution, "conflict resolved");
        Ok(ResolvedFile::new(conflict.path.clone(), resolution))
    }

    /// Describe the current working-directory state of a conflicted path as a
    /// resolution, for callers that let the user edit files directly.
    pub fn from_workdir(workdir: &Path, conflict: &ConflictedFile) -> ResolvedFile {
        let resolution = if !workdir.join(&conflict.path).exists() {
            ResolutionKind::Deleted
        } else if conflict.is_new || conflict.ours_deleted() {
            ResolutionKind::Created
        } else {
            ResolutionKind::Modified
        };
        debug!(path = %conflict.path, %resolution, "derived resolution from working directory");
        ResolvedFile::new(conflict.path.clone(), resolution)
    }
}
