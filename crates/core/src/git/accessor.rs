//! The repository capability set the sync engine is written against.

use std::path::Path;

use git2::Oid;

use crate::errors::GitError;
use crate::models::{Author, Credentials};
use crate::status::FileStatusEntry;

/// Object-transfer counters reported during fetch and push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub current: u64,
    pub total: u64,
}

/// Repository operations consumed by the sync engine and merge completion.
///
/// [`crate::git::GitClient`] implements this over `git2`; the engine never
/// touches `git2` directly.
pub trait RepositoryAccessor {
    /// Root of the working directory.
    fn workdir(&self) -> &Path;

    /// Short name of the branch HEAD points at.
    fn current_branch(&self) -> Result<String, GitError>;

    /// Resolve a ref name or revision to a commit id.
    ///
    /// Fails with [`GitError::RefNotFound`] when it does not exist.
    fn resolve_ref(&self, refname: &str) -> Result<Oid, GitError>;

    /// Status matrix of the working directory and index against the tree of
    /// `at` (HEAD when `None`).
    fn status_matrix(&self, at: Option<Oid>) -> Result<Vec<FileStatusEntry>, GitError>;

    /// Best common ancestors of two commits; empty when histories are unrelated.
    fn find_merge_base(&self, a: Oid, b: Oid) -> Result<Vec<Oid>, GitError>;

    /// Content of `path` in the tree of `commit`.
    ///
    /// Fails with [`GitError::BlobNotFound`] when the path is not there.
    fn read_blob(&self, commit: Oid, path: &str) -> Result<Vec<u8>, GitError>;

    /// Content of `path` in the working directory.
    fn read_workdir_file(&self, path: &str) -> Result<Vec<u8>, GitError> {
        Ok(std::fs::read(self.workdir().join(path))?)
    }

    /// URL configured for `remote`.
    fn remote_url(&self, remote: &str) -> Result<String, GitError>;

    /// Fetch `remote`, updating its remote-tracking refs.
    fn fetch(
        &self,
        remote: &str,
        credentials: &Credentials,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), GitError>;

    /// Push local `branch` to the same name on `remote`.
    fn push(
        &self,
        remote: &str,
        branch: &str,
        credentials: &Credentials,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), GitError>;

    /// Move `branch` to `target` when one is an ancestor of the other.
    ///
    /// Returns `false` without touching anything when the histories diverged.
    fn fast_forward(&self, branch: &str, target: Oid) -> Result<bool, GitError>;

    /// Commit the index on top of HEAD, or with explicit `parents`.
    fn commit(
        &self,
        message: &str,
        author: &Author,
        parents: Option<&[Oid]>,
    ) -> Result<Oid, GitError>;

    /// Stage the working-directory content of `path`.
    fn add(&self, path: &str) -> Result<(), GitError>;

    /// Remove `path` from the index.
    fn remove(&self, path: &str) -> Result<(), GitError>;

    /// Bring the non-conflicting changes of `theirs` relative to `ours` into
    /// the index and working directory, leaving `skip` untouched.
    ///
    /// Returns the number of paths written.
    fn absorb_remote(&self, ours: Oid, theirs: Oid, skip: &[String]) -> Result<usize, GitError>;
}
