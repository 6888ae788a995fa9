//! Local Git repository operations via `git2`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature, StatusOptions, Tree, TreeWalkMode, TreeWalkResult,
};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;
use crate::git::accessor::{RepositoryAccessor, TransferProgress};
use crate::models::{Author, Credentials};
use crate::status::{FileStatusEntry, StageState, WorkdirState};

/// Stage bits of `git2::IndexEntry::flags`.
const INDEX_STAGE_MASK: u16 = 0x3000;

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        let repo_path = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self { repo, repo_path })
    }

    /// Create a new repository with a working directory at `path`.
    #[instrument(fields(path = %path.display()))]
    pub fn init(path: &Path) -> Result<Self, GitError> {
        info!("initializing git repository");
        Repository::init(path)?;
        Self::new(path)
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Commit id HEAD points at.
    pub fn head_oid(&self) -> Result<Oid, GitError> {
        self.resolve_ref("HEAD")
    }

    fn find_commit(&self, oid: Oid) -> Result<Commit<'_>, GitError> {
        Ok(self.repo.find_commit(oid)?)
    }

    fn reference_tree(&self, at: Option<Oid>) -> Result<Option<Tree<'_>>, GitError> {
        let oid = match at {
            Some(oid) => oid,
            None => match self.head_oid() {
                Ok(oid) => oid,
                // Unborn branch: nothing committed yet.
                Err(GitError::RefNotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        Ok(Some(self.find_commit(oid)?.tree()?))
    }

    fn callbacks<'a>(
        credentials: &Credentials,
        attempts: &'a Cell<u32>,
    ) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let username = credentials.username.clone();
        let password = credentials.password.clone();
        callbacks.credentials(move |_url, _username, _allowed| {
            // libgit2 re-invokes the callback after a rejected attempt.
            let n = attempts.get() + 1;
            attempts.set(n);
            if n > 1 {
                return Err(git2::Error::from_str("authentication rejected by remote"));
            }
            Cred::userpass_plaintext(&username, &password)
        });
        callbacks
    }
}

/// Every blob path in `tree`, with its id. Submodule entries are skipped.
fn tree_blobs(tree: &Tree<'_>) -> Result<BTreeMap<String, Oid>, GitError> {
    let mut blobs = BTreeMap::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                blobs.insert(format!("{root}{name}"), entry.id());
            }
        }
        TreeWalkResult::Ok
    })?;
    Ok(blobs)
}

fn entry_path(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

impl RepositoryAccessor for GitClient {
    fn workdir(&self) -> &Path {
        &self.repo_path
    }

    fn current_branch(&self) -> Result<String, GitError> {
        match self.repo.head() {
            Ok(head) => {
                if !head.is_branch() {
                    return Err(GitError::DetachedHead);
                }
                head.shorthand()
                    .map(str::to_string)
                    .ok_or(GitError::DetachedHead)
            }
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = self.repo.find_reference("HEAD")?;
                head.symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string)
                    .ok_or(GitError::DetachedHead)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_ref(&self, refname: &str) -> Result<Oid, GitError> {
        match self.repo.revparse_single(refname) {
            Ok(object) => Ok(object.peel_to_commit()?.id()),
            Err(e) if matches!(e.code(), ErrorCode::NotFound | ErrorCode::UnbornBranch) => {
                Err(GitError::RefNotFound(refname.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    fn status_matrix(&self, at: Option<Oid>) -> Result<Vec<FileStatusEntry>, GitError> {
        let head = match self.reference_tree(at)? {
            Some(tree) => tree_blobs(&tree)?,
            None => BTreeMap::new(),
        };

        let mut index = self.repo.index()?;
        index.read(false)?;
        let mut staged: BTreeMap<String, Oid> = BTreeMap::new();
        for entry in index.iter() {
            if entry.flags & INDEX_STAGE_MASK == 0 {
                staged.insert(entry_path(&entry.path), entry.id);
            }
        }

        let mut paths: BTreeSet<String> = head.keys().cloned().collect();
        paths.extend(staged.keys().cloned());

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .exclude_submodules(true);
        for status in self.repo.statuses(Some(&mut opts))?.iter() {
            if status.status().is_wt_new() {
                if let Some(path) = status.path() {
                    paths.insert(path.to_string());
                }
            }
        }

        let mut rows = Vec::with_capacity(paths.len());
        for path in paths {
            let full = self.repo_path.join(&path);
            let on_disk = if full.is_file() {
                Some(Oid::hash_file(ObjectType::Blob, &full)?)
            } else {
                None
            };
            let in_head = head.get(&path).copied();

            let workdir = match (on_disk, in_head) {
                (None, _) => WorkdirState::Absent,
                (Some(disk), Some(tree)) if disk == tree => WorkdirState::Identical,
                (Some(_), _) => WorkdirState::Modified,
            };
            let stage = match staged.get(&path).copied() {
                None => StageState::Absent,
                Some(id) if Some(id) == in_head => StageState::IdenticalToHead,
                Some(id) if Some(id) == on_disk => StageState::IdenticalToWorkdir,
                Some(_) => StageState::Different,
            };
            rows.push(FileStatusEntry::new(path, in_head.is_some(), workdir, stage));
        }
        debug!(rows = rows.len(), "status matrix computed");
        Ok(rows)
    }

    fn find_merge_base(&self, a: Oid, b: Oid) -> Result<Vec<Oid>, GitError> {
        match self.repo.merge_bases(a, b) {
            Ok(bases) => Ok(bases.iter().copied().collect()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_blob(&self, commit: Oid, path: &str) -> Result<Vec<u8>, GitError> {
        let tree = self.find_commit(commit)?.tree()?;
        let entry = tree.get_path(Path::new(path)).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::BlobNotFound {
                    commit: commit.to_string(),
                    path: path.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        let object = entry.to_object(&self.repo)?;
        let blob = object.peel_to_blob().map_err(|_| GitError::BlobNotFound {
            commit: commit.to_string(),
            path: path.to_string(),
        })?;
        Ok(blob.content().to_vec())
    }

    fn remote_url(&self, remote: &str) -> Result<String, GitError> {
        let remote = self.repo.find_remote(remote)?;
        Ok(remote.url().unwrap_or_default().to_string())
    }

    #[instrument(skip(self, credentials, progress))]
    fn fetch(
        &self,
        remote: &str,
        credentials: &Credentials,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), GitError> {
        info!(remote, "fetching");
        let mut handle = self.repo.find_remote(remote)?;
        let attempts = Cell::new(0);
        let mut callbacks = Self::callbacks(credentials, &attempts);
        callbacks.transfer_progress(|stats| {
            progress(TransferProgress {
                current: stats.received_objects() as u64,
                total: stats.total_objects() as u64,
            });
            true
        });
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);
        handle.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;
        debug!("fetch completed");
        Ok(())
    }

    #[instrument(skip(self, credentials, progress))]
    fn push(
        &self,
        remote: &str,
        branch: &str,
        credentials: &Credentials,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), GitError> {
        info!(remote, branch, "pushing");
        let mut handle = self.repo.find_remote(remote)?;
        let attempts = Cell::new(0);
        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let mut callbacks = Self::callbacks(credentials, &attempts);
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });
        callbacks.push_transfer_progress(|current, total, _bytes| {
            progress(TransferProgress {
                current: current as u64,
                total: total as u64,
            });
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        handle.push(&[&refspec], Some(&mut push_opts))?;
        drop(push_opts);

        if let Some(detail) = rejection.into_inner() {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }

        // Keep the remote-tracking ref in step with what the remote now holds.
        let local = self.resolve_ref(&format!("refs/heads/{branch}"))?;
        self.repo.reference(
            &format!("refs/remotes/{remote}/{branch}"),
            local,
            true,
            "projsync: push",
        )?;
        info!("push completed");
        Ok(())
    }

    #[instrument(skip(self))]
    fn fast_forward(&self, branch: &str, target: Oid) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{branch}");
        let commit = self.find_commit(target)?;
        let local = match self.resolve_ref(&refname) {
            Ok(local) => local,
            Err(GitError::RefNotFound(_)) => {
                // Nothing committed locally yet: adopt the target as-is.
                self.repo
                    .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
                self.repo
                    .reference(&refname, target, false, "projsync: initial fast-forward")?;
                info!(to = %target, "branch created at remote head");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        if local == target || self.repo.graph_descendant_of(local, target)? {
            debug!("local branch already contains target");
            return Ok(true);
        }
        if !self.repo.graph_descendant_of(target, local)? {
            debug!("histories diverged");
            return Ok(false);
        }

        self.repo
            .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
        self.repo
            .find_reference(&refname)?
            .set_target(target, "projsync: fast-forward")?;
        info!(from = %local, to = %target, "fast-forwarded");
        Ok(true)
    }

    #[instrument(skip(self, message, author))]
    fn commit(
        &self,
        message: &str,
        author: &Author,
        parents: Option<&[Oid]>,
    ) -> Result<Oid, GitError> {
        let mut index = self.repo.index()?;
        let tree_oid = index.write_tree()?;
        index.write()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now(&author.name, &author.email)?;

        let parent_commits: Vec<Commit<'_>> = match parents {
            Some(ids) => ids
                .iter()
                .map(|id| self.find_commit(*id))
                .collect::<Result<_, _>>()?,
            None => match self.head_oid() {
                Ok(head) => vec![self.find_commit(head)?],
                Err(GitError::RefNotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            },
        };
        let parent_refs: Vec<&Commit<'_>> = parent_commits.iter().collect();
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parent_refs,
        )?;
        info!(sha = %oid, parents = parent_refs.len(), "created commit");
        Ok(oid)
    }

    fn add(&self, path: &str) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_path(Path::new(path))?;
        index.write()?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.remove_path(Path::new(path))?;
        index.write()?;
        Ok(())
    }

    #[instrument(skip(self, skip))]
    fn absorb_remote(&self, ours: Oid, theirs: Oid, skip: &[String]) -> Result<usize, GitError> {
        let ours_commit = self.find_commit(ours)?;
        let theirs_commit = self.find_commit(theirs)?;
        let merged = self.repo.merge_commits(&ours_commit, &theirs_commit, None)?;

        let mut untouchable: HashSet<String> = skip.iter().cloned().collect();
        if merged.has_conflicts() {
            for conflict in merged.conflicts()? {
                let conflict = conflict?;
                for entry in [conflict.ancestor, conflict.our, conflict.their]
                    .into_iter()
                    .flatten()
                {
                    untouchable.insert(entry_path(&entry.path));
                }
            }
        }

        let ours_blobs = tree_blobs(&ours_commit.tree()?)?;
        let mut index = self.repo.index()?;
        let mut merged_paths = HashSet::new();
        let mut written = 0;

        for entry in merged.iter() {
            if entry.flags & INDEX_STAGE_MASK != 0 {
                continue;
            }
            let path = entry_path(&entry.path);
            merged_paths.insert(path.clone());
            if untouchable.contains(&path) || ours_blobs.get(&path) == Some(&entry.id) {
                continue;
            }
            let blob = self.repo.find_blob(entry.id)?;
            let full = self.repo_path.join(&path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, blob.content())?;
            index.add_path(Path::new(&path))?;
            debug!(path, "absorbed remote change");
            written += 1;
        }

        for path in ours_blobs.keys() {
            if merged_paths.contains(path) || untouchable.contains(path) {
                continue;
            }
            let full = self.repo_path.join(path);
            if full.is_file() {
                fs::remove_file(&full)?;
            }
            index.remove_path(Path::new(path))?;
            debug!(path, "absorbed remote deletion");
            written += 1;
        }

        index.write()?;
        info!(written, "remote changes absorbed");
        Ok(written)
    }
}
