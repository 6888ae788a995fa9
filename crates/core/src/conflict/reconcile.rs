//! Three-way reconciliation of local, remote and merge-base snapshots.
//!
//! Every path in the union of the three status matrices is classified exactly
//! once, then checked for a content-level conflict. Classification is driven by
//! presence in each snapshot; conflict detection is driven by content, so a path
//! whose local and remote content are identical is never reported.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt;

use git2::Oid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::GitError;
use crate::git::RepositoryAccessor;
use crate::status::FileStatusEntry;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a path changed between the merge base and the two heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    AddedRemotely,
    AddedLocally,
    DeletedRemotely,
    DeletedLocally,
    ModifiedPotentialConflict,
    AddedOnBothSides,
    DeletedOnBothSides,
    Unchanged,
}

impl fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddedRemotely => write!(f, "added_remotely"),
            Self::AddedLocally => write!(f, "added_locally"),
            Self::DeletedRemotely => write!(f, "deleted_remotely"),
            Self::DeletedLocally => write!(f, "deleted_locally"),
            Self::ModifiedPotentialConflict => write!(f, "modified_potential_conflict"),
            Self::AddedOnBothSides => write!(f, "added_on_both_sides"),
            Self::DeletedOnBothSides => write!(f, "deleted_on_both_sides"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Which snapshot a piece of content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Ours,
    Theirs,
    Base,
}

/// A path that needs a human decision before the histories can be joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictedFile {
    pub path: String,
    pub ours_content: String,
    pub theirs_content: String,
    pub base_content: String,
    /// Absent from the merge base, present on at least one side.
    pub is_new: bool,
    /// Present in the merge base, deleted on exactly one side.
    pub is_deleted: bool,
    pub classification: ChangeClass,
}

impl ConflictedFile {
    pub fn ours_deleted(&self) -> bool {
        self.classification == ChangeClass::DeletedLocally
    }

    pub fn theirs_deleted(&self) -> bool {
        self.classification == ChangeClass::DeletedRemotely
    }
}

/// Content source for the three snapshots.
pub trait SnapshotContent {
    fn load(&self, side: Side, path: &str) -> Result<Vec<u8>, GitError>;
}

/// Reads snapshot content from commits through a [`RepositoryAccessor`].
///
/// `Ours` falls back to the working directory for paths the local head does
/// not contain.
pub struct CommitSnapshots<'a, R: RepositoryAccessor + ?Sized> {
    repo: &'a R,
    local: Oid,
    remote: Oid,
    base: Option<Oid>,
}

impl<'a, R: RepositoryAccessor + ?Sized> CommitSnapshots<'a, R> {
    pub fn new(repo: &'a R, local: Oid, remote: Oid, base: Option<Oid>) -> Self {
        Self {
            repo,
            local,
            remote,
            base,
        }
    }
}

impl<R: RepositoryAccessor + ?Sized> SnapshotContent for CommitSnapshots<'_, R> {
    fn load(&self, side: Side, path: &str) -> Result<Vec<u8>, GitError> {
        match side {
            Side::Ours => match self.repo.read_blob(self.local, path) {
                Err(GitError::BlobNotFound { .. }) => self.repo.read_workdir_file(path),
                other => other,
            },
            Side::Theirs => self.repo.read_blob(self.remote, path),
            Side::Base => match self.base {
                Some(base) => self.repo.read_blob(base, path),
                None => Err(GitError::BlobNotFound {
                    commit: "<no merge base>".into(),
                    path: path.to_string(),
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Per-path content cache
// ---------------------------------------------------------------------------

/// Lazily loaded content of one path on all three sides.
///
/// Unreadable content degrades to an empty string.
struct PathContent<'a> {
    source: &'a dyn SnapshotContent,
    path: &'a str,
    ours: OnceCell<String>,
    theirs: OnceCell<String>,
    base: OnceCell<String>,
}

impl<'a> PathContent<'a> {
    fn new(source: &'a dyn SnapshotContent, path: &'a str) -> Self {
        Self {
            source,
            path,
            ours: OnceCell::new(),
            theirs: OnceCell::new(),
            base: OnceCell::new(),
        }
    }

    fn get(&self, side: Side) -> &str {
        let cell = match side {
            Side::Ours => &self.ours,
            Side::Theirs => &self.theirs,
            Side::Base => &self.base,
        };
        cell.get_or_init(|| match self.source.load(side, self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!(path = self.path, ?side, error = %e, "content unavailable, using empty");
                String::new()
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Status rows of one path in the three snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathRows<'a> {
    pub local: Option<&'a FileStatusEntry>,
    pub remote: Option<&'a FileStatusEntry>,
    pub base: Option<&'a FileStatusEntry>,
}

impl PathRows<'_> {
    fn presence(&self) -> (bool, bool, bool) {
        let present = |row: Option<&FileStatusEntry>| row.is_some_and(|r| r.present_in_head);
        (present(self.local), present(self.remote), present(self.base))
    }

    fn any_change(&self) -> bool {
        [self.local, self.remote, self.base]
            .into_iter()
            .flatten()
            .any(FileStatusEntry::is_any_change)
    }
}

/// Classify one path. `contents_differ` is consulted only when all three
/// snapshots contain the path and a change is flagged.
///
/// A path edited on one side only is still `ModifiedPotentialConflict` when
/// local and remote content differ.
pub fn classify(rows: &PathRows<'_>, contents_differ: impl FnOnce() -> bool) -> ChangeClass {
    match rows.presence() {
        (false, true, false) => ChangeClass::AddedRemotely,
        (true, false, false) => ChangeClass::AddedLocally,
        (true, false, true) => ChangeClass::DeletedRemotely,
        (false, true, true) => ChangeClass::DeletedLocally,
        (true, true, true) => {
            if rows.any_change() && contents_differ() {
                ChangeClass::ModifiedPotentialConflict
            } else {
                ChangeClass::Unchanged
            }
        }
        (true, true, false) => ChangeClass::AddedOnBothSides,
        (false, false, true) => ChangeClass::DeletedOnBothSides,
        (false, false, false) => ChangeClass::Unchanged,
    }
}

fn is_conflict(class: ChangeClass, rows: &PathRows<'_>, content: &PathContent<'_>) -> bool {
    let (local, remote, base) = rows.presence();
    match class {
        ChangeClass::ModifiedPotentialConflict => true,
        ChangeClass::DeletedRemotely => content.get(Side::Ours) != content.get(Side::Base),
        ChangeClass::DeletedLocally => content.get(Side::Theirs) != content.get(Side::Base),
        ChangeClass::AddedOnBothSides => content.get(Side::Ours) != content.get(Side::Theirs),
        _ if local && remote => {
            let ours = content.get(Side::Ours);
            let theirs = content.get(Side::Theirs);
            let base_content = if base { content.get(Side::Base) } else { "" };
            ours != theirs && (ours != base_content || theirs != base_content)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

fn index_rows(rows: &[FileStatusEntry]) -> BTreeMap<&str, &FileStatusEntry> {
    rows.iter().map(|r| (r.path.as_str(), r)).collect()
}

/// Every path in the union of the three snapshots with its rows, in path order.
pub fn union_rows<'a>(
    local: &'a [FileStatusEntry],
    remote: &'a [FileStatusEntry],
    base: &'a [FileStatusEntry],
) -> BTreeMap<&'a str, PathRows<'a>> {
    let mut all: BTreeMap<&str, PathRows<'_>> = BTreeMap::new();
    for (path, row) in index_rows(local) {
        all.entry(path).or_default().local = Some(row);
    }
    for (path, row) in index_rows(remote) {
        all.entry(path).or_default().remote = Some(row);
    }
    for (path, row) in index_rows(base) {
        all.entry(path).or_default().base = Some(row);
    }
    all
}

/// Reconcile three status snapshots and return the conflicting paths.
///
/// An empty result means the histories can be joined without a decision.
pub fn reconcile(
    local_status: &[FileStatusEntry],
    remote_status: &[FileStatusEntry],
    base_status: &[FileStatusEntry],
    content: &dyn SnapshotContent,
) -> Vec<ConflictedFile> {
    let all = union_rows(local_status, remote_status, base_status);
    let mut conflicts = Vec::new();
    let mut tally: BTreeMap<ChangeClass, usize> = BTreeMap::new();

    for (path, rows) in &all {
        let loaded = PathContent::new(content, path);
        let class = classify(rows, || {
            loaded.get(Side::Ours) != loaded.get(Side::Theirs)
        });
        *tally.entry(class).or_default() += 1;

        if !is_conflict(class, rows, &loaded) {
            continue;
        }
        let (local, remote, base) = rows.presence();
        let conflict = ConflictedFile {
            path: path.to_string(),
            ours_content: loaded.get(Side::Ours).to_string(),
            theirs_content: loaded.get(Side::Theirs).to_string(),
            base_content: loaded.get(Side::Base).to_string(),
            is_new: !base && (local || remote),
            is_deleted: base && (local != remote),
            classification: class,
        };
        // Identical content on both sides never needs a decision.
        if conflict.ours_content == conflict.theirs_content && local && remote {
            continue;
        }
        debug!(path = %conflict.path, class = %class, "conflict detected");
        conflicts.push(conflict);
    }

    info!(
        paths = all.len(),
        conflicts = conflicts.len(),
        classes = ?tally,
        "reconciliation complete"
    );
    conflicts
}
