//! Domain model types shared by the lock, the sync engine and merge completion.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictedFile;

// ---------------------------------------------------------------------------
// Identity & credentials
// ---------------------------------------------------------------------------

/// Basic-auth credentials for fetch and push.
///
/// Supplied by the caller on every call and never written to disk.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Author identity stamped on sync and merge commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase & progress
// ---------------------------------------------------------------------------

/// Phase of a sync or merge-completion attempt, as recorded in the lock file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    LockAcquired,
    Committing,
    Fetching,
    FastForwardAttempt,
    Pushing,
    Reconciling,
    Merging,
    LockReleased,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LockAcquired => write!(f, "lock_acquired"),
            Self::Committing => write!(f, "committing"),
            Self::Fetching => write!(f, "fetching"),
            Self::FastForwardAttempt => write!(f, "fast_forward_attempt"),
            Self::Pushing => write!(f, "pushing"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Merging => write!(f, "merging"),
            Self::LockReleased => write!(f, "lock_released"),
        }
    }
}

/// Counter-style progress within a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub description: String,
}

impl Progress {
    pub fn new(current: u64, total: u64, description: impl Into<String>) -> Self {
        Self {
            current,
            total,
            description: description.into(),
        }
    }
}

/// Receives phase/progress updates from the sync engine and merge completion.
pub trait ProgressSink {
    fn report(&self, phase: SyncPhase, progress: Option<&Progress>);
}

/// A sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _phase: SyncPhase, _progress: Option<&Progress>) {}
}

// ---------------------------------------------------------------------------
// Sync results
// ---------------------------------------------------------------------------

/// Terminal state reached by one `sync_changes` attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Another attempt holds the lock; nothing was done.
    AlreadySyncing,
    /// The remote branch did not exist and was created by the push.
    FirstPublish,
    /// Local and remote heads were already equal.
    AlreadyInSync,
    /// One side was an ancestor of the other; fast-forwarded and pushed.
    FastForwarded,
    /// Histories diverged without path-level conflicts; nothing was pushed.
    DivergedWithoutConflicts,
    /// Histories diverged with conflicts that need resolution.
    ConflictsReported,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySyncing => write!(f, "already_syncing"),
            Self::FirstPublish => write!(f, "first_publish"),
            Self::AlreadyInSync => write!(f, "already_in_sync"),
            Self::FastForwarded => write!(f, "fast_forwarded"),
            Self::DivergedWithoutConflicts => write!(f, "diverged_without_conflicts"),
            Self::ConflictsReported => write!(f, "conflicts_reported"),
        }
    }
}

/// Result of `SyncEngine::sync_changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub had_conflicts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<ConflictedFile>>,
    pub outcome: SyncOutcome,
    /// Commit created for local changes during this attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<String>,
}

impl SyncReport {
    pub(crate) fn clean(outcome: SyncOutcome, committed: Option<String>) -> Self {
        Self {
            had_conflicts: false,
            conflicts: None,
            outcome,
            committed,
        }
    }

    pub(crate) fn with_conflicts(conflicts: Vec<ConflictedFile>, committed: Option<String>) -> Self {
        Self {
            had_conflicts: true,
            conflicts: Some(conflicts),
            outcome: SyncOutcome::ConflictsReported,
            committed,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge completion
// ---------------------------------------------------------------------------

/// What the resolver did with a conflicted path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Deleted,
    Created,
    Modified,
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted => write!(f, "deleted"),
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// One externally resolved path handed to `complete_merge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub path: String,
    pub resolution: ResolutionKind,
}

impl ResolvedFile {
    pub fn new(path: impl Into<String>, resolution: ResolutionKind) -> Self {
        Self {
            path: path.into(),
            resolution,
        }
    }
}

/// Result of `MergeCompletion::complete_merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub commit: String,
    /// `true` when the commit carries both local and remote parents.
    pub is_merge_commit: bool,
    pub pushed: bool,
    /// Non-conflicting remote paths brought into the merge.
    pub absorbed_paths: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_phase_serde_matches_display() {
        for phase in [
            SyncPhase::Committing,
            SyncPhase::FastForwardAttempt,
            SyncPhase::LockReleased,
        ] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase));
        }
    }

    #[test]
    fn test_clean_report_omits_conflicts() {
        let report = SyncReport::clean(SyncOutcome::AlreadyInSync, None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["had_conflicts"], false);
        assert!(json.get("conflicts").is_none());
        assert_eq!(json["outcome"], "already_in_sync");
    }
}
