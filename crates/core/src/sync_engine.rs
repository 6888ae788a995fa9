//! Sync orchestrator.
//!
//! The [`SyncEngine`] runs one sync attempt per call:
//!
//! 1. Acquire the persisted sync lock (contention is a silent no-op).
//! 2. Commit local changes, if any.
//! 3. Check connectivity, then fetch the remote.
//! 4. Publish, fast-forward, or reconcile diverged histories.
//! 5. Release the lock on every path.
//!
//! Diverged histories are never merged here: the conflict list is returned to
//! the caller, who resolves it and hands the result to
//! [`crate::merge::MergeCompletion`].

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use git2::Oid;
use tracing::{debug, info, instrument, warn};

use crate::config::ProjsyncConfig;
use crate::conflict::{reconcile, CommitSnapshots, ConflictedFile};
use crate::errors::{ConfigError, GitError, SyncError};
use crate::git::{
    AssumeOnline, Connectivity, GitClient, HttpProbe, RepositoryAccessor, TransferProgress,
};
use crate::lock::{LockStatus, SyncLock, SyncLockGuard};
use crate::models::{
    Author, Credentials, Progress, ProgressSink, SyncOutcome, SyncPhase, SyncReport,
};
use crate::status::{get_working_copy_state, WorkdirState};

/// Minimum spacing between lock-file heartbeats driven by transfer callbacks.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Phase reporting
// ---------------------------------------------------------------------------

/// Fans phase and progress updates out to the lock heartbeat and the sink.
///
/// Transfer callbacks fire per object, so lock-file writes are throttled; the
/// sink sees every update.
pub(crate) struct PhaseReporter<'a> {
    guard: &'a SyncLockGuard<'a>,
    sink: &'a dyn ProgressSink,
    last_heartbeat: Cell<Option<Instant>>,
}

impl<'a> PhaseReporter<'a> {
    pub(crate) fn new(guard: &'a SyncLockGuard<'a>, sink: &'a dyn ProgressSink) -> Self {
        Self {
            guard,
            sink,
            last_heartbeat: Cell::new(None),
        }
    }

    pub(crate) fn enter(&self, phase: SyncPhase) {
        debug!(%phase, "entering phase");
        self.guard.heartbeat(phase, None);
        self.last_heartbeat.set(Some(Instant::now()));
        self.sink.report(phase, None);
    }

    pub(crate) fn progress(&self, phase: SyncPhase, progress: Progress) {
        self.sink.report(phase, Some(&progress));
        let due = progress.current >= progress.total
            || self
                .last_heartbeat
                .get()
                .map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL);
        if due {
            self.guard.heartbeat(phase, Some(progress));
            self.last_heartbeat.set(Some(Instant::now()));
        }
    }

    pub(crate) fn transfer(&self, phase: SyncPhase, description: &str, p: TransferProgress) {
        self.progress(phase, Progress::new(p.current, p.total, description));
    }
}

/// `None` when `refname` does not exist.
pub(crate) fn optional_ref<R: RepositoryAccessor + ?Sized>(
    repo: &R,
    refname: &str,
) -> Result<Option<Oid>, GitError> {
    match repo.resolve_ref(refname) {
        Ok(oid) => Ok(Some(oid)),
        Err(GitError::RefNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Run three-way reconciliation between two heads.
pub fn reconcile_heads<R: RepositoryAccessor + ?Sized>(
    repo: &R,
    local: Oid,
    remote: Oid,
) -> Result<Vec<ConflictedFile>, GitError> {
    let base = repo.find_merge_base(local, remote)?.into_iter().next();
    if base.is_none() {
        warn!(%local, %remote, "histories share no merge base");
    }
    let local_status = repo.status_matrix(Some(local))?;
    let remote_status = repo.status_matrix(Some(remote))?;
    let base_status = match base {
        Some(base) => repo.status_matrix(Some(base))?,
        None => Vec::new(),
    };
    let content = CommitSnapshots::new(repo, local, remote, base);
    Ok(reconcile(&local_status, &remote_status, &base_status, &content))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The sync orchestrator.
pub struct SyncEngine {
    config: ProjsyncConfig,
    connectivity: Arc<dyn Connectivity>,
}

impl SyncEngine {
    pub fn new(config: ProjsyncConfig, connectivity: Arc<dyn Connectivity>) -> Self {
        info!(remote = %config.sync.remote, "initializing sync engine");
        Self {
            config,
            connectivity,
        }
    }

    /// Build an engine whose connectivity check follows `[connectivity]`.
    pub fn from_config(config: ProjsyncConfig) -> Result<Self, ConfigError> {
        let connectivity: Arc<dyn Connectivity> = if config.connectivity.enabled {
            Arc::new(HttpProbe::new(
                config.connectivity.api_url.clone(),
                config.connectivity.timeout(),
            )?)
        } else {
            Arc::new(AssumeOnline)
        };
        Ok(Self::new(config, connectivity))
    }

    pub fn config(&self) -> &ProjsyncConfig {
        &self.config
    }

    /// Lock manager for the workspace at `dir`.
    pub fn lock_for(&self, dir: &Path) -> SyncLock {
        SyncLock::with_settings(dir, &self.config.lock.file_name, self.config.lock.stale_after())
    }

    /// Observability snapshot of the workspace lock.
    pub fn lock_status(&self, dir: &Path) -> LockStatus {
        self.lock_for(dir).check_filesystem_lock()
    }

    fn branch<R: RepositoryAccessor + ?Sized>(&self, repo: &R) -> Result<String, GitError> {
        match &self.config.sync.branch {
            Some(branch) => Ok(branch.clone()),
            None => repo.current_branch(),
        }
    }

    fn tracking_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.config.sync.remote, branch)
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Run one sync attempt for the workspace at `dir`.
    ///
    /// Returns [`SyncOutcome::AlreadySyncing`] without touching anything when
    /// another attempt holds the lock.
    #[instrument(skip(self, credentials, author, sink), fields(dir = %dir.display()))]
    pub async fn sync_changes(
        &self,
        dir: &Path,
        credentials: &Credentials,
        author: &Author,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let repo = GitClient::new(dir)?;
        let lock = self.lock_for(dir);
        let Some(guard) = lock.try_guard()? else {
            info!("sync already running, skipping");
            return Ok(SyncReport::clean(SyncOutcome::AlreadySyncing, None));
        };

        let reporter = PhaseReporter::new(&guard, sink);
        reporter.enter(SyncPhase::LockAcquired);
        let result = self.run_sync(&repo, &reporter, credentials, author).await;
        drop(guard);
        sink.report(SyncPhase::LockReleased, None);

        match &result {
            Ok(report) => info!(outcome = %report.outcome, "sync finished"),
            Err(e) => warn!(error = %e, "sync failed"),
        }
        result
    }

    async fn run_sync<R: RepositoryAccessor + ?Sized>(
        &self,
        repo: &R,
        reporter: &PhaseReporter<'_>,
        credentials: &Credentials,
        author: &Author,
    ) -> Result<SyncReport, SyncError> {
        let remote = self.config.sync.remote.as_str();
        let branch = self.branch(repo)?;
        let local_ref = format!("refs/heads/{branch}");

        // Commit local changes.
        reporter.enter(SyncPhase::Committing);
        let committed = self.commit_local_changes(repo, reporter, author)?;

        // Connectivity; a committed change stays committed when offline.
        let url = repo.remote_url(remote)?;
        self.connectivity.check(&url).await?;

        reporter.enter(SyncPhase::Fetching);
        repo.fetch(remote, credentials, &mut |p: TransferProgress| {
            reporter.transfer(SyncPhase::Fetching, "receiving objects", p)
        })?;

        let local_head = optional_ref(repo, &local_ref)?;
        let Some(remote_head) = optional_ref(repo, &self.tracking_ref(&branch))? else {
            if local_head.is_none() {
                info!("nothing committed on either side");
                return Ok(SyncReport::clean(SyncOutcome::AlreadyInSync, committed));
            }
            info!(branch = %branch, "remote branch missing, publishing");
            self.push(repo, reporter, &branch, credentials)?;
            return Ok(SyncReport::clean(SyncOutcome::FirstPublish, committed));
        };

        if local_head == Some(remote_head) {
            info!("already in sync");
            return Ok(SyncReport::clean(SyncOutcome::AlreadyInSync, committed));
        }

        reporter.enter(SyncPhase::FastForwardAttempt);
        if repo.fast_forward(&branch, remote_head)? {
            let new_local = repo.resolve_ref(&local_ref)?;
            if new_local != remote_head {
                self.push(repo, reporter, &branch, credentials)?;
            }
            return Ok(SyncReport::clean(SyncOutcome::FastForwarded, committed));
        }

        reporter.enter(SyncPhase::Reconciling);
        let local_head = repo.resolve_ref(&local_ref)?;
        let conflicts = reconcile_heads(repo, local_head, remote_head)?;
        if conflicts.is_empty() {
            info!("histories diverged without conflicts; nothing pushed");
            return Ok(SyncReport::clean(
                SyncOutcome::DivergedWithoutConflicts,
                committed,
            ));
        }
        info!(count = conflicts.len(), "conflicts need resolution");
        Ok(SyncReport::with_conflicts(conflicts, committed))
    }

    /// Stage every changed path and commit. `None` when the working copy is clean.
    fn commit_local_changes<R: RepositoryAccessor + ?Sized>(
        &self,
        repo: &R,
        reporter: &PhaseReporter<'_>,
        author: &Author,
    ) -> Result<Option<String>, SyncError> {
        let state = get_working_copy_state(repo)?;
        if !state.is_dirty {
            debug!("working copy clean, nothing to commit");
            return Ok(None);
        }

        let changed: Vec<_> = state.changed().collect();
        let total = changed.len() as u64;
        for (i, entry) in changed.iter().enumerate() {
            if entry.workdir == WorkdirState::Absent {
                repo.remove(&entry.path)?;
            } else {
                repo.add(&entry.path)?;
            }
            reporter.progress(
                SyncPhase::Committing,
                Progress::new(i as u64 + 1, total, format!("staging {}", entry.path)),
            );
        }

        let oid = repo.commit(&self.config.sync.commit_message, author, None)?;
        info!(sha = %oid, files = total, "committed local changes");
        Ok(Some(oid.to_string()))
    }

    fn push<R: RepositoryAccessor + ?Sized>(
        &self,
        repo: &R,
        reporter: &PhaseReporter<'_>,
        branch: &str,
        credentials: &Credentials,
    ) -> Result<(), SyncError> {
        reporter.enter(SyncPhase::Pushing);
        let remote = self.config.sync.remote.as_str();
        repo.push(remote, branch, credentials, &mut |p: TransferProgress| {
            reporter.transfer(SyncPhase::Pushing, "sending objects", p)
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Rebuild the conflict list against the last fetched remote state.
    ///
    /// Reads only: no fetch, no lock. Empty when the histories have not
    /// diverged.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn pending_conflicts(&self, dir: &Path) -> Result<Vec<ConflictedFile>, SyncError> {
        let repo = GitClient::new(dir)?;
        let branch = self.branch(&repo)?;
        let (Some(local), Some(remote)) = (
            optional_ref(&repo, &format!("refs/heads/{branch}"))?,
            optional_ref(&repo, &self.tracking_ref(&branch))?,
        ) else {
            return Ok(Vec::new());
        };
        if local == remote {
            return Ok(Vec::new());
        }
        let bases = repo.find_merge_base(local, remote)?;
        if bases.contains(&local) || bases.contains(&remote) {
            debug!("one head contains the other; nothing to reconcile");
            return Ok(Vec::new());
        }
        Ok(reconcile_heads(&repo, local, remote)?)
    }
}
