//! Merge completion: turn externally resolved conflicts into a merge commit.
//!
//! Runs under the same persisted lock as the sync engine. Unlike a sync
//! attempt, contention here is an error: the caller is waiting on the result.

use std::path::Path;

use git2::Oid;
use tracing::{info, instrument, warn};

use crate::config::ProjsyncConfig;
use crate::errors::SyncError;
use crate::git::{GitClient, RepositoryAccessor, TransferProgress};
use crate::lock::{LockStatus, SyncLock};
use crate::models::{
    Author, Credentials, MergeReport, NoopProgress, Progress, ProgressSink, ResolutionKind,
    ResolvedFile, SyncPhase,
};
use crate::sync_engine::{optional_ref, PhaseReporter};

/// Completes a merge after the user resolved the reported conflicts.
pub struct MergeCompletion {
    config: ProjsyncConfig,
}

fn already_running(status: &LockStatus) -> SyncError {
    SyncError::AlreadyRunning {
        phase: status
            .phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".into()),
        since: status
            .phase_changed_at
            .or(status.acquired_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".into()),
    }
}

impl MergeCompletion {
    pub fn new(config: ProjsyncConfig) -> Self {
        Self { config }
    }

    /// Stage `resolved`, commit with the local and remote heads as parents
    /// and push.
    ///
    /// Fails with [`SyncError::AlreadyRunning`] without touching the
    /// repository when the lock is held. A failed push is logged and the local
    /// commit kept.
    pub async fn complete_merge(
        &self,
        dir: &Path,
        credentials: &Credentials,
        author: &Author,
        resolved: &[ResolvedFile],
    ) -> Result<MergeReport, SyncError> {
        self.complete_merge_with_progress(dir, credentials, author, resolved, &NoopProgress)
            .await
    }

    #[instrument(
        skip(self, credentials, author, resolved, sink),
        fields(dir = %dir.display(), resolved = resolved.len())
    )]
    pub async fn complete_merge_with_progress(
        &self,
        dir: &Path,
        credentials: &Credentials,
        author: &Author,
        resolved: &[ResolvedFile],
        sink: &dyn ProgressSink,
    ) -> Result<MergeReport, SyncError> {
        let repo = GitClient::new(dir)?;
        let lock = SyncLock::with_settings(
            dir,
            &self.config.lock.file_name,
            self.config.lock.stale_after(),
        );
        let Some(guard) = lock.try_guard()? else {
            let status = lock.check_filesystem_lock();
            warn!(phase = ?status.phase, "merge completion refused: sync in progress");
            return Err(already_running(&status));
        };

        let reporter = PhaseReporter::new(&guard, sink);
        reporter.enter(SyncPhase::Merging);
        let result = self.merge(&repo, &reporter, credentials, author, resolved);
        drop(guard);
        sink.report(SyncPhase::LockReleased, None);
        result
    }

    fn merge<R: RepositoryAccessor + ?Sized>(
        &self,
        repo: &R,
        reporter: &PhaseReporter<'_>,
        credentials: &Credentials,
        author: &Author,
        resolved: &[ResolvedFile],
    ) -> Result<MergeReport, SyncError> {
        let remote = self.config.sync.remote.as_str();
        let branch = match &self.config.sync.branch {
            Some(branch) => branch.clone(),
            None => repo.current_branch()?,
        };

        // Parents are pinned before fetching so the merge only joins the
        // remote state the user actually reviewed.
        let local_head = repo.resolve_ref(&format!("refs/heads/{branch}"))?;
        let remote_head = optional_ref(repo, &format!("refs/remotes/{remote}/{branch}"))?
            .filter(|remote_head| *remote_head != local_head);
        if remote_head.is_none() {
            warn!(branch = %branch, "no distinct remote head; committing without a merge parent");
        }

        // Nothing touches the working directory until every resolution is
        // known to be consistent with it.
        check_resolutions(repo, resolved)?;

        let absorbed_paths = match remote_head {
            Some(remote_head) => {
                let skip: Vec<String> = resolved.iter().map(|r| r.path.clone()).collect();
                repo.absorb_remote(local_head, remote_head, &skip)?
            }
            None => 0,
        };

        stage_resolutions(repo, reporter, resolved)?;

        if let Err(e) = repo.fetch(remote, credentials, &mut |p: TransferProgress| {
            reporter.transfer(SyncPhase::Merging, "receiving objects", p)
        }) {
            warn!(error = %e, "fetch before merge commit failed; continuing");
        }

        let (commit, is_merge_commit) =
            self.commit_merge(repo, author, local_head, remote_head)?;

        reporter.enter(SyncPhase::Pushing);
        let pushed = match repo.push(remote, &branch, credentials, &mut |p: TransferProgress| {
            reporter.transfer(SyncPhase::Pushing, "sending objects", p)
        }) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, sha = %commit, "push after merge failed; local commit kept");
                false
            }
        };

        info!(sha = %commit, is_merge_commit, pushed, absorbed_paths, "merge completed");
        Ok(MergeReport {
            commit: commit.to_string(),
            is_merge_commit,
            pushed,
            absorbed_paths,
        })
    }

    /// Two-parent commit, falling back to a single-parent commit of the same
    /// tree when the merge commit cannot be created.
    fn commit_merge<R: RepositoryAccessor + ?Sized>(
        &self,
        repo: &R,
        author: &Author,
        local_head: Oid,
        remote_head: Option<Oid>,
    ) -> Result<(Oid, bool), SyncError> {
        let message = self.config.sync.merge_message.as_str();
        if let Some(remote_head) = remote_head {
            match repo.commit(message, author, Some(&[local_head, remote_head][..])) {
                Ok(oid) => return Ok((oid, true)),
                Err(e) => warn!(error = %e, "merge commit failed; falling back to a regular commit"),
            }
        }
        Ok((repo.commit(message, author, None)?, false))
    }
}

/// Reject resolutions that disagree with the working directory: a created or
/// modified path must exist, a deleted path must be gone.
fn check_resolutions<R: RepositoryAccessor + ?Sized>(
    repo: &R,
    resolved: &[ResolvedFile],
) -> Result<(), SyncError> {
    for file in resolved {
        let on_disk = repo.workdir().join(&file.path).exists();
        let detail = match file.resolution {
            ResolutionKind::Deleted if on_disk => "still present in the working directory",
            ResolutionKind::Created | ResolutionKind::Modified if !on_disk => {
                "missing from the working directory"
            }
            _ => continue,
        };
        return Err(SyncError::InvalidResolution {
            path: file.path.clone(),
            detail: format!("marked {} but {}", file.resolution, detail),
        });
    }
    Ok(())
}

fn stage_resolutions<R: RepositoryAccessor + ?Sized>(
    repo: &R,
    reporter: &PhaseReporter<'_>,
    resolved: &[ResolvedFile],
) -> Result<(), SyncError> {
    let total = resolved.len() as u64;
    for (i, file) in resolved.iter().enumerate() {
        match file.resolution {
            ResolutionKind::Deleted => repo.remove(&file.path)?,
            ResolutionKind::Created | ResolutionKind::Modified => repo.add(&file.path)?,
        }
        reporter.progress(
            SyncPhase::Merging,
            Progress::new(i as u64 + 1, total, format!("staging {}", file.path)),
        );
    }
    Ok(())
}
