//! End-to-end tests for the sync engine and merge completion.
//!
//! These tests exercise the real `SyncEngine` with:
//! - A local bare "origin" repository
//! - Two working copies that publish to and fetch from it
//! - The persisted lock file under each working copy's `.git`
//!
//! No network I/O: the remote is a local path, so the HTTP probe skips it.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{Oid, Repository};
use tempfile::TempDir;

use projsync_core::conflict::{ChangeClass, ConflictResolver, ResolutionChoice};
use projsync_core::errors::SyncError;
use projsync_core::git::{Connectivity, GitClient, RepositoryAccessor};
use projsync_core::merge::MergeCompletion;
use projsync_core::models::{
    Author, Credentials, NoopProgress, Progress, ProgressSink, ResolutionKind, ResolvedFile,
    SyncOutcome, SyncPhase,
};
use projsync_core::sync_engine::SyncEngine;
use projsync_core::{get_working_copy_state, ProjsyncConfig};

// ===========================================================================
// Helpers
// ===========================================================================

struct Fixture {
    tmp: TempDir,
    origin: PathBuf,
    branch: String,
}

fn author() -> Author {
    Author::new("Test User", "test@example.com")
}

fn creds() -> Credentials {
    Credentials::new("", "")
}

fn engine() -> SyncEngine {
    SyncEngine::from_config(ProjsyncConfig::default()).unwrap()
}

fn write(dir: &Path, path: &str, content: &str) {
    let full = dir.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
}

fn read(dir: &Path, path: &str) -> String {
    std::fs::read_to_string(dir.join(path)).unwrap()
}

fn head(dir: &Path) -> Oid {
    GitClient::new(dir).unwrap().head_oid().unwrap()
}

fn origin_head(fx: &Fixture) -> Oid {
    let origin = Repository::open_bare(&fx.origin).unwrap();
    let reference = origin
        .find_reference(&format!("refs/heads/{}", fx.branch))
        .unwrap();
    reference.target().unwrap()
}

async fn sync(dir: &Path) -> projsync_core::SyncReport {
    engine()
        .sync_changes(dir, &creds(), &author(), &NoopProgress)
        .await
        .unwrap()
}

/// Bare origin plus a first working copy "a" that has published one commit
/// containing `README.md` and `a.txt`.
async fn published() -> (Fixture, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let origin = tmp.path().join("origin.git");
    Repository::init_bare(&origin).unwrap();

    let a = tmp.path().join("a");
    let client = GitClient::init(&a).unwrap();
    client
        .repo()
        .remote("origin", origin.to_str().unwrap())
        .unwrap();
    let branch = client.current_branch().unwrap();
    drop(client);

    write(&a, "README.md", "# Project\n");
    write(&a, "a.txt", "line1\nline2\nline3\n");
    let report = sync(&a).await;
    assert_eq!(report.outcome, SyncOutcome::FirstPublish);

    // Clones check out whatever the bare repository's HEAD names.
    Repository::open_bare(&origin)
        .unwrap()
        .set_head(&format!("refs/heads/{branch}"))
        .unwrap();

    (
        Fixture {
            tmp,
            origin,
            branch,
        },
        a,
    )
}

fn clone(fx: &Fixture, name: &str) -> PathBuf {
    let path = fx.tmp.path().join(name);
    Repository::clone(fx.origin.to_str().unwrap(), &path).unwrap();
    path
}

#[derive(Default)]
struct RecordingSink(RefCell<Vec<SyncPhase>>);

impl ProgressSink for RecordingSink {
    fn report(&self, phase: SyncPhase, _progress: Option<&Progress>) {
        self.0.borrow_mut().push(phase);
    }
}

struct Unreachable;

#[async_trait]
impl Connectivity for Unreachable {
    async fn check(&self, remote_url: &str) -> Result<(), SyncError> {
        Err(SyncError::Offline {
            target: remote_url.to_string(),
            detail: "no route to host".into(),
        })
    }
}

// ===========================================================================
// Sync
// ===========================================================================

#[tokio::test]
async fn test_first_publish_then_idempotent_noop() {
    let (fx, a) = published().await;
    let published_head = head(&a);
    assert_eq!(origin_head(&fx), published_head);

    for _ in 0..2 {
        let report = sync(&a).await;
        assert_eq!(report.outcome, SyncOutcome::AlreadyInSync);
        assert!(!report.had_conflicts);
        assert!(report.committed.is_none());
        assert_eq!(head(&a), published_head);
    }
    assert!(!engine().lock_for(&a).is_sync_locked());
}

#[tokio::test]
async fn test_phases_reported_in_order() {
    let (_fx, a) = published().await;
    write(&a, "notes.txt", "n\n");

    let sink = RecordingSink::default();
    engine()
        .sync_changes(&a, &creds(), &author(), &sink)
        .await
        .unwrap();

    let phases = sink.0.into_inner();
    let position = |phase: SyncPhase| phases.iter().position(|p| *p == phase).unwrap();
    assert!(position(SyncPhase::LockAcquired) < position(SyncPhase::Committing));
    assert!(position(SyncPhase::Committing) < position(SyncPhase::Fetching));
    assert!(position(SyncPhase::Fetching) < position(SyncPhase::FastForwardAttempt));
    assert!(position(SyncPhase::FastForwardAttempt) < position(SyncPhase::Pushing));
    assert_eq!(phases.last(), Some(&SyncPhase::LockReleased));
}

#[tokio::test]
async fn test_fast_forward_both_directions() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "docs/guide.md", "guide\n");
    let report = sync(&b).await;
    assert_eq!(report.outcome, SyncOutcome::FastForwarded);
    assert!(report.committed.is_some());
    assert_eq!(origin_head(&fx), head(&b));

    let report = sync(&a).await;
    assert_eq!(report.outcome, SyncOutcome::FastForwarded);
    assert!(report.committed.is_none());
    assert_eq!(head(&a), head(&b));
    assert_eq!(read(&a, "docs/guide.md"), "guide\n");
}

#[tokio::test]
async fn test_both_modify_same_file_reports_conflict() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "a.txt", "line1\nremote\nline3\n");
    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);
    let remote_head = origin_head(&fx);

    write(&a, "a.txt", "line1\nlocal\nline3\n");
    let report = sync(&a).await;
    assert_eq!(report.outcome, SyncOutcome::ConflictsReported);
    assert!(report.had_conflicts);
    assert!(report.committed.is_some());

    let conflicts = report.conflicts.unwrap();
    assert_eq!(conflicts.len(), 1);
    let c = &conflicts[0];
    assert_eq!(c.path, "a.txt");
    assert_eq!(c.classification, ChangeClass::ModifiedPotentialConflict);
    assert_eq!(c.ours_content, "line1\nlocal\nline3\n");
    assert_eq!(c.theirs_content, "line1\nremote\nline3\n");
    assert_eq!(c.base_content, "line1\nline2\nline3\n");
    assert!(!c.is_new);
    assert!(!c.is_deleted);

    // Nothing was pushed and the lock is gone.
    assert_eq!(origin_head(&fx), remote_head);
    assert!(!engine().lock_for(&a).is_sync_locked());

    // The list can be rebuilt later without fetching.
    let pending = engine().pending_conflicts(&a).unwrap();
    assert_eq!(pending, conflicts);
}

#[tokio::test]
async fn test_disjoint_additions_then_merge_completion() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "y.txt", "from b\n");
    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);

    write(&a, "x.txt", "from a\n");
    let report = sync(&a).await;
    assert_eq!(report.outcome, SyncOutcome::DivergedWithoutConflicts);
    assert!(!report.had_conflicts);
    assert!(report.conflicts.is_none());
    assert!(engine().pending_conflicts(&a).unwrap().is_empty());

    let merge = MergeCompletion::new(ProjsyncConfig::default())
        .complete_merge(&a, &creds(), &author(), &[])
        .await
        .unwrap();
    assert!(merge.is_merge_commit);
    assert!(merge.pushed);
    assert_eq!(merge.absorbed_paths, 1);
    assert_eq!(read(&a, "y.txt"), "from b\n");
    assert_eq!(origin_head(&fx).to_string(), merge.commit);

    let report = sync(&b).await;
    assert_eq!(report.outcome, SyncOutcome::FastForwarded);
    assert_eq!(read(&b, "x.txt"), "from a\n");
    assert_eq!(read(&b, "y.txt"), "from b\n");
}

#[tokio::test]
async fn test_one_sided_edit_on_diverged_history_is_reported() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "y.txt", "from b\n");
    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);

    write(&a, "a.txt", "line1\nlocal\nline3\n");
    let report = sync(&a).await;
    assert_eq!(report.outcome, SyncOutcome::ConflictsReported);

    // Changed only locally, yet present on all sides with differing content,
    // so it is surfaced for a decision rather than merged silently.
    let conflicts = report.conflicts.unwrap();
    assert_eq!(conflicts.len(), 1);
    let c = &conflicts[0];
    assert_eq!(c.path, "a.txt");
    assert_eq!(c.classification, ChangeClass::ModifiedPotentialConflict);
    assert_eq!(c.ours_content, "line1\nlocal\nline3\n");
    assert_eq!(c.theirs_content, c.base_content);

    // The remote-only addition is never reported.
    assert!(conflicts.iter().all(|c| c.path != "y.txt"));

    let resolved = ConflictResolver::apply(&a, c, &ResolutionChoice::Ours).unwrap();
    let merge = MergeCompletion::new(ProjsyncConfig::default())
        .complete_merge(&a, &creds(), &author(), &[resolved])
        .await
        .unwrap();
    assert!(merge.is_merge_commit);
    assert_eq!(read(&a, "a.txt"), "line1\nlocal\nline3\n");
    assert_eq!(read(&a, "y.txt"), "from b\n");
}

#[tokio::test]
async fn test_local_delete_with_unchanged_remote_is_not_a_conflict() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "other.txt", "o\n");
    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);

    std::fs::remove_file(a.join("README.md")).unwrap();
    let report = sync(&a).await;
    assert_eq!(report.outcome, SyncOutcome::DivergedWithoutConflicts);
    assert!(!report.had_conflicts);

    // The deletion was committed locally.
    let client = GitClient::new(&a).unwrap();
    assert!(client.read_blob(client.head_oid().unwrap(), "README.md").is_err());
}

#[tokio::test]
async fn test_offline_keeps_local_commit() {
    let (fx, a) = published().await;
    let before = head(&a);
    write(&a, "offline.txt", "written offline\n");

    let engine = SyncEngine::new(ProjsyncConfig::default(), Arc::new(Unreachable));
    let err = engine
        .sync_changes(&a, &creds(), &author(), &NoopProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Offline { .. }));

    assert_ne!(head(&a), before);
    assert_eq!(origin_head(&fx), before);
    assert!(!engine.lock_for(&a).is_sync_locked());

    // Back online, the retained commit is published.
    assert_eq!(sync(&a).await.outcome, SyncOutcome::FastForwarded);
    assert_eq!(origin_head(&fx), head(&a));
}

// ===========================================================================
// Merge completion
// ===========================================================================

#[tokio::test]
async fn test_complete_merge_refused_while_locked() {
    let (_fx, a) = published().await;
    write(&a, "a.txt", "edited but not committed\n");
    let before = head(&a);

    let holder = engine().lock_for(&a);
    assert!(holder.acquire_sync_lock().unwrap());

    let err = MergeCompletion::new(ProjsyncConfig::default())
        .complete_merge(
            &a,
            &creds(),
            &author(),
            &[ResolvedFile::new("a.txt", ResolutionKind::Modified)],
        )
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("sync in progress"));

    assert_eq!(head(&a), before);
    assert_eq!(read(&a, "a.txt"), "edited but not committed\n");
    let client = GitClient::new(&a).unwrap();
    let state = projsync_core::get_working_copy_state(&client).unwrap();
    assert!(state.is_dirty);
    assert!(holder.is_sync_locked());
}

#[tokio::test]
async fn test_resolve_and_complete_merge() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "a.txt", "line1\nremote\nline3\n");
    write(&b, "b-only.txt", "b\n");
    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);
    let remote_head = origin_head(&fx);

    write(&a, "a.txt", "line1\nlocal\nline3\n");
    let report = sync(&a).await;
    let conflicts = report.conflicts.unwrap();
    let local_head = head(&a);

    let conflict = ConflictResolver::find(&conflicts, "a.txt").unwrap();
    let resolved = ConflictResolver::apply(
        &a,
        conflict,
        &ResolutionChoice::Merged("line1\nlocal+remote\nline3\n".into()),
    )
    .unwrap();
    assert_eq!(resolved.resolution, ResolutionKind::Modified);

    let merge = MergeCompletion::new(ProjsyncConfig::default())
        .complete_merge(&a, &creds(), &author(), &[resolved])
        .await
        .unwrap();
    assert!(merge.is_merge_commit);
    assert!(merge.pushed);
    assert_eq!(merge.absorbed_paths, 1);

    let repo = Repository::open(&a).unwrap();
    let commit = repo.find_commit(head(&a)).unwrap();
    let parents: Vec<Oid> = commit.parent_ids().collect();
    assert_eq!(parents, vec![local_head, remote_head]);
    assert_eq!(origin_head(&fx), commit.id());
    assert!(!engine().lock_for(&a).is_sync_locked());

    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);
    assert_eq!(read(&b, "a.txt"), "line1\nlocal+remote\nline3\n");
    assert_eq!(read(&a, "b-only.txt"), "b\n");

    assert!(engine().pending_conflicts(&a).unwrap().is_empty());
}

#[tokio::test]
async fn test_resolution_for_missing_file_is_rejected() {
    let (_fx, a) = published().await;
    let err = MergeCompletion::new(ProjsyncConfig::default())
        .complete_merge(
            &a,
            &creds(),
            &author(),
            &[ResolvedFile::new("nowhere.txt", ResolutionKind::Created)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidResolution { .. }));
    assert!(!engine().lock_for(&a).is_sync_locked());
}

#[tokio::test]
async fn test_rejected_resolution_leaves_diverged_workspace_untouched() {
    let (fx, a) = published().await;
    let b = clone(&fx, "b");

    write(&b, "y.txt", "from b\n");
    assert_eq!(sync(&b).await.outcome, SyncOutcome::FastForwarded);
    write(&a, "x.txt", "from a\n");
    assert_eq!(sync(&a).await.outcome, SyncOutcome::DivergedWithoutConflicts);
    let local_head = head(&a);

    let completion = MergeCompletion::new(ProjsyncConfig::default());
    for bad in [
        ResolvedFile::new("nowhere.txt", ResolutionKind::Created),
        ResolvedFile::new("x.txt", ResolutionKind::Deleted),
    ] {
        let err = completion
            .complete_merge(&a, &creds(), &author(), &[bad])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResolution { .. }));
    }

    // No remote content leaked into the working copy or index.
    assert!(!a.join("y.txt").exists());
    let client = GitClient::new(&a).unwrap();
    assert!(!get_working_copy_state(&client).unwrap().is_dirty);
    assert_eq!(head(&a), local_head);
    drop(client);

    // The next sync has nothing local to commit.
    let report = sync(&a).await;
    assert!(report.committed.is_none());
    assert_eq!(head(&a), local_head);
}
