//! Persisted sync lock with heartbeat-based staleness detection.
//!
//! The lock is a JSON file inside the workspace's `.git` directory. It is the
//! only mutual-exclusion mechanism between sync attempts, so it works across
//! processes and survives restarts. A holder that crashes leaves the file
//! behind; once its heartbeat is older than the staleness window the next
//! attempt takes it over.
//!
//! Every write goes through a temporary file in the same directory: creation
//! is published with a no-clobber link, heartbeats with an atomic rename, so a
//! reader never observes a half-written record.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::LockError;
use crate::models::{Progress, SyncPhase};

/// Default lock file name.
pub const DEFAULT_LOCK_FILE: &str = "projsync.lock";

/// Default staleness window: a heartbeat older than this marks the lock abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Record & status
// ---------------------------------------------------------------------------

/// The JSON document stored in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// When the lock was acquired.
    pub timestamp: DateTime<Utc>,
    /// Last heartbeat.
    pub last_progress: DateTime<Utc>,
    pub phase: SyncPhase,
    pub phase_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Opaque id of the [`SyncLock`] that created the record.
    #[serde(default)]
    pub holder: String,
}

impl LockRecord {
    fn fresh(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now,
            last_progress: now,
            phase: SyncPhase::LockAcquired,
            phase_changed_at: now,
            progress: None,
            holder: holder.to_string(),
        }
    }

    /// Whether the heartbeat is older than `stale_after` at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let window = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_progress) > window
    }
}

/// Coarse state of the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Active,
    Stale,
    Absent,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stale => write!(f, "stale"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// Read-only snapshot returned by [`SyncLock::check_filesystem_lock`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatus {
    pub state: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SyncPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_changed_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    fn absent() -> Self {
        Self {
            state: LockState::Absent,
            phase: None,
            progress: None,
            acquired_at: None,
            last_heartbeat: None,
            phase_changed_at: None,
        }
    }
}

/// What was found on disk when reading the lock file.
enum OnDisk {
    Missing,
    Corrupt,
    Record(LockRecord),
}

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

/// Lock manager for one workspace.
///
/// Each instance carries its own holder id; two instances for the same
/// workspace exclude each other exactly like two processes would.
#[derive(Debug, Clone)]
pub struct SyncLock {
    path: PathBuf,
    stale_after: Duration,
    holder: String,
}

impl SyncLock {
    /// Lock manager with the default file name and staleness window.
    pub fn new(workspace: &Path) -> Self {
        Self::with_settings(workspace, DEFAULT_LOCK_FILE, DEFAULT_STALE_AFTER)
    }

    pub fn with_settings(workspace: &Path, file_name: &str, stale_after: Duration) -> Self {
        Self {
            path: Self::lock_path_for(workspace, file_name),
            stale_after,
            holder: Uuid::new_v4().to_string(),
        }
    }

    /// The lock lives in `.git/` so it is never committed; a workspace
    /// without one keeps a hidden file at its root.
    pub fn lock_path_for(workspace: &Path, file_name: &str) -> PathBuf {
        let git_dir = workspace.join(".git");
        if git_dir.is_dir() {
            git_dir.join(file_name)
        } else {
            workspace.join(format!(".{}", file_name))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// True iff a non-stale lock record exists.
    pub fn is_sync_locked(&self) -> bool {
        match self.read() {
            Ok(OnDisk::Record(record)) => !record.is_stale_at(Utc::now(), self.stale_after),
            _ => false,
        }
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(false)` when another holder has a live lock. A stale or
    /// unreadable record is taken over.
    pub fn acquire_sync_lock(&self) -> Result<bool, LockError> {
        if self.publish_fresh()? {
            info!(path = %self.path.display(), "sync lock acquired");
            return Ok(true);
        }

        match self.read()? {
            OnDisk::Missing => {
                // Released between our attempt and the read.
                let acquired = self.publish_fresh()?;
                if acquired {
                    info!(path = %self.path.display(), "sync lock acquired");
                }
                Ok(acquired)
            }
            OnDisk::Record(record) if record.holder == self.holder => {
                debug!("sync lock already held by this manager");
                Ok(true)
            }
            OnDisk::Record(record) if !record.is_stale_at(Utc::now(), self.stale_after) => {
                debug!(
                    phase = %record.phase,
                    last_heartbeat = %record.last_progress,
                    "sync lock held by another attempt"
                );
                Ok(false)
            }
            OnDisk::Record(record) => {
                warn!(
                    last_heartbeat = %record.last_progress,
                    phase = %record.phase,
                    "sync lock is stale, taking over"
                );
                self.take_over()
            }
            OnDisk::Corrupt => {
                warn!(path = %self.path.display(), "sync lock file is unreadable, taking over");
                self.take_over()
            }
        }
    }

    /// Acquire the lock and return a guard that releases it on drop.
    pub fn try_guard(&self) -> Result<Option<SyncLockGuard<'_>>, LockError> {
        if self.acquire_sync_lock()? {
            Ok(Some(SyncLockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }

    /// Refresh the heartbeat and merge phase/progress into the record.
    ///
    /// A phase change stamps `phaseChangedAt` and, when no progress is given,
    /// clears the previous phase's counters.
    pub fn update_lock_heartbeat(
        &self,
        phase: SyncPhase,
        progress: Option<Progress>,
    ) -> Result<(), LockError> {
        let mut record = match self.read()? {
            OnDisk::Record(record) if record.holder == self.holder => record,
            _ => return Err(LockError::NotHeld(self.path.display().to_string())),
        };

        let now = Utc::now();
        record.last_progress = now;
        if record.phase != phase {
            record.phase = phase;
            record.phase_changed_at = now;
            record.progress = progress;
        } else if progress.is_some() {
            record.progress = progress;
        }

        let tmp = self.write_temp(&record)?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }

    /// Read-only inspection of the lock file.
    pub fn check_filesystem_lock(&self) -> LockStatus {
        match self.read() {
            Ok(OnDisk::Record(record)) => {
                let state = if record.is_stale_at(Utc::now(), self.stale_after) {
                    LockState::Stale
                } else {
                    LockState::Active
                };
                LockStatus {
                    state,
                    phase: Some(record.phase),
                    progress: record.progress,
                    acquired_at: Some(record.timestamp),
                    last_heartbeat: Some(record.last_progress),
                    phase_changed_at: Some(record.phase_changed_at),
                }
            }
            Ok(OnDisk::Corrupt) => LockStatus {
                state: LockState::Stale,
                ..LockStatus::absent()
            },
            Ok(OnDisk::Missing) | Err(_) => LockStatus::absent(),
        }
    }

    /// Release the lock. Idempotent; a record held by someone else is left alone.
    pub fn release_sync_lock(&self) -> Result<(), LockError> {
        match self.read()? {
            OnDisk::Missing => Ok(()),
            OnDisk::Record(record) if record.holder != self.holder => {
                warn!(
                    path = %self.path.display(),
                    "sync lock was taken over by another attempt, leaving it in place"
                );
                Ok(())
            }
            _ => {
                self.remove_file()?;
                info!(path = %self.path.display(), "sync lock released");
                Ok(())
            }
        }
    }

    /// Remove the lock file whoever holds it. Returns whether a file existed.
    pub fn force_release(&self) -> Result<bool, LockError> {
        let existed = self.path.exists();
        self.remove_file()?;
        if existed {
            warn!(path = %self.path.display(), "sync lock forcibly removed");
        }
        Ok(existed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn read(&self) -> Result<OnDisk, LockError> {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<LockRecord>(&bytes) {
                Ok(record) => Ok(OnDisk::Record(record)),
                Err(e) => {
                    debug!(error = %e, "failed to parse sync lock record");
                    Ok(OnDisk::Corrupt)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(OnDisk::Missing),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Publish a new record unless a lock file already exists.
    fn publish_fresh(&self) -> Result<bool, LockError> {
        let tmp = self.write_temp(&LockRecord::fresh(&self.holder))?;
        match tmp.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.io_err(e.error)),
        }
    }

    /// Move a stale record aside and publish ours.
    ///
    /// If the record moved aside turns out to be live (another attempt took
    /// over or refreshed it in the meantime) it is linked back and we lose.
    fn take_over(&self) -> Result<bool, LockError> {
        let aside = self
            .path
            .with_extension(format!("stale-{}", Uuid::new_v4().simple()));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return self.publish_fresh(),
            Err(e) => return Err(self.io_err(e)),
        }

        let moved = fs::read(&aside)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok());
        if let Some(record) = moved {
            if !record.is_stale_at(Utc::now(), self.stale_after) {
                debug!("lock was refreshed during takeover, restoring it");
                self.restore_aside(&aside);
                return Ok(false);
            }
        }
        let _ = fs::remove_file(&aside);

        let acquired = self.publish_fresh()?;
        if acquired {
            info!(path = %self.path.display(), "stale sync lock taken over");
        }
        Ok(acquired)
    }

    /// Link a live record moved aside back into place. Returns false when
    /// the slot was claimed in the meantime; that holder keeps the lock and
    /// the record moved aside is dropped.
    fn restore_aside(&self, aside: &Path) -> bool {
        let restored = match fs::hard_link(aside, &self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(
                    path = %self.path.display(),
                    "lock claimed while restoring a live record; previous holder lost it"
                );
                false
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to restore live sync lock");
                false
            }
        };
        if let Err(e) = fs::remove_file(aside) {
            debug!(path = %aside.display(), error = %e, "failed to remove set-aside lock record");
        }
        restored
    }

    fn write_temp(&self, record: &LockRecord) -> Result<NamedTempFile, LockError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        let json = serde_json::to_vec_pretty(record)?;
        tmp.write_all(&json).map_err(|e| self.io_err(e))?;
        tmp.flush().map_err(|e| self.io_err(e))?;
        Ok(tmp)
    }

    fn remove_file(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// RAII guard
// ---------------------------------------------------------------------------

/// Releases the sync lock when dropped, including on early return and panic.
#[derive(Debug)]
pub struct SyncLockGuard<'a> {
    lock: &'a SyncLock,
}

impl SyncLockGuard<'_> {
    /// Heartbeat through the guarded lock. Failures are logged, never fatal.
    pub fn heartbeat(&self, phase: SyncPhase, progress: Option<Progress>) {
        match self.lock.update_lock_heartbeat(phase, progress) {
            Ok(()) => {}
            Err(e @ LockError::NotHeld(_)) => {
                error!(error = %e, %phase, "sync lock lost to another attempt");
            }
            Err(e) => warn!(error = %e, %phase, "failed to update sync lock heartbeat"),
        }
    }

    pub fn lock(&self) -> &SyncLock {
        self.lock
    }
}

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release_sync_lock() {
            warn!(error = %e, "failed to release sync lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        dir
    }

    fn write_record(lock: &SyncLock, record: &LockRecord) {
        fs::write(lock.path(), serde_json::to_vec(record).unwrap()).unwrap();
    }

    fn abandoned_record(age: chrono::Duration) -> LockRecord {
        let then = Utc::now() - age;
        LockRecord {
            timestamp: then,
            last_progress: then,
            phase: SyncPhase::Fetching,
            phase_changed_at: then,
            progress: Some(Progress::new(3, 10, "receiving objects")),
            holder: "crashed-process".into(),
        }
    }

    #[test]
    fn test_restore_aside_into_free_slot() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        let aside = lock.path().with_extension("stale-test");
        fs::write(&aside, serde_json::to_vec(&LockRecord::fresh("original")).unwrap()).unwrap();

        assert!(lock.restore_aside(&aside));
        assert!(!aside.exists());
        let record: LockRecord = serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_eq!(record.holder, "original");
    }

    #[test]
    fn test_restore_aside_when_slot_was_claimed() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        let aside = lock.path().with_extension("stale-test");
        fs::write(&aside, serde_json::to_vec(&LockRecord::fresh("original")).unwrap()).unwrap();

        let newcomer = SyncLock::new(dir.path());
        assert!(newcomer.acquire_sync_lock().unwrap());

        assert!(!lock.restore_aside(&aside));
        assert!(!aside.exists());
        let record: LockRecord = serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_eq!(record.holder, newcomer.holder());
    }

    #[test]
    fn test_lock_path_prefers_git_dir() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        assert_eq!(lock.path(), dir.path().join(".git").join(DEFAULT_LOCK_FILE));

        let bare = tempfile::tempdir().unwrap();
        let lock = SyncLock::new(bare.path());
        assert_eq!(lock.path(), bare.path().join(".projsync.lock"));
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());

        assert!(!lock.is_sync_locked());
        assert!(lock.acquire_sync_lock().unwrap());
        assert!(lock.is_sync_locked());
        assert_eq!(lock.check_filesystem_lock().state, LockState::Active);

        lock.release_sync_lock().unwrap();
        assert!(!lock.is_sync_locked());
        assert_eq!(lock.check_filesystem_lock().state, LockState::Absent);

        // Idempotent.
        lock.release_sync_lock().unwrap();
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = workspace();
        let first = SyncLock::new(dir.path());
        let second = SyncLock::new(dir.path());

        assert!(first.acquire_sync_lock().unwrap());
        assert!(!second.acquire_sync_lock().unwrap());

        // Releasing through a non-holder leaves the live lock alone.
        second.release_sync_lock().unwrap();
        assert!(first.is_sync_locked());

        first.release_sync_lock().unwrap();
        assert!(second.acquire_sync_lock().unwrap());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let dir = workspace();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = barrier.clone();
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let lock = SyncLock::new(&path);
                    barrier.wait();
                    lock.acquire_sync_lock().unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = workspace();
        let lock = SyncLock::with_settings(dir.path(), DEFAULT_LOCK_FILE, Duration::from_secs(60));
        write_record(&lock, &abandoned_record(chrono::Duration::minutes(5)));

        assert!(!lock.is_sync_locked());
        assert_eq!(lock.check_filesystem_lock().state, LockState::Stale);

        assert!(lock.acquire_sync_lock().unwrap());
        let status = lock.check_filesystem_lock();
        assert_eq!(status.state, LockState::Active);
        assert_eq!(status.phase, Some(SyncPhase::LockAcquired));
        assert!(status.progress.is_none());

        // No stray takeover files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path().join(".git"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("stale-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_recent_foreign_lock_is_respected() {
        let dir = workspace();
        let lock = SyncLock::with_settings(dir.path(), DEFAULT_LOCK_FILE, Duration::from_secs(60));
        write_record(&lock, &abandoned_record(chrono::Duration::seconds(5)));

        assert!(lock.is_sync_locked());
        assert!(!lock.acquire_sync_lock().unwrap());
    }

    #[test]
    fn test_corrupt_lock_is_taken_over() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        fs::write(lock.path(), b"{ not json").unwrap();

        assert!(!lock.is_sync_locked());
        assert!(lock.acquire_sync_lock().unwrap());
        assert!(lock.is_sync_locked());
    }

    #[test]
    fn test_heartbeat_stamps_phase_change() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        assert!(lock.acquire_sync_lock().unwrap());
        let initial = lock.check_filesystem_lock();

        lock.update_lock_heartbeat(SyncPhase::Committing, Some(Progress::new(1, 4, "a.txt")))
            .unwrap();
        let committing = lock.check_filesystem_lock();
        assert_eq!(committing.phase, Some(SyncPhase::Committing));
        assert_eq!(committing.progress, Some(Progress::new(1, 4, "a.txt")));
        assert!(committing.phase_changed_at >= initial.phase_changed_at);

        // Same phase: phase_changed_at is kept, progress replaced.
        lock.update_lock_heartbeat(SyncPhase::Committing, Some(Progress::new(2, 4, "b.txt")))
            .unwrap();
        let later = lock.check_filesystem_lock();
        assert_eq!(later.phase_changed_at, committing.phase_changed_at);
        assert_eq!(later.progress.unwrap().current, 2);
        assert!(later.last_heartbeat >= committing.last_heartbeat);

        // New phase without progress clears the old counters.
        lock.update_lock_heartbeat(SyncPhase::Fetching, None).unwrap();
        let fetching = lock.check_filesystem_lock();
        assert_eq!(fetching.phase, Some(SyncPhase::Fetching));
        assert!(fetching.progress.is_none());
    }

    #[test]
    fn test_heartbeat_requires_ownership() {
        let dir = workspace();
        let owner = SyncLock::new(dir.path());
        let other = SyncLock::new(dir.path());
        assert!(owner.acquire_sync_lock().unwrap());

        let err = other
            .update_lock_heartbeat(SyncPhase::Fetching, None)
            .unwrap_err();
        assert!(matches!(err, LockError::NotHeld(_)));
    }

    #[test]
    fn test_lock_file_layout() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        assert!(lock.acquire_sync_lock().unwrap());
        lock.update_lock_heartbeat(SyncPhase::Pushing, Some(Progress::new(5, 9, "sending")))
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        for key in ["timestamp", "lastProgress", "phase", "phaseChangedAt", "progress"] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["phase"], "pushing");
        assert_eq!(json["progress"]["current"], 5);
        assert_eq!(json["progress"]["total"], 9);
        assert_eq!(json["progress"]["description"], "sending");
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = workspace();
        let lock = SyncLock::new(dir.path());
        {
            let guard = lock.try_guard().unwrap().expect("lock should be free");
            guard.heartbeat(SyncPhase::Reconciling, None);
            assert!(lock.is_sync_locked());

            let rival = SyncLock::new(dir.path());
            assert!(rival.try_guard().unwrap().is_none());
        }
        assert!(!lock.is_sync_locked());
    }

    #[test]
    fn test_force_release_removes_foreign_lock() {
        let dir = workspace();
        let owner = SyncLock::new(dir.path());
        assert!(owner.acquire_sync_lock().unwrap());

        let admin = SyncLock::new(dir.path());
        assert!(admin.force_release().unwrap());
        assert!(!owner.is_sync_locked());
        assert!(!admin.force_release().unwrap());
    }
}
