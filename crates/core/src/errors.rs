//! Error types for the projsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, remote-tracking ref, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A path does not exist in the tree of the given commit.
    #[error("blob '{path}' not found in commit {commit}")]
    BlobNotFound { commit: String, path: String },

    /// HEAD is detached or unborn, so there is no branch to sync.
    #[error("HEAD does not point at a branch")]
    DetachedHead,

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the persisted sync lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file could not be read, written or removed.
    #[error("sync lock I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The lock record could not be serialized.
    #[error("sync lock serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A heartbeat was written by a process that does not hold the lock.
    #[error("sync lock at '{0}' is not held by this process")]
    NotHeld(String),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the sync orchestrator and merge completion.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync attempt holds a live lock.
    #[error("sync in progress (phase '{phase}' since {since})")]
    AlreadyRunning { phase: String, since: String },

    /// The remote host or the backing API is unreachable.
    #[error("offline: {target} is unreachable ({detail})")]
    Offline { target: String, detail: String },

    /// A resolution was supplied for a path the working copy cannot stage.
    #[error("invalid resolution for '{path}': {detail}")]
    InvalidResolution { path: String, detail: String },

    /// Underlying Git error during sync.
    #[error("sync Git error: {0}")]
    GitError(#[from] GitError),

    /// Lock file failure during sync.
    #[error("sync lock error: {0}")]
    LockError(#[from] LockError),

    /// Configuration problem discovered at sync time.
    #[error("sync configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict preview / resolution helpers.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// No pending conflict exists for the path.
    #[error("no pending conflict for '{0}'")]
    NotFound(String),

    /// Writing the resolved content to the working directory failed.
    #[error("conflict I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = GitError::BlobNotFound {
            commit: "abc123".into(),
            path: "a.txt".into(),
        };
        assert_eq!(err.to_string(), "blob 'a.txt' not found in commit abc123");

        let err = SyncError::AlreadyRunning {
            phase: "fetching".into(),
            since: "2025-01-01T00:00:00Z".into(),
        };
        assert!(err.to_string().starts_with("sync in progress"));

        let err = ConfigError::EnvVarMissing {
            var: "PROJSYNC_PASSWORD".into(),
            field: "credentials.password_env".into(),
        };
        assert!(err.to_string().contains("PROJSYNC_PASSWORD"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let git_err = GitError::RefNotFound("refs/remotes/origin/main".into());
        let core_err: CoreError = git_err.into();
        assert!(matches!(core_err, CoreError::Git(_)));

        let sync_err: SyncError = GitError::DetachedHead.into();
        assert!(matches!(sync_err, SyncError::GitError(GitError::DetachedHead)));
        let core_err: CoreError = sync_err.into();
        assert!(matches!(core_err, CoreError::Sync(_)));
    }
}
