//! projsync core library.
//!
//! This crate provides the components for keeping a local project working
//! copy in step with a shared Git remote: the persisted sync lock,
//! working-copy status analysis, three-way reconciliation, the sync
//! orchestrator and merge completion.

pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod lock;
pub mod merge;
pub mod models;
pub mod status;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::ProjsyncConfig;
pub use conflict::{ChangeClass, ConflictedFile};
pub use errors::CoreError;
pub use git::{GitClient, RepositoryAccessor};
pub use lock::{LockStatus, SyncLock};
pub use merge::MergeCompletion;
pub use models::{Author, Credentials, ProgressSink, SyncOutcome, SyncPhase, SyncReport};
pub use status::{get_working_copy_state, WorkingCopyState};
pub use sync_engine::SyncEngine;
