//! Conflict detection, merge previews, and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Reconciliation** -- classifying every path across local, remote and
//!    merge-base snapshots and reporting the ones that conflict.
//! 2. **Merging** -- line-based three-way merge previews for a resolution UI.
//! 3. **Resolution** -- writing the chosen content and describing it for
//!    merge completion.

pub mod merger;
pub mod reconcile;
pub mod resolver;

pub use merger::{MergeResult, Merger};
pub use reconcile::{
    classify, reconcile, ChangeClass, CommitSnapshots, ConflictedFile, PathRows, Side,
    SnapshotContent,
};
pub use resolver::{ConflictResolver, ResolutionChoice};
