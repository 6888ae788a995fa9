//! Git operations for projsync.

pub mod accessor;
pub mod client;
pub mod connectivity;

pub use accessor::{RepositoryAccessor, TransferProgress};
pub use client::GitClient;
pub use connectivity::{AssumeOnline, Connectivity, HttpProbe};
