//! Configuration for projsync.
//!
//! Loaded from a TOML file. Secrets are never stored in the file: the
//! `[credentials]` section names an environment variable that is resolved at
//! runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::lock::{DEFAULT_LOCK_FILE, DEFAULT_STALE_AFTER};
use crate::models::{Author, Credentials};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjsyncConfig {
    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub lock: LockSection,

    #[serde(default)]
    pub connectivity: ConnectivitySection,

    #[serde(default)]
    pub credentials: CredentialsSection,

    #[serde(default)]
    pub author: AuthorSection,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Remote, branch and commit message settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch to sync. Defaults to the branch HEAD points at.
    #[serde(default)]
    pub branch: Option<String>,

    /// Message of the commit that captures local changes before a sync.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Message of the commit created by merge completion.
    #[serde(default = "default_merge_message")]
    pub merge_message: String,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_remote() -> String {
    "origin".into()
}

fn default_commit_message() -> String {
    "Sync local changes".into()
}

fn default_merge_message() -> String {
    "Merge remote changes".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: None,
            commit_message: default_commit_message(),
            merge_message: default_merge_message(),
            log_level: default_log_level(),
        }
    }
}

/// Persisted sync lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_lock_file")]
    pub file_name: String,

    /// Seconds without a heartbeat after which a lock may be taken over.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_lock_file() -> String {
    DEFAULT_LOCK_FILE.into()
}

fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER.as_secs()
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            file_name: default_lock_file(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl LockSection {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Reachability probing before a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backing API that must answer in addition to the Git host.
    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ConnectivitySection {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: None,
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl ConnectivitySection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Basic-auth credentials for the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsSection {
    #[serde(default)]
    pub username: String,

    /// Environment variable holding the password or token.
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Resolved at runtime from `password_env`.
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_password_env() -> String {
    "PROJSYNC_PASSWORD".into()
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            username: String::new(),
            password_env: default_password_env(),
            password: None,
        }
    }
}

/// Identity stamped on sync and merge commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorSection {
    #[serde(default = "default_author_name")]
    pub name: String,

    #[serde(default = "default_author_email")]
    pub email: String,
}

fn default_author_name() -> String {
    "projsync".into()
}

fn default_author_email() -> String {
    "projsync@localhost".into()
}

impl Default for AuthorSection {
    fn default() -> Self {
        Self {
            name: default_author_name(),
            email: default_author_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl ProjsyncConfig {
    /// Load a [`ProjsyncConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: ProjsyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        self.credentials.password = resolve_optional_env(
            &self.credentials.password_env,
            "credentials.password_env",
        );
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.remote.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.remote".into(),
                detail: "remote name must not be empty".into(),
            });
        }
        if matches!(&self.sync.branch, Some(b) if b.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "sync.branch".into(),
                detail: "branch must not be empty when set".into(),
            });
        }
        if self.sync.commit_message.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.commit_message".into(),
                detail: "commit message must not be empty".into(),
            });
        }
        if self.sync.merge_message.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.merge_message".into(),
                detail: "merge message must not be empty".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.sync.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "sync.log_level".into(),
                detail: format!("must be one of {}", LOG_LEVELS.join(", ")),
            });
        }
        if self.lock.file_name.is_empty() || self.lock.file_name.contains(['/', '\\']) {
            return Err(ConfigError::InvalidValue {
                field: "lock.file_name".into(),
                detail: "lock file name must be a plain file name".into(),
            });
        }
        if self.lock.stale_after_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock.stale_after_secs".into(),
                detail: "stale-after window must be > 0".into(),
            });
        }
        if self.connectivity.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connectivity.timeout_secs".into(),
                detail: "probe timeout must be > 0".into(),
            });
        }
        if let Some(api) = &self.connectivity.api_url {
            if !(api.starts_with("http://") || api.starts_with("https://")) {
                return Err(ConfigError::InvalidValue {
                    field: "connectivity.api_url".into(),
                    detail: "API URL must start with http:// or https://".into(),
                });
            }
        }
        if self.author.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "author.name".into(),
                detail: "author name must not be empty".into(),
            });
        }
        if !self.author.email.contains('@') {
            return Err(ConfigError::InvalidValue {
                field: "author.email".into(),
                detail: "author email must contain '@'".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Credentials for fetch and push.
    ///
    /// Remotes that need no authentication can leave `username` empty.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        match (&self.credentials.password, self.credentials.username.is_empty()) {
            (Some(password), _) => Ok(Credentials::new(&self.credentials.username, password)),
            (None, true) => Ok(Credentials::new("", "")),
            (None, false) => Err(ConfigError::EnvVarMissing {
                var: self.credentials.password_env.clone(),
                field: "credentials.password_env".into(),
            }),
        }
    }

    pub fn author(&self) -> Author {
        Author::new(&self.author.name, &self.author.email)
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# projsync configuration

[sync]
remote = "origin"
# branch = "main"            # defaults to the checked-out branch
commit_message = "Sync local changes"
merge_message = "Merge remote changes"
log_level = "info"

[lock]
file_name = "projsync.lock"
stale_after_secs = 120

[connectivity]
enabled = true
# api_url = "https://api.example.com/"
timeout_secs = 10

[credentials]
username = "your_username"
password_env = "PROJSYNC_PASSWORD"

[author]
name = "Your Name"
email = "you@example.com"
"#
    }
}

/// Try to read an environment variable by name.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            debug!(field, env_name, "env var not set");
            None
        }
    }
}
