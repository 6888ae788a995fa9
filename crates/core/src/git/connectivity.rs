//! Reachability checks run before a sync touches the network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Url;
use tracing::{debug, info, instrument, warn};

use crate::errors::{ConfigError, SyncError};

/// Decides whether the remote is reachable before fetching.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// `Ok(())` when both the Git host behind `remote_url` and any backing API
    /// answer; [`SyncError::Offline`] otherwise.
    async fn check(&self, remote_url: &str) -> Result<(), SyncError>;
}

/// Skips probing entirely. Used when connectivity checks are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeOnline;

#[async_trait]
impl Connectivity for AssumeOnline {
    async fn check(&self, _remote_url: &str) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Probes over HTTP. Any HTTP response, whatever its status, counts as
/// reachable; only transport failures mean offline.
#[derive(Clone)]
pub struct HttpProbe {
    http: reqwest::Client,
    api_url: Option<String>,
}

impl HttpProbe {
    pub fn new(api_url: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("projsync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "connectivity".into(),
                detail: format!("cannot build HTTP client: {e}"),
            })?;
        let api_url = api_url.map(|u| u.trim_end_matches('/').to_string());
        info!(api_url = ?api_url, timeout_secs = timeout.as_secs(), "created HttpProbe");
        Ok(Self { http, api_url })
    }

    /// Scheme and authority of an HTTP(S) remote; `None` for anything else.
    fn host_root(remote_url: &str) -> Option<String> {
        let url = Url::parse(remote_url).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
            None => format!("{}://{}/", url.scheme(), host),
        })
    }

    async fn probe(&self, target: &str) -> Result<(), SyncError> {
        match self.http.head(target).send().await {
            Ok(resp) => {
                debug!(target, status = %resp.status(), "reachable");
                Ok(())
            }
            Err(e) => {
                warn!(target, error = %e, "unreachable");
                Err(SyncError::Offline {
                    target: target.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Connectivity for HttpProbe {
    #[instrument(skip(self))]
    async fn check(&self, remote_url: &str) -> Result<(), SyncError> {
        match Self::host_root(remote_url) {
            Some(root) => self.probe(&root).await?,
            None => debug!("remote is not HTTP; skipping host probe"),
        }
        if let Some(api) = &self.api_url {
            self.probe(api).await?;
        }
        Ok(())
    }
}
