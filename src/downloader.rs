use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DownloadOptions;
use crate::error::DownloadResult;
use crate::progress::ProgressCallback;
use crate::session::{Session, SessionMap};
use crate::utils::absolute_path;

/// Entry point and session registry.
///
/// At most one session per destination is live in a registry; callers that
/// ask for a destination already in flight join that session. Registries are
/// independent of each other.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    sessions: SessionMap,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("blobdl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client)
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Download `url` to `destination`, resuming and sharing work where possible.
    ///
    /// Options are validated before any I/O. A caller that joins a session
    /// already running for `destination` shares its configuration and outcome;
    /// its callback is added to the session's subscribers and its token can
    /// cancel the shared session.
    pub async fn download_file(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
        options: Option<DownloadOptions>,
        on_progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
    ) -> DownloadResult<()> {
        let config = options.unwrap_or_default().normalize()?;
        let destination = absolute_path(destination.as_ref());

        let (session, is_new) = self.attach(&destination, || {
            Session::start(url, &destination, config, self.client.clone(), self.sessions.clone())
        });
        if !is_new {
            debug!(
                destination = %destination.display(),
                url = session.url(),
                "joining download in progress"
            );
        }
        if let Some(callback) = on_progress {
            session.subscribe(callback);
        }
        if let Some(token) = cancel {
            session.link_cancel(token);
        }

        session.completion().await
    }

    /// Existing session for `destination`, or a new one from `start`.
    fn attach(
        &self,
        destination: &Path,
        start: impl FnOnce() -> Arc<Session>,
    ) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(destination) {
            return (existing.clone(), false);
        }
        let session = start();
        sessions.insert(destination.to_path_buf(), session.clone());
        (session, true)
    }

    /// Destinations with a session in flight.
    pub fn active_sessions(&self) -> Vec<PathBuf> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.values().map(|s| s.destination().to_path_buf()).collect()
    }
}
