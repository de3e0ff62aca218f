//! One download session per destination: probe, coordinate, schedule
//! workers, report progress and finalize.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blocks::BlockScheduler;
use crate::config::DownloadConfig;
use crate::coordinator::{self, Coordination, DestinationLock};
use crate::error::{DownloadError, DownloadResult};
use crate::hashing::{self, Checksum};
use crate::probe::{self, BlobInfo};
use crate::progress::{ProgressCallback, ProgressData, Subscribers, TransferCounters};
use crate::state::{ResumeIdentity, ResumeStore};
use crate::utils::temp_path;
use crate::worker::run_worker;

pub(crate) type SessionMap = Arc<StdMutex<HashMap<PathBuf, Arc<Session>>>>;
type Completion = Shared<BoxFuture<'static, DownloadResult<()>>>;

/// A live download for one destination, possibly shared by several callers.
pub struct Session {
    id: Uuid,
    url: String,
    destination: PathBuf,
    cancel: CancellationToken,
    finished: CancellationToken,
    subscribers: Subscribers,
    completion: Completion,
}

impl Session {
    /// Spawn the session driver. The session removes itself from `sessions` when it settles.
    pub(crate) fn start(
        url: &str,
        destination: &Path,
        config: DownloadConfig,
        client: Client,
        sessions: SessionMap,
    ) -> Arc<Session> {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let subscribers = Subscribers::default();

        let guard = Deregister {
            sessions,
            destination: destination.to_path_buf(),
            id,
        };
        let context = SessionContext {
            url: url.to_string(),
            destination: destination.to_path_buf(),
            config,
            client,
            cancel: cancel.clone(),
            subscribers: subscribers.clone(),
        };
        let done = finished.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            let result = context.run().await;
            match &result {
                Ok(()) => info!(
                    destination = %context.destination.display(),
                    elapsed = ?started.elapsed(),
                    "download finished"
                ),
                Err(e) => warn!(
                    destination = %context.destination.display(),
                    error = %e,
                    "download failed"
                ),
            }
            context.subscribers.close();
            done.cancel();
            result
        });

        let completion = handle
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(DownloadError::Io(format!("session task failed: {}", e)))
                })
            })
            .boxed()
            .shared();

        Arc::new(Session {
            id,
            url: url.to_string(),
            destination: destination.to_path_buf(),
            cancel,
            finished,
            subscribers,
            completion,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub(crate) fn subscribe(&self, callback: ProgressCallback) {
        self.subscribers.add(callback);
    }

    /// Cancel the whole session when `token` fires.
    pub(crate) fn link_cancel(&self, token: CancellationToken) {
        let cancel = self.cancel.clone();
        let finished = self.finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => cancel.cancel(),
                _ = finished.cancelled() => {}
            }
        });
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

/// Removes the session from the registry when the driver ends, however it ends.
struct Deregister {
    sessions: SessionMap,
    destination: PathBuf,
    id: Uuid,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.get(&self.destination).map(|s| s.id) == Some(self.id) {
            sessions.remove(&self.destination);
        }
    }
}

/// Mutable state shared by the workers of a session. Only touched under `Transfer::state`.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub scheduler: BlockScheduler,
    pub counters: TransferCounters,
    pub failed_blocks: u32,
    pub last_error: Option<String>,
    pub aborted: bool,
    last_reported: u64,
}

pub(crate) type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Byte limiter for `limit` bytes per second, paired with its burst size.
fn rate_limiter(limit: NonZeroU32) -> (Limiter, NonZeroU32) {
    (RateLimiter::direct(Quota::per_second(limit)), limit)
}

/// Everything a block worker needs, shared behind an `Arc`.
pub(crate) struct Transfer {
    pub url: String,
    pub client: Client,
    pub temp_path: PathBuf,
    pub blob_size: u64,
    pub cancel: CancellationToken,
    pub state: Mutex<SessionState>,
    pub limiter: Option<(Limiter, NonZeroU32)>,
    identity: ResumeIdentity,
    store: Mutex<ResumeStore>,
}

impl Transfer {
    /// Write the current block array to the resume file.
    ///
    /// The store lock serializes saves; it is always taken before the state lock.
    pub(crate) async fn persist(&self) {
        let mut store = self.store.lock().await;
        let (block_size, blocks) = {
            let state = self.state.lock().await;
            (state.scheduler.block_size(), state.scheduler.persistable_blocks())
        };
        if let Err(e) = store.save(&self.identity, block_size, &blocks).await {
            warn!(path = %store.path().display(), error = %e, "failed to save resume state");
        }
    }

    /// Emit a snapshot when bytes were transferred since the last one.
    async fn report(&self, subscribers: &Subscribers) {
        let snapshot = {
            let mut state = self.state.lock().await;
            let transferred = state.counters.bytes_transferred();
            if transferred == state.last_reported {
                return;
            }
            state.last_reported = transferred;
            ProgressData::new(
                self.blob_size,
                state.scheduler.bytes_done(),
                state.scheduler.counts(),
                state.counters.rates(Instant::now()),
            )
        };
        subscribers.emit(&snapshot);
    }
}

async fn report_progress(transfer: Arc<Transfer>, subscribers: Subscribers, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        transfer.report(&subscribers).await;
    }
}

struct SessionContext {
    url: String,
    destination: PathBuf,
    config: DownloadConfig,
    client: Client,
    cancel: CancellationToken,
    subscribers: Subscribers,
}

impl SessionContext {
    async fn run(&self) -> DownloadResult<()> {
        info!(url = %self.url, destination = %self.destination.display(), "starting download");
        let info = probe::probe(&self.client, &self.url).await?;

        let lock = match coordinator::coordinate(
            &self.destination,
            &self.config,
            &self.cancel,
            &self.subscribers,
        )
        .await?
        {
            Coordination::Owned(lock) => lock,
            Coordination::SatisfiedElsewhere => return Ok(()),
        };

        let result = self.download_locked(&info, &lock).await;
        lock.release();
        result
    }

    async fn download_locked(&self, info: &BlobInfo, lock: &DestinationLock) -> DownloadResult<()> {
        let identity = ResumeIdentity::new(
            &self.url,
            &self.destination,
            info.size,
            info.checksum.as_ref().map(Checksum::to_string).unwrap_or_default(),
        );
        let mut store = ResumeStore::new(&self.destination, self.config.enable_resumable_download);

        let resumed = if self.config.consult_resume_data() {
            store.load(&identity, true).await
        } else {
            None
        };

        let scheduler = match resumed {
            Some(state) => {
                let scheduler =
                    BlockScheduler::from_blocks(info.size, state.block_size, state.blocks);
                info!(
                    done = scheduler.counts().downloaded,
                    total = scheduler.blocks().len(),
                    "resuming download"
                );
                scheduler
            }
            None => {
                store.delete().await?;
                if self.final_file_matches(info).await? {
                    info!(
                        destination = %self.destination.display(),
                        "final file already present and verified"
                    );
                    if let Err(e) = fs::remove_file(lock.path()).await {
                        warn!(
                            path = %lock.path().display(),
                            error = %e,
                            "failed to remove temp file"
                        );
                    }
                    return Ok(());
                }
                BlockScheduler::new(info.size, self.config.block_size)
            }
        };

        lock.file().set_len(info.size)?;

        let limiter = self.config.max_bytes_per_second.map(rate_limiter);
        let transfer = Arc::new(Transfer {
            url: self.url.clone(),
            client: self.client.clone(),
            temp_path: temp_path(&self.destination),
            blob_size: info.size,
            cancel: self.cancel.clone(),
            state: Mutex::new(SessionState {
                scheduler,
                counters: TransferCounters::new(self.config.download_rate_window, Instant::now()),
                failed_blocks: 0,
                last_error: None,
                aborted: false,
                last_reported: 0,
            }),
            limiter,
            identity,
            store: Mutex::new(store),
        });

        let reporter = tokio::spawn(report_progress(
            transfer.clone(),
            self.subscribers.clone(),
            self.config.progress_report_interval,
        ));

        let workers: Vec<_> = (0..self.config.simultaneous_downloads)
            .map(|worker| tokio::spawn(run_worker(transfer.clone(), worker)))
            .collect();

        let mut outcome = Ok(());
        for handle in workers {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(DownloadError::Io(format!("worker task failed: {}", e))));
            if let Err(e) = result {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        reporter.abort();
        transfer.report(&self.subscribers).await;
        outcome?;

        self.finalize(&transfer, info.checksum.as_ref()).await
    }

    /// With no usable resume state, an existing final file either already is
    /// the blob (checksum match) or is stale and removed.
    async fn final_file_matches(&self, info: &BlobInfo) -> DownloadResult<bool> {
        if fs::metadata(&self.destination).await.is_err() {
            return Ok(false);
        }
        if let Some(checksum) = &info.checksum {
            if hashing::file_matches(&self.destination, checksum).await? {
                return Ok(true);
            }
        }
        debug!(destination = %self.destination.display(), "removing stale final file");
        fs::remove_file(&self.destination).await?;
        Ok(false)
    }

    /// Steps after the last worker exits. The caller releases the lock afterwards.
    async fn finalize(
        &self,
        transfer: &Transfer,
        checksum: Option<&Checksum>,
    ) -> DownloadResult<()> {
        {
            let state = transfer.state.lock().await;
            if state.scheduler.has_pending() {
                if self.cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                return Err(DownloadError::Io(format!(
                    "{} blocks still pending after workers finished",
                    state.scheduler.counts().pending
                )));
            }
        }

        {
            let store = transfer.store.lock().await;
            store.delete().await?;
        }

        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        fs::rename(&transfer.temp_path, &self.destination).await?;

        if self.config.check_checksum_after_download {
            if let Some(checksum) = checksum {
                hashing::verify_file(&self.destination, checksum).await?;
            }
        }
        Ok(())
    }
}
