//! Cross-process coordination through an advisory lock on the temp file.
//!
//! The owning process holds an exclusive `flock`-style lock on `D-temp` for
//! the whole session. A process that finds the lock taken observes the
//! owner's resume file until the lock clears. The OS drops the lock of a
//! crashed process, so an abandoned destination is reclaimed on the next poll.
//!
//! Unix only in practice: workers write blocks through their own handles to
//! the locked `D-temp`, which relies on advisory `flock` semantics. `fs2`
//! maps to `LockFileEx` on Windows, where the lock is mandatory and those
//! writes would be refused.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocks::bytes_downloaded;
use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::progress::{ProgressData, Subscribers, TransferCounters};
use crate::state;
use crate::utils::{resume_path, temp_path};

/// Exclusive advisory lock on a destination's temp file.
#[derive(Debug)]
pub struct DestinationLock {
    file: File,
    path: PathBuf,
}

impl DestinationLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The locked temp file handle; also used to pre-allocate the payload.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn release(self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release destination lock");
        } else {
            debug!(path = %self.path.display(), "released destination lock");
        }
    }
}

#[derive(Debug)]
pub enum Coordination {
    /// This process owns the destination.
    Owned(DestinationLock),
    /// Another process finished the download while we waited.
    SatisfiedElsewhere,
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Non-blocking lock attempt. `Ok(false)` means another handle holds it.
fn try_lock(file: &File) -> io::Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Whether some handle currently holds the lock on `path`.
pub fn is_locked(path: &Path) -> io::Result<bool> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let acquired = try_lock(&file)?;
    if acquired {
        let _ = FileExt::unlock(&file);
    }
    Ok(!acquired)
}

/// Take ownership of `destination`, waiting out any other process that holds it.
pub async fn coordinate(
    destination: &Path,
    config: &DownloadConfig,
    cancel: &CancellationToken,
    subscribers: &Subscribers,
) -> DownloadResult<Coordination> {
    let path = temp_path(destination);
    loop {
        let file = open_lock_file(&path)?;
        if try_lock(&file)? {
            debug!(path = %path.display(), "acquired destination lock");
            return Ok(Coordination::Owned(DestinationLock { file, path }));
        }

        info!(
            destination = %destination.display(),
            "destination is being downloaded by another process"
        );
        observe_foreign(&file, destination, config, cancel, subscribers).await?;
        drop(file);

        if fs::metadata(destination).await.is_ok() {
            info!(destination = %destination.display(), "download completed by another process");
            return Ok(Coordination::SatisfiedElsewhere);
        }
        debug!(
            destination = %destination.display(),
            "foreign lock released without a final file, taking over"
        );
    }
}

/// Poll until `file`'s lock can be taken, reporting the owner's progress meanwhile.
async fn observe_foreign(
    file: &File,
    destination: &Path,
    config: &DownloadConfig,
    cancel: &CancellationToken,
    subscribers: &Subscribers,
) -> DownloadResult<()> {
    let resume = resume_path(destination);
    let mut last_modified: Option<SystemTime> = None;
    let mut last_progress = Instant::now();
    let mut counters = TransferCounters::new(config.download_rate_window, Instant::now());
    let mut last_done: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(config.lock_poll_interval) => {}
        }

        if try_lock(file)? {
            // Only the observation needed the lock; the caller reopens the path.
            let _ = FileExt::unlock(file);
            return Ok(());
        }

        let now = Instant::now();
        let modified = fs::metadata(&resume).await.and_then(|m| m.modified()).ok();
        if modified.is_some() && modified != last_modified {
            last_modified = modified;
            last_progress = now;
            if let Some(foreign) = state::peek(&resume).await {
                let done = bytes_downloaded(&foreign.blocks, foreign.blob_size, foreign.block_size);
                if let Some(previous) = last_done {
                    counters.record(done.saturating_sub(previous), now);
                }
                last_done = Some(done);
                subscribers.emit(&ProgressData::from_resume_state(&foreign, counters.rates(now)));
            }
        }

        if now.duration_since(last_progress) > config.foreign_lock_timeout {
            return Err(DownloadError::LockTimeout(format!(
                "{} made no progress for {:?}",
                destination.display(),
                config.foreign_lock_timeout
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            lock_poll_interval: Duration::from_millis(20),
            ..DownloadConfig::default()
        }
    }

    async fn wait_for(
        destination: &Path,
        config: &DownloadConfig,
        cancel: &CancellationToken,
    ) -> DownloadResult<Coordination> {
        coordinate(destination, config, cancel, &Subscribers::default()).await
    }

    #[tokio::test]
    async fn unlocked_destination_is_owned() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("blob.bin");
        let outcome = wait_for(&destination, &fast_config(), &CancellationToken::new())
            .await
            .unwrap();
        let lock = match outcome {
            Coordination::Owned(lock) => lock,
            other => panic!("expected ownership, got {:?}", other),
        };
        assert!(is_locked(&temp_path(&destination)).unwrap());
        lock.release();
        assert!(!is_locked(&temp_path(&destination)).unwrap());
    }

    #[tokio::test]
    async fn waits_for_foreign_owner_and_accepts_its_result() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("blob.bin");
        let foreign = open_lock_file(&temp_path(&destination)).unwrap();
        foreign.lock_exclusive().unwrap();

        let release_destination = destination.clone();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&release_destination, b"done").unwrap();
            FileExt::unlock(&foreign).unwrap();
        });

        let outcome = wait_for(&destination, &fast_config(), &CancellationToken::new())
            .await
            .unwrap();
        releaser.await.unwrap();
        assert!(matches!(outcome, Coordination::SatisfiedElsewhere));
    }

    #[tokio::test]
    async fn takes_over_when_foreign_owner_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("blob.bin");
        let foreign = open_lock_file(&temp_path(&destination)).unwrap();
        foreign.lock_exclusive().unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(foreign);
        });

        let outcome = wait_for(&destination, &fast_config(), &CancellationToken::new())
            .await
            .unwrap();
        releaser.await.unwrap();
        assert!(matches!(outcome, Coordination::Owned(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_observation() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("blob.bin");
        let foreign = open_lock_file(&temp_path(&destination)).unwrap();
        foreign.lock_exclusive().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = wait_for(&destination, &fast_config(), &cancel).await;
        assert!(matches!(outcome, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn stalled_foreign_owner_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("blob.bin");
        let foreign = open_lock_file(&temp_path(&destination)).unwrap();
        foreign.lock_exclusive().unwrap();

        let config = DownloadConfig {
            foreign_lock_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let outcome = wait_for(&destination, &config, &CancellationToken::new()).await;
        assert!(matches!(outcome, Err(DownloadError::LockTimeout(_))));
        assert!(outcome.unwrap_err().is_retryable());
        drop(foreign);
    }
}
