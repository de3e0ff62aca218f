use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{DownloadError, DownloadResult};

pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_SIMULTANEOUS_DOWNLOADS: u32 = 4;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 2;
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_FOREIGN_LOCK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 500;

/// User-supplied tuning. Every field is optional; see [`DownloadOptions::normalize`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadOptions {
    pub block_size: Option<u64>,
    pub check_checksum_after_download: Option<bool>,
    pub ignore_resume_data: Option<bool>,
    pub simultaneous_downloads: Option<u32>,
    pub download_rate_window_seconds: Option<u64>,
    pub progress_report_interval_seconds: Option<u64>,
    pub enable_resumable_download: Option<bool>,
    pub max_bytes_per_second: Option<u32>,
    pub foreign_lock_timeout_seconds: Option<u64>,
    pub lock_poll_interval_millis: Option<u64>,
}

/// Fully populated, validated configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub block_size: u64,
    pub check_checksum_after_download: bool,
    pub ignore_resume_data: bool,
    pub simultaneous_downloads: usize,
    pub download_rate_window: Duration,
    pub progress_report_interval: Duration,
    pub enable_resumable_download: bool,
    pub max_bytes_per_second: Option<NonZeroU32>,
    pub foreign_lock_timeout: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            check_checksum_after_download: false,
            ignore_resume_data: false,
            simultaneous_downloads: DEFAULT_SIMULTANEOUS_DOWNLOADS as usize,
            download_rate_window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
            progress_report_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            enable_resumable_download: true,
            max_bytes_per_second: None,
            foreign_lock_timeout: Duration::from_secs(DEFAULT_FOREIGN_LOCK_TIMEOUT_SECS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS),
        }
    }
}

impl DownloadOptions {
    /// Validate the supplied values and fill in defaults for the rest.
    pub fn normalize(&self) -> DownloadResult<DownloadConfig> {
        let defaults = DownloadConfig::default();

        let block_size = self.block_size.unwrap_or(defaults.block_size);
        if block_size < 1024 || block_size % 1024 != 0 {
            return Err(DownloadError::config(
                "blockSize",
                format!("{} is not a positive multiple of 1024", block_size),
            ));
        }

        let simultaneous = self
            .simultaneous_downloads
            .unwrap_or(DEFAULT_SIMULTANEOUS_DOWNLOADS);
        if !(1..16).contains(&simultaneous) {
            return Err(DownloadError::config(
                "simultaneousDownloads",
                format!("{} is outside [1, 16)", simultaneous),
            ));
        }

        let window = self
            .download_rate_window_seconds
            .unwrap_or(DEFAULT_RATE_WINDOW_SECS);
        if !(1..10).contains(&window) {
            return Err(DownloadError::config(
                "downloadRateWindowSeconds",
                format!("{} is outside [1, 10)", window),
            ));
        }

        let interval = self
            .progress_report_interval_seconds
            .unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECS);
        if !(1..10).contains(&interval) {
            return Err(DownloadError::config(
                "progressReportIntervalSeconds",
                format!("{} is outside [1, 10)", interval),
            ));
        }

        let max_bytes_per_second = match self.max_bytes_per_second {
            None => None,
            Some(limit) => Some(NonZeroU32::new(limit).ok_or_else(|| {
                DownloadError::config("maxBytesPerSecond", "must be at least 1")
            })?),
        };

        let lock_timeout = self
            .foreign_lock_timeout_seconds
            .unwrap_or(DEFAULT_FOREIGN_LOCK_TIMEOUT_SECS);
        if lock_timeout == 0 {
            return Err(DownloadError::config(
                "foreignLockTimeoutSeconds",
                "must be at least 1",
            ));
        }

        let poll = self
            .lock_poll_interval_millis
            .unwrap_or(DEFAULT_LOCK_POLL_INTERVAL_MS);
        if !(10..=60_000).contains(&poll) {
            return Err(DownloadError::config(
                "lockPollIntervalMillis",
                format!("{} is outside [10, 60000]", poll),
            ));
        }

        Ok(DownloadConfig {
            block_size,
            check_checksum_after_download: self
                .check_checksum_after_download
                .unwrap_or(defaults.check_checksum_after_download),
            ignore_resume_data: self
                .ignore_resume_data
                .unwrap_or(defaults.ignore_resume_data),
            simultaneous_downloads: simultaneous as usize,
            download_rate_window: Duration::from_secs(window),
            progress_report_interval: Duration::from_secs(interval),
            enable_resumable_download: self
                .enable_resumable_download
                .unwrap_or(defaults.enable_resumable_download),
            max_bytes_per_second,
            foreign_lock_timeout: Duration::from_secs(lock_timeout),
            lock_poll_interval: Duration::from_millis(poll),
        })
    }

    /// Overlay `other` on top of `self`; values set in `other` win.
    pub fn merge(mut self, other: DownloadOptions) -> DownloadOptions {
        macro_rules! take {
            ($($field:ident),*) => {
                $( if other.$field.is_some() { self.$field = other.$field; } )*
            };
        }
        take!(
            block_size,
            check_checksum_after_download,
            ignore_resume_data,
            simultaneous_downloads,
            download_rate_window_seconds,
            progress_report_interval_seconds,
            enable_resumable_download,
            max_bytes_per_second,
            foreign_lock_timeout_seconds,
            lock_poll_interval_millis
        );
        self
    }
}

impl DownloadConfig {
    /// Resume data is consulted only when resumable downloads are enabled and not ignored.
    pub fn consult_resume_data(&self) -> bool {
        self.enable_resumable_download && !self.ignore_resume_data
    }
}
