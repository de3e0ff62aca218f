//! Resumable, concurrent downloader for large immutable HTTP blobs.
//!
//! A blob is fetched in fixed-size blocks with ranged GETs into `D-temp`,
//! progress is persisted to `D-resume`, and the temp file is renamed to `D`
//! once every block is on disk.

pub mod blocks;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod error;
pub mod hashing;
pub mod probe;
pub mod progress;
pub mod session;
pub mod state;
pub mod utils;
pub mod worker;

pub use crate::config::{DownloadConfig, DownloadOptions};
pub use crate::downloader::Downloader;
pub use crate::error::{DownloadError, DownloadResult};
pub use crate::progress::{ProgressCallback, ProgressData};
pub use tokio_util::sync::CancellationToken;
