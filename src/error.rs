use thiserror::Error;

/// Errors surfaced to callers of [`crate::Downloader::download_file`].
///
/// The type is `Clone` because every caller attached to the same session
/// receives the same outcome; underlying errors are carried as text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("invalid configuration for `{field}`: {reason}")]
    ConfigValidation {
        field: &'static str,
        reason: String,
    },

    #[error("server capability check failed: {0}")]
    Capability(String),

    #[error("block download failed {failures} times, last error: {last_error}")]
    BlockDownload { failures: u32, last_error: String },

    #[error("destination is locked by another process: {0}")]
    LockTimeout(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(String),
}

impl DownloadError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        DownloadError::ConfigValidation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::LockTimeout(_)
                | DownloadError::Network(_)
                | DownloadError::BlockDownload { .. }
        )
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
