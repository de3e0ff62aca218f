use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Sha256 => 32,
        }
    }
}

/// A server-provided content digest, kept in the encoding the server used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().trim().to_string(),
        }
    }

    fn is_hex(&self) -> bool {
        self.value.len() == self.algorithm.digest_len() * 2
            && self.value.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Render `digest` the way the server rendered its value (hex or base64).
    pub fn encode(&self, digest: &[u8]) -> String {
        if self.is_hex() {
            hex::encode(digest)
        } else {
            STANDARD.encode(digest)
        }
    }

    pub fn matches(&self, digest: &[u8]) -> bool {
        let actual = self.encode(digest);
        if self.is_hex() {
            actual.eq_ignore_ascii_case(&self.value)
        } else {
            actual == self.value
        }
    }
}

/// Identity form stored in resume files, e.g. `md5:1B2M2Y8AsgTpgAmY7PhCfg==`.
impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.value)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, value) = s
            .split_once(':')
            .ok_or_else(|| format!("missing algorithm prefix in {:?}", s))?;
        let algorithm = match algorithm {
            "md5" => ChecksumAlgorithm::Md5,
            "sha256" => ChecksumAlgorithm::Sha256,
            other => return Err(format!("unknown checksum algorithm {:?}", other)),
        };
        if value.is_empty() {
            return Err("empty checksum value".to_string());
        }
        Ok(Checksum::new(algorithm, value))
    }
}

async fn digest_file<D: Digest>(filepath: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(filepath).await?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_vec())
}

pub async fn calculate_digest(
    filepath: &Path,
    algorithm: ChecksumAlgorithm,
) -> std::io::Result<Vec<u8>> {
    match algorithm {
        ChecksumAlgorithm::Md5 => digest_file::<Md5>(filepath).await,
        ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(filepath).await,
    }
}

/// Whether the file at `filepath` hashes to `expected`.
pub async fn file_matches(filepath: &Path, expected: &Checksum) -> std::io::Result<bool> {
    let digest = calculate_digest(filepath, expected.algorithm).await?;
    Ok(expected.matches(&digest))
}

/// Hash the finished file and compare it against the server digest.
///
/// A mismatching file is removed: nothing downstream can trust it.
pub async fn verify_file(filepath: &Path, expected: &Checksum) -> DownloadResult<()> {
    debug!(path = %filepath.display(), checksum = %expected, "verifying checksum");
    let digest = calculate_digest(filepath, expected.algorithm).await?;
    if expected.matches(&digest) {
        return Ok(());
    }

    let actual = expected.encode(&digest);
    warn!(path = %filepath.display(), expected = %expected.value, %actual, "checksum mismatch");
    if let Err(e) = tokio::fs::remove_file(filepath).await {
        warn!(path = %filepath.display(), error = %e, "failed to remove corrupt file");
    }
    Err(DownloadError::ChecksumMismatch {
        expected: expected.value.clone(),
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // md5("hello world")
    const HELLO_MD5_B64: &str = "XrY7u+Ae7tCTyyK7j1rNww==";
    const HELLO_MD5_HEX: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[tokio::test]
    async fn base64_md5_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let checksum = Checksum::new(ChecksumAlgorithm::Md5, HELLO_MD5_B64);
        assert!(file_matches(&path, &checksum).await.unwrap());
        verify_file(&path, &checksum).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn hex_digest_compares_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let checksum = Checksum::new(ChecksumAlgorithm::Md5, HELLO_MD5_HEX.to_uppercase());
        assert!(file_matches(&path, &checksum).await.unwrap());
    }

    #[tokio::test]
    async fn mismatch_reports_both_digests_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello there").await.unwrap();

        let checksum = Checksum::new(ChecksumAlgorithm::Md5, HELLO_MD5_B64);
        match verify_file(&path, &checksum).await {
            Err(DownloadError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, HELLO_MD5_B64);
                assert_ne!(actual, HELLO_MD5_B64);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert!(!path.exists());
    }

    #[test]
    fn identity_string_round_trips() {
        let checksum = Checksum::new(ChecksumAlgorithm::Sha256, "abc=");
        let parsed: Checksum = checksum.to_string().parse().unwrap();
        assert_eq!(parsed, checksum);
        assert!("crc32:abc".parse::<Checksum>().is_err());
        assert!("md5:".parse::<Checksum>().is_err());
    }
}
