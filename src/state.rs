//! Persisted resume state: which blocks of a (url, destination, size, checksum)
//! identity are already on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::blocks::block_count;
use crate::utils::{resume_path, temp_path};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Pending,
    /// In memory only; persisted as `Pending`.
    Downloading,
    Downloaded,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub format_version: u32,
    pub url: String,
    pub destination: PathBuf,
    pub temp_path: PathBuf,
    pub block_size: u64,
    pub blob_size: u64,
    /// Empty when the server supplied no checksum.
    pub checksum: String,
    pub blocks: Vec<BlockState>,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

/// What a resume file must describe to be trusted for this download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeIdentity {
    pub url: String,
    pub destination: PathBuf,
    pub temp_path: PathBuf,
    pub blob_size: u64,
    pub checksum: String,
}

impl ResumeIdentity {
    pub fn new(url: &str, destination: &Path, blob_size: u64, checksum: String) -> Self {
        Self {
            url: url.to_string(),
            destination: destination.to_path_buf(),
            temp_path: temp_path(destination),
            blob_size,
            checksum,
        }
    }
}

/// Why a resume file was not used. Never surfaced to callers.
#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum ResumeStateInvalid {
    #[error("no resume file")]
    Missing,
    #[error("temp file is missing")]
    TempFileMissing,
    #[error("temp file is {actual} bytes, expected {expected}")]
    TempSizeMismatch { expected: u64, actual: u64 },
    #[error("no server checksum to validate resumed bytes against")]
    NoChecksum,
    #[error("malformed resume file: {0}")]
    Malformed(String),
    #[error("resume file describes a different {0}")]
    IdentityMismatch(&'static str),
    #[error("resume file has {actual} blocks, expected {expected}")]
    BlockCountMismatch { expected: usize, actual: usize },
    #[error("block {0} is persisted as downloading")]
    TransientBlockState(usize),
}

/// Loads and writes `D-resume` for one destination.
///
/// Owned by the session behind its own mutex so that saves are serialized.
#[derive(Debug)]
pub struct ResumeStore {
    path: PathBuf,
    enabled: bool,
    version: u64,
}

impl ResumeStore {
    pub fn new(destination: &Path, enabled: bool) -> Self {
        Self {
            path: resume_path(destination),
            enabled,
            version: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the stored state when it is valid for `identity`.
    ///
    /// Invalid files are logged and, with `delete_on_invalid`, removed.
    pub async fn load(
        &mut self,
        identity: &ResumeIdentity,
        delete_on_invalid: bool,
    ) -> Option<ResumeState> {
        match self.validate(identity).await {
            Ok(state) => {
                debug!(
                    path = %self.path.display(),
                    version = state.version,
                    "resuming from saved state"
                );
                self.version = state.version;
                Some(state)
            }
            Err(ResumeStateInvalid::Missing) => None,
            Err(reason) => {
                warn!(path = %self.path.display(), %reason, "discarding resume state");
                if delete_on_invalid {
                    self.remove().await;
                }
                None
            }
        }
    }

    async fn validate(&self, identity: &ResumeIdentity) -> Result<ResumeState, ResumeStateInvalid> {
        if fs::metadata(&self.path).await.is_err() {
            return Err(ResumeStateInvalid::Missing);
        }
        let temp_len = fs::metadata(&identity.temp_path)
            .await
            .map_err(|_| ResumeStateInvalid::TempFileMissing)?
            .len();
        if temp_len != identity.blob_size {
            return Err(ResumeStateInvalid::TempSizeMismatch {
                expected: identity.blob_size,
                actual: temp_len,
            });
        }
        if identity.checksum.is_empty() {
            return Err(ResumeStateInvalid::NoChecksum);
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| ResumeStateInvalid::Malformed(e.to_string()))?;
        let state: ResumeState = serde_json::from_str(&content)
            .map_err(|e| ResumeStateInvalid::Malformed(e.to_string()))?;

        if state.format_version != FORMAT_VERSION {
            return Err(ResumeStateInvalid::IdentityMismatch("format version"));
        }
        if state.blob_size != identity.blob_size {
            return Err(ResumeStateInvalid::IdentityMismatch("blob size"));
        }
        if state.checksum != identity.checksum {
            return Err(ResumeStateInvalid::IdentityMismatch("checksum"));
        }
        if state.url != identity.url {
            return Err(ResumeStateInvalid::IdentityMismatch("url"));
        }
        if state.destination != identity.destination {
            return Err(ResumeStateInvalid::IdentityMismatch("destination"));
        }
        if state.temp_path != identity.temp_path {
            return Err(ResumeStateInvalid::IdentityMismatch("temp path"));
        }
        if state.block_size < 1024 || state.block_size % 1024 != 0 {
            return Err(ResumeStateInvalid::Malformed(format!(
                "block size {}",
                state.block_size
            )));
        }
        let expected = block_count(state.blob_size, state.block_size);
        if state.blocks.len() != expected {
            return Err(ResumeStateInvalid::BlockCountMismatch {
                expected,
                actual: state.blocks.len(),
            });
        }
        if let Some(index) = state
            .blocks
            .iter()
            .position(|block| *block == BlockState::Downloading)
        {
            return Err(ResumeStateInvalid::TransientBlockState(index));
        }

        Ok(state)
    }

    /// Persist `blocks` for `identity`.
    ///
    /// Deletes the file instead once nothing is pending. No-op when resumable
    /// downloads are disabled.
    pub async fn save(
        &mut self,
        identity: &ResumeIdentity,
        block_size: u64,
        blocks: &[BlockState],
    ) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !blocks.contains(&BlockState::Pending) && !blocks.contains(&BlockState::Downloading) {
            return self.delete().await;
        }

        self.version += 1;
        let state = ResumeState {
            format_version: FORMAT_VERSION,
            url: identity.url.clone(),
            destination: identity.destination.clone(),
            temp_path: identity.temp_path.clone(),
            block_size,
            blob_size: identity.blob_size,
            checksum: identity.checksum.clone(),
            blocks: blocks
                .iter()
                .map(|block| match block {
                    BlockState::Downloading => BlockState::Pending,
                    other => *other,
                })
                .collect(),
            version: self.version,
            last_modified: Utc::now(),
        };
        let content = serde_json::to_vec(&state).map_err(io::Error::other)?;
        atomic_write(&self.path, &content).await
    }

    pub async fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn remove(&self) {
        if let Err(e) = self.delete().await {
            warn!(path = %self.path.display(), error = %e, "failed to delete resume file");
        }
    }
}

/// Read a resume file without any validation. Used to observe another process.
pub async fn peek(path: &Path) -> Option<ResumeState> {
    let content = fs::read(path).await.ok()?;
    serde_json::from_slice(&content).ok()
}

async fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut staging = path.as_os_str().to_os_string();
    staging.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let staging = PathBuf::from(staging);

    if let Err(e) = fs::write(&staging, content).await {
        let _ = fs::remove_file(&staging).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&staging, path).await {
        let _ = fs::remove_file(&staging).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BLOCK: u64 = 1024;
    const SIZE: u64 = 3000;

    struct Fixture {
        _dir: TempDir,
        identity: ResumeIdentity,
        store: ResumeStore,
    }

    async fn fixture(checksum: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("blob.bin");
        let identity = ResumeIdentity::new(
            "http://host/blob.bin",
            &destination,
            SIZE,
            checksum.to_string(),
        );
        fs::write(&identity.temp_path, vec![0u8; SIZE as usize]).await.unwrap();
        Fixture {
            _dir: dir,
            store: ResumeStore::new(&destination, true),
            identity,
        }
    }

    fn partial_blocks() -> Vec<BlockState> {
        vec![BlockState::Downloaded, BlockState::Pending, BlockState::Pending]
    }

    async fn write_raw(fixture: &Fixture, value: serde_json::Value) {
        fs::write(fixture.store.path(), serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();

        let mut reader = ResumeStore::new(&f.identity.destination, true);
        let state = reader.load(&f.identity, true).await.unwrap();
        assert_eq!(state.blocks, partial_blocks());
        assert_eq!(state.version, 1);
        assert_eq!(state.format_version, FORMAT_VERSION);
    }

    #[tokio::test]
    async fn save_normalizes_downloading_to_pending() {
        let mut f = fixture("md5:abc").await;
        let blocks = vec![BlockState::Downloaded, BlockState::Downloading, BlockState::Pending];
        f.store.save(&f.identity, BLOCK, &blocks).await.unwrap();

        let state = peek(f.store.path()).await.unwrap();
        assert_eq!(state.blocks, partial_blocks());
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        assert_eq!(peek(f.store.path()).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn save_without_pending_deletes_file() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        assert!(f.store.path().exists());

        f.store
            .save(&f.identity, BLOCK, &[BlockState::Downloaded; 3])
            .await
            .unwrap();
        assert!(!f.store.path().exists());
    }

    #[tokio::test]
    async fn disabled_store_never_writes() {
        let f = fixture("md5:abc").await;
        let mut store = ResumeStore::new(&f.identity.destination, false);
        store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn missing_checksum_never_resumes() {
        let mut f = fixture("").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        assert_eq!(
            f.store.validate(&f.identity).await,
            Err(ResumeStateInvalid::NoChecksum)
        );
        assert!(f.store.load(&f.identity, false).await.is_none());
        assert!(f.store.path().exists());
    }

    #[tokio::test]
    async fn temp_size_must_match() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        fs::write(&f.identity.temp_path, b"short").await.unwrap();
        assert!(matches!(
            f.store.validate(&f.identity).await,
            Err(ResumeStateInvalid::TempSizeMismatch {
                expected: SIZE,
                actual: 5
            })
        ));
    }

    #[tokio::test]
    async fn missing_temp_file_is_invalid() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        fs::remove_file(&f.identity.temp_path).await.unwrap();
        assert_eq!(
            f.store.validate(&f.identity).await,
            Err(ResumeStateInvalid::TempFileMissing)
        );
    }

    #[tokio::test]
    async fn persisted_downloading_is_rejected_and_deleted() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(f.store.path()).await.unwrap()).unwrap();
        value["blocks"][1] = serde_json::json!("downloading");
        write_raw(&f, value).await;

        assert_eq!(
            f.store.validate(&f.identity).await,
            Err(ResumeStateInvalid::TransientBlockState(1))
        );
        assert!(f.store.load(&f.identity, true).await.is_none());
        assert!(!f.store.path().exists());
    }

    #[tokio::test]
    async fn wrong_block_count_is_rejected() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(f.store.path()).await.unwrap()).unwrap();
        value["blocks"] = serde_json::json!(["downloaded", "pending"]);
        write_raw(&f, value).await;

        assert_eq!(
            f.store.validate(&f.identity).await,
            Err(ResumeStateInvalid::BlockCountMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[tokio::test]
    async fn unparsable_body_is_rejected() {
        let mut f = fixture("md5:abc").await;
        fs::write(f.store.path(), b"{not json").await.unwrap();
        assert!(matches!(
            f.store.validate(&f.identity).await,
            Err(ResumeStateInvalid::Malformed(_))
        ));
        assert!(f.store.load(&f.identity, true).await.is_none());
        assert!(!f.store.path().exists());
    }

    #[tokio::test]
    async fn identity_mismatch_is_rejected() {
        let mut f = fixture("md5:abc").await;
        f.store.save(&f.identity, BLOCK, &partial_blocks()).await.unwrap();

        let other_checksum = ResumeIdentity {
            checksum: "md5:def".to_string(),
            ..f.identity.clone()
        };
        assert_eq!(
            f.store.validate(&other_checksum).await,
            Err(ResumeStateInvalid::IdentityMismatch("checksum"))
        );

        let other_url = ResumeIdentity {
            url: "http://elsewhere/blob.bin".to_string(),
            ..f.identity.clone()
        };
        assert_eq!(
            f.store.validate(&other_url).await,
            Err(ResumeStateInvalid::IdentityMismatch("url"))
        );
    }
}
