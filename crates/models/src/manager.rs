//! Checksum-verified model downloads with atomic installation.
//!
//! Downloads stream to `<path>.tmp` while a SHA-256 runs incrementally;
//! only a verified file is renamed into place, so the final path either
//! holds a complete, checksummed model or nothing.

use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{ModelEntry, ModelRegistry};

/// Model management failures.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The id is not in the registry.
    #[error("model `{0}` is not in the registry")]
    NotInRegistry(String),

    /// The downloaded bytes do not match the registry hash. The temp file
    /// has been deleted; retrying is the caller's decision.
    #[error("checksum mismatch for `{id}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Model id.
        id: String,
        /// Registry hash.
        expected: String,
        /// Hash of the downloaded bytes.
        actual: String,
    },

    /// The downloaded size does not match the registry entry.
    #[error("size mismatch for `{id}`: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Model id.
        id: String,
        /// Registry size.
        expected: u64,
        /// Bytes actually downloaded.
        actual: u64,
    },

    /// HTTP transfer failure.
    #[error("download failed: {0}")]
    Http(String),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Download progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes written so far.
    pub downloaded_bytes: u64,
    /// Total expected bytes.
    pub total_bytes: u64,
    /// Mean transfer speed in bytes per second, once measurable.
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining, once measurable.
    pub eta_s: Option<u64>,
}

/// A running download: a progress stream plus the final result.
#[derive(Debug)]
pub struct DownloadHandle {
    progress: mpsc::Receiver<DownloadProgress>,
    task: tokio::task::JoinHandle<Result<PathBuf, ModelError>>,
}

impl DownloadHandle {
    /// Next progress event, or `None` once the transfer has finished.
    pub async fn next_progress(&mut self) -> Option<DownloadProgress> {
        self.progress.recv().await
    }

    /// Await completion; on success the model file exists at the returned
    /// stable path.
    pub async fn finish(self) -> Result<PathBuf, ModelError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(ModelError::Io(std::io::Error::other(format!(
                "download task failed: {err}"
            )))),
        }
    }
}

/// Downloads, verifies, and manages model files under one root directory.
#[derive(Debug, Clone)]
pub struct ModelManager {
    root: PathBuf,
    registry: ModelRegistry,
    http: reqwest::Client,
}

impl ModelManager {
    /// Create a manager rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, registry: ModelRegistry) -> Self {
        Self {
            root: root.into(),
            registry,
            http: reqwest::Client::new(),
        }
    }

    /// The registry backing this manager.
    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn entry(&self, id: &str) -> Result<&ModelEntry, ModelError> {
        self.registry
            .get(id)
            .ok_or_else(|| ModelError::NotInRegistry(id.to_string()))
    }

    /// Stable local path for a model.
    pub fn path_for(&self, id: &str) -> Result<PathBuf, ModelError> {
        let entry = self.entry(id)?;
        Ok(self.root.join(format!("{}.{}", entry.id, entry.format)))
    }

    /// Whether the model exists locally with the registry's exact size.
    pub fn is_downloaded(&self, id: &str) -> Result<bool, ModelError> {
        let entry = self.entry(id)?;
        let path = self.root.join(format!("{}.{}", entry.id, entry.format));
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len() == entry.size_bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the model file (and any stale temp file).
    pub fn delete(&self, id: &str) -> Result<(), ModelError> {
        let path = self.path_for(id)?;
        for candidate in [tmp_path(&path), path] {
            match std::fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Re-hash a local model file against the registry.
    pub fn verify_local(&self, id: &str) -> Result<(), ModelError> {
        let entry = self.entry(id)?.clone();
        let path = self.root.join(format!("{}.{}", entry.id, entry.format));
        let bytes = std::fs::read(&path)?;
        let actual = hex_digest(&bytes);
        if actual != entry.sha256 {
            return Err(ModelError::ChecksumMismatch {
                id: entry.id,
                expected: entry.sha256,
                actual,
            });
        }
        Ok(())
    }

    /// Start a download. Progress events stream on the returned handle; the
    /// final path is available from [`DownloadHandle::finish`].
    pub async fn download(&self, id: &str) -> Result<DownloadHandle, ModelError> {
        let entry = self.entry(id)?.clone();
        let final_path = self.root.join(format!("{}.{}", entry.id, entry.format));
        std::fs::create_dir_all(&self.root)?;

        let (progress_tx, progress_rx) = mpsc::channel(32);
        let http = self.http.clone();
        let task = tokio::spawn(async move {
            let result = fetch_and_commit(&http, &entry, &final_path, &progress_tx).await;
            if let Err(err) = &result {
                warn!(id = %entry.id, error = %err, "model download failed");
            }
            result
        });

        Ok(DownloadHandle {
            progress: progress_rx,
            task,
        })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

async fn fetch_and_commit(
    http: &reqwest::Client,
    entry: &ModelEntry,
    final_path: &Path,
    progress: &mpsc::Sender<DownloadProgress>,
) -> Result<PathBuf, ModelError> {
    let tmp = tmp_path(final_path);
    let response = http.get(&entry.url).send().await?;
    if !response.status().is_success() {
        return Err(ModelError::Http(format!(
            "http {} fetching {}",
            response.status(),
            entry.url
        )));
    }
    let total_bytes = response.content_length().unwrap_or(entry.size_bytes);

    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let started = Instant::now();

    let mut response = response;
    while let Some(chunk) = response.chunk().await? {
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        let elapsed = started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.5 {
            Some((downloaded as f64 / elapsed) as u64)
        } else {
            None
        };
        let eta_s = speed_bps.filter(|s| *s > 0).map(|s| {
            total_bytes.saturating_sub(downloaded) / s.max(1)
        });
        let _ = progress.try_send(DownloadProgress {
            downloaded_bytes: downloaded,
            total_bytes,
            speed_bps,
            eta_s,
        });
    }
    file.flush().await?;
    drop(file);

    let actual = {
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
    };
    commit(entry, &tmp, final_path, downloaded, &actual).await
}

/// Final verification and atomic rename. A mismatch deletes the temp file
/// and leaves the stable path untouched.
async fn commit(
    entry: &ModelEntry,
    tmp: &Path,
    final_path: &Path,
    downloaded: u64,
    actual_sha256: &str,
) -> Result<PathBuf, ModelError> {
    if downloaded != entry.size_bytes {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(ModelError::SizeMismatch {
            id: entry.id.clone(),
            expected: entry.size_bytes,
            actual: downloaded,
        });
    }
    if actual_sha256 != entry.sha256 {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(ModelError::ChecksumMismatch {
            id: entry.id.clone(),
            expected: entry.sha256.clone(),
            actual: actual_sha256.to_string(),
        });
    }
    tokio::fs::rename(tmp, final_path).await?;
    debug!(id = %entry.id, path = %final_path.display(), "model installed");
    Ok(final_path.to_path_buf())
}
