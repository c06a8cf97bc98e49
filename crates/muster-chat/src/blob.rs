use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::{Rng, distr::Alphanumeric, rng};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::backend::BlobStore;
use crate::error::BackendError;

/// Lower-cased extension of `filename`, without the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Collision-free blob path: `<unix-millis>-<8 random alphanumerics>.<ext>`.
pub fn blob_path(filename: &str, now: DateTime<Utc>) -> String {
    let suffix: String = rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    match extension_of(filename) {
        Some(ext) => format!("{}-{}.{}", now.timestamp_millis(), suffix, ext),
        None => format!("{}-{}", now.timestamp_millis(), suffix),
    }
}

/// Blob store writing each attachment as a flat file under one directory.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub async fn new(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Attachment directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn file_path(&self, path: &str) -> PathBuf {
        self.dir.join(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<String, BackendError> {
        // Flat namespace only, to prevent path traversal.
        if path.is_empty() || path.contains(['/', '\\']) || path.starts_with('.') {
            return Err(BackendError::Rejected(format!("invalid blob path '{path}'")));
        }

        let file_path = self.file_path(path);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)
            .await
            .map_err(|e| {
                error!("Failed to create blob {}: {}", file_path.display(), e);
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    BackendError::Conflict(path.to_string())
                } else {
                    BackendError::Unreachable(e.to_string())
                }
            })?;
        file.write_all(&bytes).await.map_err(|e| {
            error!("Failed to write blob {}: {}", file_path.display(), e);
            BackendError::Unreachable(e.to_string())
        })?;
        file.flush()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        Ok(format!("file://{}", file_path.display()))
    }
}
