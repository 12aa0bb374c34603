//! Local blob store
//!
//! Saves finished captures under `{upload_dir}/{sub_dir}/{stem}_{unix_ts}.{ext}`
//! and serves them from `{base_url}/{path}`.

use super::{atomic_write_async, BlobStore, StoreError, StoredBlob};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Blob store on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    upload_dir: PathBuf,
    sub_dir: String,
    base_url: String,
    allowed_extensions: Vec<String>,
}

impl LocalBlobStore {
    pub fn new(
        upload_dir: impl Into<PathBuf>,
        sub_dir: impl Into<String>,
        base_url: impl Into<String>,
        allowed_extensions: Vec<String>,
    ) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            sub_dir: sub_dir.into().trim_matches('/').to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn target_dir(&self) -> PathBuf {
        self.sub_dir
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.upload_dir.clone(), |dir, part| dir.join(part))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn save(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<StoredBlob, StoreError> {
        let name = Path::new(suggested_name);
        let extension = name
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if !self.allowed_extensions.contains(&extension) {
            return Err(StoreError::Rejected(format!(
                "file type '.{}' not allowed, expected one of: {}",
                extension,
                self.allowed_extensions.join(", ")
            )));
        }

        let stem = name
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .unwrap_or("recording");
        let file_name = format!("{}_{}.{}", stem, Utc::now().timestamp(), extension);

        let dir = self.target_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&file_name);
        let size = bytes.len();
        atomic_write_async(&target, bytes).await?;

        let path = format!(
            "{}/{}/{}",
            self.upload_dir.to_string_lossy().trim_end_matches('/'),
            self.sub_dir,
            file_name
        );
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url,
            self.upload_dir.to_string_lossy().trim_matches('/'),
            self.sub_dir,
            urlencoding::encode(&file_name)
        );

        tracing::info!("Stored {} bytes at {}", size, path);
        Ok(StoredBlob { path, url })
    }
}
