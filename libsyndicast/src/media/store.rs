//! Durable media storage
//!
//! `MediaStore` hides the storage service behind three operations: fetch an
//! object to a local temp file, put a file under a new key, and overwrite
//! the object behind an existing URL in place. `ResumableHttpStore` talks
//! to an HTTP storage service using the resumable chunked protocol;
//! `LocalStore` is a filesystem-backed implementation used by tests and
//! single-node deployments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::Client;
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;
use crate::error::{MediaError, Result};
use crate::media::chunked::ChunkedUploader;

/// A fetched object on local disk; the file is deleted on drop.
pub struct FetchedObject {
    file: tempfile::NamedTempFile,
}

impl FetchedObject {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(self.file.path())
            .map_err(MediaError::Io)?
            .len())
    }
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Download the object behind a pipeline-owned URL to a temp file.
    async fn fetch(&self, url: &str) -> Result<FetchedObject>;

    /// Upload a local file under `key`; returns the public URL.
    async fn put(&self, key: &str, path: &Path, content_type: &str) -> Result<String>;

    /// Overwrite the object behind an existing URL, keeping the URL stable.
    async fn put_over(&self, url: &str, path: &Path, content_type: &str) -> Result<()>;

    /// Byte size of the object behind a URL without downloading it.
    async fn size_of(&self, url: &str) -> Result<u64>;

    /// Extract the storage key from one of this store's public URLs.
    fn key_of(&self, url: &str) -> Result<String>;
}

/// Build a collision-free storage key for a source URL.
///
/// Keys embed a fresh UUID plus a random suffix so a runtime retry of the
/// same localization re-uploads under a new key instead of colliding with a
/// half-written object. The source extension is preserved when present.
pub fn storage_key(source_url: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();

    let ext = extension_of(source_url)
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    format!("{}-{}{}", uuid::Uuid::new_v4(), suffix.to_lowercase(), ext)
}

/// Derive a sibling key from an existing key: `name-suffix.ext`.
pub fn sibling_key(key: &str, suffix: &str) -> String {
    match key.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, suffix, ext),
        None => format!("{}-{}", key, suffix),
    }
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_lowercase())
}

// ----------------------------------------------------------------------
// HTTP-backed store
// ----------------------------------------------------------------------

/// Storage client speaking the resumable chunked upload protocol
pub struct ResumableHttpStore {
    client: Client,
    config: StorageConfig,
    uploader: ChunkedUploader,
}

impl ResumableHttpStore {
    pub fn new(client: Client, config: StorageConfig) -> Self {
        let uploader = ChunkedUploader::new(client.clone(), config.chunk_size_bytes);
        Self {
            client,
            config,
            uploader,
        }
    }

    /// Open an upload session for `key`; the service answers with the
    /// session URL chunks are sent to.
    async fn start_session(&self, key: &str, content_type: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.config.base_url)
            .header("X-Upload-Content-Type", content_type)
            .query(&[("name", key), ("uploadType", "resumable")])
            .send()
            .await
            .map_err(|e| MediaError::Storage(format!("session start failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(MediaError::Storage(format!(
                "session start failed: HTTP {}",
                response.status()
            ))
            .into());
        }

        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                MediaError::Storage("session start response missing Location header".to_string())
                    .into()
            })
    }
}

#[async_trait]
impl MediaStore for ResumableHttpStore {
    async fn fetch(&self, url: &str) -> Result<FetchedObject> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MediaError::Download(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(MediaError::Download(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                response.status()
            ))
            .into());
        }

        let file = tempfile::NamedTempFile::new().map_err(MediaError::Io)?;
        let mut writer = tokio::fs::File::create(file.path())
            .await
            .map_err(MediaError::Io)?;

        // Stream to disk; the body is never held in memory whole
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| MediaError::Download(format!("stream read failed: {}", e)))?;
            writer.write_all(&chunk).await.map_err(MediaError::Io)?;
        }
        writer.flush().await.map_err(MediaError::Io)?;

        Ok(FetchedObject { file })
    }

    async fn put(&self, key: &str, path: &Path, content_type: &str) -> Result<String> {
        let session_url = self.start_session(key, content_type).await?;
        self.uploader.upload(&session_url, path, content_type).await?;
        Ok(format!(
            "{}/{}",
            self.config.public_url.trim_end_matches('/'),
            key
        ))
    }

    async fn put_over(&self, url: &str, path: &Path, content_type: &str) -> Result<()> {
        let key = self.key_of(url)?;
        self.put(&key, path, content_type).await?;
        Ok(())
    }

    async fn size_of(&self, url: &str) -> Result<u64> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| MediaError::Storage(format!("HEAD {} failed: {}", url, e)))?;

        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                MediaError::Storage(format!("no Content-Length for {}", url)).into()
            })
    }

    fn key_of(&self, url: &str) -> Result<String> {
        let base = self.config.public_url.trim_end_matches('/');
        url.strip_prefix(base)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                MediaError::Storage(format!("{} is not a storage URL of this store", url)).into()
            })
    }
}

// ----------------------------------------------------------------------
// Filesystem-backed store
// ----------------------------------------------------------------------

/// Filesystem store addressing objects as `local://<key>`
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl MediaStore for LocalStore {
    async fn fetch(&self, url: &str) -> Result<FetchedObject> {
        let key = self.key_of(url)?;
        let source = self.object_path(&key);

        let file = tempfile::NamedTempFile::new().map_err(MediaError::Io)?;
        tokio::fs::copy(&source, file.path())
            .await
            .map_err(|e| MediaError::Download(format!("Failed to fetch {}: {}", url, e)))?;

        Ok(FetchedObject { file })
    }

    async fn put(&self, key: &str, path: &Path, _content_type: &str) -> Result<String> {
        let target = self.object_path(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(MediaError::Io)?;
        }
        tokio::fs::copy(path, &target).await.map_err(MediaError::Io)?;
        Ok(format!("local://{}", key))
    }

    async fn put_over(&self, url: &str, path: &Path, content_type: &str) -> Result<()> {
        let key = self.key_of(url)?;
        self.put(&key, path, content_type).await?;
        Ok(())
    }

    async fn size_of(&self, url: &str) -> Result<u64> {
        let key = self.key_of(url)?;
        let metadata = tokio::fs::metadata(self.object_path(&key))
            .await
            .map_err(|e| MediaError::Storage(format!("stat {} failed: {}", url, e)))?;
        Ok(metadata.len())
    }

    fn key_of(&self, url: &str) -> Result<String> {
        url.strip_prefix("local://")
            .map(|k| k.to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                MediaError::Storage(format!("{} is not a local storage URL", url)).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_is_unique_and_keeps_extension() {
        let a = storage_key("https://example.com/path/video.MP4?sig=abc");
        let b = storage_key("https://example.com/path/video.MP4?sig=abc");

        assert_ne!(a, b);
        assert!(a.ends_with(".mp4"));
        assert!(b.ends_with(".mp4"));
    }

    #[test]
    fn test_storage_key_without_extension() {
        let key = storage_key("https://example.com/download");
        assert!(!key.contains('.'));
    }

    #[test]
    fn test_sibling_key() {
        assert_eq!(sibling_key("abc.mp4", "fit"), "abc-fit.mp4");
        assert_eq!(sibling_key("abc", "fit"), "abc-fit");
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(root.path().to_path_buf());

        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"hello media").unwrap();

        let url = store
            .put("objects/a.bin", source.path(), "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(url, "local://objects/a.bin");

        assert_eq!(store.size_of(&url).await.unwrap(), 11);

        let fetched = store.fetch(&url).await.unwrap();
        assert_eq!(std::fs::read(fetched.path()).unwrap(), b"hello media");
    }

    #[tokio::test]
    async fn test_local_store_put_over_keeps_url() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(root.path().to_path_buf());

        let first = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(first.path(), b"version one").unwrap();
        let url = store.put("v.bin", first.path(), "video/mp4").await.unwrap();

        let second = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(second.path(), b"two").unwrap();
        store.put_over(&url, second.path(), "video/mp4").await.unwrap();

        let fetched = store.fetch(&url).await.unwrap();
        assert_eq!(std::fs::read(fetched.path()).unwrap(), b"two");
        assert_eq!(store.size_of(&url).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_local_store_rejects_foreign_url() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(root.path().to_path_buf());

        assert!(store.fetch("https://elsewhere.test/a.bin").await.is_err());
        assert!(store.size_of("local://").await.is_err());
    }
}
