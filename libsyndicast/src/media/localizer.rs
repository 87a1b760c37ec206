//! Media localization
//!
//! Re-hosts externally supplied media into pipeline-owned durable storage.
//! The source is fetched as a stream straight to a temp file (never whole
//! in memory), its true type sniffed, and the bytes re-uploaded through the
//! store's resumable protocol. Storage keys carry a random suffix, so a
//! runtime retry of the whole job cannot collide with a partial earlier
//! upload.

use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{MediaError, Result};
use crate::jobs::{LocalizeMediaOutput, LocalizeMediaPayload};
use crate::media::sniff;
use crate::media::store::{storage_key, MediaStore};
use crate::types::MediaType;

pub struct MediaLocalizer {
    client: Client,
    store: Arc<dyn MediaStore>,
}

impl MediaLocalizer {
    pub fn new(client: Client, store: Arc<dyn MediaStore>) -> Self {
        Self { client, store }
    }

    /// Localize one media item (and its thumbnail when present).
    ///
    /// # Errors
    ///
    /// `MediaError::UnsupportedType` when content sniffing yields neither
    /// an image nor a video; `MediaError::Download`/`Storage` on fetch or
    /// re-host failures. All of these surface as job failures and are
    /// retried by the runtime.
    pub async fn localize(&self, payload: LocalizeMediaPayload) -> Result<LocalizeMediaOutput> {
        let (media_type, mime) = sniff::detect(&self.client, &payload.url).await?;
        debug!(url = %payload.url, %media_type, %mime, "detected media type");

        let url = self.rehost(&payload.url, &mime).await?;

        let thumbnail_url = match &payload.thumbnail_url {
            Some(thumb) => {
                let (thumb_type, thumb_mime) = sniff::detect(&self.client, thumb).await?;
                if thumb_type != MediaType::Image {
                    return Err(MediaError::UnsupportedType(format!(
                        "thumbnail at {} is not an image",
                        thumb
                    ))
                    .into());
                }
                Some(self.rehost(thumb, &thumb_mime).await?)
            }
            None => None,
        };

        info!(source = %payload.url, %url, "media localized");

        Ok(LocalizeMediaOutput {
            media_id: payload.media_id,
            url,
            thumbnail_url,
            media_type,
            platform_scope: payload.platform_scope,
            account_scope: payload.account_scope,
            skip_processing: payload.skip_processing,
        })
    }

    /// Stream the source body to a temp file and upload it to storage.
    async fn rehost(&self, source_url: &str, content_type: &str) -> Result<String> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| MediaError::Download(format!("Failed to fetch {}: {}", source_url, e)))?;

        if !response.status().is_success() {
            return Err(MediaError::Download(format!(
                "Failed to fetch {}: HTTP {}",
                source_url,
                response.status()
            ))
            .into());
        }

        let temp = tempfile::NamedTempFile::new().map_err(MediaError::Io)?;
        let mut writer = tokio::fs::File::create(temp.path())
            .await
            .map_err(MediaError::Io)?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| MediaError::Download(format!("stream read failed: {}", e)))?;
            writer.write_all(&chunk).await.map_err(MediaError::Io)?;
        }
        writer.flush().await.map_err(MediaError::Io)?;

        let key = storage_key(source_url);
        self.store.put(&key, temp.path(), content_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Localization against live HTTP is covered by the integration suite;
    // here we pin the key derivation the retry-idempotency contract rests on.

    #[test]
    fn test_retry_produces_fresh_keys() {
        let first = storage_key("https://example.com/photo.jpg");
        let second = storage_key("https://example.com/photo.jpg");
        assert_ne!(first, second);
        assert!(first.ends_with(".jpg"));
    }
}
