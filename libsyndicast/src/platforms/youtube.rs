//! YouTube platform implementation
//!
//! Publishing drives the resumable upload protocol: open an upload session,
//! stream the video in `Content-Range` chunks through the shared state
//! machine, then read the video id from the final response.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::media::chunked::ChunkedUploader;
use crate::media::store::MediaStore;
use crate::platforms::{ApiTrail, PlatformAdapter, PublishRequest};
use crate::types::{
    AppCredentials, MediaType, PostResult, RefreshedCredentials, SocialAccount,
};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status";
const TITLE_LIMIT: usize = 100;
const DESCRIPTION_LIMIT: usize = 5000;
const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

pub struct YoutubeAdapter {
    http: Client,
    store: Arc<dyn MediaStore>,
    credentials: AppCredentials,
}

impl YoutubeAdapter {
    pub fn new(http: Client, store: Arc<dyn MediaStore>, credentials: AppCredentials) -> Self {
        Self {
            http,
            store,
            credentials,
        }
    }

    async fn publish_inner(
        &self,
        request: &PublishRequest,
        trail: &mut ApiTrail,
    ) -> std::result::Result<(String, Option<String>), String> {
        let token = request
            .account
            .access_token
            .as_deref()
            .ok_or_else(|| "account is disconnected (no access token)".to_string())?;

        let video = request
            .media
            .iter()
            .find(|m| m.media_type == Some(MediaType::Video))
            .ok_or_else(|| "post has no video media for YouTube".to_string())?;

        let metadata = video_metadata(request);

        // Open the upload session; the server answers with the session URL
        let response = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "video/mp4")
            .json(&metadata)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                trail.record("POST", UPLOAD_URL, None, Some(metadata.to_string()), Some(e.to_string()));
                return Err(format!("upload session start failed: {}", e));
            }
        };

        let status = response.status();
        let session_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        trail.record(
            "POST",
            UPLOAD_URL,
            Some(status.as_u16()),
            Some(metadata.to_string()),
            session_url.clone(),
        );

        if !status.is_success() {
            return Err(format!("upload session start failed: HTTP {}", status));
        }
        let session_url =
            session_url.ok_or_else(|| "session response missing Location header".to_string())?;

        let fetched = self
            .store
            .fetch(&video.url)
            .await
            .map_err(|e| format!("failed to fetch video from storage: {}", e))?;

        let uploader = ChunkedUploader::new(self.http.clone(), CHUNK_SIZE);
        let body = uploader
            .upload(&session_url, fetched.path(), "video/mp4")
            .await
            .map_err(|e| format!("chunked upload failed: {}", e))?;
        trail.record(
            "PUT",
            &session_url,
            Some(200),
            None,
            body.as_ref().map(|b| b.to_string()),
        );

        let video_id = body
            .as_ref()
            .and_then(|b| b["id"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "upload response missing video id".to_string())?;

        let url = format!("https://www.youtube.com/watch?v={}", video_id);
        Ok((video_id, Some(url)))
    }
}

#[async_trait]
impl PlatformAdapter for YoutubeAdapter {
    fn platform(&self) -> &'static str {
        "youtube"
    }

    async fn refresh_access_token(
        &self,
        account: &SocialAccount,
    ) -> Result<RefreshedCredentials> {
        let refresh_token = account.refresh_token.as_deref().ok_or_else(|| {
            PlatformError::Authentication(
                "YouTube account has no refresh token stored. Please reconnect the account."
                    .to_string(),
            )
        })?;

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| {
                PlatformError::Network(format!("YouTube token endpoint unreachable: {}", e))
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            PlatformError::Authentication(format!("unreadable token response: {}", e))
        })?;

        if !status.is_success() {
            return Err(PlatformError::Authentication(format!(
                "YouTube token refresh failed: HTTP {}: {}",
                status, body
            ))
            .into());
        }

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| {
                PlatformError::Authentication("token response missing access_token".to_string())
            })?
            .to_string();

        let expires_at = body["expires_in"]
            .as_i64()
            .map(|secs| chrono::Utc::now().timestamp() + secs);

        Ok(RefreshedCredentials {
            access_token,
            // Google keeps the refresh token stable across refreshes
            refresh_token: None,
            expires_at,
        })
    }

    async fn publish(&self, request: &PublishRequest) -> PostResult {
        let mut trail = ApiTrail::new();
        debug!(account = %request.account.id, "publishing to youtube");

        match self.publish_inner(request, &mut trail).await {
            Ok((video_id, url)) => PostResult::success(
                &request.post_id,
                &request.account.id,
                "youtube",
                video_id,
                url,
            ),
            Err(message) => PostResult::failure(
                &request.post_id,
                &request.account.id,
                "youtube",
                format!("YouTube publish failed: {}", message),
                trail.to_details(),
            ),
        }
    }
}

/// Build the snippet/status metadata for the upload session.
fn video_metadata(request: &PublishRequest) -> serde_json::Value {
    let title = title_of(&request.caption);
    let description: String = request.caption.chars().take(DESCRIPTION_LIMIT).collect();

    let tags: Vec<String> = request
        .media
        .iter()
        .find(|m| m.media_type == Some(MediaType::Video))
        .map(|m| m.tags.clone())
        .unwrap_or_default();

    let privacy = request
        .settings
        .as_ref()
        .and_then(|s| s["privacy"].as_str())
        .unwrap_or("public");

    serde_json::json!({
        "snippet": {
            "title": title,
            "description": description,
            "tags": tags,
        },
        "status": {
            "privacyStatus": privacy,
            "selfDeclaredMadeForKids": request
                .settings
                .as_ref()
                .and_then(|s| s["made_for_kids"].as_bool())
                .unwrap_or(false),
        }
    })
}

/// The video title: first caption line, bounded to YouTube's limit.
fn title_of(caption: &str) -> String {
    let first_line = caption.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return "Untitled".to_string();
    }
    first_line.chars().take(TITLE_LIMIT).collect()
}
