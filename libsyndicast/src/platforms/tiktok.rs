//! TikTok platform implementation
//!
//! Publishing is a three-step flow: obtain an upload grant from the publish
//! init endpoint, upload the raw bytes to the granted URL, then poll the
//! publish status endpoint until the platform reports a terminal state.
//! Videos above the platform's byte ceiling go through the size-constrained
//! compressor first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::media::compress::SizeConstrainedCompressor;
use crate::media::store::MediaStore;
use crate::platforms::{ApiTrail, PlatformAdapter, PublishRequest};
use crate::types::{
    AppCredentials, MediaType, PostResult, RefreshedCredentials, SocialAccount,
};

const TOKEN_URL: &str = "https://open.tiktokapis.com/v2/oauth/token/";
const INIT_URL: &str = "https://open.tiktokapis.com/v2/post/publish/video/init/";
const STATUS_URL: &str = "https://open.tiktokapis.com/v2/post/publish/status/fetch/";

/// Upload byte ceiling the publish API accepts in one session.
pub const MAX_VIDEO_BYTES: u64 = 287_762_808;
const TITLE_LIMIT: usize = 2200;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 60;

pub struct TiktokAdapter {
    http: Client,
    store: Arc<dyn MediaStore>,
    compressor: SizeConstrainedCompressor,
    credentials: AppCredentials,
}

/// Terminal decision from one status poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollVerdict {
    /// Still processing; keep polling
    Pending,
    /// Published; carries the platform post id when reported
    Published(Option<String>),
    /// Processing failed with the platform's reason
    Failed(String),
}

/// Classify one status-fetch response body.
pub fn classify_status(body: &serde_json::Value) -> PollVerdict {
    match body["data"]["status"].as_str() {
        Some("PUBLISH_COMPLETE") => {
            let post_id = body["data"]["publicaly_available_post_id"]
                .as_array()
                .and_then(|ids| ids.first())
                .map(|id| match id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            PollVerdict::Published(post_id)
        }
        Some("FAILED") => {
            let reason = body["data"]["fail_reason"]
                .as_str()
                .unwrap_or("unknown reason")
                .to_string();
            PollVerdict::Failed(reason)
        }
        _ => PollVerdict::Pending,
    }
}

impl TiktokAdapter {
    pub fn new(http: Client, store: Arc<dyn MediaStore>, credentials: AppCredentials) -> Self {
        let compressor = SizeConstrainedCompressor::new(Arc::clone(&store));
        Self {
            http,
            store,
            compressor,
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
            .ok_or_else(|| "post has no video media for TikTok".to_string())?;

        // Resolve the video to the platform's byte ceiling first
        let video_url = self
            .compressor
            .compress(&video.url, MAX_VIDEO_BYTES)
            .await
            .map_err(|e| format!("compression to platform ceiling failed: {}", e))?;

        let video_size = self
            .store
            .size_of(&video_url)
            .await
            .map_err(|e| format!("failed to stat video: {}", e))?;
        if video_size == 0 {
            return Err("video object is empty".to_string());
        }

        // Step 1: upload grant
        let init_body = init_request_body(request, video_size);
        let response = self
            .http
            .post(INIT_URL)
            .bearer_auth(token)
            .json(&init_body)
            .send()
            .await
            .map_err(|e| format!("publish init failed: {}", e))?;

        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();
        trail.record(
            "POST",
            INIT_URL,
            Some(status.as_u16()),
            Some(init_body.to_string()),
            Some(body_text.clone()),
        );
        if !status.is_success() {
            return Err(format!("publish init failed: HTTP {}", status));
        }

        let body: serde_json::Value = serde_json::from_str(&body_text)
            .map_err(|e| format!("unreadable init response: {}", e))?;
        let publish_id = body["data"]["publish_id"]
            .as_str()
            .ok_or_else(|| "init response missing publish_id".to_string())?
            .to_string();
        let upload_url = body["data"]["upload_url"]
            .as_str()
            .ok_or_else(|| "init response missing upload_url".to_string())?
            .to_string();

        // Step 2: raw upload, streamed from disk
        let fetched = self
            .store
            .fetch(&video_url)
            .await
            .map_err(|e| format!("failed to fetch video from storage: {}", e))?;
        let file = tokio::fs::File::open(fetched.path())
            .await
            .map_err(|e| format!("failed to open video file: {}", e))?;

        let response = self
            .http
            .put(&upload_url)
            .header("Content-Type", "video/mp4")
            .header(
                "Content-Range",
                format!("bytes 0-{}/{}", video_size - 1, video_size),
            )
            .header("Content-Length", video_size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| format!("video upload failed: {}", e))?;

        let status = response.status();
        trail.record("PUT", &upload_url, Some(status.as_u16()), None, None);
        if !status.is_success() {
            return Err(format!("video upload failed: HTTP {}", status));
        }

        // Step 3: poll the processing job to a terminal state
        self.poll_publish_status(token, &publish_id, trail).await
    }

    async fn poll_publish_status(
        &self,
        token: &str,
        publish_id: &str,
        trail: &mut ApiTrail,
    ) -> std::result::Result<(String, Option<String>), String> {
        for _ in 0..MAX_POLLS {
            let request_body = serde_json::json!({ "publish_id": publish_id });
            let response = self
                .http
                .post(STATUS_URL)
                .bearer_auth(token)
                .json(&request_body)
                .send()
                .await
                .map_err(|e| format!("status fetch failed: {}", e))?;

            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            trail.record(
                "POST",
                STATUS_URL,
                Some(status.as_u16()),
                Some(request_body.to_string()),
                Some(body_text.clone()),
            );
            if !status.is_success() {
                return Err(format!("status fetch failed: HTTP {}", status));
            }

            let body: serde_json::Value = serde_json::from_str(&body_text)
                .map_err(|e| format!("unreadable status response: {}", e))?;

            match classify_status(&body) {
                PollVerdict::Published(post_id) => {
                    let post_id = post_id.unwrap_or_else(|| publish_id.to_string());
                    return Ok((post_id, None));
                }
                PollVerdict::Failed(reason) => {
                    return Err(format!("platform processing failed: {}", reason));
                }
                PollVerdict::Pending => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        Err(format!(
            "publish {} did not reach a terminal state after {} polls",
            publish_id, MAX_POLLS
        ))
    }
}

#[async_trait]
impl PlatformAdapter for TiktokAdapter {
    fn platform(&self) -> &'static str {
        "tiktok"
    }

    async fn refresh_access_token(
        &self,
        account: &SocialAccount,
    ) -> Result<RefreshedCredentials> {
        let refresh_token = account.refresh_token.as_deref().ok_or_else(|| {
            PlatformError::Authentication(
                "TikTok account has no refresh token stored. Please reconnect the account."
                    .to_string(),
            )
        })?;

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_key", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| {
                PlatformError::Network(format!("TikTok token endpoint unreachable: {}", e))
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            PlatformError::Authentication(format!("unreadable token response: {}", e))
        })?;

        if !status.is_success() || body["error"].is_string() {
            return Err(PlatformError::Authentication(format!(
                "TikTok token refresh failed: HTTP {}: {}",
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

        Ok(RefreshedCredentials {
            access_token,
            // TikTok rotates refresh tokens on every refresh
            refresh_token: body["refresh_token"].as_str().map(|s| s.to_string()),
            expires_at: body["expires_in"]
                .as_i64()
                .map(|secs| chrono::Utc::now().timestamp() + secs),
        })
    }

    async fn publish(&self, request: &PublishRequest) -> PostResult {
        let mut trail = ApiTrail::new();
        debug!(account = %request.account.id, "publishing to tiktok");

        match self.publish_inner(request, &mut trail).await {
            Ok((post_id, url)) => PostResult::success(
                &request.post_id,
                &request.account.id,
                "tiktok",
                post_id,
                url,
            ),
            Err(message) => PostResult::failure(
                &request.post_id,
                &request.account.id,
                "tiktok",
                format!("TikTok publish failed: {}", message),
                trail.to_details(),
            ),
        }
    }
}

/// Build the publish init body from the request and settings bag.
fn init_request_body(request: &PublishRequest, video_size: u64) -> serde_json::Value {
    let title: String = request.caption.chars().take(TITLE_LIMIT).collect();
    let settings = request.settings.as_ref();

    serde_json::json!({
        "post_info": {
            "title": title,
            "privacy_level": settings
                .and_then(|s| s["privacy_level"].as_str())
                .unwrap_or("PUBLIC_TO_EVERYONE"),
            "disable_comment": settings
                .and_then(|s| s["disable_comment"].as_bool())
                .unwrap_or(false),
            "disable_duet": settings
                .and_then(|s| s["disable_duet"].as_bool())
                .unwrap_or(false),
            "disable_stitch": settings
                .and_then(|s| s["disable_stitch"].as_bool())
                .unwrap_or(false),
            "brand_content_toggle": settings
                .and_then(|s| s["brand_content_toggle"].as_bool())
                .unwrap_or(false),
        },
        "source_info": {
            "source": "FILE_UPLOAD",
            "video_size": video_size,
            "chunk_size": video_size,
            "total_chunk_count": 1,
        }
    })
}
