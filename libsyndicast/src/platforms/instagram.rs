//! Instagram platform implementation
//!
//! Instagram connections come in two login flows: accounts linked through a
//! Facebook page use the Facebook Graph host, accounts connected with
//! Instagram Login use the Instagram Graph host. The recorded connection
//! sub-type picks the host and the refresh grant; a failed primary refresh
//! falls back to a long-lived token exchange with the app secret before
//! giving up.
//!
//! Publishing is container-based: create a media container, poll it until
//! the platform finishes ingesting, then publish the container.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{PlatformError, Result};
use crate::platforms::{ApiTrail, PlatformAdapter, PublishRequest};
use crate::types::{
    AppCredentials, MediaType, PostResult, RefreshedCredentials, SocialAccount,
};

const FACEBOOK_GRAPH: &str = "https://graph.facebook.com/v19.0";
const INSTAGRAM_GRAPH: &str = "https://graph.instagram.com";

/// Connection sub-type for accounts linked through a Facebook page
pub const KIND_FACEBOOK_LOGIN: &str = "facebook_login";
/// Connection sub-type for accounts connected with Instagram Login
pub const KIND_INSTAGRAM_LOGIN: &str = "instagram_login";

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const MAX_POLLS: u32 = 40;

pub struct InstagramAdapter {
    http: Client,
    credentials: AppCredentials,
}

/// The Graph API host for an account's login flow.
pub fn graph_base(account: &SocialAccount) -> &'static str {
    match account.connection_kind.as_deref() {
        Some(KIND_INSTAGRAM_LOGIN) => INSTAGRAM_GRAPH,
        _ => FACEBOOK_GRAPH,
    }
}

/// Classify a container status_code field.
pub fn container_ready(status_code: &str) -> std::result::Result<bool, String> {
    match status_code {
        "FINISHED" => Ok(true),
        "IN_PROGRESS" | "PUBLISHED" => Ok(false),
        "ERROR" | "EXPIRED" => Err(format!("container entered state {}", status_code)),
        other => Err(format!("unexpected container state {}", other)),
    }
}

impl InstagramAdapter {
    pub fn new(http: Client, credentials: AppCredentials) -> Self {
        Self { http, credentials }
    }

    /// Primary refresh for the account's login flow.
    async fn refresh_primary(&self, account: &SocialAccount) -> Result<RefreshedCredentials> {
        let access_token = account.access_token.as_deref().ok_or_else(|| {
            PlatformError::Authentication(
                "Instagram account has no access token stored. Please reconnect the account."
                    .to_string(),
            )
        })?;

        let url = match account.connection_kind.as_deref() {
            Some(KIND_INSTAGRAM_LOGIN) => format!(
                "{}/refresh_access_token?grant_type=ig_refresh_token&access_token={}",
                INSTAGRAM_GRAPH, access_token
            ),
            _ => format!(
                "{}/oauth/access_token?grant_type=fb_exchange_token&client_id={}&client_secret={}&fb_exchange_token={}",
                FACEBOOK_GRAPH, self.credentials.client_id, self.credentials.client_secret, access_token
            ),
        };

        self.fetch_token(&url).await
    }

    /// Secondary path: a long-lived exchange against the Facebook host with
    /// the stored app secret, tolerating a primary flow whose state expired.
    async fn refresh_fallback(&self, account: &SocialAccount) -> Result<RefreshedCredentials> {
        let access_token = account.access_token.as_deref().ok_or_else(|| {
            PlatformError::Authentication("no access token for fallback exchange".to_string())
        })?;

        let url = format!(
            "{}/oauth/access_token?grant_type=fb_exchange_token&client_id={}&client_secret={}&fb_exchange_token={}",
            FACEBOOK_GRAPH, self.credentials.client_id, self.credentials.client_secret, access_token
        );

        self.fetch_token(&url).await
    }

    async fn fetch_token(&self, url: &str) -> Result<RefreshedCredentials> {
        let response = self.http.get(url).send().await.map_err(|e| {
            PlatformError::Network(format!("Instagram token endpoint unreachable: {}", e))
        })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            PlatformError::Authentication(format!("unreadable token response: {}", e))
        })?;

        if !status.is_success() {
            return Err(PlatformError::Authentication(format!(
                "Instagram token refresh failed: HTTP {}: {}",
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
            refresh_token: None,
            expires_at: body["expires_in"]
                .as_i64()
                .map(|secs| chrono::Utc::now().timestamp() + secs),
        })
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
        let ig_user = &request.account.external_id;
        let base = graph_base(&request.account);

        let media = request
            .media
            .first()
            .ok_or_else(|| "post has no media for Instagram".to_string())?;
        let is_video = media.media_type == Some(MediaType::Video);

        // Step 1: create the media container
        let mut container_body = serde_json::json!({
            "caption": request.caption,
            "access_token": token,
        });
        if is_video {
            container_body["video_url"] = serde_json::Value::String(media.url.clone());
            container_body["media_type"] = serde_json::Value::String("REELS".to_string());
            if let Some(ms) = media.thumbnail_timestamp_ms {
                container_body["thumb_offset"] = serde_json::json!(ms);
            }
        } else {
            container_body["image_url"] = serde_json::Value::String(media.url.clone());
        }

        let container_url = format!("{}/{}/media", base, ig_user);
        let body = self
            .graph_post(&container_url, &container_body, trail)
            .await?;
        let container_id = body["id"]
            .as_str()
            .ok_or_else(|| "container response missing id".to_string())?
            .to_string();

        // Step 2: videos ingest asynchronously; wait for the container
        if is_video {
            self.wait_for_container(base, &container_id, token, trail)
                .await?;
        }

        // Step 3: publish the container
        let publish_url = format!("{}/{}/media_publish", base, ig_user);
        let publish_body = serde_json::json!({
            "creation_id": container_id,
            "access_token": token,
        });
        let body = self.graph_post(&publish_url, &publish_body, trail).await?;
        let media_id = body["id"]
            .as_str()
            .ok_or_else(|| "publish response missing id".to_string())?
            .to_string();

        // Permalink is best-effort; the id alone is a valid outcome
        let permalink = self
            .fetch_permalink(base, &media_id, token, trail)
            .await
            .ok()
            .flatten();

        Ok((media_id, permalink))
    }

    async fn wait_for_container(
        &self,
        base: &str,
        container_id: &str,
        token: &str,
        trail: &mut ApiTrail,
    ) -> std::result::Result<(), String> {
        let status_url = format!(
            "{}/{}?fields=status_code&access_token={}",
            base, container_id, token
        );

        for _ in 0..MAX_POLLS {
            let response = self
                .http
                .get(&status_url)
                .send()
                .await
                .map_err(|e| format!("container status fetch failed: {}", e))?;

            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            trail.record("GET", &status_url, Some(status.as_u16()), None, Some(body_text.clone()));
            if !status.is_success() {
                return Err(format!("container status fetch failed: HTTP {}", status));
            }

            let body: serde_json::Value = serde_json::from_str(&body_text)
                .map_err(|e| format!("unreadable container status: {}", e))?;
            let code = body["status_code"].as_str().unwrap_or("IN_PROGRESS");

            match container_ready(code) {
                Ok(true) => return Ok(()),
                Ok(false) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(reason) => return Err(reason),
            }
        }

        Err(format!(
            "container {} did not finish ingesting after {} polls",
            container_id, MAX_POLLS
        ))
    }

    async fn fetch_permalink(
        &self,
        base: &str,
        media_id: &str,
        token: &str,
        trail: &mut ApiTrail,
    ) -> std::result::Result<Option<String>, String> {
        let url = format!("{}/{}?fields=permalink&access_token={}", base, media_id, token);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("permalink fetch failed: {}", e))?;

        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();
        trail.record("GET", &url, Some(status.as_u16()), None, Some(body_text.clone()));

        let body: serde_json::Value = serde_json::from_str(&body_text).unwrap_or_default();
        Ok(body["permalink"].as_str().map(|s| s.to_string()))
    }

    async fn graph_post(
        &self,
        url: &str,
        body: &serde_json::Value,
        trail: &mut ApiTrail,
    ) -> std::result::Result<serde_json::Value, String> {
        let response = self.http.post(url).json(body).send().await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                trail.record("POST", url, None, Some(redact(body)), Some(e.to_string()));
                return Err(format!("graph call failed: {}", e));
            }
        };

        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();
        trail.record(
            "POST",
            url,
            Some(status.as_u16()),
            Some(redact(body)),
            Some(body_text.clone()),
        );

        if !status.is_success() {
            return Err(format!("graph call failed: HTTP {}", status));
        }

        serde_json::from_str(&body_text).map_err(|e| format!("unreadable graph response: {}", e))
    }
}

/// Strip the access token from a request body before recording it.
fn redact(body: &serde_json::Value) -> String {
    let mut clone = body.clone();
    if clone.get("access_token").is_some() {
        clone["access_token"] = serde_json::Value::String("<redacted>".to_string());
    }
    clone.to_string()
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
    fn platform(&self) -> &'static str {
        "instagram"
    }

    async fn refresh_access_token(
        &self,
        account: &SocialAccount,
    ) -> Result<RefreshedCredentials> {
        match self.refresh_primary(account).await {
            Ok(refreshed) => Ok(refreshed),
            Err(primary_error) => {
                warn!(
                    account = %account.id,
                    error = %primary_error,
                    "primary Instagram refresh failed, trying app-secret exchange"
                );
                self.refresh_fallback(account).await.map_err(|_| {
                    // Surface the primary failure; the fallback error adds
                    // nothing actionable
                    primary_error
                })
            }
        }
    }

    async fn publish(&self, request: &PublishRequest) -> PostResult {
        let mut trail = ApiTrail::new();
        debug!(account = %request.account.id, "publishing to instagram");

        match self.publish_inner(request, &mut trail).await {
            Ok((media_id, permalink)) => PostResult::success(
                &request.post_id,
                &request.account.id,
                "instagram",
                media_id,
                permalink,
            ),
            Err(message) => PostResult::failure(
                &request.post_id,
                &request.account.id,
                "instagram",
                format!("Instagram publish failed: {}", message),
                trail.to_details(),
            ),
        }
    }
}
