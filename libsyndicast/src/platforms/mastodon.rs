//! Mastodon platform implementation
//!
//! The simplest adapter: media upload plus one JSON status call against the
//! account's home instance. Mastodon access tokens do not expire, so the
//! refresh operation is a passthrough.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::platforms::{ApiTrail, PlatformAdapter, PublishRequest};
use crate::types::{PostResult, RefreshedCredentials, SocialAccount};

const DEFAULT_INSTANCE: &str = "https://mastodon.social";
const CHARACTER_LIMIT: usize = 500;
const MAX_ATTACHMENTS: usize = 4;

pub struct MastodonAdapter {
    http: Client,
}

impl MastodonAdapter {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Upload one media item; returns the instance's media id.
    async fn upload_media(
        &self,
        instance: &str,
        token: &str,
        media_url: &str,
        trail: &mut ApiTrail,
    ) -> std::result::Result<String, String> {
        // Pull the bytes from durable storage first; Mastodon does not
        // fetch remote URLs itself
        let source = self
            .http
            .get(media_url)
            .send()
            .await
            .map_err(|e| format!("failed to fetch media {}: {}", media_url, e))?;
        if !source.status().is_success() {
            return Err(format!(
                "failed to fetch media {}: HTTP {}",
                media_url,
                source.status()
            ));
        }
        let bytes = source
            .bytes()
            .await
            .map_err(|e| format!("failed to read media {}: {}", media_url, e))?;

        let file_name = media_url
            .rsplit('/')
            .next()
            .unwrap_or("media")
            .to_string();
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let upload_url = format!("{}/api/v2/media", instance);
        let response = self
            .http
            .post(&upload_url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                trail.record("POST", &upload_url, None, None, Some(e.to_string()));
                return Err(format!("media upload failed: {}", e));
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        trail.record("POST", &upload_url, Some(status.as_u16()), None, Some(body.clone()));

        if !status.is_success() {
            return Err(format!("media upload failed: HTTP {}", status));
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| format!("unreadable upload response: {}", e))?;
        parsed["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| "upload response missing media id".to_string())
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

        let instance = instance_of(&request.account);

        let mut media_ids = Vec::new();
        for media in request.media.iter().take(MAX_ATTACHMENTS) {
            let id = self.upload_media(&instance, token, &media.url, trail).await?;
            media_ids.push(id);
        }

        let status_text = truncate_caption(&request.caption, CHARACTER_LIMIT);
        let mut body = serde_json::json!({
            "status": status_text,
            "media_ids": media_ids,
        });
        if let Some(visibility) = request
            .settings
            .as_ref()
            .and_then(|s| s["visibility"].as_str())
        {
            body["visibility"] = serde_json::Value::String(visibility.to_string());
        }

        let status_url = format!("{}/api/v1/statuses", instance);
        let response = self
            .http
            .post(&status_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                trail.record("POST", &status_url, None, Some(body.to_string()), Some(e.to_string()));
                return Err(format!("status post failed: {}", e));
            }
        };

        let status = response.status();
        let response_body = response.text().await.unwrap_or_default();
        trail.record(
            "POST",
            &status_url,
            Some(status.as_u16()),
            Some(body.to_string()),
            Some(response_body.clone()),
        );

        if !status.is_success() {
            return Err(format!("status post failed: HTTP {}", status));
        }

        let parsed: serde_json::Value = serde_json::from_str(&response_body)
            .map_err(|e| format!("unreadable status response: {}", e))?;
        let post_id = parsed["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| "status response missing id".to_string())?;
        let post_url = parsed["url"].as_str().map(|s| s.to_string());

        Ok((post_id, post_url))
    }
}

#[async_trait]
impl PlatformAdapter for MastodonAdapter {
    fn platform(&self) -> &'static str {
        "mastodon"
    }

    async fn refresh_access_token(
        &self,
        account: &SocialAccount,
    ) -> Result<RefreshedCredentials> {
        // Mastodon tokens do not expire; echo the stored token
        let token = account.access_token.clone().ok_or_else(|| {
            PlatformError::Authentication(
                "Mastodon account has no access token stored. Please reconnect the account."
                    .to_string(),
            )
        })?;

        Ok(RefreshedCredentials {
            access_token: token,
            refresh_token: None,
            expires_at: None,
        })
    }

    async fn publish(&self, request: &PublishRequest) -> PostResult {
        let mut trail = ApiTrail::new();
        debug!(account = %request.account.id, "publishing to mastodon");

        match self.publish_inner(request, &mut trail).await {
            Ok((post_id, post_url)) => PostResult::success(
                &request.post_id,
                &request.account.id,
                "mastodon",
                post_id,
                post_url,
            ),
            Err(message) => PostResult::failure(
                &request.post_id,
                &request.account.id,
                "mastodon",
                format!("Mastodon publish failed: {}", message),
                trail.to_details(),
            ),
        }
    }
}

/// The account's home instance, derived from a `user@instance` handle.
fn instance_of(account: &SocialAccount) -> String {
    account
        .handle
        .as_deref()
        .and_then(|handle| handle.trim_start_matches('@').split('@').nth(1))
        .map(|domain| format!("https://{}", domain))
        .unwrap_or_else(|| DEFAULT_INSTANCE.to_string())
}

/// Truncate on a char boundary to the instance limit.
fn truncate_caption(caption: &str, limit: usize) -> String {
    if caption.chars().count() <= limit {
        return caption.to_string();
    }
    caption.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(handle: Option<&str>) -> SocialAccount {
        SocialAccount {
            id: "acc-1".to_string(),
            project_id: "proj-1".to_string(),
            platform: "mastodon".to_string(),
            external_id: "42".to_string(),
            handle: handle.map(|h| h.to_string()),
            access_token: Some("token".to_string()),
            refresh_token: None,
            access_token_expires_at: None,
            refresh_token_expires_at: None,
            connection_kind: None,
        }
    }

    #[test]
    fn test_instance_from_handle() {
        assert_eq!(
            instance_of(&account(Some("@alice@fosstodon.org"))),
            "https://fosstodon.org"
        );
        assert_eq!(
            instance_of(&account(Some("alice@hachyderm.io"))),
            "https://hachyderm.io"
        );
    }

    #[test]
    fn test_instance_fallback() {
        assert_eq!(instance_of(&account(None)), DEFAULT_INSTANCE);
        assert_eq!(instance_of(&account(Some("alice"))), DEFAULT_INSTANCE);
    }

    #[test]
    fn test_truncate_caption() {
        assert_eq!(truncate_caption("short", 500), "short");

        let long = "a".repeat(600);
        let truncated = truncate_caption(&long, 500);
        assert_eq!(truncated.chars().count(), 500);

        // Multi-byte chars truncate on char boundaries
        let emoji = "🦀".repeat(600);
        let truncated = truncate_caption(&emoji, 500);
        assert_eq!(truncated.chars().count(), 500);
    }

    #[tokio::test]
    async fn test_refresh_is_passthrough() {
        let adapter = MastodonAdapter::new(Client::new());
        let refreshed = adapter
            .refresh_access_token(&account(None))
            .await
            .unwrap();

        assert_eq!(refreshed.access_token, "token");
        assert_eq!(refreshed.refresh_token, None);
        assert_eq!(refreshed.expires_at, None);
    }

    #[tokio::test]
    async fn test_refresh_disconnected_account_fails() {
        let adapter = MastodonAdapter::new(Client::new());
        let mut acc = account(None);
        acc.access_token = None;

        let result = adapter.refresh_access_token(&acc).await;
        match result {
            Err(crate::error::SyndicastError::Platform(PlatformError::Authentication(msg))) => {
                assert!(msg.contains("no access token"));
            }
            other => panic!("expected authentication error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_publish_disconnected_account_returns_failure_result() {
        let adapter = MastodonAdapter::new(Client::new());
        let mut acc = account(None);
        acc.access_token = None;

        let result = adapter
            .publish(&PublishRequest {
                post_id: "post-1".to_string(),
                account: acc,
                caption: "Hello".to_string(),
                media: vec![],
                settings: None,
            })
            .await;

        assert!(!result.success);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("disconnected"));
    }
}
