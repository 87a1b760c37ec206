//! Core types for Syndicast

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owning project for posts and account connections
///
/// The project row carries the two external identities the pipeline checks
/// before publishing: the API key tied to the post submission and the
/// billing customer used for usage metering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub api_key: Option<String>,
    pub billing_customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub project_id: String,
    pub caption: String,
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub status: PostStatus,
}

impl Post {
    pub fn new(project_id: String, caption: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id,
            caption,
            created_at: chrono::Utc::now().timestamp(),
            scheduled_at: None,
            status: PostStatus::Draft,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Processing,
    Processed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Processing => "processing",
            PostStatus::Processed => "processed",
        }
    }

    pub fn from_str_or_draft(s: &str) -> Self {
        match s {
            "scheduled" => PostStatus::Scheduled,
            "processing" => PostStatus::Processing,
            "processed" => PostStatus::Processed,
            _ => PostStatus::Draft,
        }
    }
}

/// A stored OAuth credential for one end-user's account on one platform
///
/// `access_token` is nullable: a nulled token represents a disconnected
/// account. `connection_kind` records the login flow sub-type for platforms
/// that support more than one (used during app-credential selection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub project_id: String,
    pub platform: String,
    pub external_id: String,
    pub handle: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<i64>,
    pub refresh_token_expires_at: Option<i64>,
    pub connection_kind: Option<String>,
}

impl SocialAccount {
    /// Whether the stored access token expires within `days` days.
    ///
    /// Accounts without a recorded expiry never match; platforms whose
    /// tokens do not expire are handled by the always-refresh allowlist
    /// instead.
    pub fn token_expires_within_days(&self, days: i64, now: i64) -> bool {
        match self.access_token_expires_at {
            Some(expires_at) => expires_at - now <= days * 86_400,
            None => false,
        }
    }
}

/// Detected media kind after content sniffing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    /// Classify a MIME type string, returning `None` for anything that is
    /// neither an image nor a video.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_lowercase();
        if mime.starts_with("image/") {
            Some(MediaType::Image)
        } else if mime.starts_with("video/") {
            Some(MediaType::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A media row attached to a post
///
/// Scope determines which accounts see the item when effective media is
/// resolved: unscoped rows are the post default, `platform_scope` limits the
/// row to one platform, `account_scope` to one account. Scoped rows skip
/// localization (`skip_processing`) when the caller already re-hosted them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMedia {
    pub id: Option<i64>,
    pub post_id: String,
    pub url: String,
    pub media_type: Option<MediaType>,
    pub thumbnail_url: Option<String>,
    pub thumbnail_timestamp_ms: Option<i64>,
    pub platform_scope: Option<String>,
    pub account_scope: Option<String>,
    pub skip_processing: bool,
    pub tags: Vec<String>,
}

impl PostMedia {
    /// A media row with no scope: part of the post's default media set.
    pub fn is_global(&self) -> bool {
        self.platform_scope.is_none() && self.account_scope.is_none()
    }
}

/// Optional caption override plus the free-form settings bag, scoped to one
/// platform or one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: Option<i64>,
    pub post_id: String,
    pub platform: String,
    pub account_id: Option<String>,
    pub caption: Option<String>,
    pub settings: Option<serde_json::Value>,
}

/// One delivery attempt outcome per (post, account); append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostResult {
    pub id: Option<i64>,
    pub post_id: String,
    pub account_id: String,
    pub platform: String,
    pub success: bool,
    pub provider_post_id: Option<String>,
    pub provider_post_url: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub completed_at: i64,
}

impl PostResult {
    /// Build a success result carrying the provider's post id and URL.
    pub fn success(
        post_id: &str,
        account_id: &str,
        platform: &str,
        provider_post_id: String,
        provider_post_url: Option<String>,
    ) -> Self {
        Self {
            id: None,
            post_id: post_id.to_string(),
            account_id: account_id.to_string(),
            platform: platform.to_string(),
            success: true,
            provider_post_id: Some(provider_post_id),
            provider_post_url,
            error_message: None,
            error_details: None,
            completed_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Build a failure result with a message and optional diagnostic details.
    pub fn failure(
        post_id: &str,
        account_id: &str,
        platform: &str,
        error_message: String,
        error_details: Option<String>,
    ) -> Self {
        Self {
            id: None,
            post_id: post_id.to_string(),
            account_id: account_id.to_string(),
            platform: platform.to_string(),
            success: false,
            provider_post_id: None,
            provider_post_url: None,
            error_message: Some(error_message),
            error_details,
            completed_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Platform app-level OAuth client credentials for one project
///
/// `sub_type` is set for platforms with more than one login flow; rows with
/// a null sub-type act as the generic credential set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCredentials {
    pub project_id: String,
    pub platform: String,
    pub sub_type: Option<String>,
    pub client_id: String,
    pub client_secret: String,
}

/// Refreshed token material returned by a platform adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshedCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}
