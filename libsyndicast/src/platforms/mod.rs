//! Platform abstraction and implementations
//!
//! One adapter per social network, all behind a single trait: refresh the
//! account's access token and publish a post. Adapters never throw past
//! their boundary — `publish` always returns a structured [`PostResult`] so
//! the delivery worker can persist a deterministic outcome. Every outbound
//! request/response pair is captured into an [`ApiTrail`] and attached to
//! the result's details on failure.
//!
//! Adapter construction goes through [`AdapterRegistry`], a map from
//! platform id to factory, so new platforms plug in without touching the
//! orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::media::store::MediaStore;
use crate::types::{AppCredentials, PostMedia, PostResult, RefreshedCredentials, SocialAccount};

pub mod instagram;
pub mod mastodon;
pub mod tiktok;
pub mod youtube;

// Mock platform is available for all builds (not just tests) to support
// integration tests
pub mod mock;

/// Platforms whose tokens are cheap to refresh and silently expire; the
/// delivery worker refreshes these on every run regardless of the recorded
/// expiry.
pub const ALWAYS_REFRESH_PLATFORMS: &[&str] = &["tiktok", "instagram"];

/// One captured outbound exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiExchange {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
}

/// The request/response trail of one publish call
///
/// Attached verbatim to a failed result's `error_details` so an operator
/// can reconstruct what the platform actually saw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiTrail {
    pub exchanges: Vec<ApiExchange>,
}

impl ApiTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        method: &str,
        url: &str,
        status: Option<u16>,
        request_body: Option<String>,
        response_body: Option<String>,
    ) {
        self.exchanges.push(ApiExchange {
            method: method.to_string(),
            url: url.to_string(),
            status,
            request_body,
            response_body,
        });
    }

    /// Serialize the trail for a result's details field.
    pub fn to_details(&self) -> Option<String> {
        if self.exchanges.is_empty() {
            None
        } else {
            serde_json::to_string(self).ok()
        }
    }
}

/// Everything an adapter needs to publish for one account
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub post_id: String,
    pub account: SocialAccount,
    pub caption: String,
    pub media: Vec<PostMedia>,
    pub settings: Option<serde_json::Value>,
}

/// The per-platform adapter contract
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Lowercase platform identifier (e.g. "tiktok")
    fn platform(&self) -> &'static str;

    /// Refresh the account's access token.
    ///
    /// Platforms without token expiry implement this as a passthrough that
    /// echoes the stored token. Implementations should fall back to a
    /// secondary auth path where the platform supports one before failing.
    async fn refresh_access_token(&self, account: &SocialAccount)
        -> Result<RefreshedCredentials>;

    /// Publish a post for one account.
    ///
    /// Never returns an error: any failure is folded into a failed
    /// [`PostResult`] with the API trail in its details.
    async fn publish(&self, request: &PublishRequest) -> PostResult;
}

/// Dependencies handed to adapter factories
#[derive(Clone)]
pub struct AdapterContext {
    pub http: reqwest::Client,
    pub store: Arc<dyn MediaStore>,
    pub app_credentials: Option<AppCredentials>,
}

type AdapterFactory =
    Arc<dyn Fn(AdapterContext) -> Result<Box<dyn PlatformAdapter>> + Send + Sync>;

struct RegistryEntry {
    factory: AdapterFactory,
    requires_app_credentials: bool,
}

/// Map from platform id to adapter factory
pub struct AdapterRegistry {
    entries: HashMap<&'static str, RegistryEntry>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with every built-in platform registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("mastodon", false, |ctx| {
            Ok(Box::new(mastodon::MastodonAdapter::new(ctx.http)))
        });
        registry.register("youtube", true, |ctx| {
            let creds = ctx.app_credentials.clone().ok_or_else(|| {
                PlatformError::MissingAppCredentials("youtube".to_string())
            })?;
            Ok(Box::new(youtube::YoutubeAdapter::new(
                ctx.http, ctx.store, creds,
            )))
        });
        registry.register("tiktok", true, |ctx| {
            let creds = ctx.app_credentials.clone().ok_or_else(|| {
                PlatformError::MissingAppCredentials("tiktok".to_string())
            })?;
            Ok(Box::new(tiktok::TiktokAdapter::new(
                ctx.http, ctx.store, creds,
            )))
        });
        registry.register("instagram", true, |ctx| {
            let creds = ctx.app_credentials.clone().ok_or_else(|| {
                PlatformError::MissingAppCredentials("instagram".to_string())
            })?;
            Ok(Box::new(instagram::InstagramAdapter::new(ctx.http, creds)))
        });
        registry
    }

    /// Register a platform factory, replacing any existing registration.
    pub fn register<F>(&mut self, platform: &'static str, requires_app_credentials: bool, factory: F)
    where
        F: Fn(AdapterContext) -> Result<Box<dyn PlatformAdapter>> + Send + Sync + 'static,
    {
        self.entries.insert(
            platform,
            RegistryEntry {
                factory: Arc::new(factory),
                requires_app_credentials,
            },
        );
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.entries.contains_key(platform)
    }

    /// Whether publishing on this platform needs app-level credentials.
    ///
    /// Unknown platforms return `None`.
    pub fn requires_app_credentials(&self, platform: &str) -> Option<bool> {
        self.entries
            .get(platform)
            .map(|e| e.requires_app_credentials)
    }

    /// Construct the adapter for a platform.
    ///
    /// # Errors
    ///
    /// `PlatformError::MissingAppCredentials` when the platform requires
    /// app credentials and the context carries none; `PlatformError::
    /// Validation` for an unknown platform id.
    pub fn create(&self, platform: &str, ctx: AdapterContext) -> Result<Box<dyn PlatformAdapter>> {
        let entry = self.entries.get(platform).ok_or_else(|| {
            PlatformError::Validation(format!("unknown platform: {}", platform))
        })?;

        if entry.requires_app_credentials && ctx.app_credentials.is_none() {
            return Err(PlatformError::MissingAppCredentials(platform.to_string()).into());
        }

        (entry.factory)(ctx)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
