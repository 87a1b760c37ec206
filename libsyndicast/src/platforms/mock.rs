//! Configurable mock adapter for tests
//!
//! Available in all builds (not just `cfg(test)`) so integration tests in
//! `tests/` can register it with an [`AdapterRegistry`](super::AdapterRegistry).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{PlatformError, Result};
use crate::platforms::{PlatformAdapter, PublishRequest};
use crate::types::{PostResult, RefreshedCredentials, SocialAccount};

#[derive(Clone)]
enum PublishBehavior {
    Succeed { post_id: String },
    Fail { message: String },
}

/// Mock platform adapter with scriptable publish/refresh behavior
pub struct MockAdapter {
    platform: &'static str,
    publish_behavior: PublishBehavior,
    refresh_fails: bool,
    refresh_token_value: Option<String>,
    pub publish_calls: Arc<Mutex<Vec<PublishRequest>>>,
    pub refresh_calls: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn succeeding(platform: &'static str, post_id: &str) -> Self {
        Self {
            platform,
            publish_behavior: PublishBehavior::Succeed {
                post_id: post_id.to_string(),
            },
            refresh_fails: false,
            refresh_token_value: None,
            publish_calls: Arc::new(Mutex::new(Vec::new())),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(platform: &'static str, message: &str) -> Self {
        Self {
            publish_behavior: PublishBehavior::Fail {
                message: message.to_string(),
            },
            ..Self::succeeding(platform, "unused")
        }
    }

    /// A mock whose refresh always fails; publish behavior unchanged.
    pub fn with_failing_refresh(mut self) -> Self {
        self.refresh_fails = true;
        self
    }

    /// A mock whose refresh rotates the refresh token to the given value.
    pub fn with_rotated_refresh_token(mut self, token: &str) -> Self {
        self.refresh_token_value = Some(token.to_string());
        self
    }

    pub fn publish_count(&self) -> usize {
        self.publish_calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> &'static str {
        self.platform
    }

    async fn refresh_access_token(
        &self,
        account: &SocialAccount,
    ) -> Result<RefreshedCredentials> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        if self.refresh_fails {
            return Err(PlatformError::Authentication(format!(
                "{} refresh rejected (mock)",
                self.platform
            ))
            .into());
        }

        Ok(RefreshedCredentials {
            access_token: format!("refreshed-{}", account.id),
            refresh_token: self.refresh_token_value.clone(),
            expires_at: Some(chrono::Utc::now().timestamp() + 60 * 86_400),
        })
    }

    async fn publish(&self, request: &PublishRequest) -> PostResult {
        if let Ok(mut calls) = self.publish_calls.lock() {
            calls.push(request.clone());
        }

        match &self.publish_behavior {
            PublishBehavior::Succeed { post_id } => PostResult::success(
                &request.post_id,
                &request.account.id,
                self.platform,
                post_id.clone(),
                Some(format!("https://{}.example/{}", self.platform, post_id)),
            ),
            PublishBehavior::Fail { message } => PostResult::failure(
                &request.post_id,
                &request.account.id,
                self.platform,
                message.clone(),
                None,
            ),
        }
    }
}
