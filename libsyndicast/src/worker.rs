//! Per-account delivery worker
//!
//! One worker run takes a single account with its resolved caption, media,
//! and settings, and always produces exactly one [`PostResult`]: refresh
//! credentials when needed, publish through the platform adapter, persist
//! the outcome, meter usage on success, and emit the result notification.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::db::Database;
use crate::events::{Event, EventBus, UsageMeter};
use crate::jobs::DeliverToPlatformPayload;
use crate::media::store::MediaStore;
use crate::platforms::{
    AdapterContext, AdapterRegistry, PublishRequest, ALWAYS_REFRESH_PLATFORMS,
};
use crate::types::{PostResult, SocialAccount};

/// Tokens expiring within this many days are refreshed before publishing.
pub const REFRESH_WINDOW_DAYS: i64 = 7;

/// Whether to force a token refresh before publishing.
///
/// True when the platform is on the always-refresh allowlist, or when the
/// stored access token expires within the refresh window.
pub fn needs_refresh(account: &SocialAccount, now: i64) -> bool {
    ALWAYS_REFRESH_PLATFORMS.contains(&account.platform.as_str())
        || account.token_expires_within_days(REFRESH_WINDOW_DAYS, now)
}

/// Run a best-effort side effect off the critical path, logging failures.
///
/// The spawned future can never flip the delivery outcome; it is not
/// awaited by the caller.
pub fn spawn_logged<F>(context: &'static str, future: F)
where
    F: Future<Output = crate::error::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            warn!(context, error = %e, "best-effort side effect failed");
        }
    });
}

pub struct DeliveryWorker {
    db: Database,
    registry: Arc<AdapterRegistry>,
    http: reqwest::Client,
    store: Arc<dyn MediaStore>,
    meter: Arc<dyn UsageMeter>,
    events: EventBus,
}

impl DeliveryWorker {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        http: reqwest::Client,
        store: Arc<dyn MediaStore>,
        meter: Arc<dyn UsageMeter>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            registry,
            http,
            store,
            meter,
            events,
        }
    }

    /// Deliver one post to one account. Always returns a result; the result
    /// row is persisted and a `result_created` notification emitted before
    /// returning.
    pub async fn deliver(&self, payload: DeliverToPlatformPayload) -> PostResult {
        let result = self.deliver_inner(&payload).await;
        self.record(&result).await;
        result
    }

    async fn deliver_inner(&self, payload: &DeliverToPlatformPayload) -> PostResult {
        let mut account = payload.account.clone();

        let adapter = match self.registry.create(
            &payload.platform,
            AdapterContext {
                http: self.http.clone(),
                store: Arc::clone(&self.store),
                app_credentials: payload.app_credentials.clone(),
            },
        ) {
            Ok(adapter) => adapter,
            Err(e) => {
                return PostResult::failure(
                    &payload.post_id,
                    &account.id,
                    &payload.platform,
                    e.to_string(),
                    None,
                );
            }
        };

        // Refresh first: publishing with a token known to be stale only
        // burns the platform's rate limits
        let now = chrono::Utc::now().timestamp();
        if needs_refresh(&account, now) {
            info!(account = %account.id, platform = %account.platform, "refreshing access token");

            match adapter.refresh_access_token(&account).await {
                Ok(refreshed) => {
                    if let Err(e) = self.db.update_account_tokens(&account.id, &refreshed).await {
                        warn!(account = %account.id, error = %e, "failed to persist refreshed tokens");
                    }
                    if let Some(token) = refreshed.refresh_token {
                        account.refresh_token = Some(token);
                    }
                    account.access_token = Some(refreshed.access_token);
                    account.access_token_expires_at = refreshed.expires_at;
                }
                Err(e) => {
                    return PostResult::failure(
                        &payload.post_id,
                        &account.id,
                        &payload.platform,
                        format!("Token refresh failed: {}", e),
                        None,
                    );
                }
            }
        }

        let result = adapter
            .publish(&PublishRequest {
                post_id: payload.post_id.clone(),
                account,
                caption: payload.caption.clone(),
                media: payload.media.clone(),
                settings: payload.platform_settings.clone(),
            })
            .await;

        // Metering is best-effort and never blocks or flips the outcome
        if result.success {
            if let Some(billing_id) = payload.billing_customer_id.clone() {
                let meter = Arc::clone(&self.meter);
                spawn_logged("usage-metering", async move {
                    meter.record("post_published", &billing_id).await
                });
            }
        }

        result
    }

    async fn record(&self, result: &PostResult) {
        if let Err(e) = self.db.create_post_result(result).await {
            warn!(
                post = %result.post_id,
                account = %result.account_id,
                error = %e,
                "failed to persist delivery result"
            );
        }

        self.events.emit(Event::result_created(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogMeter;
    use crate::media::store::LocalStore;
    use crate::platforms::mock::MockAdapter;
    use crate::types::{Post, PostStatus, Project};

    fn account(platform: &str, expires_in_days: Option<i64>, now: i64) -> SocialAccount {
        SocialAccount {
            id: "acc-1".to_string(),
            project_id: "proj-1".to_string(),
            platform: platform.to_string(),
            external_id: "ext".to_string(),
            handle: None,
            access_token: Some("stored-token".to_string()),
            refresh_token: Some("stored-refresh".to_string()),
            access_token_expires_at: expires_in_days.map(|d| now + d * 86_400),
            refresh_token_expires_at: None,
            connection_kind: None,
        }
    }

    #[test]
    fn test_needs_refresh_expiry_window() {
        let now = 1_700_000_000;

        // Expiring in 3 days: refresh
        assert!(needs_refresh(&account("mastodon", Some(3), now), now));

        // Valid for 30 days: skip
        assert!(!needs_refresh(&account("mastodon", Some(30), now), now));

        // No recorded expiry on a non-allowlist platform: skip
        assert!(!needs_refresh(&account("mastodon", None, now), now));
    }

    #[test]
    fn test_needs_refresh_allowlist_ignores_expiry() {
        let now = 1_700_000_000;
        assert!(needs_refresh(&account("tiktok", Some(30), now), now));
        assert!(needs_refresh(&account("instagram", None, now), now));
    }

    async fn worker_fixture(
        adapter: MockAdapter,
        platform: &'static str,
    ) -> (DeliveryWorker, Database, EventBus) {
        let db = Database::new(":memory:").await.unwrap();
        db.create_project(&Project {
            id: "proj-1".to_string(),
            name: "p".to_string(),
            api_key: Some("k".to_string()),
            billing_customer_id: Some("cus_1".to_string()),
        })
        .await
        .unwrap();

        let mut registry = AdapterRegistry::empty();
        let adapter = Arc::new(adapter);
        let shared = Arc::clone(&adapter);
        registry.register(platform, false, move |_| {
            Ok(Box::new(SharedMock(Arc::clone(&shared))))
        });

        let events = EventBus::new(16);
        let worker = DeliveryWorker::new(
            db.clone(),
            Arc::new(registry),
            reqwest::Client::new(),
            Arc::new(LocalStore::new(std::env::temp_dir())),
            Arc::new(LogMeter),
            events.clone(),
        );
        (worker, db, events)
    }

    /// Wrapper so one mock instance can be shared between the registry
    /// factory and test assertions.
    struct SharedMock(Arc<MockAdapter>);

    #[async_trait::async_trait]
    impl crate::platforms::PlatformAdapter for SharedMock {
        fn platform(&self) -> &'static str {
            self.0.platform()
        }
        async fn refresh_access_token(
            &self,
            account: &SocialAccount,
        ) -> crate::error::Result<crate::types::RefreshedCredentials> {
            self.0.refresh_access_token(account).await
        }
        async fn publish(&self, request: &PublishRequest) -> PostResult {
            self.0.publish(request).await
        }
    }

    fn payload(account: SocialAccount) -> DeliverToPlatformPayload {
        DeliverToPlatformPayload {
            post_id: "post-1".to_string(),
            platform: account.platform.clone(),
            account,
            caption: "Hello".to_string(),
            media: vec![],
            platform_settings: None,
            app_credentials: None,
            billing_customer_id: Some("cus_1".to_string()),
        }
    }

    async fn seed_post(db: &Database, account: &SocialAccount) {
        db.create_account(account).await.unwrap();
        let mut post = Post::new("proj-1".to_string(), "Hello".to_string());
        post.id = "post-1".to_string();
        post.status = PostStatus::Processing;
        db.create_post(&post).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_delivery_persists_result_and_notifies() {
        let mock = MockAdapter::succeeding("mastodon", "provider-1");
        let (worker, db, events) = worker_fixture(mock, "mastodon").await;
        let now = chrono::Utc::now().timestamp();
        let account = account("mastodon", Some(30), now);
        seed_post(&db, &account).await;

        let mut receiver = events.subscribe();
        let result = worker.deliver(payload(account)).await;

        assert!(result.success);
        assert_eq!(result.provider_post_id, Some("provider-1".to_string()));

        let rows = db.list_post_results("post-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].success);

        match receiver.recv().await.unwrap() {
            Event::ResultCreated {
                success, platform, ..
            } => {
                assert!(success);
                assert_eq!(platform, "mastodon");
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expiring_token_triggers_refresh_and_persists_tokens() {
        let mock = MockAdapter::succeeding("mastodon", "provider-1")
            .with_rotated_refresh_token("rotated-refresh");
        let refresh_calls = Arc::clone(&mock.refresh_calls);
        let (worker, db, _) = worker_fixture(mock, "mastodon").await;

        let now = chrono::Utc::now().timestamp();
        let account = account("mastodon", Some(3), now);
        seed_post(&db, &account).await;

        let result = worker.deliver(payload(account)).await;

        assert!(result.success);
        assert_eq!(refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Tokens were persisted before publish
        let stored = db.get_account("acc-1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, Some("refreshed-acc-1".to_string()));
        assert_eq!(stored.refresh_token, Some("rotated-refresh".to_string()));
    }

    #[tokio::test]
    async fn test_valid_token_skips_refresh() {
        let mock = MockAdapter::succeeding("mastodon", "provider-1");
        let refresh_calls = Arc::clone(&mock.refresh_calls);
        let (worker, db, _) = worker_fixture(mock, "mastodon").await;

        let now = chrono::Utc::now().timestamp();
        let account = account("mastodon", Some(30), now);
        seed_post(&db, &account).await;

        let result = worker.deliver(payload(account)).await;

        assert!(result.success);
        assert_eq!(refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_short_circuits_publish() {
        let mock = MockAdapter::succeeding("tiktok", "provider-1").with_failing_refresh();
        let publish_calls = Arc::clone(&mock.publish_calls);
        let (worker, db, _) = worker_fixture(mock, "tiktok").await;

        let now = chrono::Utc::now().timestamp();
        let account = account("tiktok", Some(30), now);
        seed_post(&db, &account).await;

        let result = worker.deliver(payload(account)).await;

        assert!(!result.success);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("Token refresh failed"));

        // No publish attempt with a token known to be invalid
        assert_eq!(publish_calls.lock().unwrap().len(), 0);

        // The failure is still a persisted terminal result
        let rows = db.list_post_results("post-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].success);
    }

    #[tokio::test]
    async fn test_unknown_platform_fails_structurally() {
        let mock = MockAdapter::succeeding("mastodon", "x");
        let (worker, db, _) = worker_fixture(mock, "mastodon").await;

        let now = chrono::Utc::now().timestamp();
        let mut account = account("friendster", Some(30), now);
        account.platform = "friendster".to_string();
        seed_post(&db, &account).await;

        let result = worker.deliver(payload(account)).await;
        assert!(!result.success);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("unknown platform"));
    }
}
