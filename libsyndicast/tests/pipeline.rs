//! End-to-end pipeline tests
//!
//! Run the orchestrator against real job handlers wired to an in-memory
//! database, a filesystem-backed media store, and mock platform adapters.

use std::sync::Arc;

use libsyndicast::db::Database;
use libsyndicast::events::{Event, EventBus, LogMeter};
use libsyndicast::handlers::{register_handlers, PipelineDeps};
use libsyndicast::jobs::{JobKind, LocalJobClient, LocalizeMediaOutput, LocalizeMediaPayload};
use libsyndicast::media::store::LocalStore;
use libsyndicast::orchestrator::DeliveryOrchestrator;
use libsyndicast::platforms::mock::MockAdapter;
use libsyndicast::platforms::{AdapterRegistry, PlatformAdapter, PublishRequest};
use libsyndicast::types::{
    MediaType, Post, PostMedia, PostResult, PostStatus, Project, RefreshedCredentials,
    SocialAccount,
};

/// Registry factories create a fresh adapter per delivery; this wrapper
/// shares one mock so tests can assert on its counters.
struct SharedMock(Arc<MockAdapter>);

#[async_trait::async_trait]
impl PlatformAdapter for SharedMock {
    fn platform(&self) -> &'static str {
        self.0.platform()
    }

    async fn refresh_access_token(
        &self,
        account: &SocialAccount,
    ) -> libsyndicast::Result<RefreshedCredentials> {
        self.0.refresh_access_token(account).await
    }

    async fn publish(&self, request: &PublishRequest) -> PostResult {
        self.0.publish(request).await
    }
}

struct Fixture {
    db: Database,
    registry: AdapterRegistry,
    events: EventBus,
}

impl Fixture {
    async fn new() -> Self {
        let db = Database::new(":memory:").await.unwrap();
        db.create_project(&Project {
            id: "proj-1".to_string(),
            name: "Test".to_string(),
            api_key: Some("key-123".to_string()),
            billing_customer_id: Some("cus_123".to_string()),
        })
        .await
        .unwrap();

        let mut post = Post::new("proj-1".to_string(), "Hello".to_string());
        post.id = "post-1".to_string();
        post.status = PostStatus::Scheduled;
        db.create_post(&post).await.unwrap();

        Self {
            db,
            registry: AdapterRegistry::empty(),
            events: EventBus::new(64),
        }
    }

    fn add_platform(
        &mut self,
        platform: &'static str,
        requires_app_credentials: bool,
        mock: MockAdapter,
    ) -> Arc<MockAdapter> {
        let mock = Arc::new(mock);
        let shared = Arc::clone(&mock);
        self.registry
            .register(platform, requires_app_credentials, move |_| {
                Ok(Box::new(SharedMock(Arc::clone(&shared))))
            });
        mock
    }

    async fn add_account(&self, id: &str, platform: &str, expires_in_days: Option<i64>) {
        let now = chrono::Utc::now().timestamp();
        self.db
            .create_account(&SocialAccount {
                id: id.to_string(),
                project_id: "proj-1".to_string(),
                platform: platform.to_string(),
                external_id: format!("ext-{}", id),
                handle: None,
                access_token: Some("token".to_string()),
                refresh_token: Some("refresh".to_string()),
                access_token_expires_at: expires_in_days.map(|d| now + d * 86_400),
                refresh_token_expires_at: None,
                connection_kind: None,
            })
            .await
            .unwrap();
        self.db.link_post_account("post-1", id).await.unwrap();
    }

    async fn add_image_media(&self) {
        self.db
            .create_media(&PostMedia {
                id: None,
                post_id: "post-1".to_string(),
                url: "https://cdn.example.com/photo.jpg".to_string(),
                media_type: None,
                thumbnail_url: None,
                thumbnail_timestamp_ms: None,
                platform_scope: None,
                account_scope: None,
                skip_processing: false,
                tags: vec![],
            })
            .await
            .unwrap();
    }

    /// Build the orchestrator with the real handler stack, stubbing only
    /// localization (which would otherwise reach the network).
    fn orchestrator(self) -> (DeliveryOrchestrator, Database, EventBus) {
        let registry = Arc::new(self.registry);
        let mut jobs = LocalJobClient::without_backoff();
        register_handlers(
            &mut jobs,
            PipelineDeps {
                db: self.db.clone(),
                registry: Arc::clone(&registry),
                http: reqwest::Client::new(),
                store: Arc::new(LocalStore::new(std::env::temp_dir())),
                meter: Arc::new(LogMeter),
                events: self.events.clone(),
            },
        );
        jobs.register(JobKind::LocalizeMedia, |payload| async move {
            let input: LocalizeMediaPayload =
                serde_json::from_value(payload).map_err(|e| e.to_string())?;
            serde_json::to_value(LocalizeMediaOutput {
                media_id: input.media_id,
                url: format!("local://localized-{}.jpg", input.media_id),
                thumbnail_url: None,
                media_type: MediaType::Image,
                platform_scope: input.platform_scope,
                account_scope: input.account_scope,
                skip_processing: input.skip_processing,
            })
            .map_err(|e| e.to_string())
        });

        let orchestrator = DeliveryOrchestrator::new(
            self.db.clone(),
            Arc::new(jobs),
            registry,
            self.events.clone(),
        );
        (orchestrator, self.db, self.events)
    }
}

#[tokio::test]
async fn two_accounts_one_expiring_token() {
    // Post "Hello", two accounts: alpha's token expires in 3 days, beta's
    // is valid for 30. One image medium.
    let mut fixture = Fixture::new().await;
    let alpha = fixture.add_platform("alpha", false, MockAdapter::succeeding("alpha", "a-1"));
    let beta = fixture.add_platform("beta", false, MockAdapter::succeeding("beta", "b-1"));
    fixture.add_account("acc-alpha", "alpha", Some(3)).await;
    fixture.add_account("acc-beta", "beta", Some(30)).await;
    fixture.add_image_media().await;

    let (orchestrator, db, _) = fixture.orchestrator();
    let results = orchestrator.process_post("post-1").await.unwrap();

    // Exactly one result per account, both successful
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));

    // alpha refreshed, beta skipped
    assert_eq!(alpha.refresh_count(), 1);
    assert_eq!(beta.refresh_count(), 0);

    // Both adapters published exactly once, with the localized media URL
    assert_eq!(alpha.publish_count(), 1);
    assert_eq!(beta.publish_count(), 1);
    let published = alpha.publish_calls.lock().unwrap();
    assert_eq!(published[0].caption, "Hello");
    assert_eq!(published[0].media.len(), 1);
    assert!(published[0].media[0].url.starts_with("local://localized-"));
    drop(published);

    // alpha's refreshed token was persisted before publishing
    let stored = db.get_account("acc-alpha").await.unwrap().unwrap();
    assert_eq!(stored.access_token, Some("refreshed-acc-alpha".to_string()));

    let post = db.get_post("post-1").await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Processed);
}

#[tokio::test]
async fn partial_failure_still_yields_one_result_per_account() {
    let mut fixture = Fixture::new().await;
    fixture.add_platform("alpha", false, MockAdapter::succeeding("alpha", "a-1"));
    fixture.add_platform("beta", false, MockAdapter::failing("beta", "beta exploded"));
    fixture.add_account("acc-1", "alpha", None).await;
    fixture.add_account("acc-2", "beta", None).await;
    fixture.add_account("acc-3", "alpha", None).await;

    let (orchestrator, db, _) = fixture.orchestrator();
    let results = orchestrator.process_post("post-1").await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r.success).count(), 2);

    let failed = results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.account_id, "acc-2");
    assert_eq!(failed.error_message.as_deref(), Some("beta exploded"));

    // Every result is a persisted row, exactly one per account
    let rows = db.list_post_results("post-1").await.unwrap();
    assert_eq!(rows.len(), 3);
    let mut accounts: Vec<&str> = rows.iter().map(|r| r.account_id.as_str()).collect();
    accounts.sort();
    assert_eq!(accounts, vec!["acc-1", "acc-2", "acc-3"]);
}

#[tokio::test]
async fn missing_app_credentials_only_affects_that_account() {
    let mut fixture = Fixture::new().await;
    fixture.add_platform("alpha", false, MockAdapter::succeeding("alpha", "a-1"));
    // gamma requires app credentials and none are stored
    fixture.add_platform("gamma", true, MockAdapter::succeeding("gamma", "g-1"));
    fixture.add_account("acc-1", "alpha", None).await;
    fixture.add_account("acc-2", "gamma", None).await;

    let (orchestrator, _, _) = fixture.orchestrator();
    let results = orchestrator.process_post("post-1").await.unwrap();

    assert_eq!(results.len(), 2);

    let gamma = results.iter().find(|r| r.platform == "gamma").unwrap();
    assert!(!gamma.success);
    assert_eq!(
        gamma.error_message.as_deref(),
        Some("No App credentials found for provider gamma")
    );

    let alpha = results.iter().find(|r| r.platform == "alpha").unwrap();
    assert!(alpha.success);
}

#[tokio::test]
async fn refresh_failure_short_circuits_that_account_only() {
    let mut fixture = Fixture::new().await;
    let bad = fixture.add_platform(
        "alpha",
        false,
        MockAdapter::succeeding("alpha", "a-1").with_failing_refresh(),
    );
    fixture.add_platform("beta", false, MockAdapter::succeeding("beta", "b-1"));
    // alpha expires tomorrow, forcing the refresh that will fail
    fixture.add_account("acc-1", "alpha", Some(1)).await;
    fixture.add_account("acc-2", "beta", Some(30)).await;

    let (orchestrator, _, _) = fixture.orchestrator();
    let results = orchestrator.process_post("post-1").await.unwrap();

    assert_eq!(results.len(), 2);

    let alpha = results.iter().find(|r| r.platform == "alpha").unwrap();
    assert!(!alpha.success);
    assert!(alpha
        .error_message
        .as_deref()
        .unwrap()
        .contains("Token refresh failed"));
    // The failed refresh never reached publish
    assert_eq!(bad.publish_count(), 0);

    let beta = results.iter().find(|r| r.platform == "beta").unwrap();
    assert!(beta.success);
}

#[tokio::test]
async fn notifications_cover_every_result_plus_post_updated() {
    let mut fixture = Fixture::new().await;
    fixture.add_platform("alpha", false, MockAdapter::succeeding("alpha", "a-1"));
    fixture.add_platform("beta", false, MockAdapter::failing("beta", "down"));
    fixture.add_account("acc-1", "alpha", None).await;
    fixture.add_account("acc-2", "beta", None).await;

    let (orchestrator, _, events) = fixture.orchestrator();
    let mut receiver = events.subscribe();

    let results = orchestrator.process_post("post-1").await.unwrap();
    assert_eq!(results.len(), 2);

    let mut result_created = 0;
    let mut post_updated = 0;
    while let Ok(event) = receiver.try_recv() {
        match event {
            Event::ResultCreated { .. } => result_created += 1,
            Event::PostUpdated { snapshot } => {
                post_updated += 1;
                assert_eq!(snapshot.post.id, "post-1");
                assert_eq!(snapshot.post.status, PostStatus::Processed);
                assert_eq!(snapshot.results.len(), 2);
            }
            _ => {}
        }
    }

    assert_eq!(result_created, 2);
    assert_eq!(post_updated, 1);
}
