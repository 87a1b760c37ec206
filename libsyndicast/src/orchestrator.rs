//! Per-post delivery orchestration
//!
//! `process_post` coordinates the whole run for one post: load the post
//! with its accounts, media, and overrides; localize and normalize media as
//! parallel job batches; resolve the effective caption/media/credentials
//! per account; fan out one delivery job per account; then reconcile.
//!
//! The reconcile/persist/notify tail runs even when an earlier stage blows
//! up: every targeted account ends with exactly one terminal result row and
//! the post never stays stuck in `processing`.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::db::{Database, PostBundle};
use crate::events::{Event, EventBus, PostSnapshot};
use crate::jobs::{
    DeliverToPlatformPayload, JobClient, JobKind, JobRequest, LocalizeMediaOutput,
    LocalizeMediaPayload, NormalizeVideoPayload,
};
use crate::platforms::AdapterRegistry;
use crate::resolve;
use crate::types::{MediaType, PostMedia, PostResult, PostStatus};

/// Error message recorded for accounts whose delivery job never reported.
pub const STATUS_UNAVAILABLE: &str = "Delivery status unavailable, check the social account";

pub struct DeliveryOrchestrator {
    db: Database,
    jobs: Arc<dyn JobClient>,
    registry: Arc<AdapterRegistry>,
    events: EventBus,
}

impl DeliveryOrchestrator {
    pub fn new(
        db: Database,
        jobs: Arc<dyn JobClient>,
        registry: Arc<AdapterRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            jobs,
            registry,
            events,
        }
    }

    /// Run the full delivery pipeline for one post.
    ///
    /// Returns one result per targeted account. The post's status is
    /// `processed` and a `post_updated` notification emitted on every path
    /// out of this function except a post that cannot be loaded at all.
    pub async fn process_post(&self, post_id: &str) -> crate::error::Result<Vec<PostResult>> {
        let bundle = self.db.load_post_bundle(post_id).await?;

        if let Err(e) = self
            .db
            .update_post_status(post_id, PostStatus::Processing)
            .await
        {
            warn!(post = post_id, error = %e, "failed to mark post processing");
        }

        // Any stage failure is caught here so the reconcile tail below
        // always runs
        let collected = match self.run_pipeline(&bundle).await {
            Ok(results) => results,
            Err(e) => {
                error!(post = post_id, error = %e, "delivery pipeline failed mid-run");
                Vec::new()
            }
        };

        Ok(self.finalize(&bundle, collected).await)
    }

    async fn run_pipeline(&self, bundle: &PostBundle) -> crate::error::Result<Vec<PostResult>> {
        let post = &bundle.post;

        // Credential token tied to the post's project gates everything
        if bundle.project.api_key.as_deref().unwrap_or("").is_empty() {
            warn!(post = %post.id, "project API key missing or revoked");
            return Ok(self.fail_all(bundle, "Invalid API key for post"));
        }

        let billing_customer_id = match &bundle.project.billing_customer_id {
            Some(id) => id.clone(),
            None => {
                warn!(post = %post.id, "project has no billing identity");
                return Ok(self.fail_all(bundle, "No billing identity found for project"));
            }
        };

        let had_media = !bundle.media.is_empty();
        let media = self.prepare_media(bundle).await?;
        if had_media && media.is_empty() {
            warn!(post = %post.id, "all media lost during preparation");
            return Ok(self.fail_all(bundle, "Post media could not be processed"));
        }

        // Per-account resolution: caption/media precedence and app
        // credentials, with failures short-circuited before the fan-out
        let mut results = Vec::new();
        let mut deliveries = Vec::new();

        for account in &bundle.accounts {
            let app_credentials = match self.registry.requires_app_credentials(&account.platform) {
                Some(true) => {
                    let available = self
                        .db
                        .list_app_credentials(&bundle.project.id, &account.platform)
                        .await?;
                    match resolve::select_app_credentials(account, &available) {
                        Some(creds) => Some(creds),
                        None => {
                            results.push(PostResult::failure(
                                &post.id,
                                &account.id,
                                &account.platform,
                                format!(
                                    "No App credentials found for provider {}",
                                    account.platform
                                ),
                                None,
                            ));
                            continue;
                        }
                    }
                }
                _ => None,
            };

            let payload = DeliverToPlatformPayload {
                post_id: post.id.clone(),
                platform: account.platform.clone(),
                account: account.clone(),
                caption: resolve::effective_caption(account, &bundle.configs, &post.caption),
                media: resolve::effective_media(account, &media),
                platform_settings: resolve::effective_settings(account, &bundle.configs),
                app_credentials,
                billing_customer_id: Some(billing_customer_id.clone()),
            };
            deliveries.push(JobRequest::new(JobKind::DeliverToPlatform, &payload)?);
        }

        self.events.emit(Event::DeliveryStarted {
            post_id: post.id.clone(),
            account_count: deliveries.len(),
        });

        let outcomes = self.jobs.submit_batch_and_wait(deliveries).await;
        for outcome in outcomes {
            match outcome.output::<PostResult>() {
                Some(result) => results.push(result),
                None => warn!(
                    post = %post.id,
                    error = outcome.error_message().unwrap_or("no output"),
                    "delivery job reported no result"
                ),
            }
        }

        Ok(results)
    }

    /// Localize and normalize the post's media as parallel job batches.
    ///
    /// Items that fail localization or normalization are dropped; the
    /// survivors are returned with their durable URLs and detected types.
    async fn prepare_media(&self, bundle: &PostBundle) -> crate::error::Result<Vec<PostMedia>> {
        if bundle.media.is_empty() {
            return Ok(Vec::new());
        }

        let mut survivors: Vec<PostMedia> = Vec::new();
        let mut dropped = 0_usize;

        if bundle.media.iter().any(|m| m.is_global()) {
            let mut passthrough: Vec<PostMedia> = Vec::new();
            let mut requests = Vec::new();

            for media in &bundle.media {
                if media.skip_processing {
                    passthrough.push(media.clone());
                    continue;
                }
                let payload = LocalizeMediaPayload {
                    media_id: media.id.unwrap_or_default(),
                    url: media.url.clone(),
                    thumbnail_url: media.thumbnail_url.clone(),
                    platform_scope: media.platform_scope.clone(),
                    account_scope: media.account_scope.clone(),
                    skip_processing: media.skip_processing,
                };
                requests.push(JobRequest::new(JobKind::LocalizeMedia, &payload)?);
            }

            let outcomes = self.jobs.submit_batch_and_wait(requests).await;
            for outcome in outcomes {
                match outcome.output::<LocalizeMediaOutput>() {
                    Some(output) => {
                        if let Err(e) = self
                            .db
                            .update_media_localization(
                                output.media_id,
                                &output.url,
                                output.thumbnail_url.as_deref(),
                                output.media_type,
                            )
                            .await
                        {
                            warn!(media = output.media_id, error = %e, "failed to persist localization");
                        }

                        if let Some(original) = bundle
                            .media
                            .iter()
                            .find(|m| m.id.unwrap_or_default() == output.media_id)
                        {
                            let mut updated = original.clone();
                            updated.url = output.url;
                            updated.thumbnail_url =
                                output.thumbnail_url.or(updated.thumbnail_url);
                            updated.media_type = Some(output.media_type);
                            survivors.push(updated);
                        }
                    }
                    None => {
                        dropped += 1;
                        warn!(
                            post = %bundle.post.id,
                            error = outcome.error_message().unwrap_or("no output"),
                            "media item dropped after localization failure"
                        );
                    }
                }
            }

            survivors.extend(passthrough);
        } else {
            survivors = bundle.media.clone();
        }

        // Normalize surviving videos in place; failed items drop out
        let videos: Vec<&PostMedia> = survivors
            .iter()
            .filter(|m| m.media_type == Some(MediaType::Video) && !m.skip_processing)
            .collect();

        if !videos.is_empty() {
            let mut requests = Vec::new();
            for video in &videos {
                let payload = NormalizeVideoPayload {
                    url: video.url.clone(),
                };
                requests.push(JobRequest::new(JobKind::NormalizeVideo, &payload)?);
            }

            let outcomes = self.jobs.submit_batch_and_wait(requests).await;
            let mut failed_urls = Vec::new();
            for outcome in &outcomes {
                if !outcome.is_success() {
                    if let Some(url) = outcome.payload["url"].as_str() {
                        failed_urls.push(url.to_string());
                    }
                    warn!(
                        post = %bundle.post.id,
                        error = outcome.error_message().unwrap_or("unknown"),
                        "media item dropped after normalization failure"
                    );
                }
            }
            dropped += failed_urls.len();
            survivors.retain(|m| !failed_urls.contains(&m.url));
        }

        self.events.emit(Event::MediaPrepared {
            post_id: bundle.post.id.clone(),
            survived: survivors.len(),
            dropped,
        });

        Ok(survivors)
    }

    /// Synthesize a failure for every targeted account.
    fn fail_all(&self, bundle: &PostBundle, message: &str) -> Vec<PostResult> {
        bundle
            .accounts
            .iter()
            .map(|account| {
                PostResult::failure(
                    &bundle.post.id,
                    &account.id,
                    &account.platform,
                    message.to_string(),
                    None,
                )
            })
            .collect()
    }

    /// The always-run tail: reconcile results against targeted accounts,
    /// persist anything not yet recorded, flip the post to processed, and
    /// emit notifications.
    async fn finalize(&self, bundle: &PostBundle, collected: Vec<PostResult>) -> Vec<PostResult> {
        let post_id = &bundle.post.id;

        let persisted = match self.db.list_post_results(post_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(post = %post_id, error = %e, "failed to load persisted results");
                Vec::new()
            }
        };

        let mut final_results = Vec::new();
        for account in &bundle.accounts {
            // Workers persist and announce their own rows; anything else is
            // recorded here
            if let Some(existing) = persisted.iter().find(|r| &r.account_id == &account.id) {
                final_results.push(existing.clone());
                continue;
            }

            let result = collected
                .iter()
                .find(|r| &r.account_id == &account.id)
                .cloned()
                .unwrap_or_else(|| {
                    PostResult::failure(
                        post_id,
                        &account.id,
                        &account.platform,
                        STATUS_UNAVAILABLE.to_string(),
                        None,
                    )
                });

            if let Err(e) = self.db.create_post_result(&result).await {
                warn!(post = %post_id, account = %account.id, error = %e, "failed to persist result");
            }
            self.events.emit(Event::result_created(&result));
            final_results.push(result);
        }

        if let Err(e) = self
            .db
            .update_post_status(post_id, PostStatus::Processed)
            .await
        {
            warn!(post = %post_id, error = %e, "failed to mark post processed");
        }

        let mut post = bundle.post.clone();
        post.status = PostStatus::Processed;
        self.events.emit(Event::PostUpdated {
            snapshot: PostSnapshot {
                post,
                results: final_results.clone(),
            },
        });

        info!(
            post = %post_id,
            accounts = bundle.accounts.len(),
            succeeded = final_results.iter().filter(|r| r.success).count(),
            "post processing complete"
        );

        final_results
    }
}
