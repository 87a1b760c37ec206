//! Job handler registration
//!
//! Binds each job kind to the pipeline component that executes it. The
//! worker daemon calls this against its `LocalJobClient`; integration tests
//! do the same with in-memory stores and mock adapters.

use std::sync::Arc;

use crate::db::Database;
use crate::events::{EventBus, UsageMeter};
use crate::jobs::{
    CompressVideoOutput, CompressVideoPayload, DeliverToPlatformPayload, JobKind, LocalJobClient,
    LocalizeMediaPayload, NormalizeVideoPayload,
};
use crate::media::{MediaLocalizer, MediaStore, SizeConstrainedCompressor, VideoNormalizer};
use crate::platforms::AdapterRegistry;
use crate::worker::DeliveryWorker;

/// Shared dependencies for the pipeline's job handlers
#[derive(Clone)]
pub struct PipelineDeps {
    pub db: Database,
    pub registry: Arc<AdapterRegistry>,
    pub http: reqwest::Client,
    pub store: Arc<dyn MediaStore>,
    pub meter: Arc<dyn UsageMeter>,
    pub events: EventBus,
}

/// Register handlers for every job kind except `process-post`, which the
/// caller runs through [`DeliveryOrchestrator`](crate::orchestrator::DeliveryOrchestrator)
/// directly.
pub fn register_handlers(client: &mut LocalJobClient, deps: PipelineDeps) {
    let localizer = Arc::new(MediaLocalizer::new(
        deps.http.clone(),
        Arc::clone(&deps.store),
    ));
    client.register(JobKind::LocalizeMedia, move |payload| {
        let localizer = Arc::clone(&localizer);
        async move {
            let payload: LocalizeMediaPayload =
                serde_json::from_value(payload).map_err(|e| e.to_string())?;
            let output = localizer
                .localize(payload)
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(output).map_err(|e| e.to_string())
        }
    });

    let normalizer = Arc::new(VideoNormalizer::new(Arc::clone(&deps.store)));
    client.register(JobKind::NormalizeVideo, move |payload| {
        let normalizer = Arc::clone(&normalizer);
        async move {
            let payload: NormalizeVideoPayload =
                serde_json::from_value(payload).map_err(|e| e.to_string())?;
            normalizer
                .normalize(&payload.url)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::Value::Null)
        }
    });

    let compressor = Arc::new(SizeConstrainedCompressor::new(Arc::clone(&deps.store)));
    client.register(JobKind::CompressVideo, move |payload| {
        let compressor = Arc::clone(&compressor);
        async move {
            let payload: CompressVideoPayload =
                serde_json::from_value(payload).map_err(|e| e.to_string())?;
            let url = compressor
                .compress(&payload.url, payload.max_size_bytes)
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(CompressVideoOutput { url }).map_err(|e| e.to_string())
        }
    });

    let worker = Arc::new(DeliveryWorker::new(
        deps.db.clone(),
        Arc::clone(&deps.registry),
        deps.http.clone(),
        Arc::clone(&deps.store),
        Arc::clone(&deps.meter),
        deps.events.clone(),
    ));
    client.register(JobKind::DeliverToPlatform, move |payload| {
        let worker = Arc::clone(&worker);
        async move {
            let payload: DeliverToPlatformPayload =
                serde_json::from_value(payload).map_err(|e| e.to_string())?;
            let result = worker.deliver(payload).await;
            serde_json::to_value(result).map_err(|e| e.to_string())
        }
    });
}
