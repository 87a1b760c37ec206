//! Job contracts and the task-runtime client abstraction
//!
//! All pipeline work units run as asynchronous jobs against an external
//! durable task runtime. This module defines the payload/output contract for
//! each job kind and a `JobClient` trait so the orchestrator never talks to
//! the runtime directly. `LocalJobClient` is an in-process implementation
//! used by the worker daemon and by tests; it honors the same per-kind
//! attempt counts and maximum durations the runtime would enforce.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{JobError, Result};
use crate::types::{AppCredentials, MediaType, PostMedia, PostResult, SocialAccount};

/// The job kinds this pipeline submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    LocalizeMedia,
    NormalizeVideo,
    CompressVideo,
    DeliverToPlatform,
    ProcessPost,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::LocalizeMedia => "localize-media",
            JobKind::NormalizeVideo => "normalize-video",
            JobKind::CompressVideo => "compress-video",
            JobKind::DeliverToPlatform => "deliver-to-platform",
            JobKind::ProcessPost => "process-post",
        }
    }

    /// Runtime-level attempt budget for this kind.
    ///
    /// Localization talks to arbitrary third-party hosts and retries the
    /// most; delivery is one-shot so a flaky platform never double-posts.
    pub fn max_attempts(&self) -> u32 {
        match self {
            JobKind::LocalizeMedia => 3,
            JobKind::NormalizeVideo => 2,
            JobKind::CompressVideo => 2,
            JobKind::DeliverToPlatform => 1,
            JobKind::ProcessPost => 1,
        }
    }

    /// Maximum wall-clock duration before the runtime treats the job as
    /// failed.
    pub fn max_duration(&self) -> Duration {
        match self {
            JobKind::LocalizeMedia => Duration::from_secs(900),
            JobKind::NormalizeVideo => Duration::from_secs(1800),
            JobKind::CompressVideo => Duration::from_secs(1800),
            JobKind::DeliverToPlatform => Duration::from_secs(600),
            JobKind::ProcessPost => Duration::from_secs(3600),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ----------------------------------------------------------------------
// Payload / output contracts
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizeMediaPayload {
    pub media_id: i64,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub platform_scope: Option<String>,
    pub account_scope: Option<String>,
    #[serde(default)]
    pub skip_processing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizeMediaOutput {
    pub media_id: i64,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub media_type: MediaType,
    pub platform_scope: Option<String>,
    pub account_scope: Option<String>,
    #[serde(default)]
    pub skip_processing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeVideoPayload {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressVideoPayload {
    pub url: String,
    pub max_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressVideoOutput {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverToPlatformPayload {
    pub post_id: String,
    pub platform: String,
    pub account: SocialAccount,
    pub caption: String,
    pub media: Vec<PostMedia>,
    pub platform_settings: Option<serde_json::Value>,
    pub app_credentials: Option<AppCredentials>,
    pub billing_customer_id: Option<String>,
}

/// Output of `deliver-to-platform` is the result row itself.
pub type DeliverToPlatformOutput = PostResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPostPayload {
    pub post_id: String,
}

// ----------------------------------------------------------------------
// Client abstraction
// ----------------------------------------------------------------------

/// A job submission: kind plus a JSON payload matching the kind's contract
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub payload: serde_json::Value,
}

impl JobRequest {
    pub fn new<T: Serialize>(kind: JobKind, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| JobError::Payload(format!("{}: {}", kind, e)))?;
        Ok(Self { kind, payload })
    }
}

/// Terminal outcome of one job: its output value or an error message
///
/// Outcomes never carry panics or runtime internals; a failed job is data,
/// not an exception, so a batch join can collect partial failures.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub result: std::result::Result<serde_json::Value, String>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.result.as_ref().err().map(|s| s.as_str())
    }

    /// Decode the output value into the kind's typed output contract.
    pub fn output<T: DeserializeOwned>(&self) -> Option<T> {
        self.result
            .as_ref()
            .ok()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Client for the external durable task runtime
///
/// `submit_batch_and_wait` is a true join: every submitted job reaches a
/// terminal state before the call returns, and one failing job never
/// cancels its siblings.
#[async_trait]
pub trait JobClient: Send + Sync {
    async fn submit(&self, request: JobRequest) -> JobOutcome;

    async fn submit_batch_and_wait(&self, requests: Vec<JobRequest>) -> Vec<JobOutcome> {
        join_all(requests.into_iter().map(|r| self.submit(r))).await
    }
}

type Handler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<serde_json::Value, String>>
        + Send
        + Sync,
>;

/// In-process job client
///
/// Dispatches each submission to a registered handler, applying the kind's
/// attempt budget with exponential backoff and its maximum duration. The
/// worker daemon registers the real pipeline handlers; tests register
/// closures.
#[derive(Clone)]
pub struct LocalJobClient {
    handlers: HashMap<JobKind, Handler>,
    backoff_base: Option<Duration>,
}

impl LocalJobClient {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            backoff_base: Some(Duration::from_millis(500)),
        }
    }

    /// A client that retries without sleeping, for tests.
    pub fn without_backoff() -> Self {
        Self {
            handlers: HashMap::new(),
            backoff_base: None,
        }
    }

    /// Register the handler for a job kind, replacing any existing one.
    pub fn register<F, Fut>(&mut self, kind: JobKind, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<serde_json::Value, String>>
            + Send
            + 'static,
    {
        let handler = Arc::new(move |payload: serde_json::Value| -> BoxFuture<'static, _> {
            Box::pin(handler(payload))
        });
        self.handlers.insert(kind, handler);
    }
}

#[async_trait]
impl JobClient for LocalJobClient {
    async fn submit(&self, request: JobRequest) -> JobOutcome {
        let kind = request.kind;
        let handler = match self.handlers.get(&kind) {
            Some(h) => Arc::clone(h),
            None => {
                return JobOutcome {
                    kind,
                    payload: request.payload,
                    result: Err(JobError::NoHandler(kind.name().to_string()).to_string()),
                }
            }
        };

        let max_attempts = kind.max_attempts();
        let max_duration = kind.max_duration();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let run = handler(request.payload.clone());
            let result = match tokio::time::timeout(max_duration, run).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout(max_duration.as_secs()).to_string()),
            };

            match result {
                Ok(output) => {
                    return JobOutcome {
                        kind,
                        payload: request.payload,
                        result: Ok(output),
                    }
                }
                Err(message) => {
                    last_error = message;
                    if attempt < max_attempts {
                        warn!(
                            job = kind.name(),
                            attempt,
                            max_attempts,
                            error = %last_error,
                            "job attempt failed, retrying"
                        );
                        if let Some(base) = self.backoff_base {
                            tokio::time::sleep(base * 2_u32.pow(attempt - 1)).await;
                        }
                    }
                }
            }
        }

        JobOutcome {
            kind,
            payload: request.payload,
            result: Err(JobError::Exhausted {
                kind: kind.name().to_string(),
                attempts: max_attempts,
                message: last_error,
            }
            .to_string()),
        }
    }
}
