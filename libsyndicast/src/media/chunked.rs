//! Resumable chunked upload state machine
//!
//! The uploader sends fixed-size byte ranges with `Content-Range` headers
//! against a previously opened session URL. Progress is explicit state: the
//! next offset always comes from the machine, never re-derived from header
//! parsing scattered around the loop. On an in-progress response the last
//! accepted byte is read from the `Range` response header, falling back to
//! an explicit status query when a proxy strips it. 429/5xx responses and
//! transport errors back off exponentially (capped) a bounded number of
//! times; the loop terminates only on a final 2xx or an unrecoverable 4xx.

use std::path::Path;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::{MediaError, Result};

/// States of one resumable upload
#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    Idle,
    SessionStarted,
    ChunkInFlight { offset: u64 },
    Resuming { offset: u64 },
    Complete,
    Failed { error: String },
}

/// What one chunk round-trip produced, after status classification
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Server acknowledged the final byte (2xx)
    Completed,
    /// Server accepted a prefix; `last_byte` is from the `Range` header
    /// when present
    Accepted { last_byte: Option<u64> },
    /// 429/5xx or transport error; worth retrying after backoff
    Retryable { reason: String },
    /// Unrecoverable 4xx
    Fatal { reason: String },
}

/// Compute the next state from the current offset and a chunk outcome.
///
/// `sent_end` is the last byte index of the chunk that was in flight.
pub fn advance(sent_end: u64, outcome: &ChunkOutcome) -> UploadState {
    match outcome {
        ChunkOutcome::Completed => UploadState::Complete,
        ChunkOutcome::Accepted { last_byte } => match last_byte {
            Some(last) => UploadState::ChunkInFlight { offset: last + 1 },
            // Header stripped: a status query must re-establish the offset
            None => UploadState::Resuming { offset: sent_end + 1 },
        },
        ChunkOutcome::Retryable { .. } => UploadState::Resuming { offset: sent_end + 1 },
        ChunkOutcome::Fatal { reason } => UploadState::Failed {
            error: reason.clone(),
        },
    }
}

/// Parse the last accepted byte from a `Range: bytes=0-12345` header value.
pub fn parse_range_end(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes=")
        .and_then(|r| r.rsplit('-').next())
        .and_then(|end| end.parse().ok())
}

/// Exponential backoff delay for the given retry attempt, capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2_u64.saturating_pow(attempt).min(30);
    Duration::from_secs(secs)
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Driver for resumable chunked uploads
pub struct ChunkedUploader {
    client: Client,
    chunk_size: u64,
    max_retries: u32,
}

impl ChunkedUploader {
    pub fn new(client: Client, chunk_size: u64) -> Self {
        Self {
            client,
            chunk_size,
            max_retries: 5,
        }
    }

    /// Upload `path` to an open session, resuming across interruptions.
    ///
    /// Returns the final response body (when the server sends one) parsed
    /// as JSON.
    ///
    /// # Errors
    ///
    /// `MediaError::Storage` when retries are exhausted or the server
    /// answers with an unrecoverable 4xx.
    pub async fn upload(
        &self,
        session_url: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<Option<serde_json::Value>> {
        let total = tokio::fs::metadata(path).await.map_err(MediaError::Io)?.len();
        if total == 0 {
            return Err(MediaError::Storage("refusing to upload empty file".to_string()).into());
        }
        let mut file = tokio::fs::File::open(path).await.map_err(MediaError::Io)?;

        let mut state = UploadState::ChunkInFlight { offset: 0 };
        let mut retries = 0_u32;

        loop {
            match state {
                UploadState::ChunkInFlight { offset } => {
                    // A server-reported offset can never exceed the file,
                    // but clamp so a misbehaving one cannot underflow us
                    let offset = offset.min(total - 1);
                    let end = (offset + self.chunk_size).min(total) - 1;
                    let (outcome, body) = self
                        .send_chunk(session_url, &mut file, offset, end, total, content_type)
                        .await;

                    debug!(offset, end, total, ?outcome, "chunk round-trip");

                    match &outcome {
                        ChunkOutcome::Completed => return Ok(body),
                        ChunkOutcome::Retryable { reason } => {
                            retries += 1;
                            if retries > self.max_retries {
                                return Err(MediaError::Storage(format!(
                                    "resumable upload exhausted {} retries: {}",
                                    self.max_retries, reason
                                ))
                                .into());
                            }
                            warn!(retries, reason, "chunk upload retrying after backoff");
                            tokio::time::sleep(backoff_delay(retries)).await;
                        }
                        ChunkOutcome::Accepted { last_byte } => {
                            // Only actual progress resets the retry budget;
                            // a server stuck re-acknowledging the same byte
                            // must not loop forever
                            if last_byte.map(|b| b + 1).unwrap_or(end + 1) > offset {
                                retries = 0;
                            } else {
                                retries += 1;
                                if retries > self.max_retries {
                                    return Err(MediaError::Storage(format!(
                                        "resumable upload made no progress after {} retries",
                                        self.max_retries
                                    ))
                                    .into());
                                }
                                tokio::time::sleep(backoff_delay(retries)).await;
                            }
                        }
                        ChunkOutcome::Fatal { .. } => {}
                    }
                    state = advance(end, &outcome);
                }
                UploadState::Resuming { offset: fallback } => {
                    let offset = match self.query_offset(session_url, total).await {
                        Some(last) => last + 1,
                        None => fallback,
                    };
                    state = UploadState::ChunkInFlight {
                        offset: offset.min(total),
                    };
                }
                UploadState::Failed { error } => {
                    return Err(MediaError::Storage(error).into());
                }
                UploadState::Complete => return Ok(None),
                UploadState::Idle | UploadState::SessionStarted => {
                    state = UploadState::ChunkInFlight { offset: 0 };
                }
            }
        }
    }

    async fn send_chunk(
        &self,
        session_url: &str,
        file: &mut tokio::fs::File,
        start: u64,
        end: u64,
        total: u64,
        content_type: &str,
    ) -> (ChunkOutcome, Option<serde_json::Value>) {
        let len = (end - start + 1) as usize;
        let mut buffer = vec![0_u8; len];

        if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
            return (
                ChunkOutcome::Retryable {
                    reason: format!("seek failed: {}", e),
                },
                None,
            );
        }
        if let Err(e) = file.read_exact(&mut buffer).await {
            return (
                ChunkOutcome::Retryable {
                    reason: format!("read failed: {}", e),
                },
                None,
            );
        }

        let response = self
            .client
            .put(session_url)
            .header("Content-Type", content_type)
            .header("Content-Range", format!("bytes {}-{}/{}", start, end, total))
            .body(buffer)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return (
                    ChunkOutcome::Retryable {
                        reason: format!("transport error: {}", e),
                    },
                    None,
                )
            }
        };

        let status = response.status();
        if status.is_success() {
            let body = response.json().await.ok();
            return (ChunkOutcome::Completed, body);
        }

        // 308 Permanent Redirect doubles as "resume incomplete" in this
        // protocol family
        if status == StatusCode::PERMANENT_REDIRECT {
            let last_byte = response
                .headers()
                .get("Range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range_end);
            return (ChunkOutcome::Accepted { last_byte }, None);
        }

        if is_retryable_status(status) {
            return (
                ChunkOutcome::Retryable {
                    reason: format!("HTTP {}", status),
                },
                None,
            );
        }

        let body = response.text().await.unwrap_or_default();
        (
            ChunkOutcome::Fatal {
                reason: format!("HTTP {}: {}", status, body),
            },
            None,
        )
    }

    /// Ask the server how much it has: an empty PUT with `bytes */total`.
    async fn query_offset(&self, session_url: &str, total: u64) -> Option<u64> {
        let response = self
            .client
            .put(session_url)
            .header("Content-Range", format!("bytes */{}", total))
            .send()
            .await
            .ok()?;

        response
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range_end)
    }
}
