//! Event and metering surfaces for the delivery pipeline
//!
//! The pipeline does not deliver webhooks itself; it emits event records on
//! an in-process broadcast bus and leaves transport to subscribers. Usage
//! metering is a separate best-effort counter keyed by billing identity.
//!
//! # Non-Blocking Behavior
//!
//! If no subscribers exist, events are dropped immediately without
//! allocation or blocking. Subscribers can lag without blocking emitters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Post, PostResult};

/// Event receiver type alias
pub type EventReceiver = broadcast::Receiver<Event>;

/// Event bus for distributing pipeline events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    ///
    /// The capacity determines how many events can be buffered per
    /// subscriber before older events are dropped (if the subscriber is
    /// lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Non-blocking; if no subscribers exist the event is dropped.
    pub fn emit(&self, event: Event) {
        // send() returns Err if no receivers exist, which is fine
        let _ = self.sender.send(event);
    }

    /// Number of active subscribers (debugging/metrics only)
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A post together with all its delivery results, as carried by the
/// `post_updated` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSnapshot {
    pub post: Post,
    pub results: Vec<PostResult>,
}

/// Events emitted by the pipeline
///
/// The `result_created` and `post_updated` variants are the external
/// notification contract; the rest are progress events for local
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// One delivery result was recorded
    ResultCreated {
        post_id: String,
        account_id: String,
        platform: String,
        success: bool,
        provider_post_id: Option<String>,
        provider_post_url: Option<String>,
    },

    /// A post reached its terminal status; carries the full reconstruction
    PostUpdated { snapshot: PostSnapshot },

    /// Delivery fan-out started for a post
    DeliveryStarted {
        post_id: String,
        account_count: usize,
    },

    /// Media preparation finished for a post
    MediaPrepared {
        post_id: String,
        survived: usize,
        dropped: usize,
    },
}

impl Event {
    /// Build a `result_created` event from a result row.
    pub fn result_created(result: &PostResult) -> Self {
        Event::ResultCreated {
            post_id: result.post_id.clone(),
            account_id: result.account_id.clone(),
            platform: result.platform.clone(),
            success: result.success,
            provider_post_id: result.provider_post_id.clone(),
            provider_post_url: result.provider_post_url.clone(),
        }
    }
}

/// Usage metering sink
///
/// One event per successful delivery, keyed by billing identity, with no
/// payload beyond the event name. Implementations must be cheap and safe to
/// call from the delivery path; failures are the caller's to log, never to
/// propagate.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn record(&self, event_name: &str, billing_customer_id: &str) -> crate::error::Result<()>;
}

/// Meter that only logs; used when no metering backend is wired
pub struct LogMeter;

#[async_trait]
impl UsageMeter for LogMeter {
    async fn record(
        &self,
        event_name: &str,
        billing_customer_id: &str,
    ) -> crate::error::Result<()> {
        tracing::debug!(event_name, billing_customer_id, "usage meter tick");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> PostResult {
        PostResult::success(
            "post-1",
            "acc-1",
            "mastodon",
            "109".to_string(),
            Some("https://mastodon.social/@me/109".to_string()),
        )
    }

    #[tokio::test]
    async fn test_result_created_round_trip() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.emit(Event::result_created(&sample_result()));

        match receiver.recv().await.unwrap() {
            Event::ResultCreated {
                post_id,
                account_id,
                success,
                provider_post_id,
                ..
            } => {
                assert_eq!(post_id, "post-1");
                assert_eq!(account_id, "acc-1");
                assert!(success);
                assert_eq!(provider_post_id, Some("109".to_string()));
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();

        bus.emit(Event::DeliveryStarted {
            post_id: "post-1".to_string(),
            account_count: 3,
        });

        assert!(matches!(
            r1.recv().await.unwrap(),
            Event::DeliveryStarted { account_count: 3, .. }
        ));
        assert!(matches!(
            r2.recv().await.unwrap(),
            Event::DeliveryStarted { account_count: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let bus = EventBus::new(10);
        bus.emit(Event::MediaPrepared {
            post_id: "post-1".to_string(),
            survived: 2,
            dropped: 1,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_uses_snake_case_tags() {
        let event = Event::result_created(&sample_result());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"result_created""#));

        let snapshot_event = Event::PostUpdated {
            snapshot: PostSnapshot {
                post: crate::types::Post::new("proj-1".to_string(), "Hi".to_string()),
                results: vec![sample_result()],
            },
        };
        let json = serde_json::to_string(&snapshot_event).unwrap();
        assert!(json.contains(r#""type":"post_updated""#));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Event::PostUpdated { .. }));
    }

    #[tokio::test]
    async fn test_log_meter_is_infallible() {
        let meter = LogMeter;
        assert!(meter.record("post_published", "cus_123").await.is_ok());
    }
}
