//! Syndicast - one post, many platforms
//!
//! This library is the delivery pipeline behind a cross-posting service:
//! a per-post orchestrator that sequences media preparation and per-account
//! publishing, an adaptive media transcoding pipeline, and a platform
//! adapter layer hiding per-platform posting and token-refresh differences
//! behind one trait.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod platforms;
pub mod resolve;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, PostBundle};
pub use error::{Result, SyndicastError};
pub use events::{Event, EventBus};
pub use jobs::{JobClient, JobKind, LocalJobClient};
pub use orchestrator::DeliveryOrchestrator;
pub use platforms::{AdapterRegistry, PlatformAdapter};
pub use types::{Post, PostResult, PostStatus, SocialAccount};
pub use worker::DeliveryWorker;
