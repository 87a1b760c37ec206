//! syndi-worker - delivery pipeline daemon
//!
//! Polls for due posts and runs each through the delivery orchestrator:
//! media localization and normalization, per-account credential refresh,
//! platform publishing, and result reconciliation.

use std::sync::Arc;

use clap::Parser;
use libsyndicast::config::Config;
use libsyndicast::db::Database;
use libsyndicast::events::{EventBus, LogMeter};
use libsyndicast::handlers::{register_handlers, PipelineDeps};
use libsyndicast::jobs::LocalJobClient;
use libsyndicast::media::ResumableHttpStore;
use libsyndicast::orchestrator::DeliveryOrchestrator;
use libsyndicast::platforms::AdapterRegistry;
use libsyndicast::types::PostStatus;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "syndi-worker")]
#[command(version)]
#[command(about = "Delivery pipeline daemon for Syndicast")]
#[command(long_about = "\
syndi-worker - delivery pipeline daemon

DESCRIPTION:
    syndi-worker is a long-running daemon that picks up due posts and
    delivers them to every connected social account: it localizes and
    normalizes media, refreshes credentials close to expiry, publishes
    through the matching platform adapter, and records one result per
    account.

USAGE:
    # Run in foreground (logs to stderr)
    syndi-worker

    # Run with custom poll interval
    syndi-worker --poll-interval 30

    # Enable verbose logging
    syndi-worker --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current post)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml

    [database]
    path = \"~/.local/share/syndicast/syndicast.db\"

    [storage]
    base_url = \"https://storage.example.com/upload\"
    public_url = \"https://media.example.com\"

    [worker]
    poll_interval = 15  # seconds between polls

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check for due posts (default: 15)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Process due posts once and exit (for testing)")]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        libsyndicast::logging::LoggingConfig::new(
            libsyndicast::logging::LogFormat::Text,
            "debug".to_string(),
            true,
        )
        .init();
    } else {
        libsyndicast::logging::init_default();
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };

    let poll_interval = cli.poll_interval.unwrap_or(config.worker.poll_interval);
    info!(poll_interval, "starting syndi-worker");

    let db = Database::new(&config.database.path).await?;
    let http = reqwest::Client::new();
    let store = Arc::new(ResumableHttpStore::new(http.clone(), config.storage.clone()));
    let registry = Arc::new(AdapterRegistry::with_defaults());
    let events = EventBus::new(256);

    let mut jobs = LocalJobClient::new();
    register_handlers(
        &mut jobs,
        PipelineDeps {
            db: db.clone(),
            registry: Arc::clone(&registry),
            http: http.clone(),
            store,
            meter: Arc::new(LogMeter),
            events: events.clone(),
        },
    );

    let orchestrator = DeliveryOrchestrator::new(db.clone(), Arc::new(jobs), registry, events);

    loop {
        process_due_posts(&db, &orchestrator).await;

        if cli.once {
            info!("single pass complete, exiting");
            break;
        }

        tokio::select! {
            _ = sleep(Duration::from_secs(poll_interval)) => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("shutdown signal received, exiting"),
                    Err(e) => warn!("failed to listen for shutdown signal: {}", e),
                }
                break;
            }
        }
    }

    Ok(())
}

/// One poll pass: deliver every post whose scheduled time has arrived.
async fn process_due_posts(db: &Database, orchestrator: &DeliveryOrchestrator) {
    let now = chrono::Utc::now().timestamp();
    let due = match db.list_due_posts(now).await {
        Ok(posts) => posts,
        Err(e) => {
            warn!("failed to poll due posts: {}", e);
            return;
        }
    };

    for post in due {
        // Claim the post before the (long) pipeline run so a second pass
        // never picks it up again
        if let Err(e) = db.update_post_status(&post.id, PostStatus::Processing).await {
            warn!(post = %post.id, "failed to claim post: {}", e);
            continue;
        }

        info!(post = %post.id, "processing due post");
        match orchestrator.process_post(&post.id).await {
            Ok(results) => {
                let succeeded = results.iter().filter(|r| r.success).count();
                info!(
                    post = %post.id,
                    succeeded,
                    failed = results.len() - succeeded,
                    "post delivered"
                );
            }
            Err(e) => error!(post = %post.id, "post processing failed: {}", e),
        }
    }
}
