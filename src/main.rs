//! SitePulse - periodic website health checks.
//!
//! Probes registered sites on a fixed schedule, stages the results, and folds
//! them into the site table from a separately scheduled flush job.

mod config;
mod db;
mod probe;
mod scheduler;
mod web;

use config::{BufferBackend, ServerConfig};
use db::{MemoryBuffer, MetricsBuffer, SiteRepository, Store};
use probe::HttpProber;
use scheduler::{BatchCheckRunner, RunLock, Scheduler, SummaryFlushJob, FLUSH_LOCK_KEY};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("sitepulse=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting SitePulse on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample site if none exist
    if store.all_sites()?.is_empty() {
        tracing::info!("Adding sample site: Example");
        let mut site = db::Site {
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        store.add_site(&mut site)?;
    }

    let buffer: Arc<dyn MetricsBuffer> = match cfg.checks.buffer {
        BufferBackend::Sqlite => store.clone() as Arc<dyn MetricsBuffer>,
        BufferBackend::Memory => Arc::new(MemoryBuffer::new()),
    };

    // The run lock lives in the database so every instance sharing it agrees.
    let lock = RunLock::new(store.clone(), FLUSH_LOCK_KEY, cfg.checks.flush_period());
    let prober = Arc::new(HttpProber::new()?);

    let runner = Arc::new(BatchCheckRunner::new(
        store.clone(),
        buffer.clone(),
        prober,
        cfg.checks.clone(),
    ));
    let flush = Arc::new(SummaryFlushJob::new(store.clone(), buffer.clone(), lock));

    // Start scheduler
    let scheduler = Scheduler::new(runner, flush.clone(), cfg.checks.clone());
    scheduler.start().await;

    // Start web server
    let server = Server::new(cfg, store, buffer, flush);
    let result = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await;

    scheduler.shutdown().await;
    result
}
