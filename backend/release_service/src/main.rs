//! Milestone escrow release service: entry point.
//!
//! Opens the SQLite-backed audit log, rebuilds the escrow protocol from it,
//! starts the background scheduler that resumes payouts and expires review
//! leases, and serves the REST API until Ctrl-C.

mod api;
mod artifacts;
mod config;
mod db;
mod errors;
mod events;
mod payout;
mod scheduler;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use escrow_protocol::{Collaborators, EscrowProtocol};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use artifacts::DiskArtifactStore;
use config::Config;
use db::SqliteEventStore;
use payout::HttpPayoutProvider;
use scheduler::SchedulerState;
use webhook::WebhookNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // The protocol enforces its own per-attempt timeout; this one only
    // bounds calls that would otherwise hang forever.
    let client = Client::builder()
        .timeout(config.protocol.payout_timeout() + Duration::from_secs(5))
        .build()?;

    // ─── Escrow protocol ──────────────────────────────────
    let artifact_store = DiskArtifactStore::open(&config.artifact_dir, &config.artifact_base_url).await?;
    let mut collab = Collaborators::new(Arc::new(HttpPayoutProvider::new(
        client.clone(),
        config.payout_url.clone(),
    )))
    .with_artifacts(Arc::new(artifact_store));
    match &config.notify_webhook_url {
        Some(url) => {
            collab = collab.with_notifier(Arc::new(WebhookNotifier::new(client.clone(), url.clone())));
        }
        None => warn!("NOTIFY_WEBHOOK_URL not set; notifications are dropped"),
    }

    let store = Arc::new(SqliteEventStore::new(pool.clone()));
    let protocol = Arc::new(EscrowProtocol::open(config.protocol.clone(), store, collab).await?);

    // ─── Background scheduler ─────────────────────────────
    let shutdown = CancellationToken::new();
    let scheduler_state = Arc::new(SchedulerState {
        protocol: protocol.clone(),
        interval: Duration::from_secs(config.scheduler_interval_secs.max(1)),
        shutdown: shutdown.clone(),
    });
    let scheduler_task = tokio::spawn(scheduler::run(scheduler_state));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { protocol, pool });
    let app = api::router(api_state)
        .nest_service("/files", ServeDir::new(&config.artifact_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler_task.await?;
    Ok(())
}
