//! Resolution Worker
//!
//! Polls the shared `resolution_jobs` table and resolves claimed jobs until
//! interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use entity_resolver::config::{DEFAULT_EMBEDDINGS_MODEL, DEFAULT_POLL_INTERVAL};
use entity_resolver::health::{self, DEFAULT_HEALTH_ADDR};
use entity_resolver::{
    EmbeddingConfig, HttpEmbedder, PgBackend, PollOutcome, ResolutionEngine, ResolutionWorker,
    WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "resolver_worker", about = "Batch entity resolution worker")]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// OpenAI-compatible embeddings endpoint
    #[arg(long, env = "EMBEDDINGS_URL")]
    embeddings_url: Url,

    #[arg(long, env = "EMBEDDINGS_MODEL", default_value = DEFAULT_EMBEDDINGS_MODEL)]
    embeddings_model: String,

    #[arg(long, env = "EMBEDDINGS_API_KEY", hide_env_values = true)]
    embeddings_api_key: Option<String>,

    /// Seconds to sleep when no job is queued
    #[arg(long, env = "RESOLVER_POLL_INTERVAL_SEC", default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval_sec: u64,

    /// Fail running jobs claimed longer ago than this many seconds
    #[arg(long, env = "RESOLVER_STALE_JOB_SECS")]
    stale_job_secs: Option<u64>,

    #[arg(long, env = "RESOLVER_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// Address for the `/healthz` listener
    #[arg(long, env = "RESOLVER_HEALTH_ADDR", default_value = DEFAULT_HEALTH_ADDR)]
    health_addr: SocketAddr,

    /// Apply schema migrations before polling
    #[arg(long)]
    migrate: bool,

    /// Process at most one job and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "entity_resolver=info,resolver_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    let backend = PgBackend::new(pool);

    if args.migrate {
        backend.migrate().await.context("Failed to apply migrations")?;
    }

    let mut embedding_config = EmbeddingConfig::new(args.embeddings_url, args.embeddings_model);
    embedding_config.api_key = args.embeddings_api_key;
    let embedder = HttpEmbedder::new(embedding_config).context("Failed to build embedder")?;
    let engine = ResolutionEngine::new(Arc::new(embedder));

    let poll_interval = Duration::from_secs(args.poll_interval_sec);
    let config = WorkerConfig {
        poll_interval,
        error_backoff: poll_interval,
        stale_job_after: args.stale_job_secs.map(Duration::from_secs),
    };
    let worker = ResolutionWorker::new(backend, engine, config);

    if args.once {
        match worker.poll_once().await? {
            PollOutcome::Idle => tracing::info!("No queued job"),
            PollOutcome::Completed { job_id, tally } => {
                tracing::info!(%job_id, ?tally, "Job completed")
            }
            PollOutcome::Failed { job_id, error } => {
                tracing::warn!(%job_id, %error, "Job failed")
            }
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let listener = tokio::net::TcpListener::bind(args.health_addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", args.health_addr))?;
    let health = tokio::spawn(health::serve(listener, shutdown_rx.clone()));

    worker.run(shutdown_rx).await;
    health
        .await
        .context("Health endpoint task panicked")?
        .context("Health endpoint failed")?;
    Ok(())
}
