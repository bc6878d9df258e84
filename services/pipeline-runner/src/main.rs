//! Pipeline runner server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::{
    routing::{get, post},
    Extension, Router,
};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pipeline::Coordinator;
use storage::{ForecastStore, MemoryStore, PostgresStore};

use pipeline_runner::config::RunnerConfig;
use pipeline_runner::server::{
    health_handler, run_status_handler, trigger_run_handler, RunnerState,
};

/// Pipeline runner
#[derive(Parser, Debug)]
#[command(name = "pipeline-runner")]
#[command(about = "Ingest trigger service for the forecast pipeline")]
struct Args {
    /// Listen address
    #[arg(
        short,
        long,
        default_value = "0.0.0.0:8082",
        env = "PIPELINE_LISTEN_ADDR"
    )]
    listen: String,

    /// Run one source dataset and exit instead of serving HTTP
    #[arg(long)]
    once: bool,

    /// Source dataset directory for --once
    #[arg(long)]
    source: Option<String>,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();

    info!("Starting pipeline runner");

    let config = RunnerConfig::from_env();
    let store: Arc<dyn ForecastStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            store.migrate().await.context("running migrations")?;
            info!("connected to PostgreSQL store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, publishing to an in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let coordinator = Coordinator::new(store, config.profile);

    if args.once {
        let Some(source) = &args.source else {
            bail!("--once requires --source");
        };
        return run_once(&coordinator, source).await;
    }

    let state = Arc::new(RunnerState::new(coordinator));
    let app = Router::new()
        .route("/runs", post(trigger_run_handler).get(run_status_handler))
        .route("/health", get(health_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = args.listen.parse().context("invalid listen address")?;
    info!("Pipeline runner listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// One-shot CLI mode: run a single dataset and exit non-zero on failure.
async fn run_once(coordinator: &Coordinator, source: &str) -> Result<()> {
    match coordinator
        .run(Path::new(source), &AtomicBool::new(false))
        .await
    {
        Ok(result) => {
            info!(
                reference_time = %result.reference_time,
                promoted_count = result.promoted_count,
                timesteps = result.timesteps,
                "run promoted"
            );
            Ok(())
        }
        Err(failure) => bail!("{}", failure),
    }
}
